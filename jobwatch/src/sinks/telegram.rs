use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use governor::{clock, state, Quota, RateLimiter};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::TelegramConfig;
use crate::error::DeliveryError;
use crate::posting::Posting;
use crate::sink::PostingSink;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Extra wait on top of the server's retry-after hint, so the retry does
/// not land exactly on the boundary of the throttle window.
const RETRY_AFTER_MARGIN: Duration = Duration::from_secs(1);

/// Every character the Bot API requires escaping in MarkdownV2 text.
const MARKDOWN_V2_SPECIAL: [char; 18] = [
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
    parse_mode: &'a str,
    disable_web_page_preview: bool,
}

#[derive(Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<ResponseParameters>,
}

#[derive(Deserialize)]
struct ResponseParameters {
    #[serde(default)]
    retry_after: Option<u64>,
}

/// Announces postings to a Telegram channel through the Bot API.
///
/// Outbound messages are paced by a token bucket so the bot stays under
/// the channel's message-per-second allowance, and a throttled send is
/// retried after the wait the server asked for. Each retry goes through
/// the token bucket again. Anything other than a throttle is final on
/// the first answer.
pub struct TelegramSink {
    client: reqwest::Client,
    send_message_url: String,
    channel_id: String,
    limiter: RateLimiter<state::NotKeyed, state::InMemoryState, clock::DefaultClock>,
    max_attempts: u32,
}

impl TelegramSink {
    pub fn new(config: TelegramConfig) -> anyhow::Result<TelegramSink> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        let quota = Quota::with_period(config.send_interval.0)
            .ok_or_else(|| anyhow!("send interval must be non-zero"))?;

        Ok(TelegramSink {
            client,
            send_message_url: format!(
                "{}/bot{}/sendMessage",
                config.api_base.trim_end_matches('/'),
                config.bot_token.as_str()
            ),
            channel_id: config.channel_id.as_str().to_owned(),
            limiter: RateLimiter::direct(quota),
            max_attempts: config.max_attempts,
        })
    }

    /// One request to the Bot API, classified by how the caller should
    /// react: `Throttled` only when the answer carries a usable wait.
    async fn attempt_send(&self, text: &str) -> Result<(), DeliveryError> {
        let payload = SendMessage {
            chat_id: &self.channel_id,
            text,
            parse_mode: "MarkdownV2",
            disable_web_page_preview: true,
        };

        let response = self
            .client
            .post(&self.send_message_url)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body: ApiResponse = response.json().await?;

        if body.ok {
            return Ok(());
        }

        let description = body
            .description
            .unwrap_or_else(|| format!("unexpected status {status}"));
        let retry_after = body
            .parameters
            .and_then(|parameters| parameters.retry_after)
            .map(Duration::from_secs)
            .or_else(|| parse_retry_after(&description));

        if let Some(retry_after) = retry_after {
            return Err(DeliveryError::Throttled { retry_after });
        }

        Err(DeliveryError::Api {
            code: body.error_code.unwrap_or_else(|| i64::from(status.as_u16())),
            description,
        })
    }
}

#[async_trait]
impl PostingSink for TelegramSink {
    async fn send(&self, posting: &Posting) -> Result<(), DeliveryError> {
        let text = format_message(posting);

        for attempt in 1..=self.max_attempts {
            self.limiter.until_ready().await;

            match self.attempt_send(&text).await {
                Ok(()) => {
                    counter!("postings_delivered_total").increment(1);
                    debug!(link = %posting.link, attempt, "announced posting to the channel");
                    return Ok(());
                }
                Err(DeliveryError::Throttled { retry_after }) => {
                    if attempt == self.max_attempts {
                        break;
                    }
                    let wait = retry_after + RETRY_AFTER_MARGIN;
                    warn!(
                        link = %posting.link,
                        attempt,
                        wait_secs = wait.as_secs(),
                        "channel throttled the message, backing off"
                    );
                    counter!("deliveries_throttled_total").increment(1);
                    tokio::time::sleep(wait).await;
                }
                Err(err) => {
                    counter!("deliveries_failed_total").increment(1);
                    return Err(err);
                }
            }
        }

        counter!("deliveries_failed_total").increment(1);
        Err(DeliveryError::AttemptsExhausted {
            attempts: self.max_attempts,
        })
    }
}

/// Lays out the announcement in MarkdownV2. Field values get escaped, the
/// apply link goes into the inline link target raw.
fn format_message(posting: &Posting) -> String {
    format!(
        "*New Job Posting*\n\n\
         *Title*: {}\n\
         *Company*: {}\n\
         *Work Status*: {}\n\
         *Location*: {}\n\
         *Skills*: {}\n\
         *Apply*: [Link]({})",
        escape_markdown_v2(&posting.title),
        escape_markdown_v2(&posting.company),
        escape_markdown_v2(&posting.work_status),
        escape_markdown_v2(&posting.location),
        escape_markdown_v2(&posting.skills.join(", ")),
        posting.link,
    )
}

fn escape_markdown_v2(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if MARKDOWN_V2_SPECIAL.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Pulls the wait out of a "Too Many Requests: retry after N" description,
/// for answers that omit the structured `parameters.retry_after` field.
fn parse_retry_after(description: &str) -> Option<Duration> {
    let (_, rest) = description.split_once("retry after ")?;
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }

    digits.parse::<u64>().ok().map(Duration::from_secs)
}
