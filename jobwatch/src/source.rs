use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::posting::Posting;

const USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("invalid board url: {0}")]
    Url(#[from] url::ParseError),
    #[error("failed to fetch the board: {0}")]
    Request(#[from] reqwest::Error),
    #[error("board responded with status {0}")]
    Status(reqwest::StatusCode),
}

/// Where postings come from. One call per cycle, returning every posting
/// currently visible, announced or not. Filtering is the caller's job.
#[async_trait]
pub trait PostingSource: Send + Sync {
    async fn fetch_postings(&self) -> Result<Vec<Posting>, SourceError>;
}

/// Selectors for the board's card markup, compiled once up front.
struct BoardSelectors {
    card: Selector,
    title: Selector,
    work_status: Selector,
    skill: Selector,
    company: Selector,
    location: Selector,
}

impl BoardSelectors {
    fn new() -> BoardSelectors {
        BoardSelectors {
            card: Selector::parse("div.card-grid-2").expect("card selector"),
            title: Selector::parse("h6.job-title a").expect("title selector"),
            work_status: Selector::parse("strong.s-card-location").expect("work status selector"),
            skill: Selector::parse("div.mt-20 a.btn-grey-small").expect("skill selector"),
            company: Selector::parse("div.info-right-img a").expect("company selector"),
            location: Selector::parse("span.card-location").expect("location selector"),
        }
    }
}

/// Scrapes the job board's listing page over HTTP.
pub struct BoardSource {
    client: reqwest::Client,
    url: Url,
    selectors: BoardSelectors,
}

impl BoardSource {
    pub fn new(url: &str, fetch_timeout: Duration) -> Result<BoardSource, SourceError> {
        let url = Url::parse(url)?;
        let client = reqwest::Client::builder()
            .timeout(fetch_timeout)
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;

        Ok(BoardSource {
            client,
            url,
            selectors: BoardSelectors::new(),
        })
    }

    /// Walks the listing cards and pulls one posting out of each.
    ///
    /// Cards without an apply link are dropped: a posting with no link has
    /// no identity to dedup on and nothing to announce. Sync on purpose,
    /// the parsed document is not `Send` and must not live across an await.
    fn parse_postings(&self, html: &str) -> Vec<Posting> {
        let document = Html::parse_document(html);
        let mut postings = Vec::new();

        for card in document.select(&self.selectors.card) {
            let title_el = match card.select(&self.selectors.title).next() {
                Some(el) => el,
                None => continue,
            };
            let link = match title_el.value().attr("href") {
                Some(href) if !href.trim().is_empty() => href.trim().to_string(),
                _ => continue,
            };

            let title = collect_text(&title_el);

            let mut work_status = card
                .select(&self.selectors.work_status)
                .next()
                .map(|el| collect_text(&el))
                .unwrap_or_default();
            if work_status.is_empty() {
                // the board leaves the label off fully remote rows
                work_status = "Remote".to_string();
            }

            let skills: Vec<String> = card
                .select(&self.selectors.skill)
                .map(|el| collect_text(&el))
                .filter(|skill| skill != "...")
                .collect();

            let company = card
                .select(&self.selectors.company)
                .next()
                .map(|el| collect_text(&el))
                .unwrap_or_default();

            let location = card
                .select(&self.selectors.location)
                .next()
                .map(|el| collect_text(&el))
                .unwrap_or_default();

            debug!(title = %title, company = %company, "extracted posting");
            postings.push(Posting {
                title,
                company,
                work_status,
                location,
                skills,
                link,
            });
        }

        postings
    }
}

fn collect_text(element: &ElementRef) -> String {
    element.text().collect::<String>().trim().to_string()
}

#[async_trait]
impl PostingSource for BoardSource {
    async fn fetch_postings(&self) -> Result<Vec<Posting>, SourceError> {
        debug!(url = %self.url, "fetching the board");

        let response = self.client.get(self.url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(url = %self.url, status = %status, "board returned an error status");
            return Err(SourceError::Status(status));
        }

        let body = response.text().await?;
        let postings = self.parse_postings(&body);

        counter!("postings_fetched_total").increment(postings.len() as u64);
        info!(count = postings.len(), "fetched postings from the board");

        Ok(postings)
    }
}

/// Scripted source for tests: hands out queued batches one per call, then
/// empty batches once the queue runs dry.
#[derive(Clone, Default)]
pub struct MemorySource {
    batches: Arc<Mutex<VecDeque<Result<Vec<Posting>, SourceError>>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_batches(&self) -> MutexGuard<'_, VecDeque<Result<Vec<Posting>, SourceError>>> {
        match self.batches.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn push_batch(&self, postings: Vec<Posting>) -> Self {
        self.lock_batches().push_back(Ok(postings));
        self.clone()
    }

    pub fn push_error(&self, err: SourceError) -> Self {
        self.lock_batches().push_back(Err(err));
        self.clone()
    }
}

#[async_trait]
impl PostingSource for MemorySource {
    async fn fetch_postings(&self) -> Result<Vec<Posting>, SourceError> {
        self.lock_batches()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}
