use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3303")]
    pub port: u16,

    #[envconfig(default = "jobwatch")]
    pub worker_name: String,

    /// Listing page the extractor scrapes every cycle.
    #[envconfig(from = "BOARD_URL")]
    pub board_url: NonEmptyString,

    #[envconfig(from = "REDIS_URL", default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(from = "CYCLE_INTERVAL", default = "60000")]
    pub cycle_interval: EnvMsDuration,

    #[envconfig(from = "FETCH_TIMEOUT", default = "60000")]
    pub fetch_timeout: EnvMsDuration,

    #[envconfig(from = "SETUP_TIMEOUT", default = "30000")]
    pub setup_timeout: EnvMsDuration,

    /// Log postings instead of announcing them, for local development.
    #[envconfig(from = "PRINT_SINK", default = "false")]
    pub print_sink: bool,

    #[envconfig(nested = true)]
    pub telegram: TelegramConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone)]
pub struct TelegramConfig {
    #[envconfig(from = "TELEGRAM_API_BASE", default = "https://api.telegram.org")]
    pub api_base: String,

    #[envconfig(from = "TELEGRAM_BOT_TOKEN")]
    pub bot_token: NonEmptyString,

    #[envconfig(from = "TELEGRAM_CHANNEL_ID")]
    pub channel_id: NonEmptyString,

    /// Minimum spacing between outbound messages.
    #[envconfig(from = "TELEGRAM_SEND_INTERVAL", default = "1000")]
    pub send_interval: EnvMsDuration,

    #[envconfig(from = "TELEGRAM_MAX_ATTEMPTS", default = "3")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
