pub mod config;
pub mod dedup;
pub mod error;
pub mod health;
pub mod posting;
pub mod redis;
pub mod sink;
pub mod sinks;
pub mod source;
pub mod status;
pub mod worker;
