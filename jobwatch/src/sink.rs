use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;

use crate::error::DeliveryError;
use crate::posting::Posting;

/// Where new postings get announced. A sink owns its own pacing and retry
/// behavior, callers just hand postings over one at a time.
#[async_trait]
pub trait PostingSink: Send + Sync {
    async fn send(&self, posting: &Posting) -> Result<(), DeliveryError>;
}

/// Sink for local development, logs postings instead of announcing them.
pub struct PrintSink {}

#[async_trait]
impl PostingSink for PrintSink {
    async fn send(&self, posting: &Posting) -> Result<(), DeliveryError> {
        tracing::info!("new posting: {:?}", posting);
        counter!("postings_delivered_total").increment(1);

        Ok(())
    }
}

/// Test sink that records every posting it is handed, with optional
/// scripted rejections and delays.
#[derive(Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<Posting>>>,
    fail_next: Arc<Mutex<u32>>,
    send_delay: Arc<Mutex<Option<Duration>>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_sent(&self) -> MutexGuard<'_, Vec<Posting>> {
        match self.sent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn sent(&self) -> Vec<Posting> {
        self.lock_sent().clone()
    }

    /// Reject the next `count` sends before succeeding again.
    pub fn fail_next(&self, count: u32) -> Self {
        match self.fail_next.lock() {
            Ok(mut guard) => *guard = count,
            Err(poisoned) => *poisoned.into_inner() = count,
        }
        self.clone()
    }

    /// Make every send take `delay` before it lands.
    pub fn delay_sends(&self, delay: Duration) -> Self {
        match self.send_delay.lock() {
            Ok(mut guard) => *guard = Some(delay),
            Err(poisoned) => *poisoned.into_inner() = Some(delay),
        }
        self.clone()
    }
}

#[async_trait]
impl PostingSink for RecordingSink {
    async fn send(&self, posting: &Posting) -> Result<(), DeliveryError> {
        let delay = match self.send_delay.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        {
            let mut fail_next = match self.fail_next.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if *fail_next > 0 {
                *fail_next -= 1;
                return Err(DeliveryError::Api {
                    code: 400,
                    description: "scripted rejection".to_string(),
                });
            }
        }

        self.lock_sent().push(posting.clone());
        Ok(())
    }
}
