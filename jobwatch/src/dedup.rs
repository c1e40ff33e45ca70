use std::sync::Arc;

use metrics::counter;

use crate::redis::{Client, StoreError};

/// HyperLogLog key all posting fingerprints go under.
pub const FINGERPRINT_NAMESPACE: &str = "jobwatch:postings";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// First sighting, the fingerprint is now recorded.
    New,
    /// The fingerprint was recorded by an earlier check.
    Duplicate,
}

/// Decides whether a posting has been announced before.
///
/// Fingerprints live in a redis HyperLogLog, so sightings survive restarts
/// and memory stays flat no matter how long the loop runs. The trade-off is
/// a small false-positive rate: a never-seen posting can be mistaken for a
/// duplicate and silently dropped, while a recorded one is never reported
/// as new. Checking and recording happen in one atomic store call.
#[derive(Clone)]
pub struct Deduplicator {
    client: Arc<dyn Client + Send + Sync>,
    namespace: String,
}

impl Deduplicator {
    pub fn new(client: Arc<dyn Client + Send + Sync>, namespace: &str) -> Deduplicator {
        Deduplicator {
            client,
            namespace: namespace.to_string(),
        }
    }

    /// Checks `fingerprint` against the namespace and records it in the
    /// same store call. On error nothing is recorded and the caller must
    /// not announce the posting, or a store hiccup would turn into a
    /// duplicate announcement on the next cycle.
    pub async fn check_and_mark(&self, fingerprint: &str) -> Result<DedupOutcome, StoreError> {
        let seen = match self
            .client
            .check_and_add(self.namespace.clone(), fingerprint.to_string())
            .await
        {
            Ok(seen) => seen,
            Err(err) => {
                counter!("dedup_checks_total", "outcome" => "error").increment(1);
                return Err(err);
            }
        };

        let outcome = if seen {
            DedupOutcome::Duplicate
        } else {
            DedupOutcome::New
        };
        let label = match outcome {
            DedupOutcome::New => "new",
            DedupOutcome::Duplicate => "duplicate",
        };
        counter!("dedup_checks_total", "outcome" => label).increment(1);

        Ok(outcome)
    }
}
