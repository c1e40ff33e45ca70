use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::time::timeout;

const REDIS_TIMEOUT_MILLISECS: u64 = 1000;

/// Reports whether a member was already present in the HyperLogLog at
/// `key`, inserting it in the same script so the check and the insert
/// cannot interleave with another writer. PFADD's own return value only
/// reflects register changes, which can stay flat for a genuinely new
/// member, so the script compares the estimated cardinality around the
/// insert instead.
const CHECK_AND_ADD_SCRIPT: &str = r#"
local key = KEYS[1]
local data = ARGV[1]
local count_before = redis.call("PFCOUNT", key)
redis.call("PFADD", key, data)
local count_after = redis.call("PFCOUNT", key)
if count_before == count_after then
  return 1
end
return 0
"#;

#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("timed out waiting for redis")]
    Timeout,
    #[error(transparent)]
    Redis(#[from] Arc<redis::RedisError>),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Timeout
        } else {
            StoreError::Redis(Arc::new(err))
        }
    }
}

impl StoreError {
    /// Build a redis-flavored error without a live connection, for tests.
    pub fn from_redis_kind(kind: redis::ErrorKind, description: &'static str) -> Self {
        StoreError::Redis(Arc::new(redis::RedisError::from((kind, description))))
    }
}

/// The slice of redis the ingestion loop needs: liveness probing and the
/// atomic membership check over a HyperLogLog.
#[async_trait]
pub trait Client {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Records `member` under `key` and reports whether it was already
    /// there. `Ok(true)` means seen before, `Ok(false)` means newly added.
    async fn check_and_add(&self, key: String, member: String) -> Result<bool, StoreError>;
}

pub struct RedisClient {
    client: redis::Client,
    check_and_add: redis::Script,
}

impl RedisClient {
    pub fn new(addr: String) -> Result<RedisClient, StoreError> {
        let client = redis::Client::open(addr)?;

        Ok(RedisClient {
            client,
            check_and_add: redis::Script::new(CHECK_AND_ADD_SCRIPT),
        })
    }
}

#[async_trait]
impl Client for RedisClient {
    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.client.get_async_connection().await?;

        let cmd = redis::cmd("PING");
        let results = cmd.query_async::<_, String>(&mut conn);
        timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results)
            .await
            .map_err(|_| StoreError::Timeout)??;

        Ok(())
    }

    async fn check_and_add(&self, key: String, member: String) -> Result<bool, StoreError> {
        let mut conn = self.client.get_async_connection().await?;

        let mut invocation = self.check_and_add.prepare_invoke();
        invocation.key(key).arg(member);

        let results = invocation.invoke_async::<_, i64>(&mut conn);
        let seen = timeout(Duration::from_millis(REDIS_TIMEOUT_MILLISECS), results)
            .await
            .map_err(|_| StoreError::Timeout)??;

        Ok(seen == 1)
    }
}

/// In-memory stand-in for [`RedisClient`]. Unlike the real HyperLogLog it
/// tracks exact membership, which is what tests want anyway.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    members: Arc<Mutex<HashMap<String, HashSet<String>>>>,
    errors: Arc<Mutex<VecDeque<StoreError>>>,
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_members(&self) -> MutexGuard<'_, HashMap<String, HashSet<String>>> {
        match self.members.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_errors(&self) -> MutexGuard<'_, VecDeque<StoreError>> {
        match self.errors.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Queue an error to be returned by the next store call, ahead of any
    /// queued later. Calls after the queue drains succeed again.
    pub fn err_ret(&self, err: StoreError) -> Self {
        self.lock_errors().push_back(err);
        self.clone()
    }

    pub fn contains(&self, key: &str, member: &str) -> bool {
        self.lock_members()
            .get(key)
            .is_some_and(|members| members.contains(member))
    }
}

#[async_trait]
impl Client for MockRedisClient {
    async fn ping(&self) -> Result<(), StoreError> {
        match self.lock_errors().pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn check_and_add(&self, key: String, member: String) -> Result<bool, StoreError> {
        if let Some(err) = self.lock_errors().pop_front() {
            return Err(err);
        }

        let mut members = self.lock_members();
        let seen = !members.entry(key).or_default().insert(member);
        Ok(seen)
    }
}
