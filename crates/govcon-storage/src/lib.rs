//! Persistence, locking, and HTTP plumbing shared by the pipeline services.

pub mod http;
pub mod lock;
pub mod pg;
pub mod store;

use sha2::{Digest, Sha256};

pub use http::{
    classify_error, classify_message, classify_reqwest_error, classify_status, redacted, BackoffPolicy,
    FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RateLimit, RetryDisposition, TokenBucket,
};
pub use lock::{with_lock, DistributedMutex, LockGuard, LockKey, MemoryMutex, PgAdvisoryMutex};
pub use pg::PgStore;
pub use store::{BackfillFilter, DescriptionStore, MemoryStore, OpportunityStore};

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
