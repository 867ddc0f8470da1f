mod cache;
mod check;
mod context;
mod expand;
mod lookup;
pub mod plan;

pub use cache::{CacheKey, CheckCache, CheckCacheConfig};
pub use check::{CheckEngine, CheckRequest, CheckResult};
pub use expand::{ExpandEngine, ExpandRequest, ExpandTree};
pub use lookup::{LookupEngine, LookupItem, LookupRequest, LookupStream, LookupSubjectsRequest};
pub use plan::{EntryLeaf, PermissionPlan, PlanNode};

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::tuple::{ObjectRef, Revision, ScanCursor, Tuple};

#[derive(Debug, thiserror::Error)]
pub enum CheckError {
    #[error("type not found: {0}")]
    TypeNotFound(String),

    #[error("permission '{permission}' not found on type '{type_name}'")]
    PermissionNotFound {
        type_name: String,
        permission: String,
    },

    #[error("relation '{relation}' not found on type '{type_name}'")]
    RelationNotFound { type_name: String, relation: String },

    #[error("max depth exceeded: {0}")]
    DepthExceeded(usize),

    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid continuation token: {0}")]
    InvalidContinuation(String),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_depth: usize,
    pub max_concurrent_branches: usize,
    pub timeout: Duration,
    pub lookup_page_size: usize,
    pub lookup_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_depth: 25,
            max_concurrent_branches: 10,
            timeout: Duration::from_secs(30),
            lookup_page_size: 100,
            lookup_buffer: 64,
        }
    }
}

pub(crate) type EvalFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CheckError>> + Send + 'a>>;

/// Snapshot reads the engines need from a relationship store.
pub trait TupleReader: Send + Sync + 'static {
    /// Tuples on `object` with `relation`.
    fn forward(
        &self,
        object: &ObjectRef,
        relation: &str,
        at: Revision,
    ) -> impl Future<Output = Result<Vec<Tuple>, CheckError>> + Send;

    /// Tuples with `relation` whose subject object is `subject_type:subject_id`,
    /// regardless of the subject relation.
    fn reverse(
        &self,
        subject_type: &str,
        subject_id: &str,
        relation: &str,
        at: Revision,
    ) -> impl Future<Output = Result<Vec<Tuple>, CheckError>> + Send;

    /// One page of `object_type#relation` tuples ordered by `(object_id, subject)`,
    /// strictly after `after`.
    fn relation_on_type(
        &self,
        object_type: &str,
        relation: &str,
        after: Option<&ScanCursor>,
        limit: usize,
        at: Revision,
    ) -> impl Future<Output = Result<Vec<Tuple>, CheckError>> + Send;
}
