use warden_core::tuple::{ObjectRef, RelationshipUpdate, Revision, ScanCursor, Tuple, TupleFilter};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    #[error("revision {requested} is ahead of head revision {head}")]
    SnapshotAhead { requested: Revision, head: Revision },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("internal storage error: {0}")]
    Internal(String),
}

/// Versioned relationship storage. Every read names the revision it observes.
pub trait RelationshipStore: Send + Sync + 'static {
    /// Applies `updates` in order as one atomic commit and returns its revision.
    /// Creating an existing tuple and deleting a missing one are no-ops; an
    /// empty batch commits nothing and returns the head revision.
    fn write(
        &self,
        updates: &[RelationshipUpdate],
    ) -> impl Future<Output = Result<Revision, StorageError>> + Send;

    fn forward(
        &self,
        object: &ObjectRef,
        relation: &str,
        at: Revision,
    ) -> impl Future<Output = Result<Vec<Tuple>, StorageError>> + Send;

    /// Tuples with `relation` whose subject object is `subject_type:subject_id`,
    /// with or without a subject relation.
    fn reverse(
        &self,
        subject_type: &str,
        subject_id: &str,
        relation: &str,
        at: Revision,
    ) -> impl Future<Output = Result<Vec<Tuple>, StorageError>> + Send;

    /// One page of `object_type#relation` tuples ordered by `(object_id, subject)`,
    /// strictly after `after`.
    fn reverse_by_relation_on_type(
        &self,
        object_type: &str,
        relation: &str,
        after: Option<&ScanCursor>,
        limit: usize,
        at: Revision,
    ) -> impl Future<Output = Result<Vec<Tuple>, StorageError>> + Send;

    fn read(
        &self,
        filter: &TupleFilter,
        at: Revision,
        limit: Option<usize>,
    ) -> impl Future<Output = Result<Vec<Tuple>, StorageError>> + Send;

    fn head_revision(&self) -> impl Future<Output = Result<Revision, StorageError>> + Send;
}

pub trait SchemaStore: Send + Sync {
    fn write_schema(
        &self,
        definition: &str,
    ) -> impl Future<Output = Result<(), StorageError>> + Send;

    fn read_schema(&self) -> impl Future<Output = Result<Option<String>, StorageError>> + Send;
}
