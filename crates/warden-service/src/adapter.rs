use std::sync::Arc;

use warden_core::engine::{CheckError, TupleReader};
use warden_core::tuple::{ObjectRef, Revision, ScanCursor, Tuple};
use warden_storage::{RelationshipStore, StorageError};

/// Exposes a relationship store to the engines.
pub struct StoreTupleReader<S: RelationshipStore> {
    store: Arc<S>,
}

impl<S: RelationshipStore> StoreTupleReader<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

fn to_check_error(err: StorageError) -> CheckError {
    match err {
        StorageError::Unavailable(msg) => CheckError::StoreUnavailable(msg),
        other => CheckError::Storage(other.to_string()),
    }
}

impl<S: RelationshipStore> TupleReader for StoreTupleReader<S> {
    async fn forward(
        &self,
        object: &ObjectRef,
        relation: &str,
        at: Revision,
    ) -> Result<Vec<Tuple>, CheckError> {
        self.store
            .forward(object, relation, at)
            .await
            .map_err(to_check_error)
    }

    async fn reverse(
        &self,
        subject_type: &str,
        subject_id: &str,
        relation: &str,
        at: Revision,
    ) -> Result<Vec<Tuple>, CheckError> {
        self.store
            .reverse(subject_type, subject_id, relation, at)
            .await
            .map_err(to_check_error)
    }

    async fn relation_on_type(
        &self,
        object_type: &str,
        relation: &str,
        after: Option<&ScanCursor>,
        limit: usize,
        at: Revision,
    ) -> Result<Vec<Tuple>, CheckError> {
        self.store
            .reverse_by_relation_on_type(object_type, relation, after, limit, at)
            .await
            .map_err(to_check_error)
    }
}
