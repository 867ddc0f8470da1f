use warden_core::engine::CheckError;
use warden_core::schema::{BreakingChange, ConstraintViolation, SchemaError, ValidationError};
use warden_storage::StorageError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("check error: {0}")]
    Check(#[from] CheckError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("schema validation errors: {}", join(.0))]
    Validation(Vec<ValidationError>),

    #[error("breaking schema changes detected (use force to override): {}", join(.0))]
    BreakingChanges(Vec<BreakingChange>),

    #[error("constraint violation: {0}")]
    Constraint(#[from] ConstraintViolation),

    #[error("schema not found")]
    SchemaNotFound,
}

fn join<T: ToString>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
