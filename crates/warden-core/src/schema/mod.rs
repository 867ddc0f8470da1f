mod compile;
mod parser;
mod render;
pub mod types;
pub mod validation;

pub use compile::{
    CompiledSchema, ConstraintViolation, SchemaError, SchemaVersion, compile, compile_schema,
};
pub use parser::{ParseError, parse_schema};
pub use render::render_schema;
pub use validation::{
    BreakingChange, SchemaLimits, ValidationError, detect_breaking_changes, validate_schema_limits,
};
