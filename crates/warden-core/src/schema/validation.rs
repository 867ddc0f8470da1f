use std::fmt;

use super::types::{RelationDef, Schema};

/// Size bounds a schema must stay within to be accepted for writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaLimits {
    pub max_types: usize,
    pub max_relations_per_type: usize,
    pub max_permissions_per_type: usize,
    pub max_expression_depth: usize,
}

impl Default for SchemaLimits {
    fn default() -> Self {
        Self {
            max_types: 50,
            max_relations_per_type: 30,
            max_permissions_per_type: 30,
            max_expression_depth: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("too many types: {count} exceeds limit of {limit}")]
    TooManyTypes { count: usize, limit: usize },
    #[error("too many relations in type '{type_name}': {count} exceeds limit of {limit}")]
    TooManyRelations {
        type_name: String,
        count: usize,
        limit: usize,
    },
    #[error("too many permissions in type '{type_name}': {count} exceeds limit of {limit}")]
    TooManyPermissions {
        type_name: String,
        count: usize,
        limit: usize,
    },
    #[error(
        "expression of '{type_name}#{permission}' nests {depth} levels, exceeding limit of {limit}"
    )]
    ExpressionTooDeep {
        type_name: String,
        permission: String,
        depth: usize,
        limit: usize,
    },
}

/// A schema change that can orphan relationships already written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakingChange {
    TypeRemoved {
        type_name: String,
    },
    RelationRemoved {
        type_name: String,
        relation: String,
    },
    SubjectTypeRemoved {
        type_name: String,
        relation: String,
        subject_type: String,
    },
}

impl fmt::Display for BreakingChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BreakingChange::TypeRemoved { type_name } => write!(f, "type '{type_name}' removed"),
            BreakingChange::RelationRemoved {
                type_name,
                relation,
            } => write!(f, "relation '{type_name}#{relation}' removed"),
            BreakingChange::SubjectTypeRemoved {
                type_name,
                relation,
                subject_type,
            } => write!(
                f,
                "relation '{type_name}#{relation}' no longer allows '{subject_type}'"
            ),
        }
    }
}

/// Collects every limit the schema exceeds.
pub fn validate_schema_limits(
    schema: &Schema,
    limits: &SchemaLimits,
) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if schema.types.len() > limits.max_types {
        errors.push(ValidationError::TooManyTypes {
            count: schema.types.len(),
            limit: limits.max_types,
        });
    }

    for type_def in &schema.types {
        if type_def.relations.len() > limits.max_relations_per_type {
            errors.push(ValidationError::TooManyRelations {
                type_name: type_def.name.clone(),
                count: type_def.relations.len(),
                limit: limits.max_relations_per_type,
            });
        }
        if type_def.permissions.len() > limits.max_permissions_per_type {
            errors.push(ValidationError::TooManyPermissions {
                type_name: type_def.name.clone(),
                count: type_def.permissions.len(),
                limit: limits.max_permissions_per_type,
            });
        }
        for perm in &type_def.permissions {
            let depth = perm.rule.depth();
            if depth > limits.max_expression_depth {
                errors.push(ValidationError::ExpressionTooDeep {
                    type_name: type_def.name.clone(),
                    permission: perm.name.clone(),
                    depth,
                    limit: limits.max_expression_depth,
                });
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Lists changes from `old` to `new` that narrow what stored relationships may
/// contain. Widening a relation and any permission edit are safe.
pub fn detect_breaking_changes(old: &Schema, new: &Schema) -> Vec<BreakingChange> {
    let mut changes = Vec::new();

    for old_type in &old.types {
        let Some(new_type) = new.get_type(&old_type.name) else {
            changes.push(BreakingChange::TypeRemoved {
                type_name: old_type.name.clone(),
            });
            continue;
        };

        for old_rel in &old_type.relations {
            match new_type.get_relation(&old_rel.name) {
                None => changes.push(BreakingChange::RelationRemoved {
                    type_name: old_type.name.clone(),
                    relation: old_rel.name.clone(),
                }),
                Some(new_rel) => {
                    removed_subject_types(&old_type.name, old_rel, new_rel, &mut changes)
                }
            }
        }
    }

    changes
}

fn removed_subject_types(
    type_name: &str,
    old_rel: &RelationDef,
    new_rel: &RelationDef,
    changes: &mut Vec<BreakingChange>,
) {
    for subject in &old_rel.subject_types {
        if !new_rel.subject_types.contains(subject) {
            changes.push(BreakingChange::SubjectTypeRemoved {
                type_name: type_name.to_string(),
                relation: old_rel.name.clone(),
                subject_type: subject.to_string(),
            });
        }
    }
}
