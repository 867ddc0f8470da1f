use std::collections::HashMap;
use std::fmt;

use crate::engine::plan::{PlanCache, ReachabilityIndex};
use crate::tuple::{Operation, RelationshipUpdate, Tuple};

use super::parser::{ParseError, parse_schema};
use super::types::{NameKind, RewriteRule, Schema, TypeDefinition};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaVersion(u64);

impl SchemaVersion {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SchemaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("'{name}' in type '{type_name}' is defined as both a relation and a permission")]
    NameCollision { type_name: String, name: String },

    #[error("relation '{type_name}#{relation}' allows undefined subject type '{subject_type}'")]
    UndefinedSubjectType {
        type_name: String,
        relation: String,
        subject_type: String,
    },

    #[error(
        "relation '{type_name}#{relation}' allows '{subject_type}#{subject_relation}', but '{subject_relation}' is not defined on '{subject_type}'"
    )]
    UndefinedSubjectRelation {
        type_name: String,
        relation: String,
        subject_type: String,
        subject_relation: String,
    },

    #[error("permission '{type_name}#{permission}' references undefined name '{name}'")]
    UndefinedReference {
        type_name: String,
        permission: String,
        name: String,
    },

    #[error(
        "permission '{type_name}#{permission}' walks '{tupleset}', which is not a relation on '{type_name}'"
    )]
    InvalidTupleset {
        type_name: String,
        permission: String,
        tupleset: String,
    },

    #[error(
        "permission '{type_name}#{permission}' walks '{tupleset}->{target}', but '{target}' is not defined on '{subject_type}'"
    )]
    UnresolvableArrowTarget {
        type_name: String,
        permission: String,
        tupleset: String,
        target: String,
        subject_type: String,
    },

    #[error(
        "permission '{type_name}#{permission}' is defined in terms of itself without consuming a relationship"
    )]
    RecursivePermission {
        type_name: String,
        permission: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConstraintViolation {
    #[error("object type '{0}' is not defined")]
    UnknownObjectType(String),

    #[error("'{relation}' is not a relation on type '{type_name}'")]
    UnknownRelation { type_name: String, relation: String },

    #[error("relationship '{tuple}' has an empty identifier")]
    EmptyIdentifier { tuple: String },

    #[error("subject '{subject}' is not allowed on '{type_name}#{relation}' (allowed: {allowed})")]
    SubjectNotAllowed {
        type_name: String,
        relation: String,
        subject: String,
        allowed: String,
    },
}

/// A validated schema together with its evaluation plans.
#[derive(Debug)]
pub struct CompiledSchema {
    version: SchemaVersion,
    schema: Schema,
    plans: PlanCache,
    reachability: ReachabilityIndex,
}

/// Parses and validates schema text.
pub fn compile(text: &str) -> Result<CompiledSchema, SchemaError> {
    compile_schema(parse_schema(text)?)
}

/// Validates an already parsed schema model.
pub fn compile_schema(schema: Schema) -> Result<CompiledSchema, SchemaError> {
    for type_def in &schema.types {
        validate_type(&schema, type_def)?;
    }
    for type_def in &schema.types {
        detect_permission_cycles(type_def)?;
    }

    let reachability = ReachabilityIndex::build(&schema);
    Ok(CompiledSchema {
        version: SchemaVersion::default(),
        schema,
        plans: PlanCache::default(),
        reachability,
    })
}

impl CompiledSchema {
    pub fn with_version(mut self, version: SchemaVersion) -> Self {
        self.version = version;
        self
    }

    pub fn version(&self) -> SchemaVersion {
        self.version
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn get_type(&self, name: &str) -> Option<&TypeDefinition> {
        self.schema.get_type(name)
    }

    pub(crate) fn plans(&self) -> &PlanCache {
        &self.plans
    }

    pub(crate) fn reachability(&self) -> &ReachabilityIndex {
        &self.reachability
    }

    /// Creates must fit the schema. Deletes only need well-formed ids, so
    /// relationships left behind by a forced schema change stay removable.
    pub fn validate_update(&self, update: &RelationshipUpdate) -> Result<(), ConstraintViolation> {
        match update.operation {
            Operation::Create => self.validate_tuple(&update.tuple),
            Operation::Delete => check_identifiers(&update.tuple),
        }
    }

    /// The tuple's type or relation is no longer defined.
    pub fn is_orphan(&self, tuple: &Tuple) -> bool {
        self.schema
            .get_type(&tuple.object.object_type)
            .is_none_or(|t| t.get_relation(&tuple.relation).is_none())
    }

    /// Checks a relationship against the relation's allowed subject types.
    pub fn validate_tuple(&self, tuple: &Tuple) -> Result<(), ConstraintViolation> {
        check_identifiers(tuple)?;

        let type_def = self
            .schema
            .get_type(&tuple.object.object_type)
            .ok_or_else(|| {
                ConstraintViolation::UnknownObjectType(tuple.object.object_type.clone())
            })?;
        let relation = type_def.get_relation(&tuple.relation).ok_or_else(|| {
            ConstraintViolation::UnknownRelation {
                type_name: type_def.name.clone(),
                relation: tuple.relation.clone(),
            }
        })?;

        if relation.allows(
            &tuple.subject.subject_type,
            tuple.subject.subject_relation.as_deref(),
        ) {
            return Ok(());
        }

        Err(ConstraintViolation::SubjectNotAllowed {
            type_name: type_def.name.clone(),
            relation: relation.name.clone(),
            subject: tuple.subject.to_string(),
            allowed: relation
                .subject_types
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(" | "),
        })
    }
}

fn validate_type(schema: &Schema, type_def: &TypeDefinition) -> Result<(), SchemaError> {
    for perm in &type_def.permissions {
        if type_def.get_relation(&perm.name).is_some() {
            return Err(SchemaError::NameCollision {
                type_name: type_def.name.clone(),
                name: perm.name.clone(),
            });
        }
    }

    for rel in &type_def.relations {
        for subject in &rel.subject_types {
            let Some(subject_def) = schema.get_type(&subject.type_name) else {
                return Err(SchemaError::UndefinedSubjectType {
                    type_name: type_def.name.clone(),
                    relation: rel.name.clone(),
                    subject_type: subject.type_name.clone(),
                });
            };
            if let Some(ref subject_relation) = subject.relation
                && subject_def.resolve(subject_relation).is_none()
            {
                return Err(SchemaError::UndefinedSubjectRelation {
                    type_name: type_def.name.clone(),
                    relation: rel.name.clone(),
                    subject_type: subject.type_name.clone(),
                    subject_relation: subject_relation.clone(),
                });
            }
        }
    }

    for perm in &type_def.permissions {
        let mut result = Ok(());
        perm.rule.walk(&mut |node| {
            if result.is_err() {
                return;
            }
            result = validate_node(schema, type_def, &perm.name, node);
        });
        result?;
    }

    Ok(())
}

fn validate_node(
    schema: &Schema,
    type_def: &TypeDefinition,
    permission: &str,
    node: &RewriteRule,
) -> Result<(), SchemaError> {
    match node {
        RewriteRule::This(name) => {
            if type_def.resolve(name).is_none() {
                return Err(SchemaError::UndefinedReference {
                    type_name: type_def.name.clone(),
                    permission: permission.to_string(),
                    name: name.clone(),
                });
            }
        }
        RewriteRule::Arrow(tupleset, target) => {
            let Some(relation) = type_def.get_relation(tupleset) else {
                return Err(SchemaError::InvalidTupleset {
                    type_name: type_def.name.clone(),
                    permission: permission.to_string(),
                    tupleset: tupleset.clone(),
                });
            };
            for subject in &relation.subject_types {
                let resolvable = schema
                    .get_type(&subject.type_name)
                    .is_some_and(|t| t.resolve(target).is_some());
                if !resolvable {
                    return Err(SchemaError::UnresolvableArrowTarget {
                        type_name: type_def.name.clone(),
                        permission: permission.to_string(),
                        tupleset: tupleset.clone(),
                        target: target.clone(),
                        subject_type: subject.type_name.clone(),
                    });
                }
            }
        }
        RewriteRule::Union(_) | RewriteRule::Intersection(_) | RewriteRule::Exclusion(_, _) => {}
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

fn detect_permission_cycles(type_def: &TypeDefinition) -> Result<(), SchemaError> {
    let edges: HashMap<&str, Vec<&str>> = type_def
        .permissions
        .iter()
        .map(|perm| {
            let mut refs = Vec::new();
            perm.rule.walk(&mut |node| {
                if let RewriteRule::This(name) = node
                    && type_def.resolve(name) == Some(NameKind::Permission)
                {
                    refs.push(name.as_str());
                }
            });
            (perm.name.as_str(), refs)
        })
        .collect();

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    for perm in &type_def.permissions {
        if let Some(name) = visit(perm.name.as_str(), &edges, &mut marks) {
            return Err(SchemaError::RecursivePermission {
                type_name: type_def.name.clone(),
                permission: name.to_string(),
            });
        }
    }
    Ok(())
}

fn visit<'a>(
    name: &'a str,
    edges: &HashMap<&'a str, Vec<&'a str>>,
    marks: &mut HashMap<&'a str, Mark>,
) -> Option<&'a str> {
    match marks.get(name) {
        Some(Mark::Done) => return None,
        Some(Mark::InProgress) => return Some(name),
        None => {}
    }
    marks.insert(name, Mark::InProgress);
    for next in edges.get(name).into_iter().flatten() {
        if let Some(cycle) = visit(next, edges, marks) {
            return Some(cycle);
        }
    }
    marks.insert(name, Mark::Done);
    None
}

fn check_identifiers(tuple: &Tuple) -> Result<(), ConstraintViolation> {
    let empty_relation = matches!(tuple.subject.subject_relation.as_deref(), Some(""));
    if tuple.object.object_id.is_empty() || tuple.subject.subject_id.is_empty() || empty_relation {
        return Err(ConstraintViolation::EmptyIdentifier {
            tuple: tuple.to_string(),
        });
    }
    Ok(())
}
