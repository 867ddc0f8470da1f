use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;

use crate::schema::CompiledSchema;
use crate::schema::types::{NameKind, RewriteRule, Schema, TypeDefinition};

use super::CheckError;

/// Executable form of a permission expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanNode {
    Relation(String),
    /// Sibling permission, resolved to its own plan when evaluated.
    Permission(String),
    Union(Vec<PlanNode>),
    Intersection(Vec<PlanNode>),
    Exclusion(Box<PlanNode>, Box<PlanNode>),
    Arrow { tupleset: String, target: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionPlan {
    pub object_type: String,
    pub permission: String,
    pub root: PlanNode,
}

/// A leaf through which tuples on an object can contribute to a permission.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntryLeaf {
    Relation(String),
    Arrow { tupleset: String, target: String },
}

#[derive(Debug, Default)]
pub(crate) struct PlanCache {
    plans: DashMap<(String, String), Arc<PermissionPlan>>,
}

impl CompiledSchema {
    /// Plan for `object_type#permission`, built on first use.
    pub fn plan(
        &self,
        object_type: &str,
        permission: &str,
    ) -> Result<Arc<PermissionPlan>, CheckError> {
        let key = (object_type.to_string(), permission.to_string());
        if let Some(plan) = self.plans().plans.get(&key) {
            return Ok(Arc::clone(plan.value()));
        }

        let type_def = self
            .get_type(object_type)
            .ok_or_else(|| CheckError::TypeNotFound(object_type.to_string()))?;
        let perm_def =
            type_def
                .get_permission(permission)
                .ok_or_else(|| CheckError::PermissionNotFound {
                    type_name: object_type.to_string(),
                    permission: permission.to_string(),
                })?;

        let plan = self.plans().plans.entry(key).or_insert_with(|| {
            Arc::new(PermissionPlan {
                object_type: object_type.to_string(),
                permission: permission.to_string(),
                root: lower(&perm_def.rule, type_def),
            })
        });
        Ok(Arc::clone(plan.value()))
    }

    /// Relations and arrows that can grant `name` on `object_type`, following
    /// sibling permissions through every position except an exclusion's
    /// subtracted side.
    pub fn entry_leaves(&self, object_type: &str, name: &str) -> Result<Vec<EntryLeaf>, CheckError> {
        let type_def = self
            .get_type(object_type)
            .ok_or_else(|| CheckError::TypeNotFound(object_type.to_string()))?;
        if type_def.get_relation(name).is_some() {
            return Ok(vec![EntryLeaf::Relation(name.to_string())]);
        }

        let mut leaves = Vec::new();
        let mut pending = vec![name.to_string()];
        let mut seen = HashSet::new();
        while let Some(permission) = pending.pop() {
            if !seen.insert(permission.clone()) {
                continue;
            }
            let plan = self.plan(object_type, &permission)?;
            collect_entry_leaves(&plan.root, &mut leaves, &mut pending);
        }
        Ok(leaves)
    }
}

fn collect_entry_leaves(node: &PlanNode, leaves: &mut Vec<EntryLeaf>, pending: &mut Vec<String>) {
    let leaf = match node {
        PlanNode::Relation(name) => EntryLeaf::Relation(name.clone()),
        PlanNode::Arrow { tupleset, target } => EntryLeaf::Arrow {
            tupleset: tupleset.clone(),
            target: target.clone(),
        },
        PlanNode::Permission(name) => {
            pending.push(name.clone());
            return;
        }
        PlanNode::Union(children) | PlanNode::Intersection(children) => {
            for child in children {
                collect_entry_leaves(child, leaves, pending);
            }
            return;
        }
        PlanNode::Exclusion(base, _) => {
            collect_entry_leaves(base, leaves, pending);
            return;
        }
    };
    if !leaves.contains(&leaf) {
        leaves.push(leaf);
    }
}

fn lower(rule: &RewriteRule, type_def: &TypeDefinition) -> PlanNode {
    match rule {
        RewriteRule::This(name) => match type_def.resolve(name) {
            Some(NameKind::Permission) => PlanNode::Permission(name.clone()),
            _ => PlanNode::Relation(name.clone()),
        },
        RewriteRule::Union(children) => {
            let mut flat = Vec::with_capacity(children.len());
            for child in children {
                match lower(child, type_def) {
                    PlanNode::Union(nested) => flat.extend(nested),
                    node => flat.push(node),
                }
            }
            PlanNode::Union(flat)
        }
        RewriteRule::Intersection(children) => {
            let mut flat = Vec::with_capacity(children.len());
            for child in children {
                match lower(child, type_def) {
                    PlanNode::Intersection(nested) => flat.extend(nested),
                    node => flat.push(node),
                }
            }
            PlanNode::Intersection(flat)
        }
        RewriteRule::Exclusion(base, excluded) => PlanNode::Exclusion(
            Box::new(lower(base, type_def)),
            Box::new(lower(excluded, type_def)),
        ),
        RewriteRule::Arrow(tupleset, target) => PlanNode::Arrow {
            tupleset: tupleset.clone(),
            target: target.clone(),
        },
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ArrowEntry {
    pub(crate) object_type: String,
    pub(crate) tupleset: String,
    pub(crate) permission: String,
}

/// Inverted schema: given a node a subject is known to be in, which nodes may
/// it therefore also be in.
#[derive(Debug, Default)]
pub(crate) struct ReachabilityIndex {
    /// `(subject_type, subject_relation)` -> `(object_type, relation)` admitting it.
    tuple_entries: HashMap<(String, Option<String>), Vec<(String, String)>>,
    /// `(type, name)` -> permissions on the same type that include `name`.
    computed_entries: HashMap<(String, String), Vec<String>>,
    /// `(target_type, target)` -> arrows that evaluate `target` on that type.
    arrow_entries: HashMap<(String, String), Vec<ArrowEntry>>,
}

impl ReachabilityIndex {
    pub(crate) fn build(schema: &Schema) -> Self {
        let mut index = Self::default();

        for type_def in &schema.types {
            for rel in &type_def.relations {
                for subject in &rel.subject_types {
                    push_unique(
                        index
                            .tuple_entries
                            .entry((subject.type_name.clone(), subject.relation.clone()))
                            .or_default(),
                        (type_def.name.clone(), rel.name.clone()),
                    );
                }
            }

            for perm in &type_def.permissions {
                walk_included(&perm.rule, &mut |node| match node {
                    RewriteRule::This(name) => push_unique(
                        index
                            .computed_entries
                            .entry((type_def.name.clone(), name.clone()))
                            .or_default(),
                        perm.name.clone(),
                    ),
                    RewriteRule::Arrow(tupleset, target) => {
                        let Some(rel) = type_def.get_relation(tupleset) else {
                            return;
                        };
                        for subject in &rel.subject_types {
                            push_unique(
                                index
                                    .arrow_entries
                                    .entry((subject.type_name.clone(), target.clone()))
                                    .or_default(),
                                ArrowEntry {
                                    object_type: type_def.name.clone(),
                                    tupleset: tupleset.clone(),
                                    permission: perm.name.clone(),
                                },
                            );
                        }
                    }
                    _ => {}
                });
            }
        }

        index
    }

    pub(crate) fn tuple_entries(
        &self,
        subject_type: &str,
        subject_relation: Option<&str>,
    ) -> &[(String, String)] {
        self.tuple_entries
            .get(&(subject_type.to_string(), subject_relation.map(str::to_string)))
            .map_or(&[], Vec::as_slice)
    }

    pub(crate) fn computed_entries(&self, object_type: &str, name: &str) -> &[String] {
        self.computed_entries
            .get(&(object_type.to_string(), name.to_string()))
            .map_or(&[], Vec::as_slice)
    }

    pub(crate) fn arrow_entries(&self, target_type: &str, target: &str) -> &[ArrowEntry] {
        self.arrow_entries
            .get(&(target_type.to_string(), target.to_string()))
            .map_or(&[], Vec::as_slice)
    }
}

fn push_unique<T: PartialEq>(entries: &mut Vec<T>, entry: T) {
    if !entries.contains(&entry) {
        entries.push(entry);
    }
}

/// Visits leaves outside any exclusion's subtracted side.
fn walk_included(rule: &RewriteRule, visit: &mut impl FnMut(&RewriteRule)) {
    match rule {
        RewriteRule::This(_) | RewriteRule::Arrow(_, _) => visit(rule),
        RewriteRule::Union(children) | RewriteRule::Intersection(children) => {
            for child in children {
                walk_included(child, visit);
            }
        }
        RewriteRule::Exclusion(base, _) => walk_included(base, visit),
    }
}
