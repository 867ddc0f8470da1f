use std::collections::BTreeSet;
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tokio::time::timeout;

use crate::schema::CompiledSchema;
use crate::schema::types::NameKind;
use crate::tuple::{ObjectRef, Revision, SubjectRef, Tuple};

use super::context::{NodeKey, TraversalContext};
use super::plan::PlanNode;
use super::{CheckError, EngineConfig, EvalFuture, TupleReader};

#[derive(Debug, Clone)]
pub struct ExpandRequest {
    pub object: ObjectRef,
    pub permission: String,
    pub revision: Revision,
}

/// Derivation of a permission, shaped like its plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpandTree {
    /// Tuples of `object#relation`; each userset subject is expanded in `children`.
    Relation {
        object: ObjectRef,
        relation: String,
        tuples: Vec<Tuple>,
        children: Vec<ExpandTree>,
    },
    Permission {
        object: ObjectRef,
        permission: String,
        child: Box<ExpandTree>,
    },
    Union(Vec<ExpandTree>),
    Intersection(Vec<ExpandTree>),
    Exclusion {
        base: Box<ExpandTree>,
        excluded: Box<ExpandTree>,
    },
    /// Tupleset tuples of `object`, and `target` expanded on each of their subjects.
    Arrow {
        object: ObjectRef,
        tupleset: String,
        target: String,
        tuples: Vec<Tuple>,
        children: Vec<ExpandTree>,
    },
    /// `object#name` is already being expanded further up this path.
    CycleCut { object: ObjectRef, name: String },
}

impl ExpandTree {
    /// Direct subjects of every relation tuple in the tree, including the
    /// subtracted side of exclusions. Sorted and deduplicated.
    pub fn subjects(&self) -> Vec<SubjectRef> {
        let mut subjects = BTreeSet::new();
        self.collect_subjects(&mut subjects);
        subjects.into_iter().collect()
    }

    fn collect_subjects(&self, out: &mut BTreeSet<SubjectRef>) {
        match self {
            ExpandTree::Relation {
                tuples, children, ..
            } => {
                out.extend(
                    tuples
                        .iter()
                        .filter(|t| t.subject.subject_relation.is_none())
                        .map(|t| t.subject.clone()),
                );
                for child in children {
                    child.collect_subjects(out);
                }
            }
            ExpandTree::Permission { child, .. } => child.collect_subjects(out),
            ExpandTree::Union(children)
            | ExpandTree::Intersection(children)
            | ExpandTree::Arrow { children, .. } => {
                for child in children {
                    child.collect_subjects(out);
                }
            }
            ExpandTree::Exclusion { base, excluded } => {
                base.collect_subjects(out);
                excluded.collect_subjects(out);
            }
            ExpandTree::CycleCut { .. } => {}
        }
    }
}

type BranchIter<'a> = Box<dyn Iterator<Item = EvalFuture<'a, ExpandTree>> + Send + 'a>;

pub struct ExpandEngine<T: TupleReader> {
    reader: Arc<T>,
    schema: Arc<CompiledSchema>,
    config: EngineConfig,
}

impl<T: TupleReader> ExpandEngine<T> {
    pub fn new(reader: Arc<T>, schema: Arc<CompiledSchema>, config: EngineConfig) -> Self {
        Self {
            reader,
            schema,
            config,
        }
    }

    pub async fn expand(&self, request: &ExpandRequest) -> Result<ExpandTree, CheckError> {
        let type_def = self
            .schema
            .get_type(&request.object.object_type)
            .ok_or_else(|| CheckError::TypeNotFound(request.object.object_type.clone()))?;
        if type_def.resolve(&request.permission).is_none() {
            return Err(CheckError::PermissionNotFound {
                type_name: request.object.object_type.clone(),
                permission: request.permission.clone(),
            });
        }

        let key = NodeKey::new(request.object.clone(), request.permission.clone());
        match timeout(
            self.config.timeout,
            self.expand_name(key, TraversalContext::new(), request.revision),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(CheckError::DeadlineExceeded(self.config.timeout)),
        }
    }

    fn defines(&self, object_type: &str, name: &str) -> bool {
        self.schema
            .get_type(object_type)
            .is_some_and(|t| t.resolve(name).is_some())
    }

    fn expand_name<'a>(
        &'a self,
        key: NodeKey,
        ctx: TraversalContext,
        revision: Revision,
    ) -> EvalFuture<'a, ExpandTree> {
        Box::pin(async move {
            if ctx.is_on_path(&key) {
                return Ok(ExpandTree::CycleCut {
                    object: key.object,
                    name: key.name,
                });
            }
            if ctx.depth >= self.config.max_depth {
                return Err(CheckError::DepthExceeded(self.config.max_depth));
            }

            let kind = self
                .schema
                .get_type(&key.object.object_type)
                .and_then(|t| t.resolve(&key.name))
                .ok_or_else(|| CheckError::RelationNotFound {
                    type_name: key.object.object_type.clone(),
                    relation: key.name.clone(),
                })?;

            let inner = ctx.enter(&key);
            match kind {
                NameKind::Relation => self.expand_relation(key, &inner, revision).await,
                NameKind::Permission => {
                    let plan = self.schema.plan(&key.object.object_type, &key.name)?;
                    let child = self
                        .expand_node(&plan.root, &key.object, &inner, revision)
                        .await?;
                    Ok(ExpandTree::Permission {
                        object: key.object,
                        permission: key.name,
                        child: Box::new(child),
                    })
                }
            }
        })
    }

    fn expand_node<'a>(
        &'a self,
        node: &'a PlanNode,
        object: &'a ObjectRef,
        ctx: &'a TraversalContext,
        revision: Revision,
    ) -> EvalFuture<'a, ExpandTree> {
        Box::pin(async move {
            match node {
                PlanNode::Relation(name) | PlanNode::Permission(name) => {
                    self.expand_name(NodeKey::new(object.clone(), name), ctx.clone(), revision)
                        .await
                }
                PlanNode::Union(children) => Ok(ExpandTree::Union(
                    self.expand_all(Box::new(
                        children
                            .iter()
                            .map(|child| self.expand_node(child, object, ctx, revision)),
                    ) as BranchIter<'_>)
                    .await?,
                )),
                PlanNode::Intersection(children) => Ok(ExpandTree::Intersection(
                    self.expand_all(Box::new(
                        children
                            .iter()
                            .map(|child| self.expand_node(child, object, ctx, revision)),
                    ) as BranchIter<'_>)
                    .await?,
                )),
                PlanNode::Exclusion(base, excluded) => {
                    let (base, excluded) = futures::try_join!(
                        self.expand_node(base, object, ctx, revision),
                        self.expand_node(excluded, object, ctx, revision),
                    )?;
                    Ok(ExpandTree::Exclusion {
                        base: Box::new(base),
                        excluded: Box::new(excluded),
                    })
                }
                PlanNode::Arrow { tupleset, target } => {
                    let tuples = self.reader.forward(object, tupleset, revision).await?;
                    let children = self
                        .expand_all(Box::new(
                            tuples
                                .iter()
                                .filter(|t| self.defines(&t.subject.subject_type, target))
                                .map(|t| {
                                    self.expand_name(
                                        NodeKey::new(t.subject.object(), target),
                                        ctx.clone(),
                                        revision,
                                    )
                                }),
                        ) as BranchIter<'_>)
                        .await?;
                    Ok(ExpandTree::Arrow {
                        object: object.clone(),
                        tupleset: tupleset.clone(),
                        target: target.clone(),
                        tuples,
                        children,
                    })
                }
            }
        })
    }

    async fn expand_relation(
        &self,
        key: NodeKey,
        ctx: &TraversalContext,
        revision: Revision,
    ) -> Result<ExpandTree, CheckError> {
        let tuples = self.reader.forward(&key.object, &key.name, revision).await?;
        let children = self
            .expand_all(Box::new(tuples.iter().filter_map(|t| {
                let rel = t.subject.subject_relation.as_ref()?;
                self.defines(&t.subject.subject_type, rel).then(|| {
                    self.expand_name(NodeKey::new(t.subject.object(), rel), ctx.clone(), revision)
                })
            })) as BranchIter<'_>)
            .await?;
        Ok(ExpandTree::Relation {
            object: key.object,
            relation: key.name,
            tuples,
            children,
        })
    }

    /// Expands branches concurrently, keeping their order.
    async fn expand_all<'a>(
        &self,
        branches: impl Iterator<Item = EvalFuture<'a, ExpandTree>> + Send,
    ) -> Result<Vec<ExpandTree>, CheckError> {
        stream::iter(branches)
            .buffered(self.config.max_concurrent_branches.max(1))
            .try_collect()
            .await
    }
}
