use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::schema::CompiledSchema;
use crate::schema::types::NameKind;
use crate::tuple::{ObjectRef, Revision, SubjectRef};

use super::cache::{CacheKey, CheckCache};
use super::context::{NodeKey, TraversalContext};
use super::plan::PlanNode;
use super::{CheckError, EngineConfig, EvalFuture, TupleReader};

#[derive(Debug, Clone)]
pub struct CheckRequest {
    pub object: ObjectRef,
    /// Permission or relation name on the object's type.
    pub permission: String,
    pub subject: SubjectRef,
    pub revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckResult {
    pub allowed: bool,
}

/// State shared by every branch of one top-level check.
struct Query<'a> {
    subject: &'a SubjectRef,
    revision: Revision,
    memo: DashMap<NodeKey, bool>,
    cycle_cuts: AtomicUsize,
}

impl<'a> Query<'a> {
    fn new(subject: &'a SubjectRef, revision: Revision) -> Self {
        Self {
            subject,
            revision,
            memo: DashMap::new(),
            cycle_cuts: AtomicUsize::new(0),
        }
    }
}

pub struct CheckEngine<T: TupleReader> {
    reader: Arc<T>,
    schema: Arc<CompiledSchema>,
    config: EngineConfig,
    cache: Option<CheckCache>,
}

impl<T: TupleReader> CheckEngine<T> {
    pub fn new(reader: Arc<T>, schema: Arc<CompiledSchema>, config: EngineConfig) -> Self {
        Self {
            reader,
            schema,
            config,
            cache: None,
        }
    }

    pub fn with_cache(mut self, cache: CheckCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn schema(&self) -> &Arc<CompiledSchema> {
        &self.schema
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn check(&self, request: &CheckRequest) -> Result<CheckResult, CheckError> {
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

        let cached = self.cache.as_ref().map(|cache| {
            let key = CacheKey {
                schema_version: self.schema.version(),
                revision: request.revision,
                object: request.object.clone(),
                permission: request.permission.clone(),
                subject: request.subject.clone(),
            };
            (cache, key)
        });
        if let Some((cache, key)) = &cached
            && let Some(allowed) = cache.get(key).await
        {
            debug!(object = %request.object, permission = %request.permission, "check served from cache");
            return Ok(CheckResult { allowed });
        }

        let query = Query::new(&request.subject, request.revision);
        let root = NodeKey::new(request.object.clone(), request.permission.clone());
        let allowed = match timeout(
            self.config.timeout,
            self.eval_name(root, TraversalContext::new(), &query),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => return Err(CheckError::DeadlineExceeded(self.config.timeout)),
        };

        debug!(
            object = %request.object,
            permission = %request.permission,
            subject = %request.subject,
            revision = %request.revision,
            allowed,
            cycle_cuts = query.cycle_cuts.load(Ordering::Relaxed),
            "check resolved"
        );

        if let Some((cache, key)) = cached {
            cache.insert(key, allowed).await;
        }
        Ok(CheckResult { allowed })
    }

    /// Guarded evaluation of `object#name`: cycle cut, memo, depth bound.
    fn eval_name<'a>(
        &'a self,
        key: NodeKey,
        ctx: TraversalContext,
        query: &'a Query<'a>,
    ) -> EvalFuture<'a, bool> {
        Box::pin(async move {
            if ctx.is_on_path(&key) {
                query.cycle_cuts.fetch_add(1, Ordering::Relaxed);
                debug!(node = %key, "cycle cut");
                return Ok(false);
            }
            if let Some(allowed) = query.memo.get(&key) {
                return Ok(*allowed);
            }
            if ctx.depth >= self.config.max_depth {
                return Err(CheckError::DepthExceeded(self.config.max_depth));
            }

            let kind = self
                .schema
                .get_type(&key.object.object_type)
                .and_then(|t| t.resolve(&key.name));
            let Some(kind) = kind else {
                warn!(node = %key, "relationship refers to a name missing from the schema");
                return Ok(false);
            };

            let cuts_before = query.cycle_cuts.load(Ordering::Relaxed);
            let inner = ctx.enter(&key);
            let allowed = match kind {
                NameKind::Relation => {
                    self.eval_relation(&key.object, &key.name, &inner, query)
                        .await?
                }
                NameKind::Permission => {
                    let plan = self.schema.plan(&key.object.object_type, &key.name)?;
                    self.eval_node(&plan.root, &key.object, &inner, query)
                        .await?
                }
            };

            // A result that depended on a cycle cut is only valid on this path.
            if query.cycle_cuts.load(Ordering::Relaxed) == cuts_before {
                query.memo.insert(key, allowed);
            }
            Ok(allowed)
        })
    }

    fn eval_node<'a>(
        &'a self,
        node: &'a PlanNode,
        object: &'a ObjectRef,
        ctx: &'a TraversalContext,
        query: &'a Query<'a>,
    ) -> EvalFuture<'a, bool> {
        Box::pin(async move {
            match node {
                PlanNode::Relation(name) | PlanNode::Permission(name) => {
                    self.eval_name(NodeKey::new(object.clone(), name), ctx.clone(), query)
                        .await
                }
                PlanNode::Union(children) => {
                    self.any(Box::new(
                        children
                            .iter()
                            .map(|child| self.eval_node(child, object, ctx, query)),
                    ) as Box<dyn Iterator<Item = EvalFuture<'a, bool>> + Send + 'a>)
                    .await
                }
                PlanNode::Intersection(children) => {
                    self.all(Box::new(
                        children
                            .iter()
                            .map(|child| self.eval_node(child, object, ctx, query)),
                    ) as Box<dyn Iterator<Item = EvalFuture<'a, bool>> + Send + 'a>)
                    .await
                }
                PlanNode::Exclusion(base, excluded) => {
                    if !self.eval_node(base, object, ctx, query).await? {
                        return Ok(false);
                    }
                    Ok(!self.eval_node(excluded, object, ctx, query).await?)
                }
                PlanNode::Arrow { tupleset, target } => {
                    self.eval_arrow(object, tupleset, target, ctx, query).await
                }
            }
        })
    }

    async fn eval_relation(
        &self,
        object: &ObjectRef,
        relation: &str,
        ctx: &TraversalContext,
        query: &Query<'_>,
    ) -> Result<bool, CheckError> {
        let tuples = self.reader.forward(object, relation, query.revision).await?;
        if tuples.iter().any(|t| &t.subject == query.subject) {
            return Ok(true);
        }

        let usersets = tuples.into_iter().filter_map(|t| {
            let rel = t.subject.subject_relation.clone()?;
            Some(NodeKey::new(t.subject.object(), rel))
        });
        self.any(usersets.map(|key| self.eval_name(key, ctx.clone(), query)))
            .await
    }

    async fn eval_arrow(
        &self,
        object: &ObjectRef,
        tupleset: &str,
        target: &str,
        ctx: &TraversalContext,
        query: &Query<'_>,
    ) -> Result<bool, CheckError> {
        let tuples = self.reader.forward(object, tupleset, query.revision).await?;
        let targets = tuples
            .into_iter()
            .map(|t| NodeKey::new(t.subject.object(), target));
        self.any(targets.map(|key| self.eval_name(key, ctx.clone(), query)))
            .await
    }

    /// True as soon as one branch grants. Errors surface only when no branch does.
    async fn any<'a>(
        &self,
        branches: impl Iterator<Item = EvalFuture<'a, bool>> + Send,
    ) -> Result<bool, CheckError> {
        let mut results = stream::iter(branches).buffer_unordered(self.fan_out());
        let mut failure = None;
        while let Some(result) = results.next().await {
            match result {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        failure.map_or(Ok(false), Err)
    }

    /// False as soon as one branch denies. Errors surface only when none does.
    async fn all<'a>(
        &self,
        branches: impl Iterator<Item = EvalFuture<'a, bool>> + Send,
    ) -> Result<bool, CheckError> {
        let mut results = stream::iter(branches).buffer_unordered(self.fan_out());
        let mut failure = None;
        while let Some(result) = results.next().await {
            match result {
                Ok(false) => return Ok(false),
                Ok(true) => {}
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        failure.map_or(Ok(true), Err)
    }

    fn fan_out(&self) -> usize {
        self.config.max_concurrent_branches.max(1)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::engine::CheckCacheConfig;
    use crate::engine::testing::{TestStore, thing_schema};
    use crate::schema::compile;

    fn engine(tuples: &[&str]) -> CheckEngine<TestStore> {
        CheckEngine::new(
            Arc::new(TestStore::new(tuples)),
            thing_schema(),
            EngineConfig::default(),
        )
    }

    fn custom_engine(schema: &str, tuples: &[&str]) -> CheckEngine<TestStore> {
        CheckEngine::new(
            Arc::new(TestStore::new(tuples)),
            Arc::new(compile(schema).unwrap()),
            EngineConfig::default(),
        )
    }

    fn request(subject: &str, permission: &str, object: &str) -> CheckRequest {
        let (object_type, object_id) = object.split_once(':').unwrap();
        CheckRequest {
            object: ObjectRef::new(object_type, object_id),
            permission: permission.to_string(),
            subject: subject.parse().unwrap(),
            revision: Revision::new(1),
        }
    }

    async fn allowed<T: TupleReader>(
        engine: &CheckEngine<T>,
        subject: &str,
        permission: &str,
        object: &str,
    ) -> bool {
        engine
            .check(&request(subject, permission, object))
            .await
            .unwrap()
            .allowed
    }

    #[tokio::test]
    async fn check_rejects_unknown_type() {
        let engine = engine(&[]);

        let err = engine
            .check(&request("user:alice", "read", "document:readme"))
            .await
            .unwrap_err();

        assert!(
            matches!(err, CheckError::TypeNotFound(ref t) if t == "document"),
            "expected TypeNotFound, got: {err}"
        );
    }

    #[tokio::test]
    async fn check_rejects_unknown_permission() {
        let engine = engine(&[]);

        let err = engine
            .check(&request("user:alice", "destroy", "thing:t1"))
            .await
            .unwrap_err();

        assert!(
            matches!(
                err,
                CheckError::PermissionNotFound { ref type_name, ref permission }
                    if type_name == "thing" && permission == "destroy"
            ),
            "expected PermissionNotFound, got: {err}"
        );
    }

    #[tokio::test]
    async fn direct_reader_has_read() {
        let engine = engine(&["thing:thing-id-0#reader@user:user-123"]);

        assert!(allowed(&engine, "user:user-123", "read", "thing:thing-id-0").await);
        assert!(!allowed(&engine, "user:user-123", "read", "thing:thing-id-1").await);
        assert!(!allowed(&engine, "user:someone-else", "read", "thing:thing-id-0").await);
    }

    #[tokio::test]
    async fn administration_members_read_through_userset() {
        let engine = engine(&[
            "administration:admin1#member@user:alice",
            "thing:t1#administration@administration:admin1#member",
        ]);

        assert!(allowed(&engine, "user:alice", "read", "thing:t1").await);
        assert!(allowed(&engine, "user:alice", "access", "thing:t1").await);
        assert!(!allowed(&engine, "user:bob", "read", "thing:t1").await);
    }

    #[tokio::test]
    async fn userset_subject_matches_itself() {
        let engine = engine(&["thing:t1#administration@administration:admin1#member"]);

        assert!(allowed(&engine, "administration:admin1#member", "read", "thing:t1").await);
        assert!(!allowed(&engine, "administration:admin1", "read", "thing:t1").await);
    }

    #[tokio::test]
    async fn arrow_walks_to_administration_members() {
        let engine = engine(&[
            "administration:root#member@user:carol",
            "user:bob#administration@administration:root",
        ]);

        assert!(allowed(&engine, "user:carol", "create", "user:bob").await);
        assert!(!allowed(&engine, "user:dave", "create", "user:bob").await);
    }

    #[tokio::test]
    async fn nested_groups_grant_accesser() {
        let engine = engine(&[
            "thing:t1#accesser@group:eng#user_member",
            "group:eng#user_member@group:backend#user_member",
            "group:backend#user_member@user:erin",
        ]);

        assert!(allowed(&engine, "user:erin", "read", "thing:t1").await);
        assert!(allowed(&engine, "user:erin", "access", "group:eng").await);
    }

    #[tokio::test]
    async fn cyclic_groups_terminate() {
        let tuples = [
            "thing:t1#accesser@group:a#user_member",
            "group:a#user_member@group:b#user_member",
            "group:b#user_member@group:a#user_member",
            "group:a#group_access@group:b",
            "group:b#group_access@group:a",
        ];
        let without_member = engine(&tuples);

        assert!(!allowed(&without_member, "user:carol", "read", "thing:t1").await);
        assert!(!allowed(&without_member, "user:carol", "access", "group:a").await);

        let mut with_member = tuples.to_vec();
        with_member.push("group:b#user_member@user:carol");
        let with_member = engine(&with_member);

        assert!(allowed(&with_member, "user:carol", "read", "thing:t1").await);
        assert!(allowed(&with_member, "user:carol", "access", "group:a").await);
    }

    #[tokio::test]
    async fn long_chains_exceed_depth() {
        let chain: Vec<String> = (0..40)
            .map(|i| format!("group:g{i}#user_member@group:g{}#user_member", i + 1))
            .chain(std::iter::once("group:g40#user_member@user:zoe".to_string()))
            .collect();
        let tuples: Vec<&str> = chain.iter().map(String::as_str).collect();
        let engine = CheckEngine::new(
            Arc::new(TestStore::new(&tuples)),
            thing_schema(),
            EngineConfig {
                max_depth: 10,
                ..EngineConfig::default()
            },
        );

        let err = engine
            .check(&request("user:zoe", "user_member", "group:g0"))
            .await
            .unwrap_err();
        assert!(matches!(err, CheckError::DepthExceeded(10)), "got: {err}");

        assert!(allowed(&engine, "user:zoe", "user_member", "group:g35").await);
    }

    #[tokio::test]
    async fn intersection_requires_every_branch() {
        let engine = custom_engine(
            "definition user {} definition doc { relation member: user relation paid: user permission premium = member & paid }",
            &["doc:d#member@user:ann", "doc:d#paid@user:ann", "doc:d#member@user:ben"],
        );

        assert!(allowed(&engine, "user:ann", "premium", "doc:d").await);
        assert!(!allowed(&engine, "user:ben", "premium", "doc:d").await);
    }

    #[tokio::test]
    async fn exclusion_subtracts_banned_subjects() {
        let engine = custom_engine(
            "definition user {} definition doc { relation viewer: user relation banned: user permission view = viewer - banned }",
            &["doc:d#viewer@user:ann", "doc:d#viewer@user:ben", "doc:d#banned@user:ben"],
        );

        assert!(allowed(&engine, "user:ann", "view", "doc:d").await);
        assert!(!allowed(&engine, "user:ben", "view", "doc:d").await);
        assert!(!allowed(&engine, "user:cat", "view", "doc:d").await);
    }

    #[tokio::test]
    async fn recursive_arrow_over_cyclic_parents_terminates() {
        let engine = custom_engine(
            "definition user {} definition folder { relation parent: folder relation viewer: user permission view = viewer + parent->view }",
            &[
                "folder:a#parent@folder:b",
                "folder:b#parent@folder:c",
                "folder:c#parent@folder:a",
                "folder:c#viewer@user:vic",
            ],
        );

        assert!(allowed(&engine, "user:vic", "view", "folder:a").await);
        assert!(!allowed(&engine, "user:mallory", "view", "folder:a").await);
    }

    #[tokio::test]
    async fn store_failures_are_not_denials() {
        let engine = CheckEngine::new(
            Arc::new(TestStore::failing()),
            thing_schema(),
            EngineConfig::default(),
        );

        let err = engine
            .check(&request("user:alice", "read", "thing:t1"))
            .await
            .unwrap_err();

        assert!(matches!(err, CheckError::StoreUnavailable(_)), "got: {err}");
    }

    #[tokio::test]
    async fn slow_store_hits_deadline() {
        let engine = CheckEngine::new(
            Arc::new(TestStore::new(&[]).with_delay(Duration::from_millis(200))),
            thing_schema(),
            EngineConfig {
                timeout: Duration::from_millis(20),
                ..EngineConfig::default()
            },
        );

        let err = engine
            .check(&request("user:alice", "read", "thing:t1"))
            .await
            .unwrap_err();

        assert!(matches!(err, CheckError::DeadlineExceeded(_)), "got: {err}");
    }

    #[tokio::test]
    async fn warm_cache_skips_store_reads() {
        let store = Arc::new(TestStore::new(&["thing:t1#reader@user:alice"]));
        let engine = CheckEngine::new(Arc::clone(&store), thing_schema(), EngineConfig::default())
            .with_cache(CheckCache::new(&CheckCacheConfig::default()));

        assert!(allowed(&engine, "user:alice", "read", "thing:t1").await);
        let reads = store.read_count();
        assert!(allowed(&engine, "user:alice", "read", "thing:t1").await);

        assert_eq!(store.read_count(), reads);
    }

    #[tokio::test]
    async fn repeated_nodes_are_read_once_per_query() {
        let store = Arc::new(TestStore::new(&["thing:t1#writer@user:wes"]));
        let engine = CheckEngine::new(Arc::clone(&store), thing_schema(), EngineConfig::default());

        assert!(!allowed(&engine, "user:nobody", "access", "thing:t1").await);

        // read: owner, administration, reader, accesser; then writer, deleter.
        assert_eq!(store.read_count(), 6);
    }
}
