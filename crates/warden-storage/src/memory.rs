use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;
use warden_core::tuple::{
    ObjectRef, Operation, RelationshipUpdate, Revision, ScanCursor, SubjectRef, Tuple, TupleFilter,
};

use crate::traits::{RelationshipStore, SchemaStore, StorageError};

/// One version of a tuple: visible from `created` until `deleted`.
#[derive(Debug, Clone)]
struct StoredTuple {
    tuple: Tuple,
    created: Revision,
    deleted: Option<Revision>,
}

impl StoredTuple {
    fn visible_at(&self, at: Revision) -> bool {
        self.created <= at && self.deleted.is_none_or(|deleted| deleted > at)
    }
}

type ForwardKey = (ObjectRef, String);
type ReverseKey = (String, String, String);
type ScanKey = (String, SubjectRef);

#[derive(Debug, Default)]
struct InnerState {
    head: Revision,
    rows: Vec<StoredTuple>,
    /// Row of the live version of each tuple.
    live: HashMap<Tuple, usize>,
    forward: HashMap<ForwardKey, Vec<usize>>,
    reverse: HashMap<ReverseKey, Vec<usize>>,
    by_relation: HashMap<(String, String), BTreeMap<ScanKey, Vec<usize>>>,
    schema: Option<String>,
}

impl InnerState {
    fn insert(&mut self, tuple: Tuple, at: Revision) {
        let row = self.rows.len();
        let t = &tuple;
        self.forward
            .entry((t.object.clone(), t.relation.clone()))
            .or_default()
            .push(row);
        self.reverse
            .entry((
                t.subject.subject_type.clone(),
                t.subject.subject_id.clone(),
                t.relation.clone(),
            ))
            .or_default()
            .push(row);
        self.by_relation
            .entry((t.object.object_type.clone(), t.relation.clone()))
            .or_default()
            .entry((t.object.object_id.clone(), t.subject.clone()))
            .or_default()
            .push(row);
        self.live.insert(tuple.clone(), row);
        self.rows.push(StoredTuple {
            tuple,
            created: at,
            deleted: None,
        });
    }

    fn check_revision(&self, at: Revision) -> Result<(), StorageError> {
        if at > self.head {
            return Err(StorageError::SnapshotAhead {
                requested: at,
                head: self.head,
            });
        }
        Ok(())
    }

    fn visible(&self, rows: Option<&Vec<usize>>, at: Revision) -> Vec<Tuple> {
        rows.into_iter()
            .flatten()
            .map(|&row| &self.rows[row])
            .filter(|stored| stored.visible_at(at))
            .map(|stored| stored.tuple.clone())
            .collect()
    }
}

/// Multi-version in-memory store. Readers share the lock; writers are serialized.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<InnerState>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RelationshipStore for InMemoryStore {
    async fn write(&self, updates: &[RelationshipUpdate]) -> Result<Revision, StorageError> {
        let mut state = self.state.write();
        if updates.is_empty() {
            return Ok(state.head);
        }

        let revision = state.head.next();
        for update in updates {
            match update.operation {
                Operation::Create => {
                    if !state.live.contains_key(&update.tuple) {
                        state.insert(update.tuple.clone(), revision);
                    }
                }
                Operation::Delete => {
                    if let Some(row) = state.live.remove(&update.tuple) {
                        state.rows[row].deleted = Some(revision);
                    }
                }
            }
        }
        state.head = revision;

        debug!(%revision, updates = updates.len(), "committed relationship batch");
        Ok(revision)
    }

    async fn forward(
        &self,
        object: &ObjectRef,
        relation: &str,
        at: Revision,
    ) -> Result<Vec<Tuple>, StorageError> {
        let state = self.state.read();
        state.check_revision(at)?;
        let key = (object.clone(), relation.to_string());
        Ok(state.visible(state.forward.get(&key), at))
    }

    async fn reverse(
        &self,
        subject_type: &str,
        subject_id: &str,
        relation: &str,
        at: Revision,
    ) -> Result<Vec<Tuple>, StorageError> {
        let state = self.state.read();
        state.check_revision(at)?;
        let key = (
            subject_type.to_string(),
            subject_id.to_string(),
            relation.to_string(),
        );
        Ok(state.visible(state.reverse.get(&key), at))
    }

    async fn reverse_by_relation_on_type(
        &self,
        object_type: &str,
        relation: &str,
        after: Option<&ScanCursor>,
        limit: usize,
        at: Revision,
    ) -> Result<Vec<Tuple>, StorageError> {
        let state = self.state.read();
        state.check_revision(at)?;
        let Some(scan) = state
            .by_relation
            .get(&(object_type.to_string(), relation.to_string()))
        else {
            return Ok(Vec::new());
        };

        let start = match after {
            Some(cursor) => Bound::Included((cursor.object_id.clone(), SubjectRef::direct("", ""))),
            None => Bound::Unbounded,
        };
        let page = scan
            .range((start, Bound::Unbounded))
            .flat_map(|(_, rows)| rows.iter().map(|&row| &state.rows[row]))
            .filter(|stored| stored.visible_at(at))
            .filter(|stored| after.is_none_or(|cursor| cursor.precedes(&stored.tuple)))
            .take(limit)
            .map(|stored| stored.tuple.clone())
            .collect();
        Ok(page)
    }

    async fn read(
        &self,
        filter: &TupleFilter,
        at: Revision,
        limit: Option<usize>,
    ) -> Result<Vec<Tuple>, StorageError> {
        let state = self.state.read();
        state.check_revision(at)?;
        let mut tuples: Vec<Tuple> = state
            .rows
            .iter()
            .filter(|stored| stored.visible_at(at) && filter.matches(&stored.tuple))
            .map(|stored| stored.tuple.clone())
            .collect();
        tuples.sort();
        if let Some(limit) = limit {
            tuples.truncate(limit);
        }
        Ok(tuples)
    }

    async fn head_revision(&self) -> Result<Revision, StorageError> {
        Ok(self.state.read().head)
    }
}

impl SchemaStore for InMemoryStore {
    async fn write_schema(&self, definition: &str) -> Result<(), StorageError> {
        self.state.write().schema = Some(definition.to_string());
        Ok(())
    }

    async fn read_schema(&self) -> Result<Option<String>, StorageError> {
        Ok(self.state.read().schema.clone())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;

    use super::*;

    fn tuple(s: &str) -> Tuple {
        s.parse().unwrap()
    }

    fn create(s: &str) -> RelationshipUpdate {
        RelationshipUpdate::create(tuple(s))
    }

    fn delete(s: &str) -> RelationshipUpdate {
        RelationshipUpdate::delete(tuple(s))
    }

    async fn all(store: &InMemoryStore, at: Revision) -> Vec<Tuple> {
        store.read(&TupleFilter::default(), at, None).await.unwrap()
    }

    #[tokio::test]
    async fn fresh_store_is_at_revision_zero() {
        let store = InMemoryStore::new();

        assert_eq!(store.head_revision().await.unwrap(), Revision::new(0));
    }

    #[tokio::test]
    async fn each_batch_advances_the_revision() {
        let store = InMemoryStore::new();

        let r1 = store.write(&[create("doc:1#viewer@user:a")]).await.unwrap();
        let r2 = store.write(&[create("doc:2#viewer@user:b")]).await.unwrap();

        assert_eq!(r1, Revision::new(1));
        assert_eq!(r2, Revision::new(2));
        assert_eq!(store.head_revision().await.unwrap(), r2);
    }

    #[tokio::test]
    async fn empty_batch_returns_head_without_committing() {
        let store = InMemoryStore::new();
        let r1 = store.write(&[create("doc:1#viewer@user:a")]).await.unwrap();

        assert_eq!(store.write(&[]).await.unwrap(), r1);
        assert_eq!(store.head_revision().await.unwrap(), r1);
    }

    #[tokio::test]
    async fn creating_twice_and_deleting_missing_are_no_ops() {
        let store = InMemoryStore::new();

        let revision = store
            .write(&[
                create("doc:1#viewer@user:a"),
                create("doc:1#viewer@user:a"),
                delete("doc:9#viewer@user:z"),
            ])
            .await
            .unwrap();

        assert_eq!(all(&store, revision).await, vec![tuple("doc:1#viewer@user:a")]);
    }

    #[tokio::test]
    async fn updates_apply_in_order() {
        let store = InMemoryStore::new();

        let revision = store
            .write(&[
                create("doc:1#viewer@user:a"),
                delete("doc:1#viewer@user:a"),
                create("doc:2#viewer@user:b"),
                delete("doc:2#viewer@user:b"),
                create("doc:2#viewer@user:b"),
            ])
            .await
            .unwrap();

        assert_eq!(all(&store, revision).await, vec![tuple("doc:2#viewer@user:b")]);
    }

    #[tokio::test]
    async fn older_revisions_keep_their_view() {
        let store = InMemoryStore::new();
        let r1 = store.write(&[create("doc:1#viewer@user:a")]).await.unwrap();
        let r2 = store
            .write(&[delete("doc:1#viewer@user:a"), create("doc:2#viewer@user:b")])
            .await
            .unwrap();
        let r3 = store.write(&[create("doc:1#viewer@user:a")]).await.unwrap();

        assert_eq!(all(&store, r1).await, vec![tuple("doc:1#viewer@user:a")]);
        assert_eq!(all(&store, r2).await, vec![tuple("doc:2#viewer@user:b")]);
        assert_eq!(all(&store, r3).await.len(), 2);
        assert!(all(&store, Revision::new(0)).await.is_empty());
    }

    #[tokio::test]
    async fn reads_ahead_of_head_are_rejected() {
        let store = InMemoryStore::new();

        let result = store
            .forward(&ObjectRef::new("doc", "1"), "viewer", Revision::new(5))
            .await;

        assert_eq!(
            result,
            Err(StorageError::SnapshotAhead {
                requested: Revision::new(5),
                head: Revision::new(0),
            })
        );
    }

    #[tokio::test]
    async fn forward_and_reverse_use_their_indexes() {
        let store = InMemoryStore::new();
        let revision = store
            .write(&[
                create("doc:1#viewer@user:a"),
                create("doc:1#viewer@group:eng#member"),
                create("doc:1#editor@user:a"),
                create("doc:2#viewer@group:eng"),
            ])
            .await
            .unwrap();

        let forward = store
            .forward(&ObjectRef::new("doc", "1"), "viewer", revision)
            .await
            .unwrap();
        let reverse = store.reverse("group", "eng", "viewer", revision).await.unwrap();

        assert_eq!(forward.len(), 2);
        assert!(forward.iter().all(|t| t.relation == "viewer"));
        assert_eq!(
            reverse.into_iter().collect::<BTreeSet<_>>(),
            BTreeSet::from([
                tuple("doc:1#viewer@group:eng#member"),
                tuple("doc:2#viewer@group:eng")
            ])
        );
    }

    #[tokio::test]
    async fn relation_scan_pages_in_object_order() {
        let store = InMemoryStore::new();
        let revision = store
            .write(&[
                create("doc:c#viewer@user:a"),
                create("doc:a#viewer@user:b"),
                create("doc:a#viewer@user:a"),
                create("doc:b#viewer@user:a"),
                create("doc:b#editor@user:a"),
                create("folder:a#viewer@user:a"),
            ])
            .await
            .unwrap();

        let first = store
            .reverse_by_relation_on_type("doc", "viewer", None, 2, revision)
            .await
            .unwrap();
        let rest = store
            .reverse_by_relation_on_type(
                "doc",
                "viewer",
                Some(&ScanCursor::after_tuple(&first[1])),
                10,
                revision,
            )
            .await
            .unwrap();
        let after_b = store
            .reverse_by_relation_on_type(
                "doc",
                "viewer",
                Some(&ScanCursor::after_object("a")),
                10,
                revision,
            )
            .await
            .unwrap();

        assert_eq!(first, vec![tuple("doc:a#viewer@user:a"), tuple("doc:a#viewer@user:b")]);
        assert_eq!(rest, vec![tuple("doc:b#viewer@user:a"), tuple("doc:c#viewer@user:a")]);
        assert_eq!(after_b, rest);
    }

    #[tokio::test]
    async fn read_applies_filter_and_limit() {
        let store = InMemoryStore::new();
        let revision = store
            .write(&[
                create("doc:1#viewer@user:a"),
                create("doc:2#viewer@user:a"),
                create("doc:3#viewer@group:eng#member"),
            ])
            .await
            .unwrap();

        let direct = TupleFilter {
            subject_relation: Some(None),
            ..Default::default()
        };

        assert_eq!(store.read(&direct, revision, None).await.unwrap().len(), 2);
        assert_eq!(store.read(&direct, revision, Some(1)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn schema_text_is_persisted() {
        let store = InMemoryStore::new();
        assert_eq!(store.read_schema().await.unwrap(), None);

        store.write_schema("definition user {}").await.unwrap();

        assert_eq!(
            store.read_schema().await.unwrap().as_deref(),
            Some("definition user {}")
        );
    }

    fn arbitrary_update() -> impl Strategy<Value = RelationshipUpdate> {
        (any::<bool>(), 0..4u8, 0..3u8).prop_map(|(is_create, doc, user)| {
            let t = tuple(&format!("doc:{doc}#viewer@user:{user}"));
            if is_create {
                RelationshipUpdate::create(t)
            } else {
                RelationshipUpdate::delete(t)
            }
        })
    }

    proptest! {
        #[test]
        fn every_revision_matches_a_sequential_model(
            batches in prop::collection::vec(prop::collection::vec(arbitrary_update(), 0..6), 1..8)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = InMemoryStore::new();
                let mut model = BTreeSet::new();
                let mut snapshots = vec![(Revision::new(0), Vec::new())];

                for batch in &batches {
                    let revision = store.write(batch).await.unwrap();
                    for update in batch {
                        match update.operation {
                            Operation::Create => model.insert(update.tuple.clone()),
                            Operation::Delete => model.remove(&update.tuple),
                        };
                    }
                    snapshots.push((revision, model.iter().cloned().collect::<Vec<_>>()));
                }

                for (revision, expected) in snapshots {
                    prop_assert_eq!(all(&store, revision).await, expected);
                }
                Ok(())
            })?;
        }

        #[test]
        fn replaying_a_batch_changes_nothing(
            batch in prop::collection::vec(arbitrary_update(), 1..8)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = InMemoryStore::new();
                let once = store.write(&batch).await.unwrap();
                let twice = store.write(&batch).await.unwrap();

                prop_assert_eq!(all(&store, once).await, all(&store, twice).await);
                Ok(())
            })?;
        }
    }
}
