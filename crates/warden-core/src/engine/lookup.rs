use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures::stream::{self, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;

use crate::schema::CompiledSchema;
use crate::tuple::{ObjectRef, Revision, ScanCursor, SubjectRef, Tuple};

use super::check::{CheckEngine, CheckRequest};
use super::context::NodeKey;
use super::expand::{ExpandEngine, ExpandRequest};
use super::plan::EntryLeaf;
use super::{CheckError, EngineConfig, TupleReader};

const TOKEN_VERSION: &str = "v1";

type ItemSender = mpsc::Sender<Result<LookupItem, CheckError>>;

#[derive(Debug, Clone)]
pub struct LookupRequest {
    pub object_type: String,
    pub permission: String,
    pub subject: SubjectRef,
    /// Ignored when resuming; the continuation carries its own revision.
    pub revision: Revision,
    pub continuation: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupItem {
    pub object_id: String,
    /// Resumes the lookup right after this item.
    pub continuation: String,
}

/// Ends when the channel closes; a failure is delivered as a final `Err` item.
pub type LookupStream = ReceiverStream<Result<LookupItem, CheckError>>;

#[derive(Debug, Clone)]
pub struct LookupSubjectsRequest {
    pub object: ObjectRef,
    pub permission: String,
    pub subject_type: String,
    pub revision: Revision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Continuation {
    revision: Revision,
    fingerprint: u64,
    last_id: String,
}

impl Continuation {
    fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(format!(
            "{TOKEN_VERSION}|{}|{:016x}|{}",
            self.revision.value(),
            self.fingerprint,
            self.last_id
        ))
    }

    fn decode(token: &str) -> Result<Self, CheckError> {
        let malformed = || CheckError::InvalidContinuation("malformed token".to_string());
        let bytes = URL_SAFE_NO_PAD.decode(token).map_err(|_| malformed())?;
        let text = String::from_utf8(bytes).map_err(|_| malformed())?;

        let mut parts = text.splitn(4, '|');
        if parts.next() != Some(TOKEN_VERSION) {
            return Err(malformed());
        }
        let revision = parts
            .next()
            .and_then(|r| r.parse().ok())
            .map(Revision::new)
            .ok_or_else(malformed)?;
        let fingerprint = parts
            .next()
            .and_then(|f| u64::from_str_radix(f, 16).ok())
            .ok_or_else(malformed)?;
        let last_id = parts.next().ok_or_else(malformed)?.to_string();

        Ok(Self {
            revision,
            fingerprint,
            last_id,
        })
    }
}

/// A validated lookup, ready to run.
struct LookupQuery {
    object_type: String,
    permission: String,
    subject: SubjectRef,
    revision: Revision,
    fingerprint: u64,
    after: Option<String>,
    limit: Option<usize>,
}

/// One sorted scan over the tuples of an entry leaf of the target permission.
struct LeafScan {
    relation: String,
    /// Set for arrows: the name evaluated on each tuple's subject.
    target: Option<String>,
    page: VecDeque<Tuple>,
    cursor: Option<ScanCursor>,
    exhausted: bool,
    head: Option<String>,
}

impl LeafScan {
    fn new(leaf: EntryLeaf, after: Option<&str>) -> Self {
        let (relation, target) = match leaf {
            EntryLeaf::Relation(relation) => (relation, None),
            EntryLeaf::Arrow { tupleset, target } => (tupleset, Some(target)),
        };
        Self {
            relation,
            target,
            page: VecDeque::new(),
            cursor: after.map(ScanCursor::after_object),
            exhausted: false,
            head: None,
        }
    }

    fn matches(&self, tuple: &Tuple, subject: &SubjectRef, reached: &HashSet<NodeKey>) -> bool {
        match &self.target {
            Some(target) => reached.contains(&NodeKey::new(tuple.subject.object(), target)),
            None => {
                &tuple.subject == subject
                    || tuple
                        .subject
                        .subject_relation
                        .as_ref()
                        .is_some_and(|rel| reached.contains(&NodeKey::new(tuple.subject.object(), rel)))
            }
        }
    }

    /// Moves `head` to the next matching object id, reading pages as needed.
    /// Stops without a head once the receiver is gone.
    async fn fill<T: TupleReader>(
        &mut self,
        reader: &T,
        query: &LookupQuery,
        page_size: usize,
        reached: &HashSet<NodeKey>,
        tx: &ItemSender,
    ) -> Result<(), CheckError> {
        while self.head.is_none() {
            if let Some(tuple) = self.page.pop_front() {
                self.cursor = Some(ScanCursor::after_tuple(&tuple));
                if self.matches(&tuple, &query.subject, reached) {
                    self.head = Some(tuple.object.object_id);
                }
                continue;
            }
            if self.exhausted || tx.is_closed() {
                return Ok(());
            }
            let page = reader
                .relation_on_type(
                    &query.object_type,
                    &self.relation,
                    self.cursor.as_ref(),
                    page_size,
                    query.revision,
                )
                .await?;
            self.exhausted = page.len() < page_size;
            self.page.extend(page);
        }
        Ok(())
    }

    fn advance_past(&mut self, object_id: &str) {
        self.head = None;
        self.cursor = Some(ScanCursor::after_object(object_id));
        while self
            .page
            .front()
            .is_some_and(|t| t.object.object_id == object_id)
        {
            self.page.pop_front();
        }
    }
}

pub struct LookupEngine<T: TupleReader> {
    reader: Arc<T>,
    checker: Arc<CheckEngine<T>>,
    schema: Arc<CompiledSchema>,
    config: EngineConfig,
}

impl<T: TupleReader> Clone for LookupEngine<T> {
    fn clone(&self) -> Self {
        Self {
            reader: Arc::clone(&self.reader),
            checker: Arc::clone(&self.checker),
            schema: Arc::clone(&self.schema),
            config: self.config.clone(),
        }
    }
}

impl<T: TupleReader> LookupEngine<T> {
    /// Candidates are confirmed through `checker`, sharing its schema and cache.
    pub fn new(reader: Arc<T>, checker: Arc<CheckEngine<T>>) -> Self {
        let schema = Arc::clone(checker.schema());
        let config = checker.config().clone();
        Self {
            reader,
            checker,
            schema,
            config,
        }
    }

    /// Starts streaming the ids of `object_type` objects on which the subject
    /// holds the permission, in ascending id order.
    ///
    /// A breadth-first walk from the subject over the reverse index first
    /// collects every `object#name` the subject may belong to. Each entry leaf
    /// of the permission is then scanned in object-id order and the scans are
    /// merged. Candidates are yielded only after a full check confirms them.
    pub fn lookup_resources(&self, request: LookupRequest) -> Result<LookupStream, CheckError> {
        let query = self.prepare(request)?;
        let (tx, rx) = mpsc::channel(self.config.lookup_buffer.max(1));

        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(err) = engine.produce(&query, &tx).await {
                debug!(error = %err, "lookup ended with error");
                let _ = tx.send(Err(err)).await;
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    /// Subjects of `subject_type` holding the permission on the object.
    pub async fn lookup_subjects(
        &self,
        request: &LookupSubjectsRequest,
    ) -> Result<Vec<SubjectRef>, CheckError> {
        let expander = ExpandEngine::new(
            Arc::clone(&self.reader),
            Arc::clone(&self.schema),
            self.config.clone(),
        );
        let tree = expander
            .expand(&ExpandRequest {
                object: request.object.clone(),
                permission: request.permission.clone(),
                revision: request.revision,
            })
            .await?;

        let candidates = tree
            .subjects()
            .into_iter()
            .filter(|s| s.subject_type == request.subject_type);
        let confirmed: Vec<(SubjectRef, bool)> = stream::iter(candidates.map(|subject| async move {
            let result = self
                .checker
                .check(&CheckRequest {
                    object: request.object.clone(),
                    permission: request.permission.clone(),
                    subject: subject.clone(),
                    revision: request.revision,
                })
                .await?;
            Ok::<_, CheckError>((subject, result.allowed))
        }))
        .buffered(self.fan_out())
        .try_collect()
        .await?;

        Ok(confirmed
            .into_iter()
            .filter_map(|(subject, allowed)| allowed.then_some(subject))
            .collect())
    }

    fn prepare(&self, request: LookupRequest) -> Result<LookupQuery, CheckError> {
        let type_def = self
            .schema
            .get_type(&request.object_type)
            .ok_or_else(|| CheckError::TypeNotFound(request.object_type.clone()))?;
        if type_def.resolve(&request.permission).is_none() {
            return Err(CheckError::PermissionNotFound {
                type_name: request.object_type.clone(),
                permission: request.permission.clone(),
            });
        }

        let fingerprint = self.fingerprint(&request);
        let (revision, after) = match request.continuation.as_deref() {
            None => (request.revision, None),
            Some(token) => {
                let continuation = Continuation::decode(token)?;
                if continuation.fingerprint != fingerprint {
                    return Err(CheckError::InvalidContinuation(
                        "token was issued for a different lookup".to_string(),
                    ));
                }
                (continuation.revision, Some(continuation.last_id))
            }
        };

        Ok(LookupQuery {
            object_type: request.object_type,
            permission: request.permission,
            subject: request.subject,
            revision,
            fingerprint,
            after,
            limit: request.limit,
        })
    }

    /// Identical across builds and processes for the same query.
    fn fingerprint(&self, request: &LookupRequest) -> u64 {
        let mut hasher = Sha256::new();
        hasher.update(self.schema.version().value().to_be_bytes());
        for field in [
            request.object_type.as_str(),
            request.permission.as_str(),
            &request.subject.to_string(),
        ] {
            hasher.update((field.len() as u64).to_be_bytes());
            hasher.update(field.as_bytes());
        }
        let digest = hasher.finalize();
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(prefix)
    }

    async fn produce(&self, query: &LookupQuery, tx: &ItemSender) -> Result<(), CheckError> {
        if query.limit == Some(0) {
            return Ok(());
        }
        let reached = match timeout(
            self.config.timeout,
            self.reachable(&query.subject, query.revision, tx),
        )
        .await
        {
            Ok(reached) => reached?,
            Err(_) => return Err(CheckError::DeadlineExceeded(self.config.timeout)),
        };
        if tx.is_closed() {
            return Ok(());
        }
        debug!(
            subject = %query.subject,
            reached = reached.len(),
            "lookup reachability computed"
        );

        let page_size = self.config.lookup_page_size.max(1);
        let mut scans: Vec<LeafScan> = self
            .schema
            .entry_leaves(&query.object_type, &query.permission)?
            .into_iter()
            .map(|leaf| LeafScan::new(leaf, query.after.as_deref()))
            .collect();

        let mut emitted = 0;
        loop {
            let mut batch = Vec::new();
            while batch.len() < page_size {
                if tx.is_closed() {
                    return Ok(());
                }
                match self
                    .next_candidate(&mut scans, query, page_size, &reached, tx)
                    .await?
                {
                    Some(object_id) => batch.push(object_id),
                    None => break,
                }
            }
            if batch.is_empty() {
                debug!(emitted, "lookup exhausted");
                return Ok(());
            }

            let mut confirmed = stream::iter(batch.into_iter().map(|object_id| async move {
                if tx.is_closed() {
                    return Ok((object_id, false));
                }
                let result = self
                    .checker
                    .check(&CheckRequest {
                        object: ObjectRef::new(&query.object_type, &object_id),
                        permission: query.permission.clone(),
                        subject: query.subject.clone(),
                        revision: query.revision,
                    })
                    .await?;
                Ok::<_, CheckError>((object_id, result.allowed))
            }))
            .buffered(self.fan_out());

            while let Some(result) = confirmed.next().await {
                let (object_id, allowed) = result?;
                if tx.is_closed() {
                    return Ok(());
                }
                if !allowed {
                    continue;
                }
                let continuation = Continuation {
                    revision: query.revision,
                    fingerprint: query.fingerprint,
                    last_id: object_id.clone(),
                }
                .encode();
                if tx
                    .send(Ok(LookupItem {
                        object_id,
                        continuation,
                    }))
                    .await
                    .is_err()
                {
                    return Ok(());
                }
                emitted += 1;
                if query.limit.is_some_and(|limit| emitted >= limit) {
                    return Ok(());
                }
            }
        }
    }

    /// Smallest object id at the head of any scan, advancing every scan past it.
    async fn next_candidate(
        &self,
        scans: &mut [LeafScan],
        query: &LookupQuery,
        page_size: usize,
        reached: &HashSet<NodeKey>,
        tx: &ItemSender,
    ) -> Result<Option<String>, CheckError> {
        for scan in scans.iter_mut() {
            scan.fill(self.reader.as_ref(), query, page_size, reached, tx)
                .await?;
        }
        if tx.is_closed() {
            return Ok(None);
        }
        let Some(next) = scans.iter().filter_map(|s| s.head.clone()).min() else {
            return Ok(None);
        };
        for scan in scans.iter_mut() {
            if scan.head.as_deref() == Some(next.as_str()) {
                scan.advance_past(&next);
            }
        }
        Ok(Some(next))
    }

    /// Every `object#name` the subject may be a member of. Partial once the
    /// receiver is gone.
    async fn reachable(
        &self,
        subject: &SubjectRef,
        revision: Revision,
        tx: &ItemSender,
    ) -> Result<HashSet<NodeKey>, CheckError> {
        let index = self.schema.reachability();
        let mut reached = HashSet::new();
        let mut queue = VecDeque::new();

        match &subject.subject_relation {
            Some(rel) => visit(&mut reached, &mut queue, NodeKey::new(subject.object(), rel)),
            None => {
                for (object_type, relation) in index.tuple_entries(&subject.subject_type, None) {
                    if tx.is_closed() {
                        return Ok(reached);
                    }
                    let tuples = self
                        .reader
                        .reverse(&subject.subject_type, &subject.subject_id, relation, revision)
                        .await?;
                    for tuple in tuples {
                        if &tuple.object.object_type == object_type && &tuple.subject == subject {
                            visit(&mut reached, &mut queue, NodeKey::new(tuple.object, relation));
                        }
                    }
                }
            }
        }

        while let Some(node) = queue.pop_front() {
            if tx.is_closed() {
                break;
            }
            let NodeKey { object, name } = &node;

            for (object_type, relation) in index.tuple_entries(&object.object_type, Some(name)) {
                if tx.is_closed() {
                    return Ok(reached);
                }
                let tuples = self
                    .reader
                    .reverse(&object.object_type, &object.object_id, relation, revision)
                    .await?;
                for tuple in tuples {
                    if &tuple.object.object_type == object_type
                        && tuple.subject.subject_relation.as_ref() == Some(name)
                    {
                        visit(&mut reached, &mut queue, NodeKey::new(tuple.object, relation));
                    }
                }
            }

            for permission in index.computed_entries(&object.object_type, name) {
                visit(
                    &mut reached,
                    &mut queue,
                    NodeKey::new(object.clone(), permission),
                );
            }

            for entry in index.arrow_entries(&object.object_type, name) {
                if tx.is_closed() {
                    return Ok(reached);
                }
                let tuples = self
                    .reader
                    .reverse(&object.object_type, &object.object_id, &entry.tupleset, revision)
                    .await?;
                for tuple in tuples {
                    if tuple.object.object_type == entry.object_type {
                        visit(
                            &mut reached,
                            &mut queue,
                            NodeKey::new(tuple.object, &entry.permission),
                        );
                    }
                }
            }
        }

        Ok(reached)
    }

    fn fan_out(&self) -> usize {
        self.config.max_concurrent_branches.max(1)
    }
}

fn visit(reached: &mut HashSet<NodeKey>, queue: &mut VecDeque<NodeKey>, node: NodeKey) {
    if reached.insert(node.clone()) {
        queue.push_back(node);
    }
}
