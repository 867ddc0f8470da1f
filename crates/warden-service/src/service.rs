use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, instrument};
use warden_core::engine::{
    CheckCache, CheckEngine, CheckRequest, EngineConfig, ExpandEngine, ExpandRequest, ExpandTree,
    LookupEngine, LookupRequest, LookupStream, LookupSubjectsRequest,
};
use warden_core::schema::{
    CompiledSchema, SchemaLimits, SchemaVersion, compile, compile_schema, detect_breaking_changes,
    parse_schema, render_schema, validate_schema_limits,
};
use warden_core::tuple::{ObjectRef, RelationshipUpdate, Revision, SubjectRef, Tuple, TupleFilter};
use warden_storage::{RelationshipStore, SchemaStore};

use crate::adapter::StoreTupleReader;
use crate::error::ApiError;

/// How fresh the snapshot a query reads must be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    FullyConsistent,
    AtLeastAsFresh(Revision),
    AtExactSnapshot(Revision),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permissionship {
    HasPermission,
    NoPermission,
}

#[derive(Debug)]
pub struct CheckPermissionInput {
    pub object: ObjectRef,
    pub permission: String,
    pub subject: SubjectRef,
    pub consistency: Consistency,
}

#[derive(Debug)]
pub struct CheckPermissionOutput {
    pub permissionship: Permissionship,
    pub revision: Revision,
}

#[derive(Debug)]
pub struct ExpandPermissionInput {
    pub object: ObjectRef,
    pub permission: String,
    pub consistency: Consistency,
}

#[derive(Debug)]
pub struct LookupResourcesInput {
    pub object_type: String,
    pub permission: String,
    pub subject: SubjectRef,
    pub consistency: Consistency,
    pub continuation: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug)]
pub struct LookupSubjectsInput {
    pub object: ObjectRef,
    pub permission: String,
    pub subject_type: String,
    pub consistency: Consistency,
}

#[derive(Debug)]
pub struct WriteSchemaOutput {
    pub version: SchemaVersion,
    pub breaking_changes_overridden: bool,
}

/// In-process authorization API over one relationship store.
pub struct AuthzService<S: RelationshipStore + SchemaStore> {
    store: Arc<S>,
    reader: Arc<StoreTupleReader<S>>,
    schema: RwLock<Option<Arc<CompiledSchema>>>,
    engine_config: EngineConfig,
    schema_limits: SchemaLimits,
    cache: Option<CheckCache>,
}

impl<S: RelationshipStore + SchemaStore> AuthzService<S> {
    pub fn new(store: Arc<S>, engine_config: EngineConfig, schema_limits: SchemaLimits) -> Self {
        let reader = Arc::new(StoreTupleReader::new(Arc::clone(&store)));
        Self {
            store,
            reader,
            schema: RwLock::new(None),
            engine_config,
            schema_limits,
            cache: None,
        }
    }

    /// Shares `cache` across checks and lookup confirmations.
    pub fn with_cache(mut self, cache: CheckCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Compiles and activates `definition`. A failed write leaves the
    /// previously active schema in place.
    #[instrument(skip_all, fields(force = force))]
    pub async fn write_schema(
        &self,
        definition: &str,
        force: bool,
    ) -> Result<WriteSchemaOutput, ApiError> {
        let parsed = parse_schema(definition).map_err(warden_core::schema::SchemaError::from)?;
        validate_schema_limits(&parsed, &self.schema_limits).map_err(ApiError::Validation)?;
        let compiled = compile_schema(parsed)?;

        let mut active = self.schema.write().await;
        let mut breaking_changes_overridden = false;
        if let Some(current) = active.as_ref() {
            let breaking = detect_breaking_changes(current.schema(), compiled.schema());
            if !breaking.is_empty() && !force {
                return Err(ApiError::BreakingChanges(breaking));
            }
            breaking_changes_overridden = !breaking.is_empty();
        }

        let version = active
            .as_ref()
            .map_or(SchemaVersion::new(1), |current| current.version().next());
        self.store.write_schema(definition).await?;
        *active = Some(Arc::new(compiled.with_version(version)));

        info!(%version, breaking_changes_overridden, "schema activated");
        Ok(WriteSchemaOutput {
            version,
            breaking_changes_overridden,
        })
    }

    /// Canonical text of the active schema.
    pub async fn read_schema(&self) -> Result<Option<String>, ApiError> {
        let active = self.schema.read().await;
        Ok(active.as_ref().map(|schema| render_schema(schema.schema())))
    }

    /// Activates the schema text persisted in the store, if any.
    pub async fn restore_schema(&self) -> Result<Option<SchemaVersion>, ApiError> {
        let Some(text) = self.store.read_schema().await? else {
            return Ok(None);
        };
        let compiled = compile(&text)?;

        let mut active = self.schema.write().await;
        let version = active
            .as_ref()
            .map_or(SchemaVersion::new(1), |current| current.version().next());
        *active = Some(Arc::new(compiled.with_version(version)));

        info!(%version, "schema restored from store");
        Ok(Some(version))
    }

    /// Validates every update against the active schema and commits the batch.
    /// The schema cannot change between validation and commit.
    #[instrument(skip_all, fields(updates = updates.len()))]
    pub async fn write_relationships(
        &self,
        updates: &[RelationshipUpdate],
    ) -> Result<Revision, ApiError> {
        let active = self.schema.read().await;
        let schema = active.as_ref().ok_or(ApiError::SchemaNotFound)?;
        for update in updates {
            schema.validate_update(update)?;
        }

        let revision = self.store.write(updates).await?;
        drop(active);
        Ok(revision)
    }

    /// Deletes relationships whose type or relation the active schema no
    /// longer defines, returning how many were removed.
    #[instrument(skip_all)]
    pub async fn delete_orphaned_relationships(&self) -> Result<usize, ApiError> {
        let active = self.schema.read().await;
        let schema = active.as_ref().ok_or(ApiError::SchemaNotFound)?;
        let head = self.store.head_revision().await?;

        let orphans: Vec<RelationshipUpdate> = self
            .store
            .read(&TupleFilter::default(), head, None)
            .await?
            .into_iter()
            .filter(|tuple| schema.is_orphan(tuple))
            .map(RelationshipUpdate::delete)
            .collect();
        if !orphans.is_empty() {
            self.store.write(&orphans).await?;
        }
        drop(active);

        info!(removed = orphans.len(), "orphaned relationships deleted");
        Ok(orphans.len())
    }

    pub async fn read_relationships(
        &self,
        filter: &TupleFilter,
        consistency: Consistency,
        limit: Option<usize>,
    ) -> Result<Vec<Tuple>, ApiError> {
        let revision = self.resolve_revision(consistency).await?;
        Ok(self.store.read(filter, revision, limit).await?)
    }

    #[instrument(skip_all, fields(object = %input.object, permission = %input.permission, subject = %input.subject))]
    pub async fn check_permission(
        &self,
        input: CheckPermissionInput,
    ) -> Result<CheckPermissionOutput, ApiError> {
        let schema = self.active_schema().await?;
        let revision = self.resolve_revision(input.consistency).await?;

        let result = self
            .check_engine(schema)
            .check(&CheckRequest {
                object: input.object,
                permission: input.permission,
                subject: input.subject,
                revision,
            })
            .await?;

        let permissionship = if result.allowed {
            Permissionship::HasPermission
        } else {
            Permissionship::NoPermission
        };
        Ok(CheckPermissionOutput {
            permissionship,
            revision,
        })
    }

    pub async fn expand_permission_tree(
        &self,
        input: ExpandPermissionInput,
    ) -> Result<ExpandTree, ApiError> {
        let schema = self.active_schema().await?;
        let revision = self.resolve_revision(input.consistency).await?;

        let engine = ExpandEngine::new(Arc::clone(&self.reader), schema, self.engine_config.clone());
        Ok(engine
            .expand(&ExpandRequest {
                object: input.object,
                permission: input.permission,
                revision,
            })
            .await?)
    }

    /// Streams matching object ids in ascending order. A continuation resumes
    /// at the revision it was issued for, ignoring `consistency`.
    #[instrument(skip_all, fields(object_type = %input.object_type, permission = %input.permission, subject = %input.subject))]
    pub async fn lookup_resources(
        &self,
        input: LookupResourcesInput,
    ) -> Result<LookupStream, ApiError> {
        let schema = self.active_schema().await?;
        let revision = match input.continuation {
            Some(_) => Revision::default(),
            None => self.resolve_revision(input.consistency).await?,
        };

        Ok(self.lookup_engine(schema).lookup_resources(LookupRequest {
            object_type: input.object_type,
            permission: input.permission,
            subject: input.subject,
            revision,
            continuation: input.continuation,
            limit: input.limit,
        })?)
    }

    pub async fn lookup_subjects(
        &self,
        input: LookupSubjectsInput,
    ) -> Result<Vec<SubjectRef>, ApiError> {
        let schema = self.active_schema().await?;
        let revision = self.resolve_revision(input.consistency).await?;

        Ok(self
            .lookup_engine(schema)
            .lookup_subjects(&LookupSubjectsRequest {
                object: input.object,
                permission: input.permission,
                subject_type: input.subject_type,
                revision,
            })
            .await?)
    }

    /// Snapshot of the active schema; the query keeps it even if a new one
    /// is written meanwhile.
    async fn active_schema(&self) -> Result<Arc<CompiledSchema>, ApiError> {
        self.schema
            .read()
            .await
            .as_ref()
            .map(Arc::clone)
            .ok_or(ApiError::SchemaNotFound)
    }

    async fn resolve_revision(&self, consistency: Consistency) -> Result<Revision, ApiError> {
        match consistency {
            Consistency::FullyConsistent => Ok(self.store.head_revision().await?),
            Consistency::AtLeastAsFresh(minimum) => {
                let head = self.store.head_revision().await?;
                if minimum > head {
                    return Err(warden_storage::StorageError::SnapshotAhead {
                        requested: minimum,
                        head,
                    }
                    .into());
                }
                Ok(head)
            }
            Consistency::AtExactSnapshot(revision) => Ok(revision),
        }
    }

    fn check_engine(&self, schema: Arc<CompiledSchema>) -> CheckEngine<StoreTupleReader<S>> {
        let engine = CheckEngine::new(Arc::clone(&self.reader), schema, self.engine_config.clone());
        match &self.cache {
            Some(cache) => engine.with_cache(cache.clone()),
            None => engine,
        }
    }

    fn lookup_engine(&self, schema: Arc<CompiledSchema>) -> LookupEngine<StoreTupleReader<S>> {
        LookupEngine::new(Arc::clone(&self.reader), Arc::new(self.check_engine(schema)))
    }
}
