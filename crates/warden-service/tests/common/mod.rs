#![allow(dead_code)]

use std::sync::Arc;

use futures::TryStreamExt;
use warden_core::engine::EngineConfig;
use warden_core::schema::SchemaLimits;
use warden_core::tuple::{ObjectRef, RelationshipUpdate, Revision, SubjectRef};
use warden_service::demo::DEMO_SCHEMA;
use warden_service::service::{
    AuthzService, CheckPermissionInput, Consistency, LookupResourcesInput, Permissionship,
};
use warden_storage::InMemoryStore;

pub type Service = AuthzService<InMemoryStore>;

pub async fn service_with(schema: &str, config: EngineConfig) -> Service {
    let service = AuthzService::new(
        Arc::new(InMemoryStore::new()),
        config,
        SchemaLimits::default(),
    );
    service.write_schema(schema, false).await.unwrap();
    service
}

pub async fn demo_service() -> Service {
    service_with(DEMO_SCHEMA, EngineConfig::default()).await
}

pub async fn create(service: &Service, tuples: &[&str]) -> Revision {
    let updates: Vec<_> = tuples
        .iter()
        .map(|t| RelationshipUpdate::create(t.parse().unwrap()))
        .collect();
    service.write_relationships(&updates).await.unwrap()
}

pub fn object(s: &str) -> ObjectRef {
    let (object_type, object_id) = s.split_once(':').unwrap();
    ObjectRef::new(object_type, object_id)
}

pub async fn allowed(
    service: &Service,
    subject: &str,
    permission: &str,
    on: &str,
    consistency: Consistency,
) -> bool {
    service
        .check_permission(CheckPermissionInput {
            object: object(on),
            permission: permission.to_string(),
            subject: subject.parse().unwrap(),
            consistency,
        })
        .await
        .unwrap()
        .permissionship
        == Permissionship::HasPermission
}

pub async fn lookup(
    service: &Service,
    subject: &str,
    permission: &str,
    object_type: &str,
) -> Vec<String> {
    service
        .lookup_resources(LookupResourcesInput {
            object_type: object_type.to_string(),
            permission: permission.to_string(),
            subject: subject.parse::<SubjectRef>().unwrap(),
            consistency: Consistency::FullyConsistent,
            continuation: None,
            limit: None,
        })
        .await
        .unwrap()
        .map_ok(|item| item.object_id)
        .try_collect()
        .await
        .unwrap()
}
