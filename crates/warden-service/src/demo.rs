use futures::TryStreamExt;
use tracing::info;
use warden_core::tuple::{ObjectRef, RelationshipUpdate, SubjectRef, Tuple};
use warden_storage::{RelationshipStore, SchemaStore};

use crate::error::ApiError;
use crate::service::{
    AuthzService, CheckPermissionInput, Consistency, LookupResourcesInput, Permissionship,
};

pub const DEMO_SCHEMA: &str = r#"
definition user {
    relation administration: administration
    relation user: user
    permission create = user + administration->member
}

definition administration {
    relation member: user
}

definition thing {
    relation administration: administration#member
    relation owner: user | administration#member
    relation reader: user
    relation writer: user
    relation deleter: user
    relation accesser: user | group#user_member

    permission read = owner + administration + reader + accesser
    permission write = owner + administration + writer + accesser
    permission update = owner + administration + deleter + accesser
    permission access = read + writer + deleter
}

definition group {
    relation administration: administration | administration#member
    relation owner: user
    relation user_member: user | group#user_member
    relation thing_member: thing
    relation group_access: group

    permission assign = owner + administration->member
    permission unassign = owner + administration->member
    permission access = owner + user_member + administration->member + group_access->user_member
}
"#;

const DEMO_USER: &str = "user-123";
const DEMO_THINGS: usize = 10;

#[derive(Debug)]
pub struct DemoReport {
    pub checks: Vec<(String, Permissionship)>,
    pub found: Vec<String>,
}

/// Writes readers for `thing-id-0..9`, checks `read` on each and looks them up.
pub async fn run_demo<S: RelationshipStore + SchemaStore>(
    service: &AuthzService<S>,
) -> Result<DemoReport, ApiError> {
    service.write_schema(DEMO_SCHEMA, false).await?;

    let subject = SubjectRef::direct("user", DEMO_USER);
    let ids: Vec<String> = (0..DEMO_THINGS).map(|i| format!("thing-id-{i}")).collect();
    let updates: Vec<RelationshipUpdate> = ids
        .iter()
        .map(|id| {
            RelationshipUpdate::create(Tuple::new(
                ObjectRef::new("thing", id),
                "reader",
                subject.clone(),
            ))
        })
        .collect();
    let revision = service.write_relationships(&updates).await?;
    info!(%revision, relationships = updates.len(), "demo relationships written");

    let mut checks = Vec::with_capacity(ids.len());
    for id in &ids {
        let output = service
            .check_permission(CheckPermissionInput {
                object: ObjectRef::new("thing", id),
                permission: "read".to_string(),
                subject: subject.clone(),
                consistency: Consistency::AtLeastAsFresh(revision),
            })
            .await?;
        checks.push((id.clone(), output.permissionship));
    }

    let found: Vec<String> = service
        .lookup_resources(LookupResourcesInput {
            object_type: "thing".to_string(),
            permission: "read".to_string(),
            subject,
            consistency: Consistency::AtLeastAsFresh(revision),
            continuation: None,
            limit: None,
        })
        .await?
        .map_ok(|item| item.object_id)
        .try_collect()
        .await?;

    Ok(DemoReport { checks, found })
}
