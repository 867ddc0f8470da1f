mod common;

use std::collections::BTreeSet;

use proptest::prelude::*;
use warden_core::engine::EngineConfig;
use warden_core::schema::{compile, render_schema};
use warden_core::tuple::{RelationshipUpdate, Revision, TupleFilter};
use warden_service::demo::DEMO_SCHEMA;
use warden_service::service::Consistency;

use common::{Service, allowed, create, lookup, service_with};

const USERS: [&str; 3] = ["user:u0", "user:u1", "user:u2"];
const THINGS: [&str; 4] = ["t0", "t1", "t2", "t3"];
const GROUPS: [&str; 3] = ["g0", "g1", "g2"];

fn relationship() -> impl Strategy<Value = String> {
    let user = 0..USERS.len();
    let thing = 0..THINGS.len();
    let group = 0..GROUPS.len();
    prop_oneof![
        (thing.clone(), user.clone()).prop_map(|(t, u)| format!("thing:{}#reader@{}", THINGS[t], USERS[u])),
        (thing.clone(), 0..2usize).prop_map(|(t, a)| format!("thing:{}#owner@administration:a{a}#member", THINGS[t])),
        (0..2usize, user.clone()).prop_map(|(a, u)| format!("administration:a{a}#member@{}", USERS[u])),
        (thing, group.clone()).prop_map(|(t, g)| format!("thing:{}#accesser@group:{}#user_member", THINGS[t], GROUPS[g])),
        (group.clone(), user).prop_map(|(g, u)| format!("group:{}#user_member@{}", GROUPS[g], USERS[u])),
        (group.clone(), group.clone()).prop_map(|(g, h)| format!("group:{}#user_member@group:{}#user_member", GROUPS[g], GROUPS[h])),
        (group.clone(), group).prop_map(|(g, h)| format!("group:{}#group_access@group:{}", GROUPS[g], GROUPS[h])),
    ]
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

/// Every grant over the fixed universe, checked at `revision`.
async fn grants(service: &Service, revision: Revision) -> BTreeSet<String> {
    let mut granted = BTreeSet::new();
    for user in USERS {
        for thing in THINGS {
            for permission in ["read", "access"] {
                let on = format!("thing:{thing}");
                if allowed(service, user, permission, &on, Consistency::AtExactSnapshot(revision)).await {
                    granted.insert(format!("{on}#{permission}@{user}"));
                }
            }
        }
        for group in GROUPS {
            let on = format!("group:{group}");
            if allowed(service, user, "access", &on, Consistency::AtExactSnapshot(revision)).await {
                granted.insert(format!("{on}#access@{user}"));
            }
        }
    }
    granted
}

async fn write_all(service: &Service, tuples: &[String]) -> Revision {
    let refs: Vec<&str> = tuples.iter().map(String::as_str).collect();
    create(service, &refs).await
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn adding_a_relationship_never_revokes(
        base in prop::collection::vec(relationship(), 0..12),
        extra in relationship(),
    ) {
        runtime().block_on(async {
            let service = service_with(DEMO_SCHEMA, EngineConfig::default()).await;
            let before = write_all(&service, &base).await;
            let after = write_all(&service, &[extra]).await;

            let granted_before = grants(&service, before).await;
            let granted_after = grants(&service, after).await;

            prop_assert!(granted_before.is_subset(&granted_after));
            Ok(())
        })?;
    }

    #[test]
    fn lookup_agrees_with_check(
        tuples in prop::collection::vec(relationship(), 0..14),
        page_size in 1..4usize,
    ) {
        runtime().block_on(async {
            let config = EngineConfig {
                lookup_page_size: page_size,
                ..EngineConfig::default()
            };
            let service = service_with(DEMO_SCHEMA, config).await;
            let revision = write_all(&service, &tuples).await;

            for user in USERS {
                let expected: Vec<String> = {
                    let mut ids = Vec::new();
                    for thing in THINGS {
                        let on = format!("thing:{thing}");
                        if allowed(&service, user, "read", &on, Consistency::AtExactSnapshot(revision)).await {
                            ids.push(thing.to_string());
                        }
                    }
                    ids
                };
                prop_assert_eq!(lookup(&service, user, "read", "thing").await, expected);

                let groups: Vec<String> = {
                    let mut ids = Vec::new();
                    for group in GROUPS {
                        let on = format!("group:{group}");
                        if allowed(&service, user, "access", &on, Consistency::AtExactSnapshot(revision)).await {
                            ids.push(group.to_string());
                        }
                    }
                    ids
                };
                prop_assert_eq!(lookup(&service, user, "access", "group").await, groups);
            }
            Ok(())
        })?;
    }

    #[test]
    fn rendered_schema_grants_the_same(
        tuples in prop::collection::vec(relationship(), 0..12),
    ) {
        runtime().block_on(async {
            let rendered = render_schema(compile(DEMO_SCHEMA).unwrap().schema());
            let original = service_with(DEMO_SCHEMA, EngineConfig::default()).await;
            let recompiled = service_with(&rendered, EngineConfig::default()).await;

            let r1 = write_all(&original, &tuples).await;
            let r2 = write_all(&recompiled, &tuples).await;

            prop_assert_eq!(grants(&original, r1).await, grants(&recompiled, r2).await);
            Ok(())
        })?;
    }

    #[test]
    fn repeated_batches_leave_the_store_unchanged(
        tuples in prop::collection::vec(relationship(), 1..10),
        deleted in prop::collection::vec(relationship(), 0..4),
    ) {
        runtime().block_on(async {
            let service = service_with(DEMO_SCHEMA, EngineConfig::default()).await;
            let updates: Vec<RelationshipUpdate> = tuples
                .iter()
                .map(|t| RelationshipUpdate::create(t.parse().unwrap()))
                .chain(deleted.iter().map(|t| RelationshipUpdate::delete(t.parse().unwrap())))
                .collect();

            let once = service.write_relationships(&updates).await.unwrap();
            let twice = service.write_relationships(&updates).await.unwrap();

            let filter = TupleFilter::default();
            let read = |revision| service.read_relationships(
                &filter,
                Consistency::AtExactSnapshot(revision),
                None,
            );
            prop_assert_eq!(read(once).await.unwrap(), read(twice).await.unwrap());
            Ok(())
        })?;
    }
}
