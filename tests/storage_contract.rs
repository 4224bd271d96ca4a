//! Behavioral contract shared by every storage backend
//!
//! Each check is written once against `&dyn StorageBackend` and run against
//! the libSQL store, the REST store in read-then-write mode, and the REST
//! store in merge-duplicates mode.

mod common;

use chrono::{Duration, Utc};
use serde_json::json;
use std::time::Duration as StdDuration;
use tabsync_store::workflows;
use tabsync_store::{
    Collection, CollectionItem, CollectionItemPatch, ErrorKind, InvitationStatus, ListQuery,
    MemberRole, Organization, OrganizationInvitation, OrganizationMembership, Page, SavedTab,
    Space, StorageBackend, TabGroup, User,
};

struct Fixture {
    user: User,
    org: Organization,
    space: Space,
    collection: Collection,
}

async fn seed(store: &dyn StorageBackend, email: &str) -> Fixture {
    let mut user = User::new(email);
    store.create_user(&mut user).await.unwrap();

    let mut org = Organization::new("Acme", &user.id);
    store.create_organization(&mut org).await.unwrap();

    let mut space = Space::new(&org.id, "Research");
    store.create_space(&mut space).await.unwrap();

    let mut collection = Collection::new(&space.id, "Reading list");
    store.create_collection(&mut collection).await.unwrap();

    Fixture {
        user,
        org,
        space,
        collection,
    }
}

async fn add_item(store: &dyn StorageBackend, collection_id: &str, title: &str, url: &str, position: i64) -> CollectionItem {
    let mut item = CollectionItem::new(collection_id, title, url);
    item.position = position;
    store.create_collection_item(&mut item).await.unwrap();
    item
}

fn groups(shape: &[usize]) -> Vec<TabGroup> {
    shape
        .iter()
        .enumerate()
        .map(|(g, tabs)| {
            let tabs = (0..*tabs)
                .map(|t| SavedTab::new(format!("Tab {}", t), format!("https://example.com/{}/{}", g, t)))
                .collect();
            TabGroup::new(format!("Group {}", g), tabs)
        })
        .collect()
}

async fn tick() {
    tokio::time::sleep(StdDuration::from_millis(15)).await;
}

async fn check_create_assigns_identity(store: &dyn StorageBackend) {
    let fx = seed(store, "owner@example.com").await;
    assert!(!fx.user.id.is_empty());
    assert!(!fx.collection.id.is_empty());

    let fetched = store.get_user_by_email("owner@example.com").await.unwrap();
    assert_eq!(fetched.id, fx.user.id);
    assert_eq!(fetched.provider, "email");

    let space = store.get_space(&fx.space.id).await.unwrap();
    assert_eq!(space.organization_id, fx.org.id);
    assert!(space.deleted_at.is_none());
}

async fn check_duplicate_email_conflicts(store: &dyn StorageBackend) {
    let mut first = User::new("dup@example.com");
    store.create_user(&mut first).await.unwrap();

    let mut second = User::new("dup@example.com");
    let err = store.create_user(&mut second).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

async fn check_update_unknown_is_not_found(store: &dyn StorageBackend) {
    let fx = seed(store, "owner@example.com").await;

    let mut ghost = Space::new(&fx.org.id, "Ghost");
    ghost.id = "no-such-space".to_string();
    let err = store.update_space(&mut ghost).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let spaces = store
        .list_spaces_by_organization(&fx.org.id, &ListQuery::all())
        .await
        .unwrap();
    assert_eq!(spaces.len(), 1);

    let err = store.get_collection_item("missing").await.unwrap_err();
    assert!(err.is_not_found());
}

async fn check_snapshot_upsert_is_idempotent(store: &dyn StorageBackend) {
    let fx = seed(store, "owner@example.com").await;

    store.save_snapshot(&fx.user.id, "daily", &groups(&[3])).await.unwrap();
    store.save_snapshot(&fx.user.id, "daily", &groups(&[3])).await.unwrap();
    store.save_snapshot(&fx.user.id, "daily", &groups(&[1, 1])).await.unwrap();

    let listed = store.list_snapshots(&fx.user.id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].group_count, 2);
    assert_eq!(listed[0].tab_count, 2);

    let loaded = store.load_snapshot(&fx.user.id, "daily").await.unwrap();
    assert_eq!(loaded.tab_groups.len(), 2);
}

async fn check_snapshot_scenario(store: &dyn StorageBackend) {
    let fx = seed(store, "u1@example.com").await;

    let members = store.list_organization_members(&fx.org.id).await.unwrap();
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].user_id, fx.user.id);
    assert_eq!(members[0].role, MemberRole::Owner);

    store.save_snapshot(&fx.user.id, "work", &groups(&[3, 2])).await.unwrap();
    let first = store.load_snapshot(&fx.user.id, "work").await.unwrap();
    assert_eq!((first.group_count, first.tab_count), (2, 5));

    tick().await;
    store.save_snapshot(&fx.user.id, "work", &groups(&[1])).await.unwrap();

    let listed = store.list_snapshots(&fx.user.id).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "work");
    assert_eq!((listed[0].group_count, listed[0].tab_count), (1, 1));
    assert!(listed[0].updated_at > first.updated_at);

    let loaded = store.load_snapshot(&fx.user.id, "work").await.unwrap();
    assert_eq!(loaded.tab_groups.len(), 1);
    assert_eq!(loaded.tab_groups[0].tabs.len(), 1);

    store.delete_snapshot(&fx.user.id, "work").await.unwrap();
    let err = store.load_snapshot(&fx.user.id, "work").await.unwrap_err();
    assert!(err.is_not_found());
    let err = store.delete_snapshot(&fx.user.id, "work").await.unwrap_err();
    assert!(err.is_not_found());
}

async fn check_soft_delete_visibility(store: &dyn StorageBackend) {
    let fx = seed(store, "owner@example.com").await;
    let keep = add_item(store, &fx.collection.id, "Keep", "https://example.com/keep", 0).await;
    let gone = add_item(store, &fx.collection.id, "Gone", "https://example.com/gone", 1).await;

    tick().await;
    let cutoff = Utc::now();
    tick().await;
    store.delete_collection_item(&gone.id).await.unwrap();

    let err = store.get_collection_item(&gone.id).await.unwrap_err();
    assert!(err.is_not_found());
    let err = store.delete_collection_item(&gone.id).await.unwrap_err();
    assert!(err.is_not_found());

    let live = store
        .list_items_by_collection(&fx.collection.id, &ListQuery::all())
        .await
        .unwrap();
    assert_eq!(live.iter().map(|i| i.id.as_str()).collect::<Vec<_>>(), vec![keep.id.as_str()]);

    let changes = store
        .list_items_by_collection(&fx.collection.id, &ListQuery::since(cutoff))
        .await
        .unwrap();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].id, gone.id);
    assert!(changes[0].deleted_at.is_some());

    let nothing_new = store
        .list_items_by_collection(&fx.collection.id, &ListQuery::since(Utc::now()))
        .await
        .unwrap();
    assert!(nothing_new.is_empty());
}

async fn check_collection_delete_cascades(store: &dyn StorageBackend) {
    let fx = seed(store, "owner@example.com").await;
    for n in 0..3 {
        add_item(store, &fx.collection.id, "Item", &format!("https://example.com/{}", n), n).await;
    }

    tick().await;
    let cutoff = Utc::now();
    tick().await;
    store.delete_collection(&fx.collection.id).await.unwrap();

    assert!(store.get_collection(&fx.collection.id).await.unwrap_err().is_not_found());
    assert!(store
        .list_collections_by_space(&fx.space.id, &ListQuery::all())
        .await
        .unwrap()
        .is_empty());
    assert!(store
        .list_items_by_collection(&fx.collection.id, &ListQuery::all())
        .await
        .unwrap()
        .is_empty());

    let tombstones = store
        .list_items_by_collection(&fx.collection.id, &ListQuery::since(cutoff))
        .await
        .unwrap();
    assert_eq!(tombstones.len(), 3);
    assert!(tombstones.iter().all(|item| item.deleted_at.is_some()));

    let collections = store
        .list_collections_by_space(&fx.space.id, &ListQuery::since(cutoff))
        .await
        .unwrap();
    assert_eq!(collections.len(), 1);
    assert!(collections[0].deleted_at.is_some());
}

async fn check_partial_update_isolation(store: &dyn StorageBackend) {
    let fx = seed(store, "owner@example.com").await;
    let mut item = CollectionItem::new(&fx.collection.id, "Old title", "https://example.com/article");
    item.domain = "example.com".to_string();
    item.metadata = json!({ "pinned": true });
    item.position = 4;
    store.create_collection_item(&mut item).await.unwrap();
    let before = store.get_collection_item(&item.id).await.unwrap();

    tick().await;
    store
        .update_collection_item_partial(&item.id, &CollectionItemPatch::default().title("New title"))
        .await
        .unwrap();

    let after = store.get_collection_item(&item.id).await.unwrap();
    assert_eq!(after.title, "New title");
    assert_eq!(after.url, before.url);
    assert_eq!(after.domain, before.domain);
    assert_eq!(after.metadata, before.metadata);
    assert_eq!(after.position, before.position);
    assert!(after.updated_at > before.updated_at);

    store
        .update_collection_item_partial(&item.id, &CollectionItemPatch::default())
        .await
        .unwrap();
    let untouched = store.get_collection_item(&item.id).await.unwrap();
    assert_eq!(untouched.updated_at, after.updated_at);

    // Metadata patches keep any JSON shape and leave the item readable
    for metadata in [json!("note"), json!({ "tags": ["a", "b"], "pinned": false }), serde_json::Value::Null] {
        store
            .update_collection_item_partial(&item.id, &CollectionItemPatch::default().metadata(metadata.clone()))
            .await
            .unwrap();
        let patched = store.get_collection_item(&item.id).await.unwrap();
        assert_eq!(patched.metadata, metadata);
        assert_eq!(patched.title, "New title");
        let listed = store
            .list_items_by_collection(&fx.collection.id, &ListQuery::all())
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].metadata, metadata);
    }

    let err = store
        .update_collection_item_partial("missing", &CollectionItemPatch::default())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    let err = store
        .update_collection_item_partial("missing", &CollectionItemPatch::default().position(1))
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

async fn check_membership_uniqueness(store: &dyn StorageBackend) {
    let fx = seed(store, "owner@example.com").await;
    let mut guest = User::new("guest@example.com");
    store.create_user(&mut guest).await.unwrap();

    let mut membership = OrganizationMembership::new(&fx.org.id, &guest.id, MemberRole::Member);
    store.add_organization_member(&mut membership).await.unwrap();
    let mut again = OrganizationMembership::new(&fx.org.id, &guest.id, MemberRole::Admin);
    store.add_organization_member(&mut again).await.unwrap();

    let members = store.list_organization_members(&fx.org.id).await.unwrap();
    assert_eq!(members.len(), 2);
    let guest_rows: Vec<_> = members.iter().filter(|m| m.user_id == guest.id).collect();
    assert_eq!(guest_rows.len(), 1);
    assert_eq!(guest_rows[0].role, MemberRole::Admin);
}

async fn check_space_permission_upsert(store: &dyn StorageBackend) {
    let fx = seed(store, "owner@example.com").await;

    store.set_space_permission(&fx.space.id, &fx.user.id, false).await.unwrap();
    store.set_space_permission(&fx.space.id, &fx.user.id, true).await.unwrap();

    let permissions = store.get_space_permissions(&fx.space.id).await.unwrap();
    assert_eq!(permissions.len(), 1);
    assert!(permissions[0].can_edit);
}

async fn check_org_listing_has_no_duplicates(store: &dyn StorageBackend) {
    let fx = seed(store, "a@example.com").await;
    let a = fx.user;

    let mut b = User::new("b@example.com");
    store.create_user(&mut b).await.unwrap();

    tick().await;
    let mut second = Organization::new("Second", &a.id);
    store.create_organization(&mut second).await.unwrap();

    tick().await;
    let mut foreign = Organization::new("Foreign", &b.id);
    store.create_organization(&mut foreign).await.unwrap();
    let mut joined = OrganizationMembership::new(&foreign.id, &a.id, MemberRole::Member);
    store.add_organization_member(&mut joined).await.unwrap();

    let listed = store.list_user_organizations(&a.id).await.unwrap();
    let ids: Vec<&str> = listed.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(ids, vec![foreign.id.as_str(), second.id.as_str(), fx.org.id.as_str()]);

    let for_b = store.list_user_organizations(&b.id).await.unwrap();
    assert_eq!(for_b.len(), 1);
}

async fn check_find_by_normalized_url(store: &dyn StorageBackend) {
    let fx = seed(store, "owner@example.com").await;
    let untagged = add_item(
        store,
        &fx.collection.id,
        "Docs",
        "https://Docs.Example.com/guide/?utm_source=feed#intro",
        0,
    )
    .await;

    let found = store
        .find_item_by_normalized_url(&fx.collection.id, "https://docs.example.com/guide")
        .await
        .unwrap();
    assert_eq!(found.map(|i| i.id), Some(untagged.id.clone()));

    let (tagged, created) = workflows::add_item_if_absent(
        store,
        CollectionItem::new(&fx.collection.id, "Blog", "https://blog.example.com/post/"),
    )
    .await
    .unwrap();
    assert!(created);
    let (same, created) = workflows::add_item_if_absent(
        store,
        CollectionItem::new(&fx.collection.id, "Blog again", "https://BLOG.example.com/post"),
    )
    .await
    .unwrap();
    assert!(!created);
    assert_eq!(same.id, tagged.id);

    store.delete_collection_item(&untagged.id).await.unwrap();
    assert!(store
        .find_item_by_normalized_url(&fx.collection.id, "https://docs.example.com/guide")
        .await
        .unwrap()
        .is_none());
}

async fn check_pagination(store: &dyn StorageBackend) {
    let fx = seed(store, "owner@example.com").await;
    for n in 0..5 {
        add_item(store, &fx.collection.id, &format!("Item {}", n), &format!("https://example.com/{}", n), n).await;
    }

    let first = store
        .list_items_by_collection(&fx.collection.id, &ListQuery::all().with_page(Page::new(1, 2)))
        .await
        .unwrap();
    assert_eq!(first.iter().map(|i| i.position).collect::<Vec<_>>(), vec![0, 1]);

    let last = store
        .list_items_by_collection(&fx.collection.id, &ListQuery::all().with_page(Page::new(3, 2)))
        .await
        .unwrap();
    assert_eq!(last.iter().map(|i| i.position).collect::<Vec<_>>(), vec![4]);

    let beyond = store
        .list_items_by_collection(&fx.collection.id, &ListQuery::all().with_page(Page::new(9, 2)))
        .await
        .unwrap();
    assert!(beyond.is_empty());
}

async fn check_invitation_scenario(store: &dyn StorageBackend) {
    let fx = seed(store, "owner@example.com").await;
    let mut guest = User::new("Guest@Example.com");
    store.create_user(&mut guest).await.unwrap();
    let mut intruder = User::new("intruder@example.com");
    store.create_user(&mut intruder).await.unwrap();

    let mut invitation = OrganizationInvitation::new(&fx.org.id, " GUEST@example.com ", &fx.user.id);
    store.create_invitation(&mut invitation).await.unwrap();
    assert_eq!(invitation.token.len(), 32);
    assert_eq!(invitation.email, "guest@example.com");

    let expires_at = invitation.expires_at.unwrap();
    let expected = Utc::now() + Duration::days(14);
    assert!((expires_at - expected).num_seconds().abs() < 60);

    let stored = store.get_invitation_by_token(&invitation.token).await.unwrap();
    assert_eq!(stored.status, InvitationStatus::Pending);

    let err = workflows::accept_invitation(store, &invitation.token, &intruder, Utc::now())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    let still_pending = store.get_invitation_by_token(&invitation.token).await.unwrap();
    assert_eq!(still_pending.status, InvitationStatus::Pending);

    let membership = workflows::accept_invitation(store, &invitation.token, &guest, Utc::now())
        .await
        .unwrap();
    assert_eq!(membership.role, MemberRole::Member);

    let listed = store.list_invitations_by_email("guest@EXAMPLE.com").await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].status, InvitationStatus::Accepted);
    assert_eq!(listed[0].accepted_by.as_deref(), Some(guest.id.as_str()));

    let members = store.list_organization_members(&fx.org.id).await.unwrap();
    assert!(members.iter().any(|m| m.user_id == guest.id && m.role == MemberRole::Member));
}

async fn check_expired_invitation(store: &dyn StorageBackend) {
    let fx = seed(store, "owner@example.com").await;
    let mut guest = User::new("late@example.com");
    store.create_user(&mut guest).await.unwrap();

    let mut invitation = OrganizationInvitation::new(&fx.org.id, "late@example.com", &fx.user.id);
    invitation.expires_at = Some(Utc::now() - Duration::hours(1));
    store.create_invitation(&mut invitation).await.unwrap();

    let err = workflows::accept_invitation(store, &invitation.token, &guest, Utc::now())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);

    let stored = store.get_invitation_by_token(&invitation.token).await.unwrap();
    assert_eq!(stored.status, InvitationStatus::Expired);
    assert!(store
        .list_organization_members(&fx.org.id)
        .await
        .unwrap()
        .iter()
        .all(|m| m.user_id != guest.id));
}

async fn check_not_found_vs_unavailable(store: &dyn StorageBackend) {
    let err = store.get_organization("missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    let err = store.get_space("missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    store.close().await.unwrap();
    store.close().await.unwrap();

    let err = store.get_organization("missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
    let err = store.health_check().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Unavailable);
}

async fn check_delete_user(store: &dyn StorageBackend) {
    let mut user = User::new("leaving@example.com");
    store.create_user(&mut user).await.unwrap();
    store.delete_user(&user.id).await.unwrap();

    assert!(store.get_user_by_id(&user.id).await.unwrap_err().is_not_found());
    assert!(store.delete_user(&user.id).await.unwrap_err().is_not_found());
}

macro_rules! contract_suite {
    ($suite:ident, $setup:expr) => {
        mod $suite {
            use super::*;

            contract_suite!(@case $setup;
                create_assigns_identity => check_create_assigns_identity,
                duplicate_email_conflicts => check_duplicate_email_conflicts,
                update_unknown_is_not_found => check_update_unknown_is_not_found,
                snapshot_upsert_is_idempotent => check_snapshot_upsert_is_idempotent,
                snapshot_scenario => check_snapshot_scenario,
                soft_delete_visibility => check_soft_delete_visibility,
                collection_delete_cascades => check_collection_delete_cascades,
                partial_update_isolation => check_partial_update_isolation,
                membership_uniqueness => check_membership_uniqueness,
                space_permission_upsert => check_space_permission_upsert,
                org_listing_has_no_duplicates => check_org_listing_has_no_duplicates,
                find_by_normalized_url => check_find_by_normalized_url,
                pagination => check_pagination,
                invitation_scenario => check_invitation_scenario,
                expired_invitation => check_expired_invitation,
                not_found_vs_unavailable => check_not_found_vs_unavailable,
                delete_user => check_delete_user,
            );
        }
    };
    (@case $setup:expr; $($name:ident => $check:ident),+ $(,)?) => {
        $(
            #[tokio::test]
            async fn $name() {
                let (store, _guard) = $setup;
                $check(&store).await;
            }
        )+
    };
}

contract_suite!(structured, common::sql_store().await);
contract_suite!(
    rest_read_then_write,
    common::rest_store(tabsync_store::UpsertMode::ReadThenWrite).await
);
contract_suite!(
    rest_merge_duplicates,
    common::rest_store(tabsync_store::UpsertMode::MergeDuplicates).await
);
