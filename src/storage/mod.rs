//! Storage layer for TabSync
//!
//! One contract, [`StorageBackend`], with two implementations: a libSQL
//! structured store and a PostgREST-compatible REST store. Callers get an
//! `Arc<dyn StorageBackend>` from the [`selector`] and never see which one is
//! behind it.

pub mod libsql;
pub mod pool;
pub mod rest;
pub mod selector;

use crate::error::{Result, StoreError};
use crate::types::{
    AiCredits, Collection, CollectionItem, CollectionItemPatch, ListQuery, Organization,
    OrganizationInvitation, OrganizationMembership, Snapshot, SnapshotInfo, Space,
    SpacePermission, TabGroup, User, UserSubscription, UserTier, UserWithSubscription,
};
use async_trait::async_trait;
use std::fmt;

/// Which implementation sits behind a `dyn StorageBackend`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Structured,
    Rest,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Structured => "structured",
            BackendKind::Rest => "rest",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage backend trait defining all required operations
///
/// Creates assign `id`, `created_at` and `updated_at` and write them back into
/// the passed entity. Updates of unknown ids fail with `NotFound` and never
/// create. Soft-deletable entities (spaces, collections, items) are hidden
/// from gets and plain listings once `deleted_at` is set.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageBackend: Send + Sync {
    // Users

    async fn create_user(&self, user: &mut User) -> Result<()>;

    async fn get_user_by_email(&self, email: &str) -> Result<User>;

    async fn get_user_by_id(&self, id: &str) -> Result<User>;

    /// Update profile fields (name, avatar, provider)
    async fn update_user(&self, user: &mut User) -> Result<()>;

    /// Set the billing tier, used by payment webhooks
    async fn update_user_tier(&self, user_id: &str, tier: UserTier) -> Result<()>;

    /// Remove a user and everything it owns
    async fn delete_user(&self, id: &str) -> Result<()>;

    async fn get_user_with_subscription(&self, user_id: &str) -> Result<UserWithSubscription>;

    // Organizations

    /// Create an organization and its owner membership
    async fn create_organization(&self, org: &mut Organization) -> Result<()>;

    async fn get_organization(&self, id: &str) -> Result<Organization>;

    async fn update_organization(&self, org: &mut Organization) -> Result<()>;

    /// Organizations the user owns or belongs to, newest first, no duplicates
    async fn list_user_organizations(&self, user_id: &str) -> Result<Vec<Organization>>;

    /// Add a member, or change the role of an existing one
    async fn add_organization_member(&self, membership: &mut OrganizationMembership)
        -> Result<()>;

    async fn list_organization_members(&self, org_id: &str) -> Result<Vec<OrganizationMembership>>;

    // Spaces

    async fn create_space(&self, space: &mut Space) -> Result<()>;

    async fn get_space(&self, id: &str) -> Result<Space>;

    async fn update_space(&self, space: &mut Space) -> Result<()>;

    /// Soft delete
    async fn delete_space(&self, id: &str) -> Result<()>;

    async fn list_spaces_by_organization(&self, org_id: &str, query: &ListQuery)
        -> Result<Vec<Space>>;

    /// Insert or update the (space, user) permission row
    async fn set_space_permission(&self, space_id: &str, user_id: &str, can_edit: bool)
        -> Result<()>;

    async fn get_space_permissions(&self, space_id: &str) -> Result<Vec<SpacePermission>>;

    // Collections

    async fn create_collection(&self, collection: &mut Collection) -> Result<()>;

    async fn get_collection(&self, id: &str) -> Result<Collection>;

    async fn update_collection(&self, collection: &mut Collection) -> Result<()>;

    /// Soft delete the collection and every live item in it
    async fn delete_collection(&self, id: &str) -> Result<()>;

    async fn list_collections_by_space(&self, space_id: &str, query: &ListQuery)
        -> Result<Vec<Collection>>;

    // Items

    async fn create_collection_item(&self, item: &mut CollectionItem) -> Result<()>;

    async fn get_collection_item(&self, id: &str) -> Result<CollectionItem>;

    async fn update_collection_item(&self, item: &mut CollectionItem) -> Result<()>;

    /// Change only the fields present in the patch
    ///
    /// An empty patch writes nothing and leaves `updated_at` alone, but still
    /// reports `NotFound` for an unknown id.
    async fn update_collection_item_partial(&self, id: &str, patch: &CollectionItemPatch)
        -> Result<()>;

    async fn delete_collection_item(&self, id: &str) -> Result<()>;

    async fn list_items_by_collection(&self, collection_id: &str, query: &ListQuery)
        -> Result<Vec<CollectionItem>>;

    /// Live item of the collection whose URL normalizes to the same value
    async fn find_item_by_normalized_url(&self, collection_id: &str, url: &str)
        -> Result<Option<CollectionItem>>;

    // Invitations

    /// Insert; fills token and the default expiry when absent
    async fn create_invitation(&self, invitation: &mut OrganizationInvitation) -> Result<()>;

    async fn get_invitation_by_token(&self, token: &str) -> Result<OrganizationInvitation>;

    /// Newest first
    async fn list_invitations_by_email(&self, email: &str) -> Result<Vec<OrganizationInvitation>>;

    /// Persist status, accepted_by and expires_at
    async fn update_invitation(&self, invitation: &mut OrganizationInvitation) -> Result<()>;

    // Snapshots

    /// Insert or replace the snapshot stored under (user, name)
    async fn save_snapshot(&self, user_id: &str, name: &str, tab_groups: &[TabGroup])
        -> Result<()>;

    /// Most recently updated first
    async fn list_snapshots(&self, user_id: &str) -> Result<Vec<SnapshotInfo>>;

    async fn load_snapshot(&self, user_id: &str, name: &str) -> Result<Snapshot>;

    async fn delete_snapshot(&self, user_id: &str, name: &str) -> Result<()>;

    // Billing

    async fn create_subscription(&self, _subscription: &mut UserSubscription) -> Result<()> {
        Err(StoreError::unsupported("create_subscription", self.backend_kind().as_str()))
    }

    async fn get_user_subscription(&self, _user_id: &str) -> Result<UserSubscription> {
        Err(StoreError::unsupported("get_user_subscription", self.backend_kind().as_str()))
    }

    async fn update_subscription(&self, _subscription: &mut UserSubscription) -> Result<()> {
        Err(StoreError::unsupported("update_subscription", self.backend_kind().as_str()))
    }

    async fn cancel_subscription(&self, _user_id: &str) -> Result<()> {
        Err(StoreError::unsupported("cancel_subscription", self.backend_kind().as_str()))
    }

    async fn get_user_ai_credits(&self, _user_id: &str) -> Result<AiCredits> {
        Err(StoreError::unsupported("get_user_ai_credits", self.backend_kind().as_str()))
    }

    async fn update_ai_credits(&self, _credits: &mut AiCredits) -> Result<()> {
        Err(StoreError::unsupported("update_ai_credits", self.backend_kind().as_str()))
    }

    /// Spend credits from the current balance; never goes negative
    async fn consume_ai_credits(&self, _user_id: &str, _amount: i64) -> Result<()> {
        Err(StoreError::unsupported("consume_ai_credits", self.backend_kind().as_str()))
    }

    // Lifecycle

    /// Cheap round trip; no side effects
    async fn health_check(&self) -> Result<()>;

    /// Release resources. Idempotent; later calls fail with `Unavailable`.
    async fn close(&self) -> Result<()>;

    /// Drop idle connections beyond the configured limit; returns how many
    fn release_idle(&self) -> usize {
        0
    }

    fn backend_kind(&self) -> BackendKind;
}

