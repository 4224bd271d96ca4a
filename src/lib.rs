//! TabSync Store - storage layer for the TabSync backend
//!
//! One persistence contract for users, organizations, spaces, collections,
//! collection items, invitations, snapshots and billing records, with
//! interchangeable backends behind it:
//! - **Structured store**: libSQL/Turso (local file, in-memory, or remote)
//! - **REST store**: a PostgREST-compatible table API (Supabase)
//!
//! # Architecture
//!
//! - **Types**: entities and the list/patch value types
//! - **Storage**: the [`StorageBackend`] contract, both backends and the selector
//! - **Lifecycle**: cached backend instances for long-lived and serverless processes
//! - **Workflows**: multi-step operations on top of the contract
//!
//! # Example
//!
//! ```ignore
//! use tabsync_store::{DeploymentMode, StoreConfig, StoreProvider, User};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let provider = StoreProvider::new(StoreConfig::sql("file:tabsync.db"), DeploymentMode::LongLived);
//!     let store = provider.backend().await?;
//!
//!     let mut user = User::new("ada@example.com");
//!     store.create_user(&mut user).await?;
//!
//!     provider.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod storage;
pub mod types;
pub mod utils;
pub mod workflows;

// Re-export commonly used types
pub use config::{DeploymentMode, LifecycleSettings, PoolSettings, StoreConfig, UpsertMode};
pub use error::{ErrorKind, Result, StoreError};
pub use lifecycle::{BackendFactory, ConnectionPool, EphemeralCache, SelectorFactory, StoreProvider};
pub use storage::libsql::{ConnectionMode, LibsqlStorage};
pub use storage::rest::RestStorage;
pub use storage::selector::select_backend;
pub use storage::{BackendKind, StorageBackend};
pub use types::{
    AiCredits, Collection, CollectionItem, CollectionItemPatch, InvitationStatus, ListQuery,
    MemberRole, Organization, OrganizationInvitation, OrganizationMembership, Page, SavedTab,
    Snapshot, SnapshotInfo, Space, SpacePermission, SubscriptionStatus, TabGroup, User, UserSubscription,
    UserTier, UserWithSubscription,
};
