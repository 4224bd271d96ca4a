//! REST table storage backend
//!
//! Talks to a PostgREST-compatible table API (Supabase) over HTTPS. Tables live
//! at `{base}/rest/v1/{table}`; filters, ordering and paging travel as query
//! parameters. Joins and upserts are emulated client-side.

use crate::config::{StoreConfig, UpsertMode};
use crate::error::{Result, StoreError};
use crate::storage::{BackendKind, StorageBackend};
use crate::types::{
    format_timestamp, new_id, Collection, CollectionItem, CollectionItemPatch, ListQuery,
    MemberRole, Organization, OrganizationInvitation, OrganizationMembership, Snapshot, SnapshotInfo, Space,
    SpacePermission, TabGroup, User, UserTier, UserWithSubscription,
};
use crate::utils::normalize_url;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Query parameters of one request
type Filters = Vec<(&'static str, String)>;

fn eq(value: &str) -> String {
    format!("eq.{}", value)
}

/// Prefix `https://` when the scheme is missing and drop trailing slashes
pub fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{}", trimmed)
    }
}

/// Filters for a parent-scoped listing
fn list_filters(parent_column: &'static str, parent_id: &str, order: &str, query: &ListQuery) -> Filters {
    let mut filters: Filters = vec![(parent_column, eq(parent_id))];
    match query.since {
        None => filters.push(("deleted_at", "is.null".to_string())),
        Some(since) => {
            let since = format_timestamp(&since);
            filters.push((
                "or",
                format!("(updated_at.gt.\"{}\",deleted_at.gt.\"{}\")", since, since),
            ));
        }
    }
    filters.push(("order", order.to_string()));
    if let Some(page) = query.page {
        filters.push(("limit", page.limit().to_string()));
        filters.push(("offset", page.offset().to_string()));
    }
    filters
}

#[derive(Deserialize)]
struct MembershipRef {
    organization_id: String,
}

/// REST table storage backend
pub struct RestStorage {
    client: Client,
    base_url: String,
    upsert_mode: UpsertMode,
    closed: AtomicBool,
}

impl RestStorage {
    /// Create a client for the table API at `base_url`
    pub fn new(base_url: &str, api_key: &str, timeout: Duration, upsert_mode: UpsertMode) -> Result<Self> {
        let api_key = api_key.trim();
        if base_url.trim().is_empty() || api_key.is_empty() {
            return Err(StoreError::Configuration(
                "REST store needs both a base URL and a service key".to_string(),
            ));
        }

        let header = |value: String| {
            HeaderValue::from_str(&value)
                .map_err(|_| StoreError::Configuration("service key is not a valid header value".to_string()))
        };
        let mut headers = HeaderMap::new();
        headers.insert("apikey", header(api_key.to_string())?);
        headers.insert(AUTHORIZATION, header(format!("Bearer {}", api_key))?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("Prefer", HeaderValue::from_static("return=representation"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        let base_url = normalize_base_url(base_url);
        info!("REST storage at {} (upsert mode: {})", base_url, upsert_mode.as_str());

        Ok(Self {
            client,
            base_url,
            upsert_mode,
            closed: AtomicBool::new(false),
        })
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        match (config.rest_url.as_deref(), config.rest_key.as_deref()) {
            (Some(url), Some(key)) => Self::new(url, key, config.rest_timeout(), config.upsert_mode),
            _ => Err(StoreError::Configuration(
                "REST store needs both a base URL and a service key".to_string(),
            )),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn upsert_mode(&self) -> UpsertMode {
        self.upsert_mode
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    /// Send a request and decode the JSON array it answers with
    ///
    /// Any status of 400 or above becomes `StoreError::Http` with the raw body.
    async fn send<T: DeserializeOwned>(&self, operation: &str, request: RequestBuilder) -> Result<Vec<T>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(operation, "storage is closed"));
        }

        let response = request.send().await.map_err(|e| {
            warn!("{} request failed: {}", operation, e);
            StoreError::from(e)
        })?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        if status >= 400 {
            debug!("{} answered {}: {}", operation, status, body);
            return Err(StoreError::Http { status, body });
        }
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn select<T: DeserializeOwned>(&self, operation: &str, table: &str, filters: &Filters) -> Result<Vec<T>> {
        self.send(operation, self.client.get(self.table_url(table)).query(filters))
            .await
    }

    async fn select_one<T: DeserializeOwned>(&self, operation: &str, table: &str, mut filters: Filters) -> Result<Option<T>> {
        filters.push(("limit", "1".to_string()));
        Ok(self.select(operation, table, &filters).await?.into_iter().next())
    }

    async fn insert<T: Serialize + DeserializeOwned>(&self, operation: &str, table: &str, row: &T) -> Result<Vec<T>> {
        self.send(operation, self.client.post(self.table_url(table)).json(row))
            .await
    }

    async fn patch<T: DeserializeOwned>(
        &self,
        operation: &str,
        table: &str,
        filters: &Filters,
        changes: &serde_json::Value,
    ) -> Result<Vec<T>> {
        self.send(
            operation,
            self.client.patch(self.table_url(table)).query(filters).json(changes),
        )
        .await
    }

    /// PATCH that must touch at least one row
    async fn patch_existing(
        &self,
        operation: &str,
        table: &str,
        entity: &'static str,
        id: &str,
        live_only: bool,
        changes: serde_json::Value,
    ) -> Result<()> {
        let mut filters: Filters = vec![("id", eq(id))];
        if live_only {
            filters.push(("deleted_at", "is.null".to_string()));
        }
        let updated: Vec<serde_json::Value> = self.patch(operation, table, &filters, &changes).await?;
        if updated.is_empty() {
            return Err(StoreError::not_found(entity, id));
        }
        Ok(())
    }

    async fn soft_delete(&self, operation: &str, table: &str, entity: &'static str, id: &str) -> Result<()> {
        let now = format_timestamp(&Utc::now());
        self.patch_existing(
            operation,
            table,
            entity,
            id,
            true,
            json!({ "deleted_at": now, "updated_at": now }),
        )
        .await
    }

    /// Insert-or-update keyed on the `key` columns
    ///
    /// `ReadThenWrite` tries a filtered PATCH and POSTs when nothing matched.
    /// Two concurrent writers can both reach the POST. `MergeDuplicates` lets
    /// the server resolve the conflict in a single request.
    async fn upsert<T: Serialize + DeserializeOwned>(
        &self,
        operation: &str,
        table: &str,
        key: &[(&'static str, &str)],
        row: &T,
        changes: serde_json::Value,
    ) -> Result<Vec<T>> {
        match self.upsert_mode {
            UpsertMode::ReadThenWrite => {
                let filters: Filters = key.iter().map(|(column, value)| (*column, eq(value))).collect();
                let updated: Vec<T> = self.patch(operation, table, &filters, &changes).await?;
                if !updated.is_empty() {
                    return Ok(updated);
                }
                debug!("{}: no existing row, inserting", operation);
                self.insert(operation, table, row).await
            }
            UpsertMode::MergeDuplicates => {
                let columns = key.iter().map(|(column, _)| *column).collect::<Vec<_>>().join(",");
                self.send(
                    operation,
                    self.client
                        .post(self.table_url(table))
                        .query(&[("on_conflict", columns)])
                        .header("Prefer", "resolution=merge-duplicates,return=representation")
                        .json(row),
                )
                .await
            }
        }
    }

    async fn fetch_by_id<T: DeserializeOwned>(
        &self,
        operation: &str,
        table: &str,
        entity: &'static str,
        id: &str,
        live_only: bool,
    ) -> Result<T> {
        let mut filters: Filters = vec![("id", eq(id))];
        if live_only {
            filters.push(("deleted_at", "is.null".to_string()));
        }
        self.select_one(operation, table, filters)
            .await?
            .ok_or_else(|| StoreError::not_found(entity, id))
    }
}

#[async_trait]
impl StorageBackend for RestStorage {
    async fn create_user(&self, user: &mut User) -> Result<()> {
        let now = Utc::now();
        if user.id.is_empty() {
            user.id = new_id();
        }
        if user.provider.is_empty() {
            user.provider = "email".to_string();
        }
        user.created_at = now;
        user.updated_at = now;
        self.insert("create_user", "users", &*user).await?;
        Ok(())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<User> {
        self.select_one("get_user_by_email", "users", vec![("email", eq(email))])
            .await?
            .ok_or_else(|| StoreError::not_found("user", email))
    }

    async fn get_user_by_id(&self, id: &str) -> Result<User> {
        self.fetch_by_id("get_user_by_id", "users", "user", id, false).await
    }

    async fn update_user(&self, user: &mut User) -> Result<()> {
        let now = Utc::now();
        let mut changes = json!({
            "name": user.name,
            "avatar": user.avatar,
            "updated_at": format_timestamp(&now),
        });
        if !user.provider.is_empty() {
            changes["provider"] = json!(user.provider);
        }
        self.patch_existing("update_user", "users", "user", &user.id, false, changes)
            .await?;
        user.updated_at = now;
        Ok(())
    }

    async fn update_user_tier(&self, user_id: &str, tier: UserTier) -> Result<()> {
        self.patch_existing(
            "update_user_tier",
            "users",
            "user",
            user_id,
            false,
            json!({ "tier": tier.as_str(), "updated_at": format_timestamp(&Utc::now()) }),
        )
        .await
    }

    async fn delete_user(&self, id: &str) -> Result<()> {
        let deleted: Vec<serde_json::Value> = self
            .send(
                "delete_user",
                self.client.delete(self.table_url("users")).query(&[("id", eq(id))]),
            )
            .await?;
        if deleted.is_empty() {
            return Err(StoreError::not_found("user", id));
        }
        Ok(())
    }

    async fn get_user_with_subscription(&self, user_id: &str) -> Result<UserWithSubscription> {
        self.fetch_by_id("get_user_with_subscription", "users", "user", user_id, false)
            .await
    }

    async fn create_organization(&self, org: &mut Organization) -> Result<()> {
        let now = Utc::now();
        if org.id.is_empty() {
            org.id = new_id();
        }
        org.created_at = now;
        org.updated_at = now;
        self.insert("create_organization", "organizations", &*org).await?;

        let mut owner = OrganizationMembership::new(&org.id, &org.owner_id, MemberRole::Owner);
        owner.id = new_id();
        owner.created_at = now;
        owner.updated_at = now;
        if let Err(e) = self
            .insert("create_organization", "organization_memberships", &owner)
            .await
        {
            warn!(
                "Organization {} created but owner membership for {} failed: {}",
                org.id, org.owner_id, e
            );
            return Err(e);
        }
        Ok(())
    }

    async fn get_organization(&self, id: &str) -> Result<Organization> {
        self.fetch_by_id("get_organization", "organizations", "organization", id, false)
            .await
    }

    async fn update_organization(&self, org: &mut Organization) -> Result<()> {
        let now = Utc::now();
        self.patch_existing(
            "update_organization",
            "organizations",
            "organization",
            &org.id,
            false,
            json!({
                "name": org.name,
                "description": org.description,
                "avatar": org.avatar,
                "color": org.color,
                "updated_at": format_timestamp(&now),
            }),
        )
        .await?;
        org.updated_at = now;
        Ok(())
    }

    async fn list_user_organizations(&self, user_id: &str) -> Result<Vec<Organization>> {
        let operation = "list_user_organizations";
        let mut orgs: Vec<Organization> = self
            .select(operation, "organizations", &vec![("owner_id", eq(user_id))])
            .await?;

        let memberships: Vec<MembershipRef> = self
            .select(
                operation,
                "organization_memberships",
                &vec![
                    ("user_id", eq(user_id)),
                    ("select", "organization_id".to_string()),
                ],
            )
            .await?;

        let mut seen: HashSet<String> = orgs.iter().map(|o| o.id.clone()).collect();
        let missing: Vec<String> = memberships
            .into_iter()
            .map(|m| m.organization_id)
            .filter(|id| seen.insert(id.clone()))
            .collect();

        if !missing.is_empty() {
            let member_of: Vec<Organization> = self
                .select(
                    operation,
                    "organizations",
                    &vec![("id", format!("in.({})", missing.join(",")))],
                )
                .await?;
            orgs.extend(member_of);
        }

        orgs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orgs)
    }

    async fn add_organization_member(&self, membership: &mut OrganizationMembership) -> Result<()> {
        let now = Utc::now();
        if membership.id.is_empty() {
            membership.id = new_id();
        }
        membership.created_at = now;
        membership.updated_at = now;

        let stored = self
            .upsert(
                "add_organization_member",
                "organization_memberships",
                &[
                    ("organization_id", membership.organization_id.as_str()),
                    ("user_id", membership.user_id.as_str()),
                ],
                &*membership,
                json!({ "role": membership.role.as_str(), "updated_at": format_timestamp(&now) }),
            )
            .await?;
        if let Some(row) = stored.into_iter().next() {
            membership.id = row.id;
            membership.created_at = row.created_at;
            membership.updated_at = row.updated_at;
        }
        Ok(())
    }

    async fn list_organization_members(&self, org_id: &str) -> Result<Vec<OrganizationMembership>> {
        self.select(
            "list_organization_members",
            "organization_memberships",
            &vec![
                ("organization_id", eq(org_id)),
                ("order", "created_at.asc".to_string()),
            ],
        )
        .await
    }

    async fn create_space(&self, space: &mut Space) -> Result<()> {
        let now = Utc::now();
        if space.id.is_empty() {
            space.id = new_id();
        }
        space.created_at = now;
        space.updated_at = now;
        space.deleted_at = None;
        self.insert("create_space", "spaces", &*space).await?;
        Ok(())
    }

    async fn get_space(&self, id: &str) -> Result<Space> {
        self.fetch_by_id("get_space", "spaces", "space", id, true).await
    }

    async fn update_space(&self, space: &mut Space) -> Result<()> {
        let now = Utc::now();
        self.patch_existing(
            "update_space",
            "spaces",
            "space",
            &space.id,
            true,
            json!({
                "name": space.name,
                "description": space.description,
                "is_default": space.is_default,
                "updated_at": format_timestamp(&now),
            }),
        )
        .await?;
        space.updated_at = now;
        Ok(())
    }

    async fn delete_space(&self, id: &str) -> Result<()> {
        self.soft_delete("delete_space", "spaces", "space", id).await
    }

    async fn list_spaces_by_organization(&self, org_id: &str, query: &ListQuery) -> Result<Vec<Space>> {
        self.select(
            "list_spaces_by_organization",
            "spaces",
            &list_filters("organization_id", org_id, "created_at.asc", query),
        )
        .await
    }

    async fn set_space_permission(&self, space_id: &str, user_id: &str, can_edit: bool) -> Result<()> {
        let now = Utc::now();
        let permission = SpacePermission {
            id: new_id(),
            space_id: space_id.to_string(),
            user_id: user_id.to_string(),
            can_edit,
            created_at: now,
            updated_at: now,
        };
        self.upsert(
            "set_space_permission",
            "space_permissions",
            &[("space_id", space_id), ("user_id", user_id)],
            &permission,
            json!({ "can_edit": can_edit, "updated_at": format_timestamp(&now) }),
        )
        .await?;
        Ok(())
    }

    async fn get_space_permissions(&self, space_id: &str) -> Result<Vec<SpacePermission>> {
        self.select(
            "get_space_permissions",
            "space_permissions",
            &vec![
                ("space_id", eq(space_id)),
                ("order", "created_at.asc".to_string()),
            ],
        )
        .await
    }

    async fn create_collection(&self, collection: &mut Collection) -> Result<()> {
        let now = Utc::now();
        if collection.id.is_empty() {
            collection.id = new_id();
        }
        collection.created_at = now;
        collection.updated_at = now;
        collection.deleted_at = None;
        self.insert("create_collection", "collections", &*collection).await?;
        Ok(())
    }

    async fn get_collection(&self, id: &str) -> Result<Collection> {
        self.fetch_by_id("get_collection", "collections", "collection", id, true)
            .await
    }

    async fn update_collection(&self, collection: &mut Collection) -> Result<()> {
        let now = Utc::now();
        self.patch_existing(
            "update_collection",
            "collections",
            "collection",
            &collection.id,
            true,
            json!({
                "name": collection.name,
                "description": collection.description,
                "color": collection.color,
                "icon": collection.icon,
                "position": collection.position,
                "updated_at": format_timestamp(&now),
            }),
        )
        .await?;
        collection.updated_at = now;
        Ok(())
    }

    /// Items first, then the collection; not atomic
    async fn delete_collection(&self, id: &str) -> Result<()> {
        let now = format_timestamp(&Utc::now());
        let tombstone = json!({ "deleted_at": now, "updated_at": now });

        let items: Vec<serde_json::Value> = self
            .patch(
                "delete_collection",
                "collection_items",
                &vec![
                    ("collection_id", eq(id)),
                    ("deleted_at", "is.null".to_string()),
                ],
                &tombstone,
            )
            .await?;
        debug!("Marked {} items of collection {} deleted", items.len(), id);

        if let Err(e) = self
            .patch_existing("delete_collection", "collections", "collection", id, true, tombstone)
            .await
        {
            if !items.is_empty() {
                warn!(
                    "Collection {} delete failed after {} items were marked deleted: {}",
                    id,
                    items.len(),
                    e
                );
            }
            return Err(e);
        }
        Ok(())
    }

    async fn list_collections_by_space(&self, space_id: &str, query: &ListQuery) -> Result<Vec<Collection>> {
        self.select(
            "list_collections_by_space",
            "collections",
            &list_filters("space_id", space_id, "position.asc,created_at.asc", query),
        )
        .await
    }

    async fn create_collection_item(&self, item: &mut CollectionItem) -> Result<()> {
        let now = Utc::now();
        if item.id.is_empty() {
            item.id = new_id();
        }
        if item.metadata.is_null() {
            item.metadata = json!({});
        }
        item.created_at = now;
        item.updated_at = now;
        item.deleted_at = None;
        self.insert("create_collection_item", "collection_items", &*item).await?;
        Ok(())
    }

    async fn get_collection_item(&self, id: &str) -> Result<CollectionItem> {
        self.fetch_by_id("get_collection_item", "collection_items", "collection item", id, true)
            .await
    }

    async fn update_collection_item(&self, item: &mut CollectionItem) -> Result<()> {
        let now = Utc::now();
        if item.metadata.is_null() {
            item.metadata = json!({});
        }
        self.patch_existing(
            "update_collection_item",
            "collection_items",
            "collection item",
            &item.id,
            true,
            json!({
                "title": item.title,
                "url": item.url,
                "fav_icon_url": item.fav_icon_url,
                "original_title": item.original_title,
                "ai_generated_title": item.ai_generated_title,
                "domain": item.domain,
                "metadata": item.metadata,
                "position": item.position,
                "updated_at": format_timestamp(&now),
            }),
        )
        .await?;
        item.updated_at = now;
        Ok(())
    }

    async fn update_collection_item_partial(&self, id: &str, patch: &CollectionItemPatch) -> Result<()> {
        let operation = "update_collection_item_partial";
        if patch.is_empty() {
            let found: Option<serde_json::Value> = self
                .select_one(
                    operation,
                    "collection_items",
                    vec![
                        ("id", eq(id)),
                        ("deleted_at", "is.null".to_string()),
                        ("select", "id".to_string()),
                    ],
                )
                .await?;
            return match found {
                Some(_) => Ok(()),
                None => Err(StoreError::not_found("collection item", id)),
            };
        }

        let mut changes = serde_json::Map::new();
        for (column, value) in patch.assignments() {
            changes.insert(column.to_string(), value);
        }
        changes.insert("updated_at".to_string(), json!(format_timestamp(&Utc::now())));

        self.patch_existing(
            operation,
            "collection_items",
            "collection item",
            id,
            true,
            serde_json::Value::Object(changes),
        )
        .await
    }

    async fn delete_collection_item(&self, id: &str) -> Result<()> {
        self.soft_delete("delete_collection_item", "collection_items", "collection item", id)
            .await
    }

    async fn list_items_by_collection(&self, collection_id: &str, query: &ListQuery) -> Result<Vec<CollectionItem>> {
        self.select(
            "list_items_by_collection",
            "collection_items",
            &list_filters("collection_id", collection_id, "position.asc,created_at.asc", query),
        )
        .await
    }

    async fn find_item_by_normalized_url(&self, collection_id: &str, url: &str) -> Result<Option<CollectionItem>> {
        let operation = "find_item_by_normalized_url";
        let normalized = normalize_url(url);
        let live = || -> Filters {
            vec![
                ("collection_id", eq(collection_id)),
                ("deleted_at", "is.null".to_string()),
                ("order", "position.asc,created_at.asc".to_string()),
            ]
        };

        let mut tagged = live();
        tagged.push(("metadata->>normalized_url", eq(&normalized)));
        if let Some(item) = self.select_one(operation, "collection_items", tagged).await? {
            return Ok(Some(item));
        }

        // Items saved without a precomputed tag
        let items: Vec<CollectionItem> = self.select(operation, "collection_items", &live()).await?;
        Ok(items.into_iter().find(|item| normalize_url(&item.url) == normalized))
    }

    async fn create_invitation(&self, invitation: &mut OrganizationInvitation) -> Result<()> {
        let now = Utc::now();
        if invitation.id.is_empty() {
            invitation.id = new_id();
        }
        invitation.prepare_for_insert(now);
        invitation.created_at = now;
        invitation.updated_at = now;
        self.insert("create_invitation", "organization_invitations", &*invitation)
            .await?;
        Ok(())
    }

    async fn get_invitation_by_token(&self, token: &str) -> Result<OrganizationInvitation> {
        self.select_one(
            "get_invitation_by_token",
            "organization_invitations",
            vec![("token", eq(token))],
        )
        .await?
        .ok_or_else(|| StoreError::not_found("invitation", "token"))
    }

    async fn list_invitations_by_email(&self, email: &str) -> Result<Vec<OrganizationInvitation>> {
        self.select(
            "list_invitations_by_email",
            "organization_invitations",
            &vec![
                ("email", eq(&email.trim().to_lowercase())),
                ("order", "created_at.desc".to_string()),
            ],
        )
        .await
    }

    async fn update_invitation(&self, invitation: &mut OrganizationInvitation) -> Result<()> {
        let now = Utc::now();
        self.patch_existing(
            "update_invitation",
            "organization_invitations",
            "invitation",
            &invitation.id,
            false,
            json!({
                "status": invitation.status.as_str(),
                "accepted_by": invitation.accepted_by,
                "expires_at": invitation.expires_at.as_ref().map(format_timestamp),
                "updated_at": format_timestamp(&now),
            }),
        )
        .await?;
        invitation.updated_at = now;
        Ok(())
    }

    async fn save_snapshot(&self, user_id: &str, name: &str, tab_groups: &[TabGroup]) -> Result<()> {
        let now = Utc::now();
        let (group_count, tab_count) = Snapshot::counts(tab_groups);
        let snapshot = Snapshot {
            id: new_id(),
            user_id: user_id.to_string(),
            name: name.to_string(),
            tab_groups: tab_groups.to_vec(),
            group_count,
            tab_count,
            created_at: now,
            updated_at: now,
        };
        self.upsert(
            "save_snapshot",
            "snapshots",
            &[("user_id", user_id), ("name", name)],
            &snapshot,
            json!({
                "tab_groups": tab_groups,
                "group_count": group_count,
                "tab_count": tab_count,
                "updated_at": format_timestamp(&now),
            }),
        )
        .await?;
        info!(
            "Saved snapshot '{}' for user {} ({} groups, {} tabs)",
            name, user_id, group_count, tab_count
        );
        Ok(())
    }

    async fn list_snapshots(&self, user_id: &str) -> Result<Vec<SnapshotInfo>> {
        self.select(
            "list_snapshots",
            "snapshots",
            &vec![
                ("user_id", eq(user_id)),
                ("select", "name,created_at,updated_at,tab_count,group_count".to_string()),
                ("order", "updated_at.desc".to_string()),
            ],
        )
        .await
    }

    async fn load_snapshot(&self, user_id: &str, name: &str) -> Result<Snapshot> {
        self.select_one(
            "load_snapshot",
            "snapshots",
            vec![("user_id", eq(user_id)), ("name", eq(name))],
        )
        .await?
        .ok_or_else(|| StoreError::not_found("snapshot", format!("{}/{}", user_id, name)))
    }

    async fn delete_snapshot(&self, user_id: &str, name: &str) -> Result<()> {
        let deleted: Vec<serde_json::Value> = self
            .send(
                "delete_snapshot",
                self.client
                    .delete(self.table_url("snapshots"))
                    .query(&[("user_id", eq(user_id)), ("name", eq(name))]),
            )
            .await?;
        if deleted.is_empty() {
            return Err(StoreError::not_found("snapshot", format!("{}/{}", user_id, name)));
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("health_check", "storage is closed"));
        }
        let url = format!("{}/rest/v1/", self.base_url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| StoreError::unavailable("health_check", e.to_string()))?;
        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(StoreError::unavailable(
                "health_check",
                format!("table API answered {}", status),
            ));
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!("REST storage closed");
        }
        Ok(())
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::Rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::Page;

    #[test]
    fn test_base_url_normalization() {
        assert_eq!(normalize_base_url("project.supabase.co/"), "https://project.supabase.co");
        assert_eq!(normalize_base_url(" http://localhost:54321// "), "http://localhost:54321");
        assert_eq!(normalize_base_url("https://x.io"), "https://x.io");
    }

    #[test]
    fn test_list_filters_live_view() {
        let filters = list_filters("space_id", "s1", "position.asc", &ListQuery::all());
        assert_eq!(
            filters,
            vec![
                ("space_id", "eq.s1".to_string()),
                ("deleted_at", "is.null".to_string()),
                ("order", "position.asc".to_string()),
            ]
        );
    }

    #[test]
    fn test_list_filters_incremental_and_paged() {
        let since = Utc::now();
        let query = ListQuery::since(since).with_page(Page::new(3, 10));
        let filters = list_filters("collection_id", "c1", "position.asc", &query);
        let stamp = format_timestamp(&since);
        assert!(filters.contains(&(
            "or",
            format!("(updated_at.gt.\"{}\",deleted_at.gt.\"{}\")", stamp, stamp)
        )));
        assert!(!filters.iter().any(|(k, _)| *k == "deleted_at"));
        assert!(filters.contains(&("limit", "10".to_string())));
        assert!(filters.contains(&("offset", "20".to_string())));
    }

    #[test]
    fn test_requires_url_and_key() {
        let err = RestStorage::new("https://x.io", "  ", Duration::from_secs(1), UpsertMode::default())
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);

        let config = StoreConfig {
            rest_url: Some("https://x.io".into()),
            ..Default::default()
        };
        assert!(RestStorage::from_config(&config).is_err());
    }

    #[tokio::test]
    async fn test_billing_is_unsupported() {
        let storage = RestStorage::new("https://x.io", "key", Duration::from_secs(1), UpsertMode::default()).unwrap();
        let err = storage.get_user_subscription("u1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
        assert_eq!(
            storage.consume_ai_credits("u1", 1).await.unwrap_err().kind(),
            ErrorKind::Unsupported
        );
    }

    #[tokio::test]
    async fn test_closed_store_rejects_requests() {
        let storage = RestStorage::new("https://x.io", "key", Duration::from_secs(1), UpsertMode::default()).unwrap();
        storage.close().await.unwrap();
        storage.close().await.unwrap();
        let err = storage.get_user_by_id("u1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unavailable);
    }
}
