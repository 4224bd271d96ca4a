//! Core data types for the TabSync storage layer
//!
//! Plain records for every persisted entity plus the closed enums used for
//! roles, statuses and tiers. The records carry no storage behavior; every
//! backend reads and writes them through the `StorageBackend` contract.
//!
//! Field names match the column names of the relational schema, so the same
//! serde representation is used for REST table rows.

use crate::error::{Result, StoreError};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Days an invitation stays valid when the caller does not set an expiry
pub const DEFAULT_INVITATION_TTL_DAYS: i64 = 14;

/// Largest page size accepted by list operations
pub const MAX_PAGE_SIZE: u32 = 200;

/// Generate a new opaque entity identifier
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Canonical persisted form of a timestamp (RFC 3339, UTC, microseconds)
///
/// Fixed precision keeps lexical and chronological ordering identical, which
/// both the SQL `since` filters and the REST `gt.` filters rely on.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a persisted timestamp
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Database(format!("invalid timestamp '{}': {}", raw, e)))
}

/// Treat an explicit JSON `null` like a missing field
fn null_to_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? } default $default:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                $name::$default
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = StoreError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(StoreError::InvalidInput(format!(
                        "unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

string_enum! {
    /// Role of a user inside an organization
    MemberRole { Owner => "owner", Admin => "admin", Member => "member" } default Member
}

string_enum! {
    /// Invitation lifecycle: pending, then exactly one terminal state
    InvitationStatus {
        Pending => "pending",
        Accepted => "accepted",
        Declined => "declined",
        Expired => "expired",
    } default Pending
}

string_enum! {
    /// Billing tier, mutated by webhook events
    UserTier { Free => "free", Pro => "pro", Power => "power" } default Free
}

string_enum! {
    /// Status of a paid subscription
    SubscriptionStatus {
        Active => "active",
        Canceled => "canceled",
        PastDue => "past_due",
        Unpaid => "unpaid",
        Incomplete => "incomplete",
    } default Active
}

impl InvitationStatus {
    pub fn is_terminal(&self) -> bool {
        match self {
            InvitationStatus::Pending => false,
            InvitationStatus::Accepted | InvitationStatus::Declined | InvitationStatus::Expired => {
                true
            }
        }
    }
}

/// A registered user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct User {
    pub id: String,
    pub email: String,
    /// Empty for OAuth users
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    #[serde(deserialize_with = "null_to_default")]
    pub name: String,
    #[serde(deserialize_with = "null_to_default")]
    pub avatar: String,
    /// "email", "google", "github"
    #[serde(deserialize_with = "null_to_default")]
    pub provider: String,
    #[serde(deserialize_with = "null_to_default")]
    pub tier: UserTier,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            provider: "email".to_string(),
            ..Default::default()
        }
    }
}

/// User joined with billing details
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserWithSubscription {
    #[serde(flatten)]
    pub user: User,
    pub paddle_customer_id: Option<String>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_lifetime_member: bool,
    pub lifetime_member_type: Option<String>,
}

/// A collaborative workspace: one owner plus members
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Organization {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    #[serde(deserialize_with = "null_to_default")]
    pub description: String,
    #[serde(deserialize_with = "null_to_default")]
    pub avatar: String,
    #[serde(deserialize_with = "null_to_default")]
    pub color: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Organization {
    pub fn new(name: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            owner_id: owner_id.into(),
            ..Default::default()
        }
    }
}

/// Links a user to an organization; one row per (organization, user)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrganizationMembership {
    pub id: String,
    pub organization_id: String,
    pub user_id: String,
    pub role: MemberRole,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrganizationMembership {
    pub fn new(
        organization_id: impl Into<String>,
        user_id: impl Into<String>,
        role: MemberRole,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            user_id: user_id.into(),
            role,
            ..Default::default()
        }
    }
}

/// Container of collections under an organization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Space {
    pub id: String,
    pub organization_id: String,
    pub name: String,
    #[serde(deserialize_with = "null_to_default")]
    pub description: String,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Space {
    pub fn new(organization_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Per-member edit capability in a space; one row per (space, user)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpacePermission {
    pub id: String,
    pub space_id: String,
    pub user_id: String,
    pub can_edit: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ordered group of saved items inside a space
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Collection {
    pub id: String,
    pub space_id: String,
    pub name: String,
    #[serde(deserialize_with = "null_to_default")]
    pub description: String,
    #[serde(deserialize_with = "null_to_default")]
    pub color: String,
    #[serde(deserialize_with = "null_to_default")]
    pub icon: String,
    pub position: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Collection {
    pub fn new(space_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            space_id: space_id.into(),
            name: name.into(),
            ..Default::default()
        }
    }
}

/// A saved tab inside a collection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectionItem {
    pub id: String,
    pub collection_id: String,
    #[serde(deserialize_with = "null_to_default")]
    pub title: String,
    #[serde(deserialize_with = "null_to_default")]
    pub url: String,
    #[serde(deserialize_with = "null_to_default")]
    pub fav_icon_url: String,
    #[serde(deserialize_with = "null_to_default")]
    pub original_title: String,
    #[serde(deserialize_with = "null_to_default")]
    pub ai_generated_title: String,
    #[serde(deserialize_with = "null_to_default")]
    pub domain: String,
    /// Opaque client metadata; may carry a precomputed `normalized_url`
    pub metadata: serde_json::Value,
    pub position: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl CollectionItem {
    pub fn new(
        collection_id: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            collection_id: collection_id.into(),
            title: title.into(),
            url: url.into(),
            ..Default::default()
        }
    }

    /// Precomputed normalized URL carried in metadata, if any
    pub fn normalized_url_tag(&self) -> Option<&str> {
        self.metadata.get(NORMALIZED_URL_KEY).and_then(|v| v.as_str())
    }
}

/// Metadata key under which clients store the normalized item URL
pub const NORMALIZED_URL_KEY: &str = "normalized_url";

/// Sparse update of a collection item
///
/// `None` means "leave unchanged". The JSON constructor only recognizes a
/// fixed set of field names and ignores everything else.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectionItemPatch {
    pub title: Option<String>,
    pub url: Option<String>,
    pub fav_icon_url: Option<String>,
    pub original_title: Option<String>,
    pub ai_generated_title: Option<String>,
    pub domain: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub position: Option<i64>,
}

impl CollectionItemPatch {
    /// Field names accepted by [`CollectionItemPatch::from_json_map`]
    pub const FIELDS: [&'static str; 8] = [
        "title",
        "url",
        "fav_icon_url",
        "original_title",
        "ai_generated_title",
        "domain",
        "metadata",
        "position",
    ];

    /// Build a patch from a loosely typed request body
    ///
    /// Unknown keys are ignored so newer clients keep working. Known keys with
    /// a value of the wrong type are rejected.
    pub fn from_json_map(map: &serde_json::Map<String, serde_json::Value>) -> Result<Self> {
        let mut patch = Self::default();
        for (key, value) in map {
            match key.as_str() {
                "title" => patch.title = Some(expect_string(key, value)?),
                "url" => patch.url = Some(expect_string(key, value)?),
                "fav_icon_url" => patch.fav_icon_url = Some(expect_string(key, value)?),
                "original_title" => patch.original_title = Some(expect_string(key, value)?),
                "ai_generated_title" => {
                    patch.ai_generated_title = Some(expect_string(key, value)?)
                }
                "domain" => patch.domain = Some(expect_string(key, value)?),
                "metadata" => patch.metadata = Some(value.clone()),
                "position" => {
                    patch.position = Some(value.as_i64().ok_or_else(|| {
                        StoreError::InvalidInput(format!("field '{}' must be an integer", key))
                    })?)
                }
                _ => {}
            }
        }
        Ok(patch)
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn position(mut self, position: i64) -> Self {
        self.position = Some(position);
        self
    }

    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.url.is_none()
            && self.fav_icon_url.is_none()
            && self.original_title.is_none()
            && self.ai_generated_title.is_none()
            && self.domain.is_none()
            && self.metadata.is_none()
            && self.position.is_none()
    }

    /// Present fields as (column, JSON value) pairs, in declaration order
    pub fn assignments(&self) -> Vec<(&'static str, serde_json::Value)> {
        let mut out = Vec::new();
        let text = |v: &Option<String>| v.as_ref().map(|s| serde_json::Value::String(s.clone()));
        if let Some(v) = text(&self.title) {
            out.push(("title", v));
        }
        if let Some(v) = text(&self.url) {
            out.push(("url", v));
        }
        if let Some(v) = text(&self.fav_icon_url) {
            out.push(("fav_icon_url", v));
        }
        if let Some(v) = text(&self.original_title) {
            out.push(("original_title", v));
        }
        if let Some(v) = text(&self.ai_generated_title) {
            out.push(("ai_generated_title", v));
        }
        if let Some(v) = text(&self.domain) {
            out.push(("domain", v));
        }
        if let Some(v) = &self.metadata {
            out.push(("metadata", v.clone()));
        }
        if let Some(v) = self.position {
            out.push(("position", serde_json::Value::from(v)));
        }
        out
    }
}

fn expect_string(key: &str, value: &serde_json::Value) -> Result<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| StoreError::InvalidInput(format!("field '{}' must be a string", key)))
}

/// Invitation to join an organization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrganizationInvitation {
    pub id: String,
    pub organization_id: String,
    pub email: String,
    pub inviter_id: String,
    /// Unguessable, globally unique
    pub token: String,
    pub status: InvitationStatus,
    /// Filled with the default TTL on create when unset
    pub expires_at: Option<DateTime<Utc>>,
    pub accepted_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OrganizationInvitation {
    pub fn new(
        organization_id: impl Into<String>,
        email: impl Into<String>,
        inviter_id: impl Into<String>,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            email: email.into(),
            inviter_id: inviter_id.into(),
            ..Default::default()
        }
    }

    /// Fill token and expiry before the first insert; the email is stored
    /// trimmed and lowercased
    pub fn prepare_for_insert(&mut self, now: DateTime<Utc>) {
        self.email = self.email.trim().to_lowercase();
        if self.token.is_empty() {
            self.token = crate::utils::generate_invitation_token();
        }
        if self.expires_at.is_none() {
            self.expires_at = Some(now + Duration::days(DEFAULT_INVITATION_TTL_DAYS));
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|at| now > at).unwrap_or(false)
    }

    /// Move to a new status; only pending invitations may change
    pub fn transition(&mut self, to: InvitationStatus) -> Result<()> {
        if self.status.is_terminal() {
            return Err(StoreError::InvalidInput(format!(
                "invitation {} is already {}",
                self.id, self.status
            )));
        }
        if to == InvitationStatus::Pending {
            return Err(StoreError::InvalidInput(
                "invitation cannot move back to pending".to_string(),
            ));
        }
        self.status = to;
        Ok(())
    }

    /// Accept on behalf of an authenticated user
    ///
    /// The user's email must match the invited address (case-insensitive).
    /// An invitation past its expiry is marked expired and rejected.
    pub fn accept(&mut self, user: &User, now: DateTime<Utc>) -> Result<()> {
        if self.status == InvitationStatus::Pending && self.is_expired(now) {
            self.transition(InvitationStatus::Expired)?;
            return Err(StoreError::InvalidInput(format!(
                "invitation {} has expired",
                self.id
            )));
        }
        if !self.email.trim().eq_ignore_ascii_case(user.email.trim()) {
            return Err(StoreError::InvalidInput(format!(
                "invitation {} was issued to a different email",
                self.id
            )));
        }
        self.transition(InvitationStatus::Accepted)?;
        self.accepted_by = Some(user.id.clone());
        Ok(())
    }
}

/// Browser tab saved inside a tab group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SavedTab {
    pub id: String,
    pub title: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fav_icon_url: Option<String>,
    pub original_title: String,
    pub domain: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl SavedTab {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            title: title.into(),
            url: url.into(),
            created_at: Utc::now(),
            ..Default::default()
        }
    }
}

/// Group of tabs as stored inside a snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TabGroup {
    pub id: String,
    pub user_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tabs: Vec<SavedTab>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub auto_classify: bool,
    pub classification_rules: Vec<String>,
}

impl TabGroup {
    pub fn new(name: impl Into<String>, tabs: Vec<SavedTab>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            name: name.into(),
            created_at: now,
            updated_at: now,
            tabs,
            ..Default::default()
        }
    }
}

/// Named snapshot of a user's tab groups; one per (user, name)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Snapshot {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub tab_groups: Vec<TabGroup>,
    pub group_count: i64,
    pub tab_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Snapshot {
    /// Derived (group_count, tab_count) aggregates
    pub fn counts(tab_groups: &[TabGroup]) -> (i64, i64) {
        let tabs: usize = tab_groups.iter().map(|g| g.tabs.len()).sum();
        (tab_groups.len() as i64, tabs as i64)
    }
}

/// Snapshot listing entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tab_count: i64,
    pub group_count: i64,
}

/// Paid subscription of a user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserSubscription {
    pub id: String,
    pub user_id: String,
    pub plan_id: String,
    pub paddle_subscription_id: Option<String>,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// AI credit balance for a billing period
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiCredits {
    pub id: String,
    pub user_id: String,
    pub credits_total: i64,
    pub credits_used: i64,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AiCredits {
    pub fn credits_remaining(&self) -> i64 {
        (self.credits_total - self.credits_used).max(0)
    }
}

/// Page selector for list operations (1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub page: u32,
    pub page_size: u32,
}

impl Page {
    /// Clamp into the accepted range: page >= 1, 1 <= page_size <= MAX_PAGE_SIZE
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page: page.max(1),
            page_size: page_size.clamp(1, MAX_PAGE_SIZE),
        }
    }

    pub fn offset(&self) -> u64 {
        // page 0 reads as the first page
        u64::from(self.page.saturating_sub(1)) * u64::from(self.page_size)
    }

    pub fn limit(&self) -> u64 {
        u64::from(self.page_size)
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(1, 20)
    }
}

/// Options for parent-scoped list operations
///
/// Without `since` only live rows are returned. With `since` the result is the
/// incremental view: rows updated after the cutoff plus tombstones deleted
/// after it.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ListQuery {
    pub since: Option<DateTime<Utc>>,
    pub page: Option<Page>,
}

impl ListQuery {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn since(since: DateTime<Utc>) -> Self {
        Self {
            since: Some(since),
            page: None,
        }
    }

    pub fn with_page(mut self, page: Page) -> Self {
        self.page = Some(page);
        self
    }

    /// Whether a row with these timestamps belongs in the result
    pub fn includes(&self, updated_at: &DateTime<Utc>, deleted_at: Option<&DateTime<Utc>>) -> bool {
        match self.since {
            None => deleted_at.is_none(),
            Some(since) => *updated_at > since || deleted_at.map(|d| *d > since).unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_enum_round_trip_strings() {
        assert_eq!("admin".parse::<MemberRole>().unwrap(), MemberRole::Admin);
        assert_eq!(InvitationStatus::Declined.as_str(), "declined");
        assert_eq!(
            serde_json::to_value(SubscriptionStatus::PastDue).unwrap(),
            json!("past_due")
        );
        assert!("superuser".parse::<MemberRole>().is_err());
    }

    #[test]
    fn test_patch_from_json_ignores_unknown_fields() {
        let body = json!({
            "title": "Docs",
            "position": 3,
            "collection_id": "should-be-ignored",
            "future_field": {"nested": true}
        });
        let patch = CollectionItemPatch::from_json_map(body.as_object().unwrap()).unwrap();
        assert_eq!(patch.title.as_deref(), Some("Docs"));
        assert_eq!(patch.position, Some(3));
        assert!(patch.url.is_none());
        assert_eq!(patch.assignments().len(), 2);
    }

    #[test]
    fn test_patch_rejects_wrong_types() {
        let body = json!({ "position": "first" });
        let err = CollectionItemPatch::from_json_map(body.as_object().unwrap()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_empty_patch() {
        let patch = CollectionItemPatch::default();
        assert!(patch.is_empty());
        assert!(patch.assignments().is_empty());
        assert!(!CollectionItemPatch::default().title("x").is_empty());
    }

    #[test]
    fn test_snapshot_counts() {
        let groups = vec![
            TabGroup::new("a", vec![SavedTab::new("1", "https://a"), SavedTab::new("2", "https://b")]),
            TabGroup::new("b", vec![SavedTab::new("3", "https://c")]),
        ];
        assert_eq!(Snapshot::counts(&groups), (2, 3));
        assert_eq!(Snapshot::counts(&[]), (0, 0));
    }

    #[test]
    fn test_invitation_defaults_and_accept() {
        let now = Utc::now();
        let mut inv = OrganizationInvitation::new("o1", "a@b.com", "u1");
        inv.prepare_for_insert(now);
        assert!(!inv.token.is_empty());
        assert_eq!(inv.expires_at, Some(now + Duration::days(14)));

        let mut intruder = User::new("c@d.com");
        intruder.id = "u2".into();
        assert!(inv.accept(&intruder, now).is_err());
        assert_eq!(inv.status, InvitationStatus::Pending);

        let mut invitee = User::new("A@B.com");
        invitee.id = "u3".into();
        inv.accept(&invitee, now).unwrap();
        assert_eq!(inv.status, InvitationStatus::Accepted);
        assert_eq!(inv.accepted_by.as_deref(), Some("u3"));

        // terminal
        assert!(inv.transition(InvitationStatus::Declined).is_err());
    }

    #[test]
    fn test_expired_invitation_cannot_be_accepted() {
        let now = Utc::now();
        let mut inv = OrganizationInvitation::new("o1", "a@b.com", "u1");
        inv.expires_at = Some(now - Duration::minutes(1));
        let mut user = User::new("a@b.com");
        user.id = "u2".into();
        assert!(inv.accept(&user, now).is_err());
        assert_eq!(inv.status, InvitationStatus::Expired);
    }

    #[test]
    fn test_list_query_includes() {
        let t0 = Utc::now();
        let later = t0 + Duration::seconds(5);
        assert!(ListQuery::all().includes(&t0, None));
        assert!(!ListQuery::all().includes(&t0, Some(&later)));
        assert!(ListQuery::since(t0).includes(&later, Some(&later)));
        assert!(!ListQuery::since(later).includes(&t0, None));
    }

    #[test]
    fn test_page_offsets() {
        assert_eq!(Page::new(3, 10).offset(), 20);
        assert_eq!(Page::new(0, 500).limit(), u64::from(MAX_PAGE_SIZE));
        let literal = Page { page: 0, page_size: 10 };
        assert_eq!(literal.offset(), 0);
        assert_eq!(literal.limit(), 10);
    }

    #[test]
    fn test_rest_row_with_nulls_deserializes() {
        let row = json!({
            "id": "c1",
            "space_id": "s1",
            "name": "Reading",
            "description": null,
            "color": null,
            "icon": null,
            "position": 0,
            "created_at": "2024-05-01T10:00:00.000000Z",
            "updated_at": "2024-05-01T10:00:00+00:00",
            "deleted_at": null
        });
        let c: Collection = serde_json::from_value(row).unwrap();
        assert_eq!(c.description, "");
        assert!(c.deleted_at.is_none());
    }

    #[test]
    fn test_timestamp_format_is_fixed_width() {
        let ts = parse_timestamp("2024-05-01T10:00:00Z").unwrap();
        assert_eq!(format_timestamp(&ts), "2024-05-01T10:00:00.000000Z");
    }
}
