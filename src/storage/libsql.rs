//! LibSQL storage backend implementation
//!
//! Structured store over Turso/libSQL: local files, in-memory databases and
//! remote `libsql://` / `https://` endpoints. Connections come from a bounded
//! `deadpool` pool; the schema is applied from embedded migrations on open.

use crate::config::{redact_dsn, PoolSettings};
use crate::error::{Result, StoreError};
use crate::storage::pool::{PoolStatus, SqlPool};
use crate::storage::{BackendKind, StorageBackend};
use crate::types::{
    format_timestamp, new_id, parse_timestamp, AiCredits, Collection, CollectionItem,
    CollectionItemPatch, ListQuery, Organization, OrganizationInvitation,
    OrganizationMembership, Snapshot, SnapshotInfo, Space, SpacePermission, SubscriptionStatus,
    TabGroup, User, UserSubscription, UserTier, UserWithSubscription, NORMALIZED_URL_KEY,
};
use crate::utils::normalize_url;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::params::{IntoParams, Params};
use libsql::{params, Builder, Connection, Database, Row, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Embedded schema migrations, applied in order
const MIGRATIONS: &[(&str, &str)] = &[(
    "001_initial_schema.sql",
    include_str!("../../migrations/libsql/001_initial_schema.sql"),
)];

/// Tables created by the schema, in dependency order
pub const SCHEMA_TABLES: [&str; 11] = [
    "users",
    "organizations",
    "organization_memberships",
    "organization_invitations",
    "spaces",
    "space_permissions",
    "collections",
    "collection_items",
    "snapshots",
    "user_subscriptions",
    "ai_credits",
];

const USER_COLUMNS: &str = "id, email, password_hash, name, avatar, provider, tier, created_at, updated_at";
const ORG_COLUMNS: &str = "id, name, owner_id, description, avatar, color, created_at, updated_at";
const MEMBERSHIP_COLUMNS: &str = "id, organization_id, user_id, role, created_at, updated_at";
const SPACE_COLUMNS: &str =
    "id, organization_id, name, description, is_default, created_at, updated_at, deleted_at";
const PERMISSION_COLUMNS: &str = "id, space_id, user_id, can_edit, created_at, updated_at";
const COLLECTION_COLUMNS: &str =
    "id, space_id, name, description, color, icon, position, created_at, updated_at, deleted_at";
const ITEM_COLUMNS: &str = "id, collection_id, title, url, fav_icon_url, original_title, \
    ai_generated_title, domain, metadata, position, created_at, updated_at, deleted_at";
const INVITATION_COLUMNS: &str = "id, organization_id, email, inviter_id, token, status, \
    expires_at, accepted_by, created_at, updated_at";
const SNAPSHOT_COLUMNS: &str =
    "id, user_id, name, tab_groups, group_count, tab_count, created_at, updated_at";
const SUBSCRIPTION_COLUMNS: &str = "id, user_id, plan_id, paddle_subscription_id, status, \
    current_period_start, current_period_end, cancel_at_period_end, canceled_at, created_at, updated_at";
const CREDITS_COLUMNS: &str =
    "id, user_id, credits_total, credits_used, period_start, period_end, created_at, updated_at";

/// Parse SQL file into individual statements, handling multi-line constructs like triggers
fn parse_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut depth: i32 = 0;

    for line in sql.lines() {
        let trimmed = line.trim();

        if current.is_empty() && (trimmed.is_empty() || trimmed.starts_with("--")) {
            continue;
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);

        let upper = trimmed.to_uppercase();
        if upper.starts_with("BEGIN") || upper.ends_with(" BEGIN") {
            depth += 1;
        }
        if upper.starts_with("END") {
            depth = depth.saturating_sub(1);
        }

        if trimmed.ends_with(';') && depth == 0 {
            statements.push(current.clone());
            current.clear();
        }
    }

    if !current.trim().is_empty() {
        statements.push(current);
    }

    statements
}

/// Database connection mode
#[derive(Clone, PartialEq, Eq)]
pub enum ConnectionMode {
    /// In-memory database (for testing)
    InMemory,
    /// Local file-based database
    Local(String),
    /// Remote database (Turso Cloud or sqld)
    Remote { url: String, token: String },
}

impl fmt::Debug for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionMode::InMemory => write!(f, "InMemory"),
            ConnectionMode::Local(path) => write!(f, "Local({})", path),
            ConnectionMode::Remote { url, .. } => write!(f, "Remote({})", redact_dsn(url)),
        }
    }
}

impl ConnectionMode {
    /// Parse a DSN
    ///
    /// - `:memory:` → in-memory
    /// - `libsql://`, `https://`, `http://`, `ws://`, `wss://` → remote; the
    ///   token comes from `auth_token` or the DSN's `authToken` parameter
    /// - `file:<path>` or a bare path → local file
    pub fn from_dsn(dsn: &str, auth_token: Option<&str>) -> Result<Self> {
        let dsn = dsn.trim();
        if dsn.is_empty() {
            return Err(StoreError::Configuration("database URL is empty".to_string()));
        }
        if dsn == ":memory:" {
            return Ok(ConnectionMode::InMemory);
        }

        let lower = dsn.to_lowercase();
        let remote = ["libsql://", "https://", "http://", "wss://", "ws://"]
            .iter()
            .any(|scheme| lower.starts_with(scheme));

        if remote {
            let (base, query) = dsn.split_once('?').unwrap_or((dsn, ""));
            let mut dsn_token = None;
            let mut kept = Vec::new();
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                match pair.strip_prefix("authToken=") {
                    Some(token) => dsn_token = Some(token.to_string()),
                    None => kept.push(pair),
                }
            }
            let url = if kept.is_empty() {
                base.to_string()
            } else {
                format!("{}?{}", base, kept.join("&"))
            };
            let token = auth_token
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .or(dsn_token)
                .unwrap_or_default();
            return Ok(ConnectionMode::Remote { url, token });
        }

        let path = dsn
            .strip_prefix("file://")
            .or_else(|| dsn.strip_prefix("file:"))
            .unwrap_or(dsn);
        if path.is_empty() {
            return Err(StoreError::Configuration(format!("invalid database URL '{}'", dsn)));
        }
        Ok(ConnectionMode::Local(path.to_string()))
    }

    /// Strategies to try, in order
    pub fn strategies(&self) -> Vec<ConnectStrategy> {
        match self {
            ConnectionMode::InMemory | ConnectionMode::Local(_) => vec![ConnectStrategy::Local],
            ConnectionMode::Remote { .. } => vec![
                ConnectStrategy::Secure,
                ConnectStrategy::Timeout,
                ConnectStrategy::Raw,
            ],
        }
    }

    fn describe(&self) -> String {
        format!("{:?}", self)
    }
}

/// One way of opening the database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStrategy {
    /// Local file or in-memory database
    Local,
    /// Remote with the scheme forced to `https`, bounded connect time
    Secure,
    /// Remote DSN as given, bounded connect time
    Timeout,
    /// Remote DSN as given, no explicit timeout
    Raw,
}

impl ConnectStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectStrategy::Local => "local",
            ConnectStrategy::Secure => "secure",
            ConnectStrategy::Timeout => "timeout",
            ConnectStrategy::Raw => "raw",
        }
    }

    fn bounded(&self) -> bool {
        !matches!(self, ConnectStrategy::Raw)
    }
}

impl fmt::Display for ConnectStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rewrite a remote URL to `https`
fn force_https(url: &str) -> String {
    match url.split_once("://") {
        Some((_, rest)) => format!("https://{}", rest),
        None => format!("https://{}", url),
    }
}

/// LibSQL storage backend
pub struct LibsqlStorage {
    pool: SqlPool,
    strategy: ConnectStrategy,
    closed: AtomicBool,
}

impl LibsqlStorage {
    /// Open from a DSN with default pool settings
    pub async fn from_dsn(dsn: &str, auth_token: Option<&str>) -> Result<Self> {
        Self::new(ConnectionMode::from_dsn(dsn, auth_token)?, &PoolSettings::default()).await
    }

    /// Open the database, trying each connection strategy in turn
    ///
    /// The first strategy whose database opens, answers `SELECT 1` and accepts
    /// the schema wins. If none does the error is fatal.
    pub async fn new(mode: ConnectionMode, settings: &PoolSettings) -> Result<Self> {
        info!("Connecting to LibSQL database: {}", mode.describe());

        let mut failures = Vec::new();
        for strategy in mode.strategies() {
            match Self::open_with(&mode, strategy, settings).await {
                Ok(storage) => {
                    info!("LibSQL database ready (strategy: {})", strategy);
                    return Ok(storage);
                }
                Err(e) => {
                    warn!("Connection strategy '{}' failed: {}", strategy, e);
                    failures.push(format!("{}: {}", strategy, e));
                }
            }
        }

        Err(StoreError::Configuration(format!(
            "could not open database {} ({})",
            mode.describe(),
            failures.join("; ")
        )))
    }

    async fn open_with(
        mode: &ConnectionMode,
        strategy: ConnectStrategy,
        settings: &PoolSettings,
    ) -> Result<Self> {
        let open = async {
            let db = Self::build_database(mode, strategy).await?;
            let pool = SqlPool::new(
                db,
                settings,
                matches!(mode, ConnectionMode::InMemory),
                !matches!(mode, ConnectionMode::Remote { .. }),
            )?;
            let storage = Self {
                pool,
                strategy,
                closed: AtomicBool::new(false),
            };
            storage.verify_database_health().await?;
            Ok::<_, StoreError>(storage)
        };

        let storage = if strategy.bounded() {
            tokio::time::timeout(settings.connect_timeout(), open)
                .await
                .map_err(|_| {
                    StoreError::unavailable(
                        "connect",
                        format!("no answer within {:?}", settings.connect_timeout()),
                    )
                })??
        } else {
            open.await?
        };

        storage.run_migrations().await?;
        Ok(storage)
    }

    async fn build_database(mode: &ConnectionMode, strategy: ConnectStrategy) -> Result<Database> {
        let db = match mode {
            ConnectionMode::InMemory => Builder::new_local(":memory:")
                .build()
                .await
                .map_err(|e| StoreError::Database(format!("Failed to create in-memory database: {}", e)))?,
            ConnectionMode::Local(path) => {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent).map_err(|e| {
                            StoreError::Database(format!(
                                "Failed to create database directory {}: {}",
                                parent.display(),
                                e
                            ))
                        })?;
                    }
                }
                Builder::new_local(path)
                    .build()
                    .await
                    .map_err(|e| StoreError::Database(format!("Failed to create local database: {}", e)))?
            }
            ConnectionMode::Remote { url, token } => {
                let url = match strategy {
                    ConnectStrategy::Secure => force_https(url),
                    _ => url.clone(),
                };
                Builder::new_remote(url, token.clone())
                    .build()
                    .await
                    .map_err(|e| StoreError::Database(format!("Failed to create remote database: {}", e)))?
            }
        };
        Ok(db)
    }

    /// Verify the database answers before running migrations
    async fn verify_database_health(&self) -> Result<()> {
        let conn = self.pool.get("connect").await?;
        conn.query("SELECT 1", params![]).await.map_err(|e| {
            StoreError::unavailable("connect", format!("database did not answer: {}", e))
        })?;
        debug!("Database health check passed");
        Ok(())
    }

    /// Apply embedded migrations that have not run yet
    pub async fn run_migrations(&self) -> Result<()> {
        info!("Running database migrations...");
        let conn = self.pool.get("migrate").await?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS _migrations_applied (
                migration_name TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL
            )",
            params![],
        )
        .await
        .map_err(|e| StoreError::Database(format!("Failed to create migrations table: {}", e)))?;

        for (name, sql) in MIGRATIONS {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM _migrations_applied WHERE migration_name = ?",
                    params![*name],
                )
                .await?;
            let applied = match rows.next().await? {
                Some(row) => row.get::<i64>(0)?,
                None => 0,
            };
            if applied > 0 {
                debug!("Skipping already applied migration: {}", name);
                continue;
            }

            let statements = parse_sql_statements(sql);
            debug!("Parsed {} statements from {}", statements.len(), name);
            for (i, statement) in statements.iter().enumerate() {
                conn.execute(statement.trim(), params![]).await.map_err(|e| {
                    StoreError::Database(format!(
                        "Failed to execute statement #{} in {}: {}",
                        i + 1,
                        name,
                        e
                    ))
                })?;
            }

            conn.execute(
                "INSERT INTO _migrations_applied (migration_name, applied_at) VALUES (?, ?)",
                params![*name, format_timestamp(&Utc::now())],
            )
            .await
            .map_err(|e| StoreError::Database(format!("Failed to record migration: {}", e)))?;

            info!("Executed migration: {}", name);
        }

        info!("Database migrations completed");
        Ok(())
    }

    /// Row counts per schema table; fails if a table is missing
    pub async fn table_counts(&self) -> Result<Vec<(&'static str, i64)>> {
        let conn = self.conn("table_counts").await?;
        let mut counts = Vec::with_capacity(SCHEMA_TABLES.len());
        for table in SCHEMA_TABLES {
            let mut rows = conn
                .query(&format!("SELECT COUNT(*) FROM {}", table), params![])
                .await
                .map_err(|e| StoreError::Database(format!("table '{}' is not usable: {}", table, e)))?;
            let count = match rows.next().await? {
                Some(row) => row.get::<i64>(0)?,
                None => 0,
            };
            counts.push((table, count));
        }
        Ok(counts)
    }

    /// Strategy that opened the database
    pub fn strategy(&self) -> ConnectStrategy {
        self.strategy
    }

    pub fn pool_status(&self) -> PoolStatus {
        self.pool.status()
    }

    fn ensure_open(&self, operation: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable(operation, "storage is closed"));
        }
        Ok(())
    }

    async fn conn(&self, operation: &str) -> Result<crate::storage::pool::PooledConnection> {
        self.ensure_open(operation)?;
        self.pool.get(operation).await
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

/// Classify a failed statement, naming the operation
fn sql_err(operation: &'static str) -> impl Fn(libsql::Error) -> StoreError {
    move |e| match StoreError::from(e) {
        StoreError::Conflict { message, .. } => StoreError::conflict(operation, message),
        other => other.context(operation),
    }
}

fn ts(row: &Row, idx: i32) -> Result<DateTime<Utc>> {
    parse_timestamp(&row.get::<String>(idx)?)
}

fn opt_ts(row: &Row, idx: i32) -> Result<Option<DateTime<Utc>>> {
    row.get::<Option<String>>(idx)?
        .map(|raw| parse_timestamp(&raw))
        .transpose()
}

fn opt_ts_value(value: Option<&DateTime<Utc>>) -> Value {
    match value {
        Some(ts) => Value::Text(format_timestamp(ts)),
        None => Value::Null,
    }
}

fn opt_text(value: Option<&String>) -> Value {
    match value {
        Some(s) => Value::Text(s.clone()),
        None => Value::Null,
    }
}

fn flag(row: &Row, idx: i32) -> Result<bool> {
    Ok(row.get::<i64>(idx)? != 0)
}

fn row_to_user(row: &Row) -> Result<User> {
    Ok(User {
        id: row.get(0)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
        name: row.get(3)?,
        avatar: row.get(4)?,
        provider: row.get(5)?,
        tier: row.get::<String>(6)?.parse()?,
        created_at: ts(row, 7)?,
        updated_at: ts(row, 8)?,
    })
}

fn row_to_organization(row: &Row) -> Result<Organization> {
    Ok(Organization {
        id: row.get(0)?,
        name: row.get(1)?,
        owner_id: row.get(2)?,
        description: row.get(3)?,
        avatar: row.get(4)?,
        color: row.get(5)?,
        created_at: ts(row, 6)?,
        updated_at: ts(row, 7)?,
    })
}

fn row_to_membership(row: &Row) -> Result<OrganizationMembership> {
    Ok(OrganizationMembership {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        user_id: row.get(2)?,
        role: row.get::<String>(3)?.parse()?,
        created_at: ts(row, 4)?,
        updated_at: ts(row, 5)?,
    })
}

fn row_to_space(row: &Row) -> Result<Space> {
    Ok(Space {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        is_default: flag(row, 4)?,
        created_at: ts(row, 5)?,
        updated_at: ts(row, 6)?,
        deleted_at: opt_ts(row, 7)?,
    })
}

fn row_to_permission(row: &Row) -> Result<SpacePermission> {
    Ok(SpacePermission {
        id: row.get(0)?,
        space_id: row.get(1)?,
        user_id: row.get(2)?,
        can_edit: flag(row, 3)?,
        created_at: ts(row, 4)?,
        updated_at: ts(row, 5)?,
    })
}

fn row_to_collection(row: &Row) -> Result<Collection> {
    Ok(Collection {
        id: row.get(0)?,
        space_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        color: row.get(4)?,
        icon: row.get(5)?,
        position: row.get(6)?,
        created_at: ts(row, 7)?,
        updated_at: ts(row, 8)?,
        deleted_at: opt_ts(row, 9)?,
    })
}

fn row_to_item(row: &Row) -> Result<CollectionItem> {
    let metadata: String = row.get(8)?;
    Ok(CollectionItem {
        id: row.get(0)?,
        collection_id: row.get(1)?,
        title: row.get(2)?,
        url: row.get(3)?,
        fav_icon_url: row.get(4)?,
        original_title: row.get(5)?,
        ai_generated_title: row.get(6)?,
        domain: row.get(7)?,
        metadata: serde_json::from_str(&metadata)?,
        position: row.get(9)?,
        created_at: ts(row, 10)?,
        updated_at: ts(row, 11)?,
        deleted_at: opt_ts(row, 12)?,
    })
}

fn row_to_invitation(row: &Row) -> Result<OrganizationInvitation> {
    Ok(OrganizationInvitation {
        id: row.get(0)?,
        organization_id: row.get(1)?,
        email: row.get(2)?,
        inviter_id: row.get(3)?,
        token: row.get(4)?,
        status: row.get::<String>(5)?.parse()?,
        expires_at: opt_ts(row, 6)?,
        accepted_by: row.get(7)?,
        created_at: ts(row, 8)?,
        updated_at: ts(row, 9)?,
    })
}

fn row_to_snapshot(row: &Row) -> Result<Snapshot> {
    let tab_groups: String = row.get(3)?;
    Ok(Snapshot {
        id: row.get(0)?,
        user_id: row.get(1)?,
        name: row.get(2)?,
        tab_groups: serde_json::from_str(&tab_groups)?,
        group_count: row.get(4)?,
        tab_count: row.get(5)?,
        created_at: ts(row, 6)?,
        updated_at: ts(row, 7)?,
    })
}

fn row_to_subscription(row: &Row) -> Result<UserSubscription> {
    Ok(UserSubscription {
        id: row.get(0)?,
        user_id: row.get(1)?,
        plan_id: row.get(2)?,
        paddle_subscription_id: row.get(3)?,
        status: row.get::<String>(4)?.parse()?,
        current_period_start: opt_ts(row, 5)?,
        current_period_end: opt_ts(row, 6)?,
        cancel_at_period_end: flag(row, 7)?,
        canceled_at: opt_ts(row, 8)?,
        created_at: ts(row, 9)?,
        updated_at: ts(row, 10)?,
    })
}

fn row_to_credits(row: &Row) -> Result<AiCredits> {
    Ok(AiCredits {
        id: row.get(0)?,
        user_id: row.get(1)?,
        credits_total: row.get(2)?,
        credits_used: row.get(3)?,
        period_start: ts(row, 4)?,
        period_end: ts(row, 5)?,
        created_at: ts(row, 6)?,
        updated_at: ts(row, 7)?,
    })
}

async fn fetch_all<T>(
    conn: &Connection,
    sql: &str,
    params: impl IntoParams + Send,
    map: fn(&Row) -> Result<T>,
) -> Result<Vec<T>> {
    let mut rows = conn.query(sql, params).await?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        out.push(map(&row)?);
    }
    Ok(out)
}

async fn fetch_one<T>(
    conn: &Connection,
    sql: &str,
    params: impl IntoParams + Send,
    map: fn(&Row) -> Result<T>,
) -> Result<Option<T>> {
    let mut rows = conn.query(sql, params).await?;
    match rows.next().await? {
        Some(row) => Ok(Some(map(&row)?)),
        None => Ok(None),
    }
}

/// Filter, order and page clauses for parent-scoped listings
fn list_sql(
    columns: &str,
    table: &str,
    parent_column: &str,
    parent_id: &str,
    order_by: &str,
    query: &ListQuery,
) -> (String, Params) {
    let mut values = vec![Value::Text(parent_id.to_string())];
    let mut sql = format!("SELECT {} FROM {} WHERE {} = ?", columns, table, parent_column);

    match query.since {
        None => sql.push_str(" AND deleted_at IS NULL"),
        Some(since) => {
            let since = format_timestamp(&since);
            sql.push_str(" AND (updated_at > ? OR deleted_at > ?)");
            values.push(Value::Text(since.clone()));
            values.push(Value::Text(since));
        }
    }

    sql.push_str(" ORDER BY ");
    sql.push_str(order_by);

    if let Some(page) = query.page {
        sql.push_str(" LIMIT ? OFFSET ?");
        values.push(Value::Integer(page.limit() as i64));
        values.push(Value::Integer(page.offset() as i64));
    }

    (sql, Params::Positional(values))
}

/// Soft delete a live row; `false` when nothing matched
async fn soft_delete(conn: &Connection, table: &str, id: &str, now: &str) -> Result<bool> {
    let affected = conn
        .execute(
            &format!(
                "UPDATE {} SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
                table
            ),
            params![now, now, id],
        )
        .await?;
    Ok(affected > 0)
}

/// Mark a collection and its live items deleted
async fn cascade_delete_collection(conn: &Connection, id: &str, now: &str) -> Result<u64> {
    if !soft_delete(conn, "collections", id, now).await? {
        return Err(StoreError::not_found("collection", id));
    }
    let items = conn
        .execute(
            "UPDATE collection_items SET deleted_at = ?, updated_at = ?
             WHERE collection_id = ? AND deleted_at IS NULL",
            params![now, now, id],
        )
        .await?;
    Ok(items)
}

#[async_trait]
impl StorageBackend for LibsqlStorage {
    async fn create_user(&self, user: &mut User) -> Result<()> {
        let conn = self.conn("create_user").await?;
        let now = Utc::now();
        if user.id.is_empty() {
            user.id = new_id();
        }
        if user.provider.is_empty() {
            user.provider = "email".to_string();
        }
        user.created_at = now;
        user.updated_at = now;
        debug!("Creating user: {}", user.id);

        conn.execute(
            &format!("INSERT INTO users ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)", USER_COLUMNS),
            params![
                user.id.clone(),
                user.email.clone(),
                user.password_hash.clone(),
                user.name.clone(),
                user.avatar.clone(),
                user.provider.clone(),
                user.tier.as_str(),
                format_timestamp(&now),
                format_timestamp(&now),
            ],
        )
        .await
        .map_err(sql_err("create_user"))?;
        Ok(())
    }

    async fn get_user_by_email(&self, email: &str) -> Result<User> {
        let conn = self.conn("get_user_by_email").await?;
        fetch_one(
            &conn,
            &format!("SELECT {} FROM users WHERE email = ?", USER_COLUMNS),
            params![email],
            row_to_user,
        )
        .await?
        .ok_or_else(|| StoreError::not_found("user", email))
    }

    async fn get_user_by_id(&self, id: &str) -> Result<User> {
        let conn = self.conn("get_user_by_id").await?;
        fetch_one(
            &conn,
            &format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS),
            params![id],
            row_to_user,
        )
        .await?
        .ok_or_else(|| StoreError::not_found("user", id))
    }

    async fn update_user(&self, user: &mut User) -> Result<()> {
        let conn = self.conn("update_user").await?;
        let now = Utc::now();
        let affected = conn
            .execute(
                "UPDATE users
                 SET name = ?, avatar = ?, provider = COALESCE(NULLIF(?, ''), provider), updated_at = ?
                 WHERE id = ?",
                params![
                    user.name.clone(),
                    user.avatar.clone(),
                    user.provider.clone(),
                    format_timestamp(&now),
                    user.id.clone(),
                ],
            )
            .await
            .map_err(sql_err("update_user"))?;
        if affected == 0 {
            return Err(StoreError::not_found("user", user.id.clone()));
        }
        user.updated_at = now;
        Ok(())
    }

    async fn update_user_tier(&self, user_id: &str, tier: UserTier) -> Result<()> {
        let conn = self.conn("update_user_tier").await?;
        let affected = conn
            .execute(
                "UPDATE users SET tier = ?, updated_at = ? WHERE id = ?",
                params![tier.as_str(), format_timestamp(&Utc::now()), user_id],
            )
            .await
            .map_err(sql_err("update_user_tier"))?;
        if affected == 0 {
            return Err(StoreError::not_found("user", user_id));
        }
        info!("User {} moved to tier {}", user_id, tier);
        Ok(())
    }

    async fn delete_user(&self, id: &str) -> Result<()> {
        let conn = self.conn("delete_user").await?;
        let affected = conn
            .execute("DELETE FROM users WHERE id = ?", params![id])
            .await
            .map_err(sql_err("delete_user"))?;
        if affected == 0 {
            return Err(StoreError::not_found("user", id));
        }
        Ok(())
    }

    async fn get_user_with_subscription(&self, user_id: &str) -> Result<UserWithSubscription> {
        let conn = self.conn("get_user_with_subscription").await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {}, paddle_customer_id, trial_ends_at, is_lifetime_member, lifetime_member_type
                     FROM users WHERE id = ?",
                    USER_COLUMNS
                ),
                params![user_id],
            )
            .await?;
        let row = rows
            .next()
            .await?
            .ok_or_else(|| StoreError::not_found("user", user_id))?;

        Ok(UserWithSubscription {
            user: row_to_user(&row)?,
            paddle_customer_id: row.get(9)?,
            trial_ends_at: opt_ts(&row, 10)?,
            is_lifetime_member: flag(&row, 11)?,
            lifetime_member_type: row.get(12)?,
        })
    }

    async fn create_organization(&self, org: &mut Organization) -> Result<()> {
        let conn = self.conn("create_organization").await?;
        let now = Utc::now();
        let stamp = format_timestamp(&now);
        if org.id.is_empty() {
            org.id = new_id();
        }
        debug!("Creating organization {} for owner {}", org.id, org.owner_id);

        let tx = conn.transaction().await?;
        let result = async {
            tx.execute(
                &format!("INSERT INTO organizations ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)", ORG_COLUMNS),
                params![
                    org.id.clone(),
                    org.name.clone(),
                    org.owner_id.clone(),
                    org.description.clone(),
                    org.avatar.clone(),
                    org.color.clone(),
                    stamp.clone(),
                    stamp.clone(),
                ],
            )
            .await?;
            tx.execute(
                "INSERT INTO organization_memberships (id, organization_id, user_id, role, created_at, updated_at)
                 VALUES (?, ?, ?, 'owner', ?, ?)
                 ON CONFLICT (organization_id, user_id) DO NOTHING",
                params![new_id(), org.id.clone(), org.owner_id.clone(), stamp.clone(), stamp.clone()],
            )
            .await?;
            Ok::<_, libsql::Error>(())
        }
        .await;

        match result {
            Ok(()) => tx.commit().await.map_err(sql_err("create_organization"))?,
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!("Rollback of create_organization failed: {}", rb);
                }
                return Err(sql_err("create_organization")(e));
            }
        }

        org.created_at = now;
        org.updated_at = now;
        Ok(())
    }

    async fn get_organization(&self, id: &str) -> Result<Organization> {
        let conn = self.conn("get_organization").await?;
        fetch_one(
            &conn,
            &format!("SELECT {} FROM organizations WHERE id = ?", ORG_COLUMNS),
            params![id],
            row_to_organization,
        )
        .await?
        .ok_or_else(|| StoreError::not_found("organization", id))
    }

    async fn update_organization(&self, org: &mut Organization) -> Result<()> {
        let conn = self.conn("update_organization").await?;
        let now = Utc::now();
        let affected = conn
            .execute(
                "UPDATE organizations SET name = ?, description = ?, avatar = ?, color = ?, updated_at = ?
                 WHERE id = ?",
                params![
                    org.name.clone(),
                    org.description.clone(),
                    org.avatar.clone(),
                    org.color.clone(),
                    format_timestamp(&now),
                    org.id.clone(),
                ],
            )
            .await
            .map_err(sql_err("update_organization"))?;
        if affected == 0 {
            return Err(StoreError::not_found("organization", org.id.clone()));
        }
        org.updated_at = now;
        Ok(())
    }

    async fn list_user_organizations(&self, user_id: &str) -> Result<Vec<Organization>> {
        let conn = self.conn("list_user_organizations").await?;
        fetch_all(
            &conn,
            &format!(
                "SELECT {} FROM organizations
                 WHERE owner_id = ?
                    OR id IN (SELECT organization_id FROM organization_memberships WHERE user_id = ?)
                 ORDER BY created_at DESC",
                ORG_COLUMNS
            ),
            params![user_id, user_id],
            row_to_organization,
        )
        .await
    }

    async fn add_organization_member(&self, membership: &mut OrganizationMembership) -> Result<()> {
        let conn = self.conn("add_organization_member").await?;
        let stamp = format_timestamp(&Utc::now());
        if membership.id.is_empty() {
            membership.id = new_id();
        }

        let mut rows = conn
            .query(
                "INSERT INTO organization_memberships (id, organization_id, user_id, role, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT (organization_id, user_id)
                 DO UPDATE SET role = excluded.role, updated_at = excluded.updated_at
                 RETURNING id, created_at, updated_at",
                params![
                    membership.id.clone(),
                    membership.organization_id.clone(),
                    membership.user_id.clone(),
                    membership.role.as_str(),
                    stamp.clone(),
                    stamp,
                ],
            )
            .await
            .map_err(sql_err("add_organization_member"))?;

        if let Some(row) = rows.next().await.map_err(sql_err("add_organization_member"))? {
            membership.id = row.get(0)?;
            membership.created_at = ts(&row, 1)?;
            membership.updated_at = ts(&row, 2)?;
        }
        Ok(())
    }

    async fn list_organization_members(&self, org_id: &str) -> Result<Vec<OrganizationMembership>> {
        let conn = self.conn("list_organization_members").await?;
        fetch_all(
            &conn,
            &format!(
                "SELECT {} FROM organization_memberships WHERE organization_id = ? ORDER BY created_at ASC",
                MEMBERSHIP_COLUMNS
            ),
            params![org_id],
            row_to_membership,
        )
        .await
    }

    async fn create_space(&self, space: &mut Space) -> Result<()> {
        let conn = self.conn("create_space").await?;
        let now = Utc::now();
        let stamp = format_timestamp(&now);
        if space.id.is_empty() {
            space.id = new_id();
        }
        conn.execute(
            "INSERT INTO spaces (id, organization_id, name, description, is_default, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            params![
                space.id.clone(),
                space.organization_id.clone(),
                space.name.clone(),
                space.description.clone(),
                i64::from(space.is_default),
                stamp.clone(),
                stamp,
            ],
        )
        .await
        .map_err(sql_err("create_space"))?;
        space.created_at = now;
        space.updated_at = now;
        space.deleted_at = None;
        Ok(())
    }

    async fn get_space(&self, id: &str) -> Result<Space> {
        let conn = self.conn("get_space").await?;
        fetch_one(
            &conn,
            &format!("SELECT {} FROM spaces WHERE id = ? AND deleted_at IS NULL", SPACE_COLUMNS),
            params![id],
            row_to_space,
        )
        .await?
        .ok_or_else(|| StoreError::not_found("space", id))
    }

    async fn update_space(&self, space: &mut Space) -> Result<()> {
        let conn = self.conn("update_space").await?;
        let now = Utc::now();
        let affected = conn
            .execute(
                "UPDATE spaces SET name = ?, description = ?, is_default = ?, updated_at = ?
                 WHERE id = ? AND deleted_at IS NULL",
                params![
                    space.name.clone(),
                    space.description.clone(),
                    i64::from(space.is_default),
                    format_timestamp(&now),
                    space.id.clone(),
                ],
            )
            .await
            .map_err(sql_err("update_space"))?;
        if affected == 0 {
            return Err(StoreError::not_found("space", space.id.clone()));
        }
        space.updated_at = now;
        Ok(())
    }

    async fn delete_space(&self, id: &str) -> Result<()> {
        let conn = self.conn("delete_space").await?;
        let now = format_timestamp(&Utc::now());
        if !soft_delete(&conn, "spaces", id, &now).await.map_err(|e| e.context("delete_space"))? {
            return Err(StoreError::not_found("space", id));
        }
        Ok(())
    }

    async fn list_spaces_by_organization(&self, org_id: &str, query: &ListQuery) -> Result<Vec<Space>> {
        let conn = self.conn("list_spaces_by_organization").await?;
        let (sql, params) = list_sql(SPACE_COLUMNS, "spaces", "organization_id", org_id, "created_at ASC", query);
        fetch_all(&conn, &sql, params, row_to_space).await
    }

    async fn set_space_permission(&self, space_id: &str, user_id: &str, can_edit: bool) -> Result<()> {
        let conn = self.conn("set_space_permission").await?;
        let stamp = format_timestamp(&Utc::now());
        conn.execute(
            "INSERT INTO space_permissions (id, space_id, user_id, can_edit, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (space_id, user_id)
             DO UPDATE SET can_edit = excluded.can_edit, updated_at = excluded.updated_at",
            params![new_id(), space_id, user_id, i64::from(can_edit), stamp.clone(), stamp],
        )
        .await
        .map_err(sql_err("set_space_permission"))?;
        Ok(())
    }

    async fn get_space_permissions(&self, space_id: &str) -> Result<Vec<SpacePermission>> {
        let conn = self.conn("get_space_permissions").await?;
        fetch_all(
            &conn,
            &format!(
                "SELECT {} FROM space_permissions WHERE space_id = ? ORDER BY created_at ASC",
                PERMISSION_COLUMNS
            ),
            params![space_id],
            row_to_permission,
        )
        .await
    }

    async fn create_collection(&self, collection: &mut Collection) -> Result<()> {
        let conn = self.conn("create_collection").await?;
        let now = Utc::now();
        let stamp = format_timestamp(&now);
        if collection.id.is_empty() {
            collection.id = new_id();
        }
        conn.execute(
            "INSERT INTO collections (id, space_id, name, description, color, icon, position, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                collection.id.clone(),
                collection.space_id.clone(),
                collection.name.clone(),
                collection.description.clone(),
                collection.color.clone(),
                collection.icon.clone(),
                collection.position,
                stamp.clone(),
                stamp,
            ],
        )
        .await
        .map_err(sql_err("create_collection"))?;
        collection.created_at = now;
        collection.updated_at = now;
        collection.deleted_at = None;
        Ok(())
    }

    async fn get_collection(&self, id: &str) -> Result<Collection> {
        let conn = self.conn("get_collection").await?;
        fetch_one(
            &conn,
            &format!("SELECT {} FROM collections WHERE id = ? AND deleted_at IS NULL", COLLECTION_COLUMNS),
            params![id],
            row_to_collection,
        )
        .await?
        .ok_or_else(|| StoreError::not_found("collection", id))
    }

    async fn update_collection(&self, collection: &mut Collection) -> Result<()> {
        let conn = self.conn("update_collection").await?;
        let now = Utc::now();
        let affected = conn
            .execute(
                "UPDATE collections
                 SET name = ?, description = ?, color = ?, icon = ?, position = ?, updated_at = ?
                 WHERE id = ? AND deleted_at IS NULL",
                params![
                    collection.name.clone(),
                    collection.description.clone(),
                    collection.color.clone(),
                    collection.icon.clone(),
                    collection.position,
                    format_timestamp(&now),
                    collection.id.clone(),
                ],
            )
            .await
            .map_err(sql_err("update_collection"))?;
        if affected == 0 {
            return Err(StoreError::not_found("collection", collection.id.clone()));
        }
        collection.updated_at = now;
        Ok(())
    }

    async fn delete_collection(&self, id: &str) -> Result<()> {
        let conn = self.conn("delete_collection").await?;
        let now = format_timestamp(&Utc::now());

        let tx = conn.transaction().await?;
        match cascade_delete_collection(&tx, id, &now).await {
            Ok(items) => {
                tx.commit().await.map_err(sql_err("delete_collection"))?;
                debug!("Deleted collection {} and {} items", id, items);
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!("Rollback of delete_collection {} failed: {}", id, rb);
                }
                if e.is_not_found() {
                    Err(e)
                } else {
                    Err(e.context("delete_collection"))
                }
            }
        }
    }

    async fn list_collections_by_space(&self, space_id: &str, query: &ListQuery) -> Result<Vec<Collection>> {
        let conn = self.conn("list_collections_by_space").await?;
        let (sql, params) = list_sql(
            COLLECTION_COLUMNS,
            "collections",
            "space_id",
            space_id,
            "position ASC, created_at ASC",
            query,
        );
        fetch_all(&conn, &sql, params, row_to_collection).await
    }

    async fn create_collection_item(&self, item: &mut CollectionItem) -> Result<()> {
        let conn = self.conn("create_collection_item").await?;
        let now = Utc::now();
        let stamp = format_timestamp(&now);
        if item.id.is_empty() {
            item.id = new_id();
        }
        if item.metadata.is_null() {
            item.metadata = serde_json::json!({});
        }
        conn.execute(
            "INSERT INTO collection_items (id, collection_id, title, url, fav_icon_url, original_title,
                 ai_generated_title, domain, metadata, position, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                item.id.clone(),
                item.collection_id.clone(),
                item.title.clone(),
                item.url.clone(),
                item.fav_icon_url.clone(),
                item.original_title.clone(),
                item.ai_generated_title.clone(),
                item.domain.clone(),
                serde_json::to_string(&item.metadata)?,
                item.position,
                stamp.clone(),
                stamp,
            ],
        )
        .await
        .map_err(sql_err("create_collection_item"))?;
        item.created_at = now;
        item.updated_at = now;
        item.deleted_at = None;
        Ok(())
    }

    async fn get_collection_item(&self, id: &str) -> Result<CollectionItem> {
        let conn = self.conn("get_collection_item").await?;
        fetch_one(
            &conn,
            &format!("SELECT {} FROM collection_items WHERE id = ? AND deleted_at IS NULL", ITEM_COLUMNS),
            params![id],
            row_to_item,
        )
        .await?
        .ok_or_else(|| StoreError::not_found("collection item", id))
    }

    async fn update_collection_item(&self, item: &mut CollectionItem) -> Result<()> {
        let conn = self.conn("update_collection_item").await?;
        let now = Utc::now();
        if item.metadata.is_null() {
            item.metadata = serde_json::json!({});
        }
        let affected = conn
            .execute(
                "UPDATE collection_items
                 SET title = ?, url = ?, fav_icon_url = ?, original_title = ?, ai_generated_title = ?,
                     domain = ?, metadata = ?, position = ?, updated_at = ?
                 WHERE id = ? AND deleted_at IS NULL",
                params![
                    item.title.clone(),
                    item.url.clone(),
                    item.fav_icon_url.clone(),
                    item.original_title.clone(),
                    item.ai_generated_title.clone(),
                    item.domain.clone(),
                    serde_json::to_string(&item.metadata)?,
                    item.position,
                    format_timestamp(&now),
                    item.id.clone(),
                ],
            )
            .await
            .map_err(sql_err("update_collection_item"))?;
        if affected == 0 {
            return Err(StoreError::not_found("collection item", item.id.clone()));
        }
        item.updated_at = now;
        Ok(())
    }

    async fn update_collection_item_partial(&self, id: &str, patch: &CollectionItemPatch) -> Result<()> {
        let conn = self.conn("update_collection_item_partial").await?;

        if patch.is_empty() {
            let mut rows = conn
                .query(
                    "SELECT 1 FROM collection_items WHERE id = ? AND deleted_at IS NULL",
                    params![id],
                )
                .await?;
            return match rows.next().await? {
                Some(_) => Ok(()),
                None => Err(StoreError::not_found("collection item", id)),
            };
        }

        let mut assignments = Vec::new();
        let mut values = Vec::new();
        for (column, value) in patch.assignments() {
            assignments.push(format!("{} = ?", column));
            // metadata is always stored as JSON text, even when it is a bare string
            values.push(match value {
                other if column == "metadata" => Value::Text(serde_json::to_string(&other)?),
                serde_json::Value::String(s) => Value::Text(s),
                serde_json::Value::Number(n) if column == "position" => {
                    Value::Integer(n.as_i64().unwrap_or_default())
                }
                other => Value::Text(serde_json::to_string(&other)?),
            });
        }
        assignments.push("updated_at = ?".to_string());
        values.push(Value::Text(format_timestamp(&Utc::now())));
        values.push(Value::Text(id.to_string()));

        let sql = format!(
            "UPDATE collection_items SET {} WHERE id = ? AND deleted_at IS NULL",
            assignments.join(", ")
        );
        debug!("Partial update of item {}: {} fields", id, assignments.len() - 1);

        let affected = conn
            .execute(&sql, Params::Positional(values))
            .await
            .map_err(sql_err("update_collection_item_partial"))?;
        if affected == 0 {
            return Err(StoreError::not_found("collection item", id));
        }
        Ok(())
    }

    async fn delete_collection_item(&self, id: &str) -> Result<()> {
        let conn = self.conn("delete_collection_item").await?;
        let now = format_timestamp(&Utc::now());
        if !soft_delete(&conn, "collection_items", id, &now)
            .await
            .map_err(|e| e.context("delete_collection_item"))?
        {
            return Err(StoreError::not_found("collection item", id));
        }
        Ok(())
    }

    async fn list_items_by_collection(&self, collection_id: &str, query: &ListQuery) -> Result<Vec<CollectionItem>> {
        let conn = self.conn("list_items_by_collection").await?;
        let (sql, params) = list_sql(
            ITEM_COLUMNS,
            "collection_items",
            "collection_id",
            collection_id,
            "position ASC, created_at ASC",
            query,
        );
        fetch_all(&conn, &sql, params, row_to_item).await
    }

    async fn find_item_by_normalized_url(&self, collection_id: &str, url: &str) -> Result<Option<CollectionItem>> {
        let conn = self.conn("find_item_by_normalized_url").await?;
        let normalized = normalize_url(url);

        let tagged = fetch_one(
            &conn,
            &format!(
                "SELECT {} FROM collection_items
                 WHERE collection_id = ? AND deleted_at IS NULL
                   AND json_extract(metadata, '$.{}') = ?
                 ORDER BY position ASC, created_at ASC
                 LIMIT 1",
                ITEM_COLUMNS, NORMALIZED_URL_KEY
            ),
            params![collection_id, normalized.clone()],
            row_to_item,
        )
        .await?;
        if tagged.is_some() {
            return Ok(tagged);
        }

        // Items saved without a precomputed tag
        let live = fetch_all(
            &conn,
            &format!(
                "SELECT {} FROM collection_items
                 WHERE collection_id = ? AND deleted_at IS NULL
                 ORDER BY position ASC, created_at ASC",
                ITEM_COLUMNS
            ),
            params![collection_id],
            row_to_item,
        )
        .await?;
        Ok(live.into_iter().find(|item| normalize_url(&item.url) == normalized))
    }

    async fn create_invitation(&self, invitation: &mut OrganizationInvitation) -> Result<()> {
        let conn = self.conn("create_invitation").await?;
        let now = Utc::now();
        let stamp = format_timestamp(&now);
        if invitation.id.is_empty() {
            invitation.id = new_id();
        }
        invitation.prepare_for_insert(now);

        conn.execute(
            &format!(
                "INSERT INTO organization_invitations ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                INVITATION_COLUMNS
            ),
            params![
                invitation.id.clone(),
                invitation.organization_id.clone(),
                invitation.email.clone(),
                invitation.inviter_id.clone(),
                invitation.token.clone(),
                invitation.status.as_str(),
                opt_ts_value(invitation.expires_at.as_ref()),
                opt_text(invitation.accepted_by.as_ref()),
                stamp.clone(),
                stamp,
            ],
        )
        .await
        .map_err(sql_err("create_invitation"))?;
        invitation.created_at = now;
        invitation.updated_at = now;
        Ok(())
    }

    async fn get_invitation_by_token(&self, token: &str) -> Result<OrganizationInvitation> {
        let conn = self.conn("get_invitation_by_token").await?;
        fetch_one(
            &conn,
            &format!("SELECT {} FROM organization_invitations WHERE token = ?", INVITATION_COLUMNS),
            params![token],
            row_to_invitation,
        )
        .await?
        .ok_or_else(|| StoreError::not_found("invitation", "token"))
    }

    async fn list_invitations_by_email(&self, email: &str) -> Result<Vec<OrganizationInvitation>> {
        let conn = self.conn("list_invitations_by_email").await?;
        fetch_all(
            &conn,
            &format!(
                "SELECT {} FROM organization_invitations WHERE lower(email) = lower(?) ORDER BY created_at DESC",
                INVITATION_COLUMNS
            ),
            params![email.trim()],
            row_to_invitation,
        )
        .await
    }

    async fn update_invitation(&self, invitation: &mut OrganizationInvitation) -> Result<()> {
        let conn = self.conn("update_invitation").await?;
        let now = Utc::now();
        let affected = conn
            .execute(
                "UPDATE organization_invitations
                 SET status = ?, accepted_by = ?, expires_at = ?, updated_at = ?
                 WHERE id = ?",
                params![
                    invitation.status.as_str(),
                    opt_text(invitation.accepted_by.as_ref()),
                    opt_ts_value(invitation.expires_at.as_ref()),
                    format_timestamp(&now),
                    invitation.id.clone(),
                ],
            )
            .await
            .map_err(sql_err("update_invitation"))?;
        if affected == 0 {
            return Err(StoreError::not_found("invitation", invitation.id.clone()));
        }
        invitation.updated_at = now;
        Ok(())
    }

    async fn save_snapshot(&self, user_id: &str, name: &str, tab_groups: &[TabGroup]) -> Result<()> {
        let conn = self.conn("save_snapshot").await?;
        let (group_count, tab_count) = Snapshot::counts(tab_groups);
        let stamp = format_timestamp(&Utc::now());

        conn.execute(
            "INSERT INTO snapshots (id, user_id, name, tab_groups, group_count, tab_count, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (user_id, name) DO UPDATE SET
                 tab_groups = excluded.tab_groups,
                 group_count = excluded.group_count,
                 tab_count = excluded.tab_count,
                 updated_at = excluded.updated_at",
            params![
                new_id(),
                user_id,
                name,
                serde_json::to_string(tab_groups)?,
                group_count,
                tab_count,
                stamp.clone(),
                stamp,
            ],
        )
        .await
        .map_err(sql_err("save_snapshot"))?;

        info!(
            "Saved snapshot '{}' for user {} ({} groups, {} tabs)",
            name, user_id, group_count, tab_count
        );
        Ok(())
    }

    async fn list_snapshots(&self, user_id: &str) -> Result<Vec<SnapshotInfo>> {
        let conn = self.conn("list_snapshots").await?;
        fetch_all(
            &conn,
            "SELECT name, created_at, updated_at, tab_count, group_count
             FROM snapshots WHERE user_id = ? ORDER BY updated_at DESC",
            params![user_id],
            |row| {
                Ok(SnapshotInfo {
                    name: row.get(0)?,
                    created_at: ts(row, 1)?,
                    updated_at: ts(row, 2)?,
                    tab_count: row.get(3)?,
                    group_count: row.get(4)?,
                })
            },
        )
        .await
    }

    async fn load_snapshot(&self, user_id: &str, name: &str) -> Result<Snapshot> {
        let conn = self.conn("load_snapshot").await?;
        fetch_one(
            &conn,
            &format!("SELECT {} FROM snapshots WHERE user_id = ? AND name = ?", SNAPSHOT_COLUMNS),
            params![user_id, name],
            row_to_snapshot,
        )
        .await?
        .ok_or_else(|| StoreError::not_found("snapshot", format!("{}/{}", user_id, name)))
    }

    async fn delete_snapshot(&self, user_id: &str, name: &str) -> Result<()> {
        let conn = self.conn("delete_snapshot").await?;
        let affected = conn
            .execute(
                "DELETE FROM snapshots WHERE user_id = ? AND name = ?",
                params![user_id, name],
            )
            .await
            .map_err(sql_err("delete_snapshot"))?;
        if affected == 0 {
            return Err(StoreError::not_found("snapshot", format!("{}/{}", user_id, name)));
        }
        Ok(())
    }

    async fn create_subscription(&self, subscription: &mut UserSubscription) -> Result<()> {
        let conn = self.conn("create_subscription").await?;
        let now = Utc::now();
        let stamp = format_timestamp(&now);
        if subscription.id.is_empty() {
            subscription.id = new_id();
        }
        conn.execute(
            &format!(
                "INSERT INTO user_subscriptions ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                SUBSCRIPTION_COLUMNS
            ),
            params![
                subscription.id.clone(),
                subscription.user_id.clone(),
                subscription.plan_id.clone(),
                opt_text(subscription.paddle_subscription_id.as_ref()),
                subscription.status.as_str(),
                opt_ts_value(subscription.current_period_start.as_ref()),
                opt_ts_value(subscription.current_period_end.as_ref()),
                i64::from(subscription.cancel_at_period_end),
                opt_ts_value(subscription.canceled_at.as_ref()),
                stamp.clone(),
                stamp,
            ],
        )
        .await
        .map_err(sql_err("create_subscription"))?;
        subscription.created_at = now;
        subscription.updated_at = now;
        Ok(())
    }

    async fn get_user_subscription(&self, user_id: &str) -> Result<UserSubscription> {
        let conn = self.conn("get_user_subscription").await?;
        fetch_one(
            &conn,
            &format!("SELECT {} FROM user_subscriptions WHERE user_id = ?", SUBSCRIPTION_COLUMNS),
            params![user_id],
            row_to_subscription,
        )
        .await?
        .ok_or_else(|| StoreError::not_found("subscription", user_id))
    }

    async fn update_subscription(&self, subscription: &mut UserSubscription) -> Result<()> {
        let conn = self.conn("update_subscription").await?;
        let now = Utc::now();
        let affected = conn
            .execute(
                "UPDATE user_subscriptions
                 SET plan_id = ?, paddle_subscription_id = ?, status = ?, current_period_start = ?,
                     current_period_end = ?, cancel_at_period_end = ?, canceled_at = ?, updated_at = ?
                 WHERE id = ?",
                params![
                    subscription.plan_id.clone(),
                    opt_text(subscription.paddle_subscription_id.as_ref()),
                    subscription.status.as_str(),
                    opt_ts_value(subscription.current_period_start.as_ref()),
                    opt_ts_value(subscription.current_period_end.as_ref()),
                    i64::from(subscription.cancel_at_period_end),
                    opt_ts_value(subscription.canceled_at.as_ref()),
                    format_timestamp(&now),
                    subscription.id.clone(),
                ],
            )
            .await
            .map_err(sql_err("update_subscription"))?;
        if affected == 0 {
            return Err(StoreError::not_found("subscription", subscription.id.clone()));
        }
        subscription.updated_at = now;
        Ok(())
    }

    async fn cancel_subscription(&self, user_id: &str) -> Result<()> {
        let conn = self.conn("cancel_subscription").await?;
        let stamp = format_timestamp(&Utc::now());
        let affected = conn
            .execute(
                "UPDATE user_subscriptions
                 SET status = ?, canceled_at = COALESCE(canceled_at, ?), cancel_at_period_end = 1, updated_at = ?
                 WHERE user_id = ?",
                params![SubscriptionStatus::Canceled.as_str(), stamp.clone(), stamp, user_id],
            )
            .await
            .map_err(sql_err("cancel_subscription"))?;
        if affected == 0 {
            return Err(StoreError::not_found("subscription", user_id));
        }
        info!("Canceled subscription for user {}", user_id);
        Ok(())
    }

    async fn get_user_ai_credits(&self, user_id: &str) -> Result<AiCredits> {
        let conn = self.conn("get_user_ai_credits").await?;
        fetch_one(
            &conn,
            &format!("SELECT {} FROM ai_credits WHERE user_id = ?", CREDITS_COLUMNS),
            params![user_id],
            row_to_credits,
        )
        .await?
        .ok_or_else(|| StoreError::not_found("ai credits", user_id))
    }

    async fn update_ai_credits(&self, credits: &mut AiCredits) -> Result<()> {
        let conn = self.conn("update_ai_credits").await?;
        let stamp = format_timestamp(&Utc::now());
        if credits.id.is_empty() {
            credits.id = new_id();
        }
        let mut rows = conn
            .query(
                "INSERT INTO ai_credits (id, user_id, credits_total, credits_used, period_start, period_end, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT (user_id) DO UPDATE SET
                     credits_total = excluded.credits_total,
                     credits_used = excluded.credits_used,
                     period_start = excluded.period_start,
                     period_end = excluded.period_end,
                     updated_at = excluded.updated_at
                 RETURNING id, created_at, updated_at",
                params![
                    credits.id.clone(),
                    credits.user_id.clone(),
                    credits.credits_total,
                    credits.credits_used,
                    format_timestamp(&credits.period_start),
                    format_timestamp(&credits.period_end),
                    stamp.clone(),
                    stamp,
                ],
            )
            .await
            .map_err(sql_err("update_ai_credits"))?;
        if let Some(row) = rows.next().await.map_err(sql_err("update_ai_credits"))? {
            credits.id = row.get(0)?;
            credits.created_at = ts(&row, 1)?;
            credits.updated_at = ts(&row, 2)?;
        }
        Ok(())
    }

    async fn consume_ai_credits(&self, user_id: &str, amount: i64) -> Result<()> {
        if amount <= 0 {
            return Err(StoreError::InvalidInput(format!(
                "credit amount must be positive, got {}",
                amount
            )));
        }
        let conn = self.conn("consume_ai_credits").await?;
        let affected = conn
            .execute(
                "UPDATE ai_credits SET credits_used = credits_used + ?, updated_at = ?
                 WHERE user_id = ? AND credits_total - credits_used >= ?",
                params![amount, format_timestamp(&Utc::now()), user_id, amount],
            )
            .await
            .map_err(sql_err("consume_ai_credits"))?;
        if affected > 0 {
            return Ok(());
        }

        let mut rows = conn
            .query("SELECT 1 FROM ai_credits WHERE user_id = ?", params![user_id])
            .await?;
        match rows.next().await? {
            Some(_) => Err(StoreError::InvalidInput(format!(
                "insufficient AI credits for user {}",
                user_id
            ))),
            None => Err(StoreError::not_found("ai credits", user_id)),
        }
    }

    async fn health_check(&self) -> Result<()> {
        let conn = self.conn("health_check").await?;
        conn.query("SELECT 1", params![])
            .await
            .map_err(|e| StoreError::unavailable("health_check", e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.pool.close();
            info!("LibSQL storage closed");
        }
        Ok(())
    }

    fn release_idle(&self) -> usize {
        if self.closed.load(Ordering::SeqCst) {
            return 0;
        }
        self.pool.prune_idle()
    }

    fn backend_kind(&self) -> BackendKind {
        BackendKind::Structured
    }
}
