//! Common test utilities and helpers
//!
//! Store constructors for both backends plus `FakeRest`, an in-process
//! stand-in for a PostgREST table API (enough of the filter grammar for the
//! REST store: `eq`, `gt`, `is.null`, `in.(..)`, `or=(..)`, `->>`, `order`,
//! `limit`/`offset`, `select`, `on_conflict` with merge-duplicates).

#![allow(dead_code)]

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tabsync_store::{ConnectionMode, LibsqlStorage, PoolSettings, RestStorage, UpsertMode};
use tempfile::TempDir;

/// File-backed structured store in a fresh temp directory
pub async fn sql_store() -> (LibsqlStorage, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let path = dir.path().join("tabsync_test.db");
    let storage = LibsqlStorage::new(
        ConnectionMode::Local(path.to_string_lossy().to_string()),
        &PoolSettings::default(),
    )
    .await
    .expect("Failed to create test storage");
    (storage, dir)
}

/// REST store talking to a fresh fake table API
pub async fn rest_store(mode: UpsertMode) -> (RestStorage, FakeRest) {
    let server = FakeRest::spawn().await;
    let storage = RestStorage::new(&server.base_url, "test-service-key", Duration::from_secs(5), mode)
        .expect("Failed to create REST storage");
    (storage, server)
}

/// Unique column sets per table, as the hosted schema declares them
fn unique_keys(table: &str) -> Vec<Vec<&'static str>> {
    match table {
        "users" => vec![vec!["id"], vec!["email"]],
        "organization_memberships" => vec![vec!["id"], vec!["organization_id", "user_id"]],
        "organization_invitations" => vec![vec!["id"], vec!["token"]],
        "space_permissions" => vec![vec!["id"], vec!["space_id", "user_id"]],
        "snapshots" => vec![vec!["id"], vec!["user_id", "name"]],
        _ => vec![vec!["id"]],
    }
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, Vec<Value>>,
    failures: Vec<(Method, String, u16)>,
    log: Vec<(Method, String)>,
}

#[derive(Clone, Default)]
struct FakeState {
    inner: Arc<Mutex<Inner>>,
}

/// Handle to a running fake table API
pub struct FakeRest {
    pub base_url: String,
    state: FakeState,
}

impl FakeRest {
    pub async fn spawn() -> Self {
        let state = FakeState::default();
        let app = Router::new()
            .route("/rest/v1/", get(root))
            .route(
                "/rest/v1/:table",
                get(select_rows)
                    .post(insert_rows)
                    .patch(update_rows)
                    .delete(delete_rows),
            )
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind fake REST server");
        let addr = listener.local_addr().expect("no local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("fake REST server failed");
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
        }
    }

    /// Answer the next `method` request on `table` with `status`
    pub fn fail_next(&self, method: Method, table: &str, status: u16) {
        self.state
            .inner
            .lock()
            .unwrap()
            .failures
            .push((method, table.to_string(), status));
    }

    /// Rows currently stored in `table`
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.state
            .inner
            .lock()
            .unwrap()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    /// Requests seen so far, as (method, table)
    pub fn requests(&self) -> Vec<(Method, String)> {
        self.state.inner.lock().unwrap().log.clone()
    }

    pub fn clear_requests(&self) {
        self.state.inner.lock().unwrap().log.clear();
    }
}

async fn root(headers: HeaderMap) -> Response {
    if !headers.contains_key("apikey") {
        return error(StatusCode::UNAUTHORIZED, "missing apikey");
    }
    Json(json!({ "swagger": "2.0" })).into_response()
}

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "message": message }))).into_response()
}

/// Record the request; returns an injected failure or a missing-key error
fn precheck(state: &FakeState, method: Method, table: &str, headers: &HeaderMap) -> Option<Response> {
    let mut inner = state.inner.lock().unwrap();
    inner.log.push((method.clone(), table.to_string()));
    if !headers.contains_key("apikey") {
        return Some(error(StatusCode::UNAUTHORIZED, "missing apikey"));
    }
    if let Some(pos) = inner
        .failures
        .iter()
        .position(|(m, t, _)| *m == method && t == table)
    {
        let (_, _, status) = inner.failures.remove(pos);
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return Some(error(status, "injected failure"));
    }
    None
}

async fn select_rows(
    State(state): State<FakeState>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    if let Some(response) = precheck(&state, Method::GET, &table, &headers) {
        return response;
    }
    let inner = state.inner.lock().unwrap();
    let rows = inner.tables.get(&table).cloned().unwrap_or_default();
    let mut selected: Vec<Value> = rows.into_iter().filter(|row| row_matches(row, &params)).collect();

    if let Some(order) = param(&params, "order") {
        sort_rows(&mut selected, order);
    }
    let offset = param(&params, "offset").and_then(|v| v.parse().ok()).unwrap_or(0);
    let limit = param(&params, "limit").and_then(|v| v.parse().ok()).unwrap_or(usize::MAX);
    let mut page: Vec<Value> = selected.into_iter().skip(offset).take(limit).collect();

    if let Some(columns) = param(&params, "select") {
        if columns != "*" {
            let wanted: Vec<&str> = columns.split(',').collect();
            page = page
                .into_iter()
                .map(|row| {
                    let mut projected = serde_json::Map::new();
                    for column in &wanted {
                        projected.insert(column.to_string(), row.get(*column).cloned().unwrap_or(Value::Null));
                    }
                    Value::Object(projected)
                })
                .collect();
        }
    }

    Json(Value::Array(page)).into_response()
}

async fn insert_rows(
    State(state): State<FakeState>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
    Json(body): Json<Value>,
) -> Response {
    if let Some(response) = precheck(&state, Method::POST, &table, &headers) {
        return response;
    }
    let merge = headers
        .get_all("Prefer")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.contains("resolution=merge-duplicates"));
    let on_conflict: Option<Vec<String>> =
        param(&params, "on_conflict").map(|cols| cols.split(',').map(str::to_string).collect());

    let incoming = match body {
        Value::Array(rows) => rows,
        row => vec![row],
    };

    let mut inner = state.inner.lock().unwrap();
    let rows = inner.tables.entry(table.clone()).or_default();
    let mut stored = Vec::new();

    for row in incoming {
        if merge {
            if let Some(cols) = &on_conflict {
                if let Some(existing) = rows.iter_mut().find(|r| same_key(r, &row, cols)) {
                    if let (Some(target), Some(source)) = (existing.as_object_mut(), row.as_object()) {
                        for (k, v) in source {
                            target.insert(k.clone(), v.clone());
                        }
                    }
                    stored.push(existing.clone());
                    continue;
                }
            }
        }

        for key in unique_keys(&table) {
            let cols: Vec<String> = key.iter().map(|c| c.to_string()).collect();
            if rows.iter().any(|r| same_key(r, &row, &cols)) {
                return (
                    StatusCode::CONFLICT,
                    Json(json!({
                        "code": "23505",
                        "message": format!("duplicate key value violates unique constraint on {}", key.join(",")),
                    })),
                )
                    .into_response();
            }
        }
        rows.push(row.clone());
        stored.push(row);
    }

    (StatusCode::CREATED, Json(Value::Array(stored))).into_response()
}

async fn update_rows(
    State(state): State<FakeState>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
    Json(body): Json<Value>,
) -> Response {
    if let Some(response) = precheck(&state, Method::PATCH, &table, &headers) {
        return response;
    }
    let mut inner = state.inner.lock().unwrap();
    let rows = inner.tables.entry(table).or_default();
    let mut updated = Vec::new();
    for row in rows.iter_mut().filter(|row| row_matches(row, &params)) {
        if let (Some(target), Some(changes)) = (row.as_object_mut(), body.as_object()) {
            for (k, v) in changes {
                target.insert(k.clone(), v.clone());
            }
        }
        updated.push(row.clone());
    }
    Json(Value::Array(updated)).into_response()
}

async fn delete_rows(
    State(state): State<FakeState>,
    Path(table): Path<String>,
    headers: HeaderMap,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    if let Some(response) = precheck(&state, Method::DELETE, &table, &headers) {
        return response;
    }
    let mut inner = state.inner.lock().unwrap();
    let rows = inner.tables.entry(table).or_default();
    let (removed, kept): (Vec<Value>, Vec<Value>) = rows.drain(..).partition(|row| row_matches(row, &params));
    *rows = kept;
    Json(Value::Array(removed)).into_response()
}

const RESERVED: [&str; 5] = ["select", "order", "limit", "offset", "on_conflict"];

fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
}

fn same_key(a: &Value, b: &Value, columns: &[String]) -> bool {
    columns
        .iter()
        .all(|c| a.get(c).is_some() && a.get(c) == b.get(c) && !a.get(c).map(Value::is_null).unwrap_or(true))
}

fn row_matches(row: &Value, params: &[(String, String)]) -> bool {
    params
        .iter()
        .filter(|(k, _)| !RESERVED.contains(&k.as_str()))
        .all(|(column, expr)| {
            if column == "or" {
                let inner = expr.trim_start_matches('(').trim_end_matches(')');
                inner.split(',').any(|clause| {
                    let mut parts = clause.splitn(2, '.');
                    match (parts.next(), parts.next()) {
                        (Some(col), Some(rest)) => condition(row, col, rest),
                        _ => false,
                    }
                })
            } else {
                condition(row, column, expr)
            }
        })
}

fn field<'a>(row: &'a Value, column: &str) -> Option<&'a Value> {
    match column.split_once("->>") {
        Some((col, key)) => row.get(col).and_then(|v| v.get(key)),
        None => row.get(column),
    }
}

fn as_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn condition(row: &Value, column: &str, expr: &str) -> bool {
    let value = field(row, column);
    let (op, operand) = expr.split_once('.').unwrap_or((expr, ""));
    let operand = operand.trim_matches('"');
    match op {
        "is" if operand == "null" => value.map(Value::is_null).unwrap_or(true),
        "eq" => value.and_then(as_text).map(|v| v == operand).unwrap_or(false),
        "gt" => value
            .and_then(as_text)
            .map(|v| compare_text(&v, operand) == Ordering::Greater)
            .unwrap_or(false),
        "in" => {
            let set: Vec<&str> = operand.trim_start_matches('(').trim_end_matches(')').split(',').collect();
            value.and_then(as_text).map(|v| set.contains(&v.as_str())).unwrap_or(false)
        }
        _ => false,
    }
}

/// Timestamps compare as instants, everything else as text
fn compare_text(a: &str, b: &str) -> Ordering {
    match (a.parse::<DateTime<Utc>>(), b.parse::<DateTime<Utc>>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(x), Some(y)) => match (as_text(x), as_text(y)) {
            (Some(x), Some(y)) => compare_text(&x, &y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        },
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn sort_rows(rows: &mut [Value], order: &str) {
    let keys: Vec<(String, bool)> = order
        .split(',')
        .map(|part| match part.rsplit_once('.') {
            Some((col, dir)) => (col.to_string(), dir == "desc"),
            None => (part.to_string(), false),
        })
        .collect();
    rows.sort_by(|a, b| {
        for (column, desc) in &keys {
            let ord = compare_values(a.get(column), b.get(column));
            let ord = if *desc { ord.reverse() } else { ord };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
}
