//! Stub InfluxDB v1 endpoint for integration tests.
//!
//! Serves just enough of the HTTP API for the sink: the `/query` probe and
//! database creation, and the `/write` path with a missing-database mode.

#![allow(dead_code)]

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

/// Behavior switches and call log for the stub endpoint.
pub struct StubState {
    /// Status returned for the SHOW USERS probe.
    pub probe_status: u16,
    /// Whether `/write` finds its target database.
    pub database_exists: AtomicBool,
    /// Whether CREATE DATABASE brings a missing database back.
    pub create_heals: bool,
    /// Forced status for every `/write`, overriding everything else.
    pub write_error_status: Option<u16>,
    /// Every `q` parameter seen on `/query`, in order.
    pub queries: Mutex<Vec<String>>,
    /// Every `/write` body, in order.
    pub writes: Mutex<Vec<String>>,
}

impl Default for StubState {
    fn default() -> Self {
        Self {
            probe_status: 200,
            database_exists: AtomicBool::new(true),
            create_heals: true,
            write_error_status: None,
            queries: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
        }
    }
}

/// A running stub server.
pub struct StubInflux {
    pub addr: SocketAddr,
    pub state: Arc<StubState>,
}

impl StubInflux {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn queries(&self) -> Vec<String> {
        self.state.queries.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<String> {
        self.state.writes.lock().unwrap().clone()
    }

    pub fn create_count(&self) -> usize {
        self.queries()
            .iter()
            .filter(|q| q.starts_with("CREATE DATABASE"))
            .count()
    }
}

/// Bind an ephemeral port and serve the stub in the background.
pub async fn start_stub(state: StubState) -> StubInflux {
    let state = Arc::new(state);
    let app = Router::new()
        .route("/query", get(handle_query).post(handle_query))
        .route("/write", post(handle_write))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub listener");
    let addr = listener.local_addr().expect("stub listener addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("stub server");
    });

    StubInflux { addr, state }
}

async fn handle_query(
    State(state): State<Arc<StubState>>,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    let q = params.get("q").cloned().unwrap_or_default();
    state.queries.lock().unwrap().push(q.clone());

    if q.starts_with("CREATE DATABASE") {
        if state.create_heals {
            state.database_exists.store(true, Ordering::SeqCst);
        }
        return (
            StatusCode::OK,
            r#"{"results":[{"statement_id":0}]}"#.to_string(),
        );
    }

    let status = StatusCode::from_u16(state.probe_status).unwrap_or(StatusCode::OK);
    (status, r#"{"results":[{"statement_id":0}]}"#.to_string())
}

async fn handle_write(State(state): State<Arc<StubState>>, body: String) -> (StatusCode, String) {
    state.writes.lock().unwrap().push(body);

    if let Some(status) = state.write_error_status {
        return (
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            r#"{"error":"internal error"}"#.to_string(),
        );
    }

    if !state.database_exists.load(Ordering::SeqCst) {
        return (
            StatusCode::NOT_FOUND,
            r#"{"error":"database not found: \"speedtest\""}"#.to_string(),
        );
    }

    (StatusCode::NO_CONTENT, String::new())
}
