//! Admin routes: block-list management, cache purge, and cache stats.

use crate::AppState;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::{DNSClass, Name, RecordType};
use nimbledns_cache::purge_qname;
use serde::Serialize;
use serde_json::{json, Value};
use std::str::FromStr;
use tracing::debug;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/block/set/{key}", get(block_set))
        .route("/block/get/{key}", get(block_get))
        .route("/block/exists/{key}", get(block_exists))
        .route("/block/remove/{key}", get(block_remove))
        .route("/purge/{qname}/{qtype}", get(purge))
        .route("/cache/stats", get(cache_stats))
}

#[derive(Serialize)]
struct Success {
    success: bool,
}

fn success(success: bool) -> Json<Success> {
    Json(Success { success })
}

fn error(status: StatusCode, message: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": message })))
}

async fn block_set(State(state): State<AppState>, Path(key): Path<String>) -> Json<Success> {
    state.blocklist.set(&key);
    success(true)
}

async fn block_get(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Success>, (StatusCode, Json<Value>)> {
    if state.blocklist.exists(&key) {
        Ok(success(true))
    } else {
        Err(error(StatusCode::NOT_FOUND, "key not found"))
    }
}

async fn block_exists(State(state): State<AppState>, Path(key): Path<String>) -> Json<Success> {
    success(state.blocklist.exists(&key))
}

async fn block_remove(State(state): State<AppState>, Path(key): Path<String>) -> Json<Success> {
    success(state.blocklist.remove(&key))
}

/// Evict `(qname, qtype)` from the cache by dispatching the synthetic
/// CHAOS-class question through the internal exchange path; the cache
/// middleware recognises it and evicts.
async fn purge(
    State(state): State<AppState>,
    Path((qname, qtype)): Path<(String, String)>,
) -> Result<Json<Success>, (StatusCode, Json<Value>)> {
    let qtype = RecordType::from_str(&qtype.to_uppercase())
        .map_err(|_| error(StatusCode::BAD_REQUEST, "unknown query type"))?;
    // Validate the name before encoding it into the purge label.
    Name::from_utf8(&qname).map_err(|_| error(StatusCode::BAD_REQUEST, "invalid qname"))?;

    let label = purge_qname(&qname, qtype);
    let name = Name::from_utf8(format!("{label}."))
        .map_err(|_| error(StatusCode::BAD_REQUEST, "qname too long to purge"))?;

    let mut req = Message::new();
    let mut q = Query::query(name, RecordType::NULL);
    q.set_query_class(DNSClass::CH);
    req.add_query(q);

    match state.exchanger.exchange(req).await {
        Ok(_) => {
            debug!(%qname, %qtype, "purge dispatched");
            Ok(success(true))
        }
        Err(e) => Err(error(
            StatusCode::INTERNAL_SERVER_ERROR,
            &format!("purge failed: {e}"),
        )),
    }
}

async fn cache_stats(State(state): State<AppState>) -> Json<nimbledns_cache::CacheStats> {
    Json(state.cache.stats())
}
