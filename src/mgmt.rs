//! Management HTTP surface: a thin, replaceable binding of the engine's
//! admin contract onto HTTP.

use std::fmt::Write as _;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::engine::Engine;

const MAX_RADDR_BODY: usize = 259; // 253 for host, 1 for colon, 5 for port

pub fn router(engine: Engine) -> Router {
    Router::new()
        .route("/conns", get(get_conns))
        .route("/conns/count", get(get_count))
        .route("/raddr", get(get_raddr).put(put_raddr))
        .with_state(engine)
}

#[derive(Deserialize)]
struct ConnsQuery {
    #[serde(default)]
    json: bool,
}

#[derive(Serialize)]
struct JsonConn {
    client_out: String,
    proxy_in: String,
    proxy_out: Option<String>,
    server_in: Option<String>,
}

#[derive(Serialize)]
struct JsonConns {
    conns: Vec<JsonConn>,
}

async fn get_conns(State(engine): State<Engine>, Query(q): Query<ConnsQuery>) -> Response {
    let snapshot = engine.registry().snapshot();

    if q.json {
        let conns = snapshot
            .into_iter()
            .map(|(_id, info)| JsonConn {
                client_out: info.client_remote.to_string(),
                proxy_in: info.client_local.to_string(),
                proxy_out: info.upstream.map(|(local, _)| local.to_string()),
                server_in: info.upstream.map(|(_, remote)| remote.to_string()),
            })
            .collect();
        return Json(JsonConns { conns }).into_response();
    }

    let mut body = String::new();
    for (_id, info) in snapshot {
        let _ = write!(body, "{} -> {}", info.client_remote, info.client_local);
        if let Some((local, remote)) = info.upstream {
            let _ = write!(body, " -> {} -> {}", local, remote);
        }
        body.push('\n');
    }
    body.into_response()
}

async fn get_count(State(engine): State<Engine>) -> Response {
    engine.registry().count().to_string().into_response()
}

async fn get_raddr(State(engine): State<Engine>) -> Response {
    engine.get_remote_address().await.into_response()
}

async fn put_raddr(State(engine): State<Engine>, body: axum::body::Bytes) -> Response {
    if body.len() > MAX_RADDR_BODY {
        return (StatusCode::BAD_REQUEST, "request body too large").into_response();
    }

    let addr = match std::str::from_utf8(&body) {
        Ok(s) => s.trim().to_string(),
        Err(_) => return (StatusCode::BAD_REQUEST, "invalid UTF-8 in body").into_response(),
    };

    match engine.set_remote_address(addr).await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => {
            warn!("rejected /raddr PUT: {e}");
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
    }
}
