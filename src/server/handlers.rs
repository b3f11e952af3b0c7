//! Request handlers for the coordination protocol.
//!
//! Each `handle_*` function processes one decoded [`Request`] and returns the
//! [`Response`] to send back.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;

use crate::config::ServerSettings;
use crate::protocol::{ErrorCode, Op, Request, Response, PROTOCOL_VERSION};
use crate::server::store::{NodeStore, StoreError};

/// Append-only log of mutating requests, one JSON line each.
#[derive(Debug)]
pub(super) struct TxnLog {
    path: PathBuf,
    file: Mutex<File>,
}

#[derive(Serialize)]
struct TxnRecord<'a> {
    op: Op,
    path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a [u8]>,
}

impl TxnLog {
    pub(super) fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    /// Appends a record. Failures are logged, never surfaced to clients.
    fn append(&self, op: Op, path: &str, data: Option<&[u8]>) {
        let record = TxnRecord { op, path, data };
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let result = serde_json::to_writer(&mut *file, &record)
            .map_err(std::io::Error::from)
            .and_then(|()| file.write_all(b"\n"));
        if let Err(e) = result {
            tracing::warn!("Failed to append to transaction log {:?}: {}", self.path, e);
        }
    }
}

/// Shared server state passed to each connection handler.
#[derive(Clone)]
pub(super) struct ServerState {
    pub(super) store: NodeStore,
    pub(super) txn_log: Arc<TxnLog>,
    pub(super) active_connections: Arc<AtomicUsize>,
    pub(super) settings: ServerSettings,
}

/// Dispatches a request to its handler.
pub(super) async fn handle_request(req: Request, state: &ServerState) -> Response {
    if req.version != PROTOCOL_VERSION {
        return Response::error(
            ErrorCode::BadRequest,
            format!(
                "unsupported protocol version {} (expected {})",
                req.version, PROTOCOL_VERSION
            ),
        );
    }

    match req.op {
        Op::Create => handle_create(&req, state).await,
        Op::Get => handle_get(&req, &state.store).await,
        Op::Set => handle_set(&req, state).await,
        Op::Delete => handle_delete(&req, state).await,
        Op::Exists => handle_exists(&req, &state.store).await,
        Op::Children => handle_children(&req, &state.store).await,
        Op::Ping => Response::success(None),
    }
}

async fn handle_create(req: &Request, state: &ServerState) -> Response {
    let data = req.data.clone().unwrap_or_default();
    match state.store.create(&req.path, data).await {
        Ok(()) => {
            state
                .txn_log
                .append(Op::Create, &req.path, req.data.as_deref());
            Response::success(None)
        }
        Err(e) => store_error_response(e),
    }
}

async fn handle_get(req: &Request, store: &NodeStore) -> Response {
    match store.get(&req.path).await {
        Ok(node) => Response::success(Some(serde_json::json!({
            "data": node.data,
            "version": node.version,
        }))),
        Err(e) => store_error_response(e),
    }
}

async fn handle_set(req: &Request, state: &ServerState) -> Response {
    let Some(data) = req.data.clone() else {
        return Response::error(ErrorCode::BadRequest, "set requires data");
    };
    match state.store.set(&req.path, data).await {
        Ok(version) => {
            state.txn_log.append(Op::Set, &req.path, req.data.as_deref());
            Response::success(Some(serde_json::json!({ "version": version })))
        }
        Err(e) => store_error_response(e),
    }
}

async fn handle_delete(req: &Request, state: &ServerState) -> Response {
    match state.store.delete(&req.path).await {
        Ok(()) => {
            state.txn_log.append(Op::Delete, &req.path, None);
            Response::success(None)
        }
        Err(e) => store_error_response(e),
    }
}

async fn handle_exists(req: &Request, store: &NodeStore) -> Response {
    match store.exists(&req.path).await {
        Ok(exists) => Response::success(Some(serde_json::Value::Bool(exists))),
        Err(e) => store_error_response(e),
    }
}

async fn handle_children(req: &Request, store: &NodeStore) -> Response {
    match store.children(&req.path).await {
        Ok(children) => Response::success(Some(serde_json::json!(children))),
        Err(e) => store_error_response(e),
    }
}

fn store_error_response(err: StoreError) -> Response {
    let code = match err {
        StoreError::NoNode(_) => ErrorCode::NoNode,
        StoreError::NodeExists(_) => ErrorCode::NodeExists,
        StoreError::NotEmpty(_) => ErrorCode::NotEmpty,
        StoreError::InvalidPath(_) => ErrorCode::BadRequest,
    };
    Response::error(code, err.to_string())
}
