use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::debug;
use uuid::Uuid;

use crate::errors::RelmError;
use crate::wire::{LmRequest, PendingEntry, PendingList, RespondRequest, WireError};

/// How long an enqueued request waits for a response before giving up.
pub const DEFAULT_ENQUEUE_TIMEOUT: Duration = Duration::from_secs(300);

struct PendingRequest {
    request: LmRequest,
    responder: oneshot::Sender<Value>,
}

struct BrokerState {
    pending: Mutex<HashMap<Uuid, PendingRequest>>,
    enqueue_timeout: Duration,
}

/// Request-queue half of the remote callback protocol.
///
/// Runs on the sandbox side, where the host cannot be dialed directly:
/// sandboxed code `POST`s to `/enqueue` and blocks until the host-side poller
/// picks the request up via `GET /pending` and posts the answer back via
/// `POST /respond`. A pending request is resolved at most once; the `respond`
/// handler removes it from the queue before delivering, so a second answer
/// for the same id reports not-found.
#[derive(Clone)]
pub struct CallbackBroker {
    state: Arc<BrokerState>,
}

impl Default for CallbackBroker {
    fn default() -> Self {
        Self::new(DEFAULT_ENQUEUE_TIMEOUT)
    }
}

impl CallbackBroker {
    pub fn new(enqueue_timeout: Duration) -> Self {
        Self {
            state: Arc::new(BrokerState {
                pending: Mutex::new(HashMap::new()),
                enqueue_timeout,
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_route))
            .route("/enqueue", post(enqueue_route))
            .route("/pending", get(pending_route))
            .route("/respond", post(respond_route))
            .with_state(self.state.clone())
    }

    /// Bind the broker on the given address and serve it on a background
    /// task. Returns the bound address and a guard that stops the server
    /// when dropped or explicitly shut down.
    pub async fn serve(&self, addr: impl Into<SocketAddr>) -> Result<BrokerServer, RelmError> {
        let listener = tokio::net::TcpListener::bind(addr.into())
            .await
            .map_err(|error| RelmError::Http(format!("failed to bind broker: {error}")))?;
        let addr = listener
            .local_addr()
            .map_err(|error| RelmError::Http(error.to_string()))?;
        let (shutdown, rx) = oneshot::channel::<()>();
        let router = self.router();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = rx.await;
            });
            let _ = serve.await;
        });
        Ok(BrokerServer {
            addr,
            shutdown: Some(shutdown),
            task: Some(task),
        })
    }

    pub fn pending_count(&self) -> usize {
        self.state
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

/// Handle to a served broker instance.
pub struct BrokerServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl BrokerServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn shutdown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(Duration::from_secs(2), task).await;
        }
    }
}

impl Drop for BrokerServer {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn health_route() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn enqueue_route(
    State(state): State<Arc<BrokerState>>,
    Json(request): Json<LmRequest>,
) -> Result<Json<Value>, (StatusCode, Json<WireError>)> {
    let id = Uuid::new_v4();
    let (responder, receiver) = oneshot::channel();
    {
        let mut pending = state
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pending.insert(id, PendingRequest { request, responder });
    }
    debug!(%id, "request enqueued");

    match tokio::time::timeout(state.enqueue_timeout, receiver).await {
        Ok(Ok(response)) => Ok(Json(response)),
        // Responder dropped without an answer; treat like a timeout.
        Ok(Err(_)) | Err(_) => {
            let mut pending = state
                .pending
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            pending.remove(&id);
            Err((
                StatusCode::GATEWAY_TIMEOUT,
                Json(WireError::new("request timed out")),
            ))
        }
    }
}

async fn pending_route(State(state): State<Arc<BrokerState>>) -> Json<PendingList> {
    let pending = state
        .pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let entries = pending
        .iter()
        .map(|(id, entry)| PendingEntry {
            id: *id,
            request: entry.request.clone(),
        })
        .collect();
    Json(PendingList { pending: entries })
}

async fn respond_route(
    State(state): State<Arc<BrokerState>>,
    Json(payload): Json<RespondRequest>,
) -> Result<Json<Value>, (StatusCode, Json<WireError>)> {
    let entry = {
        let mut pending = state
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        pending.remove(&payload.id)
    };

    match entry {
        Some(entry) => {
            // The enqueuer may have timed out already; nothing to deliver to.
            if entry.responder.send(payload.response).is_err() {
                debug!(id = %payload.id, "enqueuer gone before response arrived");
            }
            Ok(Json(json!({"status": "ok"})))
        }
        None => Err((
            StatusCode::NOT_FOUND,
            Json(WireError::new("request not found")),
        )),
    }
}
