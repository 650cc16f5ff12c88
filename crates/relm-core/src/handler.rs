use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use futures::StreamExt;
use relm_llm::{LmClient, Prompt, UsageSummary};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::RelmError;
use crate::types::CompletionRecord;
use crate::wire::{BatchSlot, CompleteBatchResponse, CompleteResponse, LmRequest, WireError};

/// Concurrent in-flight completions per batch.
const MAX_BATCH_CONCURRENCY: usize = 8;

struct ServerHandle {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Host-side completion broker.
///
/// Owns the root client plus any clients registered for sub-calls, executes
/// completion requests addressed by model name, and keeps the usage ledger.
/// `start` binds a loopback HTTP endpoint so that execution environments on
/// other machines can reach `complete` / `complete_batch`; in-process callers
/// use the methods directly.
pub struct LmHandler {
    clients: HashMap<String, Arc<dyn LmClient>>,
    default_model: String,
    ledger: Mutex<UsageSummary>,
    server: Mutex<Option<ServerHandle>>,
}

impl LmHandler {
    pub fn new(root_client: Arc<dyn LmClient>) -> Self {
        let default_model = root_client.model_name().to_string();
        Self {
            clients: HashMap::from([(default_model.clone(), root_client)]),
            default_model,
            ledger: Mutex::new(UsageSummary::default()),
            server: Mutex::new(None),
        }
    }

    /// Register an additional named client available to sub-calls.
    pub fn register(&mut self, model_name: impl Into<String>, client: Arc<dyn LmClient>) {
        self.clients.insert(model_name.into(), client);
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub async fn complete(
        &self,
        prompt: &Prompt,
        model: Option<&str>,
    ) -> Result<String, RelmError> {
        Ok(self.complete_record(prompt, model).await?.response)
    }

    /// Execute one completion and return the full record, including the
    /// ledger snapshot at the time of the call.
    pub async fn complete_record(
        &self,
        prompt: &Prompt,
        model: Option<&str>,
    ) -> Result<CompletionRecord, RelmError> {
        let (name, client) = self.resolve(model)?;
        let started = Instant::now();
        let completion = client.complete(prompt).await?;
        let usage = {
            let mut ledger = self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            ledger.record(&name, completion.usage);
            ledger.clone()
        };
        let duration_ms = started.elapsed().as_millis() as u64;
        debug!(model = %name, duration_ms, "completion serviced");
        Ok(CompletionRecord {
            model: name,
            prompt: prompt.clone(),
            response: completion.text,
            usage,
            duration_ms,
        })
    }

    /// Fan a batch of prompts out concurrently. The result order matches the
    /// input order regardless of completion order, and one failed slot does
    /// not affect the others.
    pub async fn complete_batch(
        &self,
        prompts: &[String],
        model: Option<&str>,
    ) -> Vec<Result<CompletionRecord, RelmError>> {
        // Futures are built up front so the stream owns them outright.
        let calls: Vec<_> = prompts
            .iter()
            .cloned()
            .map(|prompt| self.complete_record_owned(Prompt::Text(prompt), model))
            .collect();
        futures::stream::iter(calls)
            .buffered(MAX_BATCH_CONCURRENCY)
            .collect()
            .await
    }

    /// Batched completion as ordered texts, failures folded into marker
    /// strings the calling code can inspect.
    pub async fn complete_batch_texts(
        &self,
        prompts: &[String],
        model: Option<&str>,
    ) -> Vec<String> {
        self.complete_batch(prompts, model)
            .await
            .into_iter()
            .map(|slot| match slot {
                Ok(record) => record.response,
                Err(error) => format!("Error: {error}"),
            })
            .collect()
    }

    pub fn usage_summary(&self) -> UsageSummary {
        self.ledger
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Bind the HTTP surface on a loopback port and return its address.
    /// Calling `start` on an already-running handler returns the bound
    /// address again.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, RelmError> {
        if let Some(addr) = self.addr() {
            return Ok(addr);
        }

        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|error| RelmError::Http(format!("failed to bind handler endpoint: {error}")))?;
        let addr = listener
            .local_addr()
            .map_err(|error| RelmError::Http(error.to_string()))?;

        let router = handler_router(self.clone());
        let (shutdown, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = rx.await;
            });
            if let Err(error) = serve.await {
                warn!(%error, "handler endpoint terminated");
            }
        });

        let mut server = self.server.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *server = Some(ServerHandle {
            addr,
            shutdown,
            task,
        });
        debug!(%addr, "handler endpoint started");
        Ok(addr)
    }

    /// The address environments use to reach this handler, if started.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.server
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map(|handle| handle.addr)
    }

    /// Release the listening socket. Idempotent, and safe to call when
    /// `start` never ran or partially failed.
    pub async fn stop(&self) {
        let handle = self
            .server
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.shutdown.send(());
            if tokio::time::timeout(std::time::Duration::from_secs(2), handle.task)
                .await
                .is_err()
            {
                warn!("handler endpoint did not shut down in time");
            }
        }
    }

    fn resolve(&self, model: Option<&str>) -> Result<(String, Arc<dyn LmClient>), RelmError> {
        let name = match model {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.default_model.clone(),
        };
        let client = self.clients.get(&name).cloned().ok_or_else(|| {
            RelmError::Configuration(format!("no client registered for model '{name}'"))
        })?;
        Ok((name, client))
    }

    async fn complete_record_owned(
        &self,
        prompt: Prompt,
        model: Option<&str>,
    ) -> Result<CompletionRecord, RelmError> {
        self.complete_record(&prompt, model).await
    }
}

fn handler_router(handler: Arc<LmHandler>) -> Router {
    Router::new()
        .route("/complete", post(complete_route))
        .route("/complete_batch", post(complete_batch_route))
        .with_state(handler)
}

async fn complete_route(
    State(handler): State<Arc<LmHandler>>,
    Json(request): Json<LmRequest>,
) -> Result<Json<CompleteResponse>, (StatusCode, Json<WireError>)> {
    match request {
        LmRequest::Single { prompt, model } => {
            match handler.complete_record(&prompt, model.as_deref()).await {
                Ok(record) => Ok(Json(CompleteResponse {
                    response: record.response,
                    model: record.model,
                    usage: record.usage,
                })),
                Err(error) => Err((
                    StatusCode::BAD_GATEWAY,
                    Json(WireError::new(error.to_string())),
                )),
            }
        }
        LmRequest::Batched { .. } => Err((
            StatusCode::BAD_REQUEST,
            Json(WireError::new("batched request sent to /complete")),
        )),
    }
}

async fn complete_batch_route(
    State(handler): State<Arc<LmHandler>>,
    Json(request): Json<LmRequest>,
) -> Result<Json<CompleteBatchResponse>, (StatusCode, Json<WireError>)> {
    match request {
        LmRequest::Batched { prompts, model } => {
            let slots = handler
                .complete_batch(&prompts, model.as_deref())
                .await
                .into_iter()
                .map(|slot| match slot {
                    Ok(record) => BatchSlot::Ok {
                        response: record.response,
                    },
                    Err(error) => BatchSlot::Error {
                        error: error.to_string(),
                    },
                })
                .collect();
            let model = model.unwrap_or_else(|| handler.default_model().to_string());
            Ok(Json(CompleteBatchResponse {
                slots,
                model,
                usage: handler.usage_summary(),
            }))
        }
        LmRequest::Single { .. } => Err((
            StatusCode::BAD_REQUEST,
            Json(WireError::new("single request sent to /complete_batch")),
        )),
    }
}
