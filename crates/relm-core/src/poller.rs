use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use relm_llm::Prompt;
use serde_json::{Value, json};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::types::CompletionRecord;
use crate::wire::{
    BatchSlot, CompleteBatchResponse, CompleteResponse, LmRequest, PendingList, WireError,
};

/// Fixed interval between polls of the sandbox broker.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Host-side bridge of the remote callback protocol.
///
/// A dedicated task polls the sandbox broker for unanswered requests,
/// forwards each to the handler endpoint, and posts the result back by
/// request id. Every serviced call lands in the shared record list so the
/// environment can attach it to the next execution result. Transport errors
/// are logged and retried on the next tick.
pub struct BrokerPoller {
    stop_flag: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl BrokerPoller {
    pub fn start(
        broker_url: String,
        handler_addr: SocketAddr,
        records: Arc<Mutex<Vec<CompletionRecord>>>,
    ) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let task = tokio::spawn(async move {
            let http = reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default();
            while !flag.load(Ordering::SeqCst) {
                if let Err(error) = poll_once(&http, &broker_url, handler_addr, &records).await {
                    debug!(%error, "broker poll failed; retrying");
                }
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        });
        Self {
            stop_flag,
            task: Some(task),
        }
    }

    /// Stop the polling task with a bounded join. Safe to call repeatedly.
    pub async fn stop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                warn!("broker poller did not stop in time");
            }
        }
    }
}

impl Drop for BrokerPoller {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn poll_once(
    http: &reqwest::Client,
    broker_url: &str,
    handler_addr: SocketAddr,
    records: &Arc<Mutex<Vec<CompletionRecord>>>,
) -> Result<(), reqwest::Error> {
    let list: PendingList = http
        .get(format!("{broker_url}/pending"))
        .send()
        .await?
        .json()
        .await?;

    for entry in list.pending {
        let response = forward_request(http, handler_addr, &entry.request, records).await;
        let Some(response) = response else {
            // Transport failure toward the handler; leave the request pending
            // for the next tick.
            continue;
        };
        let posted = http
            .post(format!("{broker_url}/respond"))
            .json(&json!({"id": entry.id, "response": response}))
            .send()
            .await?;
        if !posted.status().is_success() {
            debug!(id = %entry.id, status = %posted.status(), "respond rejected");
        }
    }
    Ok(())
}

async fn forward_request(
    http: &reqwest::Client,
    handler_addr: SocketAddr,
    request: &LmRequest,
    records: &Arc<Mutex<Vec<CompletionRecord>>>,
) -> Option<Value> {
    match request {
        LmRequest::Single { prompt, .. } => {
            let started = Instant::now();
            let response = http
                .post(format!("http://{handler_addr}/complete"))
                .json(request)
                .send()
                .await
                .ok()?;
            if response.status().is_success() {
                let body: CompleteResponse = response.json().await.ok()?;
                push_record(
                    records,
                    CompletionRecord {
                        model: body.model.clone(),
                        prompt: prompt.clone(),
                        response: body.response.clone(),
                        usage: body.usage,
                        duration_ms: started.elapsed().as_millis() as u64,
                    },
                );
                Some(json!({"response": body.response}))
            } else {
                let error: WireError = response
                    .json()
                    .await
                    .unwrap_or_else(|_| WireError::new("completion failed"));
                Some(json!({"error": error.error}))
            }
        }
        LmRequest::Batched { prompts, .. } => {
            let started = Instant::now();
            let response = http
                .post(format!("http://{handler_addr}/complete_batch"))
                .json(request)
                .send()
                .await
                .ok()?;
            if response.status().is_success() {
                let body: CompleteBatchResponse = response.json().await.ok()?;
                let duration_ms = started.elapsed().as_millis() as u64;
                for (prompt, slot) in prompts.iter().zip(&body.slots) {
                    if let BatchSlot::Ok { response } = slot {
                        push_record(
                            records,
                            CompletionRecord {
                                model: body.model.clone(),
                                prompt: Prompt::Text(prompt.clone()),
                                response: response.clone(),
                                usage: body.usage.clone(),
                                duration_ms,
                            },
                        );
                    }
                }
                let texts: Vec<String> =
                    body.slots.into_iter().map(BatchSlot::into_text).collect();
                Some(json!({"responses": texts}))
            } else {
                let error: WireError = response
                    .json()
                    .await
                    .unwrap_or_else(|_| WireError::new("batched completion failed"));
                Some(json!({"error": error.error, "responses": Value::Null}))
            }
        }
    }
}

fn push_record(records: &Arc<Mutex<Vec<CompletionRecord>>>, record: CompletionRecord) {
    records
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .push(record);
}
