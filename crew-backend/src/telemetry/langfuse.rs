//! Export of trace events to a Langfuse collector
//!
//! Events are batched and posted to the public ingestion API. Any failure is
//! logged and the batch dropped; the crew never waits on the collector.

use super::events::{EventType, TraceEvent};
use crate::config::LangfuseConfig;
use crate::error::ConfigError;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const MAX_BATCH: usize = 20;
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);

pub struct LangfuseExporter {
    client: Client,
    ingestion_url: String,
    public_key: String,
    secret_key: String,
}

impl LangfuseExporter {
    pub fn new(config: &LangfuseConfig) -> Result<Self, ConfigError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ConfigError::HttpClient(e.to_string()))?;

        Ok(Self {
            client,
            ingestion_url: format!("{}/api/public/ingestion", config.host),
            public_key: config.public_key.clone(),
            secret_key: config.secret_key.clone(),
        })
    }

    /// Consume events until the channel closes, flushing in batches
    pub fn spawn(self, mut rx: mpsc::UnboundedReceiver<TraceEvent>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut batch: Vec<TraceEvent> = Vec::with_capacity(MAX_BATCH);
            let mut ticker = tokio::time::interval(FLUSH_INTERVAL);

            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Some(event) => {
                            batch.push(event);
                            if batch.len() >= MAX_BATCH {
                                self.flush(&mut batch).await;
                            }
                        }
                        None => {
                            self.flush(&mut batch).await;
                            log::info!("[TRACE] Langfuse exporter stopped");
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        self.flush(&mut batch).await;
                    }
                }
            }
        })
    }

    async fn flush(&self, batch: &mut Vec<TraceEvent>) {
        if batch.is_empty() {
            return;
        }
        let events = std::mem::take(batch);
        if let Err(e) = self.send(&events).await {
            log::warn!("[TRACE] Dropped {} event(s): {}", events.len(), e);
        }
    }

    /// Post one batch to the ingestion endpoint
    pub async fn send(&self, events: &[TraceEvent]) -> Result<(), String> {
        let body = json!({
            "batch": events.iter().map(to_ingestion_item).collect::<Vec<_>>()
        });

        let response = self
            .client
            .post(&self.ingestion_url)
            .basic_auth(&self.public_key, Some(&self.secret_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(format!("collector returned {}: {}", status, text));
        }

        log::debug!("[TRACE] Exported {} event(s)", events.len());
        Ok(())
    }
}

/// Map a trace event onto a Langfuse ingestion item
pub fn to_ingestion_item(event: &TraceEvent) -> Value {
    let timestamp = event.timestamp.to_rfc3339();
    let level = if event.is_error() { "ERROR" } else { "DEFAULT" };

    let (item_type, body) = if event.is(EventType::Startup) {
        (
            "trace-create",
            json!({
                "id": event.id,
                "name": "startup",
                "timestamp": timestamp,
                "metadata": event.data
            }),
        )
    } else if event.is(EventType::RunStarted) {
        (
            "trace-create",
            json!({
                "id": event.run_id,
                "name": "crew-run",
                "timestamp": timestamp,
                "input": event.data.get("goal"),
                "metadata": event.data
            }),
        )
    } else if event.is(EventType::RunCompleted) {
        (
            "trace-create",
            json!({
                "id": event.run_id,
                "output": event.data.get("output"),
                "tags": [event.data.get("status")],
            }),
        )
    } else if event.is(EventType::ModelGeneration) {
        (
            "generation-create",
            json!({
                "id": event.id,
                "traceId": event.run_id,
                "name": format!("task:{}", event.task_id.as_deref().unwrap_or("-")),
                "model": event.data.get("model"),
                "startTime": timestamp,
                "output": event.data.get("output"),
                "level": level,
                "metadata": event.data
            }),
        )
    } else {
        (
            "event-create",
            json!({
                "id": event.id,
                "traceId": event.run_id,
                "name": event.event,
                "startTime": timestamp,
                "level": level,
                "metadata": {
                    "task_id": event.task_id,
                    "data": event.data
                }
            }),
        )
    };

    json!({
        "id": uuid::Uuid::new_v4().to_string(),
        "type": item_type,
        "timestamp": timestamp,
        "body": body
    })
}
