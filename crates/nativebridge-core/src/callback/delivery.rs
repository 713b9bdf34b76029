//! Serialized delivery to the script engine.
//!
//! All script callbacks funnel through one queue drained by a single task, so
//! the order the script observes matches the order responses were delivered.

use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::response::Response;

/// The embedded interpreter, as far as callbacks are concerned.
pub trait ScriptEngine: Send + Sync {
    /// Run the script-side callback dispatcher with a
    /// `{"callback": token, "data": {"code", "content"}}` payload.
    fn execute_callback(&self, payload: String);
}

/// Engine that only logs. Default for hosts without a script runtime.
pub struct TracingScriptEngine;

impl ScriptEngine for TracingScriptEngine {
    fn execute_callback(&self, payload: String) {
        tracing::info!(payload = %payload, "Script callback");
    }
}

impl ScriptEngine for mpsc::UnboundedSender<String> {
    fn execute_callback(&self, payload: String) {
        if self.send(payload).is_err() {
            tracing::debug!("Script engine channel closed");
        }
    }
}

struct Delivery {
    token: String,
    response: Response,
}

/// Handle to the delivery task. Cheap to clone.
#[derive(Clone)]
pub struct DeliveryQueue {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl DeliveryQueue {
    /// Start the delivery task on the current runtime.
    ///
    /// Payloads whose serialized form exceeds `max_payload_bytes` are replaced
    /// by an OOM response for the same token.
    pub fn spawn(engine: Arc<dyn ScriptEngine>, max_payload_bytes: usize) -> Self {
        Self::spawn_on(engine, max_payload_bytes, &tokio::runtime::Handle::current())
    }

    pub fn spawn_on(
        engine: Arc<dyn ScriptEngine>,
        max_payload_bytes: usize,
        handle: &tokio::runtime::Handle,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        handle.spawn(async move {
            while let Some(delivery) = rx.recv().await {
                let payload = encode(&delivery, max_payload_bytes);
                engine.execute_callback(payload);
            }
            tracing::debug!("Delivery queue closed");
        });
        Self { tx }
    }

    pub fn push(&self, token: String, response: Response) {
        if self.tx.send(Delivery { token, response }).is_err() {
            tracing::warn!("Delivery queue stopped, response dropped");
        }
    }
}

fn encode(delivery: &Delivery, max_payload_bytes: usize) -> String {
    let payload = serde_json::to_string(&json!({
        "callback": delivery.token,
        "data": delivery.response.to_json(),
    }));
    match payload {
        Ok(payload) if payload.len() <= max_payload_bytes => payload,
        Ok(payload) => {
            tracing::error!(callback = %delivery.token, bytes = payload.len(), limit = max_payload_bytes, "Callback payload too large");
            oom_payload(&delivery.token)
        }
        Err(err) => {
            tracing::error!(callback = %delivery.token, error = %err, "Failed to serialize callback payload");
            oom_payload(&delivery.token)
        }
    }
}

fn oom_payload(token: &str) -> String {
    json!({
        "callback": token,
        "data": Response::oom().to_json(),
    })
    .to_string()
}
