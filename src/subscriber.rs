//! Reconfiguration path: applies pub/sub messages to the service registry
//!
//! One long-lived task consumes the channel, one message at a time, in
//! arrival order. Each message is the full replacement for its subdomain.
//! Decode and construction failures are logged and skipped; only transport
//! termination ends the loop, which the gateway treats as fatal.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::handler::{ChainBuilders, ServiceHandler};
use crate::registry::ServiceRegistry;
use crate::service::ServiceRecord;

/// Outcome of applying one message, for logs and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Added(String),
    Removed(String),
    /// Decode or construction failure; the registry is untouched
    Rejected,
}

/// Decode one payload and apply it to the registry
pub fn apply_message(
    registry: &ServiceRegistry,
    builders: &ChainBuilders,
    payload: &str,
) -> Applied {
    let record: ServiceRecord = match serde_json::from_str(payload) {
        Ok(record) => record,
        Err(e) => {
            warn!(error = %e, "failed to decode service record, skipping");
            return Applied::Rejected;
        }
    };

    if record.disabled {
        let subdomain = record.subdomain.to_lowercase();
        registry.remove(&subdomain);
        return Applied::Removed(subdomain);
    }

    match ServiceHandler::build(record, builders) {
        Ok(handler) => {
            if handler.subdomain().is_empty() {
                warn!("rejected service record with empty subdomain");
                return Applied::Rejected;
            }
            let subdomain = handler.subdomain().to_string();
            registry.add(Arc::new(handler));
            Applied::Added(subdomain)
        }
        Err(e) => {
            warn!(error = %e, "rejected service record, skipping");
            Applied::Rejected
        }
    }
}

/// Consume the subscription to exhaustion
pub async fn run(
    registry: Arc<ServiceRegistry>,
    builders: Arc<ChainBuilders>,
    mut messages: mpsc::Receiver<String>,
) {
    while let Some(payload) = messages.recv().await {
        apply_message(&registry, &builders, &payload);
    }
    error!("service channel subscription terminated");
}
