//! Pub/sub subscribe contract and an in-process implementation
//!
//! The transport carrying service records is an external collaborator; the
//! gateway only requires its subscribe contract: a named channel yields a
//! stream of opaque payloads, and the stream closing is the termination
//! signal. [`LocalBus`] implements the contract in-process for embedders and
//! tests; production deployments adapt their broker to [`ServiceBus`].

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

/// Buffered messages per subscription; publishers wait when a subscriber lags
const SUBSCRIPTION_BUFFER: usize = 64;

/// Subscribe contract of the pub/sub collaborator
pub trait ServiceBus: Send + Sync {
    /// Subscribe to a named channel. Messages arrive in publish order; the
    /// receiver yielding `None` means the subscription terminated.
    fn subscribe(&self, channel: &str) -> mpsc::Receiver<String>;
}

/// In-process bus: every publish fans out to all current subscribers
#[derive(Default)]
pub struct LocalBus {
    channels: Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a payload to all subscribers of a channel, in order
    pub async fn publish(&self, channel: &str, payload: impl Into<String>) {
        let payload = payload.into();
        let senders: Vec<_> = {
            let mut channels = self.channels.lock();
            match channels.get_mut(channel) {
                Some(senders) => {
                    senders.retain(|s| !s.is_closed());
                    senders.clone()
                }
                None => return,
            }
        };

        debug!(channel, subscribers = senders.len(), "publishing message");
        for sender in senders {
            // a receiver dropped between the snapshot and here is fine
            let _ = sender.send(payload.clone()).await;
        }
    }
}

impl ServiceBus for LocalBus {
    fn subscribe(&self, channel: &str) -> mpsc::Receiver<String> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        rx
    }
}
