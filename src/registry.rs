//! Concurrent mapping from subdomain to service handler
//!
//! Read on every request, mutated by the reconfiguration path. Lookups run
//! under the read lock and clone the `Arc` out, so an in-flight request keeps
//! its handler alive across a concurrent replacement.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::handler::ServiceHandler;

#[derive(Default)]
pub struct ServiceRegistry {
    services: RwLock<HashMap<String, Arc<ServiceHandler>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert under the handler's subdomain, replacing any prior entry.
    /// An empty subdomain is rejected with a warning.
    pub fn add(&self, handler: Arc<ServiceHandler>) {
        let subdomain = handler.subdomain().to_string();
        if subdomain.is_empty() {
            warn!("refusing to register service with empty subdomain");
            return;
        }

        let replaced = self
            .services
            .write()
            .insert(subdomain.clone(), handler)
            .is_some();
        info!(subdomain, replaced, "service registered");
    }

    /// Delete any entry under the subdomain; unknown subdomains are a no-op
    pub fn remove(&self, subdomain: &str) {
        let removed = self.services.write().remove(subdomain).is_some();
        if removed {
            info!(subdomain, "service removed");
        }
    }

    /// Look up the handler for a subdomain, sharing it out of the lock
    pub fn lookup(&self, subdomain: &str) -> Option<Arc<ServiceHandler>> {
        self.services.read().get(subdomain).cloned()
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }

    /// Registered subdomains, for logs and introspection
    pub fn subdomains(&self) -> Vec<String> {
        self.services.read().keys().cloned().collect()
    }
}
