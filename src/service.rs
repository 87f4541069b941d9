//! Declarative description of one routable backend service
//!
//! Records arrive as JSON over the pub/sub channel and as preloaded entries
//! in the gateway settings. Everything except `subdomain` is defaulted so a
//! disable-only message (`{"subdomain":"orders","disabled":true}`) decodes.

use serde::{Deserialize, Serialize};

/// Pipeline phase a transformer is bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    #[default]
    Request,
    Response,
}

/// A named middleware with its configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiddlewareSpec {
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

/// A named transformer with its configuration and declared phase
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransformerSpec {
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub phase: Phase,
}

/// Declarative description of one routable backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Registry key; lowercase DNS label(s) left of the gateway's base host
    pub subdomain: String,

    /// Absolute upstream base URL; validated when the handler is built
    #[serde(default)]
    pub endpoint: String,

    /// Opaque identifiers used by the admin side only
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub team: String,

    /// Ordered middleware chain; first entry is outermost
    #[serde(default)]
    pub middlewares: Vec<MiddlewareSpec>,

    /// Ordered transformer chain, each entry bound to a phase
    #[serde(default)]
    pub transformers: Vec<TransformerSpec>,

    /// True means the service is removed from the registry
    #[serde(default)]
    pub disabled: bool,
}

impl ServiceRecord {
    pub fn new(subdomain: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            subdomain: subdomain.into(),
            endpoint: endpoint.into(),
            owner: String::new(),
            team: String::new(),
            middlewares: Vec::new(),
            transformers: Vec::new(),
            disabled: false,
        }
    }
}
