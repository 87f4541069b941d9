//! Compiled form of a service record: the runtime object requests run against
//!
//! A [`ServiceHandler`] owns a reverse-proxy client bound to one upstream
//! endpoint plus the resolved middleware and transformer chains. Handlers are
//! shared out of the registry as `Arc`s, so replacing a service does not
//! invalidate requests already running against the old handler; the client's
//! connection pool is dropped with the last reference.

use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::http::uri::{Authority, Scheme, Uri};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use crate::error::GatewayError;
use crate::middleware::{Middleware, MiddlewareRegistry};
use crate::service::{Phase, ServiceRecord};
use crate::transformer::{Transformer, TransformerRegistry};
use crate::ProxyBody;

/// Why a service record was rejected during handler construction
#[derive(Debug)]
pub enum BuildError {
    /// The endpoint is not an absolute http/https URL
    MalformedEndpoint { endpoint: String, reason: String },
    /// No builder registered under the middleware name
    UnknownMiddleware(String),
    /// No builder registered under the transformer name
    UnknownTransformer(String),
    /// A builder rejected its configuration
    InvalidConfig { name: String, reason: String },
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildError::MalformedEndpoint { endpoint, reason } => {
                write!(f, "malformed endpoint '{}': {}", endpoint, reason)
            }
            BuildError::UnknownMiddleware(name) => write!(f, "unknown middleware '{}'", name),
            BuildError::UnknownTransformer(name) => write!(f, "unknown transformer '{}'", name),
            BuildError::InvalidConfig { name, reason } => {
                write!(f, "invalid config for '{}': {}", name, reason)
            }
        }
    }
}

impl std::error::Error for BuildError {}

/// The named builders both chains resolve against, supplied at construction
pub struct ChainBuilders {
    pub middlewares: MiddlewareRegistry,
    pub transformers: TransformerRegistry,
}

impl ChainBuilders {
    pub fn empty() -> Self {
        Self {
            middlewares: MiddlewareRegistry::empty(),
            transformers: TransformerRegistry::empty(),
        }
    }

    /// Builders for all built-in middlewares and transformers
    pub fn builtin() -> Self {
        Self {
            middlewares: MiddlewareRegistry::builtin(),
            transformers: TransformerRegistry::builtin(),
        }
    }
}

/// Idle-pool knobs for the per-handler upstream client
const POOL_MAX_IDLE_PER_HOST: usize = 10;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// The compiled form of a [`ServiceRecord`]
pub struct ServiceHandler {
    record: ServiceRecord,
    subdomain: String,
    scheme: Scheme,
    authority: Authority,
    /// Endpoint base path with any trailing slash removed; empty for "/"
    base_path: String,
    client: Client<HttpConnector, ProxyBody>,
    middlewares: Vec<Arc<dyn Middleware>>,
    request_transformers: Vec<Arc<dyn Transformer>>,
    response_transformers: Vec<Arc<dyn Transformer>>,
}

impl ServiceHandler {
    /// Compile a record: parse the endpoint, resolve both chains in declared
    /// order, and bind a client to the upstream.
    pub fn build(record: ServiceRecord, builders: &ChainBuilders) -> Result<Self, BuildError> {
        let malformed = |reason: String| BuildError::MalformedEndpoint {
            endpoint: record.endpoint.clone(),
            reason,
        };

        let uri: Uri = record
            .endpoint
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| malformed(e.to_string()))?;

        let scheme = match uri.scheme() {
            Some(s) if *s == Scheme::HTTP || *s == Scheme::HTTPS => s.clone(),
            Some(s) => return Err(malformed(format!("unsupported scheme '{}'", s))),
            None => return Err(malformed("missing scheme".to_string())),
        };
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| malformed("missing host".to_string()))?;
        let base_path = uri.path().trim_end_matches('/').to_string();

        let mut middlewares = Vec::with_capacity(record.middlewares.len());
        for spec in &record.middlewares {
            middlewares.push(builders.middlewares.build(spec)?);
        }

        let mut request_transformers = Vec::new();
        let mut response_transformers = Vec::new();
        for spec in &record.transformers {
            let transformer = builders.transformers.build(spec)?;
            match spec.phase {
                Phase::Request => request_transformers.push(transformer),
                Phase::Response => response_transformers.push(transformer),
            }
        }

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build(connector);

        let subdomain = record.subdomain.to_lowercase();

        Ok(Self {
            record,
            subdomain,
            scheme,
            authority,
            base_path,
            client,
            middlewares,
            request_transformers,
            response_transformers,
        })
    }

    /// Registry key: the record's subdomain, lowercased
    pub fn subdomain(&self) -> &str {
        &self.subdomain
    }

    pub fn record(&self) -> &ServiceRecord {
        &self.record
    }

    /// Upstream authority, also the rewritten `Host` value
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn middlewares(&self) -> &[Arc<dyn Middleware>] {
        &self.middlewares
    }

    pub fn request_transformers(&self) -> &[Arc<dyn Transformer>] {
        &self.request_transformers
    }

    pub fn response_transformers(&self) -> &[Arc<dyn Transformer>] {
        &self.response_transformers
    }

    /// Rebase a request's path and query onto the upstream endpoint
    pub fn upstream_uri(&self, req_uri: &Uri) -> Result<Uri, GatewayError> {
        let path_and_query = req_uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        let full = if self.base_path.is_empty() {
            path_and_query.to_string()
        } else {
            format!("{}{}", self.base_path, path_and_query)
        };

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(full.as_str())
            .build()
            .map_err(|e| GatewayError::internal(format!("upstream uri invalid: {}", e)))
    }

    /// Send a request to the upstream through the handler's pooled client
    pub async fn send(
        &self,
        req: Request<ProxyBody>,
    ) -> Result<Response<Incoming>, hyper_util::client::legacy::Error> {
        self.client.request(req).await
    }
}
