//! Transformer abstraction: request- and response-phase mutators
//!
//! Transformers run as pipeline stages, mutating headers, URL or body in
//! place: request-phase transformers before the middleware chain, response-
//! phase transformers on the upstream response before any middleware sees
//! it. A transformer may abort the request with a structured error carrying
//! the status it chooses. Same concurrency contract as middlewares.

use std::collections::HashMap;

use async_trait::async_trait;
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::http::uri::Uri;
use hyper::{Request, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;

use crate::error::GatewayError;
use crate::handler::BuildError;
use crate::middleware::parse_config;
use crate::service::{Phase, TransformerSpec};
use crate::ProxyBody;

/// A request- or response-phase mutator
#[async_trait]
pub trait Transformer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn transform_request(&self, req: &mut Request<ProxyBody>) -> Result<(), GatewayError> {
        let _ = req;
        Ok(())
    }

    async fn transform_response(&self, resp: &mut Response<ProxyBody>) -> Result<(), GatewayError> {
        let _ = resp;
        Ok(())
    }
}

/// Builder resolving a transformer spec's config and phase into an instance
pub type TransformerBuilder =
    dyn Fn(&serde_json::Value, Phase) -> Result<Arc<dyn Transformer>, BuildError> + Send + Sync;

/// Named transformer builders, supplied at gateway construction
pub struct TransformerRegistry {
    builders: HashMap<String, Box<TransformerBuilder>>,
}

impl TransformerRegistry {
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Registry with the built-in transformers registered
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("headers", HeaderMutator::build);
        registry.register("strip_prefix", StripPrefix::build);
        registry.register("require_header", RequireHeader::build);
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, builder: F)
    where
        F: Fn(&serde_json::Value, Phase) -> Result<Arc<dyn Transformer>, BuildError>
            + Send
            + Sync
            + 'static,
    {
        self.builders.insert(name.into(), Box::new(builder));
    }

    /// Instantiate the named transformer; unknown names reject the record
    pub fn build(&self, spec: &TransformerSpec) -> Result<Arc<dyn Transformer>, BuildError> {
        match self.builders.get(&spec.name) {
            Some(builder) => builder(&spec.config, spec.phase),
            None => Err(BuildError::UnknownTransformer(spec.name.clone())),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }
}

/// Sets and removes headers on whichever phase it is bound to
pub struct HeaderMutator {
    set: Vec<(HeaderName, HeaderValue)>,
    remove: Vec<HeaderName>,
}

#[derive(Debug, Default, Deserialize)]
struct HeaderMutatorConfig {
    #[serde(default)]
    set: HashMap<String, String>,
    #[serde(default)]
    remove: Vec<String>,
}

impl HeaderMutator {
    fn build(config: &serde_json::Value, _phase: Phase) -> Result<Arc<dyn Transformer>, BuildError> {
        let config: HeaderMutatorConfig = parse_config("headers", config)?;

        let invalid = |what: &str, err: String| BuildError::InvalidConfig {
            name: "headers".to_string(),
            reason: format!("{}: {}", what, err),
        };

        let mut set = Vec::with_capacity(config.set.len());
        for (name, value) in &config.set {
            let name = name
                .parse::<HeaderName>()
                .map_err(|e| invalid(&format!("header name '{}'", name), e.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| invalid(&format!("value for '{}'", name), e.to_string()))?;
            set.push((name, value));
        }

        let mut remove = Vec::with_capacity(config.remove.len());
        for name in &config.remove {
            remove.push(
                name.parse::<HeaderName>()
                    .map_err(|e| invalid(&format!("header name '{}'", name), e.to_string()))?,
            );
        }

        Ok(Arc::new(Self { set, remove }))
    }

    fn apply(&self, headers: &mut HeaderMap) {
        for name in &self.remove {
            headers.remove(name);
        }
        for (name, value) in &self.set {
            headers.insert(name.clone(), value.clone());
        }
    }
}

#[async_trait]
impl Transformer for HeaderMutator {
    fn name(&self) -> &'static str {
        "headers"
    }

    async fn transform_request(&self, req: &mut Request<ProxyBody>) -> Result<(), GatewayError> {
        self.apply(req.headers_mut());
        Ok(())
    }

    async fn transform_response(&self, resp: &mut Response<ProxyBody>) -> Result<(), GatewayError> {
        self.apply(resp.headers_mut());
        Ok(())
    }
}

/// Removes a leading path prefix before the request is proxied
pub struct StripPrefix {
    prefix: String,
}

#[derive(Debug, Default, Deserialize)]
struct StripPrefixConfig {
    #[serde(default)]
    prefix: String,
}

impl StripPrefix {
    fn build(config: &serde_json::Value, phase: Phase) -> Result<Arc<dyn Transformer>, BuildError> {
        if phase == Phase::Response {
            return Err(BuildError::InvalidConfig {
                name: "strip_prefix".to_string(),
                reason: "only valid in the request phase".to_string(),
            });
        }

        let config: StripPrefixConfig = parse_config("strip_prefix", config)?;
        if !config.prefix.starts_with('/') || config.prefix.len() < 2 {
            return Err(BuildError::InvalidConfig {
                name: "strip_prefix".to_string(),
                reason: "'prefix' must start with '/'".to_string(),
            });
        }

        Ok(Arc::new(Self {
            prefix: config.prefix,
        }))
    }
}

#[async_trait]
impl Transformer for StripPrefix {
    fn name(&self) -> &'static str {
        "strip_prefix"
    }

    async fn transform_request(&self, req: &mut Request<ProxyBody>) -> Result<(), GatewayError> {
        let uri = req.uri();
        let rest = match uri.path().strip_prefix(&self.prefix) {
            // only strip on a label boundary: /v1 matches /v1/x, not /v1x
            Some(rest) if rest.is_empty() || rest.starts_with('/') => {
                if rest.is_empty() { "/" } else { rest }
            }
            _ => return Ok(()),
        };

        let path_and_query = match uri.query() {
            Some(query) => format!("{}?{}", rest, query),
            None => rest.to_string(),
        };

        let mut parts = uri.clone().into_parts();
        parts.path_and_query = Some(
            path_and_query
                .parse()
                .map_err(|e| GatewayError::internal(format!("rewritten path invalid: {}", e)))?,
        );
        *req.uri_mut() = Uri::from_parts(parts)
            .map_err(|e| GatewayError::internal(format!("rewritten uri invalid: {}", e)))?;
        Ok(())
    }
}

/// Rejects requests missing a header, with a configurable status
pub struct RequireHeader {
    header: HeaderName,
    status: StatusCode,
}

#[derive(Debug, Default, Deserialize)]
struct RequireHeaderConfig {
    #[serde(default)]
    header: String,
    status: Option<u16>,
}

impl RequireHeader {
    fn build(config: &serde_json::Value, phase: Phase) -> Result<Arc<dyn Transformer>, BuildError> {
        if phase == Phase::Response {
            return Err(BuildError::InvalidConfig {
                name: "require_header".to_string(),
                reason: "only valid in the request phase".to_string(),
            });
        }

        let config: RequireHeaderConfig = parse_config("require_header", config)?;
        let header = config
            .header
            .parse::<HeaderName>()
            .map_err(|e| BuildError::InvalidConfig {
                name: "require_header".to_string(),
                reason: format!("invalid header name '{}': {}", config.header, e),
            })?;

        let status = match config.status {
            Some(code) => StatusCode::from_u16(code).map_err(|_| BuildError::InvalidConfig {
                name: "require_header".to_string(),
                reason: format!("'status' {} is not a valid HTTP status", code),
            })?,
            None => StatusCode::BAD_REQUEST,
        };

        Ok(Arc::new(Self { header, status }))
    }
}

#[async_trait]
impl Transformer for RequireHeader {
    fn name(&self) -> &'static str {
        "require_header"
    }

    async fn transform_request(&self, req: &mut Request<ProxyBody>) -> Result<(), GatewayError> {
        if req.headers().contains_key(&self.header) {
            Ok(())
        } else {
            Err(GatewayError::rejection(
                self.status,
                format!("missing required header '{}'", self.header),
            ))
        }
    }
}
