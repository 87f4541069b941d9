//! Middleware abstraction: request-scoped interceptors that wrap the proxy call
//!
//! Middlewares compose as an onion around the upstream call. The first
//! declared middleware is outermost; each receives the rest of the chain as a
//! [`Next`] continuation and may decline to call it, producing a response
//! itself (short-circuit). Instances are stateless beyond their configuration
//! and are invoked from many request tasks concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{Request, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{error_response, ErrorKind, GatewayError};
use crate::handler::BuildError;
use crate::service::MiddlewareSpec;
use crate::ProxyBody;

/// Outcome of a middleware chain stage
pub type MiddlewareResult = Result<Response<ProxyBody>, GatewayError>;

/// The innermost stage of the chain: the reverse-proxy call
pub type Terminal = dyn Fn(Request<ProxyBody>) -> BoxFuture<'static, MiddlewareResult> + Send + Sync;

/// A request-scoped interceptor wrapping the proxy call
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    /// Handle the request, deciding whether to call `next`.
    ///
    /// Declining to call `next` short-circuits: the upstream call and the
    /// response-phase transformers are bypassed, but outer middlewares still
    /// see the returned response.
    fn handle<'a>(&'a self, req: Request<ProxyBody>, next: Next<'a>) -> BoxFuture<'a, MiddlewareResult>;
}

/// Continuation over the remaining middleware chain and the terminal stage
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    terminal: &'a Terminal,
}

impl<'a> Next<'a> {
    pub fn new(chain: &'a [Arc<dyn Middleware>], terminal: &'a Terminal) -> Self {
        Self { chain, terminal }
    }

    /// Run the rest of the chain, ending in the terminal stage
    pub fn run(mut self, req: Request<ProxyBody>) -> BoxFuture<'a, MiddlewareResult> {
        if let Some((head, rest)) = self.chain.split_first() {
            self.chain = rest;
            head.handle(req, self)
        } else {
            (self.terminal)(req)
        }
    }
}

/// Builder resolving a middleware spec's config into an instance
pub type MiddlewareBuilder =
    dyn Fn(&serde_json::Value) -> Result<Arc<dyn Middleware>, BuildError> + Send + Sync;

/// Named middleware builders, supplied at gateway construction
pub struct MiddlewareRegistry {
    builders: HashMap<String, Box<MiddlewareBuilder>>,
}

impl MiddlewareRegistry {
    pub fn empty() -> Self {
        Self {
            builders: HashMap::new(),
        }
    }

    /// Registry with the built-in middlewares registered
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("request_id", RequestId::build);
        registry.register("timeout", Timeout::build);
        registry.register("access_log", AccessLog::build);
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, builder: F)
    where
        F: Fn(&serde_json::Value) -> Result<Arc<dyn Middleware>, BuildError> + Send + Sync + 'static,
    {
        self.builders.insert(name.into(), Box::new(builder));
    }

    /// Instantiate the named middleware; unknown names reject the record
    pub fn build(&self, spec: &MiddlewareSpec) -> Result<Arc<dyn Middleware>, BuildError> {
        match self.builders.get(&spec.name) {
            Some(builder) => builder(&spec.config),
            None => Err(BuildError::UnknownMiddleware(spec.name.clone())),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }
}

/// Decode a builder config, treating an absent config as all-defaults
pub(crate) fn parse_config<T>(name: &str, config: &serde_json::Value) -> Result<T, BuildError>
where
    T: DeserializeOwned + Default,
{
    if config.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(config.clone()).map_err(|e| BuildError::InvalidConfig {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

/// Ensures a request ID header on the request and echoes it onto the response
pub struct RequestId {
    header: HeaderName,
}

#[derive(Debug, Deserialize)]
struct RequestIdConfig {
    #[serde(default = "default_request_id_header")]
    header: String,
}

impl Default for RequestIdConfig {
    fn default() -> Self {
        Self {
            header: default_request_id_header(),
        }
    }
}

fn default_request_id_header() -> String {
    "x-request-id".to_string()
}

impl RequestId {
    fn build(config: &serde_json::Value) -> Result<Arc<dyn Middleware>, BuildError> {
        let config: RequestIdConfig = parse_config("request_id", config)?;
        let header = config
            .header
            .parse::<HeaderName>()
            .map_err(|e| BuildError::InvalidConfig {
                name: "request_id".to_string(),
                reason: format!("invalid header name '{}': {}", config.header, e),
            })?;
        Ok(Arc::new(Self { header }))
    }
}

impl Middleware for RequestId {
    fn name(&self) -> &'static str {
        "request_id"
    }

    fn handle<'a>(&'a self, mut req: Request<ProxyBody>, next: Next<'a>) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move {
            let id = match req.headers().get(&self.header) {
                Some(value) => value.clone(),
                None => {
                    let value = HeaderValue::from_str(&Uuid::new_v4().to_string())
                        .expect("uuid is a valid header value");
                    req.headers_mut().insert(self.header.clone(), value.clone());
                    value
                }
            };

            let mut response = next.run(req).await?;
            response.headers_mut().entry(self.header.clone()).or_insert(id);
            Ok(response)
        })
    }
}

/// Imposes a deadline on everything inside it, the upstream call included
pub struct Timeout {
    limit: Duration,
}

#[derive(Debug, Default, Deserialize)]
struct TimeoutConfig {
    #[serde(default)]
    seconds: u64,
}

impl Timeout {
    fn build(config: &serde_json::Value) -> Result<Arc<dyn Middleware>, BuildError> {
        let config: TimeoutConfig = parse_config("timeout", config)?;
        if config.seconds == 0 {
            return Err(BuildError::InvalidConfig {
                name: "timeout".to_string(),
                reason: "'seconds' must be a positive integer".to_string(),
            });
        }
        Ok(Arc::new(Self {
            limit: Duration::from_secs(config.seconds),
        }))
    }
}

impl Middleware for Timeout {
    fn name(&self) -> &'static str {
        "timeout"
    }

    fn handle<'a>(&'a self, req: Request<ProxyBody>, next: Next<'a>) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move {
            match tokio::time::timeout(self.limit, next.run(req)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(limit_secs = self.limit.as_secs(), "request deadline expired");
                    Ok(error_response(&GatewayError::new(
                        ErrorKind::GatewayTimeout,
                        format!("no response within {} seconds", self.limit.as_secs()),
                    )))
                }
            }
        })
    }
}

/// Logs one structured line per request with method, path, status and latency
pub struct AccessLog;

#[derive(Debug, Default, Deserialize)]
struct AccessLogConfig {}

impl AccessLog {
    fn build(config: &serde_json::Value) -> Result<Arc<dyn Middleware>, BuildError> {
        let _: AccessLogConfig = parse_config("access_log", config)?;
        Ok(Arc::new(Self))
    }
}

impl Middleware for AccessLog {
    fn name(&self) -> &'static str {
        "access_log"
    }

    fn handle<'a>(&'a self, req: Request<ProxyBody>, next: Next<'a>) -> BoxFuture<'a, MiddlewareResult> {
        Box::pin(async move {
            let method = req.method().clone();
            let path = req.uri().path().to_string();
            let start = Instant::now();

            let result = next.run(req).await;
            let elapsed_ms = start.elapsed().as_millis() as u64;
            match &result {
                Ok(response) => info!(
                    %method,
                    path,
                    status = response.status().as_u16(),
                    elapsed_ms,
                    "request served"
                ),
                Err(err) => warn!(%method, path, error = %err, elapsed_ms, "request failed"),
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::empty_body;
    use hyper::StatusCode;
    use parking_lot::Mutex;
    use serde_json::json;

    fn terminal_returning(status: StatusCode) -> Box<Terminal> {
        Box::new(move |_req| {
            Box::pin(async move {
                Ok(Response::builder()
                    .status(status)
                    .body(empty_body())
                    .unwrap())
            })
        })
    }

    /// Records entry and exit around the continuation
    struct Probe {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Middleware for Probe {
        fn name(&self) -> &'static str {
            "probe"
        }

        fn handle<'a>(&'a self, req: Request<ProxyBody>, next: Next<'a>) -> BoxFuture<'a, MiddlewareResult> {
            Box::pin(async move {
                self.log.lock().push(format!("{}-enter", self.label));
                let response = next.run(req).await;
                self.log.lock().push(format!("{}-exit", self.label));
                response
            })
        }
    }

    fn request() -> Request<ProxyBody> {
        Request::builder()
            .uri("http://orders.example.com/ping")
            .body(empty_body())
            .unwrap()
    }

    #[tokio::test]
    async fn test_onion_ordering() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Probe {
                label: "outer",
                log: log.clone(),
            }),
            Arc::new(Probe {
                label: "inner",
                log: log.clone(),
            }),
        ];

        let terminal_log = log.clone();
        let terminal: Box<Terminal> = Box::new(move |_req| {
            let log = terminal_log.clone();
            Box::pin(async move {
                log.lock().push("terminal".to_string());
                Ok(Response::builder().body(empty_body()).unwrap())
            })
        });

        let response = Next::new(&chain, &*terminal).run(request()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            *log.lock(),
            vec!["outer-enter", "inner-enter", "terminal", "inner-exit", "outer-exit"]
        );
    }

    #[tokio::test]
    async fn test_request_id_inserted_and_echoed() {
        let middleware = RequestId::build(&serde_json::Value::Null).unwrap();
        let chain = [middleware];

        let terminal: Box<Terminal> = Box::new(|req| {
            Box::pin(async move {
                // the request that reaches the terminal carries the id
                let id = req.headers().get("x-request-id").unwrap().clone();
                Ok(Response::builder()
                    .header("x-upstream-saw", id)
                    .body(empty_body())
                    .unwrap())
            })
        });

        let response = Next::new(&chain, &*terminal).run(request()).await.unwrap();
        let echoed = response.headers().get("x-request-id").unwrap();
        let saw = response.headers().get("x-upstream-saw").unwrap();
        assert_eq!(echoed, saw);
    }

    #[tokio::test]
    async fn test_request_id_preserves_existing() {
        let middleware = RequestId::build(&serde_json::Value::Null).unwrap();
        let chain = [middleware];
        let terminal = terminal_returning(StatusCode::OK);

        let req = Request::builder()
            .uri("http://orders.example.com/ping")
            .header("x-request-id", "abc-123")
            .body(empty_body())
            .unwrap();

        let response = Next::new(&chain, &*terminal).run(req).await.unwrap();
        assert_eq!(response.headers().get("x-request-id").unwrap(), "abc-123");
    }

    #[tokio::test]
    async fn test_timeout_short_circuits() {
        let middleware = Timeout::build(&json!({"seconds": 1})).unwrap();
        let chain = [middleware];

        let completed = Arc::new(Mutex::new(false));
        let completed_inner = completed.clone();
        let terminal: Box<Terminal> = Box::new(move |_req| {
            let completed = completed_inner.clone();
            Box::pin(async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                *completed.lock() = true;
                Ok(Response::builder().body(empty_body()).unwrap())
            })
        });

        tokio::time::pause();
        let run = Next::new(&chain, &*terminal).run(request());
        let response = run.await.unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert!(!*completed.lock());
    }

    #[test]
    fn test_timeout_requires_positive_seconds() {
        assert!(Timeout::build(&serde_json::Value::Null).is_err());
        assert!(Timeout::build(&json!({"seconds": 0})).is_err());
        assert!(Timeout::build(&json!({"seconds": 5})).is_ok());
    }

    #[test]
    fn test_registry_unknown_name() {
        let registry = MiddlewareRegistry::builtin();
        let spec = MiddlewareSpec {
            name: "no_such_middleware".to_string(),
            config: serde_json::Value::Null,
        };
        match registry.build(&spec) {
            Err(BuildError::UnknownMiddleware(name)) => assert_eq!(name, "no_such_middleware"),
            other => panic!("expected unknown middleware rejection, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_registry_builtins_present() {
        let registry = MiddlewareRegistry::builtin();
        assert!(registry.contains("request_id"));
        assert!(registry.contains("timeout"));
        assert!(registry.contains("access_log"));
    }

    #[test]
    fn test_request_id_rejects_bad_header_name() {
        let result = RequestId::build(&json!({"header": "not a header\n"}));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_error_passes_through_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(Probe {
            label: "outer",
            log: log.clone(),
        })];

        let terminal: Box<Terminal> = Box::new(|_req| {
            Box::pin(async move { Err(GatewayError::upstream_unreachable("connection refused")) })
        });

        let result = Next::new(&chain, &*terminal).run(request()).await;
        assert!(result.is_err());
        // the middleware still observed entry and exit around the failure
        assert_eq!(*log.lock(), vec!["outer-enter", "outer-exit"]);
    }
}
