//! Per-request engine: subdomain extraction, lookup, chains, proxy call
//!
//! The pipeline for one request: extract the subdomain from the host, look
//! up the handler, run the request-phase transformers in declared order, run
//! the middleware onion around the upstream call, apply response-phase
//! transformers to the upstream response, and write the result back. Every
//! failure is caught here and rendered as a JSON error.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, HeaderValue, HOST};
use hyper::{Request, Response};
use tracing::debug;

use crate::error::{error_response, GatewayError};
use crate::handler::ServiceHandler;
use crate::middleware::{MiddlewareResult, Next, Terminal};
use crate::registry::ServiceRegistry;
use crate::ProxyBody;

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// The gateway listens for plaintext HTTP; TLS terminates upstream of it
const FORWARDED_PROTO: &str = "http";

/// Headers meaningful only for a single hop, stripped in both directions
const HOP_BY_HOP_HEADERS: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Serve one request end to end; never fails, errors become JSON responses
pub async fn handle_request(
    registry: &ServiceRegistry,
    base_host: &str,
    req: Request<Incoming>,
    client_addr: SocketAddr,
) -> Response<ProxyBody> {
    let subdomain = match extract_subdomain(&req, base_host) {
        Some(subdomain) => subdomain,
        None => {
            return error_response(&GatewayError::not_found(format!(
                "no service matches host for base '{}'",
                base_host
            )));
        }
    };

    let handler = match registry.lookup(&subdomain) {
        Some(handler) => handler,
        None => {
            return error_response(&GatewayError::not_found(format!(
                "no service registered under '{}'",
                subdomain
            )));
        }
    };

    debug!(subdomain, method = %req.method(), uri = %req.uri(), "dispatching request");

    match run_pipeline(handler, req.map(BodyExt::boxed), client_addr.ip()).await {
        Ok(response) => response,
        Err(err) => {
            debug!(subdomain, error = %err, "request pipeline failed");
            error_response(&err)
        }
    }
}

/// Transformers, middleware onion, upstream call
async fn run_pipeline(
    handler: Arc<ServiceHandler>,
    mut req: Request<ProxyBody>,
    client_ip: IpAddr,
) -> MiddlewareResult {
    for transformer in handler.request_transformers() {
        transformer.transform_request(&mut req).await?;
    }

    // The terminal stage proxies upstream and applies response-phase
    // transformers, so a short-circuiting middleware bypasses both while
    // outer middlewares still post-process whatever response comes back.
    let terminal_handler = handler.clone();
    let terminal: Box<Terminal> = Box::new(move |req| {
        let handler = terminal_handler.clone();
        Box::pin(async move {
            let mut response = proxy_upstream(&handler, req, client_ip).await?;
            for transformer in handler.response_transformers() {
                transformer.transform_response(&mut response).await?;
            }
            Ok(response)
        })
    });

    Next::new(handler.middlewares(), &*terminal).run(req).await
}

/// Forward the request to the handler's upstream endpoint
async fn proxy_upstream(
    handler: &ServiceHandler,
    req: Request<ProxyBody>,
    client_ip: IpAddr,
) -> MiddlewareResult {
    let req = prepare_upstream_request(handler, req, client_ip)?;

    match handler.send(req).await {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            let mut response = Response::from_parts(parts, body.boxed());
            strip_hop_by_hop(response.headers_mut());
            Ok(response)
        }
        Err(e) if e.is_connect() => Err(GatewayError::upstream_unreachable(e.to_string())),
        Err(e) => Err(GatewayError::upstream_protocol(e.to_string())),
    }
}

/// Rebase the URI on the upstream, rewrite `Host`, add forwarding headers,
/// strip hop-by-hop headers
fn prepare_upstream_request(
    handler: &ServiceHandler,
    mut req: Request<ProxyBody>,
    client_ip: IpAddr,
) -> Result<Request<ProxyBody>, GatewayError> {
    let original_host = req.headers().get(HOST).cloned();

    *req.uri_mut() = handler.upstream_uri(req.uri())?;

    let headers = req.headers_mut();
    strip_hop_by_hop(headers);

    headers.insert(
        HOST,
        HeaderValue::from_str(handler.authority().as_str())
            .map_err(|e| GatewayError::internal(format!("upstream host invalid: {}", e)))?,
    );

    let client = client_ip.to_string();
    let forwarded_for = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{}, {}", prior, client),
        None => client,
    };
    headers.insert(
        X_FORWARDED_FOR,
        HeaderValue::from_str(&forwarded_for)
            .map_err(|e| GatewayError::internal(format!("forwarded-for invalid: {}", e)))?,
    );

    headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(FORWARDED_PROTO));

    if let Some(host) = original_host {
        if !headers.contains_key(X_FORWARDED_HOST) {
            headers.insert(X_FORWARDED_HOST, host);
        }
    }

    Ok(req)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP_HEADERS {
        headers.remove(name);
    }
}

/// Extract the subdomain from the `Host` header, falling back to the
/// request-URI host. `None` means the request does not route anywhere.
pub fn extract_subdomain<B>(req: &Request<B>, base_host: &str) -> Option<String> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;
    host_subdomain(host, base_host)
}

/// The label(s) left of the base host; matching is case-insensitive and the
/// port is ignored. The bare base host and foreign hosts do not match.
fn host_subdomain(host: &str, base_host: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
    let base = base_host.to_ascii_lowercase();

    let labels = host.strip_suffix(&base)?.strip_suffix('.')?;
    if labels.is_empty() {
        None
    } else {
        Some(labels.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::empty_body;
    use crate::handler::ChainBuilders;
    use crate::service::ServiceRecord;

    #[test]
    fn test_host_subdomain_matching() {
        assert_eq!(
            host_subdomain("orders.example.com", "example.com"),
            Some("orders".to_string())
        );
        // multi-level subdomains match as a whole string
        assert_eq!(
            host_subdomain("v2.orders.example.com", "example.com"),
            Some("v2.orders".to_string())
        );
        // case-insensitive, port ignored
        assert_eq!(
            host_subdomain("ORDERS.Example.COM:8001", "example.com"),
            Some("orders".to_string())
        );
        assert_eq!(
            host_subdomain("orders.example.com", "Example.Com"),
            Some("orders".to_string())
        );
    }

    #[test]
    fn test_host_subdomain_misses() {
        // bare base host
        assert_eq!(host_subdomain("example.com", "example.com"), None);
        assert_eq!(host_subdomain("example.com:8001", "example.com"), None);
        // suffix without a label boundary
        assert_eq!(host_subdomain("badexample.com", "example.com"), None);
        // unrelated host
        assert_eq!(host_subdomain("orders.other.net", "example.com"), None);
    }

    #[test]
    fn test_extract_subdomain_falls_back_to_uri() {
        let req: Request<()> = Request::builder()
            .uri("http://orders.example.com/ping")
            .body(())
            .unwrap();
        assert_eq!(
            extract_subdomain(&req, "example.com"),
            Some("orders".to_string())
        );
    }

    #[test]
    fn test_extract_subdomain_prefers_host_header() {
        let req: Request<()> = Request::builder()
            .uri("/ping")
            .header(HOST, "billing.example.com:8001")
            .body(())
            .unwrap();
        assert_eq!(
            extract_subdomain(&req, "example.com"),
            Some("billing".to_string())
        );
    }

    #[test]
    fn test_strip_hop_by_hop() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("te", HeaderValue::from_static("trailers"));
        headers.insert("x-custom", HeaderValue::from_static("kept"));

        strip_hop_by_hop(&mut headers);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get("x-custom").unwrap(), "kept");
    }

    fn handler() -> ServiceHandler {
        let record = ServiceRecord::new("orders", "http://127.0.0.1:9001");
        ServiceHandler::build(record, &ChainBuilders::builtin()).unwrap()
    }

    fn client_ip() -> IpAddr {
        "10.0.0.7".parse().unwrap()
    }

    #[test]
    fn test_prepare_rewrites_host_and_uri() {
        let req = Request::builder()
            .uri("/items?page=2")
            .header(HOST, "orders.example.com:8001")
            .body(empty_body())
            .unwrap();

        let prepared = prepare_upstream_request(&handler(), req, client_ip()).unwrap();
        assert_eq!(
            prepared.uri().to_string(),
            "http://127.0.0.1:9001/items?page=2"
        );
        assert_eq!(prepared.headers().get(HOST).unwrap(), "127.0.0.1:9001");
        assert_eq!(
            prepared.headers().get(X_FORWARDED_HOST).unwrap(),
            "orders.example.com:8001"
        );
        assert_eq!(prepared.headers().get(X_FORWARDED_PROTO).unwrap(), "http");
    }

    #[test]
    fn test_prepare_appends_forwarded_for() {
        let req = Request::builder()
            .uri("/")
            .header(HOST, "orders.example.com")
            .header(X_FORWARDED_FOR, "192.0.2.1")
            .body(empty_body())
            .unwrap();

        let prepared = prepare_upstream_request(&handler(), req, client_ip()).unwrap();
        assert_eq!(
            prepared.headers().get(X_FORWARDED_FOR).unwrap(),
            "192.0.2.1, 10.0.0.7"
        );
    }

    #[test]
    fn test_prepare_keeps_existing_forwarded_host() {
        let req = Request::builder()
            .uri("/")
            .header(HOST, "orders.example.com")
            .header(X_FORWARDED_HOST, "public.example.net")
            .body(empty_body())
            .unwrap();

        let prepared = prepare_upstream_request(&handler(), req, client_ip()).unwrap();
        assert_eq!(
            prepared.headers().get(X_FORWARDED_HOST).unwrap(),
            "public.example.net"
        );
    }

    #[test]
    fn test_prepare_strips_hop_by_hop_from_request() {
        let req = Request::builder()
            .uri("/")
            .header(HOST, "orders.example.com")
            .header("connection", "close")
            .header("proxy-authorization", "Basic abc")
            .body(empty_body())
            .unwrap();

        let prepared = prepare_upstream_request(&handler(), req, client_ip()).unwrap();
        assert!(prepared.headers().get("connection").is_none());
        assert!(prepared.headers().get("proxy-authorization").is_none());
    }
}
