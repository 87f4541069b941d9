//! Hubgate - an API gateway that fronts a dynamic catalog of backend services
//!
//! This library provides a reverse proxy gateway that:
//! - Routes HTTP traffic to backend services based on the request's subdomain
//! - Reconfigures the routable service set at runtime via a pub/sub channel
//! - Runs each request through per-service middleware and transformer chains
//! - Builds one reverse-proxy client per service, with its own connection pool
//! - Renders routing and upstream failures as structured JSON errors

pub mod bus;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod middleware;
pub mod registry;
pub mod service;
pub mod subscriber;
pub mod transformer;

use http_body_util::combinators::BoxBody;
use hyper::body::Bytes;

/// Body type flowing through the gateway pipeline, on both sides of the proxy.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;
