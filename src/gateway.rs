//! The gateway: registry + reconfiguration subscriber + listener lifecycle

use std::net::SocketAddr;
use std::sync::Arc;

use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bus::ServiceBus;
use crate::config::Settings;
use crate::dispatch;
use crate::handler::{ChainBuilders, ServiceHandler};
use crate::registry::ServiceRegistry;
use crate::service::ServiceRecord;
use crate::subscriber;

/// A running instance serves requests against its registry while a background
/// task applies service updates from the pub/sub channel.
pub struct Gateway {
    settings: Settings,
    registry: Arc<ServiceRegistry>,
    builders: Arc<ChainBuilders>,
    bus: Arc<dyn ServiceBus>,
    shutdown_rx: watch::Receiver<bool>,
}

impl Gateway {
    pub fn new(
        settings: Settings,
        builders: ChainBuilders,
        bus: Arc<dyn ServiceBus>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            settings,
            registry: Arc::new(ServiceRegistry::new()),
            builders: Arc::new(builders),
            bus,
            shutdown_rx,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The live registry; useful for introspection and tests
    pub fn registry(&self) -> Arc<ServiceRegistry> {
        self.registry.clone()
    }

    /// Build and register the given records; rejected records are logged and
    /// skipped, matching the reconfiguration path's failure semantics.
    pub fn load_services(&self, records: &[ServiceRecord]) {
        for record in records {
            if record.disabled {
                continue;
            }
            match ServiceHandler::build(record.clone(), &self.builders) {
                Ok(handler) => self.registry.add(Arc::new(handler)),
                Err(e) => warn!(subdomain = %record.subdomain, error = %e, "failed to load service"),
            }
        }
        if !records.is_empty() {
            info!(count = self.registry.len(), "services loaded");
        }
    }

    /// Subscribe, bind and serve until shutdown. Failure to bind and
    /// termination of the subscription are fatal.
    pub async fn run(mut self) -> anyhow::Result<()> {
        let preloaded = self.settings.services.clone();
        self.load_services(&preloaded);

        let messages = self.bus.subscribe(&self.settings.channel_name);
        info!(channel = %self.settings.channel_name, "subscribed to service updates");
        let mut subscriber_task = tokio::spawn(subscriber::run(
            self.registry.clone(),
            self.builders.clone(),
            messages,
        ));

        let addr = self.settings.listen_addr();
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            error!(addr = %addr, error = %e, "failed to bind listener");
            anyhow::anyhow!("failed to bind {}: {}", addr, e)
        })?;
        info!(addr = %addr, "gateway ready to accept connections");

        let base_host: Arc<str> = Arc::from(self.settings.base_host.as_str());

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, client_addr)) => {
                            let registry = self.registry.clone();
                            let base_host = base_host.clone();
                            tokio::spawn(async move {
                                if let Err(e) =
                                    serve_connection(stream, client_addr, registry, base_host).await
                                {
                                    debug!(addr = %client_addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = &mut subscriber_task => {
                    error!("service channel subscription terminated, stopping gateway");
                    anyhow::bail!("service channel subscription terminated");
                }
                changed = self.shutdown_rx.changed() => {
                    // a dropped sender counts as a shutdown request
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("gateway shutting down");
                        subscriber_task.abort();
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

/// Drive one accepted connection, handing each request to the dispatcher
async fn serve_connection(
    stream: TcpStream,
    client_addr: SocketAddr,
    registry: Arc<ServiceRegistry>,
    base_host: Arc<str>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let registry = registry.clone();
        let base_host = base_host.clone();
        async move {
            Ok::<_, std::convert::Infallible>(
                dispatch::handle_request(&registry, &base_host, req, client_addr).await,
            )
        }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))
}
