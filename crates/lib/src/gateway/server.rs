//! Gateway coordinator: starts channels, the inbound pipeline, background tasks and the
//! status server; shuts them down in order so queued work is drained.

use crate::channels::{
    ApiDelivery, ChannelHandle, ChannelKind, ChannelRegistry, ChannelWorker, CompleteMessage,
    Delivery, EmailDelivery, InboundMessage, JobQueue, ModemDelivery, RetryPolicy,
};
use crate::config::{self, Config};
use crate::gateway::pipeline::Pipeline;
use crate::gateway::status::{self, StatusState};
use crate::modem::{self, ModemLink};
use crate::multipart::Reassembler;
use crate::routing::Dispatcher;
use crate::store::{MessageStore, EVICTION_INTERVAL};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

const INBOUND_BUFFER: usize = 64;

/// A running gateway. Dropping it without `shutdown` abandons queued jobs.
pub struct Gateway {
    registry: Arc<ChannelRegistry>,
    pipeline: Pipeline,
    links: Vec<Arc<dyn ModemLink>>,
    workers: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
    processor: JoinHandle<()>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    /// Stops the status server, sweeper and evictor.
    background_tx: watch::Sender<bool>,
    /// Stops the inbound processor once the background tasks are gone.
    shutdown_tx: watch::Sender<bool>,
    status_addr: Option<SocketAddr>,
}

impl Gateway {
    /// Start every configured channel. A channel that fails its checks or cannot
    /// connect is logged and left out; the others run.
    pub async fn start(config: Config) -> Result<Self> {
        config.validate()?;

        let status_listener = if config.status.enabled {
            let bind = config.status.bind.trim();
            if !config::is_loopback_bind(bind) {
                log::warn!(
                    "status server bound to non-loopback address {} without authentication",
                    bind
                );
            }
            let bind_addr = format!("{}:{}", bind, config.status.port);
            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .with_context(|| format!("binding status server to {}", bind_addr))?;
            Some(listener)
        } else {
            None
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER);
        let (complete_tx, complete_rx) = mpsc::channel(INBOUND_BUFFER);
        let (background_tx, background_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let registry = Arc::new(ChannelRegistry::new());
        let policy = RetryPolicy::from_settings(&config.retry_settings);
        let mut workers = Vec::new();
        let mut links = Vec::new();

        for modem_config in &config.modems {
            if let Err(e) = modem_config.check() {
                log::error!("modem {}: not started: {}", modem_config.name, e);
                continue;
            }
            match modem::connect(modem_config, inbound_tx.clone()).await {
                Ok(link) => {
                    let delivery = ModemDelivery::new(link.clone(), modem_config);
                    links.push(link);
                    let worker = start_channel(
                        &registry,
                        &modem_config.name,
                        ChannelKind::Modem,
                        delivery,
                        policy,
                    )
                    .await;
                    workers.push(worker);
                }
                Err(e) => log::error!("modem {}: not started: {}", modem_config.name, e),
            }
        }

        for email_config in &config.email_providers {
            if let Err(e) = email_config.check() {
                log::error!("email {}: not started: {}", email_config.name, e);
                continue;
            }
            let delivery = match EmailDelivery::new(email_config) {
                Ok(d) => d,
                Err(e) => {
                    log::error!("email {}: not started: {}", email_config.name, e);
                    continue;
                }
            };
            if let Err(e) = delivery.connect().await {
                log::error!("email {}: not started: {}", email_config.name, e);
                continue;
            }
            let worker = start_channel(
                &registry,
                &email_config.name,
                ChannelKind::Email,
                delivery,
                policy,
            )
            .await;
            workers.push(worker);
        }

        for api_config in &config.api_providers {
            let delivery = match api_config
                .check()
                .map_err(anyhow::Error::from)
                .and_then(|_| ApiDelivery::new(api_config).map_err(anyhow::Error::from))
            {
                Ok(d) => d,
                Err(e) => {
                    log::error!("api {}: not started: {}", api_config.name, e);
                    continue;
                }
            };
            let worker = start_channel(
                &registry,
                &api_config.name,
                ChannelKind::Api,
                delivery,
                policy,
            )
            .await;
            workers.push(worker);
        }
        log::info!("channels started: {:?}", registry.names().await);

        let store = Arc::new(MessageStore::new(config.retention.sms_retention_days));
        let reassembler = Arc::new(Reassembler::from_minutes(config.multipart.timeout_minutes));
        let dispatcher = Arc::new(Dispatcher::from_config(&config.rules, registry.clone()));
        let pipeline = Pipeline::new(reassembler.clone(), store.clone(), dispatcher);

        let mut background = vec![store
            .clone()
            .spawn_evictor(EVICTION_INTERVAL, background_rx.clone())];
        if reassembler.is_immediate() {
            log::info!("multipart: immediate mode, fragments are delivered on their own");
        } else {
            let interval = Duration::from_secs(config.multipart.sweep_interval_seconds.max(1));
            background.push(reassembler.clone().spawn_sweeper(
                interval,
                complete_tx,
                background_rx.clone(),
            ));
        }

        let processor = spawn_processor(
            pipeline.clone(),
            inbound_rx,
            complete_rx,
            shutdown_rx,
        );

        let mut status_addr = None;
        if let Some(listener) = status_listener {
            let addr = listener.local_addr().context("status server address")?;
            let app = status::router(StatusState {
                registry: registry.clone(),
                reassembler,
                store,
                port: addr.port(),
            });
            let mut stop = background_rx;
            background.push(tokio::spawn(async move {
                let served = axum::serve(listener, app)
                    .with_graceful_shutdown(async move {
                        let _ = stop.wait_for(|stopped| *stopped).await;
                    })
                    .await;
                if let Err(e) = served {
                    log::error!("status server exited: {}", e);
                }
            }));
            log::info!("status server listening on {}", addr);
            status_addr = Some(addr);
        }

        Ok(Self {
            registry,
            pipeline,
            links,
            workers,
            background,
            processor,
            inbound_tx,
            background_tx,
            shutdown_tx,
            status_addr,
        })
    }

    /// Sender for inbound messages (the modem links hold their own clones).
    pub fn inbound(&self) -> mpsc::Sender<InboundMessage> {
        self.inbound_tx.clone()
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn status_addr(&self) -> Option<SocketAddr> {
        self.status_addr
    }

    /// Stop inbound and the background tasks, process what is buffered, flush pending
    /// assemblies, drain every channel queue, then release the transports.
    pub async fn shutdown(self) {
        log::info!("shutting down gateway");
        for link in &self.links {
            link.stop();
        }
        drop(self.inbound_tx);

        // The sweeper may be mid-send; the processor keeps consuming until it exits.
        let _ = self.background_tx.send(true);
        for task in self.background {
            let _ = task.await;
        }
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.processor.await {
            log::error!("inbound processor failed: {}", e);
        }

        for message in self.pipeline.reassembler.flush_all().await {
            self.pipeline.handle_complete(message).await;
        }

        self.registry.close_all().await;
        for worker in self.workers {
            if let Err(e) = worker.await {
                log::error!("channel worker failed: {}", e);
            }
        }
        log::info!("gateway stopped");
    }
}

async fn start_channel<D: Delivery + 'static>(
    registry: &ChannelRegistry,
    name: &str,
    kind: ChannelKind,
    delivery: D,
    policy: RetryPolicy,
) -> JoinHandle<()> {
    let queue = Arc::new(JobQueue::new());
    registry
        .register(ChannelHandle::new(name, kind, queue.clone()))
        .await;
    log::info!("{} {}: started", kind, name);
    ChannelWorker::new(name, delivery, queue, policy).spawn()
}

/// Single consumer of inbound and swept messages. On shutdown it processes the inbound
/// messages already buffered, then every swept message until the sweeper is gone.
fn spawn_processor(
    pipeline: Pipeline,
    mut inbound_rx: mpsc::Receiver<InboundMessage>,
    mut complete_rx: mpsc::Receiver<CompleteMessage>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(msg) = inbound_rx.recv() => {
                    pipeline.handle_inbound(msg).await;
                }
                Some(msg) = complete_rx.recv() => {
                    pipeline.handle_complete(msg).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        inbound_rx.close();
        while let Ok(msg) = inbound_rx.try_recv() {
            pipeline.handle_inbound(msg).await;
        }
        while let Some(msg) = complete_rx.recv().await {
            pipeline.handle_complete(msg).await;
        }
        log::debug!("inbound processor stopped");
    })
}

/// Run the gateway until Ctrl+C or SIGTERM, then shut down gracefully.
/// `config_path` is only reported; the config is already loaded.
pub async fn run_gateway(config: Config, config_path: PathBuf) -> Result<()> {
    log::info!("starting gateway with config {}", config_path.display());
    let gateway = Gateway::start(config).await?;
    shutdown_signal().await;
    gateway.shutdown().await;
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, draining channel queues");
}
