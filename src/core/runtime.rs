//! Main runtime orchestration.
//!
//! The runtime hosts an in-process cluster:
//! - Start order: store → authority → nodes
//! - Shutdown order: nodes (flushed) → authority → store

use crate::authority::Authority;
use crate::cache::Node;
use crate::core::config::Config;
use crate::protocol::server::AuthorityLink;
use crate::protocol::traced::Traced;
use crate::protocol::types::NodeId;
use crate::storage::{DurableStore, MemoryStore};
use anyhow::{Context, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Component health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentHealth {
    /// Component is starting.
    Starting,
    /// Component is healthy and operational.
    Healthy,
    /// Component is degraded but functional.
    Degraded,
    /// Component has failed.
    Failed,
    /// Component is stopping.
    Stopping,
    /// Component has stopped.
    Stopped,
}

/// Health status aggregated from all components.
#[derive(Debug, Clone)]
pub struct RuntimeHealth {
    /// Durable store health.
    pub store: ComponentHealth,
    /// Authority health.
    pub authority: ComponentHealth,
    /// Node health; degraded when some nodes failed to connect.
    pub nodes: ComponentHealth,
}

impl Default for RuntimeHealth {
    fn default() -> Self {
        Self {
            store: ComponentHealth::Starting,
            authority: ComponentHealth::Starting,
            nodes: ComponentHealth::Starting,
        }
    }
}

impl RuntimeHealth {
    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        matches!(
            (self.store, self.authority, self.nodes),
            (
                ComponentHealth::Healthy,
                ComponentHealth::Healthy,
                ComponentHealth::Healthy | ComponentHealth::Degraded
            )
        )
    }

    /// Check if the runtime is alive (not failed).
    pub fn is_alive(&self) -> bool {
        !matches!(
            (self.store, self.authority, self.nodes),
            (ComponentHealth::Failed, _, _)
                | (_, ComponentHealth::Failed, _)
                | (_, _, ComponentHealth::Failed)
        )
    }
}

/// Runtime holding all component handles.
pub struct Runtime {
    /// Configuration.
    config: Arc<Config>,

    /// Durable store.
    store: Arc<dyn DurableStore>,

    /// Authority, once started.
    authority: Option<Arc<Authority>>,

    /// Connected nodes.
    nodes: Vec<Node>,

    /// Runtime health status.
    health: RuntimeHealth,

    /// Whether the runtime is running.
    running: Arc<AtomicBool>,

    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,

    /// Shutdown signal receiver.
    shutdown_rx: watch::Receiver<bool>,
}

impl Runtime {
    /// Create a new runtime over an in-memory store.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    /// Create a new runtime over the given store.
    pub fn with_store(config: Config, store: Arc<dyn DurableStore>) -> Result<Self> {
        config.validate().context("invalid configuration")?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            config: Arc::new(config),
            store,
            authority: None,
            nodes: Vec::new(),
            health: RuntimeHealth::default(),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the authority (if started).
    pub fn authority(&self) -> Option<&Arc<Authority>> {
        self.authority.as_ref()
    }

    /// Get the connected nodes.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Get the current health status.
    pub fn health(&self) -> &RuntimeHealth {
        &self.health
    }

    /// Check if the runtime is ready to serve requests.
    pub fn is_ready(&self) -> bool {
        self.health.is_ready()
    }

    /// Check if the runtime is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Get a shutdown receiver for graceful shutdown coordination.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Start the store, the authority and every configured node.
    pub async fn start(&mut self) -> Result<()> {
        tracing::info!(
            nodes = self.config.cluster.node_count,
            trace_rpc = self.config.telemetry.trace_rpc,
            "starting coherence runtime"
        );

        self.init_store();
        self.init_authority();
        self.init_nodes().await?;

        self.running.store(true, Ordering::Release);
        tracing::info!("coherence runtime started");
        Ok(())
    }

    fn init_store(&mut self) {
        let stats = self.store.stats();
        self.health.store = ComponentHealth::Healthy;
        tracing::info!(
            objects = stats.objects,
            bindings = stats.bindings,
            "store ready"
        );
    }

    fn init_authority(&mut self) {
        let authority = Authority::with_config(self.store.clone(), &self.config.authority);
        self.authority = Some(Arc::new(authority));
        self.health.authority = ComponentHealth::Healthy;
        tracing::info!(
            callback_timeout_ms = self.config.authority.callback_timeout_ms,
            "authority started"
        );
    }

    async fn init_nodes(&mut self) -> Result<()> {
        let authority = self
            .authority
            .clone()
            .context("authority must start before nodes")?;

        let mut failed = 0;
        for n in 1..=u64::from(self.config.cluster.node_count) {
            let link: Arc<dyn AuthorityLink> = if self.config.telemetry.trace_rpc {
                Arc::new(Traced::with_component(authority.clone(), "authority"))
            } else {
                authority.clone()
            };
            match Node::connect(NodeId(n), link, self.config.node.clone()).await {
                Ok(node) => self.nodes.push(node),
                Err(e) => {
                    failed += 1;
                    tracing::error!(node = n, error = %e, "node failed to connect");
                }
            }
        }

        self.health.nodes = match (self.nodes.len(), failed) {
            (0, _) => ComponentHealth::Failed,
            (_, 0) => ComponentHealth::Healthy,
            _ => ComponentHealth::Degraded,
        };
        if self.nodes.is_empty() {
            anyhow::bail!("no node could connect to the authority");
        }
        tracing::info!(connected = self.nodes.len(), failed, "nodes started");
        Ok(())
    }

    /// Trigger graceful shutdown.
    pub fn shutdown(&self) {
        tracing::info!("shutdown requested");
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the runtime until ctrl-c or a shutdown request.
    pub async fn run(&mut self) -> Result<()> {
        self.start().await?;

        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("shutdown signal received (SIGINT)");
            }
            _ = async { shutdown_rx.wait_for(|stop| *stop).await.is_ok() } => {
                tracing::info!("shutdown requested by component");
            }
        }

        self.stop().await
    }

    /// Stop all runtime components.
    ///
    /// Nodes flush their queues before disconnecting, so every commit they
    /// accepted is durable once this returns.
    pub async fn stop(&mut self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        self.health.nodes = ComponentHealth::Stopping;
        for node in self.nodes.drain(..) {
            if let Err(e) = node.shutdown().await {
                tracing::warn!(node = %node.id(), error = %e, "node did not stop cleanly");
            }
        }
        self.health.nodes = ComponentHealth::Stopped;

        if let Some(authority) = self.authority.take() {
            self.health.authority = ComponentHealth::Stopping;
            authority.shutdown();
            let stats = authority.stats();
            tracing::info!(
                grants = stats.grants,
                commits = stats.commits_applied,
                rejected = stats.commits_rejected,
                callback_timeouts = stats.callback_timeouts,
                "authority statistics"
            );
        }
        self.health.authority = ComponentHealth::Stopped;

        let stats = self.store.stats();
        self.health.store = ComponentHealth::Stopped;
        tracing::info!(
            objects = stats.objects,
            bindings = stats.bindings,
            batches = stats.batches_applied,
            "coherence runtime stopped"
        );
        Ok(())
    }
}
