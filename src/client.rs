//! Client facade
//!
//! Wires the pool, serializer, transport and sniffer together from one
//! [`ClientConfig`] and owns the sniffer lifecycle. One client instance
//! is shared across tasks; every method takes `&self`.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

use crate::config::ClientConfig;
use crate::connection::NodeTransport;
use crate::error::{ClientError, Result};
use crate::pool::{ConnectionPool, PoolOptions};
use crate::serializer::Serializer;
use crate::sniff::{SniffReason, Sniffer, SnifferOptions};
use crate::transport::{Transport, TransportOptions};
use crate::types::{ApiResponse, RequestOptions, RequestParams, SniffOutcome};

/// A connected cluster client
pub struct Client {
    transport: Arc<Transport>,
    sniffer: Arc<Sniffer>,
    sniff_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").finish_non_exhaustive()
    }
}

impl Client {
    /// Build a client from configuration. The node list must not be
    /// empty; each entry becomes an alive pool member immediately.
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_wire_transport(config, None)
    }

    /// Build a client whose connections dispatch through the given wire
    /// layer instead of the reqwest default.
    pub fn with_wire_transport(
        config: ClientConfig,
        wire: Option<Arc<dyn NodeTransport>>,
    ) -> Result<Self> {
        if config.nodes.is_empty() {
            return Err(ClientError::Configuration(
                "At least one node must be configured".to_string(),
            ));
        }
        let proxy = config
            .proxy
            .as_deref()
            .map(Url::parse)
            .transpose()
            .map_err(|e| ClientError::Configuration(format!("Invalid proxy URL: {}", e)))?;

        let serializer = Arc::new(Serializer::new(
            config.proto_poisoning,
            config.constructor_poisoning,
        ));

        let pool = Arc::new(ConnectionPool::new(PoolOptions {
            resurrect_strategy: config.resurrect_strategy,
            resurrect_base: config.resurrect_base(),
            resurrect_cap: config.resurrect_cap(),
            ping_timeout: config.ping_timeout(),
            drop_vanished_nodes: config.drop_vanished_nodes,
            auth: config.auth.clone(),
            skip_tls_verify: config.tls.skip_verify,
            proxy,
            default_transport: wire,
            ..Default::default()
        }));
        for entry in &config.nodes {
            let opts = pool.options_from_descriptor(&entry.to_descriptor())?;
            pool.add_connection(opts)?;
        }

        let transport = Arc::new(Transport::new(
            Arc::clone(&pool),
            Arc::clone(&serializer),
            TransportOptions {
                max_retries: config.max_retries,
                request_timeout: config.request_timeout(),
                compression: config.compression,
                suggest_compression: config.suggest_compression,
                compression_threshold: config.compression_threshold_bytes,
                headers: config.headers.clone(),
                name: config.name.clone(),
                opaque_id_prefix: config.opaque_id_prefix.clone(),
                memory_circuit_breaker: config.memory_circuit_breaker.clone(),
                retry_on_statuses: config.retry_on_statuses.clone(),
                sniff_on_connection_fault: config.sniff_on_connection_fault,
            },
        ));

        let sniffer = Arc::new(Sniffer::new(
            pool,
            serializer,
            SnifferOptions {
                endpoint: config.sniff_endpoint.clone(),
                interval: config.sniff_interval(),
                request_timeout: config.request_timeout(),
            },
        ));
        sniffer.attach_memory_pressure(transport.memory_pressure_slot());
        transport.set_sniffer(Arc::clone(&sniffer));

        let sniff_task = Arc::clone(&sniffer).start();
        if config.sniff_on_start {
            let sniffer = Arc::clone(&sniffer);
            // Construction never waits on the network
            tokio::spawn(async move {
                if let Err(e) = sniffer.sniff(SniffReason::Start).await {
                    warn!(error = %e, "Start-up sniff failed");
                }
            });
        }

        info!(name = %config.name, nodes = config.nodes.len(), "Client ready");
        Ok(Self {
            transport,
            sniffer,
            sniff_task: Mutex::new(sniff_task),
        })
    }

    /// Perform one logical request against the cluster
    pub async fn request(
        &self,
        params: RequestParams,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        self.transport.request(params, options).await
    }

    /// Lightweight reachability check: `HEAD /`. Resolves `false` when
    /// the cluster answered with an error or could not be reached, and
    /// propagates failures that never touched the network.
    pub async fn ping(&self) -> Result<bool> {
        let params = RequestParams::new(reqwest::Method::HEAD, "/");
        match self.transport.request(params, RequestOptions::default()).await {
            Ok(_) => Ok(true),
            Err(
                ClientError::Response { .. }
                | ClientError::Connection { .. }
                | ClientError::Timeout { .. }
                | ClientError::NoLivingConnections { .. },
            ) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Refresh the pool from the discovery endpoint now
    pub async fn sniff(&self) -> Result<SniffOutcome> {
        self.sniffer.sniff(SniffReason::Manual).await
    }

    /// Verify the cluster is a supported distribution
    pub async fn check_compatibility(&self) -> Result<ApiResponse> {
        self.transport.check_compatibility().await
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        self.transport.pool()
    }

    /// Stop background work and drain every connection
    pub async fn close(&self) {
        info!("Closing client");
        self.sniffer.stop();
        if let Some(task) = self.sniff_task.lock().take() {
            // the run loop only re-checks its flag on the next tick
            task.abort();
        }
        self.pool().close().await;
    }
}
