//! Topology discovery
//!
//! Queries the cluster nodes endpoint, turns the reply into node
//! descriptors and reconciles the pool. Runs on demand (start-up,
//! connection fault, caller request) and optionally on a background
//! interval. The interval task also refreshes the cluster memory
//! utilization sample consumed by the circuit breaker.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::connection::WireRequest;
use crate::error::{ClientError, Result};
use crate::metrics;
use crate::pool::ConnectionPool;
use crate::serializer::Serializer;
use crate::types::{NodeDescriptor, Roles, SniffOutcome};

/// What triggered a sniff, recorded in logs, metrics and outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SniffReason {
    /// Construction-time refresh
    Start,
    /// Periodic background refresh
    Interval,
    /// A connection was just marked dead
    ConnectionFault,
    /// Explicit caller request
    Manual,
}

impl SniffReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SniffReason::Start => "sniff-on-start",
            SniffReason::Interval => "sniff-interval",
            SniffReason::ConnectionFault => "sniff-on-connection-fault",
            SniffReason::Manual => "default",
        }
    }
}

/// Sniffer construction options
#[derive(Debug, Clone)]
pub struct SnifferOptions {
    /// Path of the nodes endpoint to query
    pub endpoint: String,
    /// Background refresh period; no task is spawned when absent
    pub interval: Option<Duration>,
    pub request_timeout: Duration,
}

impl Default for SnifferOptions {
    fn default() -> Self {
        Self {
            endpoint: "_nodes/_all/http".to_string(),
            interval: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Discovers cluster topology and keeps the pool membership current
pub struct Sniffer {
    pool: Arc<ConnectionPool>,
    serializer: Arc<Serializer>,
    opts: SnifferOptions,
    running: AtomicBool,
    /// Slot shared with the transport's memory circuit breaker; only
    /// refreshed when attached.
    memory_pressure: RwLock<Option<Arc<RwLock<Option<f64>>>>>,
}

impl Sniffer {
    pub fn new(
        pool: Arc<ConnectionPool>,
        serializer: Arc<Serializer>,
        opts: SnifferOptions,
    ) -> Self {
        Self {
            pool,
            serializer,
            opts,
            running: AtomicBool::new(false),
            memory_pressure: RwLock::new(None),
        }
    }

    /// Attach the shared memory-utilization slot the interval task refreshes
    pub fn attach_memory_pressure(&self, slot: Arc<RwLock<Option<f64>>>) {
        *self.memory_pressure.write() = Some(slot);
    }

    /// Spawn the periodic refresh task. Returns `None` when no interval
    /// is configured.
    pub fn start(self: Arc<Self>) -> Option<JoinHandle<()>> {
        let interval = self.opts.interval?;
        self.running.store(true, Ordering::SeqCst);
        info!(interval = ?interval, endpoint = %self.opts.endpoint, "Starting topology sniffer");

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick fires immediately, skip it
            ticker.tick().await;

            while self.running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if !self.running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = self.sniff(SniffReason::Interval).await {
                    warn!(error = %e, "Periodic sniff failed");
                }
                self.refresh_memory_pressure().await;
            }
            debug!("Topology sniffer stopped");
        }))
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Query the nodes endpoint once and reconcile the pool. Failures
    /// leave the current membership untouched.
    pub async fn sniff(&self, reason: SniffReason) -> Result<SniffOutcome> {
        debug!(reason = reason.as_str(), "Sniffing cluster topology");
        let connection = self.pool.get_connection(&[]).await?;
        let request = WireRequest::new(
            reqwest::Method::GET,
            self.opts.endpoint.clone(),
            self.opts.request_timeout,
        );

        let response = match connection.request(request, None).await {
            Ok(response) => response,
            Err(e) => {
                if e.is_retryable() {
                    self.pool.mark_dead(&connection);
                }
                return Err(e);
            }
        };
        if response.status_code >= 400 {
            return Err(ClientError::connection(format!(
                "Sniff request failed with status {}",
                response.status_code
            )));
        }

        let document = self.serializer.deserialize_bytes(&response.body)?;
        let nodes = parse_nodes(connection.url().scheme(), &document)?;
        let hosts: Vec<String> = nodes.iter().map(|n| n.url.clone()).collect();

        self.pool.update(nodes)?;
        info!(
            reason = reason.as_str(),
            nodes = hosts.len(),
            "Topology refreshed"
        );
        metrics::record_sniff(reason.as_str(), hosts.len());

        Ok(SniffOutcome {
            hosts,
            reason: reason.as_str().to_string(),
        })
    }

    async fn refresh_memory_pressure(&self) {
        let slot = match self.memory_pressure.read().clone() {
            Some(slot) => slot,
            None => return,
        };
        match self.fetch_memory_pressure().await {
            Ok(Some(percentage)) => {
                debug!(percentage, "Cluster memory utilization sampled");
                *slot.write() = Some(percentage);
            }
            Ok(None) => {}
            Err(e) => debug!(error = %e, "Memory utilization sample failed"),
        }
    }

    /// Highest os.mem.used_percent reported by any node
    async fn fetch_memory_pressure(&self) -> Result<Option<f64>> {
        let connection = self.pool.get_connection(&[]).await?;
        let request = WireRequest::new(
            reqwest::Method::GET,
            "_nodes/stats/os",
            self.opts.request_timeout,
        );
        let response = connection.request(request, None).await?;
        let document = self.serializer.deserialize_bytes(&response.body)?;

        let max = document
            .get("nodes")
            .and_then(Value::as_object)
            .map(|nodes| {
                nodes
                    .values()
                    .filter_map(|node| {
                        node.pointer("/os/mem/used_percent").and_then(Value::as_f64)
                    })
                    .fold(f64::MIN, f64::max)
            })
            .filter(|max| *max > f64::MIN);
        Ok(max)
    }
}

/// Turn a nodes document into pool descriptors. Nodes without an http
/// layer are skipped; identity stays URL-based so sniffed entries
/// reconcile with seed connections for the same endpoint.
fn parse_nodes(scheme: &str, document: &Value) -> Result<Vec<NodeDescriptor>> {
    let nodes = document
        .get("nodes")
        .and_then(Value::as_object)
        .ok_or_else(|| ClientError::Deserialization {
            message: "Topology document has no nodes object".to_string(),
            data: document.to_string(),
        })?;

    let mut descriptors = Vec::with_capacity(nodes.len());
    for node in nodes.values() {
        let Some(address) = node
            .pointer("/http/publish_address")
            .and_then(Value::as_str)
        else {
            continue;
        };
        let roles = node.get("roles").and_then(Value::as_array).map(|names| {
            Roles::from_names(
                &names
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>(),
            )
        });
        descriptors.push(NodeDescriptor {
            url: format!("{}://{}", scheme, parse_publish_address(address)),
            id: None,
            roles,
            headers: HashMap::new(),
        });
    }
    Ok(descriptors)
}

/// A publish address is `ip:port` or `fqdn/ip:port`; the fqdn form
/// resolves to the fqdn with the advertised port.
fn parse_publish_address(address: &str) -> String {
    match address.split_once('/') {
        Some((fqdn, rest)) => match rest.rsplit_once(':') {
            Some((_, port)) => format!("{}:{}", fqdn, port),
            None => fqdn.to_string(),
        },
        None => address.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionOptions;
    use crate::pool::PoolOptions;
    use crate::testutil::{MockTransport, Scripted};
    use serde_json::json;
    use url::Url;

    const NODES_DOC: &str = r#"{
        "nodes": {
            "node-a": {
                "roles": ["cluster_manager", "data", "ingest"],
                "http": {"publish_address": "n1:9200"}
            },
            "node-b": {
                "roles": ["data", "ingest"],
                "http": {"publish_address": "worker.internal/10.0.0.2:9201"}
            }
        }
    }"#;

    fn sniffer_with(
        script: Vec<Scripted>,
        opts: SnifferOptions,
    ) -> (Arc<Sniffer>, Arc<MockTransport>) {
        let mock = Arc::new(MockTransport::scripted(script));
        let pool = Arc::new(ConnectionPool::new(PoolOptions {
            default_transport: Some(mock.clone()),
            ..Default::default()
        }));
        let mut seed = ConnectionOptions::new(Url::parse("http://n1:9200/").unwrap());
        seed.transport = Some(mock.clone());
        pool.add_connection(seed).unwrap();

        let sniffer = Arc::new(Sniffer::new(
            pool,
            Arc::new(Serializer::default()),
            opts,
        ));
        (sniffer, mock)
    }

    #[test]
    fn test_parse_publish_address_forms() {
        assert_eq!(parse_publish_address("127.0.0.1:9200"), "127.0.0.1:9200");
        assert_eq!(
            parse_publish_address("example.com/127.0.0.1:9200"),
            "example.com:9200"
        );
    }

    #[test]
    fn test_parse_nodes_extracts_urls_and_roles() {
        let document: Value = serde_json::from_str(NODES_DOC).unwrap();
        let mut nodes = parse_nodes("https", &document).unwrap();
        nodes.sort_by(|a, b| a.url.cmp(&b.url));

        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].url, "https://n1:9200");
        assert!(nodes[0].roles.unwrap().cluster_manager);
        assert_eq!(nodes[1].url, "https://worker.internal:9201");
        assert!(!nodes[1].roles.unwrap().cluster_manager);
    }

    #[test]
    fn test_parse_nodes_skips_nodes_without_http() {
        let document = json!({
            "nodes": {
                "node-a": {"roles": ["data"]},
                "node-b": {"http": {"publish_address": "n2:9200"}}
            }
        });
        let nodes = parse_nodes("http", &document).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].url, "http://n2:9200");
    }

    #[test]
    fn test_parse_nodes_rejects_malformed_document() {
        let err = parse_nodes("http", &json!({"cluster_name": "x"})).unwrap_err();
        assert_eq!(err.error_type(), "deserialization");
    }

    #[tokio::test]
    async fn test_sniff_reconciles_pool() {
        let (sniffer, _) = sniffer_with(
            vec![Scripted::Respond {
                status: 200,
                body: NODES_DOC,
            }],
            SnifferOptions::default(),
        );

        let outcome = sniffer.sniff(SniffReason::Manual).await.unwrap();
        assert_eq!(outcome.reason, "default");
        assert_eq!(outcome.hosts.len(), 2);

        // seed n1 reconciled in place, worker added
        assert_eq!(sniffer.pool.size(), 2);
        assert!(sniffer.pool.get("http://n1:9200/").is_some());
        assert!(sniffer.pool.get("http://worker.internal:9201/").is_some());
    }

    #[tokio::test]
    async fn test_failed_sniff_leaves_pool_untouched() {
        let (sniffer, _) = sniffer_with(vec![Scripted::ConnError], SnifferOptions::default());

        let err = sniffer.sniff(SniffReason::Interval).await.unwrap_err();
        assert_eq!(err.error_type(), "connection");
        assert_eq!(sniffer.pool.size(), 1);
        // the serving connection took the blame
        let seed = sniffer.pool.get("http://n1:9200/").unwrap();
        assert_eq!(seed.status().as_str(), "dead");
    }

    #[tokio::test]
    async fn test_sniff_error_status_is_a_failure() {
        let (sniffer, _) = sniffer_with(
            vec![Scripted::Respond {
                status: 500,
                body: "{}",
            }],
            SnifferOptions::default(),
        );
        let err = sniffer.sniff(SniffReason::Manual).await.unwrap_err();
        assert!(err.to_string().contains("status 500"));
    }

    #[tokio::test]
    async fn test_interval_task_sniffs_until_stopped() {
        let (sniffer, mock) = sniffer_with(
            vec![],
            SnifferOptions {
                interval: Some(Duration::from_millis(10)),
                ..Default::default()
            },
        );
        // default mock replies are not a nodes document, so each tick
        // fails; the task must keep running regardless
        let handle = Arc::clone(&sniffer).start().unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        sniffer.stop();
        handle.await.unwrap();
        assert!(mock.request_count() >= 2);
    }

    #[tokio::test]
    async fn test_no_interval_means_no_task() {
        let (sniffer, _) = sniffer_with(vec![], SnifferOptions::default());
        assert!(Arc::clone(&sniffer).start().is_none());
    }

    #[tokio::test]
    async fn test_memory_pressure_sample() {
        let stats = r#"{
            "nodes": {
                "a": {"os": {"mem": {"used_percent": 41.0}}},
                "b": {"os": {"mem": {"used_percent": 87.5}}}
            }
        }"#;
        let (sniffer, _) = sniffer_with(
            vec![Scripted::Respond {
                status: 200,
                body: stats,
            }],
            SnifferOptions::default(),
        );
        let slot = Arc::new(RwLock::new(None));
        sniffer.attach_memory_pressure(Arc::clone(&slot));
        sniffer.refresh_memory_pressure().await;
        assert_eq!(*slot.read(), Some(87.5));
    }
}
