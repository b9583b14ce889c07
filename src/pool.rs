//! The live set of connections: selection, health mutation, resurrection
//!
//! The pool is the sole owner and sole mutator of connection membership
//! and health state. Requests report outcomes through `mark_dead` /
//! `mark_alive`; sniffing reconciles membership through `update`.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};
use url::Url;

use crate::connection::{
    Connection, ConnectionOptions, ConnectionStatus, NodeTransport, WireRequest,
};
use crate::error::{ClientError, Result};
use crate::metrics;
use crate::types::{BasicAuth, NodeDescriptor};

/// How a dead connection becomes eligible again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResurrectStrategy {
    /// Probe the candidate with a lightweight ping before returning it
    Ping,
    /// Return the candidate directly; the next real request confirms health
    Optimistic,
    /// Never resurrect automatically; only a pool update reintroduces nodes
    None,
}

impl Default for ResurrectStrategy {
    fn default() -> Self {
        ResurrectStrategy::Ping
    }
}

impl ResurrectStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResurrectStrategy::Ping => "ping",
            ResurrectStrategy::Optimistic => "optimistic",
            ResurrectStrategy::None => "none",
        }
    }
}

impl std::str::FromStr for ResurrectStrategy {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ping" => Ok(ResurrectStrategy::Ping),
            "optimistic" => Ok(ResurrectStrategy::Optimistic),
            "none" => Ok(ResurrectStrategy::None),
            other => Err(ClientError::Configuration(format!(
                "Unsupported resurrect strategy: '{}'",
                other
            ))),
        }
    }
}

/// Selection seam: picks one connection out of the eligible set
pub trait NodeSelector: Send + Sync + fmt::Debug {
    fn select(&self, connections: &[Arc<Connection>]) -> Option<Arc<Connection>>;
}

/// Default selector: round-robin over the eligible set
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    cursor: AtomicUsize,
}

impl NodeSelector for RoundRobinSelector {
    fn select(&self, connections: &[Arc<Connection>]) -> Option<Arc<Connection>> {
        if connections.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % connections.len();
        Some(Arc::clone(&connections[index]))
    }
}

/// Predicate deciding whether a connection may serve a request
pub type NodeFilter = Arc<dyn Fn(&Connection) -> bool + Send + Sync>;

/// Default filter: skip nodes that only coordinate the cluster,
/// data traffic belongs on data/ingest nodes.
pub fn default_node_filter() -> NodeFilter {
    Arc::new(|connection: &Connection| !connection.roles().cluster_manager_only())
}

/// Pool construction options
pub struct PoolOptions {
    pub resurrect_strategy: ResurrectStrategy,
    /// Base of the dead-connection backoff schedule
    pub resurrect_base: Duration,
    /// Upper bound of the backoff schedule
    pub resurrect_cap: Duration,
    pub ping_timeout: Duration,
    /// Drop nodes absent from a sniffed topology
    pub drop_vanished_nodes: bool,
    pub selector: Arc<dyn NodeSelector>,
    pub filter: NodeFilter,
    /// Credentials baked into every connection built from a descriptor
    pub auth: Option<BasicAuth>,
    pub skip_tls_verify: bool,
    pub proxy: Option<Url>,
    /// Wire layer override applied to descriptor-built connections
    pub default_transport: Option<Arc<dyn NodeTransport>>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            resurrect_strategy: ResurrectStrategy::default(),
            resurrect_base: Duration::from_secs(60),
            resurrect_cap: Duration::from_secs(30 * 60),
            ping_timeout: Duration::from_secs(3),
            drop_vanished_nodes: true,
            selector: Arc::new(RoundRobinSelector::default()),
            filter: default_node_filter(),
            auth: None,
            skip_tls_verify: false,
            proxy: None,
            default_transport: None,
        }
    }
}

/// Ordered, id-keyed collection of connections
pub struct ConnectionPool {
    connections: RwLock<Vec<Arc<Connection>>>,
    opts: PoolOptions,
}

impl ConnectionPool {
    pub fn new(opts: PoolOptions) -> Self {
        Self {
            connections: RwLock::new(Vec::new()),
            opts,
        }
    }

    pub fn size(&self) -> usize {
        self.connections.read().len()
    }

    pub fn alive_count(&self) -> usize {
        self.connections
            .read()
            .iter()
            .filter(|c| c.status() == ConnectionStatus::Alive)
            .count()
    }

    /// Snapshot of the current membership
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Connection>> {
        self.connections.read().iter().find(|c| c.id() == id).cloned()
    }

    /// Insert a connection, or update in place when the id is already known
    pub fn add_connection(&self, opts: ConnectionOptions) -> Result<Arc<Connection>> {
        let connection = Arc::new(Connection::new(opts)?);
        let mut connections = self.connections.write();
        if let Some(existing) = connections
            .iter_mut()
            .find(|c| c.id() == connection.id())
        {
            debug!(id = %connection.id(), "Updating existing connection in place");
            let old = std::mem::replace(existing, Arc::clone(&connection));
            drop(connections);
            tokio::spawn(async move { old.close().await });
        } else {
            debug!(id = %connection.id(), "Adding connection to pool");
            connections.push(Arc::clone(&connection));
            metrics::record_pool_size(connections.len());
        }
        Ok(connection)
    }

    /// Remove a connection by id; unknown ids are a no-op. The socket
    /// pool is released asynchronously once in-flight requests drain.
    pub fn remove_connection(&self, id: &str) {
        let mut connections = self.connections.write();
        if let Some(position) = connections.iter().position(|c| c.id() == id) {
            let removed = connections.remove(position);
            metrics::record_pool_size(connections.len());
            drop(connections);
            debug!(id = %id, "Removing connection from pool");
            tokio::spawn(async move { removed.close().await });
        }
    }

    /// Report a failed dispatch: status becomes dead and the resurrect
    /// deadline backs off exponentially (with jitter, so a herd of dead
    /// nodes does not resurrect in lockstep).
    pub fn mark_dead(&self, connection: &Connection) {
        let death_count = connection.dead_count() + 1;
        let deadline = Instant::now() + self.backoff(death_count);
        connection.record_death(deadline);
        warn!(
            id = %connection.id(),
            dead_count = death_count,
            "Connection marked dead"
        );
        metrics::record_marked_dead(connection.id());
    }

    /// Report a successful dispatch: status alive, backoff reset
    pub fn mark_alive(&self, connection: &Connection) {
        connection.revive();
        debug!(id = %connection.id(), "Connection marked alive");
        metrics::record_marked_alive(connection.id());
    }

    /// Select a usable connection.
    ///
    /// Alive connections passing the node filter are preferred, with
    /// ids in `exclude` (already tried in this logical request) skipped
    /// while an alternative exists. With no alive candidate, behavior
    /// follows the resurrect strategy.
    pub async fn get_connection(&self, exclude: &[String]) -> Result<Arc<Connection>> {
        let (alive, dead): (Vec<_>, Vec<_>) = {
            let connections = self.connections.read();
            connections
                .iter()
                .filter(|c| (self.opts.filter)(c))
                .cloned()
                .partition(|c| c.status() == ConnectionStatus::Alive)
        };

        let candidates = prefer_unexcluded(alive, exclude);
        if !candidates.is_empty() {
            return self
                .opts
                .selector
                .select(&candidates)
                .ok_or_else(|| ClientError::no_living_connections(None));
        }

        self.resurrect(dead, exclude).await
    }

    async fn resurrect(
        &self,
        dead: Vec<Arc<Connection>>,
        exclude: &[String],
    ) -> Result<Arc<Connection>> {
        if self.opts.resurrect_strategy == ResurrectStrategy::None {
            return Err(ClientError::no_living_connections(None));
        }

        let now = Instant::now();
        let eligible: Vec<_> = dead
            .into_iter()
            .filter(|c| c.resurrect_deadline().map_or(true, |deadline| deadline <= now))
            .collect();
        let eligible = prefer_unexcluded(eligible, exclude);

        // Earliest elapsed deadline first
        let candidate = eligible
            .into_iter()
            .min_by_key(|c| c.resurrect_deadline())
            .ok_or_else(|| ClientError::no_living_connections(None))?;

        match self.opts.resurrect_strategy {
            ResurrectStrategy::Optimistic => {
                info!(id = %candidate.id(), "Optimistically resurrecting connection");
                // Status flips to alive but the backoff schedule is kept:
                // the next failure backs off further instead of restarting.
                candidate.set_alive_candidate();
                metrics::record_resurrection(candidate.id(), "optimistic");
                Ok(candidate)
            }
            ResurrectStrategy::Ping => {
                let probe = WireRequest::new(
                    reqwest::Method::HEAD,
                    "/",
                    self.opts.ping_timeout,
                );
                match candidate.request(probe, None).await {
                    Ok(_) => {
                        info!(id = %candidate.id(), "Resurrection ping succeeded");
                        self.mark_alive(&candidate);
                        metrics::record_resurrection(candidate.id(), "ping");
                        Ok(candidate)
                    }
                    Err(e) => {
                        debug!(id = %candidate.id(), error = %e, "Resurrection ping failed");
                        self.mark_dead(&candidate);
                        Err(ClientError::no_living_connections(None))
                    }
                }
            }
            ResurrectStrategy::None => unreachable!("handled above"),
        }
    }

    /// Reconcile the pool against a freshly sniffed topology: unseen
    /// nodes are added, known nodes are marked alive, and (by default)
    /// nodes absent from the new topology are dropped.
    pub fn update(&self, nodes: Vec<NodeDescriptor>) -> Result<()> {
        let mut seen: Vec<String> = Vec::with_capacity(nodes.len());
        let mut added = 0usize;

        for descriptor in nodes {
            let opts = self.options_from_descriptor(&descriptor)?;
            let id = opts
                .id
                .clone()
                .unwrap_or_else(|| crate::connection::strip_auth(&opts.url));
            seen.push(id.clone());

            if let Some(existing) = self.get(&id) {
                if existing.status() == ConnectionStatus::Dead {
                    self.mark_alive(&existing);
                }
                if let Some(roles) = descriptor.roles {
                    existing.set_role("cluster_manager", roles.cluster_manager)?;
                    existing.set_role("data", roles.data)?;
                    existing.set_role("ingest", roles.ingest)?;
                }
            } else {
                self.add_connection(opts)?;
                added += 1;
            }
        }

        let mut dropped = 0usize;
        if self.opts.drop_vanished_nodes {
            let vanished: Vec<String> = self
                .connections
                .read()
                .iter()
                .filter(|c| !seen.iter().any(|id| id == c.id()))
                .map(|c| c.id().to_string())
                .collect();
            dropped = vanished.len();
            for id in vanished {
                self.remove_connection(&id);
            }
        }

        info!(
            size = self.size(),
            added, dropped, "Connection pool updated from topology"
        );
        metrics::record_pool_size(self.size());
        Ok(())
    }

    /// Build connection options for a sniffed or configured descriptor
    pub fn options_from_descriptor(&self, descriptor: &NodeDescriptor) -> Result<ConnectionOptions> {
        let url = Url::parse(&descriptor.url).map_err(|e| {
            ClientError::Configuration(format!("Invalid node URL '{}': {}", descriptor.url, e))
        })?;
        let mut opts = ConnectionOptions::new(url);
        opts.id = descriptor.id.clone();
        opts.headers = descriptor.headers.clone();
        opts.roles = descriptor.roles;
        opts.auth = self.opts.auth.clone();
        opts.skip_tls_verify = self.opts.skip_tls_verify;
        opts.proxy = self.opts.proxy.clone();
        opts.transport = self.opts.default_transport.clone();
        Ok(opts)
    }

    /// Drain and release every connection
    pub async fn close(&self) {
        let connections = self.connections();
        for connection in connections {
            connection.close().await;
        }
        self.connections.write().clear();
        metrics::record_pool_size(0);
    }

    fn backoff(&self, death_count: u32) -> Duration {
        let exponent = death_count.saturating_sub(1).min(16);
        let scaled = self
            .opts
            .resurrect_base
            .saturating_mul(1u32 << exponent)
            .min(self.opts.resurrect_cap);
        scaled + jitter()
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("size", &self.size())
            .field("alive", &self.alive_count())
            .field("strategy", &self.opts.resurrect_strategy)
            .finish()
    }
}

fn prefer_unexcluded(
    candidates: Vec<Arc<Connection>>,
    exclude: &[String],
) -> Vec<Arc<Connection>> {
    let fresh: Vec<_> = candidates
        .iter()
        .filter(|c| !exclude.iter().any(|id| id == c.id()))
        .cloned()
        .collect();
    if fresh.is_empty() {
        candidates
    } else {
        fresh
    }
}

// Sub-second spread keeps the schedule monotone while still separating
// connections that died in the same instant.
fn jitter() -> Duration {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    Duration::from_millis(u64::from(nanos % 1000))
}

/// Role exclusion helpers usable as node filters
pub fn role_filter(required: &'static str) -> NodeFilter {
    Arc::new(move |connection: &Connection| {
        let roles = connection.roles();
        match required {
            "data" => roles.data,
            "ingest" => roles.ingest,
            "cluster_manager" => roles.cluster_manager,
            _ => true,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockTransport, Scripted};
    use crate::types::Roles;

    fn pool_with(opts: PoolOptions) -> ConnectionPool {
        ConnectionPool::new(opts)
    }

    fn quick_resurrect_opts(strategy: ResurrectStrategy) -> PoolOptions {
        PoolOptions {
            resurrect_strategy: strategy,
            resurrect_base: Duration::ZERO,
            ..Default::default()
        }
    }

    fn add_mock_node(pool: &ConnectionPool, url: &str) -> (Arc<Connection>, Arc<MockTransport>) {
        let mock = Arc::new(MockTransport::default());
        let mut opts = ConnectionOptions::new(Url::parse(url).unwrap());
        opts.transport = Some(mock.clone());
        (pool.add_connection(opts).unwrap(), mock)
    }

    #[tokio::test]
    async fn test_pool_size_and_duplicate_ids() {
        let pool = pool_with(PoolOptions::default());
        add_mock_node(&pool, "http://n1:9200/");
        add_mock_node(&pool, "http://n2:9200/");
        add_mock_node(&pool, "http://n3:9200/");
        assert_eq!(pool.size(), 3);

        // same id updates in place
        add_mock_node(&pool, "http://n2:9200/");
        assert_eq!(pool.size(), 3);
    }

    #[tokio::test]
    async fn test_remove_unknown_id_is_noop() {
        let pool = pool_with(PoolOptions::default());
        add_mock_node(&pool, "http://n1:9200/");
        pool.remove_connection("http://unknown:9200/");
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_mark_dead_twice_backs_off() {
        let pool = pool_with(PoolOptions::default());
        let (conn, _) = add_mock_node(&pool, "http://n1:9200/");

        pool.mark_dead(&conn);
        assert_eq!(conn.dead_count(), 1);
        assert_eq!(conn.status(), ConnectionStatus::Dead);
        let first = conn.resurrect_deadline().unwrap();

        pool.mark_dead(&conn);
        assert_eq!(conn.dead_count(), 2);
        let second = conn.resurrect_deadline().unwrap();
        assert!(second >= first);
    }

    #[tokio::test]
    async fn test_mark_alive_resets_backoff() {
        let pool = pool_with(PoolOptions::default());
        let (conn, _) = add_mock_node(&pool, "http://n1:9200/");
        pool.mark_dead(&conn);
        pool.mark_alive(&conn);
        assert_eq!(conn.dead_count(), 0);
        assert_eq!(conn.status(), ConnectionStatus::Alive);
        assert!(conn.resurrect_deadline().is_none());
    }

    #[tokio::test]
    async fn test_round_robin_selection() {
        let pool = pool_with(PoolOptions::default());
        add_mock_node(&pool, "http://n1:9200/");
        add_mock_node(&pool, "http://n2:9200/");

        let first = pool.get_connection(&[]).await.unwrap();
        let second = pool.get_connection(&[]).await.unwrap();
        let third = pool.get_connection(&[]).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(first.id(), third.id());
    }

    #[tokio::test]
    async fn test_excluded_connection_skipped_while_alternative_exists() {
        let pool = pool_with(PoolOptions::default());
        let (c1, _) = add_mock_node(&pool, "http://n1:9200/");
        add_mock_node(&pool, "http://n2:9200/");

        let exclude = vec![c1.id().to_string()];
        for _ in 0..4 {
            let picked = pool.get_connection(&exclude).await.unwrap();
            assert_ne!(picked.id(), c1.id());
        }

        // with no alternative, exclusion is relaxed
        pool.remove_connection("http://n2:9200/");
        let picked = pool.get_connection(&exclude).await.unwrap();
        assert_eq!(picked.id(), c1.id());
    }

    #[tokio::test]
    async fn test_node_filter_always_respected() {
        let mut opts = PoolOptions::default();
        opts.filter = Arc::new(|c: &Connection| c.roles().ingest);
        let pool = pool_with(opts);

        let (c1, _) = add_mock_node(&pool, "http://n1:9200/");
        c1.set_role("ingest", false).unwrap();
        add_mock_node(&pool, "http://n2:9200/");

        for _ in 0..6 {
            let picked = pool.get_connection(&[]).await.unwrap();
            assert_eq!(picked.id(), "http://n2:9200/");
        }
    }

    #[tokio::test]
    async fn test_role_filter_requires_named_role() {
        let mut opts = PoolOptions::default();
        opts.filter = role_filter("data");
        let pool = pool_with(opts);

        let (c1, _) = add_mock_node(&pool, "http://n1:9200/");
        c1.set_role("data", false).unwrap();
        add_mock_node(&pool, "http://n2:9200/");

        for _ in 0..4 {
            let picked = pool.get_connection(&[]).await.unwrap();
            assert_eq!(picked.id(), "http://n2:9200/");
        }
    }

    #[tokio::test]
    async fn test_default_filter_skips_cluster_manager_only_nodes() {
        let pool = pool_with(PoolOptions::default());
        let descriptor = NodeDescriptor {
            url: "http://mgr:9200/".to_string(),
            id: None,
            roles: Some(Roles::from_names(&["cluster_manager"])),
            headers: Default::default(),
        };
        let mut opts = pool.options_from_descriptor(&descriptor).unwrap();
        opts.transport = Some(Arc::new(MockTransport::default()));
        pool.add_connection(opts).unwrap();
        add_mock_node(&pool, "http://data:9200/");

        for _ in 0..6 {
            let picked = pool.get_connection(&[]).await.unwrap();
            assert_eq!(picked.id(), "http://data:9200/");
        }
    }

    #[tokio::test]
    async fn test_strategy_none_never_resurrects() {
        let pool = pool_with(quick_resurrect_opts(ResurrectStrategy::None));
        let (conn, mock) = add_mock_node(&pool, "http://n1:9200/");
        pool.mark_dead(&conn);

        let err = pool.get_connection(&[]).await.unwrap_err();
        assert_eq!(err.error_type(), "no_living_connections");
        // no probe was issued
        assert_eq!(mock.request_count(), 0);

        // an explicit update reintroduces the node
        pool.update(vec![NodeDescriptor::new("http://n1:9200/")])
            .unwrap();
        assert!(pool.get_connection(&[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_ping_before_deadline_fails_without_io() {
        // default base: deadlines are a minute out
        let pool = pool_with(PoolOptions::default());
        let (conn, mock) = add_mock_node(&pool, "http://n1:9200/");
        pool.mark_dead(&conn);

        let err = pool.get_connection(&[]).await.unwrap_err();
        assert_eq!(err.error_type(), "no_living_connections");
        assert_eq!(mock.request_count(), 0);
    }

    #[tokio::test]
    async fn test_ping_resurrection_success() {
        let pool = pool_with(quick_resurrect_opts(ResurrectStrategy::Ping));
        let (conn, mock) = add_mock_node(&pool, "http://n1:9200/");
        pool.mark_dead(&conn);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let picked = pool.get_connection(&[]).await.unwrap();
        assert_eq!(picked.id(), conn.id());
        assert_eq!(picked.status(), ConnectionStatus::Alive);
        assert_eq!(picked.dead_count(), 0);
        assert_eq!(mock.request_count(), 1);
        assert_eq!(mock.last_request().unwrap().method, reqwest::Method::HEAD);
    }

    #[tokio::test]
    async fn test_ping_resurrection_failure_regrows_backoff() {
        let pool = pool_with(quick_resurrect_opts(ResurrectStrategy::Ping));
        let mock = Arc::new(MockTransport::scripted(vec![Scripted::ConnError]));
        let mut opts = ConnectionOptions::new(Url::parse("http://n1:9200/").unwrap());
        opts.transport = Some(mock.clone());
        let conn = pool.add_connection(opts).unwrap();
        pool.mark_dead(&conn);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let err = pool.get_connection(&[]).await.unwrap_err();
        assert_eq!(err.error_type(), "no_living_connections");
        assert_eq!(conn.dead_count(), 2);
        assert_eq!(conn.status(), ConnectionStatus::Dead);
    }

    #[tokio::test]
    async fn test_optimistic_resurrection_skips_probe() {
        let pool = pool_with(quick_resurrect_opts(ResurrectStrategy::Optimistic));
        let (conn, mock) = add_mock_node(&pool, "http://n1:9200/");
        pool.mark_dead(&conn);
        tokio::time::sleep(Duration::from_millis(5)).await;

        let picked = pool.get_connection(&[]).await.unwrap();
        assert_eq!(picked.id(), conn.id());
        assert_eq!(picked.status(), ConnectionStatus::Alive);
        // backoff schedule survives an optimistic resurrection
        assert_eq!(picked.dead_count(), 1);
        assert_eq!(mock.request_count(), 0);
    }

    #[tokio::test]
    async fn test_update_reconciles_topology() {
        let mock: Arc<MockTransport> = Arc::new(MockTransport::default());
        let mut opts = PoolOptions::default();
        opts.default_transport = Some(mock);
        let pool = pool_with(opts);

        pool.update(vec![
            NodeDescriptor::new("http://n1:9200/"),
            NodeDescriptor::new("http://n2:9200/"),
        ])
        .unwrap();
        assert_eq!(pool.size(), 2);

        let n1 = pool.get("http://n1:9200/").unwrap();
        pool.mark_dead(&n1);

        // n2 vanishes, n3 joins, n1 is reachable again
        pool.update(vec![
            NodeDescriptor::new("http://n1:9200/"),
            NodeDescriptor::new("http://n3:9200/"),
        ])
        .unwrap();

        assert_eq!(pool.size(), 2);
        assert!(pool.get("http://n2:9200/").is_none());
        assert!(pool.get("http://n3:9200/").is_some());
        assert_eq!(n1.status(), ConnectionStatus::Alive);
    }

    #[tokio::test]
    async fn test_update_rejects_malformed_url() {
        let pool = pool_with(PoolOptions::default());
        let err = pool
            .update(vec![NodeDescriptor::new("not a url")])
            .unwrap_err();
        assert_eq!(err.error_type(), "configuration");
    }
}
