//! Lodestone Client - Resilient runtime for multi-node search clusters
//!
//! This crate provides the transport core of a search-and-analytics
//! cluster client: connection pooling, health tracking, retries and
//! topology discovery over HTTP(S).
//!
//! # Architecture
//!
//! - **Connection**: One node endpoint with its own socket pool, baked
//!   auth headers and health fields; wire dispatch behind a pluggable
//!   `NodeTransport` trait
//! - **ConnectionPool**: Membership, filtered round-robin selection,
//!   exponential-backoff death marking, resurrection strategies
//! - **Transport**: The request engine — sequential retries over
//!   distinct connections, memory circuit breaker, request compression,
//!   cancellation, response decoding
//! - **Sniffer**: On-demand and periodic topology refresh from the
//!   cluster nodes endpoint
//! - **Serializer**: JSON / NDJSON / querystring encoding with
//!   prototype-poisoning protection on decode
//!
//! # Key Operations
//!
//! - `Client::request`: one logical call with retries and an envelope
//!   describing how it resolved
//! - `Client::ping` / `Client::check_compatibility`: cluster probes
//! - `Client::sniff`: explicit topology refresh
//! - Per-call overrides: timeout, retry budget, headers, compression,
//!   ignored statuses, cancellation token

pub mod config;
pub mod connection;
pub mod error;
pub mod metrics;
pub mod pool;
pub mod serializer;
pub mod sniff;
pub mod transport;
pub mod types;

mod client;
#[cfg(test)]
mod testutil;

pub use client::Client;
pub use config::{ClientConfig, MemoryCircuitBreakerConfig, NodeEntry, TlsConfig};
pub use connection::{
    Connection, ConnectionOptions, ConnectionStatus, NodeTransport, PreparedRequest, WireRequest,
    WireResponse,
};
pub use error::{ClientError, Result};
pub use pool::{
    default_node_filter, ConnectionPool, NodeFilter, NodeSelector, PoolOptions, ResurrectStrategy,
    RoundRobinSelector,
};
pub use serializer::{NdBodyItem, PoisoningAction, Serializer};
pub use sniff::{SniffReason, Sniffer, SnifferOptions};
pub use transport::{Transport, TransportOptions};
pub use types::*;
