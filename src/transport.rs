//! The request-dispatch engine
//!
//! Orchestrates one logical request across the pool: body resolution,
//! the memory circuit breaker, a strictly sequential retry loop over
//! distinct connections, health reporting, response decoding and
//! server-error wrapping. Retries are never parallel fan-out; attempt
//! N+1 starts only after attempt N concludes, bounding cluster load.

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::MemoryCircuitBreakerConfig;
use crate::connection::{Connection, WireRequest, WireResponse};
use crate::error::{ClientError, Result};
use crate::metrics;
use crate::pool::ConnectionPool;
use crate::serializer::Serializer;
use crate::sniff::{SniffReason, Sniffer};
use crate::types::{
    ApiResponse, QueryString, RequestBody, RequestOptions, RequestParams, ResponseBody,
    ResponseMeta,
};

/// Transport construction options
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub max_retries: u32,
    pub request_timeout: Duration,
    pub compression: bool,
    pub suggest_compression: bool,
    pub compression_threshold: usize,
    /// Static headers attached to every request
    pub headers: HashMap<String, String>,
    /// Client instance name recorded in envelope metadata
    pub name: String,
    pub opaque_id_prefix: Option<String>,
    pub memory_circuit_breaker: MemoryCircuitBreakerConfig,
    /// Server statuses retried instead of wrapped as response errors
    pub retry_on_statuses: Vec<u16>,
    pub sniff_on_connection_fault: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            request_timeout: Duration::from_secs(30),
            compression: false,
            suggest_compression: false,
            compression_threshold: 1_024,
            headers: HashMap::new(),
            name: "lodestone-client".to_string(),
            opaque_id_prefix: None,
            memory_circuit_breaker: MemoryCircuitBreakerConfig::default(),
            retry_on_statuses: Vec::new(),
            sniff_on_connection_fault: false,
        }
    }
}

/// The shared request engine: one instance serves every concurrent
/// logical request of a client.
pub struct Transport {
    pool: Arc<ConnectionPool>,
    serializer: Arc<Serializer>,
    opts: TransportOptions,
    /// Last observed cluster memory utilization percentage
    memory_pressure: Arc<RwLock<Option<f64>>>,
    sniffer: RwLock<Option<Arc<Sniffer>>>,
}

impl Transport {
    pub fn new(
        pool: Arc<ConnectionPool>,
        serializer: Arc<Serializer>,
        opts: TransportOptions,
    ) -> Self {
        Self {
            pool,
            serializer,
            opts,
            memory_pressure: Arc::new(RwLock::new(None)),
            sniffer: RwLock::new(None),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn serializer(&self) -> &Arc<Serializer> {
        &self.serializer
    }

    /// Wire the background sniffer used for fault-triggered refreshes
    pub fn set_sniffer(&self, sniffer: Arc<Sniffer>) {
        *self.sniffer.write() = Some(sniffer);
    }

    /// Shared slot the sniffer refreshes with cluster stats
    pub fn memory_pressure_slot(&self) -> Arc<RwLock<Option<f64>>> {
        Arc::clone(&self.memory_pressure)
    }

    /// Record an externally observed memory utilization percentage
    pub fn set_memory_pressure(&self, percentage: f64) {
        *self.memory_pressure.write() = Some(percentage);
    }

    /// Perform one logical request with retries, health reporting and
    /// response decoding.
    pub async fn request(
        &self,
        params: RequestParams,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        let timer = metrics::RequestTimer::new(params.method.as_str());
        match self.dispatch(params, options).await {
            Ok(response) => {
                timer.success(response.meta.attempts);
                Ok(response)
            }
            Err(e) => {
                timer.error(e.error_type());
                Err(e)
            }
        }
    }

    async fn dispatch(
        &self,
        params: RequestParams,
        options: RequestOptions,
    ) -> Result<ApiResponse> {
        let mut meta = ResponseMeta {
            name: self.opts.name.clone(),
            request_id: options
                .id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            context: options.context.clone(),
            ..Default::default()
        };

        if let Some((observed, limit)) = self.breaker_open() {
            warn!(observed, limit, "Memory circuit breaker refused dispatch");
            metrics::record_breaker_trip();
            return Err(ClientError::CircuitBreaking(format!(
                "cluster memory utilization {:.1}% exceeds the configured maximum {:.1}%",
                observed, limit
            )));
        }

        // Terminal on failure: nothing has touched the network yet.
        let (body, content_type) = self.resolve_body(&params)?;
        let querystring = self.resolve_querystring(&params);
        let headers = self.resolve_headers(&options, content_type);
        let (body, headers) = self.compress(body, headers, &options)?;

        let timeout = options.request_timeout.unwrap_or(self.opts.request_timeout);
        let max_retries = options.max_retries.unwrap_or(self.opts.max_retries);
        let abort = options.abort.clone();

        let mut attempts: u32 = 0;
        let mut used: Vec<String> = Vec::new();

        loop {
            if abort.as_ref().is_some_and(|token| token.is_cancelled()) {
                meta.attempts = attempts;
                meta.aborted = true;
                return Err(ClientError::aborted().with_meta(ApiResponse::empty(meta)));
            }

            let connection = match self.pool.get_connection(&used).await {
                Ok(connection) => connection,
                Err(e) => {
                    meta.attempts = attempts;
                    return Err(e.with_meta(ApiResponse::empty(meta)));
                }
            };
            used.push(connection.id().to_string());
            attempts += 1;

            let mut wire = WireRequest::new(params.method.clone(), params.path.clone(), timeout);
            wire.querystring = querystring.clone();
            wire.headers = headers.clone();
            wire.body = body.clone();

            debug!(
                request_id = %meta.request_id,
                connection = %connection.id(),
                attempt = attempts,
                "Dispatching request"
            );

            match connection.request(wire, abort.as_ref()).await {
                Err(e @ ClientError::RequestAborted { .. }) => {
                    meta.attempts = attempts;
                    meta.aborted = true;
                    meta.connection = Some(connection.id().to_string());
                    return Err(e.with_meta(ApiResponse::empty(meta)));
                }
                Err(e) if e.is_retryable() => {
                    self.report_fault(&connection);
                    if attempts <= max_retries {
                        debug!(
                            request_id = %meta.request_id,
                            error = %e,
                            "Attempt failed, retrying on another connection"
                        );
                        metrics::record_retry(params.method.as_str());
                        continue;
                    }
                    meta.attempts = attempts;
                    meta.connection = Some(connection.id().to_string());
                    return Err(e.with_meta(ApiResponse::empty(meta)));
                }
                Err(e) => {
                    // Terminal kinds are never swallowed by the retry loop
                    meta.attempts = attempts;
                    meta.connection = Some(connection.id().to_string());
                    return Err(e.with_meta(ApiResponse::empty(meta)));
                }
                Ok(wire_response) => {
                    self.pool.mark_alive(&connection);
                    if self.opts.retry_on_statuses.contains(&wire_response.status_code)
                        && attempts <= max_retries
                    {
                        debug!(
                            request_id = %meta.request_id,
                            status = wire_response.status_code,
                            "Retrying on configured status"
                        );
                        metrics::record_retry(params.method.as_str());
                        continue;
                    }
                    meta.attempts = attempts;
                    meta.connection = Some(connection.id().to_string());
                    return self.finish(wire_response, &options, meta);
                }
            }
        }
    }

    /// Verify the node at the other end is a supported distribution,
    /// by inspecting the root info document.
    pub async fn check_compatibility(&self) -> Result<ApiResponse> {
        let response = self
            .request(
                RequestParams::new(reqwest::Method::GET, "/"),
                RequestOptions::default(),
            )
            .await?;

        let version = response
            .body
            .as_ref()
            .and_then(|body| body.as_json())
            .and_then(|json| json.get("version"));
        let distribution = version
            .and_then(|v| v.get("distribution"))
            .and_then(|d| d.as_str());
        let number = version
            .and_then(|v| v.get("number"))
            .and_then(|n| n.as_str())
            .unwrap_or("");

        if distribution == Some("opensearch") || legacy_version_supported(number) {
            return Ok(response);
        }
        Err(ClientError::not_compatible(response))
    }

    fn breaker_open(&self) -> Option<(f64, f64)> {
        let breaker = &self.opts.memory_circuit_breaker;
        if !breaker.enabled {
            return None;
        }
        let observed = (*self.memory_pressure.read())?;
        (observed > breaker.max_percentage).then_some((observed, breaker.max_percentage))
    }

    fn report_fault(&self, connection: &Connection) {
        self.pool.mark_dead(connection);
        if self.opts.sniff_on_connection_fault {
            if let Some(sniffer) = self.sniffer.read().clone() {
                // Scheduled, never awaited: a sniff must not delay the
                // in-flight request it was triggered by.
                tokio::spawn(async move {
                    if let Err(e) = sniffer.sniff(SniffReason::ConnectionFault).await {
                        debug!(error = %e, "Fault-triggered sniff failed");
                    }
                });
            }
        }
    }

    fn resolve_body(&self, params: &RequestParams) -> Result<(Option<Bytes>, Option<&'static str>)> {
        match &params.body {
            None => Ok((None, None)),
            Some(RequestBody::Json(value)) => {
                let encoded = self.serializer.serialize(value)?;
                Ok((Some(Bytes::from(encoded)), Some("application/json")))
            }
            Some(RequestBody::NdJson(items)) => {
                let encoded = self.serializer.ndserialize(items)?;
                Ok((Some(Bytes::from(encoded)), Some("application/x-ndjson")))
            }
            Some(RequestBody::Text(text)) => {
                Ok((Some(Bytes::from(text.clone())), Some("application/json")))
            }
            Some(RequestBody::Bytes(bytes)) => Ok((Some(bytes.clone()), None)),
        }
    }

    fn resolve_querystring(&self, params: &RequestParams) -> Option<String> {
        match &params.querystring {
            Some(QueryString::Raw(raw)) => Some(raw.clone()),
            Some(QueryString::Params(map)) => {
                let encoded = self.serializer.qserialize(map);
                (!encoded.is_empty()).then_some(encoded)
            }
            None => None,
        }
    }

    fn resolve_headers(
        &self,
        options: &RequestOptions,
        content_type: Option<&'static str>,
    ) -> HashMap<String, String> {
        let mut headers = self.opts.headers.clone();
        for (name, value) in &options.headers {
            headers.insert(name.clone(), value.clone());
        }
        if let Some(content_type) = content_type {
            headers
                .entry("content-type".to_string())
                .or_insert_with(|| content_type.to_string());
        }
        if let Some(opaque_id) = &options.opaque_id {
            let value = match &self.opts.opaque_id_prefix {
                Some(prefix) => format!("{}{}", prefix, opaque_id),
                None => opaque_id.clone(),
            };
            headers.insert("x-opaque-id".to_string(), value);
        }
        if self.opts.suggest_compression {
            headers.insert("accept-encoding".to_string(), "gzip,deflate".to_string());
        }
        headers
    }

    fn compress(
        &self,
        body: Option<Bytes>,
        mut headers: HashMap<String, String>,
        options: &RequestOptions,
    ) -> Result<(Option<Bytes>, HashMap<String, String>)> {
        let enabled = options.compression.unwrap_or(self.opts.compression);
        match body {
            Some(bytes) if enabled && bytes.len() >= self.opts.compression_threshold => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder
                    .write_all(&bytes)
                    .and_then(|_| encoder.finish())
                    .map(|compressed| {
                        headers.insert("content-encoding".to_string(), "gzip".to_string());
                        (Some(Bytes::from(compressed)), headers)
                    })
                    .map_err(|e| ClientError::Serialization(format!("gzip failed: {}", e)))
            }
            other => Ok((other, headers)),
        }
    }

    fn finish(
        &self,
        wire: WireResponse,
        options: &RequestOptions,
        meta: ResponseMeta,
    ) -> Result<ApiResponse> {
        let warnings: Vec<String> = wire
            .headers
            .iter()
            .filter(|(name, _)| name.eq_ignore_ascii_case("warning"))
            .map(|(_, value)| value.clone())
            .collect();

        let body = if wire.body.is_empty() {
            None
        } else if options.raw_body {
            Some(ResponseBody::Raw(wire.body.clone()))
        } else if is_json(&wire.headers) {
            Some(ResponseBody::Json(
                self.serializer.deserialize_bytes(&wire.body)?,
            ))
        } else {
            Some(ResponseBody::Text(
                String::from_utf8_lossy(&wire.body).into_owned(),
            ))
        };

        let envelope = ApiResponse {
            body,
            status_code: Some(wire.status_code),
            headers: wire.headers,
            warnings,
            meta,
        };

        if wire.status_code >= 400 && !options.ignore.contains(&wire.status_code) {
            return Err(ClientError::response(envelope));
        }
        Ok(envelope)
    }
}

fn is_json(headers: &HashMap<String, String>) -> bool {
    headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .map_or(false, |(_, value)| {
            value.contains("application/json") || value.contains("application/x-ndjson")
        })
}

// OpenSearch is always supported; the legacy upstream line is only
// supported through its final open release.
fn legacy_version_supported(number: &str) -> bool {
    let mut parts = number.split('.');
    let major: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    let minor: u32 = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
    major == 7 && minor <= 10 || major == 6
}
