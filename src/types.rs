//! Request and response types shared across the crate

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{ClientError, Result};
use crate::serializer::NdBodyItem;

/// Node roles as reported by cluster topology
///
/// `data` and `ingest` default to enabled so a bare URL node takes
/// regular traffic until a sniff says otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roles {
    #[serde(default)]
    pub cluster_manager: bool,
    #[serde(default = "default_true")]
    pub data: bool,
    #[serde(default = "default_true")]
    pub ingest: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Roles {
    fn default() -> Self {
        Self {
            cluster_manager: false,
            data: true,
            ingest: true,
        }
    }
}

impl Roles {
    /// Set a role by its wire name. `master` is accepted as a deprecated
    /// alias for `cluster_manager`.
    pub fn set(&mut self, role: &str, enabled: bool) -> Result<()> {
        match role {
            "cluster_manager" | "master" => self.cluster_manager = enabled,
            "data" => self.data = enabled,
            "ingest" => self.ingest = enabled,
            other => {
                return Err(ClientError::Configuration(format!(
                    "Unsupported role: '{}'",
                    other
                )))
            }
        }
        Ok(())
    }

    /// Parse a topology role list (e.g. from a sniffed nodes document)
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        let mut roles = Roles {
            cluster_manager: false,
            data: false,
            ingest: false,
        };
        for name in names {
            // Unknown role names are ignored rather than rejected:
            // newer servers report roles older clients have never heard of.
            let _ = roles.set(name.as_ref(), true);
        }
        roles
    }

    /// True when the node carries no data/ingest role and would only
    /// ever coordinate: the default filter skips these for data traffic.
    pub fn cluster_manager_only(&self) -> bool {
        self.cluster_manager && !self.data && !self.ingest
    }
}

/// Basic authentication credentials baked into connection headers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

/// A node as handed to the pool: either discovered by a sniff or
/// declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub url: String,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub roles: Option<Roles>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl NodeDescriptor {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            id: None,
            roles: None,
            headers: HashMap::new(),
        }
    }
}

/// Request body shapes accepted by the transport
#[derive(Debug, Clone)]
pub enum RequestBody {
    /// Structured value, encoded by the serializer before dispatch
    Json(Value),
    /// Batch items, encoded as newline-delimited JSON
    NdJson(Vec<NdBodyItem>),
    /// Pre-encoded text, sent untouched
    Text(String),
    /// Raw bytes, sent untouched
    Bytes(Bytes),
}

/// Query parameters: a pre-built string or a map resolved by the serializer
#[derive(Debug, Clone)]
pub enum QueryString {
    Raw(String),
    Params(Map<String, Value>),
}

/// One logical API call: method, path, query, body
#[derive(Debug, Clone)]
pub struct RequestParams {
    pub method: reqwest::Method,
    pub path: String,
    pub querystring: Option<QueryString>,
    pub body: Option<RequestBody>,
}

impl RequestParams {
    pub fn new(method: reqwest::Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            querystring: None,
            body: None,
        }
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn with_querystring(mut self, querystring: QueryString) -> Self {
        self.querystring = Some(querystring);
        self
    }
}

/// Per-call options layered over the client defaults
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Status codes that are not wrapped as response errors
    pub ignore: Vec<u16>,
    /// Override of the client request timeout
    pub request_timeout: Option<Duration>,
    /// Override of the client retry budget
    pub max_retries: Option<u32>,
    /// Return the raw body bytes without decoding
    pub raw_body: bool,
    /// Extra headers for this call only
    pub headers: HashMap<String, String>,
    /// Override of the client compression setting
    pub compression: Option<bool>,
    /// Correlation id; generated when absent
    pub id: Option<String>,
    /// Opaque caller context echoed back in the envelope
    pub context: Option<Value>,
    /// Value for the opaque-id correlation header
    pub opaque_id: Option<String>,
    /// Cancellation handle; cancelling closes the active socket and
    /// resolves the call exactly once with a request-aborted error
    pub abort: Option<CancellationToken>,
}

/// Decoded response body
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
    Raw(Bytes),
}

impl ResponseBody {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// Outcome of a topology sniff
#[derive(Debug, Clone, PartialEq)]
pub struct SniffOutcome {
    pub hosts: Vec<String>,
    pub reason: String,
}

/// Envelope metadata: everything needed to diagnose how a call resolved
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseMeta {
    /// Client instance name
    pub name: String,
    /// Correlation id of this call
    pub request_id: String,
    /// Caller-supplied context, echoed back untouched
    pub context: Option<Value>,
    /// Id of the connection that served the final attempt
    pub connection: Option<String>,
    /// Number of dispatch attempts performed
    pub attempts: u32,
    /// Whether the call was cancelled by the caller
    pub aborted: bool,
    /// Set when a sniff resolved as part of this call
    pub sniff: Option<SniffOutcome>,
}

/// The response envelope returned for every logical call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApiResponse {
    pub body: Option<ResponseBody>,
    pub status_code: Option<u16>,
    pub headers: HashMap<String, String>,
    pub warnings: Vec<String>,
    pub meta: ResponseMeta,
}

impl ApiResponse {
    /// Empty envelope carrying only metadata, used on failure paths
    pub(crate) fn empty(meta: ResponseMeta) -> Self {
        Self {
            body: None,
            status_code: None,
            headers: HashMap::new(),
            warnings: Vec::new(),
            meta,
        }
    }
}
