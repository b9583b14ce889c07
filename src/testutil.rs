//! Scripted wire layer for tests: no sockets, fully deterministic.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::connection::{NodeTransport, PreparedRequest, WireResponse};
use crate::error::{ClientError, Result};

/// One scripted wire outcome
#[derive(Debug, Clone)]
pub(crate) enum Scripted {
    /// Respond with this status and JSON body
    Respond { status: u16, body: &'static str },
    /// Fail with a socket-level connection error
    ConnError,
    /// Fail with a timeout
    TimeoutError,
}

/// Transport that replays a script, then answers 200 `{}` forever.
#[derive(Debug, Default)]
pub(crate) struct MockTransport {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<PreparedRequest>>,
    hang: bool,
}

impl MockTransport {
    pub(crate) fn scripted(outcomes: Vec<Scripted>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            requests: Mutex::new(Vec::new()),
            hang: false,
        }
    }

    /// A transport whose requests never resolve, for timeout/abort tests
    pub(crate) fn hanging() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            hang: true,
        }
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub(crate) fn last_request(&self) -> Option<PreparedRequest> {
        self.requests.lock().last().cloned()
    }
}

#[async_trait]
impl NodeTransport for MockTransport {
    async fn perform(&self, request: PreparedRequest) -> Result<WireResponse> {
        self.requests.lock().push(request);
        if self.hang {
            std::future::pending::<()>().await;
        }
        match self.script.lock().pop_front() {
            Some(Scripted::Respond { status, body }) => Ok(WireResponse {
                status_code: status,
                headers: [(
                    "content-type".to_string(),
                    "application/json".to_string(),
                )]
                .into(),
                body: Bytes::from_static(body.as_bytes()),
            }),
            Some(Scripted::ConnError) => Err(ClientError::connection("connection refused")),
            Some(Scripted::TimeoutError) => Err(ClientError::timeout("socket timeout")),
            None => Ok(WireResponse {
                status_code: 200,
                headers: [(
                    "content-type".to_string(),
                    "application/json".to_string(),
                )]
                .into(),
                body: Bytes::from_static(b"{}"),
            }),
        }
    }
}
