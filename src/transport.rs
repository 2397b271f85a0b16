//! The network seam: every vendor call is a JSON `POST` carrying a `systemData` header.

use http::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use serde_json::Value;
use std::time::Duration;

use crate::client::ClientError;

const USER_AGENT_VALUE: &str = "okhttp/4.9.2";

pub trait Transport: Send + Sync {
    /// Posts `body` to `url` and returns the raw response body.
    fn post_json(&self, url: &str, system_data: &str, body: &Value) -> Result<String, ClientError>;
}

/// Blocking transport backed by a shared `ureq` agent.
pub struct UreqTransport {
    agent: ureq::Agent,
}

impl UreqTransport {
    pub fn new(timeout: Duration) -> Self {
        let config = ureq::Agent::config_builder().timeout_global(Some(timeout)).build();
        UreqTransport {
            agent: ureq::Agent::new_with_config(config),
        }
    }
}

impl Transport for UreqTransport {
    fn post_json(&self, url: &str, system_data: &str, body: &Value) -> Result<String, ClientError> {
        let mut resp = self
            .agent
            .post(url)
            .header(CONTENT_TYPE, "application/json; charset=UTF-8")
            .header(ACCEPT, "application/json")
            .header(USER_AGENT, USER_AGENT_VALUE)
            .header("systemData", system_data)
            .send_json(body)
            .map_err(transport_error)?;
        resp.body_mut().read_to_string().map_err(transport_error)
    }
}

fn transport_error(err: ureq::Error) -> ClientError {
    match err {
        ureq::Error::StatusCode(status) => ClientError::Transport(format!("http {}", status)),
        ureq::Error::Timeout(t) => ClientError::Transport(format!("timed out ({:?})", t)),
        other => ClientError::Transport(other.to_string()),
    }
}
