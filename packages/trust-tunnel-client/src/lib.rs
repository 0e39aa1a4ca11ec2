//! Client side of the trust-tunnel wire protocol.
//!
//! Dials the agent's `/exec` WebSocket endpoint with the request header
//! envelope, then assembles the agent's frame stream back into ordered
//! stdout/stderr byte streams a terminal pump can consume: binary frames are
//! stdout, text frames are stderr, and the close frame carries the remote
//! exit code.

mod buffer;
mod conn;

pub use buffer::BlockingBuffer;
pub use conn::AgentSession;

use base64::Engine;
use http::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;

/// Kind of target host to log in to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    #[default]
    Phys,
    Container,
}

/// Payload of the agent's normal-closure close frame.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NormalCloseMessage {
    #[serde(rename = "Code")]
    pub code: i32,
    #[serde(rename = "Err")]
    pub err: Option<String>,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid request header {0}")]
    InvalidHeader(&'static str),
    #[error("connecting to agent by websocket error: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Connection parameters for one remote command execution.
#[derive(Debug, Clone, Default)]
pub struct Client {
    /// Session id to reclaim; empty requests a fresh session.
    pub session_id: String,
    pub agent_addr: String,
    pub agent_port: u16,
    pub target: TargetType,
    /// Identity of the requesting user, matched on session reclaim.
    pub user_name: String,
    /// Identity to assume on the target.
    pub login_name: String,
    pub login_group: String,
    pub ip_address: String,
    pub app_name: String,
    /// Pod of the target container, required for container targets.
    pub pod_name: String,
    pub container_name: String,
    pub container_id: String,
    pub interactive: bool,
    pub tty: bool,
    pub command: Vec<String>,
    pub cpus: f64,
    pub memory_mb: i64,
    pub disable_clean_mode: bool,
}

impl Client {
    /// Dials the agent and returns a live session. Commands travel base64
    /// encoded so arbitrary argv bytes survive the header envelope; the raw
    /// `Command` headers are still sent for older agents.
    pub async fn start(&self) -> Result<AgentSession, ClientError> {
        let url = format!("ws://{}:{}/exec", self.agent_addr, self.agent_port);
        let mut request = url.into_client_request()?;

        {
            let headers = request.headers_mut();

            set_header(headers, "Session-Id", &self.session_id)?;
            set_header(headers, "Agent-Addr", &self.agent_addr)?;
            set_header(headers, "User-Name", &self.user_name)?;
            set_header(headers, "Login-Name", &self.login_name)?;
            set_header(headers, "Login-Group", &self.login_group)?;
            set_header(headers, "Ip-Address", &self.ip_address)?;
            set_header(headers, "App-Name", &self.app_name)?;
            set_header(headers, "Interactive", &self.interactive.to_string())?;
            set_header(headers, "Tty", &self.tty.to_string())?;
            set_header(headers, "Cpus", &self.cpus.to_string())?;
            set_header(headers, "Memory", &self.memory_mb.to_string())?;

            for arg in &self.command {
                append_header(headers, "Command", arg)?;
                let encoded = base64::engine::general_purpose::STANDARD.encode(arg.as_bytes());
                append_header(headers, "Command-Base64-Encode", &encoded)?;
            }

            if self.disable_clean_mode {
                set_header(headers, "Disable-Clean-Mode", "1")?;
            }

            match self.target {
                TargetType::Phys => set_header(headers, "Target-Type", "physical")?,
                TargetType::Container => {
                    set_header(headers, "Target-Type", "container")?;
                    set_header(headers, "Pod-Name", &self.pod_name)?;
                    if !self.container_name.is_empty() {
                        set_header(headers, "Container-Name", &self.container_name)?;
                    }
                    if !self.container_id.is_empty() {
                        set_header(headers, "Container-Id", &self.container_id)?;
                    }
                }
            }
        }

        let (stream, _response) = connect_async(request).await?;

        Ok(AgentSession::spawn(stream, self.interactive))
    }
}

fn set_header(
    headers: &mut http::HeaderMap,
    name: &'static str,
    value: &str,
) -> Result<(), ClientError> {
    let header = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| ClientError::InvalidHeader(name))?;
    let value = HeaderValue::from_str(value).map_err(|_| ClientError::InvalidHeader(name))?;
    headers.insert(header, value);
    Ok(())
}

fn append_header(
    headers: &mut http::HeaderMap,
    name: &'static str,
    value: &str,
) -> Result<(), ClientError> {
    let header = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| ClientError::InvalidHeader(name))?;
    let value = HeaderValue::from_str(value).map_err(|_| ClientError::InvalidHeader(name))?;
    headers.append(header, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use base64::Engine;

    use super::*;

    #[test]
    fn close_message_shape() {
        let msg = NormalCloseMessage {
            code: 0,
            err: None,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(json, r#"{"Code":0,"Err":null}"#);

        let parsed: NormalCloseMessage =
            serde_json::from_str(r#"{"Code":42,"Err":"boom"}"#).unwrap();
        assert_eq!(parsed.code, 42);
        assert_eq!(parsed.err.as_deref(), Some("boom"));
    }

    #[test]
    fn command_base64_roundtrip() {
        let argv = vec!["sh".to_string(), "-c".to_string(), "echo hi; ls /".to_string()];
        let engine = base64::engine::general_purpose::STANDARD;

        let encoded: Vec<String> = argv.iter().map(|a| engine.encode(a.as_bytes())).collect();
        let decoded: Vec<String> = encoded
            .iter()
            .map(|e| String::from_utf8(engine.decode(e).unwrap()).unwrap())
            .collect();

        assert_eq!(decoded, argv);
    }
}
