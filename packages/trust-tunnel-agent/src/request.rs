//! Request envelope parsing.
//!
//! Every incoming `/exec` request carries its parameters as HTTP headers so
//! they survive the WebSocket upgrade. Parsing happens once, before the
//! upgrade; a malformed envelope never reaches a backend.

use axum::http::HeaderMap;
use base64::Engine;
use serde::Serialize;
use thiserror::Error;

use trust_tunnel_client::TargetType;

#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request error: invalid target type")]
    InvalidTargetType,
    #[error("request error: no pod name of container target")]
    MissingPodName,
    #[error("request error: invalid interactive argument: {0}")]
    InvalidInteractive(String),
    #[error("request error: invalid tty argument: {0}")]
    InvalidTty(String),
    #[error("request error: no command")]
    MissingCommand,
    #[error("decoding command error:{0}")]
    CommandDecode(String),
    #[error("request error: invalid cpus argument: {0}")]
    InvalidCpus(String),
    #[error("request error: invalid memoryMB argument: {0}")]
    InvalidMemory(String),
}

/// Parsed request envelope, produced once per incoming request.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestInfo {
    pub session_id: String,
    pub agent_addr: String,
    pub user_name: String,
    pub login_name: String,
    pub login_group: String,
    pub target_type: TargetType,
    pub pod_name: String,
    pub container_id: String,
    pub container_name: String,
    pub interactive: bool,
    pub tty: bool,
    pub cmd: Vec<String>,
    pub use_base64: bool,
    pub ip_address: String,
    pub app_name: String,
    pub cpus: f64,
    pub memory_mb: i64,
    pub disable_clean_mode: bool,
}

impl RequestInfo {
    /// JSON rendering used in request logs.
    pub fn to_log_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn header_values(headers: &HeaderMap, name: &str) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .map(str::to_string)
        .collect()
}

/// Extracts the request information from the upgrade request headers.
pub fn parse_request(headers: &HeaderMap) -> Result<RequestInfo, RequestError> {
    let mut info = RequestInfo {
        session_id: header(headers, "Session-Id").unwrap_or_default().to_string(),
        agent_addr: header(headers, "Agent-Addr").unwrap_or_default().to_string(),
        user_name: header(headers, "User-Name").unwrap_or_default().to_string(),
        app_name: header(headers, "App-Name").unwrap_or_default().to_string(),
        ip_address: header(headers, "Ip-Address").unwrap_or_default().to_string(),
        login_name: header(headers, "Login-Name").unwrap_or_default().to_string(),
        login_group: header(headers, "Login-Group").unwrap_or_default().to_string(),
        ..RequestInfo::default()
    };

    if let Some(target) = header(headers, "Target-Type") {
        info.target_type = match target {
            "physical" => TargetType::Phys,
            "container" => TargetType::Container,
            _ => return Err(RequestError::InvalidTargetType),
        };
    }

    if info.target_type == TargetType::Container {
        info.pod_name = header(headers, "Pod-Name")
            .ok_or(RequestError::MissingPodName)?
            .to_string();
        info.container_id = header(headers, "Container-Id").unwrap_or_default().to_string();
        info.container_name = header(headers, "Container-Name")
            .unwrap_or_default()
            .to_string();
    }

    if let Some(interactive) = header(headers, "Interactive") {
        info.interactive = interactive
            .parse()
            .map_err(|_| RequestError::InvalidInteractive(interactive.to_string()))?;
    }

    if let Some(tty) = header(headers, "Tty") {
        info.tty = tty
            .parse()
            .map_err(|_| RequestError::InvalidTty(tty.to_string()))?;
    }

    // Base64-encoded commands are authoritative when present; the plain
    // headers only serve agents predating the encoded form.
    let encoded = header_values(headers, "Command-Base64-Encode");
    if encoded.is_empty() {
        let cmd = header_values(headers, "Command");
        if cmd.is_empty() {
            return Err(RequestError::MissingCommand);
        }
        info.cmd = cmd;
    } else {
        let engine = base64::engine::general_purpose::STANDARD;
        let mut decoded = Vec::with_capacity(encoded.len());

        for part in &encoded {
            let bytes = engine
                .decode(part)
                .map_err(|err| RequestError::CommandDecode(err.to_string()))?;
            let arg = String::from_utf8(bytes)
                .map_err(|err| RequestError::CommandDecode(err.to_string()))?;
            decoded.push(arg);
        }

        info.use_base64 = true;
        info.cmd = decoded;
    }

    if let Some(cpus) = header(headers, "Cpus") {
        info.cpus = cpus
            .parse()
            .map_err(|_| RequestError::InvalidCpus(cpus.to_string()))?;
    }

    if let Some(memory) = header(headers, "Memory") {
        info.memory_mb = memory
            .parse()
            .map_err(|_| RequestError::InvalidMemory(memory.to_string()))?;
    }

    if header(headers, "Disable-Clean-Mode") == Some("1") {
        info.disable_clean_mode = true;
    }

    Ok(info)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;
    use base64::Engine;

    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn parses_container_request() {
        let map = headers(&[
            ("Session-Id", "20240101120000"),
            ("User-Name", "alice"),
            ("Login-Name", "admin"),
            ("Target-Type", "container"),
            ("Pod-Name", "pod-1"),
            ("Container-Id", "c1"),
            ("Interactive", "true"),
            ("Tty", "false"),
            ("Command", "ls"),
            ("Cpus", "0.5"),
            ("Memory", "256"),
            ("Disable-Clean-Mode", "1"),
        ]);

        let info = parse_request(&map).unwrap();
        assert_eq!(info.session_id, "20240101120000");
        assert_eq!(info.target_type, TargetType::Container);
        assert_eq!(info.pod_name, "pod-1");
        assert_eq!(info.container_id, "c1");
        assert!(info.interactive);
        assert!(!info.tty);
        assert_eq!(info.cmd, vec!["ls"]);
        assert!((info.cpus - 0.5).abs() < f64::EPSILON);
        assert_eq!(info.memory_mb, 256);
        assert!(info.disable_clean_mode);
        assert!(!info.use_base64);
    }

    #[test]
    fn base64_commands_take_precedence() {
        let engine = base64::engine::general_purpose::STANDARD;
        let map = headers(&[
            ("Target-Type", "physical"),
            ("Command", "ignored"),
            ("Command-Base64-Encode", &engine.encode("sh")),
            ("Command-Base64-Encode", &engine.encode("-c")),
            ("Command-Base64-Encode", &engine.encode("echo hi")),
        ]);

        let info = parse_request(&map).unwrap();
        assert!(info.use_base64);
        assert_eq!(info.cmd, vec!["sh", "-c", "echo hi"]);
    }

    #[test]
    fn malformed_base64_fails_whole_request() {
        let map = headers(&[
            ("Target-Type", "physical"),
            ("Command-Base64-Encode", "!!!"),
        ]);

        assert!(matches!(
            parse_request(&map),
            Err(RequestError::CommandDecode(_))
        ));
    }

    #[test]
    fn invalid_target_type_rejected() {
        let map = headers(&[("Target-Type", "vm"), ("Command", "ls")]);
        assert!(matches!(
            parse_request(&map),
            Err(RequestError::InvalidTargetType)
        ));
    }

    #[test]
    fn container_without_pod_rejected() {
        let map = headers(&[("Target-Type", "container"), ("Command", "ls")]);
        assert!(matches!(
            parse_request(&map),
            Err(RequestError::MissingPodName)
        ));
    }

    #[test]
    fn malformed_bool_rejected() {
        let map = headers(&[
            ("Target-Type", "physical"),
            ("Interactive", "yes"),
            ("Command", "ls"),
        ]);
        assert!(matches!(
            parse_request(&map),
            Err(RequestError::InvalidInteractive(_))
        ));
    }

    #[test]
    fn missing_command_rejected() {
        let map = headers(&[("Target-Type", "physical")]);
        assert!(matches!(
            parse_request(&map),
            Err(RequestError::MissingCommand)
        ));
    }

    #[test]
    fn absent_target_defaults_to_physical() {
        let map = headers(&[("Command", "uptime")]);
        let info = parse_request(&map).unwrap();
        assert_eq!(info.target_type, TargetType::Phys);
    }
}
