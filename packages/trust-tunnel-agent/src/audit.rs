//! Operation records: the per-request audit line and the stdin command log.
//!
//! Both emit single lines through dedicated tracing targets; persistence and
//! shipping are someone else's problem.

use serde::Serialize;
use time::macros::format_description;
use time::OffsetDateTime;

use trust_tunnel_client::TargetType;

use crate::request::RequestInfo;

/// Login and operation information for one accepted request.
#[derive(Debug, Serialize)]
struct LogInfo {
    cmd: String,
    gmt_create: String,
    login_time: String,
    login_ip: String,
    username: String,
    hostname: String,
    session_id: String,
}

/// Emits the audit record for an accepted request on the `audit` target.
pub fn record_request(req: &RequestInfo) {
    let login_ip = match req.target_type {
        // Physical logins land on this agent's host.
        TargetType::Phys => req.agent_addr.clone(),
        TargetType::Container => req.ip_address.clone(),
    };

    let hostname = nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    let format = format_description!("[year].[month].[day] [hour]:[minute]:[second]");
    let now = OffsetDateTime::now_utc()
        .format(&format)
        .unwrap_or_default();

    let mut cmd = String::new();
    for part in &req.cmd {
        cmd.push_str(part);
        cmd.push(' ');
    }

    let info = LogInfo {
        cmd,
        gmt_create: now.clone(),
        login_time: now,
        login_ip,
        username: req.login_name.clone(),
        hostname,
        session_id: req.session_id.clone(),
    };

    if let Ok(line) = serde_json::to_string(&info) {
        tracing::info!(target: "audit", "{line}");
    }
}

const CMD_BUF_LEN: usize = 512;

/// Collects the stdin byte stream into lines and logs each completed command
/// on the `cmdlog` target. Partial input is held until a newline or until
/// the buffer fills.
pub struct CmdLogger {
    session_id: String,
    buf: Vec<u8>,
}

impl CmdLogger {
    pub fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            buf: Vec::with_capacity(CMD_BUF_LEN),
        }
    }

    pub fn write(&mut self, mut p: &[u8]) {
        while !p.is_empty() {
            let left = CMD_BUF_LEN - self.buf.len();
            let take = left.min(p.len());
            self.buf.extend_from_slice(&p[..take]);
            p = &p[take..];

            if let Some(newline) = self.buf.iter().position(|b| *b == b'\r' || *b == b'\n') {
                self.emit(newline);
                self.buf.drain(..(newline + 1).min(self.buf.len()));
            } else if self.buf.len() == CMD_BUF_LEN {
                self.emit(CMD_BUF_LEN);
                self.buf.clear();
            }
        }
    }

    /// Flushes whatever partial input remains.
    pub fn destroy(mut self) {
        if !self.buf.is_empty() {
            let end = self.buf.len();
            self.emit(end);
        }
    }

    fn emit(&self, end: usize) {
        let line = String::from_utf8_lossy(&self.buf[..end]);
        tracing::info!(
            target: "cmdlog",
            session_id = %self.session_id,
            "Cmd: {line}"
        );
    }
}
