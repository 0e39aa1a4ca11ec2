//! Shared error taxonomy for the trust-tunnel agent and client.
//!
//! Session-establishment failures cross the wire inside a WebSocket close
//! frame, so every error ultimately collapses to a short `code=MA_xxx,msg=...`
//! string. Classification is by substring match on the underlying error text;
//! the structured [`TunnelError`] type exists so agent code can carry typed
//! errors internally and still emit the exact wire codes.

use std::fmt;

use thiserror::Error;

/// Control frames must carry 125 bytes or fewer (RFC 6455). Two bytes are
/// reserved for the close code, leaving 123 for the payload.
pub const MAX_CONTROL_MSG_LEN: usize = 123;

/// Wire error codes understood by trust-tunnel clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    NoSpaceLeft,
    AuthServerUnreachable,
    ClientCertVerify,
    SidecarLimit,
    ContainerNotFound,
    ContainerNotRunning,
    RuntimeUnavailable,
    LoginNotPermitted,
    UserNotExist,
    NsenterFailed,
    SshKeyInsert,
    SshKeyRead,
    SshKeyParse,
    SshDial,
    Unclassified,
}

impl Code {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoSpaceLeft => "MA_513",
            Self::AuthServerUnreachable => "MA_518",
            Self::ClientCertVerify => "MA_519",
            Self::SidecarLimit => "MA_521",
            Self::ContainerNotFound => "MA_522",
            Self::ContainerNotRunning => "MA_523",
            Self::RuntimeUnavailable => "MA_524",
            Self::LoginNotPermitted => "MA_525",
            Self::UserNotExist => "MA_526",
            Self::NsenterFailed => "MA_527",
            Self::SshKeyInsert => "MA_528",
            Self::SshKeyRead => "MA_529",
            Self::SshKeyParse => "MA_530",
            Self::SshDial => "MA_531",
            Self::Unclassified => "MA_-1",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while establishing or tearing down a session.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("current sidecar num exceed the limit: {current},{limit}")]
    SidecarLimit { current: usize, limit: usize },

    #[error("can't find container:{0}")]
    ContainerNotFound(String),

    #[error("container is not running:{0}")]
    ContainerNotRunning(String),

    #[error("docker daemon is unavailable")]
    RuntimeUnavailable,

    #[error("username {0} is not permitted to login on host")]
    LoginNotPermitted(String),

    #[error("user does not exist:{0}")]
    UserNotExist(String),

    #[error("nsenter host namespace failed: {0}")]
    NsenterFailed(String),

    #[error("SSH public key insert error: {0}")]
    SshKeyInsert(String),

    #[error("SSH private key read error: {0}")]
    SshKeyRead(String),

    #[error("SSH private key parse error: {0}")]
    SshKeyParse(String),

    #[error("SSH connect error: {0}")]
    SshDial(String),

    #[error("{0}")]
    Other(String),
}

impl TunnelError {
    pub fn other(err: impl fmt::Display) -> Self {
        Self::Other(err.to_string())
    }
}

/// Picks the wire code for an error message by substring match. The match
/// set mirrors what deployed clients already parse, so the exact phrases are
/// load-bearing.
pub fn classify(err_msg: &str) -> Code {
    if err_msg.contains("no space left on device") {
        Code::NoSpaceLeft
    } else if err_msg.contains("visit authorization server failed") {
        Code::AuthServerUnreachable
    } else if err_msg.contains("verify client certificate error") {
        Code::ClientCertVerify
    } else if err_msg.contains("current sidecar num exceed the limit") {
        Code::SidecarLimit
    } else if err_msg.contains("can't find container") {
        Code::ContainerNotFound
    } else if err_msg.contains("container is not running") {
        Code::ContainerNotRunning
    } else if err_msg.contains("docker daemon is unavailable") {
        Code::RuntimeUnavailable
    } else if err_msg.contains("is not permitted to login on host") {
        Code::LoginNotPermitted
    } else if err_msg.contains("user does not exist") {
        Code::UserNotExist
    } else if err_msg.contains("nsenter host namespace failed") {
        Code::NsenterFailed
    } else if err_msg.contains("SSH public key insert error") {
        Code::SshKeyInsert
    } else if err_msg.contains("SSH private key read error") {
        Code::SshKeyRead
    } else if err_msg.contains("SSH private key parse error") {
        Code::SshKeyParse
    } else if err_msg.contains("SSH connect error") {
        Code::SshDial
    } else {
        Code::Unclassified
    }
}

/// Prefixes an error message with its wire code: `code=MA_xxx,msg=<msg>`.
pub fn wrap_with_code(err_msg: &str) -> String {
    format!("code={},msg={}", classify(err_msg), err_msg)
}

const MAX_CONTAINER_ID_LEN: usize = 6;

/// Normalizes raw container-runtime errors into the canonical phrases the
/// taxonomy matches on, shortening the container id to a readable prefix.
pub fn wrap_container_error(err_msg: &str, container_id: &str) -> String {
    let short_id = if container_id.len() > MAX_CONTAINER_ID_LEN {
        &container_id[..MAX_CONTAINER_ID_LEN]
    } else {
        container_id
    };

    if err_msg.contains("No such container") || err_msg.contains("not found") {
        format!("can't find container:{short_id}")
    } else if err_msg.contains("is not running") {
        format!("container is not running:{short_id}")
    } else if err_msg.contains("no such file or directory") || err_msg.contains("connection refused")
    {
        "docker is unavailable".to_string()
    } else {
        err_msg.to_string()
    }
}

/// Truncates a close-frame payload to the RFC 6455 control-frame limit.
/// Cuts on a char boundary so the result stays valid UTF-8.
pub fn trunc_control_msg(msg: &str) -> String {
    if msg.len() <= MAX_CONTROL_MSG_LEN {
        return msg.to_string();
    }

    let mut end = MAX_CONTROL_MSG_LEN;
    while !msg.is_char_boundary(end) {
        end -= 1;
    }
    msg[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_known_codes() {
        assert_eq!(
            classify("current sidecar num exceed the limit: 3,3"),
            Code::SidecarLimit
        );
        assert_eq!(classify("can't find container:abc123"), Code::ContainerNotFound);
        assert_eq!(classify("user does not exist:nobody"), Code::UserNotExist);
        assert_eq!(
            classify("SSH connect error: connection refused"),
            Code::SshDial
        );
        assert_eq!(classify("something else entirely"), Code::Unclassified);
    }

    #[test]
    fn wrap_with_code_prefixes() {
        let wrapped = wrap_with_code("docker daemon is unavailable");
        assert_eq!(wrapped, "code=MA_524,msg=docker daemon is unavailable");
    }

    #[test]
    fn container_error_shortens_id() {
        let msg = wrap_container_error(
            "Error: No such container: deadbeefcafe",
            "deadbeefcafe0123",
        );
        assert_eq!(msg, "can't find container:deadbe");
    }

    #[test]
    fn container_error_passthrough() {
        let msg = wrap_container_error("exec failed for some reason", "c1");
        assert_eq!(msg, "exec failed for some reason");
    }

    #[test]
    fn trunc_respects_limit_and_boundaries() {
        let long = "x".repeat(400);
        assert_eq!(trunc_control_msg(&long).len(), MAX_CONTROL_MSG_LEN);

        // Multi-byte char straddling the cut must not split.
        let mut tricky = "a".repeat(MAX_CONTROL_MSG_LEN - 1);
        tricky.push('é');
        let out = trunc_control_msg(&tricky);
        assert!(out.len() <= MAX_CONTROL_MSG_LEN);
        assert!(out.is_char_boundary(out.len()));
    }

    #[test]
    fn short_messages_untouched() {
        assert_eq!(trunc_control_msg("code=MA_-1,msg=ok"), "code=MA_-1,msg=ok");
    }
}
