//! Execution backends.
//!
//! Four ways to run a command on this host: a sidecar container joined to the
//! target's namespaces, a direct runtime exec (docker or containerd), an
//! nsenter into the host namespaces, and SSH to localhost. All four satisfy
//! [`Session`], so the broker and the stream mux never care which one is
//! underneath.

pub mod containerd;
pub mod docker;
pub mod nsenter;
pub mod ssh;

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};
use tonic::transport::Channel;

use trust_tunnel_client::TargetType;
use trust_tunnel_error::TunnelError;

use crate::config::ContainerRuntime;

/// Parameters for establishing one session, assembled from the request and
/// the agent configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub target_type: TargetType,
    pub rootfs_prefix: String,
    pub container_id: String,
    pub sidecar_image: String,
    pub image_hub_auth: String,
    pub user_name: String,
    pub login_name: String,
    pub login_group: String,
    pub cmd: Vec<String>,
    pub tty: bool,
    pub interactive: bool,
    /// "nsenter" or "sshd".
    pub phys_tunnel: String,
    pub disable_clean_mode: bool,
    pub cpus: f64,
    pub memory_mb: i64,
    pub container_namespace: String,
}

/// An in-flight execution with its three logical streams.
#[async_trait]
pub trait Session: Send + Sync {
    /// Writes one stdin chunk to the command.
    async fn write_stdin(&self, data: &[u8]) -> io::Result<()>;

    /// Next stdout chunk; `None` once the stream has finished.
    async fn next_stdout(&self) -> Option<Bytes>;

    /// Next stderr chunk; `None` once the stream has finished. Tty sessions
    /// unify output onto stdout and finish this stream immediately.
    async fn next_stderr(&self) -> Option<Bytes>;

    /// Latches the stdout-drained signal.
    fn stdout_done(&self);

    /// Latches the stderr-drained signal.
    fn stderr_done(&self);

    async fn resize(&self, height: u16, width: u16) -> Result<(), TunnelError>;

    /// Releases backend resources. Safe to call more than once.
    async fn clean(&self) -> Result<(), TunnelError>;

    /// Exit code of the command. Resolves only after both done latches have
    /// fired; before drain the value is undefined and must not be read.
    async fn exit_code(&self) -> i32;
}

/// Establishes a session for the configured target and runtime.
pub async fn establish_session(
    config: Config,
    docker: Option<bollard::Docker>,
    containerd: Option<Channel>,
    runtime: ContainerRuntime,
) -> Result<std::sync::Arc<dyn Session>, TunnelError> {
    match config.target_type {
        TargetType::Phys => {
            if config.phys_tunnel == "nsenter" && !config.disable_clean_mode {
                nsenter::establish(config).await
            } else {
                ssh::establish(config).await
            }
        }
        TargetType::Container => match runtime {
            ContainerRuntime::Docker => docker::establish(config, docker).await,
            ContainerRuntime::Containerd => containerd::establish(config, containerd).await,
        },
    }
}

/// One-shot latch signaled by the stream mux when an output stream drains.
pub(crate) struct Latch {
    tx: watch::Sender<bool>,
}

impl Latch {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx }
    }

    pub(crate) fn set(&self) {
        // send_replace stores the value even when nobody subscribes yet.
        self.tx.send_replace(true);
    }

    pub(crate) async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Receiver end of a pumped output stream, shareable behind `&self`.
pub(crate) struct ChunkStream {
    rx: Mutex<mpsc::Receiver<Bytes>>,
}

impl ChunkStream {
    pub(crate) fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx: Mutex::new(rx) }
    }

    /// A stream that is already finished (e.g. stderr of a tty session).
    pub(crate) fn finished() -> Self {
        let (_, rx) = mpsc::channel(1);
        Self { rx: Mutex::new(rx) }
    }

    pub(crate) async fn next(&self) -> Option<Bytes> {
        self.rx.lock().await.recv().await
    }
}

/// Latched exit-code cell written once by a backend's wait task.
pub(crate) struct ExitCell {
    tx: watch::Sender<Option<i32>>,
}

impl ExitCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    pub(crate) fn set(&self, code: i32) {
        self.tx.send_replace(Some(code));
    }

    pub(crate) fn current(&self) -> Option<i32> {
        *self.tx.borrow()
    }

    pub(crate) async fn wait(&self) -> Option<i32> {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(code) = *rx.borrow() {
                return Some(code);
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    /// Waits up to `timeout` for the exit code; the process may still be
    /// wrapping up when the streams close, in which case 0 is reported.
    pub(crate) async fn wait_timeout(&self, timeout: std::time::Duration) -> i32 {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(Some(code)) => code,
            _ => 0,
        }
    }
}

/// Rewrites the final command token to start from the login directory.
pub(crate) fn prefix_login_dir(cmd: &mut [String], login_dir: &str) {
    if let Some(last) = cmd.last_mut() {
        *last = format!("cd {login_dir};{last}");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn latch_wait_returns_after_set() {
        let latch = Latch::new();
        latch.set();
        latch.wait().await;

        // Waiting again on an already-set latch must not hang.
        tokio::time::timeout(Duration::from_millis(100), latch.wait())
            .await
            .expect("latch wait");
    }

    #[tokio::test]
    async fn exit_cell_times_out_to_zero() {
        let cell = ExitCell::new();
        assert_eq!(cell.wait_timeout(Duration::from_millis(20)).await, 0);

        cell.set(7);
        assert_eq!(cell.wait_timeout(Duration::from_millis(20)).await, 7);
    }

    #[tokio::test]
    async fn finished_chunk_stream_is_empty() {
        let stream = ChunkStream::finished();
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn login_dir_prefixes_last_token() {
        let mut cmd = vec!["sh".to_string(), "-c".to_string(), "ls /tmp".to_string()];
        prefix_login_dir(&mut cmd, "/home/alice");
        assert_eq!(cmd[2], "cd /home/alice;ls /tmp");
        assert_eq!(cmd[0], "sh");
    }
}
