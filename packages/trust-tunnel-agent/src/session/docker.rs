//! Docker-backed container sessions.
//!
//! Clean mode attaches a privileged sidecar container joined to the target's
//! pid and network namespaces and runs the command through the sidecar's
//! `/superman.sh` entry; with clean mode disabled the command execs directly
//! inside the target container.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    AttachContainerOptions, Config as ContainerCreateConfig, CreateContainerOptions, LogOutput,
    RemoveContainerOptions, ResizeContainerTtyOptions, StartContainerOptions,
    WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::Docker;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use trust_tunnel_error::{wrap_container_error, TunnelError};

use super::{prefix_login_dir, ChunkStream, Config, Latch, Session};
use crate::passwd;
use crate::sidecar;

/// Default cpu quota for a sidecar when the request carries none.
pub const DEFAULT_CPUS: f64 = 1.0;
/// Default memory cap in MB when the request carries none.
pub const DEFAULT_MEMORY_MB: i64 = 512;

const CPU_PERIOD: i64 = 100_000;

pub struct DockerSession {
    docker: Docker,
    /// Exec id for direct exec, sidecar container id otherwise.
    resp_id: String,
    is_exec: bool,
    input_tx: mpsc::Sender<Vec<u8>>,
    stdout: ChunkStream,
    stderr: ChunkStream,
    stdout_done: Latch,
    stderr_done: Latch,
    cleaned: AtomicBool,
}

#[async_trait]
impl Session for DockerSession {
    async fn write_stdin(&self, data: &[u8]) -> io::Result<()> {
        self.input_tx
            .send(data.to_vec())
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "stdin closed"))
    }

    async fn next_stdout(&self) -> Option<Bytes> {
        self.stdout.next().await
    }

    async fn next_stderr(&self) -> Option<Bytes> {
        self.stderr.next().await
    }

    fn stdout_done(&self) {
        self.stdout_done.set();
    }

    fn stderr_done(&self) {
        self.stderr_done.set();
    }

    async fn resize(&self, height: u16, width: u16) -> Result<(), TunnelError> {
        tracing::debug!(height, width, "resize");

        if self.is_exec {
            self.docker
                .resize_exec(&self.resp_id, ResizeExecOptions { height, width })
                .await
                .map_err(TunnelError::other)
        } else {
            self.docker
                .resize_container_tty(&self.resp_id, ResizeContainerTtyOptions { height, width })
                .await
                .map_err(TunnelError::other)
        }
    }

    async fn clean(&self) -> Result<(), TunnelError> {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Err(err) = self.clean_legacy_process().await {
            if !err.to_string().contains("process already finished") {
                tracing::error!(error = %err, "kill legacy process err");
            }
        }

        if !self.is_exec {
            // The sidecar container is ours to reap.
            self.docker
                .remove_container(
                    &self.resp_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
                .map_err(|err| {
                    tracing::error!(container = %self.resp_id, error = %err, "remove container error");
                    TunnelError::other(err)
                })?;

            tracing::info!(container = %self.resp_id, "remove container done");
        }

        Ok(())
    }

    async fn exit_code(&self) -> i32 {
        self.stdout_done.wait().await;
        self.stderr_done.wait().await;

        if self.is_exec {
            match self.docker.inspect_exec(&self.resp_id).await {
                Ok(inspect) => inspect.exit_code.unwrap_or(0) as i32,
                Err(err) => {
                    tracing::error!(exec = %self.resp_id, error = %err, "failed to inspect exec");
                    0
                }
            }
        } else {
            match wait_container(&self.docker, &self.resp_id).await {
                Ok(code) => code,
                Err(err) => {
                    tracing::error!(error = %err, "wait container error");
                    0
                }
            }
        }
    }
}

impl DockerSession {
    /// Residual sidecar processes survive a dropped attach; hunt them down
    /// before removing the sidecar container itself.
    async fn clean_legacy_process(&self) -> Result<(), TunnelError> {
        if self.is_exec {
            return Ok(());
        }

        let inspect = self
            .docker
            .inspect_container(&self.resp_id, None)
            .await
            .map_err(TunnelError::other)?;

        let pid = inspect
            .state
            .as_ref()
            .and_then(|state| state.pid)
            .unwrap_or(0) as i32;
        if pid <= 0 {
            return Ok(());
        }

        crate::process::kill_process_group(pid, "/superman.sh", true)
            .await
            .map_err(TunnelError::other)?;

        crate::process::kill_process(pid).map_err(TunnelError::other)
    }
}

/// Establishes a docker session, attaching a sidecar in clean mode or
/// exec'ing directly when clean mode is disabled.
pub async fn establish(
    mut config: Config,
    docker: Option<Docker>,
) -> Result<Arc<dyn Session>, TunnelError> {
    let docker =
        docker.ok_or_else(|| TunnelError::Other("container client is nil".to_string()))?;

    let container_id = config.container_id.clone();

    let mut login_dir = String::new();
    if !config.login_name.is_empty() {
        let passwd_path = format!("{}/etc/passwd", config.rootfs_prefix);
        if let Some(user) = passwd::find_user(&config.login_name, &passwd_path)
            .map_err(|err| TunnelError::Other(wrap_container_error(&err.to_string(), &container_id)))?
        {
            login_dir = user.login_dir;
        }
    }

    if !login_dir.is_empty() {
        prefix_login_dir(&mut config.cmd, &login_dir);
    }

    let result = if config.disable_clean_mode {
        tracing::info!(
            container = %container_id,
            disable_clean_mode = true,
            "exec into container directly"
        );
        exec_container(&config, &docker).await
    } else {
        tracing::info!(
            container = %container_id,
            disable_clean_mode = false,
            "attach sidecar to container"
        );
        attach_sidecar(&config, &docker).await
    };

    result.map_err(|err| TunnelError::Other(wrap_container_error(&err.to_string(), &container_id)))
}

/// Creates a sidecar container in the target's pid/net namespaces, attaches
/// to it, and starts it.
async fn attach_sidecar(
    config: &Config,
    docker: &Docker,
) -> Result<Arc<dyn Session>, TunnelError> {
    let image = sidecar::pull_missing_image(
        docker,
        &config.sidecar_image,
        &config.image_hub_auth,
        false,
    )
    .await?;

    if config.login_name.is_empty() {
        return Err(TunnelError::Other(
            "empty login name isn't allowed".to_string(),
        ));
    }

    let mut cmd = vec![
        "/superman.sh".to_string(),
        "-u".to_string(),
        config.login_name.clone(),
    ];
    if !config.login_group.is_empty() {
        cmd.push("-g".to_string());
        cmd.push(config.login_group.clone());
    }
    cmd.extend(config.cmd.iter().cloned());

    tracing::info!(cmd = ?cmd, "entering container with command");

    let cpus = if config.cpus > 0.0 { config.cpus } else { DEFAULT_CPUS };
    let memory_mb = if config.memory_mb > 0 {
        config.memory_mb
    } else {
        DEFAULT_MEMORY_MB
    };

    let create_config = ContainerCreateConfig {
        attach_stderr: Some(true),
        attach_stdin: Some(true),
        attach_stdout: Some(true),
        cmd: Some(cmd),
        env: Some(vec![
            "RequestedIP=0.0.0.0".to_string(),
            format!("HOME=/home/{}", config.login_name),
        ]),
        entrypoint: None,
        image: Some(image),
        open_stdin: Some(config.interactive),
        stdin_once: Some(config.interactive),
        tty: Some(config.tty),
        host_config: Some(HostConfig {
            auto_remove: Some(false),
            pid_mode: Some(format!("container:{}", config.container_id)),
            network_mode: Some(format!("container:{}", config.container_id)),
            privileged: Some(true),
            cpu_period: Some(CPU_PERIOD),
            cpu_quota: Some((cpus * CPU_PERIOD as f64) as i64),
            memory: Some(memory_mb * 1024 * 1024),
            ..Default::default()
        }),
        ..Default::default()
    };

    let created = docker
        .create_container(None::<CreateContainerOptions<String>>, create_config)
        .await
        .map_err(|err| TunnelError::Other(format!("create container exec error: {err}")))?;

    let attach = docker
        .attach_container(
            &created.id,
            Some(AttachContainerOptions::<String> {
                stdin: Some(true),
                stdout: Some(true),
                stderr: Some(true),
                stream: Some(true),
                ..Default::default()
            }),
        )
        .await
        .map_err(|err| TunnelError::Other(format!("attach to container error: {err}")))?;

    docker
        .start_container(&created.id, None::<StartContainerOptions<String>>)
        .await
        .map_err(|err| TunnelError::Other(format!("start container error: {err}")))?;

    Ok(build_session(
        docker.clone(),
        created.id,
        false,
        config.tty,
        attach.output,
        attach.input,
    ))
}

/// Direct exec inside the target container.
async fn exec_container(config: &Config, docker: &Docker) -> Result<Arc<dyn Session>, TunnelError> {
    let created = docker
        .create_exec(
            &config.container_id,
            CreateExecOptions::<String> {
                cmd: Some(config.cmd.clone()),
                tty: Some(config.tty),
                attach_stderr: Some(true),
                attach_stdout: Some(true),
                attach_stdin: Some(config.interactive),
                user: Some(config.login_name.clone()),
                ..Default::default()
            },
        )
        .await
        .map_err(|err| TunnelError::Other(format!("create container exec error: {err}")))?;

    let started = docker
        .start_exec(
            &created.id,
            Some(StartExecOptions {
                detach: false,
                tty: config.tty,
                ..Default::default()
            }),
        )
        .await
        .map_err(|err| TunnelError::Other(format!("start container exec error: {err}")))?;

    let StartExecResults::Attached { output, input } = started else {
        return Err(TunnelError::Other(
            "start container exec error: exec detached".to_string(),
        ));
    };

    Ok(build_session(
        docker.clone(),
        created.id,
        true,
        config.tty,
        output,
        input,
    ))
}

type OutputStream =
    std::pin::Pin<Box<dyn futures::Stream<Item = Result<LogOutput, bollard::errors::Error>> + Send>>;
type InputSink = std::pin::Pin<Box<dyn tokio::io::AsyncWrite + Send>>;

fn build_session(
    docker: Docker,
    resp_id: String,
    is_exec: bool,
    tty: bool,
    output: OutputStream,
    input: InputSink,
) -> Arc<dyn Session> {
    let (stdout_tx, stdout_rx) = mpsc::channel(64);
    let (stderr_tx, stderr_rx) = mpsc::channel(64);

    {
        let resp_id = resp_id.clone();
        tokio::spawn(pump_output(output, stdout_tx, stderr_tx, tty, resp_id));
    }

    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(64);
    tokio::spawn(async move {
        let mut input = input;
        while let Some(data) = input_rx.recv().await {
            if input.write_all(&data).await.is_err() || input.flush().await.is_err() {
                break;
            }
        }
    });

    Arc::new(DockerSession {
        docker,
        resp_id,
        is_exec,
        input_tx,
        stdout: ChunkStream::new(stdout_rx),
        stderr: ChunkStream::new(stderr_rx),
        stdout_done: Latch::new(),
        stderr_done: Latch::new(),
        cleaned: AtomicBool::new(false),
    })
}

/// Which stream a demuxed frame belongs to.
#[derive(Debug, PartialEq, Eq)]
enum FrameTarget {
    Stdout,
    Stderr,
    /// Stdin-typed frames coming back from the daemon mean the stream is
    /// corrupt; the reader must stop.
    Fatal,
}

/// Routes one demuxed attach frame. With a tty everything is one opaque
/// stdout byte sequence; without one, frames dispatch by their stream type.
fn dispatch_target(frame: &LogOutput, tty: bool) -> FrameTarget {
    if tty {
        return FrameTarget::Stdout;
    }

    match frame {
        LogOutput::StdOut { .. } | LogOutput::Console { .. } => FrameTarget::Stdout,
        LogOutput::StdErr { .. } => FrameTarget::Stderr,
        LogOutput::StdIn { .. } => FrameTarget::Fatal,
    }
}

/// Forwards attach frames into the session channels, one frame at a time.
async fn pump_output(
    mut output: OutputStream,
    stdout_tx: mpsc::Sender<Bytes>,
    stderr_tx: mpsc::Sender<Bytes>,
    tty: bool,
    resp_id: String,
) {
    while let Some(item) = output.next().await {
        match item {
            Ok(frame) => {
                let target = dispatch_target(&frame, tty);
                let payload = frame.into_bytes();
                let sent = match target {
                    FrameTarget::Stdout => stdout_tx.send(payload).await.is_ok(),
                    FrameTarget::Stderr => stderr_tx.send(payload).await.is_ok(),
                    FrameTarget::Fatal => {
                        tracing::error!(container = %resp_id, "got stdin output from exec connection");
                        false
                    }
                };
                if !sent {
                    break;
                }
            }
            Err(err) => {
                let msg = err.to_string();
                if !msg.contains("use of closed network connection") {
                    tracing::warn!(container = %resp_id, error = %msg, "read container stream error");
                }
                break;
            }
        }
    }
    // Dropping the senders here is what EOFs the session's output streams.
}

/// Waits for the container to leave the running state and reports its exit
/// status.
async fn wait_container(docker: &Docker, container_id: &str) -> Result<i32, TunnelError> {
    let mut wait = docker.wait_container(
        container_id,
        Some(WaitContainerOptions {
            condition: "not-running",
        }),
    );

    match wait.next().await {
        Some(Ok(response)) => Ok(response.status_code as i32),
        Some(Err(err)) => Err(TunnelError::other(err)),
        None => Ok(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(target: u8, payload: &[u8]) -> LogOutput {
        let message = Bytes::copy_from_slice(payload);
        match target {
            0 => LogOutput::StdIn { message },
            1 => LogOutput::StdOut { message },
            _ => LogOutput::StdErr { message },
        }
    }

    #[tokio::test]
    async fn split_frames_dispatch_all_bytes() {
        let frames = vec![
            frame(1, b"out-1"),
            frame(2, b"err-1"),
            frame(1, b"out-22"),
            frame(2, b"err"),
        ];
        let total: usize = frames.iter().map(|f| match f {
            LogOutput::StdOut { message }
            | LogOutput::StdErr { message }
            | LogOutput::StdIn { message }
            | LogOutput::Console { message } => message.len(),
        }).sum();

        let stream: OutputStream = Box::pin(futures::stream::iter(
            frames.into_iter().map(Ok::<_, bollard::errors::Error>),
        ));
        let (stdout_tx, mut stdout_rx) = mpsc::channel(16);
        let (stderr_tx, mut stderr_rx) = mpsc::channel(16);

        pump_output(stream, stdout_tx, stderr_tx, false, "c1".to_string()).await;

        let mut received = 0;
        let mut stdout_bytes = Vec::new();
        while let Some(chunk) = stdout_rx.recv().await {
            received += chunk.len();
            stdout_bytes.extend_from_slice(&chunk);
        }
        while let Some(chunk) = stderr_rx.recv().await {
            received += chunk.len();
        }

        assert_eq!(received, total);
        assert_eq!(stdout_bytes, b"out-1out-22");
    }

    #[tokio::test]
    async fn stdin_frame_stops_the_pump() {
        let frames = vec![frame(1, b"before"), frame(0, b"bad"), frame(1, b"after")];
        let stream: OutputStream = Box::pin(futures::stream::iter(
            frames.into_iter().map(Ok::<_, bollard::errors::Error>),
        ));
        let (stdout_tx, mut stdout_rx) = mpsc::channel(16);
        let (stderr_tx, mut stderr_rx) = mpsc::channel(16);

        pump_output(stream, stdout_tx, stderr_tx, false, "c1".to_string()).await;

        let mut stdout_bytes = Vec::new();
        while let Some(chunk) = stdout_rx.recv().await {
            stdout_bytes.extend_from_slice(&chunk);
        }

        // Bytes before the corrupt frame arrive; nothing after it does.
        assert_eq!(stdout_bytes, b"before");
        assert!(stderr_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn tty_mode_unifies_streams() {
        let frames = vec![frame(1, b"a"), frame(2, b"b")];
        let stream: OutputStream = Box::pin(futures::stream::iter(
            frames.into_iter().map(Ok::<_, bollard::errors::Error>),
        ));
        let (stdout_tx, mut stdout_rx) = mpsc::channel(16);
        let (stderr_tx, mut stderr_rx) = mpsc::channel(16);

        pump_output(stream, stdout_tx, stderr_tx, true, "c1".to_string()).await;

        let mut stdout_bytes = Vec::new();
        while let Some(chunk) = stdout_rx.recv().await {
            stdout_bytes.extend_from_slice(&chunk);
        }
        assert_eq!(stdout_bytes, b"ab");
        assert!(stderr_rx.recv().await.is_none());
    }

    #[test]
    fn dispatch_targets() {
        assert_eq!(dispatch_target(&frame(1, b"x"), false), FrameTarget::Stdout);
        assert_eq!(dispatch_target(&frame(2, b"x"), false), FrameTarget::Stderr);
        assert_eq!(dispatch_target(&frame(0, b"x"), false), FrameTarget::Fatal);
        assert_eq!(dispatch_target(&frame(0, b"x"), true), FrameTarget::Stdout);
    }

    #[tokio::test]
    async fn establish_without_client_fails() {
        let config = Config {
            container_id: "c1".to_string(),
            cmd: vec!["ls".to_string()],
            ..Config::default()
        };
        let err = match establish(config, None).await {
            Err(e) => e,
            Ok(_) => panic!("expected establish() to fail"),
        };
        assert!(err.to_string().contains("container client is nil"));
    }
}
