//! Direct exec inside containerd-managed containers.
//!
//! The containerd task API takes FIFO paths for the exec's stdio, so each
//! exec gets a private FIFO trio under the agent's temp directory. The FIFOs
//! are opened read-write on our side so neither end blocks or EOFs before
//! the task has attached; a cancellation token torn after task exit is what
//! ends the pump loops.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::{
    DeleteProcessRequest, ExecProcessRequest, GetContainerRequest, KillRequest, ResizePtyRequest,
    StartRequest, WaitRequest,
};
use containerd_client::with_namespace;
use nix::sys::stat::Mode;
use prost_types::Any;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tonic::Request;

use trust_tunnel_error::TunnelError;

use super::{prefix_login_dir, ChunkStream, Config, ExitCell, Latch, Session};
use crate::passwd;

const PROCESS_SPEC_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Process";
const EXEC_ID_SPACE: u32 = 1_048_576;
const BUFFER_SIZE: usize = 4096;
const MINIMAL_PATH: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

pub struct ContainerdSession {
    channel: Channel,
    namespace: String,
    container_id: String,
    exec_id: String,
    stdin_tx: mpsc::Sender<Vec<u8>>,
    stdout: ChunkStream,
    stderr: ChunkStream,
    stdout_done: Latch,
    stderr_done: Latch,
    exit: Arc<ExitCell>,
    cancel: CancellationToken,
    fifo_dir: PathBuf,
    cleaned: AtomicBool,
}

#[async_trait]
impl Session for ContainerdSession {
    async fn write_stdin(&self, data: &[u8]) -> io::Result<()> {
        self.stdin_tx
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

        let req = ResizePtyRequest {
            container_id: self.container_id.clone(),
            exec_id: self.exec_id.clone(),
            width: width as u32,
            height: height as u32,
        };

        TasksClient::new(self.channel.clone())
            .resize_pty(with_namespace!(req, &self.namespace))
            .await
            .map_err(TunnelError::other)?;

        Ok(())
    }

    async fn clean(&self) -> Result<(), TunnelError> {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // A task that has not exited yet gets a SIGKILL scoped to this exec.
        if self.exit.current().is_none() {
            let req = KillRequest {
                container_id: self.container_id.clone(),
                exec_id: self.exec_id.clone(),
                signal: libc::SIGKILL as u32,
                all: false,
            };
            if let Err(err) = TasksClient::new(self.channel.clone())
                .kill(with_namespace!(req, &self.namespace))
                .await
            {
                tracing::error!(error = %err, "kill task err");
            }
        }

        self.cancel.cancel();
        let _ = std::fs::remove_dir_all(&self.fifo_dir);

        Ok(())
    }

    async fn exit_code(&self) -> i32 {
        self.stdout_done.wait().await;
        self.stderr_done.wait().await;
        self.exit.current().unwrap_or(0)
    }
}

/// Establishes a containerd exec session.
pub async fn establish(
    mut config: Config,
    channel: Option<Channel>,
) -> Result<Arc<dyn Session>, TunnelError> {
    let channel =
        channel.ok_or_else(|| TunnelError::Other("containerd client is nil".to_string()))?;

    let mut login_dir = String::new();
    let mut user = None;
    if !config.login_name.is_empty() {
        let passwd_path = format!("{}/etc/passwd", config.rootfs_prefix);
        user = passwd::find_user(&config.login_name, &passwd_path).map_err(TunnelError::other)?;
        if let Some(user) = &user {
            login_dir = user.login_dir.clone();
        }
    }

    if !login_dir.is_empty() {
        prefix_login_dir(&mut config.cmd, &login_dir);
    }

    tracing::info!(container = %config.container_id, "exec into container directly");

    exec_containerd(&config, channel, user).await
}

async fn exec_containerd(
    config: &Config,
    channel: Channel,
    user: Option<passwd::UserInfo>,
) -> Result<Arc<dyn Session>, TunnelError> {
    if config.container_id.is_empty() {
        return Err(TunnelError::Other(
            "container id must be provided".to_string(),
        ));
    }

    let namespace = config.container_namespace.clone();

    // The exec inherits the container's process spec with our own argv,
    // terminal flag, minimal environment, and (when resolved) user.
    let get_req = GetContainerRequest {
        id: config.container_id.clone(),
    };
    let container = ContainersClient::new(channel.clone())
        .get(with_namespace!(get_req, &namespace))
        .await
        .map_err(|err| TunnelError::Other(format!("load container err:{err}")))?
        .into_inner()
        .container
        .ok_or_else(|| {
            TunnelError::Other(format!("load container err:{} not found", config.container_id))
        })?;

    let spec = container
        .spec
        .ok_or_else(|| TunnelError::Other("container has no spec".to_string()))?;
    let spec_value: serde_json::Value =
        serde_json::from_slice(&spec.value).map_err(TunnelError::other)?;

    let mut process = spec_value
        .get("process")
        .cloned()
        .unwrap_or_else(|| serde_json::json!({}));

    process["terminal"] = serde_json::Value::Bool(config.tty);
    process["args"] = serde_json::json!(config.cmd);
    process["env"] = serde_json::json!([MINIMAL_PATH, "TERM=xterm-256color"]);
    if let Some(user) = user {
        process["user"] = serde_json::json!({
            "uid": user.uid_num(),
            "gid": user.gid_num(),
        });
    }

    let exec_id = rand::thread_rng().gen_range(0..EXEC_ID_SPACE).to_string();
    tracing::info!(exec_id = %exec_id, "exec id assigned");

    let fifo_dir = std::env::temp_dir().join(format!("trust-tunnel-exec-{exec_id}"));
    let fifos = FifoSet::create(&fifo_dir, config.tty).map_err(TunnelError::other)?;

    let exec_req = ExecProcessRequest {
        container_id: config.container_id.clone(),
        exec_id: exec_id.clone(),
        terminal: config.tty,
        stdin: fifos.stdin_path(),
        stdout: fifos.stdout_path(),
        stderr: fifos.stderr_path(),
        spec: Some(Any {
            type_url: PROCESS_SPEC_URL.to_string(),
            value: serde_json::to_vec(&process).map_err(TunnelError::other)?,
        }),
    };

    let mut tasks = TasksClient::new(channel.clone());
    tasks
        .exec(with_namespace!(exec_req, &namespace))
        .await
        .map_err(|err| TunnelError::Other(format!("exec task err:{err}")))?;

    let cancel = CancellationToken::new();
    let exit = Arc::new(ExitCell::new());

    // Wait subscription goes in before start so the exit status can't race
    // past us.
    {
        let exit = exit.clone();
        let cancel = cancel.clone();
        let channel = channel.clone();
        let namespace = namespace.clone();
        let container_id = config.container_id.clone();
        let exec_id = exec_id.clone();
        tokio::spawn(async move {
            let wait_req = WaitRequest {
                container_id: container_id.clone(),
                exec_id: exec_id.clone(),
            };
            let mut tasks = TasksClient::new(channel.clone());
            let status = match tasks.wait(with_namespace!(wait_req, &namespace)).await {
                Ok(response) => response.into_inner().exit_status,
                Err(err) => {
                    tracing::warn!(error = %err, "wait task err");
                    0
                }
            };

            // Give trailing output a moment to land in the FIFOs before the
            // pumps are released.
            tokio::time::sleep(Duration::from_millis(100)).await;
            exit.set(status as i32);
            cancel.cancel();

            let delete_req = DeleteProcessRequest {
                container_id,
                exec_id,
            };
            if let Err(err) = tasks.delete_process(with_namespace!(delete_req, &namespace)).await {
                tracing::debug!(error = %err, "delete exec process err");
            }

            tracing::info!("clean task process");
        });
    }

    let start_req = StartRequest {
        container_id: config.container_id.clone(),
        exec_id: exec_id.clone(),
    };
    tasks
        .start(with_namespace!(start_req, &namespace))
        .await
        .map_err(|err| TunnelError::Other(format!("start task err:{err}")))?;

    let (stdout_rx, stderr_rx, stdin_tx) = fifos.pump(cancel.clone())?;

    Ok(Arc::new(ContainerdSession {
        channel,
        namespace,
        container_id: config.container_id.clone(),
        exec_id,
        stdin_tx,
        stdout: ChunkStream::new(stdout_rx),
        stderr: if config.tty {
            ChunkStream::finished()
        } else {
            ChunkStream::new(stderr_rx)
        },
        stdout_done: Latch::new(),
        stderr_done: Latch::new(),
        exit,
        cancel,
        fifo_dir,
        cleaned: AtomicBool::new(false),
    }))
}

/// The stdio FIFO trio for one exec.
struct FifoSet {
    dir: PathBuf,
    tty: bool,
}

impl FifoSet {
    fn create(dir: &Path, tty: bool) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;
        let mode = Mode::S_IRUSR | Mode::S_IWUSR;

        for name in ["stdin", "stdout", "stderr"] {
            // Tty execs share one stream; containerd ignores stderr then.
            if tty && name == "stderr" {
                continue;
            }
            nix::unistd::mkfifo(&dir.join(name), mode).map_err(io::Error::from)?;
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            tty,
        })
    }

    fn stdin_path(&self) -> String {
        self.dir.join("stdin").to_string_lossy().into_owned()
    }

    fn stdout_path(&self) -> String {
        self.dir.join("stdout").to_string_lossy().into_owned()
    }

    fn stderr_path(&self) -> String {
        if self.tty {
            return String::new();
        }
        self.dir.join("stderr").to_string_lossy().into_owned()
    }

    /// Opens the FIFOs and starts the pump tasks.
    #[allow(clippy::type_complexity)]
    fn pump(
        &self,
        cancel: CancellationToken,
    ) -> Result<
        (
            mpsc::Receiver<Bytes>,
            mpsc::Receiver<Bytes>,
            mpsc::Sender<Vec<u8>>,
        ),
        TunnelError,
    > {
        let (stdout_tx, stdout_rx) = mpsc::channel(64);
        let (stderr_tx, stderr_rx) = mpsc::channel(64);
        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);

        let stdout = pipe::OpenOptions::new()
            .read_write(true)
            .open_receiver(self.dir.join("stdout"))
            .map_err(TunnelError::other)?;
        spawn_reader(stdout, stdout_tx, cancel.clone());

        if !self.tty {
            let stderr = pipe::OpenOptions::new()
                .read_write(true)
                .open_receiver(self.dir.join("stderr"))
                .map_err(TunnelError::other)?;
            spawn_reader(stderr, stderr_tx, cancel.clone());
        }

        let mut stdin = pipe::OpenOptions::new()
            .read_write(true)
            .open_sender(self.dir.join("stdin"))
            .map_err(TunnelError::other)?;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    data = stdin_rx.recv() => {
                        let Some(data) = data else { break };
                        if stdin.write_all(&data).await.is_err() || stdin.flush().await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        Ok((stdout_rx, stderr_rx, stdin_tx))
    }
}

fn spawn_reader(mut fifo: pipe::Receiver, tx: mpsc::Sender<Bytes>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut buf = [0u8; BUFFER_SIZE];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                read = fifo.read(&mut buf) => {
                    match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
        }
    });
}
