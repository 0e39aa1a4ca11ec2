//! Host sessions through `nsenter` into pid 1's namespaces.
//!
//! Clean mode for physical targets: the command runs inside the host's
//! mount/uts/ipc/net/pid namespaces with the login user's uid/gid dropped,
//! instead of handing out a real shell over sshd. Tty sessions get a pty
//! with the child as session leader; non-tty sessions use plain pipes.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;

use trust_tunnel_error::TunnelError;

use super::{ChunkStream, Config, ExitCell, Latch, Session};
use crate::passwd;

const MINIMAL_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";
const EXIT_WAIT: Duration = Duration::from_secs(2);
const BUFFER_SIZE: usize = 4096;

pub struct NsenterSession {
    stdin_tx: mpsc::Sender<Vec<u8>>,
    stdout: ChunkStream,
    stderr: ChunkStream,
    stdout_done: Latch,
    stderr_done: Latch,
    exit: Arc<ExitCell>,
    pid: i32,
    master: Option<StdMutex<Box<dyn MasterPty + Send>>>,
}

#[async_trait]
impl Session for NsenterSession {
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

        let Some(master) = &self.master else {
            return Ok(());
        };

        let master = master.lock().unwrap_or_else(|e| e.into_inner());
        master
            .resize(PtySize {
                rows: height,
                cols: width,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(TunnelError::other)
    }

    async fn clean(&self) -> Result<(), TunnelError> {
        tracing::info!(pid = self.pid, "clean process when session ends");

        crate::process::kill_process_group(self.pid, "nsenter", false)
            .await
            .map_err(TunnelError::other)
    }

    async fn exit_code(&self) -> i32 {
        self.stdout_done.wait().await;
        self.stderr_done.wait().await;
        self.exit.wait_timeout(EXIT_WAIT).await
    }
}

/// Enters the host namespaces and starts the requested command.
pub async fn establish(mut config: Config) -> Result<Arc<dyn Session>, TunnelError> {
    tracing::info!("try to establish nsenter session");

    let mut uid = String::new();
    let mut gid = String::new();
    let mut login_dir = String::new();

    if !config.login_name.is_empty() {
        let passwd_path = format!("{}/etc/passwd", config.rootfs_prefix);
        let user = passwd::find_user(&config.login_name, &passwd_path)
            .map_err(TunnelError::other)?
            .ok_or_else(|| TunnelError::UserNotExist(config.login_name.clone()))?;
        uid = user.uid;
        gid = user.gid;
        login_dir = user.login_dir;
    }

    // Target pid 1 and join every namespace kind; drop to the login user
    // when one was resolved.
    let mut args: Vec<String> = ["-t", "1", "-m", "-u", "-i", "-n", "-p"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    if !uid.is_empty() {
        args.push("-S".to_string());
        args.push(uid);
        args.push("-G".to_string());
        args.push(gid);
        args.push(format!("--wd={}{}", config.rootfs_prefix, login_dir));
    }

    args.append(&mut config.cmd);

    let env = [
        ("PWD".to_string(), login_dir),
        ("PATH".to_string(), MINIMAL_PATH.to_string()),
        ("TERM".to_string(), "xterm-256color".to_string()),
    ];

    if config.tty {
        establish_with_console(&args, &env)
    } else {
        establish_with_pipes(&args, &env)
    }
}

/// Pty-backed variant: the child becomes session leader on the pty slave and
/// all three streams share the master.
fn establish_with_console(
    args: &[String],
    env: &[(String, String)],
) -> Result<Arc<dyn Session>, TunnelError> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: 24,
            cols: 80,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|err| TunnelError::Other(format!("setup console failed: {err}")))?;

    let mut cmd = CommandBuilder::new("nsenter");
    cmd.args(args);
    cmd.env_clear();
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|err| TunnelError::NsenterFailed(err.to_string()))?;
    let pid = child.process_id().unwrap_or(0) as i32;

    // The slave belongs to the child now; keeping it open would hold the
    // pty alive past the child's exit.
    drop(pair.slave);

    let (stdout_tx, stdout_rx) = mpsc::channel(64);
    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|err| TunnelError::Other(format!("setup console failed: {err}")))?;
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; BUFFER_SIZE];
        loop {
            match reader.read(&mut buf) {
                // EIO after the child exits reads as end-of-stream.
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stdout_tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut writer = pair
        .master
        .take_writer()
        .map_err(|err| TunnelError::Other(format!("setup console failed: {err}")))?;
    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
    tokio::task::spawn_blocking(move || {
        while let Some(data) = stdin_rx.blocking_recv() {
            if writer.write_all(&data).is_err() || writer.flush().is_err() {
                break;
            }
        }
    });

    let exit = Arc::new(ExitCell::new());
    {
        let exit = exit.clone();
        tokio::task::spawn_blocking(move || {
            let code = child
                .wait()
                .map(|status| status.exit_code() as i32)
                .unwrap_or(0);
            exit.set(code);
        });
    }

    Ok(Arc::new(NsenterSession {
        stdin_tx,
        stdout: ChunkStream::new(stdout_rx),
        // Unified output: stderr rides the pty as stdout.
        stderr: ChunkStream::finished(),
        stdout_done: Latch::new(),
        stderr_done: Latch::new(),
        exit,
        pid,
        master: Some(StdMutex::new(pair.master)),
    }))
}

/// Pipe-backed variant for non-tty sessions.
fn establish_with_pipes(
    args: &[String],
    env: &[(String, String)],
) -> Result<Arc<dyn Session>, TunnelError> {
    let mut command = Command::new("nsenter");
    command
        .args(args)
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped());

    let mut child = command
        .spawn()
        .map_err(|err| TunnelError::NsenterFailed(err.to_string()))?;
    let pid = child.id().unwrap_or(0) as i32;

    let (stdout_tx, stdout_rx) = mpsc::channel(64);
    if let Some(mut stdout) = child.stdout.take() {
        tokio::spawn(async move {
            let mut buf = [0u8; BUFFER_SIZE];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stdout_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    let (stderr_tx, stderr_rx) = mpsc::channel(64);
    if let Some(mut stderr) = child.stderr.take() {
        tokio::spawn(async move {
            let mut buf = [0u8; BUFFER_SIZE];
            loop {
                match stderr.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stderr_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }

    let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(64);
    if let Some(mut stdin) = child.stdin.take() {
        tokio::spawn(async move {
            while let Some(data) = stdin_rx.recv().await {
                if stdin.write_all(&data).await.is_err() || stdin.flush().await.is_err() {
                    break;
                }
            }
        });
    }

    let exit = Arc::new(ExitCell::new());
    {
        let exit = exit.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code().unwrap_or(0),
                Err(err) => {
                    tracing::warn!(error = %err, "failed to wait command");
                    0
                }
            };
            exit.set(code);
        });
    }

    Ok(Arc::new(NsenterSession {
        stdin_tx,
        stdout: ChunkStream::new(stdout_rx),
        stderr: ChunkStream::new(stderr_rx),
        stdout_done: Latch::new(),
        stderr_done: Latch::new(),
        exit,
        pid,
        master: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phys_config(cmd: &[&str], tty: bool) -> Config {
        Config {
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
            tty,
            interactive: false,
            phys_tunnel: "nsenter".to_string(),
            ..Config::default()
        }
    }

    // The tests drive the pipe plumbing with a plain command instead of
    // nsenter itself, which needs root; the wiring under test is identical.
    async fn establish_plain(cmd: &[&str]) -> Arc<dyn Session> {
        let config = phys_config(cmd, false);
        let env: Vec<(String, String)> = vec![("PATH".to_string(), MINIMAL_PATH.to_string())];
        establish_with_pipes(&config.cmd, &env).expect("establish")
    }

    #[tokio::test]
    async fn pipes_capture_stdout_and_exit_code() {
        let session = establish_plain(&["sh", "-c", "printf hello"]).await;

        let mut out = Vec::new();
        while let Some(chunk) = session.next_stdout().await {
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, b"hello");

        session.stdout_done();
        session.stderr_done();
        assert_eq!(session.exit_code().await, 0);
    }

    #[tokio::test]
    async fn pipes_split_stderr() {
        let session = establish_plain(&["sh", "-c", "echo oops 1>&2"]).await;

        let mut err = Vec::new();
        while let Some(chunk) = session.next_stderr().await {
            err.extend_from_slice(&chunk);
        }
        assert_eq!(err, b"oops\n");
    }

    #[tokio::test]
    async fn nonzero_exit_code_reported() {
        let session = establish_plain(&["sh", "-c", "exit 3"]).await;

        while session.next_stdout().await.is_some() {}
        session.stdout_done();
        session.stderr_done();
        assert_eq!(session.exit_code().await, 3);
    }

    #[tokio::test]
    async fn stdin_reaches_child() {
        let session = establish_plain(&["cat"]).await;

        session.write_stdin(b"roundtrip").await.unwrap();
        let chunk = session.next_stdout().await.expect("stdout chunk");
        assert_eq!(&chunk[..], b"roundtrip");

        // Dropping stdin lets cat finish.
        session.write_stdin(b"").await.unwrap();
    }

    #[tokio::test]
    async fn missing_user_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("etc")).unwrap();
        std::fs::write(
            dir.path().join("etc/passwd"),
            "root:x:0:0:root:/root:/bin/bash\n",
        )
        .unwrap();

        let config = Config {
            login_name: "ghost".to_string(),
            rootfs_prefix: dir.path().to_string_lossy().into_owned(),
            cmd: vec!["ls".to_string()],
            ..Config::default()
        };

        let err = match establish(config).await {
            Err(e) => e,
            Ok(_) => panic!("expected establish() to fail"),
        };
        assert!(err.to_string().contains("user does not exist"));
    }

    #[tokio::test]
    async fn resize_without_pty_is_a_noop() {
        let session = establish_plain(&["sh", "-c", "true"]).await;
        session.resize(24, 80).await.unwrap();
    }
}
