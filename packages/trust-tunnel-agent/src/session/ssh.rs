//! Host sessions over sshd on localhost.
//!
//! The fallback physical tunnel: the agent provisions its own public key
//! into the login user's `authorized_keys` (under the rootfs prefix), dials
//! `127.0.0.1:22` with the pre-generated private key, and runs the joined
//! command string in one exec channel.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client;
use russh::{ChannelMsg, Disconnect, Pty};
use russh_keys::key;
use tokio::sync::{mpsc, Mutex};

use trust_tunnel_error::TunnelError;

use super::{ChunkStream, Config, ExitCell, Latch, Session};
use crate::passwd;

const PRIVATE_KEY_PATH: &str = "/root/.ssh/id_rsa_trust_tunnel_agent";
const PUBLIC_KEY_PATH: &str = "/root/.ssh/id_rsa_trust_tunnel_agent.pub";
const AUTHORIZED_KEYS_SUFFIX: &str = "/.ssh/authorized_keys";
const KEY_MARKER: &str = "trust-tunnel-agent";
const SSH_ADDR: (&str, u16) = ("127.0.0.1", 22);
const EXIT_WAIT: Duration = Duration::from_secs(2);

/// Control messages pushed into the channel pump; russh channels are not
/// shareable, so every channel operation funnels through it.
enum Control {
    Data(Vec<u8>),
    Resize(u32, u32),
    Close,
}

struct AcceptingClient;

#[async_trait]
impl client::Handler for AcceptingClient {
    type Error = russh::Error;

    // The agent dials its own sshd over loopback.
    async fn check_server_key(
        &mut self,
        _server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub struct SshSession {
    handle: client::Handle<AcceptingClient>,
    control_tx: mpsc::Sender<Control>,
    stdout: ChunkStream,
    stderr: ChunkStream,
    stdout_done: Latch,
    stderr_done: Latch,
    exit: Arc<ExitCell>,
    cleaned: AtomicBool,
}

#[async_trait]
impl Session for SshSession {
    async fn write_stdin(&self, data: &[u8]) -> io::Result<()> {
        self.control_tx
            .send(Control::Data(data.to_vec()))
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

        self.control_tx
            .send(Control::Resize(height as u32, width as u32))
            .await
            .map_err(|_| TunnelError::Other("ssh channel closed".to_string()))
    }

    async fn clean(&self) -> Result<(), TunnelError> {
        if self.cleaned.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.control_tx.send(Control::Close).await;
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(TunnelError::other)?;

        Ok(())
    }

    async fn exit_code(&self) -> i32 {
        self.stdout_done.wait().await;
        self.stderr_done.wait().await;
        self.exit.wait_timeout(EXIT_WAIT).await
    }
}

/// Provisions the login key and starts the command over SSH.
pub async fn establish(config: Config) -> Result<Arc<dyn Session>, TunnelError> {
    tracing::info!("try to establish ssh session");

    insert_pub_key_on_host(&config.login_name, &config.rootfs_prefix)
        .await
        .map_err(|err| TunnelError::SshKeyInsert(err.to_string()))?;

    let key_data = std::fs::read_to_string(PRIVATE_KEY_PATH)
        .map_err(|err| TunnelError::SshKeyRead(err.to_string()))?;
    let key_pair = russh_keys::decode_secret_key(&key_data, None)
        .map_err(|err| TunnelError::SshKeyParse(err.to_string()))?;

    let ssh_config = Arc::new(client::Config::default());
    let mut handle = client::connect(ssh_config, SSH_ADDR, AcceptingClient)
        .await
        .map_err(|err| TunnelError::SshDial(err.to_string()))?;

    let authenticated = handle
        .authenticate_publickey(config.login_name.as_str(), Arc::new(key_pair))
        .await
        .map_err(|err| TunnelError::SshDial(err.to_string()))?;
    if !authenticated {
        return Err(TunnelError::SshDial("publickey authentication rejected".to_string()));
    }

    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|err| TunnelError::Other(format!("SSH new session error: {err}")))?;

    if config.tty {
        let modes = [
            (Pty::ECHO, 1),
            (Pty::ECHOCTL, 0),
            (Pty::TTY_OP_ISPEED, 14400),
            (Pty::TTY_OP_OSPEED, 14400),
        ];
        // The client follows up with resize control frames, so the initial
        // geometry is only a placeholder.
        if let Err(err) = channel.request_pty(false, "xterm-256color", 80, 24, 0, 0, &modes).await {
            tracing::error!(error = %err, "error requesting pty");
        }
    }

    // sshd runs the joined command string, which is always the last token.
    let cmd = config.cmd.last().cloned().unwrap_or_default();
    tracing::debug!(cmd = %cmd, "ssh exec commands");

    channel
        .exec(true, cmd.as_bytes())
        .await
        .map_err(|err| TunnelError::Other(format!("SSH session start error: {err}")))?;

    let (stdout_tx, stdout_rx) = mpsc::channel(64);
    let (stderr_tx, stderr_rx) = mpsc::channel(64);
    let (control_tx, mut control_rx) = mpsc::channel::<Control>(64);
    let exit = Arc::new(ExitCell::new());

    {
        let exit = exit.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = channel.wait() => {
                        match msg {
                            Some(ChannelMsg::Data { ref data }) => {
                                if stdout_tx.send(Bytes::copy_from_slice(data)).await.is_err() {
                                    break;
                                }
                            }
                            Some(ChannelMsg::ExtendedData { ref data, ext: 1 }) => {
                                if stderr_tx.send(Bytes::copy_from_slice(data)).await.is_err() {
                                    break;
                                }
                            }
                            Some(ChannelMsg::ExitStatus { exit_status }) => {
                                exit.set(exit_status as i32);
                            }
                            Some(ChannelMsg::Eof) => continue,
                            Some(_) => continue,
                            None => break,
                        }
                    }
                    control = control_rx.recv() => {
                        match control {
                            Some(Control::Data(data)) => {
                                if channel.data(&data[..]).await.is_err() {
                                    break;
                                }
                            }
                            Some(Control::Resize(height, width)) => {
                                if let Err(err) = channel.window_change(width, height, 0, 0).await {
                                    tracing::warn!(error = %err, "window change failed");
                                }
                            }
                            Some(Control::Close) | None => {
                                let _ = channel.eof().await;
                                break;
                            }
                        }
                    }
                }
            }
        });
    }

    Ok(Arc::new(SshSession {
        handle,
        control_tx,
        stdout: ChunkStream::new(stdout_rx),
        stderr: ChunkStream::new(stderr_rx),
        stdout_done: Latch::new(),
        stderr_done: Latch::new(),
        exit,
        cleaned: AtomicBool::new(false),
    }))
}

fn auth_keys_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Ensures the agent's public key is present in the login user's
/// `authorized_keys`, creating `.ssh` and the file with correct ownership
/// when missing. Rewrites are serialized process-wide.
async fn insert_pub_key_on_host(username: &str, rootfs_prefix: &str) -> Result<(), TunnelError> {
    let _guard = auth_keys_lock().lock().await;

    let key = std::fs::read_to_string(PUBLIC_KEY_PATH)
        .map_err(|err| TunnelError::Other(format!("read pub key error: {err}")))?;

    let passwd_path = format!("{rootfs_prefix}/etc/passwd");
    let user = passwd::find_user(username, &passwd_path)
        .map_err(|err| {
            TunnelError::Other(format!("open host file ({rootfs_prefix}/etc/passwd) error: {err}"))
        })?
        .ok_or_else(|| TunnelError::LoginNotPermitted(username.to_string()))?;

    let login_dir = format!("{rootfs_prefix}{}", user.login_dir);

    create_ssh_dir_and_auth_keys(&login_dir, user.uid_num(), user.gid_num())
        .map_err(TunnelError::other)?;

    let auth_keys_file = format!("{login_dir}{AUTHORIZED_KEYS_SUFFIX}");
    upsert_authorized_key(&key, &auth_keys_file).map_err(TunnelError::other)?;

    Ok(())
}

fn create_ssh_dir_and_auth_keys(login_dir: &str, uid: u32, gid: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let ssh_dir = format!("{login_dir}/.ssh");
    std::fs::create_dir_all(&ssh_dir)?;
    std::fs::set_permissions(&ssh_dir, std::fs::Permissions::from_mode(0o700))?;
    chown(&ssh_dir, uid, gid)?;

    let auth_keys_file = format!("{login_dir}{AUTHORIZED_KEYS_SUFFIX}");
    if !Path::new(&auth_keys_file).exists() {
        std::fs::File::create(&auth_keys_file)?;
    }
    std::fs::set_permissions(&auth_keys_file, std::fs::Permissions::from_mode(0o644))?;
    chown(&auth_keys_file, uid, gid)?;

    Ok(())
}

fn chown(path: &str, uid: u32, gid: u32) -> io::Result<()> {
    nix::unistd::chown(
        Path::new(path),
        Some(nix::unistd::Uid::from_raw(uid)),
        Some(nix::unistd::Gid::from_raw(gid)),
    )
    .map_err(io::Error::from)
}

/// Adds the key when absent. Stale lines carrying the agent marker are
/// pruned; running the insertion again leaves the file unchanged.
fn upsert_authorized_key(key: &str, auth_keys_file: &str) -> io::Result<bool> {
    let key_trimmed = key.trim_end();
    let content = std::fs::read_to_string(auth_keys_file)?;

    let mut key_found = false;
    let mut new_content = String::new();

    for line in content.lines() {
        if line.contains(key_trimmed) {
            key_found = true;
            break;
        }

        // Drop stale agent keys; keep everything else.
        if !line.trim_end().ends_with(KEY_MARKER) {
            new_content.push_str(line);
            new_content.push('\n');
        }
    }

    if !key_found {
        new_content.push_str(key);
        if !key.ends_with('\n') {
            new_content.push('\n');
        }
        std::fs::write(auth_keys_file, new_content)?;
    }

    Ok(key_found)
}

#[cfg(test)]
mod tests {
    use super::*;

    const AGENT_KEY: &str = "ssh-rsa AAAAB3Nza...new trust-tunnel-agent";

    fn auth_keys_with(content: &str) -> (tempfile::TempDir, String) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        std::fs::write(&path, content).unwrap();
        (dir, path.to_string_lossy().into_owned())
    }

    #[test]
    fn inserts_missing_key() {
        let (_dir, path) = auth_keys_with("ssh-rsa OTHER user@host\n");

        let found = upsert_authorized_key(AGENT_KEY, &path).unwrap();
        assert!(!found);

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("ssh-rsa OTHER user@host"));
        assert!(content.contains(AGENT_KEY));
    }

    #[test]
    fn insertion_is_idempotent() {
        let (_dir, path) = auth_keys_with("");

        upsert_authorized_key(AGENT_KEY, &path).unwrap();
        let first = std::fs::read_to_string(&path).unwrap();

        let found = upsert_authorized_key(AGENT_KEY, &path).unwrap();
        assert!(found);
        let second = std::fs::read_to_string(&path).unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn stale_agent_keys_are_pruned() {
        let (_dir, path) = auth_keys_with(
            "ssh-rsa STALE old trust-tunnel-agent\nssh-rsa OTHER user@host\n",
        );

        upsert_authorized_key(AGENT_KEY, &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("STALE"));
        assert!(content.contains("ssh-rsa OTHER user@host"));
        assert!(content.contains(AGENT_KEY));
    }

    #[test]
    fn ssh_dir_gets_restrictive_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let login_dir = dir.path().to_string_lossy().into_owned();
        let uid = nix::unistd::Uid::current().as_raw();
        let gid = nix::unistd::Gid::current().as_raw();

        create_ssh_dir_and_auth_keys(&login_dir, uid, gid).unwrap();

        let ssh_dir_meta = std::fs::metadata(dir.path().join(".ssh")).unwrap();
        assert_eq!(ssh_dir_meta.permissions().mode() & 0o777, 0o700);

        let keys_meta = std::fs::metadata(dir.path().join(".ssh/authorized_keys")).unwrap();
        assert_eq!(keys_meta.permissions().mode() & 0o777, 0o644);
    }
}
