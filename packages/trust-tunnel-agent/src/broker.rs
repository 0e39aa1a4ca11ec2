//! Session broker: owns session lifetime, the stale-session table, the
//! sidecar gauge, and the runtime client handles.
//!
//! A session outlives its connection on purpose. When a client drops
//! abnormally the session is parked in the stale table and can be reclaimed
//! by a new request carrying the same session id and user name inside the
//! delay-release window; the sweeper releases whatever nobody reclaims.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::extract::ws::WebSocket;
use bollard::{ClientVersion, Docker, API_DEFAULT_VERSION};
use thiserror::Error;
use time::macros::format_description;
use time::OffsetDateTime;
use tonic::transport::Channel;

use trust_tunnel_client::TargetType;
use trust_tunnel_error::{wrap_container_error, wrap_with_code, TunnelError};

use crate::audit::{self, CmdLogger};
use crate::auth::{self, AuthHandler, Code};
use crate::config::{AgentConfig, ContainerRuntime};
use crate::mux;
use crate::request::RequestInfo;
use crate::session::{self, Session};
use crate::sidecar;

const SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to create auth handler: {0}")]
    Auth(#[from] auth::UnknownHandler),
}

/// A session preserved after an abnormal client disconnect.
struct StaleSession {
    user_name: String,
    sess: Arc<dyn Session>,
    deadline: Instant,
    is_sidecar_session: bool,
}

#[derive(Default)]
struct Shared {
    stale_sessions: HashMap<String, StaleSession>,
    current_sidecar_num: usize,
}

pub struct Broker {
    config: AgentConfig,
    shared: Mutex<Shared>,
    docker: Mutex<Option<Docker>>,
    containerd: tokio::sync::Mutex<Option<Channel>>,
    auth_handler: Option<Arc<dyn AuthHandler>>,
}

impl Broker {
    /// Builds the broker, connects the runtime client when possible, and
    /// starts the background loops. A configured-but-unregistered auth
    /// plugin is fatal; an unavailable container daemon is not.
    pub fn new(config: AgentConfig) -> Result<Arc<Self>, BrokerError> {
        auth::register_builtin();

        let auth_handler = if config.auth_config.name.is_empty() {
            None
        } else {
            Some(auth::create_auth_handler(&config.auth_config)?)
        };

        let docker = match config.container_config.container_runtime {
            ContainerRuntime::Docker => {
                match create_docker_client(
                    &config.container_config.endpoint,
                    &config.container_config.docker_api_version,
                ) {
                    Ok(client) => Some(client),
                    Err(err) => {
                        tracing::error!(error = %err, "create container API client error");
                        None
                    }
                }
            }
            ContainerRuntime::Containerd => None,
        };

        let broker = Arc::new(Self {
            config,
            shared: Mutex::new(Shared::default()),
            docker: Mutex::new(docker.clone()),
            containerd: tokio::sync::Mutex::new(None),
            auth_handler,
        });

        if let Some(docker) = docker {
            let config = &broker.config;
            let endpoint = config.container_config.endpoint.clone();
            let image = config.sidecar_config.image.clone();
            let auth = config.sidecar_config.image_hub_auth.clone();

            // Best-effort image warm-up at boot.
            {
                let docker = docker.clone();
                let image_for_log = image.clone();
                tokio::spawn(async move {
                    if let Err(err) = sidecar::init(&docker, &endpoint, &image, &auth).await {
                        tracing::error!(
                            image = %sidecar::effective_image(&image_for_log),
                            error = %err,
                            "init sidecar error, ignore it"
                        );
                    }
                });
            }

            tokio::spawn(sidecar::clean_legacy_containers_periodically(
                docker,
                broker.config.sidecar_config.image.clone(),
            ));
        }

        {
            let broker = broker.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    ticker.tick().await;
                    broker.sweep_expired().await;
                }
            });
        }

        Ok(broker)
    }

    /// Pre-session permission check; `None` handler admits everything.
    pub fn authorize(&self, req: &RequestInfo) -> Result<(), String> {
        let Some(handler) = &self.auth_handler else {
            return Ok(());
        };

        let response = handler.verify_access_permission(req);
        if response.code == Code::Success {
            Ok(())
        } else {
            Err(format!(
                "authorization failed: code={},msg={}",
                response.code.as_u16(),
                response.err_msg
            ))
        }
    }

    /// Drives one upgraded connection end to end: reclaim or establish,
    /// pump streams, then reserve or release.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket, req: RequestInfo) {
        let mut sess_id = req.session_id.clone();
        let mut is_sidecar_session = false;

        let mut sess = match self.reclaim(&sess_id, &req.user_name) {
            Some((sess, sidecar_flag)) => {
                tracing::info!(session_id = %sess_id, "reuse stale session");
                is_sidecar_session = sidecar_flag;
                Some(sess)
            }
            None => None,
        };

        if sess_id.is_empty() {
            sess_id = fresh_session_id();
        }

        if sess.is_none() {
            let sess_conf = self.session_config(&req);

            if sess_conf.target_type == TargetType::Container {
                match self.container_pre_check(&sess_conf).await {
                    Ok(sidecar_flag) => is_sidecar_session = sidecar_flag,
                    Err(err) => {
                        let err_msg = wrap_with_code(&wrap_container_error(
                            &err.to_string(),
                            &sess_conf.container_id,
                        ));
                        tracing::error!("{err_msg}");
                        mux::send_establish_error(socket, &err_msg).await;
                        return;
                    }
                }
            }

            let docker = self.docker.lock().unwrap_or_else(|e| e.into_inner()).clone();
            let containerd = self.containerd.lock().await.clone();

            match session::establish_session(
                sess_conf,
                docker,
                containerd,
                self.config.container_config.container_runtime,
            )
            .await
            {
                Ok(new_sess) => {
                    if is_sidecar_session {
                        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
                        shared.current_sidecar_num += 1;
                    }
                    tracing::info!(session_id = %sess_id, "new session established");
                    sess = Some(new_sess);
                }
                Err(err) => {
                    tracing::warn!(session_id = %sess_id, error = %err, "establish session error");
                    let err_msg = wrap_with_code(&err.to_string());
                    tracing::error!("{err_msg}");
                    mux::send_establish_error(socket, &err_msg).await;
                    return;
                }
            }
        }

        let sess = match sess {
            Some(sess) => sess,
            None => return,
        };

        let cmd_logger = CmdLogger::new(&sess_id);
        let (conn_err, pumps) = mux::run_connection(socket, sess.clone(), cmd_logger).await;

        match conn_err {
            Some(err) => {
                // Client went away abnormally: park the session for reclaim.
                pumps.cancel();
                self.reserve(&sess_id, &req.user_name, sess, is_sidecar_session);
                tracing::info!(session_id = %sess_id, "reserve session");
                tracing::info!(session_id = %sess_id, error = %err, "session disconnected with err");
            }
            None => {
                let released = self.release_session(&sess_id, &sess).await;
                if released && is_sidecar_session {
                    self.decrement_sidecar_num();
                }
                tracing::info!(session_id = %sess_id, "session disconnected");
            }
        }
    }

    fn session_config(&self, req: &RequestInfo) -> session::Config {
        session::Config {
            target_type: req.target_type,
            rootfs_prefix: self.config.container_config.rootfs_prefix.clone(),
            container_id: req.container_id.clone(),
            sidecar_image: self.config.sidecar_config.image.clone(),
            image_hub_auth: self.config.sidecar_config.image_hub_auth.clone(),
            user_name: req.user_name.clone(),
            login_name: req.login_name.clone(),
            login_group: req.login_group.clone(),
            cmd: req.cmd.clone(),
            tty: req.tty,
            interactive: req.interactive,
            phys_tunnel: self.config.session_config.phys_tunnel.clone(),
            disable_clean_mode: req.disable_clean_mode,
            cpus: req.cpus,
            memory_mb: req.memory_mb,
            container_namespace: self.config.container_config.namespace.clone(),
        }
    }

    /// Atomically removes a matching stale session. Reclaim requires both
    /// the session id and the owning user name to match.
    fn reclaim(&self, sess_id: &str, user_name: &str) -> Option<(Arc<dyn Session>, bool)> {
        if sess_id.is_empty() {
            return None;
        }

        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        let matches = shared
            .stale_sessions
            .get(sess_id)
            .map(|stale| stale.user_name == user_name)
            .unwrap_or(false);

        if !matches {
            return None;
        }

        shared
            .stale_sessions
            .remove(sess_id)
            .map(|stale| (stale.sess, stale.is_sidecar_session))
    }

    fn reserve(
        &self,
        sess_id: &str,
        user_name: &str,
        sess: Arc<dyn Session>,
        is_sidecar_session: bool,
    ) {
        let deadline = Instant::now() + self.config.session_config.delay_release_timeout();
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.stale_sessions.insert(
            sess_id.to_string(),
            StaleSession {
                user_name: user_name.to_string(),
                sess,
                deadline,
                is_sidecar_session,
            },
        );
    }

    /// Cleans the session and drops it from the stale table. Returns
    /// whether cleanup succeeded.
    async fn release_session(&self, sess_id: &str, sess: &Arc<dyn Session>) -> bool {
        tracing::debug!(session_id = %sess_id, "release session");

        let result = sess.clean().await;
        if let Err(err) = &result {
            tracing::error!(session_id = %sess_id, error = %err, "clean session err");
        }

        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.stale_sessions.remove(sess_id);

        result.is_ok()
    }

    fn decrement_sidecar_num(&self) {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.current_sidecar_num = shared.current_sidecar_num.saturating_sub(1);
    }

    /// One sweeper pass: release every stale session past its deadline.
    /// The table lock is never held across the actual cleanup.
    pub(crate) async fn sweep_expired(&self) {
        let now = Instant::now();
        let expired: Vec<(String, StaleSession)> = {
            let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
            let ids: Vec<String> = shared
                .stale_sessions
                .iter()
                .filter(|(_, stale)| stale.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| shared.stale_sessions.remove(&id).map(|stale| (id, stale)))
                .collect()
        };

        for (id, stale) in expired {
            tracing::debug!(session_id = %id, "session is outdated, let's release it");
            let released = self.release_session(&id, &stale.sess).await;
            if released && stale.is_sidecar_session {
                self.decrement_sidecar_num();
            }
        }
    }

    /// Container pre-checks: runtime readiness, then the sidecar cap.
    /// Returns whether the session will be sidecar-attached.
    async fn container_pre_check(&self, conf: &session::Config) -> Result<bool, TunnelError> {
        self.check_container_runtime().await?;
        self.check_sidecar_num(conf.disable_clean_mode)
    }

    /// The daemon may come up after the agent; retry client construction
    /// on demand.
    async fn check_container_runtime(&self) -> Result<(), TunnelError> {
        match self.config.container_config.container_runtime {
            ContainerRuntime::Docker => {
                let mut docker = self.docker.lock().unwrap_or_else(|e| e.into_inner());
                if docker.is_none() {
                    *docker = Some(create_docker_client(
                        &self.config.container_config.endpoint,
                        &self.config.container_config.docker_api_version,
                    )?);
                }
                Ok(())
            }
            ContainerRuntime::Containerd => {
                let mut containerd = self.containerd.lock().await;
                if containerd.is_none() {
                    let endpoint = self
                        .config
                        .container_config
                        .endpoint
                        .trim_start_matches("unix://");
                    let channel = containerd_client::connect(endpoint)
                        .await
                            .map_err(|err| {
                                tracing::error!(error = %err, "create containerd API client error");
                                TunnelError::RuntimeUnavailable
                            })?;
                    *containerd = Some(channel);
                }
                Ok(())
            }
        }
    }

    fn check_sidecar_num(&self, disable_clean_mode: bool) -> Result<bool, TunnelError> {
        if self.config.container_config.container_runtime != ContainerRuntime::Docker
            || disable_clean_mode
        {
            return Ok(false);
        }

        let shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        let limit = self.config.sidecar_config.limit;
        if shared.current_sidecar_num >= limit {
            return Err(TunnelError::SidecarLimit {
                current: shared.current_sidecar_num,
                limit,
            });
        }

        Ok(true)
    }

    #[cfg(test)]
    fn sidecar_num(&self) -> usize {
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .current_sidecar_num
    }

    #[cfg(test)]
    fn stale_len(&self) -> usize {
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stale_sessions
            .len()
    }
}

/// Fresh session ids are wall-clock timestamps, `YYYYMMDDhhmmss`.
fn fresh_session_id() -> String {
    let format = format_description!("[year][month][day][hour][minute][second]");
    OffsetDateTime::now_utc().format(&format).unwrap_or_default()
}

fn create_docker_client(endpoint: &str, api_version: &str) -> Result<Docker, TunnelError> {
    let version = parse_client_version(api_version).unwrap_or(*API_DEFAULT_VERSION);
    Docker::connect_with_unix(endpoint, 120, &version).map_err(|err| {
        tracing::error!(error = %err, "connect docker endpoint failed");
        TunnelError::RuntimeUnavailable
    })
}

fn parse_client_version(api_version: &str) -> Option<ClientVersion> {
    let (major, minor) = api_version.split_once('.')?;
    Some(ClientVersion {
        major_version: major.parse().ok()?,
        minor_version: minor.parse().ok()?,
    })
}

/// Emits the audit record for an accepted request.
pub fn record_audit(req: &RequestInfo) {
    audit::record_request(req);
}
