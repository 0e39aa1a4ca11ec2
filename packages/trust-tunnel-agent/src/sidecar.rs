//! Sidecar image readiness and legacy-container reaping.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use bollard::auth::DockerCredentials;
use bollard::container::{ListContainersOptions, RemoveContainerOptions};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures::StreamExt;

use trust_tunnel_error::TunnelError;

pub const DEFAULT_SIDECAR_IMAGE: &str = "trust-tunnel-sidecar:latest";
const CLEAN_LEGACY_PERIOD: Duration = Duration::from_secs(5 * 60);
const LEGACY_AGE: Duration = Duration::from_secs(60 * 60);

/// The configured image, or the stock one when unset.
pub fn effective_image(image: &str) -> &str {
    if image.trim().is_empty() {
        DEFAULT_SIDECAR_IMAGE
    } else {
        image
    }
}

fn split_image(image: &str) -> (&str, &str) {
    match image.split_once(':') {
        Some((name, tag)) if !tag.is_empty() => (name, tag),
        _ => (image.trim_end_matches(':'), "latest"),
    }
}

async fn image_exists(docker: &Docker, image: &str) -> Result<bool, TunnelError> {
    match docker.inspect_image(image).await {
        Ok(_) => Ok(true),
        Err(DockerError::DockerResponseServerError {
            status_code: 404, ..
        }) => Ok(false),
        Err(err) => Err(TunnelError::other(err)),
    }
}

/// Pulls `image` unless it is already present locally (or `force` is set).
/// Pull progress lines drain to the debug log.
pub async fn pull_missing_image(
    docker: &Docker,
    image: &str,
    auth: &str,
    force: bool,
) -> Result<String, TunnelError> {
    let image = effective_image(image).to_string();

    let exists = image_exists(docker, &image).await.map_err(|err| {
        tracing::error!(error = %err, "check image existence error");
        err
    })?;

    if exists && !force {
        return Ok(image);
    }

    let (name, tag) = split_image(&image);
    tracing::info!(name, tag, "pulling image");

    let credentials = if auth.is_empty() {
        None
    } else {
        Some(DockerCredentials {
            auth: Some(base64::engine::general_purpose::URL_SAFE.encode(auth)),
            ..Default::default()
        })
    };

    let mut progress = docker.create_image(
        Some(CreateImageOptions {
            from_image: name,
            tag,
            ..Default::default()
        }),
        None,
        credentials,
    );

    while let Some(line) = progress.next().await {
        match line {
            Ok(info) => {
                if let Some(status) = info.status {
                    tracing::debug!("{status}");
                }
            }
            Err(err) => {
                return Err(TunnelError::Other(format!(
                    "failed to read image pulling content: {err}"
                )));
            }
        }
    }
    drop(progress);

    // Confirm the pull actually landed.
    if docker.inspect_image(&image).await.is_ok() {
        tracing::info!(image = %image, "image is pulled");
        return Ok(image);
    }

    Err(TunnelError::Other(format!("failed to pull image {image}")))
}

/// Boot-time setup: verify the runtime endpoint exists on disk, then
/// best-effort pull the sidecar image.
pub async fn init(
    docker: &Docker,
    endpoint: &str,
    image: &str,
    auth: &str,
) -> Result<String, TunnelError> {
    let socket_path = endpoint.trim_start_matches("unix://");
    if !std::path::Path::new(socket_path).exists() {
        tracing::info!(endpoint = %socket_path, "docker endpoint not exists, maybe docker env not ready, ignore");
        return Err(TunnelError::Other(format!(
            "docker endpoint {socket_path} not exists"
        )));
    }

    pull_missing_image(docker, image, auth, false)
        .await
        .map_err(|err| {
            tracing::error!(image = %effective_image(image), error = %err, "pull sidecar image failed");
            err
        })
}

/// Background reaper: every five minutes, remove sidecar-imaged containers
/// that are not running and are older than an hour. The loop never exits;
/// per-container failures are logged and skipped.
pub async fn clean_legacy_containers_periodically(docker: Docker, image: String) {
    let image = effective_image(&image).to_string();
    tracing::info!("start clean legacy trust-tunnel-sidecar containers periodically");

    loop {
        tokio::time::sleep(CLEAN_LEGACY_PERIOD).await;

        let containers = match docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                ..Default::default()
            }))
            .await
        {
            Ok(containers) => containers,
            Err(err) => {
                tracing::error!(error = %err, "failed to list containers");
                continue;
            }
        };

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;

        for container in containers {
            let container_image = container.image.as_deref().unwrap_or_default();
            let state = container.state.as_deref().unwrap_or_default();
            let created = container.created.unwrap_or(i64::MAX);
            let id = container.id.as_deref().unwrap_or_default();

            if !is_legacy_sidecar(container_image, state, created, now, &image) {
                continue;
            }

            if let Err(err) = docker
                .remove_container(
                    id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                tracing::error!(container = %id, error = %err, "remove legacy container error");
                continue;
            }

            tracing::info!(image = %container_image, "remove legacy container done");
        }
    }
}

fn is_legacy_sidecar(
    container_image: &str,
    state: &str,
    created_unix: i64,
    now_unix: i64,
    sidecar_image: &str,
) -> bool {
    container_image.starts_with(sidecar_image)
        && state != "running"
        && created_unix < now_unix - LEGACY_AGE.as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_image_falls_back_to_default() {
        assert_eq!(effective_image(""), DEFAULT_SIDECAR_IMAGE);
        assert_eq!(effective_image("  "), DEFAULT_SIDECAR_IMAGE);
        assert_eq!(effective_image("custom:v1"), "custom:v1");
    }

    #[test]
    fn image_name_splitting() {
        assert_eq!(split_image("sidecar:v2"), ("sidecar", "v2"));
        assert_eq!(split_image("sidecar"), ("sidecar", "latest"));
        assert_eq!(split_image("sidecar:"), ("sidecar", "latest"));
    }

    #[test]
    fn legacy_selection_rules() {
        let hour = 3600;
        let now = 1_000_000;
        let image = "trust-tunnel-sidecar:latest";

        // Old, stopped, matching image: reap it.
        assert!(is_legacy_sidecar(image, "exited", now - 2 * hour, now, image));
        // Still running: keep.
        assert!(!is_legacy_sidecar(image, "running", now - 2 * hour, now, image));
        // Too young: keep.
        assert!(!is_legacy_sidecar(image, "exited", now - hour / 2, now, image));
        // Different image: keep.
        assert!(!is_legacy_sidecar("nginx:latest", "exited", now - 2 * hour, now, image));
        // Image prefix match counts.
        assert!(is_legacy_sidecar(
            "trust-tunnel-sidecar:latest@sha256:abc",
            "dead",
            now - 2 * hour,
            now,
            image
        ));
    }
}
