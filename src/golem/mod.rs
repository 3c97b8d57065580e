//! Per-webstrate golem container lifecycle.
//!
//! A golem is a headless-browser container resident in one webstrate,
//! reachable on its remote-debugging port. At most one golem container
//! exists per webstrate; spawning uses the `golem-<wsid>` name so the
//! engine itself refuses duplicates.

pub mod proxy;

use bollard::models::ContainerSummary;
use bollard::Docker;

use crate::config::Config;
use crate::container::{self, RunSpec};
use crate::error::ContainerError;

/// The remote-debugging port inside every golem container.
pub const DEBUG_PORT: u16 = 9222;

/// Label applied to golem containers so they are discoverable by predicate.
pub const WEBSTRATE_LABEL: &str = "webstrate";

fn name_of(wsid: &str) -> String {
    format!("golem-{wsid}")
}

/// Create and start a golem for the webstrate. Returns the container id.
pub async fn spawn(docker: &Docker, config: &Config, wsid: &str) -> Result<String, ContainerError> {
    // The browser runs under a dedicated seccomp profile read from the
    // working directory.
    let seccomp = std::fs::read_to_string("chrome.json").map_err(|e| {
        tracing::error!(error = %e, "Could not read seccomp profile");
        ContainerError::Io(e)
    })?;

    let host_port = container::available_port().await?;

    let mut spec = RunSpec::new(&name_of(wsid), &config.golem_image, "latest");
    spec.ports.insert(host_port, DEBUG_PORT);
    spec.env = vec![format!("WEBSTRATEID={wsid}")];
    spec.cmd = vec![
        "--headless".to_string(),
        "--ignore-certificate-errors".to_string(),
        "--disable-gpu".to_string(),
        "--remote-debugging-address=0.0.0.0".to_string(),
        format!("--remote-debugging-port={DEBUG_PORT}"),
        format!("http://{}/{}", config.webstrates, wsid),
    ];
    spec.security_opt = vec![format!("seccomp={seccomp}")];
    spec.labels
        .insert(WEBSTRATE_LABEL.to_string(), wsid.to_string());
    if config.proxy {
        spec.links = vec![config.webstrates.clone()];
    }

    tracing::info!(webstrate = %wsid, "Creating golem container");
    container::run(docker, &spec).await
}

/// Kill the golem for the webstrate, destroying its volumes. Both the image
/// prefix and the container name must match; anything other than exactly one
/// match fails with `NotUnique` rather than guessing.
pub async fn kill(docker: &Docker, config: &Config, wsid: &str) -> Result<(), ContainerError> {
    let matches = container::all_of(vec![
        container::with_image_prefix(&config.golem_image),
        container::with_name(&name_of(wsid)),
    ]);
    container::kill(docker, &matches, true, false).await
}

/// Kill and respawn the golem for the webstrate.
pub async fn restart(
    docker: &Docker,
    config: &Config,
    wsid: &str,
) -> Result<String, ContainerError> {
    kill(docker, config, wsid).await?;
    spawn(docker, config, wsid).await
}

/// All running golem containers.
pub async fn list(docker: &Docker, config: &Config) -> Result<Vec<ContainerSummary>, ContainerError> {
    let matches = container::with_image_prefix(&config.golem_image);
    container::list(docker, &matches, false).await
}

/// The public port mapped to `private_port` for the webstrate's golem.
pub async fn port_of(
    docker: &Docker,
    config: &Config,
    wsid: &str,
    private_port: u16,
) -> Result<u16, ContainerError> {
    // A list per lookup is not cheap, but containers come and go underneath
    // us and the engine is the source of truth.
    for golem in list(docker, config).await? {
        let labelled = golem
            .labels
            .as_ref()
            .and_then(|labels| labels.get(WEBSTRATE_LABEL))
            .map(|ws| ws == wsid)
            .unwrap_or(false);
        if !labelled {
            continue;
        }
        if let Some(ports) = &golem.ports {
            for port in ports {
                if i64::from(port.private_port) == i64::from(private_port) {
                    if let Some(public) = port.public_port.and_then(|p| u16::try_from(p).ok()) {
                        return Ok(public);
                    }
                }
            }
        }
    }
    Err(ContainerError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            port: 8000,
            mounts: std::path::PathBuf::from("/tmp"),
            url: "localhost".to_string(),
            webstrates: "webstrates".to_string(),
            proxy: false,
            golem_image: "webstrates/golem".to_string(),
            token_password: None,
            privkey: "key.pem".into(),
            pubkey: "cert.pem".into(),
            meter_db: "meter.db".into(),
        }
    }

    #[test]
    fn test_golem_name() {
        assert_eq!(name_of("abc"), "golem-abc");
    }

    #[test]
    fn test_kill_predicate_requires_both_conditions() {
        let config = test_config();
        let matches = container::all_of(vec![
            container::with_image_prefix(&config.golem_image),
            container::with_name(&name_of("abc")),
        ]);

        let golem = ContainerSummary {
            names: Some(vec!["/golem-abc".to_string()]),
            image: Some("webstrates/golem:latest".to_string()),
            ..Default::default()
        };
        assert!(matches(&golem));

        // Same name, foreign image: no match.
        let impostor = ContainerSummary {
            names: Some(vec!["/golem-abc".to_string()]),
            image: Some("someone/else:latest".to_string()),
            ..Default::default()
        };
        assert!(!matches(&impostor));

        // Same image, other webstrate: no match.
        let other = ContainerSummary {
            names: Some(vec!["/golem-xyz".to_string()]),
            image: Some("webstrates/golem:latest".to_string()),
            ..Default::default()
        };
        assert!(!matches(&other));
    }
}
