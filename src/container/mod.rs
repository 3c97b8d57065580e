//! Thin typed facade over the container engine.
//!
//! Everything the herder does to containers goes through here: pulling and
//! starting images, running one-shot lambdas with a deadline, supervising
//! long-lived daemons, listing by predicate and killing exactly-one matches.
//! The facade never holds container objects across calls; each operation
//! resolves containers by predicate against the engine.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    ListContainersOptions, LogOutput, LogsOptions, RemoveContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerSummary, HostConfig, PortBinding};
use bollard::Docker;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::error::ContainerError;

/// Give up after this many consecutive fast restarts of a supervised
/// container.
const MAX_FAST_RESTARTS: u32 = 3;

/// A restart within this window of the previous start counts as "fast".
const FAST_RESTART_WINDOW: Duration = Duration::from_secs(10);

/// How often the supervisor polls a daemonized container.
const SUPERVISOR_POLL: Duration = Duration::from_secs(1);

/// Connect to the container engine using the environment defaults.
pub fn connect() -> Result<Docker, ContainerError> {
    Ok(Docker::connect_with_local_defaults()?)
}

/// Everything needed to create and start one container.
#[derive(Debug, Clone, Default)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    pub tag: String,
    /// Host port -> container port.
    pub ports: HashMap<u16, u16>,
    /// Host path -> container path.
    pub mounts: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    pub cmd: Vec<String>,
    pub links: Vec<String>,
    pub security_opt: Vec<String>,
    pub attach_stdio: bool,
}

impl RunSpec {
    pub fn new(name: &str, image: &str, tag: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        }
    }

    fn image_ref(&self) -> String {
        format!("{}:{}", self.image, self.tag)
    }
}

/// Pull the image for a spec. Pulling an already-present image is a no-op
/// on the engine side.
async fn pull(docker: &Docker, spec: &RunSpec) -> Result<(), ContainerError> {
    tracing::info!(image = %spec.image_ref(), "Pulling image");
    let mut progress = docker.create_image(
        Some(CreateImageOptions {
            from_image: spec.image.as_str(),
            tag: spec.tag.as_str(),
            ..Default::default()
        }),
        None,
        None,
    );
    while let Some(step) = progress.next().await {
        step?;
    }
    Ok(())
}

/// Create and start one container. On a start failure the created container
/// is force-removed so no zombie is left behind.
async fn create_and_start(docker: &Docker, spec: &RunSpec) -> Result<String, ContainerError> {
    let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
    let mut port_bindings: HashMap<String, Option<Vec<PortBinding>>> = HashMap::new();
    for (outside, inside) in &spec.ports {
        let key = format!("{inside}/tcp");
        exposed_ports.insert(key.clone(), HashMap::new());
        port_bindings.insert(
            key,
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(outside.to_string()),
            }]),
        );
    }

    let binds: Vec<String> = spec
        .mounts
        .iter()
        .map(|(host, guest)| format!("{host}:{guest}"))
        .collect();

    let host_config = HostConfig {
        binds: if binds.is_empty() { None } else { Some(binds) },
        port_bindings: if port_bindings.is_empty() {
            None
        } else {
            Some(port_bindings)
        },
        links: if spec.links.is_empty() {
            None
        } else {
            Some(spec.links.clone())
        },
        security_opt: if spec.security_opt.is_empty() {
            None
        } else {
            Some(spec.security_opt.clone())
        },
        ..Default::default()
    };

    let config = Config {
        image: Some(spec.image_ref()),
        labels: Some(spec.labels.clone()),
        env: if spec.env.is_empty() {
            None
        } else {
            Some(spec.env.clone())
        },
        cmd: if spec.cmd.is_empty() {
            None
        } else {
            Some(spec.cmd.clone())
        },
        exposed_ports: if exposed_ports.is_empty() {
            None
        } else {
            Some(exposed_ports)
        },
        attach_stdout: Some(spec.attach_stdio),
        attach_stderr: Some(spec.attach_stdio),
        attach_stdin: Some(spec.attach_stdio),
        open_stdin: Some(spec.attach_stdio),
        host_config: Some(host_config),
        ..Default::default()
    };

    let options = CreateContainerOptions {
        name: spec.name.clone(),
        ..Default::default()
    };

    let created = docker.create_container(Some(options), config).await?;
    tracing::info!(container = %created.id, name = %spec.name, "Created container");

    if let Err(e) = docker.start_container::<String>(&created.id, None).await {
        tracing::error!(container = %created.id, error = %e, "Error starting container");
        remove_quietly(docker, &created.id, true).await;
        return Err(e.into());
    }

    tracing::info!(container = %created.id, "Container started");
    Ok(created.id)
}

/// Pull, create and start a container. Blocks until the container is running.
pub async fn run(docker: &Docker, spec: &RunSpec) -> Result<String, ContainerError> {
    pull(docker, spec).await?;
    create_and_start(docker, spec).await
}

/// Run a short-lived container to completion and return its collected
/// stdout and stderr. The container and its volumes are removed whether it
/// succeeded, failed or exceeded the deadline.
pub async fn run_lambda(
    docker: &Docker,
    spec: &RunSpec,
    deadline: Duration,
) -> Result<(Vec<u8>, Vec<u8>), ContainerError> {
    let id = run(docker, spec).await?;

    let waited = tokio::time::timeout(deadline, async {
        let mut wait = docker.wait_container(&id, None::<WaitContainerOptions<String>>);
        wait.next().await
    })
    .await;

    match waited {
        Err(_) => {
            tracing::warn!(container = %id, "Lambda exceeded deadline, removing");
            remove_quietly(docker, &id, true).await;
            return Err(ContainerError::Timeout { container: id });
        }
        // A non-zero exit status surfaces as a wait error; the lambda's
        // output is still what the caller wants.
        Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { .. })))
        | Ok(Some(Ok(_)))
        | Ok(None) => {}
        Ok(Some(Err(e))) => {
            remove_quietly(docker, &id, true).await;
            return Err(e.into());
        }
    }

    let (stdout, stderr) = collect_logs(docker, &id).await;
    remove_quietly(docker, &id, true).await;

    Ok((stdout, stderr))
}

/// Collect the full stdout/stderr of a stopped container.
async fn collect_logs(docker: &Docker, id: &str) -> (Vec<u8>, Vec<u8>) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut logs = docker.logs(
        id,
        Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        }),
    );
    while let Some(item) = logs.next().await {
        match item {
            Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
            Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(container = %id, error = %e, "Error reading container logs");
                break;
            }
        }
    }
    (stdout, stderr)
}

/// Handle to a container running under supervision.
pub struct Supervised {
    pub id: String,
    halt: watch::Sender<bool>,
}

impl Supervised {
    /// Stop the supervisor without signalling `done`. Used when the caller
    /// is about to remove the container on purpose and a restart must not
    /// race the removal.
    pub fn halt(&self) {
        let _ = self.halt.send(true);
    }
}

/// Pull, create and start a long-lived container in the background.
///
/// A supervisor task polls the container every second. When the container is
/// no longer running it is force-removed; with `restart` set it is recreated
/// first, with exponential back-off, until `MAX_FAST_RESTARTS` consecutive
/// restarts land within `FAST_RESTART_WINDOW` of the previous start. When the
/// supervisor gives up (or `restart` is off) it signals `done_tx` and exits.
///
/// When `stdout_tx`/`stderr_tx` are given, the container's log streams are
/// fanned into them chunk by chunk; the channels close when the stream ends.
#[allow(clippy::too_many_arguments)]
pub async fn run_daemonized(
    docker: &Docker,
    spec: &RunSpec,
    restart: bool,
    stdout_tx: Option<mpsc::Sender<Bytes>>,
    stderr_tx: Option<mpsc::Sender<Bytes>>,
    done_tx: mpsc::Sender<()>,
) -> Result<Supervised, ContainerError> {
    let id = run(docker, spec).await?;

    if stdout_tx.is_some() || stderr_tx.is_some() {
        stream_logs(docker.clone(), id.clone(), stdout_tx, stderr_tx);
    }

    let (halt, halt_rx) = watch::channel(false);
    supervise(docker.clone(), id.clone(), spec.clone(), restart, done_tx, halt_rx);

    Ok(Supervised { id, halt })
}

/// Fan a container's log streams into channels. Dropping the senders when
/// the stream ends closes the channels for the consumer.
fn stream_logs(
    docker: Docker,
    id: String,
    stdout_tx: Option<mpsc::Sender<Bytes>>,
    stderr_tx: Option<mpsc::Sender<Bytes>>,
) {
    tokio::spawn(async move {
        let mut logs = docker.logs(
            &id,
            Some(LogsOptions::<String> {
                follow: true,
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        while let Some(item) = logs.next().await {
            match item {
                Ok(LogOutput::StdOut { message }) => {
                    if let Some(tx) = &stdout_tx {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(LogOutput::StdErr { message }) => {
                    if let Some(tx) = &stderr_tx {
                        if tx.send(message).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(container = %id, error = %e, "Log stream failed");
                    break;
                }
            }
        }
    });
}

fn supervise(
    docker: Docker,
    initial_id: String,
    spec: RunSpec,
    restart: bool,
    done_tx: mpsc::Sender<()>,
    mut halt_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut id = initial_id;
        let mut last_start = Instant::now();
        let mut fast_restarts: u32 = 0;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SUPERVISOR_POLL) => {}
                _ = halt_rx.changed() => return,
            }

            let running = match docker.inspect_container(&id, None).await {
                Ok(info) => info
                    .state
                    .as_ref()
                    .and_then(|s| s.running)
                    .unwrap_or(false),
                Err(_) => false,
            };
            if running {
                continue;
            }

            tracing::info!(name = %spec.name, container = %id, "Container looks dead");
            remove_quietly(&docker, &id, false).await;

            if restart {
                if last_start.elapsed() < FAST_RESTART_WINDOW {
                    fast_restarts += 1;
                } else {
                    fast_restarts = 1;
                }
                if fast_restarts <= MAX_FAST_RESTARTS {
                    let backoff = Duration::from_secs(1u64 << (fast_restarts - 1));
                    tracing::info!(
                        name = %spec.name,
                        attempt = fast_restarts,
                        backoff_secs = backoff.as_secs(),
                        "Restarting container"
                    );
                    tokio::time::sleep(backoff).await;
                    match create_and_start(&docker, &spec).await {
                        Ok(new_id) => {
                            id = new_id;
                            last_start = Instant::now();
                            continue;
                        }
                        Err(e) => {
                            tracing::warn!(name = %spec.name, error = %e, "Restart failed");
                        }
                    }
                } else {
                    tracing::warn!(name = %spec.name, "Giving up after repeated fast restarts");
                }
            }

            let _ = done_tx.try_send(());
            return;
        }
    });
}

/// Force-remove a container, logging instead of failing; used on cleanup
/// paths where the container may already be gone.
pub async fn remove_quietly(docker: &Docker, id: &str, destroy_volumes: bool) {
    if let Err(e) = docker
        .remove_container(
            id,
            Some(RemoveContainerOptions {
                force: true,
                v: destroy_volumes,
                ..Default::default()
            }),
        )
        .await
    {
        tracing::warn!(container = %id, error = %e, "Error removing container");
    }
}

/// A composable match over engine container summaries.
pub type Predicate = Arc<dyn Fn(&ContainerSummary) -> bool + Send + Sync>;

/// Match a container by name. The engine prefixes names with a slash.
pub fn with_name(name: &str) -> Predicate {
    let want = format!("/{name}");
    Arc::new(move |c: &ContainerSummary| {
        c.names
            .as_ref()
            .map(|names| names.iter().any(|n| n == &want))
            .unwrap_or(false)
    })
}

/// Match a container carrying the given label value.
pub fn with_label(key: &str, value: &str) -> Predicate {
    let key = key.to_string();
    let value = value.to_string();
    Arc::new(move |c: &ContainerSummary| {
        c.labels
            .as_ref()
            .and_then(|labels| labels.get(&key))
            .map(|v| v == &value)
            .unwrap_or(false)
    })
}

/// Match a container by id.
pub fn with_id(id: &str) -> Predicate {
    let id = id.to_string();
    Arc::new(move |c: &ContainerSummary| c.id.as_deref() == Some(id.as_str()))
}

/// Match containers whose image reference starts with the given prefix.
pub fn with_image_prefix(prefix: &str) -> Predicate {
    let prefix = prefix.to_string();
    Arc::new(move |c: &ContainerSummary| {
        c.image
            .as_ref()
            .map(|image| image.starts_with(&prefix))
            .unwrap_or(false)
    })
}

/// Match only when every predicate matches.
pub fn all_of(predicates: Vec<Predicate>) -> Predicate {
    Arc::new(move |c: &ContainerSummary| predicates.iter().all(|p| p(c)))
}

/// Match when any predicate matches.
pub fn any_of(predicates: Vec<Predicate>) -> Predicate {
    Arc::new(move |c: &ContainerSummary| predicates.iter().any(|p| p(c)))
}

/// List containers matching the predicate.
pub async fn list(
    docker: &Docker,
    matches: &Predicate,
    include_stopped: bool,
) -> Result<Vec<ContainerSummary>, ContainerError> {
    let containers = docker
        .list_containers(Some(ListContainersOptions::<String> {
            all: include_stopped,
            ..Default::default()
        }))
        .await?;
    Ok(containers.into_iter().filter(|c| matches(c)).collect())
}

/// Kill the single container matching the predicate, optionally destroying
/// its volumes. Fails with `NotUnique` unless exactly one container matches.
pub async fn kill(
    docker: &Docker,
    matches: &Predicate,
    destroy_volumes: bool,
    include_stopped: bool,
) -> Result<(), ContainerError> {
    let matching = list(docker, matches, include_stopped).await?;
    if matching.len() != 1 {
        tracing::warn!(count = matching.len(), "Too many or too few matching containers");
        return Err(ContainerError::NotUnique(matching.len()));
    }
    let id = matching[0].id.clone().unwrap_or_default();
    tracing::info!(container = %id, "Killing container");
    docker
        .remove_container(
            &id,
            Some(RemoveContainerOptions {
                force: true,
                v: destroy_volumes,
                ..Default::default()
            }),
        )
        .await?;
    Ok(())
}

/// Ask the kernel for a free port by binding to port 0 on loopback and
/// releasing the listener. Callers must tolerate the race between release
/// and re-bind; container creation should be retried on a port conflict.
pub async fn available_port() -> Result<u16, ContainerError> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await?;
    Ok(listener.local_addr()?.port())
}

/// One chunk of attached container output.
#[derive(Debug, Clone)]
pub enum StdioChunk {
    StdOut(Bytes),
    StdErr(Bytes),
}

/// Attach to a running container's stdio. Bytes arriving on `stdin_rx` are
/// written to the container; container output is sent to `output_tx`.
/// Returns when the container's output stream ends or the consumer goes
/// away.
pub async fn attach(
    docker: &Docker,
    id: &str,
    mut stdin_rx: mpsc::Receiver<Bytes>,
    output_tx: mpsc::Sender<StdioChunk>,
) -> Result<(), ContainerError> {
    let AttachContainerResults { mut output, mut input } = docker
        .attach_container(
            id,
            Some(AttachContainerOptions::<String> {
                stdin: Some(true),
                stdout: Some(true),
                stderr: Some(true),
                stream: Some(true),
                ..Default::default()
            }),
        )
        .await?;

    let writer = tokio::spawn(async move {
        while let Some(bytes) = stdin_rx.recv().await {
            if input.write_all(&bytes).await.is_err() {
                break;
            }
            let _ = input.flush().await;
        }
    });

    while let Some(item) = output.next().await {
        let chunk = match item {
            Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                StdioChunk::StdOut(message)
            }
            Ok(LogOutput::StdErr { message }) => StdioChunk::StdErr(message),
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(container = %id, error = %e, "Attached stream failed");
                break;
            }
        };
        if output_tx.send(chunk).await.is_err() {
            break;
        }
    }

    writer.abort();
    Ok(())
}

/// Write uploaded files into a directory. Only the final path component of
/// each name is used, so uploads cannot escape the directory.
pub fn load_files(dir: &Path, files: &HashMap<String, Vec<u8>>) -> Result<(), ContainerError> {
    for (name, content) in files {
        let file_name = Path::new(name)
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| std::ffi::OsString::from("file"));
        std::fs::write(dir.join(file_name), content)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(
        name: &str,
        image: &str,
        labels: &[(&str, &str)],
    ) -> ContainerSummary {
        ContainerSummary {
            id: Some(format!("id-{name}")),
            names: Some(vec![format!("/{name}")]),
            image: Some(image.to_string()),
            labels: Some(
                labels
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_with_name_matches_slash_prefixed() {
        let c = summary("golem-abc", "webstrates/golem:latest", &[]);
        assert!(with_name("golem-abc")(&c));
        assert!(!with_name("golem-ab")(&c));
    }

    #[test]
    fn test_with_label() {
        let c = summary("golem-abc", "webstrates/golem:latest", &[("webstrate", "abc")]);
        assert!(with_label("webstrate", "abc")(&c));
        assert!(!with_label("webstrate", "xyz")(&c));
        assert!(!with_label("subject", "abc")(&c));
    }

    #[test]
    fn test_with_image_prefix() {
        let c = summary("golem-abc", "webstrates/golem:latest", &[]);
        assert!(with_image_prefix("webstrates/golem")(&c));
        assert!(!with_image_prefix("webstrates/minion")(&c));
    }

    #[test]
    fn test_all_of_requires_every_predicate() {
        let c = summary("golem-abc", "webstrates/golem:latest", &[("webstrate", "abc")]);
        let both = all_of(vec![
            with_image_prefix("webstrates/golem"),
            with_name("golem-abc"),
        ]);
        assert!(both(&c));
        let miss = all_of(vec![
            with_image_prefix("webstrates/golem"),
            with_name("golem-xyz"),
        ]);
        assert!(!miss(&c));
    }

    #[test]
    fn test_any_of() {
        let c = summary("svc-1", "webstrates/echo:latest", &[]);
        let either = any_of(vec![with_name("other"), with_id("id-svc-1")]);
        assert!(either(&c));
    }

    #[tokio::test]
    async fn test_available_port_is_nonzero() {
        let port = available_port().await.unwrap();
        assert!(port > 0);
    }

    #[tokio::test]
    async fn test_available_port_can_be_bound() {
        let port = available_port().await.unwrap();
        // The port was released; binding it again should normally succeed.
        tokio::net::TcpListener::bind(("127.0.0.1", port))
            .await
            .unwrap();
    }

    #[test]
    fn test_load_files_strips_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut files = HashMap::new();
        files.insert("../../etc/passwd".to_string(), b"nope".to_vec());
        files.insert("main.py".to_string(), b"print('hi')".to_vec());
        load_files(dir.path(), &files).unwrap();

        // The traversal-shaped name lands inside the directory.
        assert!(dir.path().join("passwd").exists());
        assert!(dir.path().join("main.py").exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[test]
    fn test_run_spec_image_ref() {
        let spec = RunSpec::new("x", "webstrates/python", "latest");
        assert_eq!(spec.image_ref(), "webstrates/python:latest");
    }
}
