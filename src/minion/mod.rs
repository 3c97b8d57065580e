//! One-shot minion lambdas.
//!
//! A lambda builds a per-invocation sandbox directory from uploaded files,
//! executes a `webstrates/<env>` container over it with a hard deadline and
//! returns either the captured stdout/stderr as JSON or a named output
//! artifact from the sandbox.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Form, State};
use axum::http::header;
use axum::response::IntoResponse;
use bollard::Docker;
use serde::{Deserialize, Serialize};

use crate::container::{self, RunSpec};
use crate::error::ContainerError;
use crate::server::{ApiError, HerderState};

/// Wall-clock limit on a single lambda execution.
pub const LAMBDA_DEADLINE: Duration = Duration::from_secs(60);

/// Where the sandbox directory is mounted inside the container.
const GUEST_DIR: &str = "/minion";

/// The default result of a lambda execution.
#[derive(Debug, Serialize, Deserialize)]
pub struct Output {
    #[serde(rename = "StdOut")]
    pub stdout: String,
    #[serde(rename = "StdErr")]
    pub stderr: String,
}

/// Run a lambda and return `(body, content-type)`.
///
/// With `output` empty or `"stdout"` the body is the JSON form of [`Output`];
/// otherwise the named file is read from the sandbox with its MIME type
/// inferred from the extension, falling back to the JSON form when the file
/// cannot be read. The sandbox directory and the container are removed on
/// every path.
pub async fn spawn(
    docker: &Docker,
    env: &str,
    output: &str,
    files: &HashMap<String, Vec<u8>>,
) -> Result<(Vec<u8>, String), ContainerError> {
    let dir = tempfile::Builder::new().prefix("minion-").tempdir()?;
    tracing::info!(dir = %dir.path().display(), "Created lambda sandbox");

    container::load_files(dir.path(), files)?;

    let name = dir
        .path()
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "minion".to_string());

    let mut spec = RunSpec::new(&name, &format!("webstrates/{env}"), "latest");
    spec.mounts
        .insert(dir.path().display().to_string(), GUEST_DIR.to_string());
    spec.attach_stdio = true;

    let (stdout, stderr) = container::run_lambda(docker, &spec, LAMBDA_DEADLINE).await?;

    let default = default_output(&stdout, &stderr);
    if output.is_empty() || output == "stdout" {
        return Ok((default, "application/json".to_string()));
    }

    Ok(artifact_or_default(dir.path(), output, default))
}

fn default_output(stdout: &[u8], stderr: &[u8]) -> Vec<u8> {
    let out = Output {
        stdout: String::from_utf8_lossy(stdout).into_owned(),
        stderr: String::from_utf8_lossy(stderr).into_owned(),
    };
    serde_json::to_vec(&out).unwrap_or_default()
}

/// Read the named artifact from the sandbox, falling back to the default
/// JSON output when it cannot be read.
fn artifact_or_default(dir: &Path, output: &str, default: Vec<u8>) -> (Vec<u8>, String) {
    // Only the file name counts; the sandbox is flat.
    let file_name = Path::new(output).file_name().unwrap_or(output.as_ref());
    let path = dir.join(file_name);
    match std::fs::read(&path) {
        Ok(bytes) => {
            let mime = mime_guess::from_path(&path)
                .first_or_octet_stream()
                .to_string();
            (bytes, mime)
        }
        Err(e) => {
            tracing::warn!(file = %output, error = %e, "Error reading file for output");
            (default, "application/json".to_string())
        }
    }
}

/// `POST /minion/v1/spawn` — form fields `env` (required) and `output`;
/// every other field becomes an input file verbatim.
pub async fn spawn_handler(
    State(state): State<Arc<HerderState>>,
    Form(mut form): Form<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let env = form
        .remove("env")
        .filter(|env| !env.is_empty())
        .ok_or_else(|| ApiError::BadInput("Missing env POST variable".to_string()))?;
    let output = form.remove("output").unwrap_or_default();

    let files: HashMap<String, Vec<u8>> = form
        .into_iter()
        .map(|(name, content)| (name, content.into_bytes()))
        .collect();

    let (body, mime) = spawn(&state.docker, &env, &output, &files).await?;
    Ok(([(header::CONTENT_TYPE, mime)], body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_output_shape() {
        let body = default_output(b"hi\n", b"");
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["StdOut"], "hi\n");
        assert_eq!(json["StdErr"], "");
    }

    #[test]
    fn test_artifact_read_with_mime() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plot.png"), b"\x89PNG").unwrap();

        let (bytes, mime) = artifact_or_default(dir.path(), "plot.png", vec![]);
        assert_eq!(bytes, b"\x89PNG");
        assert_eq!(mime, "image/png");
    }

    #[test]
    fn test_missing_artifact_falls_back_to_json() {
        let dir = tempfile::tempdir().unwrap();
        let default = default_output(b"out", b"err");
        let (bytes, mime) = artifact_or_default(dir.path(), "missing.txt", default.clone());
        assert_eq!(bytes, default);
        assert_eq!(mime, "application/json");
    }

    #[test]
    fn test_artifact_name_is_flattened() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("result.json"), b"{}").unwrap();
        let (bytes, mime) = artifact_or_default(dir.path(), "../result.json", vec![]);
        assert_eq!(bytes, b"{}");
        assert_eq!(mime, "application/json");
    }

    #[test]
    fn test_unknown_extension_gets_octet_stream() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("blob.weird"), b"x").unwrap();
        let (_, mime) = artifact_or_default(dir.path(), "blob.weird", vec![]);
        assert_eq!(mime, "application/octet-stream");
    }
}
