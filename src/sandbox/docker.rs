//! [`ContainerEngine`] backed by the docker command line client.

use std::collections::{BTreeMap, VecDeque};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::error::{Error, Result};

use super::engine::{
    BuildSpec, ContainerEngine, ContainerState, EngineResource, LineSink, RunSpec,
    MANAGED_LABEL_KEY, MANAGED_LABEL_VALUE,
};

/// Build output lines kept for the failure message.
const BUILD_TAIL_LINES: usize = 40;

/// Drives a local engine through its CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    bin: String,
}

impl DockerCli {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }

    /// Runs a short command and returns its stdout.
    async fn exec(&self, args: &[String]) -> Result<String> {
        tracing::debug!(bin = %self.bin, ?args, "running engine command");
        let output = Command::new(&self.bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Engine(format!("failed to run {}: {}", self.bin, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Engine(format!(
                "{} {} failed: {}",
                self.bin,
                args.first().map(String::as_str).unwrap_or_default(),
                stderr.trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new("docker")
    }
}

fn label_args(labels: &BTreeMap<String, String>) -> Vec<String> {
    labels
        .iter()
        .flat_map(|(k, v)| ["--label".to_string(), format!("{}={}", k, v)])
        .collect()
}

fn build_args(spec: &BuildSpec<'_>) -> Vec<String> {
    let mut args = vec![
        "build".to_string(),
        "--rm".to_string(),
        "--force-rm".to_string(),
        "--progress=plain".to_string(),
        "-t".to_string(),
        spec.tag.to_string(),
    ];
    args.extend(label_args(spec.labels));
    args.push(spec.context_dir.display().to_string());
    args
}

fn run_args(spec: &RunSpec) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        "-p".to_string(),
        format!("{}:{}/tcp", spec.host_port, spec.container_port),
        "--network".to_string(),
        spec.network.clone(),
        "--memory".to_string(),
        spec.memory_bytes.to_string(),
        "--cpus".to_string(),
        spec.cpus.to_string(),
    ];
    args.extend(label_args(&spec.labels));
    args.push(spec.image.clone());
    args
}

/// Parses `id<TAB>name` rows.
fn parse_resources(stdout: &str) -> Vec<EngineResource> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut parts = line.trim().splitn(2, '\t');
            let id = parts.next()?.trim();
            if id.is_empty() {
                return None;
            }
            Some(EngineResource {
                id: id.to_string(),
                name: parts.next().unwrap_or_default().trim().to_string(),
            })
        })
        .collect()
}

fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[async_trait]
impl ContainerEngine for DockerCli {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn ensure_network(&self, network: &str) -> Result<()> {
        if self.exec(&args(["network", "inspect", network])).await.is_ok() {
            return Ok(());
        }

        let label = format!("{}={}", MANAGED_LABEL_KEY, MANAGED_LABEL_VALUE);
        self.exec(&args([
            "network", "create", "--driver", "bridge", "--label", label.as_str(), network,
        ]))
        .await?;
        tracing::info!(%network, "created preview network");
        Ok(())
    }

    async fn build_image(&self, spec: &BuildSpec<'_>, on_line: LineSink<'_>) -> Result<()> {
        let mut child = Command::new(&self.bin)
            .args(build_args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Engine(format!("failed to run {}: {}", self.bin, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Engine("build stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Engine("build stderr not captured".into()))?;

        let mut out = BufReader::new(stdout);
        let mut err = BufReader::new(stderr);
        let (mut out_buf, mut err_buf) = (Vec::new(), Vec::new());
        let mut out_done = false;
        let mut err_done = false;
        let mut tail: VecDeque<String> = VecDeque::with_capacity(BUILD_TAIL_LINES);

        while !(out_done && err_done) {
            let line = tokio::select! {
                line = read_lossy_line(&mut out, &mut out_buf), if !out_done => {
                    let line = line?;
                    out_done = line.is_none();
                    line
                }
                line = read_lossy_line(&mut err, &mut err_buf), if !err_done => {
                    let line = line?;
                    err_done = line.is_none();
                    line
                }
            };

            let Some(line) = line else { continue };
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            on_line(line);
            if tail.len() == BUILD_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.to_string());
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(Error::BuildFailure {
                tag: spec.tag.to_string(),
                output: Vec::from(tail).join("\n"),
            });
        }

        Ok(())
    }

    async fn run_container(&self, spec: &RunSpec) -> Result<String> {
        let stdout = self.exec(&run_args(spec)).await?;
        let id = stdout.trim();
        if id.is_empty() {
            return Err(Error::StartFailure(format!(
                "engine returned no container id for {}",
                spec.name
            )));
        }
        Ok(id.to_string())
    }

    async fn container_state(&self, container: &str) -> Result<ContainerState> {
        let stdout = self
            .exec(&args(["inspect", "--format", "{{.State.Status}}", container]))
            .await?;
        Ok(ContainerState::parse(&stdout))
    }

    async fn container_logs(&self, container: &str, tail: usize) -> Result<Vec<String>> {
        let tail = tail.to_string();
        let output = Command::new(&self.bin)
            .args(["logs", "--tail", tail.as_str(), container])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::Engine(format!("failed to run {}: {}", self.bin, e)))?;

        if !output.status.success() {
            return Err(Error::Engine(format!(
                "logs for {} unavailable: {}",
                container,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // The container's stdout and stderr arrive on the matching streams.
        let mut lines: Vec<String> = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect();
        lines.extend(
            String::from_utf8_lossy(&output.stderr)
                .lines()
                .map(str::to_string),
        );
        Ok(lines)
    }

    async fn stop_container(&self, container: &str, timeout: Duration) -> Result<()> {
        let secs = timeout.as_secs().to_string();
        self.exec(&args(["stop", "-t", secs.as_str(), container])).await?;
        Ok(())
    }

    async fn remove_container(&self, container: &str) -> Result<()> {
        self.exec(&args(["rm", "-f", container])).await?;
        Ok(())
    }

    async fn remove_image(&self, tag: &str) -> Result<()> {
        self.exec(&args(["rmi", "-f", tag])).await?;
        Ok(())
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<EngineResource>> {
        let filter = format!("label={}", label);
        let stdout = self
            .exec(&args([
                "ps",
                "-a",
                "--filter",
                filter.as_str(),
                "--format",
                "{{.ID}}\t{{.Names}}",
            ]))
            .await?;
        Ok(parse_resources(&stdout))
    }

    async fn list_images(&self, label: &str) -> Result<Vec<EngineResource>> {
        let filter = format!("label={}", label);
        let stdout = self
            .exec(&args([
                "images",
                "--filter",
                filter.as_str(),
                "--format",
                "{{.ID}}\t{{.Repository}}",
            ]))
            .await?;
        Ok(parse_resources(&stdout))
    }
}

/// Reads one line, replacing invalid UTF-8 instead of failing.
///
/// Bytes read before a cancelled call stay in `buf`, so calling again
/// resumes the same line.
async fn read_lossy_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    if reader.read_until(b'\n', buf).await? == 0 && buf.is_empty() {
        return Ok(None);
    }
    let line = String::from_utf8_lossy(buf).into_owned();
    buf.clear();
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::engine::preview_labels;
    use std::path::Path;

    #[test]
    fn run_args_publish_port_and_limits() {
        let spec = RunSpec {
            image: "preview-sandbox-abc".into(),
            name: "preview-sandbox-abc".into(),
            network: "preview-sandbox-net".into(),
            host_port: 8101,
            container_port: 80,
            memory_bytes: 256 * 1024 * 1024,
            cpus: 0.25,
            labels: preview_labels("p1", "abc"),
        };
        let args = run_args(&spec);

        assert_eq!(args[0], "run");
        assert!(args.windows(2).any(|w| w == ["-p", "8101:80/tcp"]));
        assert!(args.windows(2).any(|w| w == ["--network", "preview-sandbox-net"]));
        assert!(args.windows(2).any(|w| w == ["--memory", "268435456"]));
        assert!(args.windows(2).any(|w| w == ["--cpus", "0.25"]));
        assert!(args.windows(2).any(|w| w == ["--label", "project_id=p1"]));
        assert_eq!(args.last().unwrap(), "preview-sandbox-abc");
    }

    #[test]
    fn build_args_tag_label_and_context() {
        let labels = preview_labels("p1", "abc");
        let spec = BuildSpec {
            context_dir: Path::new("/tmp/work/previews/abc"),
            tag: "preview-sandbox-abc",
            labels: &labels,
        };
        let args = build_args(&spec);

        assert_eq!(args[0], "build");
        assert!(args.contains(&"--force-rm".to_string()));
        assert!(args.windows(2).any(|w| w == ["-t", "preview-sandbox-abc"]));
        assert!(args
            .windows(2)
            .any(|w| w == ["--label", "preview-sandbox=preview"]));
        assert_eq!(args.last().unwrap(), "/tmp/work/previews/abc");
    }

    #[test]
    fn parses_tab_separated_listing() {
        let rows = "a1b2\tpreview-sandbox-x\n\nc3d4\tpreview-sandbox-y\n";
        let resources = parse_resources(rows);
        assert_eq!(resources.len(), 2);
        assert_eq!(resources[1].id, "c3d4");
        assert_eq!(resources[1].preview_id(), Some("y"));
    }

    #[tokio::test]
    async fn missing_binary_is_engine_error() {
        let engine = DockerCli::new("definitely-not-a-container-engine");
        let err = engine.remove_image("x").await.unwrap_err();
        assert!(matches!(err, Error::Engine(_)));
    }

    #[cfg(unix)]
    fn fake_engine(dir: &Path, script: &str) -> DockerCli {
        use std::os::unix::fs::PermissionsExt;

        let bin = dir.join("docker");
        std::fs::write(&bin, format!("#!/bin/sh\n{}\n", script)).unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        DockerCli::new(bin.to_string_lossy().into_owned())
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn build_tolerates_invalid_utf8_output() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = fake_engine(
            tmp.path(),
            r"printf 'Step 1/2 : FROM nginx:alpine\n\377\376 progress\nSuccessfully built abc\n'",
        );
        let labels = preview_labels("p1", "abc");
        let spec = BuildSpec {
            context_dir: tmp.path(),
            tag: "preview-sandbox-abc",
            labels: &labels,
        };
        let seen = parking_lot::Mutex::new(Vec::new());
        let sink = |line: &str| seen.lock().push(line.to_string());

        engine.build_image(&spec, &sink).await.unwrap();

        let seen = seen.into_inner();
        assert_eq!(seen.len(), 3);
        assert!(seen[1].contains('\u{FFFD}'));
        assert!(seen[1].ends_with("progress"));
        assert_eq!(seen[2], "Successfully built abc");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_build_keeps_output_tail() {
        let tmp = tempfile::TempDir::new().unwrap();
        let engine = fake_engine(tmp.path(), "echo 'npm ERR! missing script' >&2\nexit 1");
        let labels = preview_labels("p1", "abc");
        let spec = BuildSpec {
            context_dir: tmp.path(),
            tag: "preview-sandbox-abc",
            labels: &labels,
        };

        let err = engine.build_image(&spec, &|_: &str| {}).await.unwrap_err();
        match err {
            Error::BuildFailure { output, .. } => assert!(output.contains("missing script")),
            other => panic!("unexpected error: {other}"),
        }
    }
}
