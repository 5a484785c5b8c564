use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, trace, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader, DuplexStream};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::parsing;
use super::runtime_trait::ContainerRuntime;
use super::types::{AttachedStream, ContainerInfo, ContainerSpec, ResourceStats, RuntimeEvent};
use crate::error_handling::types::RuntimeError;

const JSON_FORMAT: &str = "{{json .}}";
const ATTACH_BUFFER: usize = 64 * 1024;

/// [`ContainerRuntime`] backed by the `docker` command line client.
///
/// Every operation spawns the client with `tokio::process::Command` and reads
/// its `{{json .}}` formatted output. Long running commands (`attach`,
/// `events`, `stats`) are killed when their handle is dropped.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.kill_on_drop(true).stdin(Stdio::null());
        command
    }

    /// Runs the client to completion and returns its stdout.
    async fn run(&self, args: &[String]) -> Result<String, RuntimeError> {
        trace!("Running {} {}", self.binary, args.join(" "));
        let output = self.command().args(args).output().await?;
        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(self.failure(args, output.status.code(), stderr))
    }

    fn failure(&self, args: &[String], status: Option<i32>, stderr: String) -> RuntimeError {
        let command = format!("{} {}", self.binary, args.first().map(String::as_str).unwrap_or(""));
        if stderr.contains("Cannot connect to the Docker daemon") {
            RuntimeError::Unavailable(stderr)
        } else if is_missing(&stderr) {
            RuntimeError::NotFound(stderr)
        } else {
            RuntimeError::CommandFailed {
                command,
                status,
                stderr,
            }
        }
    }

    /// Arguments of `docker create` for `spec`, image and command last.
    pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
        let mut args = vec![String::from("create"), String::from("--name"), spec.name.clone()];

        if !spec.hostname.is_empty() {
            args.extend([String::from("--hostname"), spec.hostname.clone()]);
        }
        if spec.interactive {
            args.push(String::from("--interactive"));
        }
        for (key, value) in &spec.labels {
            args.extend([String::from("--label"), format!("{}={}", key, value)]);
        }
        for (key, value) in &spec.env {
            args.extend([String::from("--env"), format!("{}={}", key, value)]);
        }
        if let Some(user) = &spec.user {
            args.extend([String::from("--user"), user.clone()]);
        }
        if let Some(dir) = &spec.working_dir {
            args.extend([String::from("--workdir"), dir.clone()]);
        }
        for mount in &spec.mounts {
            let mut value = format!(
                "type=bind,source={},target={}",
                mount.source.display(),
                mount.target
            );
            if mount.read_only {
                value.push_str(",readonly");
            }
            args.extend([String::from("--mount"), value]);
        }
        for port in &spec.ports {
            args.extend([
                String::from("--publish"),
                format!(
                    "{}:{}:{}/{}",
                    port.host_ip, port.host_port, port.container_port, port.protocol
                ),
            ]);
        }
        for capability in &spec.cap_drop {
            args.extend([String::from("--cap-drop"), capability.clone()]);
        }
        for server in &spec.dns {
            args.extend([String::from("--dns"), server.clone()]);
        }
        for (target, options) in &spec.tmpfs {
            args.extend([String::from("--tmpfs"), format!("{}:{}", target, options)]);
        }
        if let Some(bytes) = spec.memory_bytes {
            args.extend([String::from("--memory"), format!("{}b", bytes)]);
        }
        if let Some(bytes) = spec.memory_reservation_bytes {
            args.extend([String::from("--memory-reservation"), format!("{}b", bytes)]);
        }
        if let Some(bytes) = spec.memory_swap_bytes {
            let value = if bytes < 0 {
                String::from("-1")
            } else {
                format!("{}b", bytes)
            };
            args.extend([String::from("--memory-swap"), value]);
        }
        if let Some(quota) = spec.cpu_quota {
            args.extend([String::from("--cpu-quota"), quota.to_string()]);
        }
        if let Some(period) = spec.cpu_period {
            args.extend([String::from("--cpu-period"), period.to_string()]);
        }
        if let Some(shares) = spec.cpu_shares {
            args.extend([String::from("--cpu-shares"), shares.to_string()]);
        }
        if let Some(weight) = spec.blkio_weight {
            args.extend([String::from("--blkio-weight"), weight.to_string()]);
        }
        if let Some(limit) = spec.pids_limit {
            args.extend([String::from("--pids-limit"), limit.to_string()]);
        }
        if spec.oom_kill_disable {
            args.push(String::from("--oom-kill-disable"));
        }
        args.extend([String::from("--log-driver"), String::from("json-file")]);

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such container") || stderr.contains("No such object")
}

fn strings<const N: usize>(args: [&str; N]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// Copies `source` into `sink` one complete line at a time.
async fn pump_lines<R>(source: R, sink: Arc<Mutex<DuplexStream>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(source);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => {
                if sink.lock().await.write_all(&line).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("Attach pump ended: {}", e);
                break;
            }
        }
    }
}

/// Splits a `--timestamps` log line into its timestamp and content.
fn split_timestamp(line: &str) -> (Option<DateTime<Utc>>, &str) {
    match line.split_once(' ') {
        Some((stamp, rest)) => match DateTime::parse_from_rfc3339(stamp) {
            Ok(time) => (Some(time.with_timezone(&Utc)), rest),
            Err(_) => (None, line),
        },
        None => match DateTime::parse_from_rfc3339(line) {
            Ok(time) => (Some(time.with_timezone(&Utc)), ""),
            Err(_) => (None, line),
        },
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn inspect(&self, name: &str) -> Result<Option<ContainerInfo>, RuntimeError> {
        let args = strings(["inspect", "--type", "container", "--format", JSON_FORMAT, name]);
        match self.run(&args).await {
            Ok(stdout) => {
                let line = stdout.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
                parsing::parse_inspect(line).map(Some)
            }
            Err(RuntimeError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        debug!("Creating container {} from {}", spec.name, spec.image);
        let stdout = self.run(&Self::create_args(spec)).await?;
        let id = stdout.trim().to_string();
        if id.is_empty() {
            return Err(RuntimeError::Parse(String::from("create returned no container id")));
        }
        Ok(id)
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.run(&strings(["start", name])).await.map(|_| ())
    }

    async fn kill(&self, name: &str, signal: Option<&str>) -> Result<(), RuntimeError> {
        let mut args = vec![String::from("kill")];
        if let Some(signal) = signal {
            args.extend([String::from("--signal"), signal.to_string()]);
        }
        args.push(name.to_string());
        self.run(&args).await.map(|_| ())
    }

    async fn remove(&self, name: &str) -> Result<(), RuntimeError> {
        self.run(&strings(["rm", "--force", name])).await.map(|_| ())
    }

    async fn attach(&self, name: &str) -> Result<AttachedStream, RuntimeError> {
        // `docker attach` refuses stopped containers; `start --attach` starts
        // and attaches in one step so no early output is lost.
        let running = self
            .inspect(name)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(name.to_string()))?
            .running;
        let args: [&str; 4] = if running {
            ["attach", "--sig-proxy=false", "--no-stdin=false", name]
        } else {
            ["start", "--attach", "--interactive", name]
        };
        debug!("Attaching to container {} ({})", name, args[0]);
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let (stdin, stdout, stderr) = match (child.stdin.take(), child.stdout.take(), child.stderr.take()) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                return Err(RuntimeError::Unavailable(String::from(
                    "attach process has no stdio pipes",
                )))
            }
        };

        let (output, merged) = tokio::io::duplex(ATTACH_BUFFER);
        let merged = Arc::new(Mutex::new(merged));
        tokio::spawn(pump_lines(stdout, Arc::clone(&merged)));
        tokio::spawn(pump_lines(stderr, merged));

        Ok(AttachedStream {
            output: Box::new(output),
            input: Box::new(stdin),
            process: Some(child),
        })
    }

    async fn pull(
        &self,
        image: &str,
        progress: &(dyn for<'a> Fn(&'a str) + Send + Sync),
    ) -> Result<(), RuntimeError> {
        let args = strings(["pull", image]);
        let mut child = self
            .command()
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut collected = String::new();
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    collected.push_str(&line);
                    collected.push('\n');
                }
                collected
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                let line = line.trim();
                if !line.is_empty() {
                    progress(line);
                }
            }
        }

        let status = child.wait().await?;
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        if status.success() {
            Ok(())
        } else {
            Err(self.failure(&args, status.code(), stderr.trim().to_string()))
        }
    }

    async fn stats(&self, name: &str) -> Result<ResourceStats, RuntimeError> {
        let args = strings(["stats", "--no-stream", "--no-trunc", "--format", JSON_FORMAT, name]);
        let stdout = self.run(&args).await?;
        let line = stdout
            .lines()
            .find(|l| l.contains('{'))
            .ok_or_else(|| RuntimeError::Parse(String::from("stats printed no sample")))?;
        parsing::parse_stats_line(line)
    }

    async fn stream_stats(
        &self,
        name: &str,
        sink: mpsc::Sender<ResourceStats>,
        cancel: CancellationToken,
    ) -> Result<(), RuntimeError> {
        let mut child = self
            .command()
            .args(["stats", "--no-trunc", "--format", JSON_FORMAT, name])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Unavailable(String::from("stats process has no stdout")))?;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if !line.contains('{') {
                            continue;
                        }
                        match parsing::parse_stats_line(&line) {
                            Ok(sample) => {
                                if sink.send(sample).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => trace!("Skipping stats sample of {}: {}", name, e),
                        }
                    }
                    None => break,
                },
            }
        }

        debug!("Stats stream of {} ended", name);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let args = strings(["ps", "--all", "--no-trunc", "--format", JSON_FORMAT]);
        let stdout = self.run(&args).await?;
        stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(parsing::parse_ps_line)
            .collect()
    }

    async fn logs(&self, name: &str) -> Result<Vec<String>, RuntimeError> {
        let args = strings(["logs", "--timestamps", name]);
        trace!("Running {} {}", self.binary, args.join(" "));
        let output = self.command().args(&args).output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(self.failure(&args, output.status.code(), stderr));
        }

        // stdout and stderr arrive on separate pipes; order them by timestamp.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let mut entries: Vec<(Option<DateTime<Utc>>, String)> = stdout
            .lines()
            .chain(stderr.lines())
            .map(|line| {
                let (time, content) = split_timestamp(line);
                (time, content.trim_end_matches('\r').to_string())
            })
            .collect();
        entries.sort_by_key(|(time, _)| *time);

        Ok(entries.into_iter().map(|(_, content)| content).collect())
    }

    async fn events(
        &self,
        sink: mpsc::Sender<RuntimeEvent>,
        cancel: CancellationToken,
    ) -> Result<(), RuntimeError> {
        let args = strings(["events", "--format", JSON_FORMAT]);
        let mut child = self
            .command()
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RuntimeError::Unavailable(String::from("events process has no stdout")))?;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match parsing::parse_event_line(&line) {
                            Ok(event) => {
                                if sink.send(event).await.is_err() {
                                    return Ok(());
                                }
                            }
                            Err(e) => warn!("Unreadable runtime event: {}", e),
                        }
                    }
                    None => break,
                },
            }
        }

        let output = child.wait_with_output().await?;
        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            Err(self.failure(&args, output.status.code(), stderr))
        }
    }
}
