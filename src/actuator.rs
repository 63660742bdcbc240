use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::security::AuthorizationGate;
use crate::types::{
    ActionError, ActionErrorCode, ActionResult, OutputStream, PermissionKind,
};

/// Wall-clock limit for every command, batch or streaming.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

const STREAM_CHUNK_BYTES: usize = 4096;

pub type OutputSink<'a> = dyn FnMut(OutputStream, &str) + Send + 'a;

#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Performs filesystem and process side effects after the gate allows them.
pub struct Actuator {
    workspace_root: PathBuf,
    gate: AuthorizationGate,
    command_timeout: Duration,
}

impl Actuator {
    pub fn new(workspace_root: PathBuf, gate: AuthorizationGate) -> Self {
        Self {
            workspace_root,
            gate,
            command_timeout: COMMAND_TIMEOUT,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn gate(&self) -> &AuthorizationGate {
        &self.gate
    }

    pub fn gate_mut(&mut self) -> &mut AuthorizationGate {
        &mut self.gate
    }

    pub fn resolve(&self, raw: &str) -> ActionResult<PathBuf> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ActionError::malformed("path must be a non-empty string"));
        }
        let candidate = Path::new(trimmed);
        if candidate.is_absolute() {
            Ok(candidate.to_path_buf())
        } else {
            Ok(self.workspace_root.join(candidate))
        }
    }

    pub fn display_path(&self, path: &Path) -> String {
        display_path(&self.workspace_root, path)
    }

    pub async fn read(&mut self, path: &str) -> ActionResult<String> {
        let resolved = self.resolve(path)?;
        let shown = self.display_path(&resolved);
        self.require(PermissionKind::FileRead, &format!("Read file: {shown}"), None)
            .await?;
        debug!("reading {}", resolved.display());
        tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|err| ActionError::io(format!("failed reading file {shown}: {err}")))
    }

    pub async fn write(&mut self, path: &str, content: &str) -> ActionResult<usize> {
        let resolved = self.resolve(path)?;
        let shown = self.display_path(&resolved);
        self.require(
            PermissionKind::FileWrite,
            &format!("Write file: {shown} ({} bytes)", content.len()),
            None,
        )
        .await?;
        if let Some(parent) = resolved.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                ActionError::io(format!(
                    "failed creating parent directory {}: {err}",
                    parent.display()
                ))
            })?;
        }
        debug!("writing {} bytes to {}", content.len(), resolved.display());
        tokio::fs::write(&resolved, content.as_bytes())
            .await
            .map_err(|err| ActionError::io(format!("failed writing file {shown}: {err}")))?;
        Ok(content.len())
    }

    pub async fn delete(&mut self, path: &str) -> ActionResult<()> {
        let resolved = self.resolve(path)?;
        let shown = self.display_path(&resolved);
        self.require(PermissionKind::FileDelete, &format!("Delete file: {shown}"), None)
            .await?;
        debug!("deleting {}", resolved.display());
        tokio::fs::remove_file(&resolved)
            .await
            .map_err(|err| ActionError::io(format!("failed deleting file {shown}: {err}")))
    }

    /// Ungated directory listing, directories first then files, each sorted.
    pub async fn list(&self, path: &str) -> ActionResult<Vec<ListedEntry>> {
        let raw = if path.trim().is_empty() { "." } else { path };
        let resolved = self.resolve(raw)?;
        let shown = self.display_path(&resolved);
        let mut reader = tokio::fs::read_dir(&resolved)
            .await
            .map_err(|err| ActionError::io(format!("failed listing {shown}: {err}")))?;
        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|err| ActionError::io(format!("failed listing {shown}: {err}")))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map(|file_type| file_type.is_dir())
                .unwrap_or(false);
            entries.push(ListedEntry {
                name: entry.file_name().to_string_lossy().to_string(),
                is_dir,
            });
        }
        entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
        Ok(entries)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path)
            .map(|resolved| resolved.exists())
            .unwrap_or(false)
    }

    /// Runs `command` through `sh -c`. Supplying `on_output` selects
    /// streaming mode; otherwise output is collected in one batch.
    pub async fn execute_command(
        &mut self,
        command: &str,
        options: &ExecOptions,
        on_output: Option<&mut OutputSink<'_>>,
    ) -> ActionResult<String> {
        let command = command.trim();
        if command.is_empty() {
            return Err(ActionError::malformed("command must be a non-empty string"));
        }
        let cwd = match options.cwd.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
            Some(raw) => self.resolve(raw)?,
            None => self.workspace_root.clone(),
        };
        let description = format!(
            "Execute command: {command} (in {})",
            self.display_path(&cwd)
        );
        self.require(PermissionKind::CommandExec, &description, Some(command))
            .await?;

        let started = Instant::now();
        let result = match on_output {
            Some(sink) => self.run_streaming(command, &cwd, sink).await,
            None => self.run_batch(command, &cwd).await,
        };
        match &result {
            Ok(_) => debug!(
                "command `{command}` finished in {}ms",
                started.elapsed().as_millis()
            ),
            Err(err) => warn!("command `{command}` failed: {err}"),
        }
        result
    }

    async fn require(
        &mut self,
        kind: PermissionKind,
        description: &str,
        command: Option<&str>,
    ) -> ActionResult<()> {
        if self.gate.authorize(kind, description, command).await? {
            return Ok(());
        }
        Err(ActionError::new(
            ActionErrorCode::PermissionDenied,
            format!("permission denied: {description}"),
        ))
    }

    async fn run_batch(&self, command: &str, cwd: &Path) -> ActionResult<String> {
        let mut cmd = shell_command(command, cwd);
        cmd.kill_on_drop(true);

        let output = match tokio::time::timeout(self.command_timeout, cmd.output()).await {
            Err(_) => return Err(timeout_error(command, self.command_timeout)),
            Ok(Err(err)) => {
                return Err(ActionError::new(
                    ActionErrorCode::ExecutionFailed,
                    format!("failed running `{command}` in {}: {err}", cwd.display()),
                ))
            }
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let aggregated = aggregate_output(stdout, stderr);
        if output.status.success() {
            return Ok(aggregated);
        }
        Err(ActionError::new(
            ActionErrorCode::ExecutionFailed,
            format!(
                "`{command}` {}: {}",
                describe_exit(output.status.code()),
                aggregated.trim_end()
            ),
        ))
    }

    async fn run_streaming(
        &self,
        command: &str,
        cwd: &Path,
        on_output: &mut OutputSink<'_>,
    ) -> ActionResult<String> {
        let mut cmd = shell_command(command, cwd);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let mut child = cmd.spawn().map_err(|err| {
            ActionError::new(
                ActionErrorCode::ExecutionFailed,
                format!("failed spawning `{command}` in {}: {err}", cwd.display()),
            )
        })?;
        let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill().await;
            return Err(ActionError::new(
                ActionErrorCode::ExecutionFailed,
                format!("`{command}` did not expose output pipes"),
            ));
        };

        let deadline = tokio::time::sleep(self.command_timeout);
        tokio::pin!(deadline);

        let mut out_chunk = [0u8; STREAM_CHUNK_BYTES];
        let mut err_chunk = [0u8; STREAM_CHUNK_BYTES];
        let mut stdout_bytes = Vec::new();
        let mut stderr_bytes = Vec::new();
        let mut stdout_text = Utf8Chunker::default();
        let mut stderr_text = Utf8Chunker::default();
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            tokio::select! {
                read = stdout.read(&mut out_chunk), if stdout_open => match read {
                    Ok(0) | Err(_) => {
                        stdout_open = false;
                        emit(on_output, OutputStream::Stdout, stdout_text.finish());
                    }
                    Ok(n) => {
                        stdout_bytes.extend_from_slice(&out_chunk[..n]);
                        emit(on_output, OutputStream::Stdout, stdout_text.push(&out_chunk[..n]));
                    }
                },
                read = stderr.read(&mut err_chunk), if stderr_open => match read {
                    Ok(0) | Err(_) => {
                        stderr_open = false;
                        emit(on_output, OutputStream::Stderr, stderr_text.finish());
                    }
                    Ok(n) => {
                        stderr_bytes.extend_from_slice(&err_chunk[..n]);
                        emit(on_output, OutputStream::Stderr, stderr_text.push(&err_chunk[..n]));
                    }
                },
                () = &mut deadline => {
                    let _ = child.kill().await;
                    return Err(timeout_error(command, self.command_timeout));
                }
            }
        }
        let stdout_text = String::from_utf8_lossy(&stdout_bytes).into_owned();
        let stderr_text = String::from_utf8_lossy(&stderr_bytes).into_owned();

        let status = tokio::select! {
            status = child.wait() => status.map_err(|err| {
                ActionError::new(
                    ActionErrorCode::ExecutionFailed,
                    format!("failed waiting for `{command}`: {err}"),
                )
            })?,
            () = &mut deadline => {
                let _ = child.kill().await;
                return Err(timeout_error(command, self.command_timeout));
            }
        };

        if status.success() {
            return Ok(aggregate_output(stdout_text, stderr_text));
        }
        let detail = if stderr_text.trim().is_empty() {
            stdout_text
        } else {
            stderr_text
        };
        Err(ActionError::new(
            ActionErrorCode::NonZeroExit,
            format!(
                "`{command}` {}: {}",
                describe_exit(status.code()),
                detail.trim_end()
            ),
        ))
    }
}

/// Turns a byte stream into text chunks without splitting a UTF-8 sequence
/// across two chunks. An incomplete trailing sequence waits for the next read.
#[derive(Debug, Default)]
struct Utf8Chunker {
    pending: Vec<u8>,
}

impl Utf8Chunker {
    fn push(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let ready = self.pending.len() - incomplete_tail(&self.pending);
        let text = String::from_utf8_lossy(&self.pending[..ready]).into_owned();
        self.pending.drain(..ready);
        text
    }

    fn finish(&mut self) -> String {
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        text
    }
}

/// Length of a truncated multi-byte sequence at the end of `bytes`, or 0.
fn incomplete_tail(bytes: &[u8]) -> usize {
    for back in 1..=bytes.len().min(3) {
        let byte = bytes[bytes.len() - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if width > back { back } else { 0 };
    }
    0
}

fn emit(on_output: &mut OutputSink<'_>, stream: OutputStream, text: String) {
    if !text.is_empty() {
        on_output(stream, &text);
    }
}

fn shell_command(command: &str, cwd: &Path) -> Command {
    let mut cmd = if cfg!(windows) {
        let mut builder = Command::new("cmd");
        builder.arg("/C").arg(command);
        builder
    } else {
        let mut builder = Command::new("sh");
        builder.arg("-c").arg(command);
        builder
    };
    cmd.current_dir(cwd);
    cmd
}

fn aggregate_output(stdout: String, stderr: String) -> String {
    if stderr.trim().is_empty() {
        stdout
    } else if stdout.trim().is_empty() {
        stderr
    } else {
        format!("{stdout}\n{stderr}")
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exited with code {code}"),
        None => "was terminated by a signal".to_owned(),
    }
}

fn timeout_error(command: &str, timeout: Duration) -> ActionError {
    ActionError::new(
        ActionErrorCode::Timeout,
        format!(
            "`{command}` exceeded {}s and was terminated",
            timeout.as_secs_f32()
        ),
    )
}

fn display_path(root: &Path, path: &Path) -> String {
    if let Ok(relative) = path.strip_prefix(root) {
        let text = relative.to_string_lossy().to_string();
        if text.is_empty() {
            ".".to_owned()
        } else {
            text.replace('\\', "/")
        }
    } else {
        path.display().to_string()
    }
}
