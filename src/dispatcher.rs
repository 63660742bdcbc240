use tracing::{debug, info, warn};

use crate::actions::{parse_actions, Action, ActionRequest};
use crate::actuator::{Actuator, ExecOptions, OutputSink};
use crate::patch::{apply_file_diff, preview_file_diff};
use crate::types::{ActionError, ActionErrorCode, ActionResult, OutputStream};

/// Commands that get live output instead of a single batch result.
pub const LONG_RUNNING_PREFIXES: &[&str] = &[
    "npm install",
    "npm test",
    "npm run",
    "git clone",
    "wget",
    "curl",
    "ping",
    "sleep",
];

pub type StreamSink = dyn FnMut(OutputStream, &str) + Send;

pub fn is_long_running(command: &str) -> bool {
    let command = command.trim();
    LONG_RUNNING_PREFIXES.iter().any(|prefix| {
        command == *prefix
            || command
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with(char::is_whitespace))
    })
}

/// Runs the actions embedded in a model reply, one at a time in text order,
/// and splices each result back into the reply.
pub struct Dispatcher {
    actuator: Actuator,
    stream_sink: Option<Box<StreamSink>>,
}

impl Dispatcher {
    pub fn new(actuator: Actuator) -> Self {
        Self {
            actuator,
            stream_sink: None,
        }
    }

    pub fn with_stream_sink(mut self, sink: Box<StreamSink>) -> Self {
        self.stream_sink = Some(sink);
        self
    }

    pub fn actuator(&self) -> &Actuator {
        &self.actuator
    }

    pub async fn dispatch(&mut self, text: &str) -> String {
        let requests = parse_actions(text);
        if requests.is_empty() {
            return text.to_owned();
        }
        debug!("dispatching {} action(s)", requests.len());

        let mut composed = String::with_capacity(text.len());
        let mut copied_to = 0usize;
        for request in &requests {
            composed.push_str(&text[copied_to..request.span.start]);
            let token = &text[request.span.clone()];
            match self.run_request(request).await {
                Ok(block) => {
                    info!("action {} succeeded", request.type_name);
                    composed.push_str(&block);
                }
                Err(err) => {
                    warn!("action {} failed: {err}", request.type_name);
                    composed.push_str(token);
                    composed.push_str(&format!("\n[action failed: {err}]"));
                }
            }
            copied_to = request.span.end;
        }
        composed.push_str(&text[copied_to..]);
        composed
    }

    async fn run_request(&mut self, request: &ActionRequest) -> ActionResult<String> {
        let action = Action::from_request(request)?;
        self.run_action(action).await
    }

    pub async fn run_action(&mut self, action: Action) -> ActionResult<String> {
        debug!("running {}", action.kind().as_wire());
        match action {
            Action::ReadFile { path } => {
                let content = self.actuator.read(&path).await?;
                Ok(format!("[read {path}]\n```\n{}\n```", content.trim_end_matches('\n')))
            }
            Action::WriteFile { path, content } => {
                let bytes = self.actuator.write(&path, &content).await?;
                Ok(format!("[wrote {bytes} bytes to {path}]"))
            }
            Action::DeleteFile { path } => {
                self.actuator.delete(&path).await?;
                Ok(format!("[deleted {path}]"))
            }
            Action::ListFiles { path } => {
                let entries = self.actuator.list(&path).await?;
                let mut rendered = format!("[files in {path}]");
                if entries.is_empty() {
                    rendered.push_str("\n  (empty)");
                }
                for entry in entries {
                    let suffix = if entry.is_dir { "/" } else { "" };
                    rendered.push_str(&format!("\n  {}{suffix}", entry.name));
                }
                Ok(rendered)
            }
            Action::ExecCommand { command, cwd } => {
                let options = ExecOptions { cwd };
                let output = if is_long_running(&command) {
                    let mut fallback = log_chunk;
                    let sink: &mut OutputSink<'_> = match self.stream_sink.as_mut() {
                        Some(sink) => &mut **sink,
                        None => &mut fallback,
                    };
                    self.actuator
                        .execute_command(&command, &options, Some(sink))
                        .await?
                } else {
                    self.actuator
                        .execute_command(&command, &options, None)
                        .await?
                };
                let output = output.trim_end();
                if output.is_empty() {
                    Ok(format!("[ran `{command}`: no output]"))
                } else {
                    Ok(format!("[ran `{command}`]\n```\n{output}\n```"))
                }
            }
            Action::DiffFile { path, diff } => {
                let summary = apply_file_diff(&mut self.actuator, &path, &diff).await?;
                Ok(format!(
                    "[patched {path}: {} block(s), {} line(s) changed, {:+} bytes]",
                    summary.blocks, summary.changed_lines, summary.byte_delta
                ))
            }
            Action::PreviewDiff { path, diff } => {
                Ok(preview_file_diff(&mut self.actuator, &path, &diff).await)
            }
            Action::ApproveCommand { command } => {
                self.confirm_list_edit(&format!("Approve command: {command}"), &command)
                    .await?;
                let added = self
                    .store_mut()
                    .add_command(&command)
                    .map_err(store_error)?;
                Ok(if added {
                    format!("[approved command: {command}]")
                } else {
                    format!("[command already approved: {command}]")
                })
            }
            Action::RemoveCommand { command } => {
                self.confirm_list_edit(&format!("Remove approved command: {command}"), &command)
                    .await?;
                let removed = self
                    .store_mut()
                    .remove_command(&command)
                    .map_err(store_error)?;
                Ok(if removed {
                    format!("[removed command: {command}]")
                } else {
                    format!("[command was not approved: {command}]")
                })
            }
            Action::ShowCommands => Ok(self.actuator.gate().store().render_commands()),
            Action::ShowPermissions => Ok(self.actuator.gate().store().render_levels()),
            Action::ResetPermissions => {
                let store = self.store_mut();
                store.reset_all().map_err(store_error)?;
                store.reset_commands().map_err(store_error)?;
                Ok("[permissions reset; approved commands restored to defaults]".to_owned())
            }
        }
    }

    async fn confirm_list_edit(&mut self, description: &str, command: &str) -> ActionResult<()> {
        let gate = self.actuator.gate_mut();
        if gate.confirm_command_list_edit(description, command).await? {
            return Ok(());
        }
        Err(ActionError::new(
            ActionErrorCode::PermissionDenied,
            format!("permission denied: {description}"),
        ))
    }

    fn store_mut(&mut self) -> &mut crate::security::PermissionStore {
        self.actuator.gate_mut().store_mut()
    }
}

fn log_chunk(stream: OutputStream, chunk: &str) {
    debug!("{stream:?}: {}", chunk.trim_end());
}

fn store_error(err: anyhow::Error) -> ActionError {
    ActionError::io(format!("failed updating permission settings: {err:#}"))
}
