use std::io::Write;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::signal;
use tracing::{info, warn};

use crate::dispatcher::Dispatcher;
use crate::model::{ChatMessage, ChatRole, GenerationParams, ModelBackend, ProviderError};
use crate::session::{SessionLog, TurnRole};

/// System message sent first on every model call. It is the only place the
/// action token grammar is described to the model.
pub const ACTION_PREAMBLE: &str = "\
You are a coding assistant working inside the user's project directory.
You can act on the filesystem and shell by writing action tokens in your reply.
Each token starts with ACTION:<TYPE>: and every action must be approved by the user.

Single-line actions (the parameter ends at the end of the line):
ACTION:READ_FILE:<path>
ACTION:DELETE_FILE:<path>
ACTION:LIST_FILES:<path>
ACTION:EXEC_COMMAND:<command>
ACTION:EXEC_COMMAND:<command>:WORKDIR:<directory>
ACTION:APPROVE_COMMAND:<command>
ACTION:REMOVE_COMMAND:<command>
ACTION:SHOW_COMMANDS:
ACTION:SHOW_PERMISSIONS:
ACTION:RESET_PERMISSIONS:

Writing a whole file:
ACTION:WRITE_FILE:<path>:CONTENT_START
<file content>
CONTENT_END

Editing part of a file (use PREVIEW_DIFF instead of DIFF_FILE to only show the change):
ACTION:DIFF_FILE:<path>:
<<<<<<< SEARCH
<exact lines currently in the file>
=======
<replacement lines>
>>>>>>> REPLACE

Inserting after existing lines:
ACTION:DIFF_FILE:<path>:
<<<<<<< INSERT_AFTER
<exact anchor lines currently in the file>
=======
<lines to insert>
>>>>>>> INSERT

Search lines must match the file line for line; leading and trailing whitespace is ignored.
Actions run in the order written. Never put the text ACTION: inside a parameter.";

const HELP_TEXT: &str = "\
/help         show this help
/reset        forget the conversation so far
/permissions  show stored permission levels
/commands     show approved commands
/exit         leave the session";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplStep {
    Output(String),
    Skip,
    Exit,
}

pub struct AgentRuntime {
    backend: Box<dyn ModelBackend>,
    dispatcher: Dispatcher,
    session: SessionLog,
    params: GenerationParams,
    history_limit: usize,
}

impl AgentRuntime {
    pub fn new(
        backend: Box<dyn ModelBackend>,
        dispatcher: Dispatcher,
        params: GenerationParams,
        history_limit: usize,
    ) -> Self {
        Self {
            backend,
            dispatcher,
            session: SessionLog::new(),
            params,
            history_limit: history_limit.max(1),
        }
    }

    pub fn session(&self) -> &SessionLog {
        &self.session
    }

    pub fn reset(&mut self) {
        self.session.clear();
    }

    /// One model call, then every action in the reply. A failed model call
    /// records nothing and its error is the turn's only output.
    pub async fn handle_turn(&mut self, input: &str) -> Result<String, ProviderError> {
        let mut messages = Vec::with_capacity(self.history_limit + 1);
        messages.push(ChatMessage::new(ChatRole::System, ACTION_PREAMBLE));
        messages.extend(
            self.session
                .recent(self.history_limit - 1)
                .iter()
                .map(|turn| turn.to_message()),
        );
        messages.push(ChatMessage::new(ChatRole::User, input));

        let reply = self.backend.generate(&messages, &self.params).await?;
        let composed = self.dispatcher.dispatch(&reply).await;

        self.session.push(TurnRole::User, input);
        self.session.push(TurnRole::Assistant, composed.clone());
        info!("turn complete ({} turns in session)", self.session.len());
        Ok(composed)
    }

    pub async fn handle_line(&mut self, line: &str) -> ReplStep {
        let line = line.trim();
        if line.is_empty() {
            return ReplStep::Skip;
        }
        if let Some(command) = line.strip_prefix('/') {
            return self.handle_slash_command(command.trim());
        }
        match self.handle_turn(line).await {
            Ok(reply) => ReplStep::Output(reply),
            Err(err) => {
                warn!("model call failed: {err}");
                ReplStep::Output(format!("error: {err}"))
            }
        }
    }

    fn handle_slash_command(&mut self, command: &str) -> ReplStep {
        let store = self.dispatcher.actuator().gate().store();
        match command {
            "exit" | "quit" => ReplStep::Exit,
            "help" => ReplStep::Output(HELP_TEXT.to_owned()),
            "permissions" => ReplStep::Output(store.render_levels()),
            "commands" => ReplStep::Output(store.render_commands()),
            "reset" => {
                self.reset();
                ReplStep::Output("conversation cleared".to_owned())
            }
            other => ReplStep::Output(format!("unknown command /{other}; try /help")),
        }
    }

    /// Reads lines until end of input, `/exit`, or ctrl-c.
    pub async fn run_repl<R>(&mut self, input: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        println!(
            "shellmate ready in {}. Type /help for commands.",
            self.dispatcher.actuator().workspace_root().display()
        );
        loop {
            print!("> ");
            std::io::stdout().flush().context("failed flushing stdout")?;

            let line = tokio::select! {
                line = lines.next_line() => line.context("failed reading input")?,
                _ = signal::ctrl_c() => {
                    info!("received ctrl-c, shutting down");
                    println!();
                    return Ok(());
                }
            };
            let Some(line) = line else {
                println!();
                return Ok(());
            };
            match self.handle_line(&line).await {
                ReplStep::Output(text) => println!("{text}"),
                ReplStep::Skip => {}
                ReplStep::Exit => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::{AgentRuntime, ReplStep, ACTION_PREAMBLE};
    use crate::actuator::tests::{actuator_with, temp_workspace};
    use crate::dispatcher::Dispatcher;
    use crate::model::{
        ChatMessage, ChatRole, GenerationParams, ModelBackend, ProviderError, ProviderErrorCode,
    };
    use crate::security::gate::tests::ScriptedChooser;
    use crate::security::gate::PermissionChoice;
    use crate::session::TurnRole;

    #[derive(Clone, Default)]
    struct ScriptedBackend {
        replies: Arc<Mutex<VecDeque<Result<String, ProviderError>>>>,
        calls: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<Result<String, ProviderError>>) -> Self {
            Self {
                replies: Arc::new(Mutex::new(replies.into())),
                calls: Arc::default(),
            }
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        async fn generate(
            &self,
            messages: &[ChatMessage],
            _params: &GenerationParams,
        ) -> Result<String, ProviderError> {
            self.calls.lock().expect("calls lock").push(messages.to_vec());
            self.replies
                .lock()
                .expect("replies lock")
                .pop_front()
                .unwrap_or_else(|| Ok("ok".to_owned()))
        }
    }

    fn runtime_with(
        tag: &str,
        backend: ScriptedBackend,
        history_limit: usize,
    ) -> (std::path::PathBuf, AgentRuntime) {
        let root = temp_workspace(tag);
        let actuator = actuator_with(
            root.clone(),
            ScriptedChooser::always(PermissionChoice::Allow),
        );
        let params = GenerationParams {
            model_id: "test".to_owned(),
            temperature: 0.0,
            max_output_tokens: 64,
        };
        let runtime = AgentRuntime::new(
            Box::new(backend),
            Dispatcher::new(actuator),
            params,
            history_limit,
        );
        (root, runtime)
    }

    #[tokio::test]
    async fn turn_sends_preamble_and_records_composed_reply() {
        let backend = ScriptedBackend::new(vec![Ok(
            "Saving.\nACTION:WRITE_FILE:hello.txt:CONTENT_START\nhi\nCONTENT_END".to_owned(),
        )]);
        let (root, mut runtime) = runtime_with("runtime-turn", backend.clone(), 10);

        let reply = runtime.handle_turn("write hello").await.expect("turn");
        assert_eq!(reply, "Saving.\n[wrote 2 bytes to hello.txt]");
        assert_eq!(std::fs::read_to_string(root.join("hello.txt")).expect("read"), "hi");

        let calls = backend.calls.lock().expect("calls").clone();
        assert_eq!(calls[0][0].role, ChatRole::System);
        assert_eq!(calls[0][0].content, ACTION_PREAMBLE);
        assert_eq!(calls[0][1], ChatMessage::new(ChatRole::User, "write hello"));

        let turns = runtime.session().turns();
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].role, TurnRole::Assistant);
        assert_eq!(turns[1].content, reply);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn history_is_limited_to_recent_turns() {
        let backend = ScriptedBackend::default();
        let (root, mut runtime) = runtime_with("runtime-history", backend.clone(), 3);
        for idx in 0..3 {
            runtime.handle_turn(&format!("message {idx}")).await.expect("turn");
        }
        let calls = backend.calls.lock().expect("calls").clone();
        let last = calls.last().expect("last call");
        // preamble + two prior turns + the new message
        assert_eq!(last.len(), 4);
        assert_eq!(last[1].content, "message 1");
        assert_eq!(last[3].content, "message 2");
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn provider_error_is_the_only_output_and_is_not_recorded() {
        let backend = ScriptedBackend::new(vec![Err(ProviderError::new(
            ProviderErrorCode::MissingCredential,
            "environment variable OPENAI_API_KEY is not set",
        ))]);
        let (root, mut runtime) = runtime_with("runtime-error", backend, 10);

        let step = runtime.handle_line("hello").await;
        assert_eq!(
            step,
            ReplStep::Output(
                "error: missing_credential: environment variable OPENAI_API_KEY is not set"
                    .to_owned()
            )
        );
        assert!(runtime.session().is_empty());
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn slash_commands_are_handled_locally() {
        let backend = ScriptedBackend::default();
        let (root, mut runtime) = runtime_with("runtime-slash", backend.clone(), 10);
        runtime.handle_turn("hi").await.expect("turn");

        assert_eq!(runtime.handle_line("   ").await, ReplStep::Skip);
        match runtime.handle_line("/commands").await {
            ReplStep::Output(text) => assert!(text.contains("  - git status")),
            other => panic!("unexpected step: {other:?}"),
        }
        match runtime.handle_line("/permissions").await {
            ReplStep::Output(text) => assert!(text.contains("file_write: prompt")),
            other => panic!("unexpected step: {other:?}"),
        }
        runtime.handle_line("/reset").await;
        assert!(runtime.session().is_empty());
        match runtime.handle_line("/bogus").await {
            ReplStep::Output(text) => assert!(text.contains("/help")),
            other => panic!("unexpected step: {other:?}"),
        }
        assert_eq!(runtime.handle_line("/exit").await, ReplStep::Exit);
        assert_eq!(backend.calls.lock().expect("calls").len(), 1);
        let _ = std::fs::remove_dir_all(root);
    }

    #[tokio::test]
    async fn repl_stops_at_end_of_input() {
        let backend = ScriptedBackend::default();
        let (root, mut runtime) = runtime_with("runtime-repl", backend.clone(), 10);
        let input: &[u8] = b"first\n/reset\nsecond\n";
        runtime.run_repl(input).await.expect("repl");
        assert_eq!(backend.calls.lock().expect("calls").len(), 2);
        assert_eq!(runtime.session().len(), 2);
        let _ = std::fs::remove_dir_all(root);
    }
}
