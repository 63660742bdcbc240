use std::ops::Range;

use crate::types::{ActionError, ActionErrorCode, ActionResult};

const TOKEN_PREFIX: &str = "ACTION:";
const CONTENT_START: &str = "CONTENT_START";
const CONTENT_END: &str = "CONTENT_END";
const WORKDIR_MARKER: &str = ":WORKDIR:";
const DIFF_CLOSE_MARKERS: [&str; 2] = [">>>>>>> REPLACE", ">>>>>>> INSERT"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    ReadFile,
    WriteFile,
    DeleteFile,
    ListFiles,
    ExecCommand,
    DiffFile,
    PreviewDiff,
    ApproveCommand,
    RemoveCommand,
    ShowCommands,
    ShowPermissions,
    ResetPermissions,
}

impl ActionKind {
    pub const ALL: [Self; 12] = [
        Self::ReadFile,
        Self::WriteFile,
        Self::DeleteFile,
        Self::ListFiles,
        Self::ExecCommand,
        Self::DiffFile,
        Self::PreviewDiff,
        Self::ApproveCommand,
        Self::RemoveCommand,
        Self::ShowCommands,
        Self::ShowPermissions,
        Self::ResetPermissions,
    ];

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_wire() == name)
    }

    pub fn as_wire(self) -> &'static str {
        match self {
            Self::ReadFile => "READ_FILE",
            Self::WriteFile => "WRITE_FILE",
            Self::DeleteFile => "DELETE_FILE",
            Self::ListFiles => "LIST_FILES",
            Self::ExecCommand => "EXEC_COMMAND",
            Self::DiffFile => "DIFF_FILE",
            Self::PreviewDiff => "PREVIEW_DIFF",
            Self::ApproveCommand => "APPROVE_COMMAND",
            Self::RemoveCommand => "REMOVE_COMMAND",
            Self::ShowCommands => "SHOW_COMMANDS",
            Self::ShowPermissions => "SHOW_PERMISSIONS",
            Self::ResetPermissions => "RESET_PERMISSIONS",
        }
    }
}

/// One `ACTION:<TYPE>:<params>` occurrence in model output. `span` is the
/// byte range of the whole token in the source text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    pub type_name: String,
    pub kind: Option<ActionKind>,
    pub raw_params: String,
    pub span: Range<usize>,
}

/// Typed form of an [`ActionRequest`] after its parameter grammar is parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    ReadFile { path: String },
    WriteFile { path: String, content: String },
    DeleteFile { path: String },
    ListFiles { path: String },
    ExecCommand { command: String, cwd: Option<String> },
    DiffFile { path: String, diff: String },
    PreviewDiff { path: String, diff: String },
    ApproveCommand { command: String },
    RemoveCommand { command: String },
    ShowCommands,
    ShowPermissions,
    ResetPermissions,
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::ReadFile { .. } => ActionKind::ReadFile,
            Self::WriteFile { .. } => ActionKind::WriteFile,
            Self::DeleteFile { .. } => ActionKind::DeleteFile,
            Self::ListFiles { .. } => ActionKind::ListFiles,
            Self::ExecCommand { .. } => ActionKind::ExecCommand,
            Self::DiffFile { .. } => ActionKind::DiffFile,
            Self::PreviewDiff { .. } => ActionKind::PreviewDiff,
            Self::ApproveCommand { .. } => ActionKind::ApproveCommand,
            Self::RemoveCommand { .. } => ActionKind::RemoveCommand,
            Self::ShowCommands => ActionKind::ShowCommands,
            Self::ShowPermissions => ActionKind::ShowPermissions,
            Self::ResetPermissions => ActionKind::ResetPermissions,
        }
    }

    pub fn from_request(request: &ActionRequest) -> ActionResult<Self> {
        let Some(kind) = request.kind else {
            return Err(ActionError::new(
                ActionErrorCode::UnknownActionType,
                format!("unknown action type `{}`", request.type_name),
            ));
        };
        let params = request.raw_params.as_str();
        let action = match kind {
            ActionKind::ReadFile => Self::ReadFile {
                path: required(params, "path")?,
            },
            ActionKind::WriteFile => {
                let (path, content) = parse_write_params(params)?;
                Self::WriteFile { path, content }
            }
            ActionKind::DeleteFile => Self::DeleteFile {
                path: required(params, "path")?,
            },
            ActionKind::ListFiles => Self::ListFiles {
                path: if params.trim().is_empty() {
                    ".".to_owned()
                } else {
                    params.trim().to_owned()
                },
            },
            ActionKind::ExecCommand => {
                let (command, cwd) = match params.split_once(WORKDIR_MARKER) {
                    Some((command, cwd)) => (command, Some(cwd.trim()).filter(|c| !c.is_empty())),
                    None => (params, None),
                };
                Self::ExecCommand {
                    command: required(command, "command")?,
                    cwd: cwd.map(ToOwned::to_owned),
                }
            }
            ActionKind::DiffFile => {
                let (path, diff) = parse_diff_params(params)?;
                Self::DiffFile { path, diff }
            }
            ActionKind::PreviewDiff => {
                let (path, diff) = parse_diff_params(params)?;
                Self::PreviewDiff { path, diff }
            }
            ActionKind::ApproveCommand => Self::ApproveCommand {
                command: required(params, "command")?,
            },
            ActionKind::RemoveCommand => Self::RemoveCommand {
                command: required(params, "command")?,
            },
            ActionKind::ShowCommands => Self::ShowCommands,
            ActionKind::ShowPermissions => Self::ShowPermissions,
            ActionKind::ResetPermissions => Self::ResetPermissions,
        };
        Ok(action)
    }
}

fn required(raw: &str, field: &str) -> ActionResult<String> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ActionError::malformed(format!("{field} must be a non-empty string")));
    }
    Ok(value.to_owned())
}

/// `<path>:CONTENT_START\n<content>\nCONTENT_END`
fn parse_write_params(params: &str) -> ActionResult<(String, String)> {
    let Some((path, body)) = params.split_once(&format!(":{CONTENT_START}")) else {
        return Err(ActionError::malformed(format!(
            "WRITE_FILE requires `<path>:{CONTENT_START}`"
        )));
    };
    let path = required(path, "path")?;
    let body = body
        .strip_prefix("\r\n")
        .or_else(|| body.strip_prefix('\n'))
        .unwrap_or(body);
    let Some(end) = body.find(CONTENT_END) else {
        return Err(ActionError::malformed(format!(
            "WRITE_FILE content for {path} is missing {CONTENT_END}"
        )));
    };
    let content = &body[..end];
    let content = content
        .strip_suffix("\r\n")
        .or_else(|| content.strip_suffix('\n'))
        .unwrap_or(content);
    Ok((path, content.to_owned()))
}

/// `<path>:<diff>`, split at the first colon.
fn parse_diff_params(params: &str) -> ActionResult<(String, String)> {
    let Some((path, diff)) = params.split_once(':') else {
        return Err(ActionError::malformed("diff action requires `<path>:<diff>`"));
    };
    let path = required(path, "path")?;
    if diff.trim().is_empty() {
        return Err(ActionError::malformed(format!("diff for {path} is empty")));
    }
    Ok((path, diff.to_owned()))
}

/// A token header is `ACTION:` + `[A-Z_]+` + `:`. Returns the type name and
/// the byte offset where the payload begins.
fn token_header(text: &str, at: usize) -> Option<(&str, usize)> {
    let after_prefix = at + TOKEN_PREFIX.len();
    let rest = text.get(after_prefix..)?;
    let name_len = rest
        .bytes()
        .take_while(|byte| byte.is_ascii_uppercase() || *byte == b'_')
        .count();
    if name_len == 0 || rest.as_bytes().get(name_len) != Some(&b':') {
        return None;
    }
    Some((&rest[..name_len], after_prefix + name_len + 1))
}

/// Byte offset of the next well-formed token header at or after `from`, or
/// the end of `text`. This is the outer bound of any payload.
pub fn next_action_boundary(text: &str, from: usize) -> usize {
    let mut cursor = from;
    while let Some(found) = text.get(cursor..).and_then(|rest| rest.find(TOKEN_PREFIX)) {
        let at = cursor + found;
        if token_header(text, at).is_some() {
            return at;
        }
        cursor = at + TOKEN_PREFIX.len();
    }
    text.len()
}

/// Shrinks a payload to the part its kind owns so trailing prose after a
/// single-line or closed multi-line payload is kept in the reply.
fn narrow_payload(kind: Option<ActionKind>, payload: &str) -> usize {
    match kind {
        Some(ActionKind::WriteFile) => payload
            .find(CONTENT_END)
            .map(|idx| idx + CONTENT_END.len())
            .unwrap_or(payload.len()),
        Some(ActionKind::DiffFile | ActionKind::PreviewDiff) => {
            let mut end = None;
            let mut offset = 0usize;
            for line in payload.split_inclusive('\n') {
                let trimmed = line.trim();
                if DIFF_CLOSE_MARKERS.contains(&trimmed) {
                    end = Some(offset + line.trim_end().len());
                }
                offset += line.len();
            }
            end.unwrap_or(payload.len())
        }
        _ => payload.find('\n').unwrap_or(payload.len()),
    }
}

/// Extracts every action token in left-to-right order.
pub fn parse_actions(text: &str) -> Vec<ActionRequest> {
    let mut requests = Vec::new();
    let mut cursor = next_action_boundary(text, 0);
    while cursor < text.len() {
        let Some((type_name, payload_start)) = token_header(text, cursor) else {
            break;
        };
        let outer_end = next_action_boundary(text, payload_start);
        let kind = ActionKind::from_wire(type_name);
        let payload = &text[payload_start..outer_end];
        let end = payload_start + narrow_payload(kind, payload);

        requests.push(ActionRequest {
            type_name: type_name.to_owned(),
            kind,
            raw_params: text[payload_start..end].trim().to_owned(),
            span: cursor..end,
        });
        cursor = outer_end;
    }
    requests
}

#[cfg(test)]
mod tests {
    use super::{next_action_boundary, parse_actions, Action, ActionKind};
    use crate::types::ActionErrorCode;

    #[test]
    fn extracts_two_single_line_tokens_in_order() {
        let text = "Let me look.\nACTION:READ_FILE:a.txt\nACTION:LIST_FILES:.";
        let requests = parse_actions(text);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].type_name, "READ_FILE");
        assert_eq!(requests[0].raw_params, "a.txt");
        assert_eq!(requests[1].kind, Some(ActionKind::ListFiles));
        assert_eq!(requests[1].raw_params, ".");
        assert_eq!(&text[requests[0].span.clone()], "ACTION:READ_FILE:a.txt");
    }

    #[test]
    fn single_line_payload_leaves_following_prose_alone() {
        let text = "ACTION:READ_FILE:  notes.md  \nThat file should explain it.";
        let requests = parse_actions(text);
        assert_eq!(requests[0].raw_params, "notes.md");
        assert_eq!(&text[requests[0].span.end..], "\nThat file should explain it.");
    }

    #[test]
    fn boundary_ignores_prose_that_is_not_a_token() {
        let text = "ACTION: is how you ask. ACTION:lower:x ACTION:SHOW_COMMANDS:";
        assert_eq!(next_action_boundary(text, 0), text.rfind("ACTION:").unwrap_or(0));
        let requests = parse_actions(text);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].kind, Some(ActionKind::ShowCommands));
        assert_eq!(requests[0].raw_params, "");
    }

    #[test]
    fn write_file_payload_spans_lines_until_content_end() {
        let text = "Creating it now.\n\
ACTION:WRITE_FILE:src/app.js:CONTENT_START\nconst a = 1;\n\nmodule.exports = a;\nCONTENT_END\nDone.";
        let requests = parse_actions(text);
        assert_eq!(requests.len(), 1);
        assert!(text[requests[0].span.end..].starts_with("\nDone."));

        let action = Action::from_request(&requests[0]).expect("write params");
        assert_eq!(
            action,
            Action::WriteFile {
                path: "src/app.js".to_owned(),
                content: "const a = 1;\n\nmodule.exports = a;".to_owned(),
            }
        );
    }

    #[test]
    fn write_file_without_content_end_is_malformed() {
        let requests = parse_actions("ACTION:WRITE_FILE:a.txt:CONTENT_START\nhello\n");
        let err = Action::from_request(&requests[0]).expect_err("missing end marker");
        assert_eq!(err.code, ActionErrorCode::MalformedParams);

        let requests = parse_actions("ACTION:WRITE_FILE:a.txt\nhello\nCONTENT_END");
        let err = Action::from_request(&requests[0]).expect_err("missing start marker");
        assert_eq!(err.code, ActionErrorCode::MalformedParams);
    }

    #[test]
    fn next_token_terminates_multiline_payload() {
        let text = "ACTION:WRITE_FILE:a.txt:CONTENT_START\nhello\nACTION:READ_FILE:a.txt";
        let requests = parse_actions(text);
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].raw_params, "a.txt:CONTENT_START\nhello");
        assert_eq!(requests[1].raw_params, "a.txt");
    }

    #[test]
    fn diff_payload_ends_after_last_close_marker() {
        let text = "ACTION:DIFF_FILE:lib.js:\n<<<<<<< SEARCH\nfoo()\n=======\nfoo(x)\n>>>>>>> REPLACE\nPatched.";
        let requests = parse_actions(text);
        assert!(requests[0].raw_params.ends_with(">>>>>>> REPLACE"));
        assert_eq!(&text[requests[0].span.end..], "\nPatched.");

        match Action::from_request(&requests[0]).expect("diff params") {
            Action::DiffFile { path, diff } => {
                assert_eq!(path, "lib.js");
                assert!(diff.contains("<<<<<<< SEARCH"));
            }
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn exec_command_workdir_suffix() {
        let requests = parse_actions("ACTION:EXEC_COMMAND:npm test:WORKDIR:packages/web");
        assert_eq!(
            Action::from_request(&requests[0]).expect("exec"),
            Action::ExecCommand {
                command: "npm test".to_owned(),
                cwd: Some("packages/web".to_owned()),
            }
        );

        let requests = parse_actions("ACTION:EXEC_COMMAND:git status");
        assert_eq!(
            Action::from_request(&requests[0]).expect("exec"),
            Action::ExecCommand {
                command: "git status".to_owned(),
                cwd: None,
            }
        );
    }

    #[test]
    fn unknown_type_is_reported_not_dropped() {
        let requests = parse_actions("ACTION:FORMAT_DISK:/dev/sda");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].kind, None);
        let err = Action::from_request(&requests[0]).expect_err("unknown");
        assert_eq!(err.code, ActionErrorCode::UnknownActionType);
        assert!(err.message.contains("FORMAT_DISK"));
    }

    #[test]
    fn empty_paths_are_malformed_and_list_defaults_to_cwd() {
        let requests = parse_actions("ACTION:READ_FILE:   \nACTION:LIST_FILES:");
        let err = Action::from_request(&requests[0]).expect_err("empty path");
        assert_eq!(err.code, ActionErrorCode::MalformedParams);
        assert_eq!(
            Action::from_request(&requests[1]).expect("list"),
            Action::ListFiles {
                path: ".".to_owned()
            }
        );
    }

    #[test]
    fn wire_names_round_trip_for_every_kind() {
        for kind in ActionKind::ALL {
            assert_eq!(ActionKind::from_wire(kind.as_wire()), Some(kind));
        }
        assert_eq!(ActionKind::from_wire("READ"), None);
    }
}
