use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionErrorCode {
    PermissionDenied,
    MalformedParams,
    PatternNotFound,
    Io,
    ExecutionFailed,
    Timeout,
    NonZeroExit,
    UnknownActionType,
}

impl ActionErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PermissionDenied => "permission_denied",
            Self::MalformedParams => "malformed_params",
            Self::PatternNotFound => "pattern_not_found",
            Self::Io => "io_error",
            Self::ExecutionFailed => "execution_failed",
            Self::Timeout => "timeout",
            Self::NonZeroExit => "non_zero_exit",
            Self::UnknownActionType => "unknown_action_type",
        }
    }
}

/// Failure of a single action. Always reported inline next to the action
/// token; never aborts sibling actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionError {
    pub code: ActionErrorCode,
    pub message: String,
}

impl ActionError {
    pub fn new(code: ActionErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ActionErrorCode::MalformedParams, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ActionErrorCode::Io, message)
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for ActionError {}

pub type ActionResult<T> = Result<T, ActionError>;

/// Action families that carry their own durable permission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionKind {
    FileRead,
    FileWrite,
    FileDelete,
    CommandExec,
}

impl PermissionKind {
    pub const ALL: [PermissionKind; 4] = [
        PermissionKind::FileRead,
        PermissionKind::FileWrite,
        PermissionKind::FileDelete,
        PermissionKind::CommandExec,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileRead => "file_read",
            Self::FileWrite => "file_write",
            Self::FileDelete => "file_delete",
            Self::CommandExec => "command_exec",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    AllowForever,
    AutoApprove,
}

impl PermissionLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllowForever => "allow_forever",
            Self::AutoApprove => "auto_approve",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[cfg(test)]
mod tests {
    use super::{ActionError, ActionErrorCode, PermissionKind, PermissionLevel};

    #[test]
    fn permission_kind_serializes_as_snake_case() {
        let encoded = serde_json::to_string(&PermissionKind::CommandExec).expect("encode");
        assert_eq!(encoded, "\"command_exec\"");
        let level: PermissionLevel = serde_json::from_str("\"auto_approve\"").expect("decode");
        assert_eq!(level, PermissionLevel::AutoApprove);
    }

    #[test]
    fn action_error_display_includes_code() {
        let err = ActionError::new(ActionErrorCode::Timeout, "killed after 30s");
        assert_eq!(err.to_string(), "timeout: killed after 30s");
    }
}
