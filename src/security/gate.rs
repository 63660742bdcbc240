use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, info};

use crate::security::command_matcher::is_approved;
use crate::security::permissions::PermissionStore;
use crate::types::{ActionError, ActionResult, PermissionKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionChoice {
    Allow,
    Disallow,
    AllowForever,
    AutoApprove,
    ApproveCommand,
}

impl PermissionChoice {
    pub fn label(self) -> &'static str {
        match self {
            Self::Allow => "Allow once",
            Self::Disallow => "Disallow",
            Self::AllowForever => "Allow forever for this action type",
            Self::AutoApprove => "Auto-approve approved commands from now on",
            Self::ApproveCommand => "Approve this command and allow",
        }
    }
}

/// What the interactive chooser is shown for one pending action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionPrompt {
    pub kind: PermissionKind,
    pub description: String,
    pub command: Option<String>,
    pub command_approved: Option<bool>,
    pub choices: Vec<PermissionChoice>,
}

/// Interactive capability the gate asks when no durable setting decides.
/// `Ok(None)` means the prompt was cancelled.
#[async_trait]
pub trait PermissionChooser: Send + Sync {
    async fn choose(&self, prompt: &PermissionPrompt) -> Result<Option<PermissionChoice>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationOutcome {
    Granted,
    AutoApproved,
    UserAllowed(PermissionChoice),
    Denied,
}

impl AuthorizationOutcome {
    pub fn is_allowed(self) -> bool {
        !matches!(self, Self::Denied)
    }
}

pub struct AuthorizationGate {
    store: PermissionStore,
    chooser: Box<dyn PermissionChooser>,
}

impl AuthorizationGate {
    pub fn new(store: PermissionStore, chooser: Box<dyn PermissionChooser>) -> Self {
        Self { store, chooser }
    }

    pub fn store(&self) -> &PermissionStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut PermissionStore {
        &mut self.store
    }

    pub async fn authorize(
        &mut self,
        kind: PermissionKind,
        description: &str,
        command: Option<&str>,
    ) -> ActionResult<bool> {
        Ok(self.decide(kind, description, command).await?.is_allowed())
    }

    /// Asks the user before a model reply edits the approved command list.
    /// Forever grants and auto-approve never answer this prompt, and only a
    /// plain allow lets the edit through.
    pub async fn confirm_command_list_edit(
        &mut self,
        description: &str,
        command: &str,
    ) -> ActionResult<bool> {
        let command = command.trim();
        let prompt = PermissionPrompt {
            kind: PermissionKind::CommandExec,
            description: description.to_owned(),
            command: Some(command.to_owned()),
            command_approved: Some(is_approved(command, &self.store.approved_commands())),
            choices: vec![PermissionChoice::Allow, PermissionChoice::Disallow],
        };
        let choice = self
            .chooser
            .choose(&prompt)
            .await
            .map_err(|err| ActionError::io(format!("permission prompt failed: {err:#}")))?;
        let allowed = choice == Some(PermissionChoice::Allow);
        info!(
            "command list edit {}: {description}",
            if allowed { "allowed" } else { "denied" }
        );
        Ok(allowed)
    }

    /// Runs the gate state machine. Durable side effects of the user's
    /// choice are persisted before this returns.
    pub async fn decide(
        &mut self,
        kind: PermissionKind,
        description: &str,
        command: Option<&str>,
    ) -> ActionResult<AuthorizationOutcome> {
        if self.store.is_granted_forever(kind) {
            debug!("{} allowed by forever grant: {description}", kind.as_str());
            return Ok(AuthorizationOutcome::Granted);
        }

        let command = if kind == PermissionKind::CommandExec {
            command.map(str::trim).filter(|c| !c.is_empty())
        } else {
            None
        };
        let command_approved =
            command.map(|command| is_approved(command, &self.store.approved_commands()));

        if command_approved == Some(true) && self.store.is_auto_approve_enabled(kind) {
            debug!("{} auto-approved: {description}", kind.as_str());
            return Ok(AuthorizationOutcome::AutoApproved);
        }

        let mut choices = vec![
            PermissionChoice::Allow,
            PermissionChoice::Disallow,
            PermissionChoice::AllowForever,
            PermissionChoice::AutoApprove,
        ];
        if command.is_some() {
            choices.push(PermissionChoice::ApproveCommand);
        }
        let prompt = PermissionPrompt {
            kind,
            description: description.to_owned(),
            command: command.map(ToOwned::to_owned),
            command_approved,
            choices,
        };

        let choice = self
            .chooser
            .choose(&prompt)
            .await
            .map_err(|err| ActionError::io(format!("permission prompt failed: {err:#}")))?;

        let outcome = match choice {
            Some(PermissionChoice::AllowForever) => {
                self.store.grant_forever(kind).map_err(persist_error)?;
                AuthorizationOutcome::UserAllowed(PermissionChoice::AllowForever)
            }
            Some(PermissionChoice::AutoApprove) => {
                self.store.enable_auto_approve(kind).map_err(persist_error)?;
                AuthorizationOutcome::UserAllowed(PermissionChoice::AutoApprove)
            }
            Some(PermissionChoice::ApproveCommand) => match command {
                Some(command) => {
                    self.store.add_command(command).map_err(persist_error)?;
                    AuthorizationOutcome::UserAllowed(PermissionChoice::ApproveCommand)
                }
                None => AuthorizationOutcome::Denied,
            },
            Some(PermissionChoice::Allow) => {
                AuthorizationOutcome::UserAllowed(PermissionChoice::Allow)
            }
            Some(PermissionChoice::Disallow) | None => AuthorizationOutcome::Denied,
        };
        info!(
            "{} {}: {description}",
            kind.as_str(),
            if outcome.is_allowed() { "allowed" } else { "denied" }
        );
        Ok(outcome)
    }
}

fn persist_error(err: anyhow::Error) -> ActionError {
    ActionError::io(format!("failed persisting permission settings: {err:#}"))
}
