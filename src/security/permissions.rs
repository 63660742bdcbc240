use std::collections::BTreeMap;

use anyhow::Result;
use serde_json::{json, Value};

use crate::settings::SettingsStore;
use crate::types::{PermissionKind, PermissionLevel};

pub const PERMISSIONS_KEY: &str = "permissions";
pub const APPROVED_COMMANDS_KEY: &str = "approvedCommands";

/// Read-only introspection commands approved out of the box.
pub const DEFAULT_APPROVED_COMMANDS: &[&str] = &[
    "ls",
    "pwd",
    "cat",
    "echo",
    "whoami",
    "date",
    "which",
    "git status",
    "git log",
    "git diff",
    "git branch",
    "node --version",
    "npm --version",
    "npm list",
];

/// Durable per-kind grants plus the approved-command list, stored in the
/// settings document under `permissions` and `approvedCommands`.
pub struct PermissionStore {
    settings: Box<dyn SettingsStore>,
}

impl PermissionStore {
    pub fn new(settings: Box<dyn SettingsStore>) -> Self {
        Self { settings }
    }

    pub fn level(&self, kind: PermissionKind) -> Option<PermissionLevel> {
        self.settings
            .get(&permission_key(kind))
            .and_then(|value| serde_json::from_value::<PermissionLevel>(value).ok())
    }

    pub fn is_granted_forever(&self, kind: PermissionKind) -> bool {
        self.level(kind) == Some(PermissionLevel::AllowForever)
    }

    pub fn is_auto_approve_enabled(&self, kind: PermissionKind) -> bool {
        self.level(kind) == Some(PermissionLevel::AutoApprove)
    }

    pub fn grant_forever(&mut self, kind: PermissionKind) -> Result<()> {
        self.set_level(kind, PermissionLevel::AllowForever)
    }

    pub fn enable_auto_approve(&mut self, kind: PermissionKind) -> Result<()> {
        self.set_level(kind, PermissionLevel::AutoApprove)
    }

    pub fn reset_all(&mut self) -> Result<()> {
        self.settings.set(PERMISSIONS_KEY, json!({}))
    }

    pub fn levels(&self) -> BTreeMap<PermissionKind, PermissionLevel> {
        PermissionKind::ALL
            .into_iter()
            .filter_map(|kind| self.level(kind).map(|level| (kind, level)))
            .collect()
    }

    pub fn approved_commands(&self) -> Vec<String> {
        match self.settings.get(APPROVED_COMMANDS_KEY) {
            Some(Value::Array(items)) => {
                let mut commands: Vec<String> = Vec::with_capacity(items.len());
                for item in items {
                    if let Some(command) = item.as_str().map(str::trim).filter(|c| !c.is_empty()) {
                        if !commands.iter().any(|existing| existing == command) {
                            commands.push(command.to_owned());
                        }
                    }
                }
                commands
            }
            _ => default_commands(),
        }
    }

    /// Returns false when the command was already approved.
    pub fn add_command(&mut self, command: &str) -> Result<bool> {
        let command = command.trim();
        if command.is_empty() {
            anyhow::bail!("command must not be empty");
        }
        let mut commands = self.approved_commands();
        if commands.iter().any(|existing| existing == command) {
            return Ok(false);
        }
        commands.push(command.to_owned());
        self.store_commands(&commands)?;
        Ok(true)
    }

    /// Returns false when the command was not on the list.
    pub fn remove_command(&mut self, command: &str) -> Result<bool> {
        let command = command.trim();
        let mut commands = self.approved_commands();
        let before = commands.len();
        commands.retain(|existing| existing != command);
        if commands.len() == before {
            return Ok(false);
        }
        self.store_commands(&commands)?;
        Ok(true)
    }

    pub fn reset_commands(&mut self) -> Result<()> {
        self.store_commands(&default_commands())
    }

    pub fn render_levels(&self) -> String {
        let mut rendered = String::from("Permissions:");
        for kind in PermissionKind::ALL {
            let level = self.level(kind).map(PermissionLevel::as_str).unwrap_or("prompt");
            rendered.push_str(&format!("\n  {}: {level}", kind.as_str()));
        }
        rendered
    }

    pub fn render_commands(&self) -> String {
        let commands = self.approved_commands();
        if commands.is_empty() {
            return "Approved commands: (none)".to_owned();
        }
        let mut rendered = String::from("Approved commands:");
        for command in commands {
            rendered.push_str(&format!("\n  - {command}"));
        }
        rendered
    }

    fn set_level(&mut self, kind: PermissionKind, level: PermissionLevel) -> Result<()> {
        self.settings
            .set(&permission_key(kind), Value::String(level.as_str().to_owned()))
    }

    fn store_commands(&mut self, commands: &[String]) -> Result<()> {
        self.settings.set(APPROVED_COMMANDS_KEY, json!(commands))
    }
}

fn permission_key(kind: PermissionKind) -> String {
    format!("{PERMISSIONS_KEY}.{}", kind.as_str())
}

fn default_commands() -> Vec<String> {
    DEFAULT_APPROVED_COMMANDS
        .iter()
        .map(|command| (*command).to_owned())
        .collect()
}
