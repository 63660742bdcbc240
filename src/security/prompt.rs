use anyhow::{Context, Result};
use async_trait::async_trait;
use dialoguer::Select;

use crate::security::gate::{PermissionChoice, PermissionChooser, PermissionPrompt};

/// Asks on the controlling terminal with a dialoguer select list. Escape or
/// `q` cancels, which the gate treats as a denial.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalChooser;

#[async_trait]
impl PermissionChooser for TerminalChooser {
    async fn choose(&self, prompt: &PermissionPrompt) -> Result<Option<PermissionChoice>> {
        let heading = render_heading(prompt);
        let choices = prompt.choices.clone();
        let labels = choices
            .iter()
            .map(|choice| choice.label().to_owned())
            .collect::<Vec<_>>();

        let picked = tokio::task::spawn_blocking(move || {
            eprintln!("{heading}");
            Select::new()
                .with_prompt("Permission required")
                .items(&labels)
                .default(0)
                .interact_opt()
        })
        .await
        .context("permission prompt task failed")?
        .context("permission prompt failed")?;

        Ok(picked.and_then(|index| choices.get(index).copied()))
    }
}

fn render_heading(prompt: &PermissionPrompt) -> String {
    let mut heading = format!("\n[{}] {}", prompt.kind.as_str(), prompt.description);
    if let Some(command) = prompt.command.as_deref() {
        let status = match prompt.command_approved {
            Some(true) => "on the approved list",
            _ => "not on the approved list",
        };
        heading.push_str(&format!("\n  command: {command} ({status})"));
    }
    heading
}
