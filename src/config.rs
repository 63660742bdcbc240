use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::model::GenerationParams;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model_id: default_model_id(),
            temperature: default_temperature(),
            max_output_tokens: default_max_output_tokens(),
            api_key_env: default_api_key_env(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,
    #[serde(default = "default_settings_path")]
    pub settings_path: PathBuf,
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            workspace_root: default_workspace_root(),
            settings_path: default_settings_path(),
            history_limit: default_history_limit(),
        }
    }
}

impl Config {
    /// Reads the file and applies environment overrides. Callers validate
    /// once every override, including the CLI's, is in place.
    pub fn load(path: &Path) -> Result<Self> {
        let mut cfg = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed reading config file {}", path.display()))?;
            toml::from_str::<Config>(&text)
                .with_context(|| format!("failed parsing TOML config {}", path.display()))?
        } else {
            Self::default()
        };
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn apply_cli_overrides(&mut self, workspace: Option<&Path>, model_id: Option<&str>) {
        if let Some(workspace) = workspace {
            self.runtime.workspace_root = workspace.to_path_buf();
        }
        if let Some(model_id) = model_id {
            self.model.model_id = model_id.to_owned();
        }
    }

    /// The settings document location; relative paths are taken from the
    /// workspace root.
    pub fn settings_file(&self) -> PathBuf {
        if self.runtime.settings_path.is_absolute() {
            self.runtime.settings_path.clone()
        } else {
            self.runtime.workspace_root.join(&self.runtime.settings_path)
        }
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            model_id: self.model.model_id.clone(),
            temperature: self.model.temperature,
            max_output_tokens: self.model.max_output_tokens,
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("SHELLMATE_RS_MODEL_BASE_URL") {
            self.model.base_url = v;
        }
        if let Ok(v) = env::var("SHELLMATE_RS_MODEL_ID") {
            self.model.model_id = v;
        }
        if let Ok(v) = env::var("SHELLMATE_RS_MODEL_TEMPERATURE") {
            if let Ok(parsed) = v.trim().parse::<f32>() {
                self.model.temperature = parsed;
            }
        }
        if let Ok(v) = env::var("SHELLMATE_RS_MAX_OUTPUT_TOKENS") {
            if let Ok(parsed) = v.trim().parse::<u32>() {
                self.model.max_output_tokens = parsed;
            }
        }
        if let Ok(v) = env::var("SHELLMATE_RS_API_KEY_ENV") {
            self.model.api_key_env = v;
        }
        if let Ok(v) = env::var("SHELLMATE_RS_MODEL_TIMEOUT_MS") {
            if let Ok(parsed) = v.trim().parse::<u64>() {
                self.model.timeout_ms = parsed;
            }
        }
        if let Ok(v) = env::var("SHELLMATE_RS_WORKSPACE_ROOT") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.runtime.workspace_root = PathBuf::from(trimmed);
            }
        }
        if let Ok(v) = env::var("SHELLMATE_RS_SETTINGS_PATH") {
            let trimmed = v.trim();
            if !trimmed.is_empty() {
                self.runtime.settings_path = PathBuf::from(trimmed);
            }
        }
        if let Ok(v) = env::var("SHELLMATE_RS_HISTORY_LIMIT") {
            if let Ok(parsed) = v.trim().parse::<usize>() {
                self.runtime.history_limit = parsed;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let base_url = Url::parse(self.model.base_url.trim())
            .with_context(|| format!("model.base_url is not a valid URL: {}", self.model.base_url))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            anyhow::bail!("model.base_url must use http or https");
        }
        if self.model.model_id.trim().is_empty() {
            anyhow::bail!("model.model_id must not be empty");
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            anyhow::bail!("model.temperature must be between 0.0 and 2.0");
        }
        if self.model.max_output_tokens == 0 {
            anyhow::bail!("model.max_output_tokens must be > 0");
        }
        if self.model.api_key_env.trim().is_empty() {
            anyhow::bail!("model.api_key_env must not be empty");
        }
        if self.model.timeout_ms == 0 {
            anyhow::bail!("model.timeout_ms must be > 0");
        }
        if self.runtime.history_limit == 0 {
            anyhow::bail!("runtime.history_limit must be > 0");
        }
        if self.runtime.settings_path.as_os_str().is_empty() {
            anyhow::bail!("runtime.settings_path must not be empty");
        }
        Ok(())
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_owned()
}

fn default_model_id() -> String {
    "gpt-4o-mini".to_owned()
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_output_tokens() -> u32 {
    4096
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_owned()
}

fn default_timeout_ms() -> u64 {
    120_000
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_settings_path() -> PathBuf {
    PathBuf::from(".shellmate-rs/settings.json")
}

fn default_history_limit() -> usize {
    40
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::Config;

    #[test]
    fn partial_toml_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
[model]
model_id = "llama3"
base_url = "http://127.0.0.1:11434/v1"
"#,
        )
        .expect("parse");
        assert_eq!(cfg.model.model_id, "llama3");
        assert_eq!(cfg.model.api_key_env, "OPENAI_API_KEY");
        assert_eq!(cfg.model.max_output_tokens, 4096);
        assert_eq!(cfg.runtime.history_limit, 40);
        cfg.validate().expect("valid");
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.model.base_url = "ftp://example.com".to_owned();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.model.temperature = 2.5;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.runtime.history_limit = 0;
        let err = cfg.validate().expect_err("history limit");
        assert!(err.to_string().contains("history_limit"));

        let mut cfg = Config::default();
        cfg.model.api_key_env = "  ".to_owned();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn settings_file_is_relative_to_workspace() {
        let mut cfg = Config::default();
        cfg.apply_cli_overrides(Some(Path::new("/work/project")), Some("gpt-4.1"));
        assert_eq!(
            cfg.settings_file(),
            PathBuf::from("/work/project/.shellmate-rs/settings.json")
        );
        assert_eq!(cfg.generation_params().model_id, "gpt-4.1");

        cfg.runtime.settings_path = PathBuf::from("/etc/shellmate.json");
        assert_eq!(cfg.settings_file(), PathBuf::from("/etc/shellmate.json"));
    }

    #[test]
    fn cli_override_can_repair_an_invalid_file_value() {
        let path = std::env::temp_dir().join(format!(
            "shellmate-rs-config-override-{}.toml",
            std::process::id()
        ));
        std::fs::write(&path, "[model]\nmodel_id = \"\"\n").expect("write config");

        let mut cfg = Config::load(&path).expect("load defers validation");
        assert!(cfg.validate().is_err());
        cfg.apply_cli_overrides(None, Some("gpt-4.1"));
        cfg.validate().expect("valid after override");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let path = std::env::temp_dir().join("shellmate-rs-config-that-does-not-exist.toml");
        let cfg = Config::load(&path).expect("defaults");
        assert!(cfg.model.timeout_ms > 0);
    }
}
