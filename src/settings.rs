use std::path::PathBuf;

use anyhow::{Context, Result};
use serde_json::{Map, Value};

/// Key-value settings document. Keys are dotted paths into a JSON object,
/// e.g. `permissions.command_exec`.
pub trait SettingsStore: Send {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&mut self, key: &str, value: Value) -> Result<()>;
    fn remove(&mut self, key: &str) -> Result<()>;
    fn merge(&mut self, patch: Value) -> Result<()>;
}

/// Whole-document JSON store. Every mutation rewrites the file through a
/// temp file + rename. `in_memory()` stores never touch disk.
#[derive(Debug, Clone)]
pub struct JsonSettingsStore {
    path: Option<PathBuf>,
    document: Value,
}

impl JsonSettingsStore {
    pub fn load(path: PathBuf) -> Result<Self> {
        let document = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed reading settings {}", path.display()))?;
            if text.trim().is_empty() {
                Value::Object(Map::new())
            } else {
                serde_json::from_str::<Value>(&text)
                    .with_context(|| format!("failed parsing settings {}", path.display()))?
            }
        } else {
            Value::Object(Map::new())
        };
        if !document.is_object() {
            anyhow::bail!("settings document {} must be a JSON object", path.display());
        }
        Ok(Self {
            path: Some(path),
            document,
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            document: Value::Object(Map::new()),
        }
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed creating {}", parent.display()))?;
        }
        let snapshot = serde_json::to_vec_pretty(&self.document)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, snapshot)
            .with_context(|| format!("failed writing settings {}", tmp.display()))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed replacing settings {}", path.display()))?;
        Ok(())
    }
}

impl SettingsStore for JsonSettingsStore {
    fn get(&self, key: &str) -> Option<Value> {
        let mut cursor = &self.document;
        for segment in split_key(key) {
            cursor = cursor.as_object()?.get(segment)?;
        }
        Some(cursor.clone())
    }

    fn set(&mut self, key: &str, value: Value) -> Result<()> {
        let segments = split_key(key).collect::<Vec<_>>();
        let Some((last, parents)) = segments.split_last() else {
            anyhow::bail!("settings key must not be empty");
        };
        let mut cursor = &mut self.document;
        for segment in parents {
            let object = ensure_object(cursor);
            cursor = object
                .entry((*segment).to_owned())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        ensure_object(cursor).insert((*last).to_owned(), value);
        self.persist()
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        let segments = split_key(key).collect::<Vec<_>>();
        let Some((last, parents)) = segments.split_last() else {
            return Ok(());
        };
        let mut cursor = &mut self.document;
        for segment in parents {
            match cursor.as_object_mut().and_then(|obj| obj.get_mut(*segment)) {
                Some(next) => cursor = next,
                None => return Ok(()),
            }
        }
        if let Some(object) = cursor.as_object_mut() {
            object.remove(*last);
        }
        self.persist()
    }

    fn merge(&mut self, patch: Value) -> Result<()> {
        if !patch.is_object() {
            anyhow::bail!("settings merge patch must be a JSON object");
        }
        deep_merge(&mut self.document, patch);
        self.persist()
    }
}

fn split_key(key: &str) -> impl Iterator<Item = &str> {
    key.split('.').map(str::trim).filter(|s| !s.is_empty())
}

fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

fn deep_merge(target: &mut Value, patch: Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                match target_map.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => {
                        deep_merge(existing, value);
                    }
                    _ => {
                        target_map.insert(key, value);
                    }
                }
            }
        }
        (target, patch) => *target = patch,
    }
}
