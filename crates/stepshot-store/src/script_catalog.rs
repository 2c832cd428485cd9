use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

use stepshot_types::{
    example_script_document, parse_script_document, Script, ScriptDocumentError,
};

/// Errors returned by the script catalog.
#[derive(Debug, Error)]
pub enum ScriptCatalogError {
    #[error("script name cannot be empty")]
    EmptyName,
    #[error("script '{0}' not found")]
    ScriptNotFound(String),
    #[error(transparent)]
    InvalidContent(#[from] ScriptDocumentError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Non-durable catalog of script definitions.
#[derive(Debug, Default)]
pub struct InMemoryScriptCatalog {
    scripts: RwLock<HashMap<String, Script>>,
    id_counter: AtomicU64,
}

impl InMemoryScriptCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_script_id(&self) -> String {
        let now_ms = Utc::now().timestamp_millis().max(0);
        let suffix = self.id_counter.fetch_add(1, Ordering::Relaxed) + 1;
        format!("script-{now_ms}-{suffix:04}")
    }

    /// Stores a new script after checking that its content has a steps array.
    pub fn create(&self, name: &str, content: &str) -> Result<Script, ScriptCatalogError> {
        validate_script_input(name, content)?;

        let mut scripts = self.scripts.write().unwrap_or_else(PoisonError::into_inner);
        let mut id = self.next_script_id();
        while scripts.contains_key(&id) {
            id = self.next_script_id();
        }
        let now = Utc::now();
        let script = Script {
            id: id.clone(),
            name: name.trim().to_string(),
            content: content.to_string(),
            version: 1,
            created_at: now,
            updated_at: now,
        };
        scripts.insert(id, script.clone());
        Ok(script)
    }

    pub fn get(&self, script_id: &str) -> Option<Script> {
        let scripts = self.scripts.read().unwrap_or_else(PoisonError::into_inner);
        scripts.get(script_id).cloned()
    }

    pub fn list(&self) -> Vec<Script> {
        let scripts = self.scripts.read().unwrap_or_else(PoisonError::into_inner);
        let mut rows: Vec<Script> = scripts.values().cloned().collect();
        rows.sort_by(|left, right| {
            left.created_at
                .cmp(&right.created_at)
                .then_with(|| left.id.cmp(&right.id))
        });
        rows
    }

    /// Replaces name and content, bumping the version.
    pub fn update(
        &self,
        script_id: &str,
        name: &str,
        content: &str,
    ) -> Result<Script, ScriptCatalogError> {
        validate_script_input(name, content)?;

        let mut scripts = self.scripts.write().unwrap_or_else(PoisonError::into_inner);
        let script = scripts
            .get_mut(script_id)
            .ok_or_else(|| ScriptCatalogError::ScriptNotFound(script_id.to_string()))?;
        script.name = name.trim().to_string();
        script.content = content.to_string();
        script.version = script.version.saturating_add(1);
        script.updated_at = Utc::now();
        Ok(script.clone())
    }

    pub fn delete(&self, script_id: &str) -> bool {
        let mut scripts = self.scripts.write().unwrap_or_else(PoisonError::into_inner);
        scripts.remove(script_id).is_some()
    }

    /// Inserts the example login script when the catalog is empty.
    pub fn seed_example(&self) -> Result<Option<Script>, ScriptCatalogError> {
        if !self
            .scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
        {
            return Ok(None);
        }
        let content = serde_json::to_string_pretty(&example_script_document())?;
        self.create("Example Script", &content).map(Some)
    }
}

fn validate_script_input(name: &str, content: &str) -> Result<(), ScriptCatalogError> {
    if name.trim().is_empty() {
        return Err(ScriptCatalogError::EmptyName);
    }
    parse_script_document(content)?;
    Ok(())
}
