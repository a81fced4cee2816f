/// Container definitions and their persistence
use crate::types::{Result, WasmrtError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Declarative recipe for running one module
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ContainerDefinition {
    /// Unique identifier chosen by the caller
    pub id: String,
    /// Path to the module binary, read fresh on every start
    #[serde(rename = "module")]
    pub module_path: PathBuf,
    /// Arguments handed to the module as argv, in order
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables visible to the module
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(rename = "created")]
    pub created_at: DateTime<Utc>,
}

impl ContainerDefinition {
    pub fn new(id: impl Into<String>, module_path: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            module_path: module_path.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Check the invariants the store and the engine rely on
    pub fn validate(&self) -> Result<()> {
        validate_id(&self.id)?;

        if self.module_path.as_os_str().is_empty() {
            return Err(WasmrtError::Config("module path must not be empty".to_string()));
        }

        for key in self.env.keys() {
            if key.is_empty() {
                return Err(WasmrtError::Config("environment variable name must not be empty".to_string()));
            }
            if key.contains('=') {
                return Err(WasmrtError::Config(format!(
                    "environment variable name must not contain '=': {}",
                    key
                )));
            }
        }

        Ok(())
    }
}

/// Ids double as record file names
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(WasmrtError::Config("container id must not be empty".to_string()));
    }
    if id == "." || id == ".." || id.contains('/') || id.contains('\\') || id.contains('\0') {
        return Err(WasmrtError::Config(format!("invalid container id: {:?}", id)));
    }
    Ok(())
}

/// Persistence for container definitions
pub trait DefinitionStore {
    /// Record a new definition; fails if the id is already taken
    fn create(&self, definition: &ContainerDefinition) -> Result<()>;

    /// Fetch a definition; absent or unreadable records are `NotFound`
    fn load(&self, id: &str) -> Result<ContainerDefinition>;

    fn delete(&self, id: &str) -> Result<()>;

    /// Ids of all stored definitions, sorted
    fn list(&self) -> Result<Vec<String>>;
}

/// Directory-backed store holding one `<id>.json` record per definition
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }
}

impl DefinitionStore for FileStore {
    fn create(&self, definition: &ContainerDefinition) -> Result<()> {
        definition.validate()?;
        fs::create_dir_all(&self.root)?;

        let content = serde_json::to_string_pretty(definition)?;
        let path = self.record_path(&definition.id);

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(WasmrtError::AlreadyExists(definition.id.clone()));
            }
            Err(e) => return Err(WasmrtError::Io(e)),
        };

        if let Err(e) = file.write_all(content.as_bytes()) {
            // Do not leave a half-written record behind
            let _ = fs::remove_file(&path);
            return Err(WasmrtError::Io(e));
        }

        log::info!("Recorded container {} at {}", definition.id, path.display());
        Ok(())
    }

    fn load(&self, id: &str) -> Result<ContainerDefinition> {
        validate_id(id)?;
        let path = self.record_path(id);

        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(WasmrtError::NotFound(id.to_string()));
            }
            Err(e) => return Err(WasmrtError::Io(e)),
        };

        serde_json::from_str(&content)
            .map_err(|e| WasmrtError::NotFound(format!("{} (corrupt record: {})", id, e)))
    }

    fn delete(&self, id: &str) -> Result<()> {
        validate_id(id)?;
        let path = self.record_path(id);

        match fs::remove_file(&path) {
            Ok(()) => {
                log::info!("Removed container {}", id);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(WasmrtError::NotFound(id.to_string())),
            Err(e) => Err(WasmrtError::Io(e)),
        }
    }

    fn list(&self) -> Result<Vec<String>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// In-process store, mostly for tests and embedding
#[derive(Default)]
pub struct MemoryStore {
    definitions: Mutex<HashMap<String, ContainerDefinition>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn definitions(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, ContainerDefinition>>> {
        self.definitions
            .lock()
            .map_err(|_| WasmrtError::Config("definition store lock poisoned".to_string()))
    }
}

impl DefinitionStore for MemoryStore {
    fn create(&self, definition: &ContainerDefinition) -> Result<()> {
        definition.validate()?;
        let mut definitions = self.definitions()?;
        if definitions.contains_key(&definition.id) {
            return Err(WasmrtError::AlreadyExists(definition.id.clone()));
        }
        definitions.insert(definition.id.clone(), definition.clone());
        Ok(())
    }

    fn load(&self, id: &str) -> Result<ContainerDefinition> {
        self.definitions()?
            .get(id)
            .cloned()
            .ok_or_else(|| WasmrtError::NotFound(id.to_string()))
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.definitions()?
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| WasmrtError::NotFound(id.to_string()))
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.definitions()?.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}
