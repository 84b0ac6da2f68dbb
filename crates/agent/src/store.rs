//! Persistence of per-agent configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use proto::{AgentConfig, AgentId, PersistenceError};
use tracing::{debug, info};

/// Storage for the one persisted aggregate per agent.
pub trait PersistenceStore: Send + Sync {
    /// Returns `None` when nothing was stored for `agent`.
    fn load(&self, agent: &AgentId) -> Result<Option<AgentConfig>, PersistenceError>;
    fn save(&self, agent: &AgentId, config: &AgentConfig) -> Result<(), PersistenceError>;
    /// Removing an absent agent is not an error.
    fn delete(&self, agent: &AgentId) -> Result<(), PersistenceError>;
    /// Stored agent ids, sorted.
    fn list(&self) -> Result<Vec<AgentId>, PersistenceError>;
}

/// One pretty-printed `<agent>.json` file per agent in a directory.
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Opens (and creates) the store directory. `~` is expanded to `$HOME`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let dir = expand_home(dir.as_ref());
        std::fs::create_dir_all(&dir)?;
        info!("Agent store opened: {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, agent: &AgentId) -> Result<PathBuf, PersistenceError> {
        validate_agent_id(agent)?;
        Ok(self.dir.join(format!("{}.json", agent.as_str())))
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.to_str() {
        Some(s) if s == "~" || s.starts_with("~/") => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(s.replacen('~', &home, 1))
        }
        _ => path.to_path_buf(),
    }
}

/// Agent ids become file names, so separators and dot-only names are refused.
fn validate_agent_id(agent: &AgentId) -> Result<(), PersistenceError> {
    let id = agent.as_str();
    let invalid = id.trim().is_empty()
        || id.starts_with('.')
        || id.contains(['/', '\\', '\0'])
        || id.contains("..");
    if invalid {
        return Err(PersistenceError::InvalidAgentId(id.to_string()));
    }
    Ok(())
}

impl PersistenceStore for JsonFileStore {
    fn load(&self, agent: &AgentId) -> Result<Option<AgentConfig>, PersistenceError> {
        let path = self.path_for(agent)?;
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let config = serde_json::from_str(&content)
            .map_err(|e| PersistenceError::Serialization(format!("{}: {e}", path.display())))?;
        debug!(agent = %agent, "Loaded agent configuration");
        Ok(Some(config))
    }

    fn save(&self, agent: &AgentId, config: &AgentConfig) -> Result<(), PersistenceError> {
        let path = self.path_for(agent)?;
        let content = serde_json::to_string_pretty(config)
            .map_err(|e| PersistenceError::Serialization(e.to_string()))?;
        // Write-then-rename so a crash never leaves a truncated file behind.
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, &path)?;
        debug!(agent = %agent, "Saved agent configuration");
        Ok(())
    }

    fn delete(&self, agent: &AgentId) -> Result<(), PersistenceError> {
        let path = self.path_for(agent)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<AgentId>, PersistenceError> {
        let mut agents = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                agents.push(AgentId::from(stem));
            }
        }
        agents.sort();
        Ok(agents)
    }
}

/// Process-local store for tests and throwaway sessions.
#[derive(Default)]
pub struct InMemoryStore {
    configs: Mutex<HashMap<AgentId, AgentConfig>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceStore for InMemoryStore {
    fn load(&self, agent: &AgentId) -> Result<Option<AgentConfig>, PersistenceError> {
        Ok(self.configs.lock().get(agent).cloned())
    }

    fn save(&self, agent: &AgentId, config: &AgentConfig) -> Result<(), PersistenceError> {
        self.configs.lock().insert(agent.clone(), config.clone());
        Ok(())
    }

    fn delete(&self, agent: &AgentId) -> Result<(), PersistenceError> {
        self.configs.lock().remove(agent);
        Ok(())
    }

    fn list(&self) -> Result<Vec<AgentId>, PersistenceError> {
        let mut agents: Vec<AgentId> = self.configs.lock().keys().cloned().collect();
        agents.sort();
        Ok(agents)
    }
}
