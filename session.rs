//! Session registry (§3, §5)
//!
//! Maps `(worktree, persona, provider) -> opaque session handle`, persisted
//! as one JSON file per worktree so a retry after a crash resumes the same
//! provider-side conversation instead of starting cold. Cleared wholesale
//! when the bound provider changes (§5), since a session handle from one
//! provider means nothing to another.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to read session file at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse session file at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeSessions {
    pub persona_sessions: HashMap<String, String>,
    pub provider: String,
    pub updated_at: String,
}

/// One worktree's session state, loaded lazily and flushed on every mutation.
pub struct SessionRegistry {
    store_dir: PathBuf,
}

impl SessionRegistry {
    pub fn new(store_dir: PathBuf) -> Self {
        debug!(?store_dir, "SessionRegistry::new: called");
        Self { store_dir }
    }

    /// A stable, filesystem-safe key for a worktree path.
    fn encode_key(worktree_path: &Path) -> String {
        let mut encoded = String::new();
        for c in worktree_path.to_string_lossy().chars() {
            if c.is_ascii_alphanumeric() {
                encoded.push(c);
            } else {
                encoded.push('_');
            }
        }
        encoded
    }

    fn file_path(&self, worktree_path: &Path) -> PathBuf {
        self.store_dir.join(format!("{}.json", Self::encode_key(worktree_path)))
    }

    fn load(&self, worktree_path: &Path) -> Result<Option<WorktreeSessions>, SessionError> {
        let path = self.file_path(worktree_path);
        if !path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path).map_err(|source| SessionError::Io { path: path.clone(), source })?;
        let sessions = serde_json::from_str(&text).map_err(|source| SessionError::Parse { path, source })?;
        Ok(Some(sessions))
    }

    fn save(&self, worktree_path: &Path, sessions: &WorktreeSessions) -> Result<(), SessionError> {
        std::fs::create_dir_all(&self.store_dir).map_err(|source| SessionError::Io {
            path: self.store_dir.clone(),
            source,
        })?;
        let path = self.file_path(worktree_path);
        let text = serde_json::to_string_pretty(sessions).expect("WorktreeSessions is always serializable");
        std::fs::write(&path, text).map_err(|source| SessionError::Io { path, source })
    }

    /// Look up a persisted session handle, discarding the whole worktree's
    /// record if it was bound to a different provider.
    pub fn get(&self, worktree_path: &Path, persona: &str, provider: &str) -> Result<Option<String>, SessionError> {
        debug!(?worktree_path, %persona, %provider, "SessionRegistry::get: called");
        let Some(sessions) = self.load(worktree_path)? else {
            return Ok(None);
        };
        if sessions.provider != provider {
            warn!(?worktree_path, stored = %sessions.provider, requested = %provider, "SessionRegistry::get: provider changed, discarding sessions");
            return Ok(None);
        }
        Ok(sessions.persona_sessions.get(persona).cloned())
    }

    /// Record a session handle for `persona` under `worktree_path`, bound to
    /// `provider`. If the worktree was previously bound to a different
    /// provider, its whole session map is discarded first.
    pub fn set(&self, worktree_path: &Path, persona: &str, provider: &str, handle: String) -> Result<(), SessionError> {
        debug!(?worktree_path, %persona, %provider, "SessionRegistry::set: called");
        let mut sessions = match self.load(worktree_path)? {
            Some(existing) if existing.provider == provider => existing,
            Some(_stale) => WorktreeSessions {
                persona_sessions: HashMap::new(),
                provider: provider.to_string(),
                updated_at: now(),
            },
            None => WorktreeSessions {
                persona_sessions: HashMap::new(),
                provider: provider.to_string(),
                updated_at: now(),
            },
        };
        sessions.persona_sessions.insert(persona.to_string(), handle);
        sessions.updated_at = now();
        self.save(worktree_path, &sessions)
    }

    /// Drop all persisted sessions for a worktree, e.g. when its task is
    /// deleted from the manifest.
    pub fn clear(&self, worktree_path: &Path) -> Result<(), SessionError> {
        let path = self.file_path(worktree_path);
        if path.is_file() {
            std::fs::remove_file(&path).map_err(|source| SessionError::Io { path, source })?;
        }
        Ok(())
    }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_a_session_handle() {
        let dir = tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path().to_path_buf());
        let worktree = Path::new("/work/tree/one");
        registry.set(worktree, "reviewer", "anthropic", "sess-123".into()).unwrap();
        let got = registry.get(worktree, "reviewer", "anthropic").unwrap();
        assert_eq!(got.as_deref(), Some("sess-123"));
    }

    #[test]
    fn missing_worktree_returns_none() {
        let dir = tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path().to_path_buf());
        let got = registry.get(Path::new("/nope"), "reviewer", "anthropic").unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn provider_change_discards_prior_sessions() {
        let dir = tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path().to_path_buf());
        let worktree = Path::new("/work/tree/two");
        registry.set(worktree, "reviewer", "anthropic", "sess-abc".into()).unwrap();
        let got = registry.get(worktree, "reviewer", "openai").unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn setting_under_new_provider_replaces_stale_map() {
        let dir = tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path().to_path_buf());
        let worktree = Path::new("/work/tree/three");
        registry.set(worktree, "reviewer", "anthropic", "sess-old".into()).unwrap();
        registry.set(worktree, "fixer", "openai", "sess-new".into()).unwrap();
        assert_eq!(registry.get(worktree, "reviewer", "openai").unwrap(), None);
        assert_eq!(registry.get(worktree, "fixer", "openai").unwrap().as_deref(), Some("sess-new"));
    }

    #[test]
    fn clear_removes_the_file() {
        let dir = tempdir().unwrap();
        let registry = SessionRegistry::new(dir.path().to_path_buf());
        let worktree = Path::new("/work/tree/four");
        registry.set(worktree, "reviewer", "anthropic", "sess-1".into()).unwrap();
        registry.clear(worktree).unwrap();
        assert_eq!(registry.get(worktree, "reviewer", "anthropic").unwrap(), None);
    }
}
