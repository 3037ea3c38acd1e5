//! The versioned state store port (spec §4.4).
//!
//! `save` always bumps `version` by exactly one over what was previously
//! stored; callers never set `version` themselves. Two implementations are
//! provided: an in-memory store for tests and short-lived processes, and a
//! JSON-file-backed store (one file per session) for anything that needs to
//! survive a restart.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;

use ag_domain::error::{Error, Result};
use ag_domain::session::SessionState;
use ag_domain::trace::TraceEvent;

#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>>;

    /// Persist `state`, bumping its version by one over whatever was
    /// previously stored for this session (or to `1` if this is the first
    /// save). Returns the state as actually written, version bumped.
    async fn save(&self, state: SessionState) -> Result<SessionState>;

    async fn list(&self) -> Result<Vec<String>>;

    async fn delete(&self, session_id: &str) -> Result<()>;

    /// Remove sessions whose `updated_at` is older than `older_than_secs`
    /// seconds. Returns the number removed.
    async fn cleanup(&self, older_than_secs: i64) -> Result<usize>;
}

// ── In-memory implementation ──────────────────────────────────────

#[derive(Default)]
pub struct InMemoryStateStore {
    sessions: RwLock<HashMap<String, SessionState>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        Ok(self.sessions.read().get(session_id).cloned())
    }

    async fn save(&self, mut state: SessionState) -> Result<SessionState> {
        let mut sessions = self.sessions.write();
        if let Some(existing) = sessions.get(&state.session_id) {
            state.version = existing.version;
        } else {
            state.version = 0;
        }
        state.bump_version();
        sessions.insert(state.session_id.clone(), state.clone());

        TraceEvent::StateSaved { session_id: state.session_id.clone(), version: state.version }.emit();
        Ok(state)
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.sessions.read().keys().cloned().collect())
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        self.sessions.write().remove(session_id);
        Ok(())
    }

    async fn cleanup(&self, older_than_secs: i64) -> Result<usize> {
        let cutoff = chrono::Utc::now() - chrono::Duration::seconds(older_than_secs);
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, s| s.updated_at >= cutoff);
        Ok(before - sessions.len())
    }
}

// ── File-backed implementation ────────────────────────────────────

/// One JSON file per session under `root_dir`. Writes go to a temp file in
/// the same directory and are renamed into place, so a reader never
/// observes a partially written file.
pub struct FileStateStore {
    root_dir: PathBuf,
}

impl FileStateStore {
    pub fn new(root_dir: impl Into<PathBuf>) -> Result<Self> {
        let root_dir = root_dir.into();
        std::fs::create_dir_all(&root_dir).map_err(Error::Io)?;
        Ok(Self { root_dir })
    }

    fn path_for(&self, session_id: &str) -> PathBuf {
        self.root_dir.join(format!("{session_id}.json"))
    }
}

#[async_trait::async_trait]
impl StateStore for FileStateStore {
    async fn load(&self, session_id: &str) -> Result<Option<SessionState>> {
        let path = self.path_for(session_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = tokio::fs::read_to_string(&path).await.map_err(Error::Io)?;
        let state: SessionState = serde_json::from_str(&raw)?;
        Ok(Some(state))
    }

    async fn save(&self, mut state: SessionState) -> Result<SessionState> {
        let existing = self.load(&state.session_id).await?;
        state.version = existing.map(|e| e.version).unwrap_or(0);
        state.bump_version();

        let path = self.path_for(&state.session_id);
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&state)?;
        tokio::fs::write(&tmp_path, json).await.map_err(Error::Io)?;
        tokio::fs::rename(&tmp_path, &path).await.map_err(Error::Io)?;

        TraceEvent::StateSaved { session_id: state.session_id.clone(), version: state.version }.emit();
        Ok(state)
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root_dir).await.map_err(Error::Io)?;
        while let Some(entry) = entries.next_entry().await.map_err(Error::Io)? {
            if let Some(name) = entry.path().file_stem().and_then(|s| s.to_str()) {
                out.push(name.to_string());
            }
        }
        Ok(out)
    }

    async fn delete(&self, session_id: &str) -> Result<()> {
        let path = self.path_for(session_id);
        if path.exists() {
            tokio::fs::remove_file(&path).await.map_err(Error::Io)?;
        }
        Ok(())
    }

    async fn cleanup(&self, older_than_secs: i64) -> Result<usize> {
        let cutoff = chrono::Utc::now() - chrono::Duration::seconds(older_than_secs);
        let mut removed = 0;
        for session_id in self.list().await? {
            if let Some(state) = self.load(&session_id).await? {
                if state.updated_at < cutoff {
                    self.delete(&session_id).await?;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_bumps_version_by_one_each_time() {
        let store = InMemoryStateStore::new();
        let s1 = store.save(SessionState::new("sess-1")).await.unwrap();
        assert_eq!(s1.version, 1);

        let s2 = store.save(s1.clone()).await.unwrap();
        assert_eq!(s2.version, 2);

        let s3 = store.save(s2.clone()).await.unwrap();
        assert_eq!(s3.version, 3);
    }

    #[tokio::test]
    async fn load_roundtrips_through_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).unwrap();

        let mut state = SessionState::new("sess-2");
        state.mission = Some("fetch a url".into());
        let saved = store.save(state).await.unwrap();
        assert_eq!(saved.version, 1);

        let loaded = store.load("sess-2").await.unwrap().unwrap();
        assert_eq!(loaded.mission.as_deref(), Some("fetch a url"));
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn load_missing_session_returns_none() {
        let store = InMemoryStateStore::new();
        assert!(store.load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_and_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStateStore::new(dir.path()).unwrap();

        store.save(SessionState::new("a")).await.unwrap();
        store.save(SessionState::new("b")).await.unwrap();

        let mut ids = store.list().await.unwrap();
        ids.sort();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);

        store.delete("a").await.unwrap();
        assert!(store.load("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cleanup_removes_only_stale_sessions() {
        let store = InMemoryStateStore::new();
        let mut fresh = SessionState::new("fresh");
        fresh.updated_at = chrono::Utc::now();
        store.save(fresh).await.unwrap();

        let mut stale = SessionState::new("stale");
        stale.updated_at = chrono::Utc::now() - chrono::Duration::seconds(1000);
        store.sessions.write().insert("stale".into(), stale);

        let removed = store.cleanup(500).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.load("fresh").await.unwrap().is_some());
        assert!(store.load("stale").await.unwrap().is_none());
    }
}
