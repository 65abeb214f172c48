// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Cross-session registry (C8, §4.8): `<sessionsRoot>/sessions.json`,
//! updated atomically via write-temp-then-rename.
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::SessionError;

const CURRENT_VERSION: &str = "1.0";
const FILE_NAME: &str = "sessions.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionIndexEntry {
    pub id: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub end_time: Option<chrono::DateTime<chrono::Utc>>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub epic_id: Option<String>,
    pub work_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub accountability_summary_path: Option<PathBuf>,
    pub worker_count: usize,
    pub tasks_completed: u64,
    pub total_commits: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionIndex {
    pub version: String,
    pub sessions: Vec<SessionIndexEntry>,
}

impl Default for SessionIndex {
    fn default() -> Self {
        Self { version: CURRENT_VERSION.to_string(), sessions: Vec::new() }
    }
}

impl SessionIndex {
    fn path(sessions_root: &Path) -> PathBuf {
        sessions_root.join(FILE_NAME)
    }

    /// Loads the index. A missing file is not an error (empty index at the
    /// current version); invalid JSON and permission errors are each
    /// wrapped with the operation that failed.
    pub fn load(sessions_root: &Path) -> Result<Self, SessionError> {
        let path = Self::path(sessions_root);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(SessionError::Io(e)),
        };
        serde_json::from_str(&text).map_err(SessionError::Serde)
    }

    /// Saves the index atomically: write to a uniquely-named sibling `.tmp`
    /// file, then rename over the target. The tmp name is unique per call
    /// (via `NamedTempFile`), so concurrent savers never race on the same
    /// path — each writes, renames, and succeeds independently; last
    /// writer's rename wins.
    pub fn save(&self, sessions_root: &Path) -> Result<(), SessionError> {
        std::fs::create_dir_all(sessions_root)?;
        let path = Self::path(sessions_root);
        let json = serde_json::to_string_pretty(self)?;
        let mut tmp = tempfile::NamedTempFile::new_in(sessions_root)?;
        tmp.write_all(json.as_bytes())?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tmp.as_file().set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Load-find-or-append-overwrite-save in one step, as performed from
    /// Session close.
    pub fn update(sessions_root: &Path, entry: SessionIndexEntry) -> Result<(), SessionError> {
        let mut index = Self::load(sessions_root)?;
        match index.sessions.iter_mut().find(|s| s.id == entry.id) {
            Some(existing) => *existing = entry,
            None => index.sessions.push(entry),
        }
        index.save(sessions_root)
    }
}
