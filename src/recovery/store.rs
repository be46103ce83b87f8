//! Atomic JSON persistence for session state and the crash log

use super::{CrashEntry, RecoveryError, SessionState};
use chrono::Utc;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "session_state.json";
const CRASH_LOG_FILE: &str = "crash_log.json";
const CRASH_LOG_LIMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    pub fn crash_log_path(&self) -> PathBuf {
        self.dir.join(CRASH_LOG_FILE)
    }

    /// Load the last complete snapshot, if any
    pub fn load(&self) -> Result<Option<SessionState>, RecoveryError> {
        read_json(&self.state_path())
    }

    /// Replace the snapshot atomically
    pub fn save(&self, state: &SessionState) -> Result<(), RecoveryError> {
        let json = serde_json::to_vec_pretty(state)
            .map_err(|e| RecoveryError::Io(std::io::Error::new(ErrorKind::InvalidData, e)))?;
        write_atomic(&self.dir, &self.state_path(), &json)
    }

    /// Append a crashed session, keeping the newest entries
    pub fn append_crash(&self, session: &SessionState) -> Result<(), RecoveryError> {
        let path = self.crash_log_path();
        let mut entries: Vec<CrashEntry> = match read_json(&path) {
            Ok(entries) => entries.unwrap_or_default(),
            Err(RecoveryError::Corrupt { .. }) => {
                tracing::warn!(path = %path.display(), "Crash log unreadable, starting a new one");
                vec![]
            }
            Err(e) => return Err(e),
        };
        entries.push(CrashEntry {
            detected_at: Utc::now(),
            session: session.clone(),
        });
        if entries.len() > CRASH_LOG_LIMIT {
            entries.drain(..entries.len() - CRASH_LOG_LIMIT);
        }
        let json = serde_json::to_vec_pretty(&entries)
            .map_err(|e| RecoveryError::Io(std::io::Error::new(ErrorKind::InvalidData, e)))?;
        write_atomic(&self.dir, &path, &json)
    }

    /// Most recent crashes, newest first
    pub fn crash_log(&self, limit: usize) -> Result<Vec<CrashEntry>, RecoveryError> {
        let entries: Vec<CrashEntry> = read_json(&self.crash_log_path())?.unwrap_or_default();
        Ok(entries.into_iter().rev().take(limit).collect())
    }

    /// Whether the state directory accepts writes
    pub fn probe(&self) -> Result<(), RecoveryError> {
        fs::create_dir_all(&self.dir)?;
        let probe = self.dir.join(".probe");
        fs::write(&probe, b"ok")?;
        fs::remove_file(&probe)?;
        Ok(())
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>, RecoveryError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|e| RecoveryError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Temp file in the same directory, fsync, rename, fsync the directory
fn write_atomic(dir: &Path, path: &Path, bytes: &[u8]) -> Result<(), RecoveryError> {
    fs::create_dir_all(dir)?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = dir.join(format!(".{}.tmp", file_name));

    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    sync_dir(dir)?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}
