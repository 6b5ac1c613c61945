//! On-disk project state and per-project chat-thread snapshots.
//!
//! Layout under the state root (default `.tether/`):
//!
//! ```text
//! state.json               projects, active project, per-project editor state
//! threads/<project>.json   capped, newest-first list of thread snapshots
//! ```
//!
//! Every write goes to a sibling temp file and is renamed into place. Stream
//! tokens, resume tokens and sandbox ids are never written.

use crate::error::PersistError;
use crate::store::{now_unix_millis, ActionKind, ThreadSnapshot};
use crate::textutil::preview_line;
use crate::workspace::ProjectState;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "state.json";
const THREADS_DIR: &str = "threads";
const STATE_FILE_VERSION: u32 = 1;
/// Default cap on threads kept per project.
pub const DEFAULT_MAX_THREADS: usize = 10;
const TITLE_CHARS: usize = 60;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectEntry {
    pub id: String,
    pub name: String,
}

/// `state.json` contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistedState {
    pub version: u32,
    #[serde(default)]
    pub projects: Vec<ProjectEntry>,
    #[serde(default)]
    pub active_project_id: Option<String>,
    #[serde(default)]
    pub project_states: BTreeMap<String, ProjectState>,
}

impl Default for PersistedState {
    fn default() -> Self {
        Self {
            version: STATE_FILE_VERSION,
            projects: Vec::new(),
            active_project_id: None,
            project_states: BTreeMap::new(),
        }
    }
}

impl PersistedState {
    /// Register a project if it is not known yet.
    pub fn ensure_project(&mut self, id: &str, name: &str) {
        if !self.projects.iter().any(|p| p.id == id) {
            self.projects.push(ProjectEntry {
                id: id.to_string(),
                name: name.to_string(),
            });
        }
    }
}

/// One persisted chat thread.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThreadRecord {
    pub id: String,
    pub title: String,
    pub updated_at_millis: u64,
    pub snapshot: ThreadSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ThreadFile {
    version: u32,
    project_id: String,
    #[serde(default)]
    threads: Vec<ThreadRecord>,
}

/// Filesystem-backed store for project state and thread snapshots.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    root: PathBuf,
    max_threads: usize,
}

impl ProjectStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>, max_threads: usize) -> Result<Self, PersistError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join(THREADS_DIR))?;
        Ok(Self {
            root,
            max_threads: max_threads.max(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load `state.json`; a missing file yields the empty default state.
    pub fn load_state(&self) -> Result<PersistedState, PersistError> {
        let path = self.root.join(STATE_FILE);
        if !path.exists() {
            return Ok(PersistedState::default());
        }
        let state: PersistedState = serde_json::from_slice(&fs::read(&path)?)?;
        if state.version > STATE_FILE_VERSION {
            return Err(PersistError::Invalid(format!(
                "state file version {} is newer than supported {STATE_FILE_VERSION}",
                state.version
            )));
        }
        Ok(state)
    }

    pub fn save_state(&self, state: &PersistedState) -> Result<(), PersistError> {
        for project in &state.projects {
            validate_id("project", &project.id)?;
        }
        write_atomic(&self.root.join(STATE_FILE), &serde_json::to_vec_pretty(state)?)
    }

    /// Threads for a project, newest first.
    pub fn list_threads(&self, project_id: &str) -> Result<Vec<ThreadRecord>, PersistError> {
        Ok(self.read_thread_file(project_id)?.threads)
    }

    pub fn load_thread(
        &self,
        project_id: &str,
        thread_id: &str,
    ) -> Result<Option<ThreadRecord>, PersistError> {
        validate_id("thread", thread_id)?;
        Ok(self
            .list_threads(project_id)?
            .into_iter()
            .find(|t| t.id == thread_id))
    }

    /// Upsert a thread snapshot and evict the oldest threads beyond the cap.
    /// Returns the evicted thread ids.
    pub fn save_thread(
        &self,
        project_id: &str,
        thread_id: &str,
        snapshot: &ThreadSnapshot,
    ) -> Result<Vec<String>, PersistError> {
        validate_id("thread", thread_id)?;
        let mut file = self.read_thread_file(project_id)?;
        file.threads.retain(|t| t.id != thread_id);
        let snapshot = strip_ephemeral(snapshot);
        file.threads.insert(
            0,
            ThreadRecord {
                id: thread_id.to_string(),
                title: thread_title(&snapshot),
                updated_at_millis: now_unix_millis(),
                snapshot,
            },
        );
        file.threads
            .sort_by(|a, b| b.updated_at_millis.cmp(&a.updated_at_millis));
        let evicted: Vec<String> = file
            .threads
            .drain(self.max_threads.min(file.threads.len())..)
            .map(|t| t.id)
            .collect();
        if !evicted.is_empty() {
            tracing::debug!(project_id, evicted = ?evicted, "evicted old threads");
        }
        self.write_thread_file(project_id, &file)?;
        Ok(evicted)
    }

    pub fn delete_thread(&self, project_id: &str, thread_id: &str) -> Result<bool, PersistError> {
        let mut file = self.read_thread_file(project_id)?;
        let before = file.threads.len();
        file.threads.retain(|t| t.id != thread_id);
        if file.threads.len() == before {
            return Ok(false);
        }
        self.write_thread_file(project_id, &file)?;
        Ok(true)
    }

    fn thread_path(&self, project_id: &str) -> PathBuf {
        self.root.join(THREADS_DIR).join(format!("{project_id}.json"))
    }

    fn read_thread_file(&self, project_id: &str) -> Result<ThreadFile, PersistError> {
        validate_id("project", project_id)?;
        let path = self.thread_path(project_id);
        if !path.exists() {
            return Ok(ThreadFile {
                version: STATE_FILE_VERSION,
                project_id: project_id.to_string(),
                threads: Vec::new(),
            });
        }
        let mut file: ThreadFile = serde_json::from_slice(&fs::read(&path)?)?;
        file.threads
            .sort_by(|a, b| b.updated_at_millis.cmp(&a.updated_at_millis));
        Ok(file)
    }

    fn write_thread_file(&self, project_id: &str, file: &ThreadFile) -> Result<(), PersistError> {
        write_atomic(&self.thread_path(project_id), &serde_json::to_vec_pretty(file)?)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, bytes)?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn validate_id(what: &str, id: &str) -> Result<(), PersistError> {
    let trimmed = id.trim();
    if trimmed.is_empty() {
        return Err(PersistError::Invalid(format!("{what} id cannot be empty")));
    }
    if trimmed == "." || trimmed == ".." {
        return Err(PersistError::Invalid(format!(
            "{what} id cannot be '.' or '..'"
        )));
    }
    if trimmed
        .chars()
        .any(|ch| !(ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.'))
    {
        return Err(PersistError::Invalid(format!(
            "{what} id can only contain ASCII letters, numbers, '.', '-', '_'"
        )));
    }
    Ok(())
}

/// Drop credentials that must never reach disk.
fn strip_ephemeral(snapshot: &ThreadSnapshot) -> ThreadSnapshot {
    let mut snapshot = snapshot.clone();
    for run in snapshot.runs.values_mut() {
        for action in &mut run.actions {
            if let ActionKind::ExecRequest { resume_token, .. } = &mut action.kind {
                *resume_token = None;
            }
        }
    }
    snapshot
}

fn thread_title(snapshot: &ThreadSnapshot) -> String {
    snapshot
        .ordered_runs()
        .next()
        .map(|run| preview_line(&run.user_prompt, TITLE_CHARS))
        .unwrap_or_else(|| "New thread".to_string())
}

/// Project id derived from a directory name: characters outside the id
/// alphabet become `-`; `default` when nothing usable is left.
pub fn project_id_for_dir(dir: &Path) -> String {
    let name = fs::canonicalize(dir)
        .ok()
        .and_then(|path| path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .or_else(|| dir.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default();
    let id: String = name
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' {
                ch
            } else {
                '-'
            }
        })
        .collect();
    let id = id.trim_matches(|ch| ch == '-' || ch == '.').to_string();
    if validate_id("project", &id).is_ok() {
        id
    } else {
        "default".to_string()
    }
}

/// Opaque thread id (`xxxx-xxxx-xxxx-xxxx`).
pub fn generate_thread_id() -> String {
    let mut bytes = [0u8; 8];
    OsRng.fill_bytes(&mut bytes);
    let hex = format!("{:016x}", u64::from_be_bytes(bytes));
    format!(
        "{}-{}-{}-{}",
        &hex[0..4],
        &hex[4..8],
        &hex[8..12],
        &hex[12..16]
    )
}
