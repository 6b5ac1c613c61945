//! Authoritative project files plus the agent's proposal overlay.
//!
//! Proposals are only ever written by the reducer. User edits and accepted
//! proposals land in `files`; an accept or reject clears the overlay entry
//! for that path.

use crate::ignore::IgnoreMatcher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;

/// Persisted per-project editor state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectState {
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub active_file: Option<String>,
    #[serde(default)]
    pub folders: Vec<String>,
    #[serde(default)]
    pub expanded_folders: Vec<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub template_id: Option<String>,
}

/// File-tree mutation reported by a tool completion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TreeOp {
    CreateFolder { path: String },
    DeleteFolder { path: String },
    RenameFolder { from: String, to: String },
    RenameFile { from: String, to: String },
    DeleteFile { path: String },
}

#[derive(Debug, Clone, Default)]
pub struct Workspace {
    pub state: ProjectState,
    proposals: BTreeMap<String, String>,
}

impl Workspace {
    pub fn new(state: ProjectState) -> Self {
        Self {
            state,
            proposals: BTreeMap::new(),
        }
    }

    /// Load every UTF-8 file below `root`, skipping ignored directories.
    pub fn from_dir(root: &Path) -> io::Result<Self> {
        let mut files = BTreeMap::new();
        let mut folders = Vec::new();
        let defaults = IgnoreMatcher::with_defaults();
        collect_dir(root, root, &defaults, &mut files, &mut folders)?;
        folders.sort();
        Ok(Self::new(ProjectState {
            files,
            folders,
            ..ProjectState::default()
        }))
    }

    pub fn files(&self) -> &BTreeMap<String, String> {
        &self.state.files
    }

    /// Matcher compiled from defaults and the project's pattern files.
    pub fn ignore_matcher(&self) -> IgnoreMatcher {
        IgnoreMatcher::from_project_files(&self.state.files)
    }

    /// `project` map sent with run and play requests.
    pub fn agent_payload(&self) -> BTreeMap<String, String> {
        self.ignore_matcher().payload_filter(&self.state.files)
    }

    pub fn propose(&mut self, path: &str, content: String) {
        self.proposals.insert(normalize(path), content);
    }

    pub fn proposal(&self, path: &str) -> Option<&str> {
        self.proposals.get(&normalize(path)).map(String::as_str)
    }

    pub fn proposals(&self) -> &BTreeMap<String, String> {
        &self.proposals
    }

    /// Proposals for paths the ignore matcher lets through.
    pub fn visible_proposals(&self) -> BTreeMap<&str, &str> {
        let matcher = self.ignore_matcher();
        self.proposals
            .iter()
            .filter(|(path, _)| !matcher.is_ignored(path))
            .map(|(path, content)| (path.as_str(), content.as_str()))
            .collect()
    }

    /// Move a proposal into authoritative content. Returns the accepted text.
    pub fn accept(&mut self, path: &str) -> Option<String> {
        let path = normalize(path);
        let content = self.proposals.remove(&path)?;
        self.ensure_parent_folders(&path);
        self.state.files.insert(path, content.clone());
        Some(content)
    }

    /// Drop a proposal without touching authoritative content.
    pub fn reject(&mut self, path: &str) -> bool {
        self.proposals.remove(&normalize(path)).is_some()
    }

    pub fn accept_all(&mut self) -> Vec<String> {
        let paths: Vec<String> = self.proposals.keys().cloned().collect();
        paths
            .into_iter()
            .filter(|path| self.accept(path).is_some())
            .collect()
    }

    pub fn reject_all(&mut self) -> usize {
        let count = self.proposals.len();
        self.proposals.clear();
        count
    }

    /// Materialize an empty authoritative file if `path` is not present.
    pub fn ensure_file(&mut self, path: &str) -> bool {
        let path = normalize(path);
        if path.is_empty() || self.state.files.contains_key(&path) {
            return false;
        }
        self.ensure_parent_folders(&path);
        self.state.files.insert(path, String::new());
        true
    }

    pub fn apply_tree_op(&mut self, op: &TreeOp) {
        match op {
            TreeOp::CreateFolder { path } => {
                let path = normalize(path);
                self.ensure_parent_folders(&format!("{path}/_"));
            }
            TreeOp::DeleteFolder { path } => {
                let prefix = format!("{}/", normalize(path));
                let path = normalize(path);
                self.state.files.retain(|p, _| !p.starts_with(&prefix));
                self.proposals.retain(|p, _| !p.starts_with(&prefix));
                self.state
                    .folders
                    .retain(|f| f != &path && !f.starts_with(&prefix));
                self.state
                    .expanded_folders
                    .retain(|f| f != &path && !f.starts_with(&prefix));
                if self
                    .state
                    .active_file
                    .as_ref()
                    .is_some_and(|f| f.starts_with(&prefix))
                {
                    self.state.active_file = None;
                }
            }
            TreeOp::RenameFolder { from, to } => {
                let (from, to) = (normalize(from), normalize(to));
                let from_prefix = format!("{from}/");
                let rename = |p: &String| -> Option<String> {
                    if *p == from {
                        Some(to.clone())
                    } else {
                        p.strip_prefix(&from_prefix).map(|rest| format!("{to}/{rest}"))
                    }
                };
                self.state.files = rekey(std::mem::take(&mut self.state.files), &rename);
                self.proposals = rekey(std::mem::take(&mut self.proposals), &rename);
                for folder in self
                    .state
                    .folders
                    .iter_mut()
                    .chain(self.state.expanded_folders.iter_mut())
                {
                    if let Some(next) = rename(&*folder) {
                        *folder = next;
                    }
                }
                if let Some(active) = self.state.active_file.as_mut() {
                    if let Some(next) = rename(&*active) {
                        *active = next;
                    }
                }
                self.ensure_parent_folders(&format!("{to}/_"));
            }
            TreeOp::RenameFile { from, to } => {
                let (from, to) = (normalize(from), normalize(to));
                if let Some(content) = self.state.files.remove(&from) {
                    self.ensure_parent_folders(&to);
                    self.state.files.insert(to.clone(), content);
                }
                if let Some(proposal) = self.proposals.remove(&from) {
                    self.proposals.insert(to.clone(), proposal);
                }
                if self.state.active_file.as_deref() == Some(from.as_str()) {
                    self.state.active_file = Some(to);
                }
            }
            TreeOp::DeleteFile { path } => {
                let path = normalize(path);
                self.state.files.remove(&path);
                self.proposals.remove(&path);
                if self.state.active_file.as_deref() == Some(path.as_str()) {
                    self.state.active_file = None;
                }
            }
        }
    }

    /// Write the given paths' authoritative content below `root`.
    pub fn write_files(&self, root: &Path, paths: &[String]) -> io::Result<()> {
        for path in paths {
            let Some(content) = self.state.files.get(path) else {
                continue;
            };
            let target = root.join(path);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(target, content)?;
        }
        Ok(())
    }

    fn ensure_parent_folders(&mut self, path: &str) {
        let mut prefix = String::new();
        let mut parts: Vec<&str> = path.split('/').collect();
        parts.pop();
        for part in parts {
            if part.is_empty() {
                continue;
            }
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(part);
            if !self.state.folders.contains(&prefix) {
                self.state.folders.push(prefix.clone());
            }
        }
    }
}

fn normalize(path: &str) -> String {
    path.trim().trim_start_matches("./").trim_matches('/').to_string()
}

fn rekey<F>(map: BTreeMap<String, String>, rename: &F) -> BTreeMap<String, String>
where
    F: Fn(&String) -> Option<String>,
{
    map.into_iter()
        .map(|(path, content)| (rename(&path).unwrap_or(path), content))
        .collect()
}

fn collect_dir(
    root: &Path,
    dir: &Path,
    matcher: &IgnoreMatcher,
    files: &mut BTreeMap<String, String>,
    folders: &mut Vec<String>,
) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Ok(relative) = path.strip_prefix(root) else {
            continue;
        };
        let relative = relative.to_string_lossy().replace('\\', "/");
        if relative == ".tether" || relative.starts_with(".tether/") {
            continue;
        }
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if matcher.is_ignored(&format!("{relative}/")) || matcher.is_ignored(&relative) {
                continue;
            }
            folders.push(relative);
            collect_dir(root, &path, matcher, files, folders)?;
        } else if file_type.is_file() {
            // Binary files are not part of the editable project.
            if let Ok(content) = fs::read_to_string(&path) {
                files.insert(relative, content);
            }
        }
    }
    Ok(())
}
