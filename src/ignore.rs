//! Path-ignore predicate compiled from default rules and project pattern files.
//!
//! Supported pattern subset:
//! - trailing-slash directory rules (`node_modules/`, `public/assets/`)
//! - exact basenames (`.DS_Store`)
//! - `*`/`?` globs matched against the basename (`*.log`)
//!
//! Rules come from the built-in defaults, then the root `.gitignore`, then the
//! root `.agentignore`. Pattern files in nested folders contribute rules scoped
//! to their folder.

use regex::Regex;
use std::collections::BTreeMap;

/// Built-in rules applied to every project.
pub const DEFAULT_IGNORE_PATTERNS: &[&str] = &[
    "__pycache__/",
    "*.pyc",
    ".DS_Store",
    "node_modules/",
    "vendor/",
    "dist/",
    "build/",
    ".venv/",
    "venv/",
    "env/",
    "*.log",
    ".bundle/",
    "tmp/",
    "log/",
    "logs/",
    "coverage/",
    ".cache/",
    ".next/",
    "public/assets/",
    ".git/",
];

/// User-editable pattern files, in the order their rules are applied.
pub const PATTERN_FILES: [&str; 2] = [".gitignore", ".agentignore"];

#[derive(Debug, Clone)]
enum Matcher {
    /// Directory rule without `/`: any path segment equal to the name.
    DirSegment(String),
    /// Directory rule with `/`: anchored prefix.
    DirPrefix(String),
    Exact(String),
    Glob(Regex),
}

#[derive(Debug, Clone)]
struct Rule {
    /// Folder a nested pattern file lives in; the rule only applies below it.
    scope: Option<String>,
    matcher: Matcher,
}

/// Compiled ignore predicate.
#[derive(Debug, Clone, Default)]
pub struct IgnoreMatcher {
    rules: Vec<Rule>,
}

impl IgnoreMatcher {
    /// Defaults only.
    pub fn with_defaults() -> Self {
        let mut matcher = Self::default();
        for pattern in DEFAULT_IGNORE_PATTERNS {
            matcher.push_pattern(None, pattern);
        }
        matcher
    }

    /// Compile defaults plus every pattern file found in a project file map.
    pub fn from_project_files(files: &BTreeMap<String, String>) -> Self {
        let mut matcher = Self::with_defaults();
        for name in PATTERN_FILES {
            if let Some(text) = files.get(name) {
                matcher.push_lines(None, text);
            }
        }
        for (path, text) in files {
            let normalized = path.trim_start_matches('/');
            let Some((folder, file_name)) = normalized.rsplit_once('/') else {
                continue;
            };
            if folder.is_empty() || !PATTERN_FILES.contains(&file_name) {
                continue;
            }
            matcher.push_lines(Some(folder), text);
        }
        matcher
    }

    /// Add every non-comment line of a pattern file.
    pub fn push_lines(&mut self, scope: Option<&str>, text: &str) {
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            self.push_pattern(scope, line);
        }
    }

    fn push_pattern(&mut self, scope: Option<&str>, raw: &str) {
        let pattern = raw.trim().trim_start_matches('/');
        if pattern.is_empty() {
            return;
        }
        let scope = scope.map(|s| s.trim_matches('/').to_string());

        if let Some(directory) = pattern.strip_suffix('/') {
            let directory = directory.trim_start_matches('/');
            if directory.is_empty() {
                return;
            }
            // A scoped directory rule is always anchored under its folder.
            let matcher = match &scope {
                Some(folder) => Matcher::DirPrefix(format!("{folder}/{directory}")),
                None if directory.contains('/') => Matcher::DirPrefix(directory.to_string()),
                None => Matcher::DirSegment(directory.to_string()),
            };
            self.rules.push(Rule {
                scope: None,
                matcher,
            });
            return;
        }

        let matcher = if pattern.contains('*') || pattern.contains('?') {
            match glob_to_regex(pattern) {
                Some(re) => Matcher::Glob(re),
                None => {
                    tracing::warn!(pattern, "skipping ignore pattern that failed to compile");
                    return;
                }
            }
        } else {
            Matcher::Exact(pattern.to_string())
        };
        self.rules.push(Rule { scope, matcher });
    }

    /// True when any rule matches `path`.
    pub fn is_ignored(&self, path: &str) -> bool {
        let normalized = path.trim_start_matches('/');
        if normalized.is_empty() {
            return false;
        }
        let basename = normalized.rsplit('/').next().unwrap_or(normalized);
        self.rules.iter().any(|rule| {
            if let Some(scope) = &rule.scope {
                let under_scope = normalized
                    .strip_prefix(scope.as_str())
                    .is_some_and(|rest| rest.starts_with('/'));
                if !under_scope {
                    return false;
                }
            }
            match &rule.matcher {
                Matcher::DirSegment(name) => normalized.split('/').any(|part| part == name),
                Matcher::DirPrefix(prefix) => {
                    normalized == prefix
                        || normalized
                            .strip_prefix(prefix.as_str())
                            .is_some_and(|rest| rest.starts_with('/'))
                }
                Matcher::Exact(name) => basename == name,
                Matcher::Glob(re) => re.is_match(basename),
            }
        })
    }

    /// Paths the agent should receive: everything not ignored, plus the two
    /// root pattern files so the agent can read and edit them.
    pub fn payload_filter(&self, files: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        files
            .iter()
            .filter(|(path, _)| is_root_pattern_file(path) || !self.is_ignored(path))
            .map(|(path, content)| (path.clone(), content.clone()))
            .collect()
    }
}

/// True for the root `.gitignore` / `.agentignore`.
pub fn is_root_pattern_file(path: &str) -> bool {
    PATTERN_FILES.contains(&path.trim_start_matches('/'))
}

/// Translate a basename glob (`*`, `?`) into an anchored regex.
fn glob_to_regex(pattern: &str) -> Option<Regex> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    let mut literal = String::new();
    for ch in pattern.chars() {
        match ch {
            '*' | '?' => {
                out.push_str(&regex::escape(&literal));
                literal.clear();
                out.push_str(if ch == '*' { ".*" } else { "." });
            }
            other => literal.push(other),
        }
    }
    out.push_str(&regex::escape(&literal));
    out.push('$');
    Regex::new(&out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn directory_rule_matches_at_any_depth() {
        let mut m = IgnoreMatcher::default();
        m.push_lines(None, "node_modules/");
        assert!(m.is_ignored("node_modules/foo.js"));
        assert!(m.is_ignored("a/node_modules/b.js"));
        assert!(!m.is_ignored("node_modules_extra/x.js"));
    }

    #[test]
    fn glob_rule_matches_basename_only() {
        let mut m = IgnoreMatcher::default();
        m.push_lines(None, "*.log");
        assert!(m.is_ignored("a/b/out.log"));
        assert!(!m.is_ignored("a/b/outlog.txt"));
    }

    #[test]
    fn exact_rule_matches_basename() {
        let mut m = IgnoreMatcher::default();
        m.push_lines(None, ".DS_Store");
        assert!(m.is_ignored("deep/dir/.DS_Store"));
        assert!(!m.is_ignored("deep/dir/.DS_Store.bak"));
    }

    #[test]
    fn slash_directory_rule_is_anchored() {
        let m = IgnoreMatcher::with_defaults();
        assert!(m.is_ignored("public/assets/app.css"));
        assert!(!m.is_ignored("web/public/assets/app.css"));
    }

    #[test]
    fn question_mark_matches_one_character() {
        let mut m = IgnoreMatcher::default();
        m.push_lines(None, "file?.txt");
        assert!(m.is_ignored("file1.txt"));
        assert!(!m.is_ignored("file12.txt"));
    }

    #[test]
    fn glob_escapes_regex_metacharacters() {
        let mut m = IgnoreMatcher::default();
        m.push_lines(None, "a+b*.txt");
        assert!(m.is_ignored("a+b-1.txt"));
        assert!(!m.is_ignored("aab.txt"));
    }

    #[test]
    fn comments_blank_lines_and_leading_slash_are_handled() {
        let mut m = IgnoreMatcher::default();
        m.push_lines(None, "# secrets\n\n/secret.env\n");
        assert!(m.is_ignored("secret.env"));
        assert!(!m.is_ignored("# secrets"));
    }

    #[test]
    fn root_pattern_files_extend_defaults() {
        let project = files(&[
            (".gitignore", "*.tmp\n"),
            (".agentignore", "fixtures/\n"),
            ("main.py", ""),
        ]);
        let m = IgnoreMatcher::from_project_files(&project);
        assert!(m.is_ignored("scratch.tmp"));
        assert!(m.is_ignored("tests/fixtures/big.json"));
        assert!(m.is_ignored("__pycache__/main.cpython-313.pyc"));
        assert!(!m.is_ignored("main.py"));
    }

    #[test]
    fn nested_pattern_files_are_scoped_to_their_folder() {
        let project = files(&[
            ("web/.gitignore", "out/\n*.map\n"),
            ("web/out/index.js", ""),
            ("out/index.js", ""),
            ("web/app.js.map", ""),
            ("app.js.map", ""),
        ]);
        let m = IgnoreMatcher::from_project_files(&project);
        assert!(m.is_ignored("web/out/index.js"));
        assert!(!m.is_ignored("out/index.js"));
        assert!(m.is_ignored("web/app.js.map"));
        assert!(!m.is_ignored("app.js.map"));
    }

    #[test]
    fn payload_filter_keeps_root_pattern_files() {
        let project = files(&[
            (".gitignore", ".gitignore\n"),
            (".agentignore", "*.md\n.agentignore\n"),
            ("README.md", "hi"),
            ("main.py", "print(1)"),
            ("node_modules/x.js", ""),
        ]);
        let m = IgnoreMatcher::from_project_files(&project);
        let payload = m.payload_filter(&project);
        let keys: Vec<&str> = payload.keys().map(String::as_str).collect();
        assert_eq!(keys, vec![".agentignore", ".gitignore", "main.py"]);
    }
}
