//! Complexity heuristics for source files.
//!
//! The score of a file is the number of decision points it contains plus the
//! deepest nesting level reached. It is deliberately language-agnostic: a
//! rough signal that a file is growing hard to maintain, not a precise
//! cyclomatic measure.
//!
//! # Example
//!
//! ```
//! use quartermaster::monitor::complexity::analyze_source;
//!
//! let score = analyze_source("fn f(x: u8) {\n    if x > 1 {\n        loop {}\n    }\n}\n");
//! assert_eq!(score.decision_points, 1);
//! assert_eq!(score.max_nesting, 2);
//! assert_eq!(score.score, 3);
//! ```

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

/// File extensions treated as source code.
pub const SOURCE_EXTENSIONS: &[&str] = &[
    "rs", "py", "js", "jsx", "ts", "tsx", "go", "java", "kt", "c", "h", "cc", "cpp", "hpp", "cs",
    "rb", "php", "sh", "swift", "scala",
];

/// Directories never scanned.
pub const SKIPPED_DIRS: &[&str] = &[
    ".git",
    "target",
    "node_modules",
    "vendor",
    "dist",
    "build",
    "venv",
    ".venv",
    "__pycache__",
];

static DECISION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:if|elif|for|while|case|catch|except|match)\b|&&|\|\|").expect("Invalid regex")
});

/// Result of complexity analysis for one file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComplexityScore {
    /// Total score (decision points + max nesting)
    pub score: u32,
    pub decision_points: u32,
    pub max_nesting: u32,
}

impl ComplexityScore {
    pub fn exceeds(&self, threshold: u32) -> bool {
        self.score > threshold
    }
}

/// Score a file's text.
///
/// Nesting is measured by brace depth, or by indentation for files without
/// braces (Python, shell).
pub fn analyze_source(text: &str) -> ComplexityScore {
    let mut decision_points = 0u32;
    let mut depth = 0i64;
    let mut max_brace_depth = 0i64;
    let mut max_indent_depth = 0u32;
    let mut saw_brace = false;

    for line in text.lines() {
        let code = strip_line_comment(line);
        if code.trim().is_empty() {
            continue;
        }
        decision_points += DECISION.find_iter(code).count() as u32;

        for c in code.chars() {
            match c {
                '{' => {
                    saw_brace = true;
                    depth += 1;
                    max_brace_depth = max_brace_depth.max(depth);
                }
                '}' => depth = (depth - 1).max(0),
                _ => {}
            }
        }

        let indent = code.chars().take_while(|c| *c == ' ' || *c == '\t').fold(0, |n, c| {
            n + if c == '\t' { 4 } else { 1 }
        });
        max_indent_depth = max_indent_depth.max(indent / 4);
    }

    let max_nesting = if saw_brace {
        // The outermost block (function body) is not nesting.
        (max_brace_depth - 1).max(0) as u32
    } else {
        max_indent_depth
    };
    ComplexityScore {
        score: decision_points + max_nesting,
        decision_points,
        max_nesting,
    }
}

/// Cut a trailing `//` comment; a `//` inside a double-quoted string is code.
fn strip_line_comment(line: &str) -> &str {
    let trimmed = line.trim_start();
    if trimmed.starts_with("//") || trimmed.starts_with('#') {
        return "";
    }
    let bytes = line.as_bytes();
    let mut in_string = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_string => i += 1,
            b'"' => in_string = !in_string,
            b'/' if !in_string && bytes.get(i + 1) == Some(&b'/') => return &line[..i],
            _ => {}
        }
        i += 1;
    }
    line
}

/// A scored file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileComplexity {
    pub path: PathBuf,
    #[serde(flatten)]
    pub complexity: ComplexityScore,
}

fn is_source(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| SOURCE_EXTENSIONS.contains(&e))
}

/// Score every source file under `root`, highest first.
///
/// Unreadable or non-UTF-8 files are skipped.
pub fn scan_tree(root: &Path) -> Vec<FileComplexity> {
    let mut files: Vec<FileComplexity> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.depth() > 0
                && e.file_name()
                    .to_str()
                    .is_some_and(|name| SKIPPED_DIRS.contains(&name)))
        })
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && is_source(e.path()))
        .filter_map(|e| {
            let text = std::fs::read_to_string(e.path()).ok()?;
            Some(FileComplexity {
                path: e
                    .path()
                    .strip_prefix(root)
                    .unwrap_or(e.path())
                    .to_path_buf(),
                complexity: analyze_source(&text),
            })
        })
        .collect();
    files.sort_by(|a, b| {
        b.complexity
            .score
            .cmp(&a.complexity.score)
            .then_with(|| a.path.cmp(&b.path))
    });
    files
}
