//! Artifact selection by operator-supplied SQL `WHERE` clauses.
//!
//! A selection directory holds one or more `*.sql` files. Each file carries
//! exactly one clause that starts with the `WHERE` keyword and may span
//! several lines; `--` starts a comment that runs to the end of the line.
//!
//! ```text
//! -- only the HST collection
//! WHERE uri LIKE 'mast:HST/%'
//!   AND content_type = 'application/fits'
//! ```
//!
//! An artifact is selected when it matches any of the clauses.

use std::path::{Path, PathBuf};

use tracing::debug;

use coffer_core::{CofferError, Result};

const COMMENT_PREFIX: &str = "--";
const WHERE_KEYWORD: &str = "WHERE";
const CLAUSE_EXTENSION: &str = "sql";

/// The clauses loaded from a selection directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeClauses {
    clauses: Vec<String>,
}

impl IncludeClauses {
    /// Load every `*.sql` file in `dir`, in file name order.
    pub fn load(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir).map_err(|e| CofferError::Config {
            message: format!("Directory {} is not found or not readable: {e}", dir.display()),
        })?;

        let mut files: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| CofferError::Config {
                message: format!("Failed to list {}: {e}", dir.display()),
            })?;
            let path = entry.path();
            let is_sql = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case(CLAUSE_EXTENSION));
            if is_sql && path.is_file() {
                files.push(path);
            }
        }
        if files.is_empty() {
            return Err(CofferError::NotFound {
                key: format!("{}/*.{CLAUSE_EXTENSION}", dir.display()),
            });
        }
        files.sort();
        debug!(dir = %dir.display(), files = files.len(), "Loading include clauses");

        let mut clauses = Vec::new();
        for file in &files {
            let text = std::fs::read_to_string(file).map_err(|e| CofferError::Config {
                message: format!("Failed to read {}: {e}", file.display()),
            })?;
            let name = file.display().to_string();
            if let Some(clause) = parse_clause(&name, &text)? {
                clauses.push(clause);
            }
        }
        Self::new(clauses).map_err(|_| CofferError::Config {
            message: format!(
                "No usable SQL filter files located in {}. At least one .sql file must \
                 contain a clause starting with the keyword WHERE.",
                dir.display()
            ),
        })
    }

    /// Build from already parsed clauses (without the `WHERE` keyword).
    pub fn new(clauses: Vec<String>) -> Result<Self> {
        let clauses: Vec<String> = clauses
            .into_iter()
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .collect();
        if clauses.is_empty() {
            return Err(CofferError::Config {
                message: "at least one include clause is required".to_string(),
            });
        }
        Ok(Self { clauses })
    }

    pub fn clauses(&self) -> &[String] {
        &self.clauses
    }

    /// The combined condition, ready to follow `WHERE`.
    pub(crate) fn to_condition(&self) -> String {
        self.clauses
            .iter()
            .map(|c| format!("({c})"))
            .collect::<Vec<_>>()
            .join(" OR ")
    }
}

/// Extract the single `WHERE` clause of one file, without the keyword.
///
/// Returns `Ok(None)` for a file with no clause text.
pub fn parse_clause(name: &str, text: &str) -> Result<Option<String>> {
    let mut found = false;
    let mut clause = String::new();

    for (index, line) in text.lines().enumerate() {
        let line_number = index + 1;
        let mut line = line.trim();
        if let Some(pos) = line.find(COMMENT_PREFIX) {
            line = line[..pos].trim();
        }
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = strip_where(line) {
            if found {
                return Err(CofferError::Config {
                    message: format!(
                        "{name}: a WHERE clause is already present (line {line_number})"
                    ),
                });
            }
            found = true;
            clause.push_str(rest.trim());
        } else if found {
            clause.push(' ');
            clause.push_str(line);
        } else {
            return Err(CofferError::Config {
                message: format!(
                    "{name}: the first clause (line {line_number}) must start with the WHERE keyword"
                ),
            });
        }
    }

    let clause = clause.trim();
    Ok((!clause.is_empty()).then(|| clause.to_string()))
}

/// The text after a leading, case-insensitive `WHERE` keyword.
fn strip_where(line: &str) -> Option<&str> {
    let head = line.get(..WHERE_KEYWORD.len())?;
    if !head.eq_ignore_ascii_case(WHERE_KEYWORD) {
        return None;
    }
    let rest = &line[WHERE_KEYWORD.len()..];
    match rest.chars().next() {
        None => Some(rest),
        Some(c) if c.is_whitespace() || c == '(' => Some(rest),
        Some(_) => None,
    }
}
