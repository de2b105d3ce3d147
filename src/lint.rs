//! Lint and repair of taxonomy files.
//!
//! Loading a taxonomy stops at the first bad record. Linting reads the raw
//! records instead and reports every problem at once.

use crate::stanza::{self, Record};
use crate::taxonomy::RECORD_ORDER;
use crate::types::{EXTERN, Rank, canonical_name, parse_extern};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};

/// Severity of a lint issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LintSeverity {
    Error,
    Warning,
}

impl fmt::Display for LintSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LintSeverity::Error => write!(f, "error"),
            LintSeverity::Warning => write!(f, "warning"),
        }
    }
}

/// Whether a lint issue can be auto-fixed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fixable {
    Yes,
    No,
}

/// A single lint issue found in a file.
#[derive(Debug, Clone)]
pub struct LintIssue {
    pub file: PathBuf,
    /// 1-based record number.
    pub record: Option<usize>,
    pub taxon: Option<String>,
    pub severity: LintSeverity,
    pub message: String,
    pub fixable: Fixable,
}

impl fmt::Display for LintIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let file_display = self
            .file
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| self.file.display().to_string());
        let record_part = self
            .record
            .map(|r| format!(" record {}", r))
            .unwrap_or_default();
        let taxon_part = self
            .taxon
            .as_ref()
            .map(|name| format!(" ({})", name))
            .unwrap_or_default();
        write!(
            f,
            "{}: {}{}{}: {}",
            self.severity, file_display, record_part, taxon_part, self.message
        )
    }
}

/// Result of linting a taxonomy file.
#[derive(Debug, Clone)]
pub struct LintReport {
    pub issues: Vec<LintIssue>,
}

impl LintReport {
    pub fn errors(&self) -> Vec<&LintIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == LintSeverity::Error)
            .collect()
    }

    pub fn warnings(&self) -> Vec<&LintIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == LintSeverity::Warning)
            .collect()
    }

    pub fn fixable(&self) -> Vec<&LintIssue> {
        self.issues
            .iter()
            .filter(|i| i.fixable == Fixable::Yes)
            .collect()
    }

    pub fn has_errors(&self) -> bool {
        self.issues
            .iter()
            .any(|i| i.severity == LintSeverity::Error)
    }
}

/// A record with its name, parent and position in the file.
struct Entry {
    index: usize,
    name: String,
    parent: String,
    rank: Option<Rank>,
    correct: Option<bool>,
}

struct Linter<'a> {
    file: &'a Path,
    issues: Vec<LintIssue>,
}

impl Linter<'_> {
    fn push(
        &mut self,
        entry: Option<&Entry>,
        severity: LintSeverity,
        message: String,
        fixable: Fixable,
    ) {
        self.issues.push(LintIssue {
            file: self.file.to_path_buf(),
            record: entry.map(|e| e.index),
            taxon: entry.map(|e| e.name.clone()).filter(|n| !n.is_empty()),
            severity,
            message,
            fixable,
        });
    }

    fn error(&mut self, entry: &Entry, message: String) {
        self.push(Some(entry), LintSeverity::Error, message, Fixable::No);
    }
}

fn read_records(path: &Path) -> Result<Vec<Record>, String> {
    let file = fs::File::open(path).map_err(|e| format!("Cannot read file: {}", e))?;
    stanza::Reader::new(BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| format!("Invalid record syntax: {}", e))
}

/// Lint the taxonomy file at `path`.
pub fn lint_taxonomy(path: &Path) -> LintReport {
    let mut lint = Linter {
        file: path,
        issues: Vec::new(),
    };
    if !path.exists() {
        return LintReport { issues: Vec::new() };
    }
    let records = match read_records(path) {
        Ok(records) => records,
        Err(message) => {
            lint.push(None, LintSeverity::Error, message, Fixable::No);
            return LintReport {
                issues: lint.issues,
            };
        }
    };

    let entries: Vec<Entry> = records
        .iter()
        .enumerate()
        .map(|(i, rec)| Entry {
            index: i + 1,
            name: canonical_name(rec.get("name").map(String::as_str).unwrap_or("")),
            parent: canonical_name(rec.get("parent").map(String::as_str).unwrap_or("")),
            rank: rec
                .get("rank")
                .map(String::as_str)
                .unwrap_or("")
                .parse()
                .ok(),
            correct: match rec.get("correct").map(|v| v.trim()) {
                None | Some("") | Some("true") => Some(true),
                Some("false") => Some(false),
                Some(_) => None,
            },
        })
        .collect();

    // --- per record ---
    let mut by_name: HashMap<&str, &Entry> = HashMap::new();
    let mut externs: HashMap<String, String> = HashMap::new();
    for (entry, rec) in entries.iter().zip(&records) {
        if entry.name.is_empty() {
            lint.error(entry, "Missing name".to_string());
            continue;
        }
        if by_name.contains_key(entry.name.as_str()) {
            lint.error(entry, "Duplicate name".to_string());
        } else {
            by_name.insert(&entry.name, entry);
        }
        if entry.rank.is_none() {
            let raw = rec.get("rank").map(String::as_str).unwrap_or("");
            lint.error(entry, format!("Unknown rank '{}'", raw));
        }
        if entry.correct.is_none() {
            let raw = rec.get("correct").map(String::as_str).unwrap_or("");
            lint.error(entry, format!("Invalid correct value '{}'", raw));
        }
        if entry.correct == Some(false) && entry.parent.is_empty() {
            lint.error(entry, "Synonym without parent".to_string());
        }
        for token in rec.get(EXTERN).map(String::as_str).unwrap_or("").split_whitespace() {
            match parse_extern(token) {
                Some((_, id)) if !id.is_empty() => {
                    if let Some(owner) = externs.insert(token.to_string(), entry.name.clone()) {
                        lint.error(
                            entry,
                            format!("Extern {} already assigned to {}", token, owner),
                        );
                    }
                }
                _ => lint.error(entry, format!("Invalid extern token '{}'", token)),
            }
        }
    }

    // --- structure ---
    for entry in entries.iter().filter(|e| !e.name.is_empty()) {
        if entry.parent.is_empty() {
            continue;
        }
        let Some(parent) = by_name.get(entry.parent.as_str()) else {
            lint.error(entry, format!("Parent not found: {}", entry.parent));
            continue;
        };
        if parent.correct == Some(false) {
            lint.error(entry, format!("Parent is a synonym: {}", entry.parent));
        }
        if parent.index > entry.index {
            lint.push(
                Some(entry),
                LintSeverity::Warning,
                format!("Parent {} appears after its child", entry.parent),
                Fixable::Yes,
            );
        }
        check_rank(&mut lint, entry, &by_name);
    }

    LintReport {
        issues: lint.issues,
    }
}

/// The first ranked ancestor must be more inclusive. A synonym may share its
/// rank, even through unranked taxa in between.
fn check_rank(lint: &mut Linter<'_>, entry: &Entry, by_name: &HashMap<&str, &Entry>) {
    let Some(rank) = entry.rank.filter(Rank::is_ranked) else {
        return;
    };
    let mut seen = HashSet::new();
    let mut current = entry.parent.as_str();
    while let Some(ancestor) = by_name.get(current) {
        if !seen.insert(ancestor.name.as_str()) || ancestor.name == entry.name {
            lint.error(entry, "Parent chain forms a cycle".to_string());
            return;
        }
        if let Some(other) = ancestor.rank.filter(Rank::is_ranked) {
            let synonym = entry.correct == Some(false);
            if other > rank || (other == rank && !synonym) {
                lint.error(
                    entry,
                    format!(
                        "Rank {} is inconsistent with {} ({})",
                        rank, ancestor.name, other
                    ),
                );
            }
            return;
        }
        current = ancestor.parent.as_str();
    }
}

/// Apply auto-fixes for fixable issues. Returns a description of each fix.
pub fn fix_issues(path: &Path, report: &LintReport) -> Vec<String> {
    let mut fixed = Vec::new();
    if report.fixable().is_empty() {
        return fixed;
    }
    let Ok(records) = read_records(path) else {
        return fixed;
    };
    let ordered = parents_first(&records);
    let moved = ordered
        .iter()
        .enumerate()
        .filter(|(pos, index)| pos != *index)
        .count();
    if moved == 0 {
        return fixed;
    }

    match write_records(path, ordered.iter().map(|&i| &records[i])) {
        Ok(()) => fixed.push(format!(
            "Reordered {} records in {} so parents precede children",
            moved,
            path.display()
        )),
        Err(e) => tracing::warn!("cannot rewrite {}: {}", path.display(), e),
    }
    fixed
}

/// Record indexes in pre-order from the roots, siblings in file order.
/// Records not reachable from a root keep their relative order at the end.
fn parents_first(records: &[Record]) -> Vec<usize> {
    let names: Vec<String> = records
        .iter()
        .map(|r| canonical_name(r.get("name").map(String::as_str).unwrap_or("")))
        .collect();
    let known: HashSet<&str> = names.iter().map(String::as_str).collect();

    let mut children: HashMap<&str, Vec<usize>> = HashMap::new();
    let mut roots = Vec::new();
    for (i, rec) in records.iter().enumerate() {
        let parent = canonical_name(rec.get("parent").map(String::as_str).unwrap_or(""));
        if parent.is_empty() || !known.contains(parent.as_str()) {
            roots.push(i);
        } else if let Some(key) = known.get(parent.as_str()) {
            children.entry(*key).or_default().push(i);
        }
    }

    let mut out = Vec::with_capacity(records.len());
    let mut done = vec![false; records.len()];
    let mut stack: Vec<usize> = roots.into_iter().rev().collect();
    while let Some(i) = stack.pop() {
        if done[i] {
            continue;
        }
        done[i] = true;
        out.push(i);
        if let Some(kids) = children.get(names[i].as_str()) {
            stack.extend(kids.iter().rev());
        }
    }
    out.extend((0..records.len()).filter(|i| !done[*i]));
    out
}

fn write_records<'a>(
    path: &Path,
    records: impl Iterator<Item = &'a Record>,
) -> Result<(), crate::stanza::StanzaError> {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    let mut w = stanza::Writer::new(tmp.as_file_mut(), &RECORD_ORDER);
    for rec in records {
        w.write(rec)?;
    }
    w.flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::Db;
    use tempfile::TempDir;

    fn write(dir: &TempDir, content: &str) -> PathBuf {
        let path = dir.path().join("taxonomy.stz");
        fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_lint_missing_file_is_clean() {
        let dir = TempDir::new().unwrap();
        let report = lint_taxonomy(&dir.path().join("none.stz"));
        assert!(report.issues.is_empty());
    }

    #[test]
    fn test_lint_valid_taxonomy() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "name: Homo\nrank: genus\nextern: gbif:2436435\n%\n\
             name: Homo sapiens\nparent: Homo\nrank: species\n%\n\
             name: Homo primigenius\nparent: Homo sapiens\nrank: species\ncorrect: false\n%\n",
        );
        let report = lint_taxonomy(&path);
        assert!(report.issues.is_empty(), "{:?}", report.issues);
    }

    #[test]
    fn test_lint_syntax_error() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "name: Homo\nnot a field\n%\n");
        let report = lint_taxonomy(&path);
        assert_eq!(report.errors().len(), 1);
        assert!(report.errors()[0].message.contains("line 2"));
    }

    #[test]
    fn test_lint_reports_every_problem() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "name: Homo\nrank: genus\nextern: gbif:1\n%\n\
             name: Homo\n%\n\
             rank: genus\n%\n\
             name: Pan\nrank: tribe\ncorrect: maybe\n%\n\
             name: Gorilla\ncorrect: false\nextern: gbif:1\n%\n\
             name: Pongo\nparent: Simia\n%\n\
             name: Hominidae\nparent: Homo\nrank: family\n%\n",
        );
        let report = lint_taxonomy(&path);
        let messages: Vec<&str> = report.errors().iter().map(|i| i.message.as_str()).collect();

        assert!(messages.contains(&"Duplicate name"));
        assert!(messages.contains(&"Missing name"));
        assert!(messages.contains(&"Unknown rank 'tribe'"));
        assert!(messages.contains(&"Invalid correct value 'maybe'"));
        assert!(messages.contains(&"Synonym without parent"));
        assert!(messages.contains(&"Extern gbif:1 already assigned to Homo"));
        assert!(messages.contains(&"Parent not found: Simia"));
        assert!(messages.contains(&"Rank family is inconsistent with Homo (genus)"));
        assert!(report.warnings().is_empty());
    }

    #[test]
    fn test_lint_synonym_parent_and_same_rank() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "name: Homo\nrank: genus\n%\n\
             name: Pithecanthropus\nparent: Homo\nrank: genus\ncorrect: false\n%\n\
             name: Homo erectus\nparent: Pithecanthropus\nrank: species\n%\n\
             name: Australopithecus\nparent: Homo\nrank: genus\n%\n",
        );
        let report = lint_taxonomy(&path);
        let messages: Vec<&str> = report.errors().iter().map(|i| i.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "Parent is a synonym: Pithecanthropus",
                "Rank genus is inconsistent with Homo (genus)",
            ]
        );
    }

    #[test]
    fn test_lint_same_rank_synonym_through_unranked_parent() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "name: Homo\nrank: genus\n%\n\
             name: Incertae sedis\nparent: Homo\n%\n\
             name: Pithecanthropus\nparent: Incertae sedis\nrank: genus\ncorrect: false\n%\n",
        );
        assert!(Db::open(&path).is_ok());
        let report = lint_taxonomy(&path);
        assert!(report.issues.is_empty(), "{:?}", report.issues);
    }

    #[test]
    fn test_lint_and_fix_order() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "name: Homo sapiens\nparent: Homo\nrank: species\n%\n\
             name: Pan\nrank: genus\n%\n\
             name: Homo\nrank: genus\nauthor: Linnaeus\n%\n",
        );
        assert!(Db::open(&path).is_err());

        let report = lint_taxonomy(&path);
        assert!(!report.has_errors());
        assert_eq!(report.fixable().len(), 1);
        assert!(report.warnings()[0].to_string().contains("(Homo sapiens)"));

        let fixed = fix_issues(&path, &report);
        assert_eq!(fixed.len(), 1);
        assert!(lint_taxonomy(&path).issues.is_empty());

        let db = Db::open(&path).unwrap();
        assert_eq!(db.walk(), vec!["Pan", "Homo", "Homo sapiens"]);
        assert_eq!(db.taxon("Homo").unwrap().value("author"), "Linnaeus");
    }

    #[test]
    fn test_lint_issue_display() {
        let issue = LintIssue {
            file: PathBuf::from("/tmp/taxonomy.stz"),
            record: Some(3),
            taxon: Some("Homo".to_string()),
            severity: LintSeverity::Error,
            message: "Duplicate name".to_string(),
            fixable: Fixable::No,
        };
        assert_eq!(
            issue.to_string(),
            "error: taxonomy.stz record 3 (Homo): Duplicate name"
        );
    }
}
