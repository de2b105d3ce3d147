//! The local taxonomy tree.
//!
//! A [`Db`] owns every taxon, indexed by canonical name, and keeps three
//! invariants on every mutation:
//!
//! 1. a parent exists before its children and is always a correct name;
//! 2. synonyms are never attached to the root;
//! 3. walking up from a taxon (skipping unranked taxa) the first ranked
//!    ancestor has a more inclusive rank, except for a synonym that may share
//!    the rank of its senior.
//!
//! Rejected operations leave the tree untouched.

use crate::stanza::{self, Record, StanzaError, is_valid_key};
use crate::types::{
    EXTERN, PROTECTED_KEYS, Rank, TaxonRecord, canonical_name, id_to_name, merge_extern,
    name_to_id, parse_extern,
};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Key order used when writing taxon records.
pub const RECORD_ORDER: [&str; 4] = ["name", "parent", "rank", "correct"];

#[derive(Error, Debug)]
pub enum TaxonomyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Stanza(#[from] StanzaError),
    #[error("Record {record}: {message}")]
    InvalidRecord { record: usize, message: String },
    #[error("Empty taxon name")]
    EmptyName,
    #[error("Empty taxon id")]
    EmptyId,
    #[error("Taxon already in database: {0}")]
    AlreadyExists(String),
    #[error("Taxon not found: {0}")]
    NotFound(String),
    #[error("Parent of {name} not found: {parent}")]
    ParentNotFound { name: String, parent: String },
    #[error("Parent of {name} is a synonym: {parent}")]
    SynonymParent { name: String, parent: String },
    #[error("Synonym {0} must have a parent")]
    SynonymWithoutParent(String),
    #[error("Rank {rank} of {name} is inconsistent with {other} ({other_rank})")]
    RankInconsistent {
        name: String,
        rank: Rank,
        other: String,
        other_rank: Rank,
    },
    #[error("Cannot move {name} under itself or its descendant {parent}")]
    Cycle { name: String, parent: String },
    #[error("Field '{0}' can not be set directly")]
    ProtectedField(String),
    #[error("Invalid field name '{0}'")]
    InvalidKey(String),
    #[error("Invalid extern value '{0}', expecting service:id")]
    InvalidExtern(String),
    #[error("Extern {token} already assigned to {name}")]
    ExternInUse { token: String, name: String },
    #[error("Database has no backing file")]
    NoPath,
}

/// A taxon stored in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Taxon {
    name: String,
    parent: String,
    rank: Rank,
    correct: bool,
    fields: BTreeMap<String, String>,
    children: Vec<String>,
}

impl Taxon {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the parent, empty for root taxa.
    pub fn parent(&self) -> &str {
        &self.parent
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn is_correct(&self) -> bool {
        self.correct
    }

    pub fn value(&self, key: &str) -> &str {
        self.fields.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn fields(&self) -> &BTreeMap<String, String> {
        &self.fields
    }

    pub fn extern_id(&self, service: &str) -> Option<&str> {
        crate::types::extern_id(self.value(EXTERN), service)
    }

    pub fn to_record(&self) -> TaxonRecord {
        TaxonRecord {
            id: name_to_id(&self.name),
            name: self.name.clone(),
            parent: name_to_id(&self.parent),
            rank: self.rank,
            correct: self.correct,
            fields: self.fields.clone(),
        }
    }

    fn to_stanza(&self) -> Record {
        let mut rec = self.fields.clone();
        rec.insert("name".to_string(), self.name.clone());
        if !self.parent.is_empty() {
            rec.insert("parent".to_string(), self.parent.clone());
        }
        if self.rank.is_ranked() {
            rec.insert("rank".to_string(), self.rank.to_string());
        }
        if !self.correct {
            rec.insert("correct".to_string(), "false".to_string());
        }
        rec
    }
}

/// The taxonomy tree.
#[derive(Debug, Default)]
pub struct Db {
    path: Option<PathBuf>,
    taxa: HashMap<String, Taxon>,
    root: Vec<String>,
    externs: HashMap<String, String>,
    dirty: bool,
}

impl Db {
    /// An empty, in-memory tree.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a taxonomy file. A missing file yields an empty tree bound to
    /// `path`.
    pub fn open(path: &Path) -> Result<Self, TaxonomyError> {
        let mut db = Db {
            path: Some(path.to_path_buf()),
            ..Default::default()
        };
        if !path.exists() {
            return Ok(db);
        }
        let file = fs::File::open(path)?;
        for (i, rec) in stanza::Reader::new(BufReader::new(file)).enumerate() {
            db.load_record(i + 1, rec?)?;
        }
        db.dirty = false;
        Ok(db)
    }

    fn load_record(&mut self, index: usize, mut rec: Record) -> Result<(), TaxonomyError> {
        let invalid = |message: String| TaxonomyError::InvalidRecord {
            record: index,
            message,
        };
        let name = rec.remove("name").unwrap_or_default();
        let parent = rec.remove("parent").unwrap_or_default();
        let rank: Rank = rec
            .remove("rank")
            .unwrap_or_default()
            .parse()
            .map_err(invalid)?;
        let correct = match rec.remove("correct").as_deref() {
            None | Some("true") | Some("") => true,
            Some("false") => false,
            Some(other) => return Err(invalid(format!("invalid correct value '{}'", other))),
        };

        let name = self
            .add(&name, &parent, rank, correct)
            .map_err(|e| invalid(e.to_string()))?
            .name
            .clone();

        if let Some(tokens) = rec.remove(EXTERN) {
            for token in tokens.split_whitespace() {
                self.set_value(&name, EXTERN, token)
                    .map_err(|e| invalid(e.to_string()))?;
            }
        }
        for (key, value) in rec {
            self.set_value(&name, &key, &value)
                .map_err(|e| invalid(e.to_string()))?;
        }
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.taxa.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taxa.is_empty()
    }

    /// Exact lookup by canonical name.
    pub fn taxon(&self, name: &str) -> Option<&Taxon> {
        self.taxa.get(&canonical_name(name))
    }

    /// Lookup by id. In the local tree the id is the name, with underscores
    /// standing for spaces.
    pub fn taxon_by_id(&self, id: &str) -> Result<Option<&Taxon>, TaxonomyError> {
        if id.trim().is_empty() {
            return Err(TaxonomyError::EmptyId);
        }
        Ok(self.taxa.get(&id_to_name(id)))
    }

    /// The taxon tagged with `service:id`.
    pub fn taxon_by_extern(&self, service: &str, id: &str) -> Option<&Taxon> {
        self.externs
            .get(&format!("{}:{}", service, id))
            .and_then(|name| self.taxa.get(name))
    }

    /// Correct children of `parent`, or the root taxa when `parent` is empty.
    pub fn children(&self, parent: &str) -> Vec<&Taxon> {
        let parent = canonical_name(parent);
        if parent.is_empty() {
            return self.root.iter().filter_map(|n| self.taxa.get(n)).collect();
        }
        self.taxa
            .get(&parent)
            .map(|p| {
                p.children
                    .iter()
                    .filter_map(|n| self.taxa.get(n))
                    .filter(|t| t.correct)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Synonyms attached to `name`.
    pub fn synonyms(&self, name: &str) -> Vec<&Taxon> {
        self.taxa
            .get(&canonical_name(name))
            .map(|p| {
                p.children
                    .iter()
                    .filter_map(|n| self.taxa.get(n))
                    .filter(|t| !t.correct)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Ancestors of `name`, nearest first.
    pub fn parents(&self, name: &str) -> Vec<&Taxon> {
        let mut out = Vec::new();
        let mut cur = self.taxa.get(&canonical_name(name)).map(|t| t.parent.as_str());
        while let Some(p) = cur.filter(|p| !p.is_empty()) {
            let Some(t) = self.taxa.get(p) else { break };
            out.push(t);
            cur = Some(t.parent.as_str());
        }
        out
    }

    /// The rank of `name`, or of its nearest ranked ancestor when unranked.
    pub fn effective_rank(&self, name: &str) -> Rank {
        let Some(t) = self.taxon(name) else {
            return Rank::Unranked;
        };
        if t.rank.is_ranked() {
            return t.rank;
        }
        self.parents(name)
            .into_iter()
            .map(|p| p.rank)
            .find(Rank::is_ranked)
            .unwrap_or(Rank::Unranked)
    }

    /// Whether `ancestor` is found walking up from `name`.
    pub fn is_descendant(&self, name: &str, ancestor: &str) -> bool {
        let ancestor = canonical_name(ancestor);
        self.parents(name).iter().any(|p| p.name == ancestor)
    }

    /// All names in pre-order: each taxon before its children and synonyms.
    pub fn walk(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.taxa.len());
        let mut stack: Vec<&String> = self.root.iter().rev().collect();
        while let Some(name) = stack.pop() {
            out.push(name.clone());
            if let Some(t) = self.taxa.get(name) {
                stack.extend(t.children.iter().rev());
            }
        }
        out
    }

    /// Add a new taxon.
    pub fn add(
        &mut self,
        name: &str,
        parent: &str,
        rank: Rank,
        correct: bool,
    ) -> Result<&Taxon, TaxonomyError> {
        let name = canonical_name(name);
        let parent = canonical_name(parent);
        if name.is_empty() {
            return Err(TaxonomyError::EmptyName);
        }
        if self.taxa.contains_key(&name) {
            return Err(TaxonomyError::AlreadyExists(name));
        }
        self.check_parent(&name, &parent, correct)?;
        self.check_rank_up(&name, &parent, rank, correct)?;

        if parent.is_empty() {
            self.root.push(name.clone());
        } else if let Some(p) = self.taxa.get_mut(&parent) {
            p.children.push(name.clone());
        }
        self.taxa.insert(
            name.clone(),
            Taxon {
                name: name.clone(),
                parent,
                rank,
                correct,
                fields: BTreeMap::new(),
                children: Vec::new(),
            },
        );
        self.dirty = true;
        Ok(&self.taxa[&name])
    }

    /// Move `name` under `parent` with the given status. An empty `parent`
    /// moves it to the root.
    ///
    /// Every descendant of `name` becomes a direct child of `parent`, keeping
    /// its own rank and status. The move fails if any of them would break a
    /// tree invariant there, such as a synonym ending up at the root.
    pub fn move_taxon(
        &mut self,
        name: &str,
        parent: &str,
        correct: bool,
    ) -> Result<(), TaxonomyError> {
        let name = canonical_name(name);
        let parent = canonical_name(parent);
        let tax = self
            .taxa
            .get(&name)
            .ok_or_else(|| TaxonomyError::NotFound(name.clone()))?;
        if tax.parent == parent && tax.correct == correct && tax.children.is_empty() {
            return Ok(());
        }
        self.check_move(&name, &parent, correct)?;
        let descendants = self.descendants(&name);
        for d in &descendants {
            let Some(t) = self.taxa.get(d) else { continue };
            self.check_parent(d, &parent, t.correct)?;
            self.check_rank_up(d, &parent, t.rank, t.correct)?;
        }

        self.relink(&name, &parent, correct);
        if let Some(t) = self.taxa.get_mut(&name) {
            t.children.clear();
        }
        for d in &descendants {
            if let Some(t) = self.taxa.get_mut(d) {
                t.children.clear();
                t.parent = parent.clone();
            }
            self.attach(d, &parent);
        }
        self.dirty = true;
        Ok(())
    }

    /// Move `name` under `parent` keeping its subtree in place. Used when
    /// reconciling with a remote taxonomy, where a genus placed under its
    /// family must keep its species. A taxon that ends up as a synonym can
    /// not hold descendants, so its children and synonyms are re-attached
    /// to the new parent.
    pub(crate) fn relocate(
        &mut self,
        name: &str,
        parent: &str,
        correct: bool,
    ) -> Result<(), TaxonomyError> {
        let name = canonical_name(name);
        let parent = canonical_name(parent);
        let tax = self
            .taxa
            .get(&name)
            .ok_or_else(|| TaxonomyError::NotFound(name.clone()))?;
        if tax.parent == parent && tax.correct == correct {
            return Ok(());
        }
        self.check_move(&name, &parent, correct)?;
        let tax = &self.taxa[&name];
        if !correct || !tax.rank.is_ranked() {
            self.check_rank_below(&parent, &tax.children)?;
        }

        self.relink(&name, &parent, correct);
        let moved_children = if correct {
            Vec::new()
        } else {
            self.taxa
                .get_mut(&name)
                .map(|t| std::mem::take(&mut t.children))
                .unwrap_or_default()
        };
        for child in &moved_children {
            if let Some(c) = self.taxa.get_mut(child) {
                c.parent = parent.clone();
            }
        }
        if let Some(p) = self.taxa.get_mut(&parent) {
            p.children.extend(moved_children);
        }
        self.dirty = true;
        Ok(())
    }

    /// Change the rank of `name`.
    pub fn set_rank(&mut self, name: &str, rank: Rank) -> Result<(), TaxonomyError> {
        let name = canonical_name(name);
        let tax = self
            .taxa
            .get(&name)
            .ok_or_else(|| TaxonomyError::NotFound(name.clone()))?;
        if tax.rank == rank {
            return Ok(());
        }
        self.check_rank_up(&name, &tax.parent, rank, tax.correct)?;
        self.check_rank_down(&name, rank)?;
        if let Some(t) = self.taxa.get_mut(&name) {
            t.rank = rank;
        }
        self.dirty = true;
        Ok(())
    }

    /// Remove `name`. With `recurse` the whole subtree goes with it;
    /// otherwise children and synonyms are re-attached to the parent of the
    /// deleted taxon. Synonyms of a deleted root taxon are removed, as they
    /// can not be attached to the root.
    pub fn delete(&mut self, name: &str, recurse: bool) -> Result<(), TaxonomyError> {
        let name = canonical_name(name);
        let tax = self
            .taxa
            .get(&name)
            .ok_or_else(|| TaxonomyError::NotFound(name.clone()))?;
        let parent = tax.parent.clone();
        let children = tax.children.clone();

        self.detach(&name, &parent);
        if recurse {
            for child in &children {
                self.remove_subtree(child);
            }
        } else {
            for child in &children {
                let synonym = self.taxa.get(child).is_some_and(|c| !c.correct);
                if parent.is_empty() && synonym {
                    self.remove_subtree(child);
                    continue;
                }
                if let Some(c) = self.taxa.get_mut(child) {
                    c.parent = parent.clone();
                }
                self.attach(child, &parent);
            }
        }
        self.remove_node(&name);
        self.dirty = true;
        Ok(())
    }

    /// Set a free field of `name`. An empty value removes the field.
    ///
    /// For the `extern` field the value is a single `service:id` token that
    /// replaces the previous token of that service (`service:` removes it).
    pub fn set_value(&mut self, name: &str, key: &str, value: &str) -> Result<(), TaxonomyError> {
        let name = canonical_name(name);
        let key = key.trim().to_lowercase();
        let value = value.trim();
        if !is_valid_key(&key) {
            return Err(TaxonomyError::InvalidKey(key));
        }
        if PROTECTED_KEYS.contains(&key.as_str()) {
            return Err(TaxonomyError::ProtectedField(key));
        }
        let tax = self
            .taxa
            .get(&name)
            .ok_or_else(|| TaxonomyError::NotFound(name.clone()))?;

        if key == EXTERN {
            let (service, id) =
                parse_extern(value).ok_or_else(|| TaxonomyError::InvalidExtern(value.to_string()))?;
            let token = format!("{}:{}", service, id);
            if !id.is_empty() {
                if let Some(owner) = self.externs.get(&token).filter(|o| **o != name) {
                    return Err(TaxonomyError::ExternInUse {
                        token,
                        name: owner.clone(),
                    });
                }
            }
            let old = tax.extern_id(service).map(|old| format!("{}:{}", service, old));
            let merged = merge_extern(tax.value(EXTERN), service, id);
            if let Some(old) = old {
                self.externs.remove(&old);
            }
            if !id.is_empty() {
                self.externs.insert(token, name.clone());
            }
            self.store_field(&name, EXTERN, merged);
            return Ok(());
        }

        self.store_field(&name, &key, value.to_string());
        Ok(())
    }

    /// Convenience for tagging a taxon with a remote id.
    pub fn set_extern(&mut self, name: &str, service: &str, id: &str) -> Result<(), TaxonomyError> {
        self.set_value(name, EXTERN, &format!("{}:{}", service, id))
    }

    fn store_field(&mut self, name: &str, key: &str, value: String) {
        let Some(t) = self.taxa.get_mut(name) else {
            return;
        };
        let changed = if value.is_empty() {
            t.fields.remove(key).is_some()
        } else {
            t.fields.insert(key.to_string(), value.clone()).as_ref() != Some(&value)
        };
        if changed {
            self.dirty = true;
        }
    }

    /// Write the tree if it changed since it was loaded.
    pub fn commit(&mut self) -> Result<(), TaxonomyError> {
        if !self.dirty {
            return Ok(());
        }
        let path = self.path.clone().ok_or(TaxonomyError::NoPath)?;
        let dir = match path.parent() {
            Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        self.write_to(tmp.as_file_mut())?;
        tmp.persist(&path).map_err(|e| e.error)?;
        self.dirty = false;
        tracing::debug!(path = %path.display(), taxa = self.taxa.len(), "taxonomy committed");
        Ok(())
    }

    /// Serialize every taxon, parents before children.
    pub fn write_to<W: Write>(&self, out: W) -> Result<(), TaxonomyError> {
        let mut w = stanza::Writer::new(out, &RECORD_ORDER);
        for name in self.walk() {
            if let Some(t) = self.taxa.get(&name) {
                w.write(&t.to_stanza())?;
            }
        }
        w.flush()?;
        Ok(())
    }

    /// Checks moving `name` itself under `parent` with status `correct`.
    fn check_move(&self, name: &str, parent: &str, correct: bool) -> Result<(), TaxonomyError> {
        if parent == name || (!parent.is_empty() && self.is_descendant(parent, name)) {
            return Err(TaxonomyError::Cycle {
                name: name.to_string(),
                parent: parent.to_string(),
            });
        }
        self.check_parent(name, parent, correct)?;
        let rank = self.taxa.get(name).map(|t| t.rank).unwrap_or_default();
        self.check_rank_up(name, parent, rank, correct)
    }

    /// Descendants of `name` in pre-order, not including `name`.
    fn descendants(&self, name: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack: Vec<&String> = match self.taxa.get(name) {
            Some(t) => t.children.iter().rev().collect(),
            None => return out,
        };
        while let Some(n) = stack.pop() {
            out.push(n.clone());
            if let Some(t) = self.taxa.get(n) {
                stack.extend(t.children.iter().rev());
            }
        }
        out
    }

    /// Detach `name` from its parent and attach it under `parent`.
    fn relink(&mut self, name: &str, parent: &str, correct: bool) {
        let old_parent = self
            .taxa
            .get(name)
            .map(|t| t.parent.clone())
            .unwrap_or_default();
        self.detach(name, &old_parent);
        self.attach(name, parent);
        if let Some(t) = self.taxa.get_mut(name) {
            t.parent = parent.to_string();
            t.correct = correct;
        }
    }

    fn check_parent(&self, name: &str, parent: &str, correct: bool) -> Result<(), TaxonomyError> {
        if parent.is_empty() {
            if !correct {
                return Err(TaxonomyError::SynonymWithoutParent(name.to_string()));
            }
            return Ok(());
        }
        let p = self
            .taxa
            .get(parent)
            .ok_or_else(|| TaxonomyError::ParentNotFound {
                name: name.to_string(),
                parent: parent.to_string(),
            })?;
        if !p.correct {
            return Err(TaxonomyError::SynonymParent {
                name: name.to_string(),
                parent: parent.to_string(),
            });
        }
        Ok(())
    }

    /// Checks `rank` against the first ranked taxon found walking up from
    /// `parent`.
    fn check_rank_up(
        &self,
        name: &str,
        parent: &str,
        rank: Rank,
        correct: bool,
    ) -> Result<(), TaxonomyError> {
        if !rank.is_ranked() {
            return Ok(());
        }
        let mut cur = parent;
        while !cur.is_empty() {
            let Some(p) = self.taxa.get(cur) else { break };
            if p.rank.is_ranked() {
                if p.rank < rank || (p.rank == rank && !correct) {
                    return Ok(());
                }
                return Err(TaxonomyError::RankInconsistent {
                    name: name.to_string(),
                    rank,
                    other: p.name.clone(),
                    other_rank: p.rank,
                });
            }
            cur = &p.parent;
        }
        Ok(())
    }

    /// Checks `rank` for `name` against its nearest ranked descendants.
    fn check_rank_down(&self, name: &str, rank: Rank) -> Result<(), TaxonomyError> {
        if !rank.is_ranked() {
            return Ok(());
        }
        let Some(tax) = self.taxa.get(name) else {
            return Ok(());
        };
        let mut stack: Vec<&String> = tax.children.iter().collect();
        while let Some(c) = stack.pop() {
            let Some(child) = self.taxa.get(c) else { continue };
            if !child.rank.is_ranked() {
                stack.extend(child.children.iter());
                continue;
            }
            if rank < child.rank || (rank == child.rank && !child.correct) {
                continue;
            }
            return Err(TaxonomyError::RankInconsistent {
                name: name.to_string(),
                rank,
                other: child.name.clone(),
                other_rank: child.rank,
            });
        }
        Ok(())
    }

    /// Checks that `names` (and the ranked descendants of unranked ones)
    /// would fit under `parent`.
    fn check_rank_below(&self, parent: &str, names: &[String]) -> Result<(), TaxonomyError> {
        for n in names {
            let Some(t) = self.taxa.get(n) else { continue };
            if t.rank.is_ranked() {
                self.check_rank_up(&t.name, parent, t.rank, t.correct)?;
            } else {
                self.check_rank_below(parent, &t.children)?;
            }
        }
        Ok(())
    }

    fn detach(&mut self, name: &str, parent: &str) {
        if parent.is_empty() {
            self.root.retain(|n| n != name);
        } else if let Some(p) = self.taxa.get_mut(parent) {
            p.children.retain(|n| n != name);
        }
    }

    fn attach(&mut self, name: &str, parent: &str) {
        if parent.is_empty() {
            self.root.push(name.to_string());
        } else if let Some(p) = self.taxa.get_mut(parent) {
            p.children.push(name.to_string());
        }
    }

    fn remove_subtree(&mut self, name: &str) {
        let children = self
            .taxa
            .get(name)
            .map(|t| t.children.clone())
            .unwrap_or_default();
        for child in &children {
            self.remove_subtree(child);
        }
        self.remove_node(name);
    }

    fn remove_node(&mut self, name: &str) {
        if let Some(t) = self.taxa.remove(name) {
            for token in t.value(EXTERN).split_whitespace() {
                self.externs.remove(token);
            }
        }
    }
}

impl crate::query::Taxonomy for Db {
    fn lookup_name(&self, name: &str) -> crate::query::Scan<'_> {
        let found: Vec<_> = self.taxon(name).map(Taxon::to_record).into_iter().collect();
        Box::new(found.into_iter().map(Ok))
    }

    fn lookup_id(&self, id: &str) -> Result<Option<TaxonRecord>, crate::query::QueryError> {
        Ok(self.taxon_by_id(id)?.map(Taxon::to_record))
    }

    fn scan_children(&self, id: &str) -> crate::query::Scan<'_> {
        let recs: Vec<_> = self
            .children(&id_to_name(id))
            .into_iter()
            .map(Taxon::to_record)
            .collect();
        Box::new(recs.into_iter().map(Ok))
    }

    fn scan_synonyms(&self, id: &str) -> crate::query::Scan<'_> {
        let recs: Vec<_> = self
            .synonyms(&id_to_name(id))
            .into_iter()
            .map(Taxon::to_record)
            .collect();
        Box::new(recs.into_iter().map(Ok))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Asserts the three structural invariants over every taxon.
    pub(crate) fn assert_invariants(db: &Db) {
        for name in db.walk() {
            let t = db.taxon(&name).unwrap();
            if t.parent().is_empty() {
                assert!(t.is_correct(), "synonym {} at root", name);
            } else {
                let p = db.taxon(t.parent()).unwrap();
                assert!(p.is_correct(), "{} has synonym parent {}", name, p.name());
            }
            if t.rank().is_ranked() {
                if let Some(a) = db.parents(&name).into_iter().find(|a| a.rank().is_ranked()) {
                    assert!(
                        a.rank() < t.rank() || (a.rank() == t.rank() && !t.is_correct()),
                        "{} ({}) under {} ({})",
                        name,
                        t.rank(),
                        a.name(),
                        a.rank()
                    );
                }
            }
        }
        assert_eq!(db.walk().len(), db.len());
    }

    fn names(taxa: Vec<&Taxon>) -> Vec<String> {
        taxa.into_iter().map(|t| t.name().to_string()).collect()
    }

    fn hominids() -> Db {
        let mut db = Db::new();
        db.add("Hominidae", "", Rank::Family, true).unwrap();
        db.add("Homo", "Hominidae", Rank::Genus, true).unwrap();
        db.add("Homo sapiens", "Homo", Rank::Species, true).unwrap();
        db.add("Pan", "Hominidae", Rank::Genus, true).unwrap();
        db.add("Pan troglodytes", "Pan", Rank::Species, true).unwrap();
        db
    }

    #[test]
    fn test_add_and_lookup() {
        let mut db = Db::new();
        db.add("homo", "", Rank::Genus, true).unwrap();
        db.add("Homo  sapiens", "Homo", Rank::Species, true).unwrap();

        let t = db.taxon("homo sapiens").unwrap();
        assert_eq!(t.name(), "Homo sapiens");
        assert_eq!(t.parent(), "Homo");
        assert_eq!(names(db.children("")), vec!["Homo"]);
        assert_eq!(names(db.children("Homo")), vec!["Homo sapiens"]);
        assert!(db.is_dirty());
    }

    #[test]
    fn test_add_same_rank_as_parent_fails() {
        let mut db = Db::new();
        db.add("Homo", "", Rank::Genus, true).unwrap();
        db.add("Homo sapiens", "Homo", Rank::Species, true).unwrap();
        let err = db.add("Homo erectus", "Homo", Rank::Genus, true).unwrap_err();
        assert!(matches!(err, TaxonomyError::RankInconsistent { .. }));
        assert!(db.taxon("Homo erectus").is_none());
    }

    #[test]
    fn test_add_synonym_at_root_fails() {
        let mut db = Db::new();
        let err = db
            .add("Pithecanthropus erectus", "", Rank::Species, false)
            .unwrap_err();
        assert!(matches!(err, TaxonomyError::SynonymWithoutParent(_)));
        assert!(db.is_empty());
    }

    #[test]
    fn test_add_synonym_same_rank_allowed() {
        let mut db = Db::new();
        db.add("Homo", "", Rank::Genus, true).unwrap();
        db.add("Pithecanthropus", "Homo", Rank::Genus, false).unwrap();
        assert_eq!(names(db.synonyms("Homo")), vec!["Pithecanthropus"]);
        assert!(db.children("Homo").is_empty());
    }

    #[test]
    fn test_add_rejections() {
        let mut db = hominids();
        db.add("Pithecanthropus", "Homo", Rank::Genus, false).unwrap();

        assert!(matches!(
            db.add("", "", Rank::Genus, true),
            Err(TaxonomyError::EmptyName)
        ));
        assert!(matches!(
            db.add("Homo", "", Rank::Genus, true),
            Err(TaxonomyError::AlreadyExists(_))
        ));
        assert!(matches!(
            db.add("Gorilla gorilla", "Gorilla", Rank::Species, true),
            Err(TaxonomyError::ParentNotFound { .. })
        ));
        assert!(matches!(
            db.add("Pithecanthropus erectus", "Pithecanthropus", Rank::Species, true),
            Err(TaxonomyError::SynonymParent { .. })
        ));
        assert!(matches!(
            db.add("Primates", "Hominidae", Rank::Order, true),
            Err(TaxonomyError::RankInconsistent { .. })
        ));
    }

    #[test]
    fn test_rank_checked_through_unranked_ancestors() {
        let mut db = Db::new();
        db.add("Hominidae", "", Rank::Family, true).unwrap();
        db.add("Homininae", "Hominidae", Rank::Unranked, true).unwrap();
        db.add("Homo", "Homininae", Rank::Genus, true).unwrap();
        assert!(db.add("Hominini", "Homininae", Rank::Family, true).is_err());
        assert_eq!(db.effective_rank("Homininae"), Rank::Family);
    }

    #[test]
    fn test_taxon_by_id_empty() {
        let db = hominids();
        assert!(matches!(db.taxon_by_id(""), Err(TaxonomyError::EmptyId)));
        assert!(db.taxon_by_id("Homo").unwrap().is_some());
        assert_eq!(
            db.taxon_by_id("Homo_sapiens").unwrap().unwrap().name(),
            "Homo sapiens"
        );
        assert!(db.taxon_by_id("Gorilla").unwrap().is_none());
    }

    #[test]
    fn test_move_flattens_descendants() {
        let mut db = hominids();
        db.add("Homininae", "Hominidae", Rank::Unranked, true).unwrap();
        db.add("Homo erectus", "Homo", Rank::Species, true).unwrap();
        db.add("Pithecanthropus", "Homo", Rank::Genus, false).unwrap();
        db.add("Sinanthropus", "Homo erectus", Rank::Species, false).unwrap();

        db.move_taxon("Homo", "Homininae", true).unwrap();

        assert_eq!(db.taxon("Homo").unwrap().parent(), "Homininae");
        assert!(db.children("Homo").is_empty());
        assert!(db.synonyms("Homo").is_empty());
        for former in ["Homo sapiens", "Homo erectus", "Pithecanthropus", "Sinanthropus"] {
            assert_eq!(db.taxon(former).unwrap().parent(), "Homininae", "{}", former);
        }
        assert!(!db.taxon("Sinanthropus").unwrap().is_correct());
        assert_eq!(
            names(db.synonyms("Homininae")),
            vec!["Sinanthropus", "Pithecanthropus"]
        );
        assert_invariants(&db);
    }

    #[test]
    fn test_move_in_place_flattens_descendants() {
        let mut db = hominids();
        db.move_taxon("Homo", "Hominidae", true).unwrap();
        assert_eq!(db.taxon("Homo sapiens").unwrap().parent(), "Hominidae");
        assert!(db.children("Homo").is_empty());
        assert_invariants(&db);
    }

    #[test]
    fn test_move_rejects_synonym_descendants_at_root() {
        let mut db = hominids();
        db.add("Pithecanthropus", "Homo", Rank::Genus, false).unwrap();
        assert!(matches!(
            db.move_taxon("Homo", "", true),
            Err(TaxonomyError::SynonymWithoutParent(_))
        ));
        assert_eq!(db.taxon("Homo").unwrap().parent(), "Hominidae");
        assert_eq!(db.taxon("Pithecanthropus").unwrap().parent(), "Homo");

        db.delete("Pithecanthropus", false).unwrap();
        db.move_taxon("Homo", "", true).unwrap();
        assert_eq!(names(db.children("")), vec!["Hominidae", "Homo", "Homo sapiens"]);
        assert_invariants(&db);
    }

    #[test]
    fn test_relocate_keeps_subtree() {
        let mut db = hominids();
        db.add("Homininae", "Hominidae", Rank::Unranked, true).unwrap();
        db.relocate("Homo", "Homininae", true).unwrap();

        assert_eq!(db.taxon("Homo").unwrap().parent(), "Homininae");
        assert_eq!(db.taxon("Homo sapiens").unwrap().parent(), "Homo");
        assert_invariants(&db);
    }

    #[test]
    fn test_move_as_synonym_flattens_descendants() {
        let mut db = hominids();
        db.add("Pan paniscus", "Pan", Rank::Species, true).unwrap();
        db.add("Chimpansee", "Pan", Rank::Genus, false).unwrap();
        db.add("Anthropopithecus", "Hominidae", Rank::Genus, true).unwrap();
        db.add("Anthropopithecus niger", "Anthropopithecus", Rank::Species, false)
            .unwrap();

        db.move_taxon("Pan", "Homo", false).unwrap();

        assert!(!db.taxon("Pan").unwrap().is_correct());
        for former in ["Pan troglodytes", "Pan paniscus", "Chimpansee"] {
            assert_eq!(db.taxon(former).unwrap().parent(), "Homo", "{}", former);
        }
        assert!(names(db.synonyms("Homo")).contains(&"Chimpansee".to_string()));
        assert_invariants(&db);
    }

    #[test]
    fn test_move_rejections_leave_tree_untouched() {
        let mut db = hominids();
        db.add("Pithecanthropus", "Homo", Rank::Genus, false).unwrap();

        assert!(matches!(
            db.move_taxon("Hominidae", "Homo", true),
            Err(TaxonomyError::Cycle { .. })
        ));
        assert!(matches!(
            db.move_taxon("Homo", "Homo", true),
            Err(TaxonomyError::Cycle { .. })
        ));
        assert!(matches!(
            db.move_taxon("Homo sapiens", "Pithecanthropus", true),
            Err(TaxonomyError::SynonymParent { .. })
        ));
        assert!(matches!(
            db.move_taxon("Homo", "", false),
            Err(TaxonomyError::SynonymWithoutParent(_))
        ));
        assert!(matches!(
            db.move_taxon("Pan", "Homo", true),
            Err(TaxonomyError::RankInconsistent { .. })
        ));
        assert_eq!(db.taxon("Pan").unwrap().parent(), "Hominidae");
        assert!(db.taxon("Pan").unwrap().is_correct());
        assert_invariants(&db);
    }

    #[test]
    fn test_move_unranked_checks_descendants() {
        let mut db = Db::new();
        db.add("Primates", "", Rank::Order, true).unwrap();
        db.add("Homo", "Primates", Rank::Genus, true).unwrap();
        db.add("Group", "", Rank::Unranked, true).unwrap();
        db.add("Hominidae", "Group", Rank::Family, true).unwrap();
        assert!(db.move_taxon("Group", "Homo", true).is_err());
        db.move_taxon("Group", "Primates", true).unwrap();
        assert_invariants(&db);
    }

    #[test]
    fn test_set_rank() {
        let mut db = hominids();
        assert!(db.set_rank("Homo", Rank::Species).is_err());
        assert!(db.set_rank("Homo", Rank::Family).is_err());
        db.set_rank("Homo", Rank::Unranked).unwrap();
        db.set_rank("Homo", Rank::Genus).unwrap();
        assert_eq!(db.taxon("Homo").unwrap().rank(), Rank::Genus);
        assert!(matches!(
            db.set_rank("Gorilla", Rank::Genus),
            Err(TaxonomyError::NotFound(_))
        ));
    }

    #[test]
    fn test_delete_reparents_children() {
        let mut db = hominids();
        db.add("Pithecanthropus", "Homo", Rank::Genus, false).unwrap();
        db.delete("Homo", false).unwrap();

        assert!(db.taxon("Homo").is_none());
        assert_eq!(db.taxon("Homo sapiens").unwrap().parent(), "Hominidae");
        assert_eq!(db.taxon("Pithecanthropus").unwrap().parent(), "Hominidae");
        assert_invariants(&db);
    }

    #[test]
    fn test_delete_root_drops_synonyms() {
        let mut db = Db::new();
        db.add("Homo", "", Rank::Genus, true).unwrap();
        db.add("Homo sapiens", "Homo", Rank::Species, true).unwrap();
        db.add("Pithecanthropus", "Homo", Rank::Genus, false).unwrap();
        db.set_extern("Pithecanthropus", "gbif", "1").unwrap();

        db.delete("Homo", false).unwrap();

        assert!(db.taxon("Pithecanthropus").is_none());
        assert!(db.taxon_by_extern("gbif", "1").is_none());
        assert_eq!(names(db.children("")), vec!["Homo sapiens"]);
        assert_invariants(&db);
    }

    #[test]
    fn test_delete_recursive() {
        let mut db = hominids();
        db.delete("Homo", true).unwrap();
        assert!(db.taxon("Homo sapiens").is_none());
        assert_eq!(db.len(), 3);
        assert_invariants(&db);
    }

    #[test]
    fn test_set_value_and_extern() {
        let mut db = hominids();
        db.set_value("Homo", "author", "Linnaeus, 1758").unwrap();
        db.set_extern("Homo", "gbif", "2436435").unwrap();
        db.set_extern("Homo", "ncbi", "9605").unwrap();
        assert_eq!(db.taxon("Homo").unwrap().value("author"), "Linnaeus, 1758");
        assert_eq!(db.taxon_by_extern("gbif", "2436435").unwrap().name(), "Homo");

        db.set_extern("Homo", "gbif", "99").unwrap();
        assert!(db.taxon_by_extern("gbif", "2436435").is_none());
        assert_eq!(db.taxon("Homo").unwrap().value(EXTERN), "ncbi:9605 gbif:99");

        assert!(matches!(
            db.set_extern("Pan", "gbif", "99"),
            Err(TaxonomyError::ExternInUse { .. })
        ));
        assert!(matches!(
            db.set_value("Homo", "rank", "species"),
            Err(TaxonomyError::ProtectedField(_))
        ));
        assert!(matches!(
            db.set_value("Homo", EXTERN, "bad"),
            Err(TaxonomyError::InvalidExtern(_))
        ));

        db.set_value("Homo", "author", "").unwrap();
        assert_eq!(db.taxon("Homo").unwrap().value("author"), "");
    }

    #[test]
    fn test_set_value_rejects_unwritable_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taxonomy.stz");
        let mut db = Db::open(&path).unwrap();
        db.add("Homo", "", Rank::Genus, true).unwrap();

        for key in ["", "   ", "#note", "%", "%done", "type:locality", "type locality"] {
            assert!(
                matches!(db.set_value("Homo", key, "oops"), Err(TaxonomyError::InvalidKey(_))),
                "key {:?} accepted",
                key
            );
        }
        db.set_value("Homo", "Type-Locality", "Java").unwrap();
        db.commit().unwrap();

        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "name: Homo\nrank: genus\ntype-locality: Java\n%\n"
        );
        let back = Db::open(&path).unwrap();
        assert_eq!(back.taxon("Homo").unwrap().value("type-locality"), "Java");
    }

    #[test]
    fn test_multiline_values_survive_commit() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taxonomy.stz");
        let mut db = Db::open(&path).unwrap();
        db.add("Homo", "", Rank::Genus, true).unwrap();
        db.set_value("Homo", "comment", "first paragraph\n\nsecond paragraph")
            .unwrap();
        db.set_value("Homo", "reference", "Linnaeus (1758).\n  Systema Naturae.")
            .unwrap();
        db.commit().unwrap();

        let back = Db::open(&path).unwrap();
        let homo = back.taxon("Homo").unwrap();
        assert_eq!(homo.value("comment"), "first paragraph\n\nsecond paragraph");
        assert_eq!(homo.value("reference"), "Linnaeus (1758).\n  Systema Naturae.");
    }

    #[test]
    fn test_walk_is_preorder() {
        let mut db = hominids();
        db.add("Pithecanthropus", "Homo", Rank::Genus, false).unwrap();
        let order = db.walk();
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("Hominidae") < pos("Homo"));
        assert!(pos("Homo") < pos("Homo sapiens"));
        assert!(pos("Homo") < pos("Pithecanthropus"));
        assert!(pos("Pan") < pos("Pan troglodytes"));
    }

    #[test]
    fn test_commit_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taxonomy.stz");

        let mut db = Db::open(&path).unwrap();
        assert!(db.is_empty());
        db.add("Hominidae", "", Rank::Family, true).unwrap();
        db.add("Homo", "Hominidae", Rank::Genus, true).unwrap();
        db.add("Homo sapiens", "Homo", Rank::Species, true).unwrap();
        db.add("Pithecanthropus", "Homo", Rank::Genus, false).unwrap();
        db.add("Unplaced", "Hominidae", Rank::Unranked, true).unwrap();
        db.set_value("Homo sapiens", "author", "Linnaeus, 1758").unwrap();
        db.set_value("Homo sapiens", "reference", "Systema Naturae\nEd. 10").unwrap();
        db.set_extern("Homo sapiens", "gbif", "2436436").unwrap();
        db.commit().unwrap();
        assert!(!db.is_dirty());

        let back = Db::open(&path).unwrap();
        assert_eq!(back.len(), db.len());
        for name in db.walk() {
            assert_eq!(
                back.taxon(&name).unwrap().to_record(),
                db.taxon(&name).unwrap().to_record()
            );
        }
        assert_eq!(back.taxon_by_extern("gbif", "2436436").unwrap().name(), "Homo sapiens");
        assert!(!back.is_dirty());
    }

    #[test]
    fn test_commit_noop_when_clean() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taxonomy.stz");
        let mut db = Db::open(&path).unwrap();
        db.commit().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_commit_in_memory_needs_path() {
        let mut db = hominids();
        assert!(matches!(db.commit(), Err(TaxonomyError::NoPath)));
    }

    #[test]
    fn test_open_rejects_child_before_parent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("taxonomy.stz");
        fs::write(
            &path,
            "name: Homo sapiens\nparent: Homo\nrank: species\n%\nname: Homo\nrank: genus\n%\n",
        )
        .unwrap();
        let err = Db::open(&path).unwrap_err();
        assert!(matches!(err, TaxonomyError::InvalidRecord { record: 1, .. }));
    }

    #[test]
    fn test_invariants_after_mixed_operations() {
        let mut db = hominids();
        db.add("Gorilla", "Hominidae", Rank::Genus, true).unwrap();
        db.add("Gorilla gorilla", "Gorilla", Rank::Species, true).unwrap();
        db.add("Troglodytes", "Pan", Rank::Genus, false).unwrap();
        db.move_taxon("Gorilla", "Pan", false).unwrap();
        db.set_rank("Pan", Rank::Unranked).unwrap();
        db.delete("Homo", false).unwrap();
        db.set_rank("Pan", Rank::Genus).unwrap();
        let _ = db.move_taxon("Homo sapiens", "Pan", true);
        db.delete("Hominidae", false).unwrap();
        assert_invariants(&db);
    }
}
