//! Reconciliation of the local tree with a remote taxonomy.
//!
//! A local taxon is linked to a remote one by an `extern` token
//! `service:id`. The [`Reconciler`] uses those links to import new names
//! ([`Reconciler::add_names`]), pull synonyms and infraspecific children
//! ([`Reconciler::fill`]), climb root taxa toward a rank
//! ([`Reconciler::uprank`]), link untagged taxa and refresh their fields
//! ([`Reconciler::update`]), and bring placement, status and rank in line
//! with the remote ([`Reconciler::sync`]).
//!
//! Remote failures never abort a batch: the affected taxon is skipped and
//! the problem lands in the [`SyncReport`]. Callers commit the tree
//! afterwards whatever the report says.

use crate::dataset::{DatasetDb, DatasetError, DatasetRecord};
use crate::query::{DatasetSource, QueryError, Scan, Taxonomy};
use crate::taxonomy::{Db, TaxonomyError};
use crate::types::{AUTHOR, EXTERN, PROTECTED_KEYS, Rank, SOURCE, TaxonRecord, canonical_name};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Passes over the pending moves and re-ranks before giving up.
pub const MAX_PASSES: usize = 5;

/// Longest remote ancestry followed when importing parents.
const MAX_DEPTH: usize = 64;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{0}")]
    Taxonomy(#[from] TaxonomyError),
    #[error("{0}")]
    Query(#[from] QueryError),
    #[error("{0}")]
    Dataset(#[from] DatasetError),
    #[error("{name} is already linked to {service}:{other}")]
    Homonym {
        name: String,
        service: String,
        other: String,
    },
    #[error("synonym {0} has no accepted name")]
    Orphan(String),
    #[error("remote ancestry of {0} is too deep")]
    TooDeep(String),
}

/// What a reconciliation run changed and what it could not do.
#[derive(Debug, Default, Serialize)]
pub struct SyncReport {
    pub added: Vec<String>,
    pub moved: Vec<String>,
    pub reranked: Vec<String>,
    pub updated: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl SyncReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of taxa touched.
    pub fn changes(&self) -> usize {
        self.added.len() + self.moved.len() + self.reranked.len() + self.updated.len()
    }

    fn warn(&mut self, message: String) {
        if !self.warnings.contains(&message) {
            tracing::debug!(warning = %message);
            self.warnings.push(message);
        }
    }

    fn error(&mut self, message: String) {
        tracing::debug!(error = %message);
        self.errors.push(message);
    }
}

/// How far `link` imports missing remote ancestors of a correct taxon.
#[derive(Debug, Clone, Copy)]
enum Climb {
    /// Attach to an already linked parent, or to the root.
    Linked,
    /// Import ancestors while they are unranked or below the rank.
    UpTo(Rank),
    /// Import ancestors until a linked one is found.
    Full,
}

enum Target {
    Ready(String),
    Pending,
    Invalid(String),
}

pub struct Reconciler<'a> {
    db: &'a mut Db,
    remote: &'a dyn Taxonomy,
    service: String,
    datasets: Option<&'a mut DatasetDb>,
    dataset_source: Option<&'a dyn DatasetSource>,
    /// Local name to the remote parent id of its linked record.
    memo: HashMap<String, String>,
    report: SyncReport,
}

impl<'a> Reconciler<'a> {
    pub fn new(db: &'a mut Db, remote: &'a dyn Taxonomy, service: &str) -> Self {
        Self {
            db,
            remote,
            service: service.to_string(),
            datasets: None,
            dataset_source: None,
            memo: HashMap::new(),
            report: SyncReport::default(),
        }
    }

    /// Map `source` fields of imported taxa to local datasets.
    pub fn with_datasets(
        mut self,
        local: &'a mut DatasetDb,
        source: Option<&'a dyn DatasetSource>,
    ) -> Self {
        self.datasets = Some(local);
        self.dataset_source = source;
        self
    }

    pub fn report(&self) -> &SyncReport {
        &self.report
    }

    pub fn finish(self) -> SyncReport {
        self.report
    }

    // --- add ---

    /// Import `names` from the remote taxonomy.
    ///
    /// Each name is attached under its linked remote parent, or at the root.
    /// With `rank`, missing remote ancestors are imported as well while they
    /// are below that rank.
    pub fn add_names(&mut self, names: &[String], rank: Option<Rank>) {
        let climb = rank.map_or(Climb::Linked, Climb::UpTo);
        for raw in names {
            let name = canonical_name(raw);
            if name.is_empty() {
                continue;
            }
            if self.db.taxon(&name).is_some() {
                self.report.warn(format!("{}: already in database", name));
                continue;
            }
            let Some(rec) = self.pick(&name) else {
                continue;
            };
            if let Some(owner) = self.local_of(&rec.id) {
                self.report.warn(format!(
                    "{}: {}:{} already assigned to {}",
                    name, self.service, rec.id, owner
                ));
                continue;
            }
            if let Err(e) = self.link(&rec, climb, 0) {
                self.report.error(format!("{}: {}", name, e));
            }
        }
    }

    /// The single remote record named `name`. Homonyms are resolved by a
    /// remote parent already present in the tree.
    fn pick(&mut self, name: &str) -> Option<TaxonRecord> {
        let mut found = self.search(name);
        match found.len() {
            0 => {
                self.report
                    .warn(format!("{}: not found in {}", name, self.service));
                None
            }
            1 => found.pop(),
            _ => {
                let linked: Vec<usize> = found
                    .iter()
                    .enumerate()
                    .filter(|(_, r)| !r.parent.is_empty() && self.local_of(&r.parent).is_some())
                    .map(|(i, _)| i)
                    .collect();
                if let [i] = linked[..] {
                    return Some(found.swap_remove(i));
                }
                self.ambiguous(name, &found);
                None
            }
        }
    }

    fn ambiguous(&mut self, name: &str, found: &[TaxonRecord]) {
        let candidates: Vec<String> = found
            .iter()
            .map(|r| {
                let mut line = format!("{}:{} {}", self.service, r.id, r.name);
                if !r.value(AUTHOR).is_empty() {
                    line.push(' ');
                    line.push_str(r.value(AUTHOR));
                }
                format!("{} [{}]", line, r.status())
            })
            .collect();
        self.report.warn(format!(
            "{}: ambiguous name, candidates: {}",
            name,
            candidates.join("; ")
        ));
    }

    // --- fill ---

    /// Import the synonyms of every linked taxon under `names` (all the tree
    /// when empty), and the children of linked taxa at or below species.
    pub fn fill(&mut self, names: &[String]) {
        for start in self.starts(names) {
            self.fill_taxon(&start);
        }
    }

    fn fill_taxon(&mut self, name: &str) {
        if let Some(id) = self.tag_of(name) {
            let remote = self.remote;
            let synonyms = self.collect(&id, remote.scan_synonyms(&id));
            for rec in synonyms {
                self.import_member(name, rec, false);
            }
            if self.db.effective_rank(name) >= Rank::Species {
                let children = self.collect(&id, remote.scan_children(&id));
                for rec in children.into_iter().filter(|r| r.correct) {
                    self.import_member(name, rec, true);
                }
            }
        }
        for child in self.child_names(name) {
            self.fill_taxon(&child);
        }
    }

    fn import_member(&mut self, parent: &str, mut rec: TaxonRecord, correct: bool) {
        if self.local_of(&rec.id).is_some() {
            return;
        }
        rec.correct = correct;
        if let Err(e) = self.create(&rec, parent) {
            self.report.error(format!("{}: {}", rec.name, e));
        }
    }

    // --- uprank ---

    /// Move root taxa under their remote parents, importing the parents when
    /// needed, until every root reached from `names` (all roots when empty)
    /// is at or above `rank`.
    pub fn uprank(&mut self, names: &[String], rank: Rank) {
        let starts = self.starts(names);
        let mut failed = HashSet::new();
        loop {
            let mut tops: Vec<String> = Vec::new();
            for start in &starts {
                let top = self.top(start);
                if !tops.contains(&top) {
                    tops.push(top);
                }
            }

            let mut moved = false;
            for top in tops {
                if failed.contains(&top) {
                    continue;
                }
                match self.uprank_step(&top, rank) {
                    Ok(true) => moved = true,
                    Ok(false) => {}
                    Err(e) => {
                        self.report.error(format!("{}: {}", top, e));
                        failed.insert(top);
                    }
                }
            }
            if !moved {
                break;
            }
        }
    }

    fn uprank_step(&mut self, name: &str, target: Rank) -> Result<bool, SyncError> {
        let Some(taxon) = self.db.taxon(name) else {
            return Ok(false);
        };
        if taxon.rank().is_ranked() && taxon.rank() <= target {
            return Ok(false);
        }
        let Some(id) = self.tag_of(name) else {
            return Ok(false);
        };
        let Some(rec) = self.fetch(&id) else {
            return Ok(false);
        };
        if rec.parent.is_empty() || !rec.correct {
            return Ok(false);
        }
        let parent = match self.local_of(&rec.parent) {
            Some(parent) => parent,
            None => {
                let Some(parent) = self.fetch(&rec.parent) else {
                    return Ok(false);
                };
                if parent.rank.is_ranked() && parent.rank < target {
                    return Ok(false);
                }
                self.create(&parent, "")?
            }
        };
        self.db.relocate(name, &parent, true)?;
        self.report.moved.push(name.to_string());
        Ok(true)
    }

    fn top(&self, name: &str) -> String {
        self.db
            .parents(name)
            .last()
            .map(|t| t.name().to_string())
            .unwrap_or_else(|| canonical_name(name))
    }

    // --- update ---

    /// Link untagged taxa by exact name and refresh the fields of linked
    /// taxa. With `match_only` fields are left alone.
    pub fn update(&mut self, match_only: bool) {
        let mut seen = HashSet::new();
        for root in self.child_names("") {
            self.update_taxon(&root, match_only, &mut seen);
        }
    }

    fn update_taxon(&mut self, name: &str, match_only: bool, seen: &mut HashSet<String>) {
        if !seen.insert(name.to_string()) {
            return;
        }
        self.resolve(name, match_only, seen);
        for member in self.member_names(name) {
            self.update_taxon(&member, match_only, seen);
        }
    }

    fn resolve(&mut self, name: &str, match_only: bool, seen: &mut HashSet<String>) {
        if let Some(id) = self.tag_of(name) {
            let Some(rec) = self.fetch(&id) else {
                return;
            };
            self.memo.insert(name.to_string(), rec.parent.clone());
            if !match_only && self.refresh(name, &rec) {
                self.report.updated.push(name.to_string());
            }
            return;
        }

        let candidates: Vec<TaxonRecord> = self
            .search(name)
            .into_iter()
            .filter(|r| self.local_of(&r.id).is_none())
            .collect();
        let rec = match candidates.len() {
            0 => {
                self.report
                    .warn(format!("{}: not found in {}", name, self.service));
                None
            }
            1 => candidates.into_iter().next(),
            _ => self.disambiguate(name, candidates, match_only, seen),
        };
        let Some(rec) = rec else {
            return;
        };
        if let Err(e) = self.db.set_extern(name, &self.service, &rec.id) {
            self.report.error(format!("{}: {}", name, e));
            return;
        }
        self.memo.insert(name.to_string(), rec.parent.clone());
        if !match_only {
            self.refresh(name, &rec);
        }
        self.report.updated.push(name.to_string());
    }

    /// Pick among homonyms: first by the link of the local parent, then by
    /// the remote parents of the already linked children and synonyms.
    fn disambiguate(
        &mut self,
        name: &str,
        candidates: Vec<TaxonRecord>,
        match_only: bool,
        seen: &mut HashSet<String>,
    ) -> Option<TaxonRecord> {
        let parent_id = self
            .db
            .taxon(name)
            .map(|t| t.parent().to_string())
            .filter(|p| !p.is_empty())
            .and_then(|p| self.tag_of(&p));
        if let Some(parent_id) = parent_id {
            let matching: Vec<&TaxonRecord> =
                candidates.iter().filter(|c| c.parent == parent_id).collect();
            if let [only] = matching[..] {
                return Some(only.clone());
            }
        }

        let members = self.member_names(name);
        for member in &members {
            self.update_taxon(member, match_only, seen);
        }
        let votes: Vec<usize> = candidates
            .iter()
            .map(|c| {
                members
                    .iter()
                    .filter(|m| self.memo.get(*m) == Some(&c.id))
                    .count()
            })
            .collect();
        let best = votes.iter().copied().max().unwrap_or(0);
        if best > 0 && votes.iter().filter(|v| **v == best).count() == 1 {
            let i = votes.iter().position(|v| *v == best)?;
            return candidates.into_iter().nth(i);
        }
        self.ambiguous(name, &candidates);
        None
    }

    /// Copy remote fields into `name`. Returns whether anything changed.
    fn refresh(&mut self, name: &str, rec: &TaxonRecord) -> bool {
        match self.copy_fields(name, rec) {
            Ok(changed) => changed,
            Err(e) => {
                self.report.error(format!("{}: {}", name, e));
                false
            }
        }
    }

    // --- sync ---

    /// Bring placement, status and rank of every linked taxon in line with
    /// the remote taxonomy.
    ///
    /// Discovery compares each linked taxon with its remote record. Taxa
    /// whose rank differs are left unranked until the end, so moves are not
    /// blocked by stale ranks. Moves and re-ranks are retried up to
    /// [`MAX_PASSES`] times since a target may only appear once another move
    /// is done.
    pub fn sync(&mut self) {
        let mut moves: Vec<(String, TaxonRecord)> = Vec::new();
        let mut ranks: HashMap<String, Rank> = HashMap::new();

        for name in self.db.walk() {
            let Some(id) = self.tag_of(&name) else {
                continue;
            };
            let Some(rec) = self.fetch(&id) else {
                continue;
            };
            let Some(taxon) = self.db.taxon(&name) else {
                continue;
            };
            let mut pending = rec.correct != taxon.is_correct();
            if rec.rank != taxon.rank() {
                ranks.insert(name.clone(), rec.rank);
                pending = true;
            }
            let remote_parent = if rec.parent.is_empty() {
                Some(String::new())
            } else {
                self.local_of(&rec.parent)
            };
            if remote_parent.is_some_and(|p| p != taxon.parent()) {
                pending = true;
            }
            if pending {
                moves.push((name, rec));
            }
        }

        for name in self.db.walk() {
            if ranks.contains_key(&name) {
                if let Err(e) = self.db.set_rank(&name, Rank::Unranked) {
                    self.report.error(format!("{}: {}", name, e));
                    ranks.remove(&name);
                }
            }
        }

        for pass in 1..=MAX_PASSES {
            if moves.is_empty() {
                break;
            }
            let mut left = Vec::new();
            for (name, rec) in std::mem::take(&mut moves) {
                match self.move_target(&rec) {
                    Target::Ready(parent) => {
                        let before = self
                            .db
                            .taxon(&name)
                            .map(|t| (t.parent().to_string(), t.is_correct()));
                        match self.db.relocate(&name, &parent, rec.correct) {
                            Ok(()) => {
                                if before != Some((parent, rec.correct)) {
                                    self.report.moved.push(name);
                                }
                            }
                            Err(e) => {
                                tracing::debug!(pass, "{}: {}", name, e);
                                left.push((name, rec));
                            }
                        }
                    }
                    Target::Pending => left.push((name, rec)),
                    Target::Invalid(message) => {
                        self.report.error(format!("{}: {}", name, message));
                    }
                }
            }
            moves = left;
        }

        for (name, rec) in moves {
            // A correct taxon whose remote parent is not in the tree stays
            // where it is.
            let settled = rec.correct
                && !rec.parent.is_empty()
                && self.local_of(&rec.parent).is_none()
                && self.db.taxon(&name).is_some_and(|t| t.is_correct());
            if !settled {
                self.report.error(format!(
                    "{}: unable to move after {} passes",
                    name, MAX_PASSES
                ));
            }
        }

        for _ in 0..MAX_PASSES {
            if ranks.is_empty() {
                break;
            }
            for name in self.db.walk() {
                let Some(&rank) = ranks.get(&name) else {
                    continue;
                };
                match self.db.set_rank(&name, rank) {
                    Ok(()) => {
                        ranks.remove(&name);
                        self.report.reranked.push(name);
                    }
                    Err(e) => tracing::debug!("{}: {}", name, e),
                }
            }
        }

        let mut left: Vec<_> = ranks.into_iter().collect();
        left.sort();
        for (name, rank) in left {
            self.report.error(format!(
                "{}: left unranked, remote rank is {}",
                name, rank
            ));
        }
    }

    fn move_target(&mut self, rec: &TaxonRecord) -> Target {
        if rec.parent.is_empty() {
            return if rec.correct {
                Target::Ready(String::new())
            } else {
                Target::Invalid("remote synonym without accepted name".to_string())
            };
        }
        if let Some(parent) = self.local_of(&rec.parent) {
            return match self.db.taxon(&parent) {
                Some(p) if !p.is_correct() => {
                    Target::Invalid(format!("remote parent {} is a synonym", parent))
                }
                _ => Target::Ready(parent),
            };
        }
        if rec.correct {
            return Target::Pending;
        }
        let Some(senior) = self.fetch(&rec.parent) else {
            return Target::Pending;
        };
        if !senior.correct {
            return Target::Invalid(format!(
                "accepted name {}:{} is itself a synonym",
                self.service, senior.id
            ));
        }
        match self.link(&senior, Climb::Full, 0) {
            Ok(parent) => Target::Ready(parent),
            Err(e) => {
                tracing::debug!("{}: {}", senior.name, e);
                Target::Pending
            }
        }
    }

    // --- shared ---

    /// The local taxon linked to `rec`, importing it and, following
    /// `climb`, its remote ancestors when missing.
    fn link(&mut self, rec: &TaxonRecord, climb: Climb, depth: usize) -> Result<String, SyncError> {
        if let Some(name) = self.local_of(&rec.id) {
            return Ok(name);
        }
        if depth > MAX_DEPTH {
            return Err(SyncError::TooDeep(rec.name.clone()));
        }
        let parent = self.attach_point(rec, climb, depth)?;
        self.create(rec, &parent)
    }

    /// The local parent for `rec`, empty for the root. The accepted name of
    /// a synonym is always imported.
    fn attach_point(
        &mut self,
        rec: &TaxonRecord,
        climb: Climb,
        depth: usize,
    ) -> Result<String, SyncError> {
        let orphan = || {
            if rec.correct {
                Ok(String::new())
            } else {
                Err(SyncError::Orphan(rec.name.clone()))
            }
        };
        if rec.parent.is_empty() {
            return orphan();
        }
        if let Some(parent) = self.local_of(&rec.parent) {
            return Ok(parent);
        }
        let climb_up = !rec.correct
            || match climb {
                Climb::Linked => false,
                Climb::Full => true,
                Climb::UpTo(target) => !rec.rank.is_ranked() || rec.rank > target,
            };
        if !climb_up {
            return Ok(String::new());
        }
        let Some(parent) = self.fetch(&rec.parent) else {
            return orphan();
        };
        if let Climb::UpTo(target) = climb {
            if rec.correct && parent.rank.is_ranked() && parent.rank < target {
                return Ok(String::new());
            }
        }
        self.link(&parent, climb, depth + 1)
    }

    /// Add `rec` under the local `parent` and link it. A local taxon of the
    /// same name without a link to this service is adopted instead.
    fn create(&mut self, rec: &TaxonRecord, parent: &str) -> Result<String, SyncError> {
        let name = canonical_name(&rec.name);
        if let Some(existing) = self.db.taxon(&name) {
            let tag = existing.extern_id(&self.service).map(str::to_string);
            return match tag {
                Some(id) if id == rec.id => Ok(name),
                Some(other) => Err(SyncError::Homonym {
                    name,
                    service: self.service.clone(),
                    other,
                }),
                None => {
                    self.db.set_extern(&name, &self.service, &rec.id)?;
                    self.memo.insert(name.clone(), rec.parent.clone());
                    self.report.updated.push(name.clone());
                    Ok(name)
                }
            };
        }

        let added = self.db.add(&name, parent, rec.rank, rec.correct).map(|_| ());
        match added {
            Ok(()) => {}
            Err(TaxonomyError::RankInconsistent { .. }) if rec.rank.is_ranked() => {
                self.report.warn(format!(
                    "{}: remote rank {} conflicts with the tree, added unranked",
                    name, rec.rank
                ));
                self.db.add(&name, parent, Rank::Unranked, rec.correct)?;
            }
            Err(e) => return Err(e.into()),
        }
        self.db.set_extern(&name, &self.service, &rec.id)?;
        self.copy_fields(&name, rec)?;
        self.memo.insert(name.clone(), rec.parent.clone());
        tracing::info!(taxon = %name, parent, "imported from {}", self.service);
        self.report.added.push(name.clone());
        Ok(name)
    }

    fn copy_fields(&mut self, name: &str, rec: &TaxonRecord) -> Result<bool, SyncError> {
        let mut changed = false;
        for (key, value) in &rec.fields {
            if key == EXTERN || PROTECTED_KEYS.contains(&key.as_str()) {
                continue;
            }
            let value = if key == SOURCE {
                self.map_source(value)
            } else {
                value.clone()
            };
            let current = self.db.taxon(name).map(|t| t.value(key)).unwrap_or("");
            if current != value {
                self.db.set_value(name, key, &value)?;
                changed = true;
            }
        }
        Ok(changed)
    }

    /// Local dataset id for the remote dataset `key`. Unknown datasets are
    /// registered from the service metadata when available.
    fn map_source(&mut self, key: &str) -> String {
        let fallback = format!("{}:{}", self.service, key);
        let Some(local) = self.datasets.as_deref_mut() else {
            return fallback;
        };
        if let Some(set) = local.by_extern(&self.service, key) {
            return set.id.clone();
        }
        let Some(source) = self.dataset_source else {
            return fallback;
        };
        let remote = match source.dataset(key) {
            Ok(Some(remote)) => remote,
            Ok(None) => return fallback,
            Err(e) => {
                self.report.warn(format!("dataset {}: {}", fallback, e));
                return fallback;
            }
        };
        match register_dataset(local, &self.service, key, remote) {
            Ok(Some(id)) => id,
            Ok(None) => fallback,
            Err(e) => {
                self.report.warn(format!("dataset {}: {}", fallback, e));
                fallback
            }
        }
    }

    fn tag_of(&self, name: &str) -> Option<String> {
        self.db
            .taxon(name)
            .and_then(|t| t.extern_id(&self.service))
            .map(str::to_string)
    }

    fn local_of(&self, id: &str) -> Option<String> {
        self.db
            .taxon_by_extern(&self.service, id)
            .map(|t| t.name().to_string())
    }

    fn fetch(&mut self, id: &str) -> Option<TaxonRecord> {
        match self.remote.lookup_id(id) {
            Ok(Some(rec)) => Some(rec),
            Ok(None) => {
                self.report
                    .warn(format!("{}:{} not found", self.service, id));
                None
            }
            Err(e) => {
                self.report.warn(format!("{}:{}: {}", self.service, id, e));
                None
            }
        }
    }

    /// Remote records named exactly `name`.
    fn search(&mut self, name: &str) -> Vec<TaxonRecord> {
        let remote = self.remote;
        let found = self.collect(name, remote.lookup_name(name));
        found
            .into_iter()
            .filter(|r| canonical_name(&r.name) == name)
            .collect()
    }

    /// Drain a scan. A failing scan counts as an empty answer.
    fn collect(&mut self, what: &str, scan: Scan<'_>) -> Vec<TaxonRecord> {
        let mut out = Vec::new();
        for item in scan {
            match item {
                Ok(rec) => out.push(rec),
                Err(e) => {
                    self.report.warn(format!("{}: {}", what, e));
                    return Vec::new();
                }
            }
        }
        out
    }

    fn starts(&mut self, names: &[String]) -> Vec<String> {
        if names.is_empty() {
            return self.child_names("");
        }
        let mut out = Vec::new();
        for raw in names {
            match self.db.taxon(raw) {
                Some(t) => out.push(t.name().to_string()),
                None => self
                    .report
                    .error(format!("{}: not in database", canonical_name(raw))),
            }
        }
        out
    }

    fn child_names(&self, name: &str) -> Vec<String> {
        self.db
            .children(name)
            .iter()
            .map(|t| t.name().to_string())
            .collect()
    }

    /// Correct children and synonyms of `name`.
    fn member_names(&self, name: &str) -> Vec<String> {
        let mut out = self.child_names(name);
        out.extend(self.db.synonyms(name).iter().map(|t| t.name().to_string()));
        out
    }
}

fn register_dataset(
    local: &mut DatasetDb,
    service: &str,
    key: &str,
    remote: DatasetRecord,
) -> Result<Option<String>, DatasetError> {
    let title = remote.title.split_whitespace().collect::<Vec<_>>().join(" ");
    let id = if title.is_empty() { key.to_string() } else { title };
    let tagged = local.get(&id).map(|set| set.extern_id(service).is_some());
    match tagged {
        Some(true) => return Ok(None),
        Some(false) => {}
        None => {
            local.add(&id, &id)?;
        }
    }
    for (field, value) in &remote.fields {
        if local.get(&id).is_some_and(|set| set.value(field).is_empty()) {
            local.set_value(&id, field, value)?;
        }
    }
    local.set_extern(&id, service, key)?;
    Ok(Some(id))
}
