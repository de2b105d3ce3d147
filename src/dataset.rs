//! Local store of dataset metadata, kept next to the taxonomy.
//!
//! Taxa name the dataset they were taken from in their `source` field. When
//! a taxon is imported from a service, the remote dataset key is mapped to a
//! local dataset tagged with the same `service:key` token.

use crate::stanza::{self, Record, StanzaError, is_valid_key};
use crate::types::{EXTERN, merge_extern, parse_extern};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const RECORD_ORDER: [&str; 2] = ["id", "title"];

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Stanza(#[from] StanzaError),
    #[error("Dataset record {record}: {message}")]
    InvalidRecord { record: usize, message: String },
    #[error("Empty dataset id")]
    EmptyId,
    #[error("Dataset already in database: {0}")]
    AlreadyExists(String),
    #[error("Dataset not found: {0}")]
    NotFound(String),
    #[error("Field '{0}' can not be set directly")]
    ProtectedField(String),
    #[error("Invalid field name '{0}'")]
    InvalidKey(String),
    #[error("Invalid extern value '{0}', expecting service:id")]
    InvalidExtern(String),
    #[error("Extern {token} already assigned to dataset {id}")]
    ExternInUse { token: String, id: String },
    #[error("Dataset store has no backing file")]
    NoPath,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DatasetRecord {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

impl DatasetRecord {
    pub fn value(&self, key: &str) -> &str {
        self.fields.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn extern_id(&self, service: &str) -> Option<&str> {
        crate::types::extern_id(self.value(EXTERN), service)
    }
}

#[derive(Debug, Default)]
pub struct DatasetDb {
    path: Option<PathBuf>,
    sets: BTreeMap<String, DatasetRecord>,
    externs: HashMap<String, String>,
    dirty: bool,
}

impl DatasetDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a dataset file. A missing file yields an empty store.
    pub fn open(path: &Path) -> Result<Self, DatasetError> {
        let mut db = DatasetDb {
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

    fn load_record(&mut self, index: usize, mut rec: Record) -> Result<(), DatasetError> {
        let invalid = |e: DatasetError| DatasetError::InvalidRecord {
            record: index,
            message: e.to_string(),
        };
        let id = rec.remove("id").unwrap_or_default();
        let title = rec.remove("title").unwrap_or_default();
        let id = self.add(&id, &title).map_err(invalid)?.id.clone();
        if let Some(tokens) = rec.remove(EXTERN) {
            for token in tokens.split_whitespace() {
                self.set_value(&id, EXTERN, token).map_err(invalid)?;
            }
        }
        for (key, value) in rec {
            self.set_value(&id, &key, &value).map_err(invalid)?;
        }
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&DatasetRecord> {
        self.sets.get(id.trim())
    }

    /// The dataset tagged with `service:id`.
    pub fn by_extern(&self, service: &str, id: &str) -> Option<&DatasetRecord> {
        self.externs
            .get(&format!("{}:{}", service, id))
            .and_then(|local| self.sets.get(local))
    }

    /// Datasets sorted by id.
    pub fn list(&self) -> impl Iterator<Item = &DatasetRecord> {
        self.sets.values()
    }

    pub fn add(&mut self, id: &str, title: &str) -> Result<&DatasetRecord, DatasetError> {
        let id = id.split_whitespace().collect::<Vec<_>>().join(" ");
        if id.is_empty() {
            return Err(DatasetError::EmptyId);
        }
        if self.sets.contains_key(&id) {
            return Err(DatasetError::AlreadyExists(id));
        }
        self.dirty = true;
        let rec = DatasetRecord {
            id: id.clone(),
            title: title.trim().to_string(),
            fields: BTreeMap::new(),
        };
        Ok(self.sets.entry(id).or_insert(rec))
    }

    /// Set a field of dataset `id`. An empty value removes the field.
    /// `extern` values are single `service:id` tokens, as for taxa.
    pub fn set_value(&mut self, id: &str, key: &str, value: &str) -> Result<(), DatasetError> {
        let key = key.trim().to_lowercase();
        let value = value.trim();
        if !is_valid_key(&key) {
            return Err(DatasetError::InvalidKey(key));
        }
        let set = self
            .sets
            .get_mut(id.trim())
            .ok_or_else(|| DatasetError::NotFound(id.to_string()))?;

        match key.as_str() {
            "id" => return Err(DatasetError::ProtectedField(key.clone())),
            "title" => {
                if set.title != value {
                    set.title = value.to_string();
                    self.dirty = true;
                }
                return Ok(());
            }
            EXTERN => {
                let (service, remote) = parse_extern(value)
                    .ok_or_else(|| DatasetError::InvalidExtern(value.to_string()))?;
                let token = format!("{}:{}", service, remote);
                if !remote.is_empty() {
                    if let Some(owner) = self.externs.get(&token).filter(|o| **o != set.id) {
                        return Err(DatasetError::ExternInUse {
                            token,
                            id: owner.clone(),
                        });
                    }
                }
                if let Some(old) = set.extern_id(service) {
                    self.externs.remove(&format!("{}:{}", service, old));
                }
                let merged = merge_extern(set.value(EXTERN), service, remote);
                if !remote.is_empty() {
                    self.externs.insert(token, set.id.clone());
                }
                store(&mut set.fields, EXTERN, merged, &mut self.dirty);
            }
            _ => store(&mut set.fields, &key, value.to_string(), &mut self.dirty),
        }
        Ok(())
    }

    pub fn set_extern(&mut self, id: &str, service: &str, remote: &str) -> Result<(), DatasetError> {
        self.set_value(id, EXTERN, &format!("{}:{}", service, remote))
    }

    pub fn commit(&mut self) -> Result<(), DatasetError> {
        if !self.dirty {
            return Ok(());
        }
        let path = self.path.clone().ok_or(DatasetError::NoPath)?;
        let dir = match path.parent() {
            Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        self.write_to(tmp.as_file_mut())?;
        tmp.persist(&path).map_err(|e| e.error)?;
        self.dirty = false;
        tracing::debug!(path = %path.display(), datasets = self.sets.len(), "datasets committed");
        Ok(())
    }

    pub fn write_to<W: Write>(&self, out: W) -> Result<(), DatasetError> {
        let mut w = stanza::Writer::new(out, &RECORD_ORDER);
        for set in self.sets.values() {
            let mut rec = set.fields.clone();
            rec.insert("id".to_string(), set.id.clone());
            rec.insert("title".to_string(), set.title.clone());
            w.write(&rec)?;
        }
        w.flush()?;
        Ok(())
    }
}

fn store(fields: &mut BTreeMap<String, String>, key: &str, value: String, dirty: &mut bool) {
    let changed = if value.is_empty() {
        fields.remove(key).is_some()
    } else {
        fields.insert(key.to_string(), value.clone()).as_ref() != Some(&value)
    };
    if changed {
        *dirty = true;
    }
}
