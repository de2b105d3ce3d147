//! Query interface shared by the local tree and the remote services.
//!
//! A [`Taxonomy`] answers four questions: which taxa carry a name, which
//! taxon has an id, and which children or synonyms a taxon has. Answers
//! come back as lazy [`Scan`]s so paged remote results are only fetched
//! while the caller keeps reading.
//!
//! Drivers are looked up by service name in a [`Registry`].

use crate::dataset::DatasetRecord;
use crate::gbif::{GbifClient, GbifConfig};
use crate::storage;
use crate::taxonomy::{Db, TaxonomyError};
use crate::types::TaxonRecord;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

/// A lazy sequence of query results.
pub type Scan<'a> = Box<dyn Iterator<Item = Result<TaxonRecord, QueryError>> + 'a>;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{url}: giving up after {attempts} attempts: {message}")]
    Exhausted {
        url: String,
        attempts: usize,
        message: String,
    },
    #[error("{url}: unexpected status {status}")]
    Status { url: String, status: u16 },
    #[error("{url}: invalid response: {message}")]
    InvalidResponse { url: String, message: String },
    #[error("Unknown service: {service}. Known services: {known}")]
    UnknownService { service: String, known: String },
    #[error("Service {0} needs a parameter")]
    MissingParam(String),
    #[error("{0}")]
    Taxonomy(#[from] TaxonomyError),
}

/// Read access to a taxonomy.
pub trait Taxonomy {
    /// Taxa whose name matches `name` exactly.
    fn lookup_name(&self, name: &str) -> Scan<'_>;

    /// The taxon with `id`, `None` when the id is unknown.
    fn lookup_id(&self, id: &str) -> Result<Option<TaxonRecord>, QueryError>;

    /// Correct children of `id`.
    fn scan_children(&self, id: &str) -> Scan<'_>;

    /// Synonyms of `id`.
    fn scan_synonyms(&self, id: &str) -> Scan<'_>;
}

/// Read access to the dataset metadata of a service.
pub trait DatasetSource {
    fn dataset(&self, id: &str) -> Result<Option<DatasetRecord>, QueryError>;
}

/// Opens a taxonomy driver from its parameter.
pub type TaxonomyDriver = Box<dyn Fn(&str) -> Result<Box<dyn Taxonomy>, QueryError>>;

/// Opens a dataset driver from its parameter.
pub type DatasetDriver = Box<dyn Fn(&str) -> Result<Box<dyn DatasetSource>, QueryError>>;

/// Service name to driver constructor.
#[derive(Default)]
pub struct Registry {
    taxonomies: BTreeMap<String, TaxonomyDriver>,
    datasets: BTreeMap<String, DatasetDriver>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in services:
    ///
    /// - `gbif`: the GBIF species API, configured by `gbif`;
    /// - `biodv`: another biodv project, the parameter being its directory.
    pub fn with_defaults(gbif: &GbifConfig) -> Self {
        let mut registry = Self::new();

        let config = gbif.clone();
        registry.register_taxonomy(
            "gbif",
            Box::new(move |_| Ok(Box::new(GbifClient::new(&config)?) as Box<dyn Taxonomy>)),
        );
        let config = gbif.clone();
        registry.register_datasets(
            "gbif",
            Box::new(move |_| Ok(Box::new(GbifClient::new(&config)?) as Box<dyn DatasetSource>)),
        );
        registry.register_taxonomy(
            "biodv",
            Box::new(|param| {
                if param.is_empty() {
                    return Err(QueryError::MissingParam("biodv".to_string()));
                }
                let db = Db::open(&storage::taxonomy_path(Path::new(param)))?;
                Ok(Box::new(db) as Box<dyn Taxonomy>)
            }),
        );
        registry
    }

    pub fn register_taxonomy(&mut self, service: &str, driver: TaxonomyDriver) {
        self.taxonomies.insert(service.to_string(), driver);
    }

    pub fn register_datasets(&mut self, service: &str, driver: DatasetDriver) {
        self.datasets.insert(service.to_string(), driver);
    }

    /// Names of the registered taxonomy services.
    pub fn services(&self) -> Vec<&str> {
        self.taxonomies.keys().map(String::as_str).collect()
    }

    pub fn open_taxonomy(&self, service: &str, param: &str) -> Result<Box<dyn Taxonomy>, QueryError> {
        let driver = self
            .taxonomies
            .get(service)
            .ok_or_else(|| QueryError::UnknownService {
                service: service.to_string(),
                known: self.services().join(", "),
            })?;
        tracing::debug!(service, param, "opening taxonomy driver");
        driver(param)
    }

    /// The dataset driver of `service`. Services without dataset metadata
    /// yield `None`.
    pub fn open_datasets(
        &self,
        service: &str,
        param: &str,
    ) -> Result<Option<Box<dyn DatasetSource>>, QueryError> {
        match self.datasets.get(service) {
            Some(driver) => driver(param).map(Some),
            None => Ok(None),
        }
    }
}
