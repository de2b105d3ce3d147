//! biodv - A local taxonomy database kept in sync with remote taxonomic services.
//!
//! The taxonomy is a tree of named taxa stored as plain text records. Taxa can
//! be imported from, linked to and reconciled against a remote taxonomy such
//! as GBIF, or another biodv project.

pub mod catalog;
pub mod dataset;
pub mod gbif;
pub mod lint;
pub mod query;
pub mod stanza;
pub mod storage;
pub mod sync;
pub mod taxonomy;
pub mod types;

pub use catalog::{CatalogFormat, CatalogOptions, render_catalog};
pub use dataset::{DatasetDb, DatasetRecord};
pub use gbif::{GbifClient, GbifConfig};
pub use lint::{LintReport, LintSeverity, fix_issues, lint_taxonomy};
pub use query::{DatasetSource, QueryError, Registry, Scan, Taxonomy};
pub use storage::{
    BIODV_DIR, BiodvConfig, datasets_path, find_root, init, load_config, taxonomy_path,
};
pub use sync::{MAX_PASSES, Reconciler, SyncReport};
pub use taxonomy::{Db, Taxon, TaxonomyError};
pub use types::{Rank, TaxonRecord, canonical_name};
