//! Taxonomic catalog of the local tree.
//!
//! Supra-specific taxa are headed by their rank and separated by a blank
//! line. Species and the names below them are listed flat and indented.
//! Synonyms follow their accepted name, indented one more level.

use crate::taxonomy::{Db, Taxon};
use crate::types::{AUTHOR, Rank, canonical_name};
use serde::Serialize;
use std::fmt::Write as _;
use std::str::FromStr;
use tera::{Context, Tera};
use thiserror::Error;

const CATALOG_TEMPLATE: &str = include_str!("templates/catalog.html");

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("Taxon not found: {0}")]
    NotFound(String),
    #[error("Failed to render template: {0}")]
    Render(#[from] tera::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CatalogFormat {
    #[default]
    Text,
    Html,
}

impl FromStr for CatalogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "text" | "txt" => Ok(CatalogFormat::Text),
            "html" => Ok(CatalogFormat::Html),
            other => Err(format!("Invalid catalog format: {}. Must be text or html", other)),
        }
    }
}

/// Options for catalog rendering.
#[derive(Debug, Clone, Default)]
pub struct CatalogOptions {
    /// Start at this taxon instead of the whole tree.
    pub root: Option<String>,
    pub format: CatalogFormat,
    pub title: String,
}

/// One line of the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogEntry {
    pub name: String,
    pub author: String,
    /// Rank label, empty for unranked taxa.
    pub rank: String,
    /// At or below species level.
    pub species: bool,
    pub synonym: bool,
    pub indent: usize,
}

/// Entries in catalog order.
pub fn catalog_entries(db: &Db, root: Option<&str>) -> Result<Vec<CatalogEntry>, CatalogError> {
    let mut entries = Vec::new();
    match root.map(canonical_name).filter(|r| !r.is_empty()) {
        Some(name) => {
            let taxon = db
                .taxon(&name)
                .ok_or_else(|| CatalogError::NotFound(name.clone()))?;
            visit(db, taxon, &mut entries);
        }
        None => {
            for taxon in db.children("") {
                visit(db, taxon, &mut entries);
            }
        }
    }
    Ok(entries)
}

fn visit(db: &Db, taxon: &Taxon, entries: &mut Vec<CatalogEntry>) {
    let species = db.effective_rank(taxon.name()) >= Rank::Species;
    let indent = usize::from(species);
    entries.push(entry(taxon, species, false, indent));
    for syn in db.synonyms(taxon.name()) {
        entries.push(entry(syn, species, true, indent + 1));
    }
    for child in db.children(taxon.name()) {
        visit(db, child, entries);
    }
}

fn entry(taxon: &Taxon, species: bool, synonym: bool, indent: usize) -> CatalogEntry {
    CatalogEntry {
        name: taxon.name().to_string(),
        author: taxon.value(AUTHOR).to_string(),
        rank: taxon.rank().label().to_string(),
        species,
        synonym,
        indent,
    }
}

pub fn render_catalog(db: &Db, options: &CatalogOptions) -> Result<String, CatalogError> {
    let entries = catalog_entries(db, options.root.as_deref())?;
    match options.format {
        CatalogFormat::Text => Ok(render_text(&entries)),
        CatalogFormat::Html => render_html(&entries, &options.title),
    }
}

fn render_text(entries: &[CatalogEntry]) -> String {
    let mut out = String::new();
    for e in entries {
        let mut line = String::new();
        if !e.synonym && !e.species {
            if !out.is_empty() {
                out.push('\n');
            }
            if !e.rank.is_empty() {
                line.push_str(&e.rank);
                line.push(' ');
            }
        }
        line.push_str(&e.name);
        if !e.author.is_empty() {
            line.push(' ');
            line.push_str(&e.author);
        }
        let _ = writeln!(out, "{}{}", "    ".repeat(e.indent), line);
    }
    out
}

fn render_html(entries: &[CatalogEntry], title: &str) -> Result<String, CatalogError> {
    let mut tera = Tera::default();
    tera.add_raw_template("catalog.html", CATALOG_TEMPLATE)?;

    let mut context = Context::new();
    context.insert("title", if title.is_empty() { "Catalog" } else { title });
    context.insert("entries", entries);
    Ok(tera.render("catalog.html", &context)?)
}
