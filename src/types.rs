//! Core types shared by the local tree and the remote drivers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Field holding the taxon author.
pub const AUTHOR: &str = "author";
/// Field holding the bibliographic reference of the name.
pub const REFERENCE: &str = "reference";
/// Field holding the id of the dataset the name was taken from.
pub const SOURCE: &str = "source";
/// Field holding space separated `service:id` tokens.
pub const EXTERN: &str = "extern";
/// Free text comment.
pub const COMMENT: &str = "comment";

/// Keys that are part of the tree structure and can only change through
/// the dedicated tree operations.
pub const PROTECTED_KEYS: [&str; 4] = ["name", "parent", "rank", "correct"];

/// Linnean rank, ordered from the most inclusive to the most exclusive.
///
/// `Unranked` is the zero value and sorts below every real rank.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Rank {
    #[default]
    Unranked,
    Kingdom,
    Phylum,
    Class,
    Order,
    Family,
    Genus,
    Species,
}

impl Rank {
    pub const ALL: [Rank; 8] = [
        Rank::Unranked,
        Rank::Kingdom,
        Rank::Phylum,
        Rank::Class,
        Rank::Order,
        Rank::Family,
        Rank::Genus,
        Rank::Species,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Rank::Unranked => "unranked",
            Rank::Kingdom => "kingdom",
            Rank::Phylum => "phylum",
            Rank::Class => "class",
            Rank::Order => "order",
            Rank::Family => "family",
            Rank::Genus => "genus",
            Rank::Species => "species",
        }
    }

    pub fn is_ranked(&self) -> bool {
        *self != Rank::Unranked
    }

    /// Capitalized label used in catalogs.
    pub fn label(&self) -> &'static str {
        match self {
            Rank::Unranked => "",
            Rank::Kingdom => "Kingdom",
            Rank::Phylum => "Phylum",
            Rank::Class => "Class",
            Rank::Order => "Order",
            Rank::Family => "Family",
            Rank::Genus => "Genus",
            Rank::Species => "Species",
        }
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Rank {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        if s.is_empty() {
            return Ok(Rank::Unranked);
        }
        Rank::ALL
            .iter()
            .find(|r| r.as_str() == s)
            .copied()
            .ok_or_else(|| {
                let valid: Vec<&str> = Rank::ALL.iter().map(|r| r.as_str()).collect();
                format!("Invalid rank: {}. Must be one of {}", s, valid.join(", "))
            })
    }
}

/// A taxon as returned by any taxonomy query.
///
/// For the local tree `id` and `parent` are names passed through
/// [`name_to_id`]. For remote drivers both are remote identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonRecord {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub parent: String,
    pub rank: Rank,
    pub correct: bool,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub fields: BTreeMap<String, String>,
}

impl TaxonRecord {
    pub fn value(&self, key: &str) -> &str {
        self.fields.get(key).map(String::as_str).unwrap_or("")
    }

    /// The remote id recorded for `service`, if any.
    pub fn extern_id(&self, service: &str) -> Option<&str> {
        extern_id(self.value(EXTERN), service)
    }

    pub fn status(&self) -> &'static str {
        status_label(self.correct)
    }
}

pub fn status_label(correct: bool) -> &'static str {
    if correct { "correct" } else { "synonym" }
}

/// Normalize a taxon name: collapse whitespace, lowercase, capitalize the
/// first letter.
pub fn canonical_name(name: &str) -> String {
    let joined = name.split_whitespace().collect::<Vec<_>>().join(" ");
    let lower = joined.to_lowercase();
    let mut chars = lower.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Id of a local taxon as seen through the query interface. Spaces become
/// underscores so ids fit in `extern` tokens.
pub fn name_to_id(name: &str) -> String {
    name.replace(' ', "_")
}

/// Inverse of [`name_to_id`].
pub fn id_to_name(id: &str) -> String {
    canonical_name(&id.replace('_', " "))
}

/// Find the id of `service` within an `extern` field value.
pub fn extern_id<'a>(tokens: &'a str, service: &str) -> Option<&'a str> {
    tokens.split_whitespace().find_map(|tok| {
        let (svc, id) = tok.split_once(':')?;
        (svc == service && !id.is_empty()).then_some(id)
    })
}

/// Split a `service:id` token.
pub fn parse_extern(token: &str) -> Option<(&str, &str)> {
    let (svc, id) = token.trim().split_once(':')?;
    if svc.is_empty() || svc.contains(char::is_whitespace) || id.contains(char::is_whitespace) {
        return None;
    }
    Some((svc, id))
}

/// Replace the token for `service` in an `extern` field value. An empty `id`
/// removes the token.
pub fn merge_extern(tokens: &str, service: &str, id: &str) -> String {
    let mut out: Vec<String> = tokens
        .split_whitespace()
        .filter(|tok| tok.split_once(':').map(|(s, _)| s) != Some(service))
        .map(str::to_string)
        .collect();
    if !id.is_empty() {
        out.push(format!("{}:{}", service, id));
    }
    out.join(" ")
}
