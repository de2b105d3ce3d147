//! Driver for the GBIF species API.
//!
//! Names are searched in the GBIF backbone. Every request is throttled and
//! transient failures (connection errors, 429 and 5xx answers) are retried
//! after a fixed delay.

use crate::dataset::DatasetRecord;
use crate::query::{DatasetSource, QueryError, Scan, Taxonomy};
use crate::types::{AUTHOR, REFERENCE, Rank, SOURCE, TaxonRecord, canonical_name};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::{BTreeMap, VecDeque};
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_URL: &str = "https://api.gbif.org/v1";

/// Dataset key of the GBIF backbone taxonomy.
pub const BACKBONE: &str = "d7dddbf4-2cf0-4f39-9b2a-bb099caae36c";

const PAGE_SIZE: usize = 100;

/// Connection settings, stored under `gbif:` in the project config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GbifConfig {
    pub url: String,
    /// Attempts per request before giving up.
    pub retries: usize,
    /// Delay between retries, also the minimum spacing of requests.
    pub delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for GbifConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            retries: 5,
            delay_ms: 100,
            timeout_secs: 30,
        }
    }
}

pub struct GbifClient {
    base_url: String,
    client: Client,
    max_retries: usize,
    delay: Duration,
    last_request: Cell<Option<Instant>>,
}

impl GbifClient {
    pub fn new(config: &GbifConfig) -> Result<Self, QueryError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("biodv/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            client,
            max_retries: config.retries.max(1),
            delay: Duration::from_millis(config.delay_ms),
            last_request: Cell::new(None),
        })
    }

    fn throttle(&self) {
        if let Some(last) = self.last_request.get() {
            let elapsed = last.elapsed();
            if elapsed < self.delay {
                thread::sleep(self.delay - elapsed);
            }
        }
        self.last_request.set(Some(Instant::now()));
    }

    /// GET `path` and decode the JSON body. A 404 answer is `Ok(None)`.
    fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Option<T>, QueryError> {
        let url = format!("{}/{}", self.base_url, path);
        let mut last_error = String::new();

        for attempt in 0..self.max_retries {
            if attempt > 0 {
                tracing::warn!(
                    "GBIF request {} attempt {} failed: {}",
                    url,
                    attempt,
                    last_error
                );
                thread::sleep(self.delay);
            }
            self.throttle();
            tracing::debug!(url = %url, ?query, "GBIF request");

            match self.client.get(&url).query(query).send() {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::NOT_FOUND {
                        return Ok(None);
                    }
                    if status.is_success() {
                        return response.json::<T>().map(Some).map_err(|e| {
                            QueryError::InvalidResponse {
                                url: url.clone(),
                                message: e.to_string(),
                            }
                        });
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        last_error = format!("status {}", status);
                        continue;
                    }
                    return Err(QueryError::Status {
                        url,
                        status: status.as_u16(),
                    });
                }
                Err(e) if e.is_timeout() || e.is_connect() || e.is_request() => {
                    last_error = e.to_string();
                }
                Err(e) => return Err(QueryError::Http(e)),
            }
        }

        Err(QueryError::Exhausted {
            url,
            attempts: self.max_retries,
            message: last_error,
        })
    }

    fn pages(&self, path: String, query: Vec<(&'static str, String)>) -> Scan<'_> {
        Box::new(PageScan {
            client: self,
            path,
            query,
            offset: 0,
            buffer: VecDeque::new(),
            done: false,
        })
    }
}

impl Taxonomy for GbifClient {
    fn lookup_name(&self, name: &str) -> Scan<'_> {
        let name = canonical_name(name);
        if name.is_empty() {
            return Box::new(std::iter::empty());
        }
        self.pages(
            "species".to_string(),
            vec![("name", name), ("datasetKey", BACKBONE.to_string())],
        )
    }

    fn lookup_id(&self, id: &str) -> Result<Option<TaxonRecord>, QueryError> {
        let id = id.trim();
        if id.is_empty() {
            return Ok(None);
        }
        let species: Option<Species> = self.get_json(&format!("species/{}", id), &[])?;
        Ok(species.and_then(Species::into_record))
    }

    fn scan_children(&self, id: &str) -> Scan<'_> {
        self.pages(format!("species/{}/children", id.trim()), Vec::new())
    }

    fn scan_synonyms(&self, id: &str) -> Scan<'_> {
        self.pages(format!("species/{}/synonyms", id.trim()), Vec::new())
    }
}

impl DatasetSource for GbifClient {
    fn dataset(&self, id: &str) -> Result<Option<DatasetRecord>, QueryError> {
        let dataset: Option<Dataset> = self.get_json(&format!("dataset/{}", id.trim()), &[])?;
        Ok(dataset.and_then(Dataset::into_record))
    }
}

/// Reads a paged endpoint one page at a time.
struct PageScan<'a> {
    client: &'a GbifClient,
    path: String,
    query: Vec<(&'static str, String)>,
    offset: usize,
    buffer: VecDeque<TaxonRecord>,
    done: bool,
}

impl PageScan<'_> {
    fn fetch(&mut self) -> Result<(), QueryError> {
        let mut query = self.query.clone();
        query.push(("offset", self.offset.to_string()));
        query.push(("limit", PAGE_SIZE.to_string()));

        let Some(page) = self.client.get_json::<Page>(&self.path, &query)? else {
            self.done = true;
            return Ok(());
        };
        self.offset += page.results.len();
        self.done = page.end_of_records || page.results.is_empty();
        self.buffer
            .extend(page.results.into_iter().filter_map(Species::into_record));
        Ok(())
    }
}

impl Iterator for PageScan<'_> {
    type Item = Result<TaxonRecord, QueryError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(rec) = self.buffer.pop_front() {
                return Some(Ok(rec));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.fetch() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Page {
    #[serde(default)]
    results: Vec<Species>,
    #[serde(default = "default_end")]
    end_of_records: bool,
}

fn default_end() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Species {
    key: Option<i64>,
    scientific_name: String,
    canonical_name: String,
    authorship: String,
    rank: String,
    taxonomic_status: String,
    parent_key: Option<i64>,
    accepted_key: Option<i64>,
    published_in: String,
    dataset_key: String,
    constituent_key: String,
}

impl Species {
    fn into_record(self) -> Option<TaxonRecord> {
        let id = self.key?.to_string();
        let name = if self.canonical_name.trim().is_empty() {
            canonical_name(&self.scientific_name)
        } else {
            canonical_name(&self.canonical_name)
        };
        if name.is_empty() {
            return None;
        }
        let correct = is_correct_status(&self.taxonomic_status);
        let parent = if correct {
            self.parent_key
        } else {
            self.accepted_key.or(self.parent_key)
        };

        let mut fields = BTreeMap::new();
        let mut put = |key: &str, value: &str| {
            let value = value.trim();
            if !value.is_empty() {
                fields.insert(key.to_string(), value.to_string());
            }
        };
        put(AUTHOR, &self.authorship);
        put(REFERENCE, &self.published_in);
        if self.constituent_key.trim().is_empty() {
            put(SOURCE, &self.dataset_key);
        } else {
            put(SOURCE, &self.constituent_key);
        }

        Some(TaxonRecord {
            id,
            name,
            parent: parent.map(|p| p.to_string()).unwrap_or_default(),
            rank: map_rank(&self.rank),
            correct,
            fields,
        })
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Dataset {
    key: String,
    title: String,
    citation: Option<Citation>,
    homepage: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Citation {
    text: String,
}

impl Dataset {
    fn into_record(self) -> Option<DatasetRecord> {
        if self.key.trim().is_empty() {
            return None;
        }
        let mut fields = BTreeMap::new();
        if let Some(text) = self.citation.map(|c| c.text).filter(|t| !t.trim().is_empty()) {
            fields.insert(REFERENCE.to_string(), text.trim().to_string());
        }
        if !self.homepage.trim().is_empty() {
            fields.insert("url".to_string(), self.homepage.trim().to_string());
        }
        Some(DatasetRecord {
            id: self.key,
            title: self.title.trim().to_string(),
            fields,
        })
    }
}

/// GBIF ranks outside the Linnean main ranks are kept unranked.
fn map_rank(rank: &str) -> Rank {
    rank.parse().unwrap_or(Rank::Unranked)
}

fn is_correct_status(status: &str) -> bool {
    matches!(status.to_uppercase().as_str(), "ACCEPTED" | "DOUBTFUL")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn species(json: &str) -> Option<TaxonRecord> {
        serde_json::from_str::<Species>(json).unwrap().into_record()
    }

    #[test]
    fn test_accepted_species() {
        let rec = species(
            r#"{"key": 2436436, "scientificName": "Homo sapiens Linnaeus, 1758",
                "canonicalName": "Homo sapiens", "authorship": "Linnaeus, 1758 ",
                "rank": "SPECIES", "taxonomicStatus": "ACCEPTED", "parentKey": 2436435,
                "publishedIn": "Syst. Nat., 10th ed.", "datasetKey": "d7dddbf4-2cf0-4f39-9b2a-bb099caae36c",
                "constituentKey": "7ddf754f-d193-4cc9-b351-99906754a03b"}"#,
        )
        .unwrap();
        assert_eq!(rec.id, "2436436");
        assert_eq!(rec.name, "Homo sapiens");
        assert_eq!(rec.parent, "2436435");
        assert_eq!(rec.rank, Rank::Species);
        assert!(rec.correct);
        assert_eq!(rec.value(AUTHOR), "Linnaeus, 1758");
        assert_eq!(rec.value(REFERENCE), "Syst. Nat., 10th ed.");
        assert_eq!(rec.value(SOURCE), "7ddf754f-d193-4cc9-b351-99906754a03b");
    }

    #[test]
    fn test_synonym_parent_is_accepted_key() {
        let rec = species(
            r#"{"key": 4, "canonicalName": "Pithecanthropus", "rank": "GENUS",
                "taxonomicStatus": "SYNONYM", "parentKey": 3, "acceptedKey": 2436435}"#,
        )
        .unwrap();
        assert!(!rec.correct);
        assert_eq!(rec.parent, "2436435");
        assert_eq!(rec.rank, Rank::Genus);
    }

    #[test]
    fn test_doubtful_is_correct_and_odd_rank_unranked() {
        let rec = species(
            r#"{"key": 5, "scientificName": "Hominini", "rank": "TRIBE",
                "taxonomicStatus": "DOUBTFUL", "parentKey": 1}"#,
        )
        .unwrap();
        assert!(rec.correct);
        assert_eq!(rec.name, "Hominini");
        assert_eq!(rec.rank, Rank::Unranked);
        assert!(rec.fields.is_empty());
    }

    #[test]
    fn test_missing_status_is_synonym() {
        let rec = species(r#"{"key": 6, "canonicalName": "Homo", "rank": "GENUS", "parentKey": 5}"#)
            .unwrap();
        assert!(!rec.correct);
        assert_eq!(rec.parent, "5");

        for status in ["HETEROTYPIC_SYNONYM", "PROPARTE_SYNONYM", "MISAPPLIED"] {
            let json = format!(
                r#"{{"key": 6, "canonicalName": "Homo", "taxonomicStatus": "{}"}}"#,
                status
            );
            assert!(!species(&json).unwrap().correct, "{}", status);
        }
    }

    #[test]
    fn test_record_without_key_is_dropped() {
        assert!(species(r#"{"canonicalName": "Homo"}"#).is_none());
        assert!(species(r#"{"key": 1}"#).is_none());
    }

    #[test]
    fn test_page_defaults_to_end() {
        let page: Page = serde_json::from_str(r#"{"results": []}"#).unwrap();
        assert!(page.end_of_records);
        let page: Page = serde_json::from_str(
            r#"{"offset": 0, "limit": 2, "endOfRecords": false, "results": [{"key": 1, "canonicalName": "Homo"}]}"#,
        )
        .unwrap();
        assert!(!page.end_of_records);
        assert_eq!(page.results.len(), 1);
    }

    #[test]
    fn test_dataset_record() {
        let ds: Dataset = serde_json::from_str(
            r#"{"key": "7ddf754f", "title": "Catalogue of Life ",
                "citation": {"text": "Bánki, O. et al. (2023)."}, "homepage": "https://www.catalogueoflife.org"}"#,
        )
        .unwrap();
        let rec = ds.into_record().unwrap();
        assert_eq!(rec.id, "7ddf754f");
        assert_eq!(rec.title, "Catalogue of Life");
        assert_eq!(rec.fields[REFERENCE], "Bánki, O. et al. (2023).");
        assert_eq!(rec.fields["url"], "https://www.catalogueoflife.org");
    }

    #[test]
    fn test_unreachable_service_gives_up() {
        let client = GbifClient::new(&GbifConfig {
            url: "http://127.0.0.1:9".to_string(),
            retries: 2,
            delay_ms: 1,
            timeout_secs: 1,
        })
        .unwrap();
        match client.lookup_id("1") {
            Err(QueryError::Exhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("expected exhausted retries, got {:?}", other),
        }
    }

    #[test]
    fn test_retries_wait_a_fixed_delay() {
        let client = GbifClient::new(&GbifConfig {
            url: "http://127.0.0.1:9".to_string(),
            retries: 4,
            delay_ms: 150,
            timeout_secs: 1,
        })
        .unwrap();
        let start = Instant::now();
        assert!(client.lookup_id("1").is_err());
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(450), "{:?}", elapsed);
        assert!(elapsed < Duration::from_millis(800), "{:?}", elapsed);
    }
}
