//! Reader and writer for the stanza record format.
//!
//! A stanza file is a list of records. Each record is a sequence of
//! `key: value` lines ended by a line holding only `%`:
//!
//! ```text
//! # comment
//! name: Homo sapiens
//! parent: Homo
//! rank: species
//! reference: Linnaeus, C. (1758).
//!     Systema Naturae.
//! %
//! ```
//!
//! Lines starting with a space or tab continue the value of the previous
//! field. The writer indents continuation lines with a single tab, and the
//! reader strips only that tab, so blank lines and indentation inside a
//! value survive a round trip. Space-indented lines are trimmed.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use thiserror::Error;

/// A single record: field name to value.
pub type Record = BTreeMap<String, String>;

#[derive(Error, Debug)]
pub enum StanzaError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
}

/// Iterates over the records of a stanza stream.
pub struct Reader<R> {
    input: R,
    line: usize,
    done: bool,
}

impl<R: BufRead> Reader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            line: 0,
            done: false,
        }
    }

    /// Current line number, 1-based.
    pub fn line(&self) -> usize {
        self.line
    }

    fn read_record(&mut self) -> Result<Option<Record>, StanzaError> {
        let mut record = Record::new();
        let mut last_key: Option<String> = None;
        let mut buf = String::new();

        loop {
            buf.clear();
            if self.input.read_line(&mut buf)? == 0 {
                self.done = true;
                return Ok(if record.is_empty() { None } else { Some(record) });
            }
            self.line += 1;
            let raw = buf.trim_end_matches(['\n', '\r']);

            if raw.starts_with(' ') || raw.starts_with('\t') {
                let cont = match raw.strip_prefix('\t') {
                    Some(rest) => rest,
                    None => raw.trim(),
                };
                if cont.is_empty() && raw.starts_with(' ') {
                    continue;
                }
                let Some(key) = &last_key else {
                    return Err(StanzaError::Syntax {
                        line: self.line,
                        message: "continuation line without a field".to_string(),
                    });
                };
                if let Some(value) = record.get_mut(key) {
                    if !value.is_empty() {
                        value.push('\n');
                    }
                    value.push_str(cont);
                }
                continue;
            }

            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                last_key = None;
                continue;
            }
            if line == "%" {
                if record.is_empty() {
                    continue;
                }
                return Ok(Some(record));
            }

            let Some((key, value)) = line.split_once(':') else {
                return Err(StanzaError::Syntax {
                    line: self.line,
                    message: format!("expecting 'field: value', got '{}'", line),
                });
            };
            let key = key.trim().to_lowercase();
            if key.is_empty() {
                return Err(StanzaError::Syntax {
                    line: self.line,
                    message: "empty field name".to_string(),
                });
            }
            if record.contains_key(&key) {
                return Err(StanzaError::Syntax {
                    line: self.line,
                    message: format!("repeated field '{}'", key),
                });
            }
            record.insert(key.clone(), value.trim().to_string());
            last_key = Some(key);
        }
    }
}

impl<R: BufRead> Iterator for Reader<R> {
    type Item = Result<Record, StanzaError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(rec)) => Some(Ok(rec)),
            Ok(None) => None,
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Whether `key` can be written as a field name and read back unchanged.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && !key.starts_with('#')
        && !key.starts_with('%')
        && !key.contains(':')
        && !key.chars().any(char::is_whitespace)
}

/// Writes records, emitting `order` keys first.
pub struct Writer<W> {
    out: W,
    order: Vec<String>,
}

impl<W: Write> Writer<W> {
    pub fn new(out: W, order: &[&str]) -> Self {
        Self {
            out,
            order: order.iter().map(|k| k.to_string()).collect(),
        }
    }

    pub fn write(&mut self, record: &Record) -> Result<(), StanzaError> {
        for key in &self.order {
            if let Some(value) = record.get(key) {
                write_field(&mut self.out, key, value)?;
            }
        }
        for (key, value) in record {
            if self.order.contains(key) {
                continue;
            }
            write_field(&mut self.out, key, value)?;
        }
        writeln!(self.out, "%")?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), StanzaError> {
        self.out.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

fn write_field<W: Write>(out: &mut W, key: &str, value: &str) -> Result<(), StanzaError> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(());
    }
    let mut lines = value.lines();
    if let Some(first) = lines.next() {
        writeln!(out, "{}: {}", key, first.trim())?;
    }
    for line in lines {
        writeln!(out, "\t{}", line)?;
    }
    Ok(())
}
