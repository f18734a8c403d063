//! TXT record payloads.
//!
//! A TXT record is a sequence of strings, each prefixed by a single length
//! byte and holding `key=value`. The record tracks its encoded size so that
//! mutations can be checked against the two size ceilings before they are
//! applied.

use crate::error::ServiceError;
use std::collections::{BTreeMap, HashMap};

/// Largest encoded size of a single pair, length byte included.
pub const MAX_PAIR_LEN: usize = 255;

/// Largest encoded size of a whole record.
pub const MAX_RECORD_LEN: usize = 65535;

/// Key/value metadata attached to an advertised service.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TxtRecord {
    pairs: BTreeMap<String, String>,
    len: usize,
}

impl TxtRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates or replaces the pair for `key`.
    ///
    /// Fails with [`ServiceError::TxtPairTooLarge`] if the pair alone is too
    /// large, or [`ServiceError::TxtRecordTooLarge`] if the record would grow
    /// past its limit. The record is unchanged on failure.
    pub fn set_pair(
        &mut self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), ServiceError> {
        let key = key.into();
        let value = value.into();

        let pair_len = encoded_pair_len(&key, &value);
        if pair_len > MAX_PAIR_LEN {
            return Err(ServiceError::TxtPairTooLarge);
        }

        let replaced_len = self
            .pairs
            .get(&key)
            .map(|old| encoded_pair_len(&key, old))
            .unwrap_or(0);
        let new_len = self.len - replaced_len + pair_len;
        if new_len > MAX_RECORD_LEN {
            return Err(ServiceError::TxtRecordTooLarge);
        }

        self.len = new_len;
        self.pairs.insert(key, value);
        Ok(())
    }

    /// Removes the pair for `key`, returning its value if it was present.
    pub fn delete_pair(&mut self, key: &str) -> Option<String> {
        let value = self.pairs.remove(key)?;
        self.len -= encoded_pair_len(key, &value);
        Some(value)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs.get(key).map(String::as_str)
    }

    /// Encoded size of the record in bytes.
    pub fn encoded_len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Number of pairs in the record.
    pub fn pair_count(&self) -> usize {
        self.pairs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Encodes the record as length-prefixed `key=value` strings.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        for (key, value) in &self.pairs {
            // set_pair guarantees the string fits in the length byte.
            out.push((key.len() + 1 + value.len()) as u8);
            out.extend_from_slice(key.as_bytes());
            out.push(b'=');
            out.extend_from_slice(value.as_bytes());
        }
        out
    }
}

/// Decodes an encoded TXT record into a key/value map.
///
/// An entry whose length byte runs past the end of the buffer is skipped, and
/// decoding stops there. An entry without `=` (or starting with `=`) becomes a
/// key with an empty value. Later duplicates replace earlier ones.
pub fn decode(txt: &[u8]) -> HashMap<String, String> {
    let mut pairs = HashMap::new();
    let mut offset = 0;
    while offset < txt.len() {
        let start = offset + 1;
        let end = start + txt[offset] as usize;
        if end <= txt.len() && start != end {
            let entry = &txt[start..end];
            match entry.iter().position(|b| *b == b'=') {
                Some(i) if i > 0 => {
                    pairs.insert(
                        String::from_utf8_lossy(&entry[..i]).into_owned(),
                        String::from_utf8_lossy(&entry[i + 1..]).into_owned(),
                    );
                }
                _ => {
                    pairs.insert(String::from_utf8_lossy(entry).into_owned(), String::new());
                }
            }
        }
        offset = end;
    }
    pairs
}

fn encoded_pair_len(key: &str, value: &str) -> usize {
    2 + key.len() + value.len()
}
