//! Per-session class vocabulary

use crate::error::{Error, Result};
use serde::Serialize;

/// Ordered set of class labels a session asked the detector to recognize.
///
/// Built once from the handshake and never mutated afterwards. Duplicate
/// labels keep their first position.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(transparent)]
pub struct ClassVocabulary {
    labels: Vec<String>,
}

impl ClassVocabulary {
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for label in labels {
            let label = label.into();
            if !unique.contains(&label) {
                unique.push(label);
            }
        }
        Self { labels: unique }
    }

    /// Parse a handshake payload. Only a JSON array of strings is accepted.
    pub fn parse_handshake(payload: &str) -> Result<Self> {
        let labels: Vec<String> = serde_json::from_str(payload)
            .map_err(|e| Error::Protocol(format!("invalid handshake payload: {}", e)))?;
        Ok(Self::new(labels))
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.labels.iter().map(String::as_str)
    }
}
