//! Glossary loading and matching.
//! Loads drawing term pairs from JSON and returns the entries that occur in a
//! batch, so the prompt only carries terms that matter for it.

use serde::Deserialize;
use std::path::Path;

use super::GlossaryEntry;
use crate::error::GlossaryError;

/// On-disk glossary file format.
#[derive(Debug, Deserialize)]
struct GlossaryFile {
    #[serde(default)]
    version: u32,
    entries: Vec<GlossaryEntry>,
}

pub struct Glossary {
    version: u32,
    entries: Vec<GlossaryEntry>,
}

impl Glossary {
    pub fn load_from_file(path: &Path) -> Result<Self, GlossaryError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, GlossaryError> {
        let file: GlossaryFile = serde_json::from_str(content)?;
        Ok(Self {
            version: file.version,
            entries: file.entries,
        })
    }

    /// Create an empty glossary (fallback when file is missing).
    pub fn empty() -> Self {
        Self {
            version: 0,
            entries: Vec::new(),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries whose `source` term appears in any of `texts` (case-insensitive).
    pub fn match_batch(&self, texts: &[String]) -> Vec<GlossaryEntry> {
        if self.entries.is_empty() {
            return Vec::new();
        }
        let lowered: Vec<String> = texts.iter().map(|t| t.to_lowercase()).collect();
        self.entries
            .iter()
            .filter(|e| {
                let term = e.source.to_lowercase();
                lowered.iter().any(|t| t.contains(&term))
            })
            .cloned()
            .collect()
    }
}
