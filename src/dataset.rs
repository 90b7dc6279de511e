//! Benchmark dataset loading
//!
//! Evaluation samples are stored as a JSON array of records, each pairing an
//! image with a question and a reference answer. Loading is strict: a
//! missing file or malformed JSON is an error, but an empty array is a
//! valid (empty) dataset.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// One evaluation sample
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    /// Stable sample identifier
    pub id: String,
    /// Path to the image file, relative to the dataset root
    pub image_path: String,
    /// Bare image file name
    pub image_name: String,
    /// Task category, e.g. "existence" or "count"
    pub category: String,
    /// Question posed about the image
    pub question: String,
    /// Reference answer
    pub answer: String,
}

/// A loaded benchmark dataset
#[derive(Debug, Clone)]
pub struct BenchmarkDataset {
    root: PathBuf,
    records: Vec<BenchmarkRecord>,
}

impl BenchmarkDataset {
    /// Load a dataset from a JSON array file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read dataset file: {}", path.display()))?;
        let records: Vec<BenchmarkRecord> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse dataset file: {}", path.display()))?;

        let root = path.parent().unwrap_or(Path::new(".")).to_path_buf();
        info!("Loaded {} samples from {}", records.len(), path.display());
        Ok(Self { root, records })
    }

    /// Keep only the records whose category is in `categories`
    pub fn with_categories(self, categories: &[String]) -> Self {
        let records = self
            .records
            .into_iter()
            .filter(|r| categories.iter().any(|c| c == &r.category))
            .collect();
        Self {
            root: self.root,
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[BenchmarkRecord] {
        &self.records
    }

    /// Distinct categories present, in first-seen order
    pub fn categories(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for record in &self.records {
            if !seen.contains(&record.category) {
                seen.push(record.category.clone());
            }
        }
        seen
    }

    /// Resolve a record's image path against the dataset root
    pub fn image_path(&self, record: &BenchmarkRecord) -> PathBuf {
        self.root.join(&record.image_path)
    }
}
