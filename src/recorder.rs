//! Batch generation with per-step entropy recording
//!
//! [`GenerationRecorder`] drives a [`GenerativeModel`] over a
//! [`BenchmarkDataset`], runs [`StepAnalyzer`] on the per-step scores of
//! each sample, and writes two CSV files:
//!
//! - `results.csv`: one row per sample with the generated text and its
//!   mean step entropy
//! - `step_details.csv`: one row per decoding step with entropy and the
//!   flattened top-k columns (`top1_token`, `top1_prob`, `top1_token_id`,
//!   `top2_token`, ...)
//!
//! A sample whose generation or analysis fails is logged and skipped; the
//! run continues and the failure count is reported in the summary.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::dataset::BenchmarkDataset;
use crate::entropy::{mean_entropy, LogBase, StepAnalyzer, StepRecord, TokenDecoder};
use crate::model::GenerativeModel;

/// Recorder settings
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// Tokens to generate per sample
    pub max_new_tokens: usize,
    /// Predictions recorded per decoding step
    pub top_k: usize,
    /// Entropy unit
    pub log_base: LogBase,
    /// Directory receiving the CSV files; created if absent
    pub output_dir: PathBuf,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 20,
            top_k: 5,
            log_base: LogBase::Nats,
            output_dir: PathBuf::from("outputs"),
        }
    }
}

/// Per-sample outcome of a recording run
#[derive(Debug, Clone)]
pub struct SampleSummary {
    pub sample_id: String,
    pub category: String,
    pub question: String,
    pub answer: String,
    pub generated_text: String,
    pub avg_entropy: f64,
    /// Per-step records for the sample's single batch element
    pub steps: Vec<StepRecord>,
}

/// Aggregate outcome of a recording run
#[derive(Debug)]
pub struct RecordingReport {
    pub summaries: Vec<SampleSummary>,
    pub failed_samples: usize,
    pub results_path: PathBuf,
    pub step_details_path: PathBuf,
}

/// Runs generation over a dataset and persists entropy records
pub struct GenerationRecorder {
    config: RecorderConfig,
    analyzer: StepAnalyzer,
}

impl GenerationRecorder {
    pub fn new(config: RecorderConfig) -> Result<Self> {
        let analyzer = StepAnalyzer::new(config.top_k, config.log_base)?;
        Ok(Self { config, analyzer })
    }

    /// Generate over every dataset sample and write both CSV files
    ///
    /// Individual sample failures are warned about and skipped.
    pub fn run<M: GenerativeModel + ?Sized>(
        &self,
        model: &mut M,
        dataset: &BenchmarkDataset,
        decoder: &dyn TokenDecoder,
    ) -> Result<RecordingReport> {
        std::fs::create_dir_all(&self.config.output_dir).with_context(|| {
            format!(
                "Failed to create output directory: {}",
                self.config.output_dir.display()
            )
        })?;

        let mut summaries = Vec::new();
        let mut failed = 0usize;

        for record in dataset.records() {
            let image_path = dataset.image_path(record);
            match self.record_sample(model, record, &image_path, decoder) {
                Ok(summary) => summaries.push(summary),
                Err(err) => {
                    warn!("Sample {} failed, skipping: {err:#}", record.id);
                    failed += 1;
                }
            }
        }

        let results_path = self.config.output_dir.join("results.csv");
        let step_details_path = self.config.output_dir.join("step_details.csv");
        self.write_summary_csv(&results_path, &summaries)?;
        self.write_step_details_csv(&step_details_path, &summaries)?;

        info!(
            "Recorded {} samples ({failed} failed) into {}",
            summaries.len(),
            self.config.output_dir.display()
        );
        Ok(RecordingReport {
            summaries,
            failed_samples: failed,
            results_path,
            step_details_path,
        })
    }

    fn record_sample<M: GenerativeModel + ?Sized>(
        &self,
        model: &mut M,
        record: &crate::dataset::BenchmarkRecord,
        image_path: &Path,
        decoder: &dyn TokenDecoder,
    ) -> Result<SampleSummary> {
        let output = model.generate(
            &image_path.to_string_lossy(),
            &record.question,
            self.config.max_new_tokens,
        )?;
        let mut per_batch = self.analyzer.analyze_steps(&output.step_scores, decoder)?;
        if per_batch.len() != 1 {
            anyhow::bail!(
                "Expected single-sample generation, got batch of {}",
                per_batch.len()
            );
        }
        let steps = per_batch.remove(0);
        let avg_entropy = mean_entropy(&steps)?;

        Ok(SampleSummary {
            sample_id: record.id.clone(),
            category: record.category.clone(),
            question: record.question.clone(),
            answer: record.answer.clone(),
            generated_text: output.text,
            avg_entropy,
            steps,
        })
    }

    /// Write the one-row-per-sample summary file
    fn write_summary_csv(&self, path: &Path, summaries: &[SampleSummary]) -> Result<()> {
        let mut out = String::new();
        out.push_str("sample_id,category,question,answer,generated_text,avg_entropy\n");
        for s in summaries {
            writeln!(
                out,
                "{},{},{},{},{},{:.6}",
                csv_escape(&s.sample_id),
                csv_escape(&s.category),
                csv_escape(&s.question),
                csv_escape(&s.answer),
                csv_escape(&s.generated_text),
                s.avg_entropy
            )?;
        }
        std::fs::write(path, out)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Write the one-row-per-step detail file with flattened top-k columns
    fn write_step_details_csv(&self, path: &Path, summaries: &[SampleSummary]) -> Result<()> {
        let mut out = String::new();
        out.push_str("sample_id,category,step,entropy");
        for i in 1..=self.analyzer.top_k() {
            write!(out, ",top{i}_token,top{i}_prob,top{i}_token_id")?;
        }
        out.push('\n');

        for s in summaries {
            for step in &s.steps {
                write!(
                    out,
                    "{},{},{},{:.6}",
                    csv_escape(&s.sample_id),
                    csv_escape(&s.category),
                    step.step,
                    step.entropy
                )?;
                for rank in 0..self.analyzer.top_k() {
                    match step.top_k.get(rank) {
                        Some(p) => write!(
                            out,
                            ",{},{:.6},{}",
                            csv_escape(&p.token),
                            p.probability,
                            p.token_id
                        )?,
                        None => out.push_str(",,,"),
                    }
                }
                out.push('\n');
            }
        }
        std::fs::write(path, out)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Quote a CSV field when it contains a delimiter, quote, or newline
fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entropy::RawTokenDecoder;
    use crate::model::{MockVlm, MockVlmConfig};
    use candle_core::Device;
    use std::io::Write;

    fn tiny_dataset(dir: &Path, n: usize) -> BenchmarkDataset {
        let records: Vec<serde_json::Value> = (0..n)
            .map(|i| {
                serde_json::json!({
                    "id": format!("s{i}"),
                    "image_path": format!("img{i}.jpg"),
                    "image_name": format!("img{i}.jpg"),
                    "category": "existence",
                    "question": format!("Is there object {i}?"),
                    "answer": "yes"
                })
            })
            .collect();
        let path = dir.join("data.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(serde_json::to_string(&records).unwrap().as_bytes())
            .unwrap();
        BenchmarkDataset::load(&path).unwrap()
    }

    #[test]
    fn test_csv_escape() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_run_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = tiny_dataset(dir.path(), 2);
        let mut model = MockVlm::new(MockVlmConfig::default(), &Device::Cpu).unwrap();

        let config = RecorderConfig {
            max_new_tokens: 4,
            top_k: 3,
            log_base: LogBase::Nats,
            output_dir: dir.path().join("out"),
        };
        let recorder = GenerationRecorder::new(config).unwrap();
        let report = recorder.run(&mut model, &dataset, &RawTokenDecoder).unwrap();

        assert_eq!(report.summaries.len(), 2);
        assert_eq!(report.failed_samples, 0);

        let results = std::fs::read_to_string(&report.results_path).unwrap();
        let lines: Vec<&str> = results.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("sample_id,category,question"));
        assert!(lines[1].starts_with("s0,existence,"));

        let details = std::fs::read_to_string(&report.step_details_path).unwrap();
        let lines: Vec<&str> = details.lines().collect();
        // Header plus 2 samples x 4 steps
        assert_eq!(lines.len(), 9);
        assert!(lines[0].contains("top1_token,top1_prob,top1_token_id"));
        assert!(lines[0].contains("top3_token"));
        // 4 fixed columns + 3 per top-k rank
        assert_eq!(lines[1].split(',').count(), 4 + 3 * 3);
    }

    #[test]
    fn test_entropy_values_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = tiny_dataset(dir.path(), 1);
        let mut model = MockVlm::new(MockVlmConfig::default(), &Device::Cpu).unwrap();

        let recorder = GenerationRecorder::new(RecorderConfig {
            max_new_tokens: 3,
            output_dir: dir.path().join("out"),
            ..RecorderConfig::default()
        })
        .unwrap();
        let report = recorder.run(&mut model, &dataset, &RawTokenDecoder).unwrap();

        let summary = &report.summaries[0];
        assert_eq!(summary.steps.len(), 3);
        assert!(summary.avg_entropy.is_finite());
        assert!(summary.avg_entropy >= 0.0);
    }
}
