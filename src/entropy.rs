//! Per-step token probability analysis
//!
//! Converts the raw logits emitted at each decoding step into entropy and
//! top-k token summaries. One [`StepRecord`] is produced per step per batch
//! element, matching the layout of the scores returned by a generate call
//! (tuple of `[batch, vocab]` tensors, one per step).

use std::str::FromStr;

use anyhow::Result;
use candle_core::{DType, Tensor};
use tokenizers::Tokenizer;

/// Epsilon added inside the log for numerical stability at p = 0
pub const STEP_ENTROPY_EPS: f64 = 1e-10;

/// Logarithm base for entropy computation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogBase {
    /// Natural log, entropy in nats
    #[default]
    Nats,
    /// Base-2 log, entropy in bits
    Bits,
}

impl FromStr for LogBase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "e" | "nats" => Ok(Self::Nats),
            "2" | "bits" => Ok(Self::Bits),
            other => anyhow::bail!("Invalid log base: {other} (expected 'e' or '2')"),
        }
    }
}

/// Decodes a token id to its textual surface form
///
/// Kept as a trait so analysis can run against a mock vocabulary in tests
/// without loading tokenizer files.
pub trait TokenDecoder {
    fn decode_token(&self, token_id: u32) -> String;
}

impl TokenDecoder for Tokenizer {
    fn decode_token(&self, token_id: u32) -> String {
        self.decode(&[token_id], false)
            .unwrap_or_else(|_| format!("<{token_id}>"))
    }
}

/// Fallback decoder that renders every token id as `<id>`
///
/// Used by the mock pipeline and anywhere no real tokenizer is available.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawTokenDecoder;

impl TokenDecoder for RawTokenDecoder {
    fn decode_token(&self, token_id: u32) -> String {
        format!("<{token_id}>")
    }
}

/// A single token prediction
#[derive(Debug, Clone)]
pub struct TokenPrediction {
    /// Token ID
    pub token_id: u32,
    /// Decoded token string
    pub token: String,
    /// Probability (0.0 - 1.0)
    pub probability: f32,
}

/// Analysis of one decoding step for one batch element
#[derive(Debug, Clone)]
pub struct StepRecord {
    /// Decoding step index (0-based)
    pub step: usize,
    /// Shannon entropy of the step's token distribution
    pub entropy: f64,
    /// Top-k predictions, highest probability first
    pub top_k: Vec<TokenPrediction>,
}

/// Computes entropy and top-k summaries from per-step logits
///
/// Stateless across calls; `top_k` and the log base are fixed for the
/// whole analyzer.
#[derive(Debug, Clone)]
pub struct StepAnalyzer {
    top_k: usize,
    log_base: LogBase,
}

impl StepAnalyzer {
    /// Create a new analyzer; `top_k` must be at least 1
    pub fn new(top_k: usize, log_base: LogBase) -> Result<Self> {
        if top_k == 0 {
            anyhow::bail!("top_k must be at least 1");
        }
        Ok(Self { top_k, log_base })
    }

    /// The configured top-k count
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Analyze one logit tensor per decoding step
    ///
    /// Each tensor in `scores` has shape `[batch, vocab]`. Returns one
    /// record list per batch element, each with one entry per step.
    pub fn analyze_steps(
        &self,
        scores: &[Tensor],
        decoder: &dyn TokenDecoder,
    ) -> Result<Vec<Vec<StepRecord>>> {
        let mut results: Vec<Vec<StepRecord>> = Vec::new();

        for (step_idx, logits) in scores.iter().enumerate() {
            let logits_f32 = logits.to_dtype(DType::F32)?;
            let (batch_size, vocab_size) = logits_f32.dims2()?;
            if self.top_k > vocab_size {
                anyhow::bail!(
                    "top_k {} exceeds vocabulary size {vocab_size}",
                    self.top_k
                );
            }
            if results.is_empty() {
                results = vec![Vec::with_capacity(scores.len()); batch_size];
            } else if results.len() != batch_size {
                anyhow::bail!(
                    "Batch size changed between steps: {} vs {batch_size}",
                    results.len()
                );
            }

            let probs = candle_nn::ops::softmax_last_dim(&logits_f32)?;
            let rows: Vec<Vec<f32>> = probs.to_vec2()?;

            for (batch_idx, row) in rows.iter().enumerate() {
                let entropy = distribution_entropy(row, self.log_base);
                let top_k = self.top_k_predictions(row, decoder);
                results[batch_idx].push(StepRecord {
                    step: step_idx,
                    entropy,
                    top_k,
                });
            }
        }

        Ok(results)
    }

    /// Select the top-k entries of one probability row
    fn top_k_predictions(&self, probs: &[f32], decoder: &dyn TokenDecoder) -> Vec<TokenPrediction> {
        let mut indexed: Vec<(usize, f32)> =
            probs.iter().copied().enumerate().collect();
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        indexed
            .into_iter()
            .take(self.top_k)
            .map(|(idx, prob)| {
                let token_id = idx as u32;
                TokenPrediction {
                    token_id,
                    token: decoder.decode_token(token_id),
                    probability: prob,
                }
            })
            .collect()
    }
}

/// Shannon entropy of a probability distribution
///
/// `H = -Σ p·log(p + ε)` with ε = 1e-10; natural log for nats,
/// log2 for bits.
pub fn distribution_entropy(probs: &[f32], base: LogBase) -> f64 {
    let sum: f64 = probs
        .iter()
        .map(|&p| {
            let p = f64::from(p);
            match base {
                LogBase::Nats => p * (p + STEP_ENTROPY_EPS).ln(),
                LogBase::Bits => p * (p + STEP_ENTROPY_EPS).log2(),
            }
        })
        .sum();
    -sum
}

/// Mean entropy across all recorded steps of one generated sequence
///
/// An empty record list is a contract error, not a silent zero.
pub fn mean_entropy(records: &[StepRecord]) -> Result<f64> {
    if records.is_empty() {
        anyhow::bail!("Cannot aggregate entropy over an empty step list");
    }
    let total: f64 = records.iter().map(|r| r.entropy).sum();
    Ok(total / records.len() as f64)
}
