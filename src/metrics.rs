//! Hallucination evaluation metrics
//!
//! Text-level metrics over paired `(prediction, reference)` lists:
//!
//! - [`ChairScore`]: object-vocabulary hallucination in captions (CHAIR)
//! - [`PopeEvaluator`]: yes/no polling accuracy (POPE)
//! - [`HallucinationRate`]: length-heuristic hallucination flagging
//! - [`FaithfulnessScore`]: word-overlap faithfulness
//!
//! All metrics implement the [`Metric`] trait and return named scores in a
//! `BTreeMap` so result files serialize with stable key order. Mismatched
//! list lengths are a contract error.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};

/// Common COCO object vocabulary, used when no vocabulary file is supplied
const DEFAULT_COCO_OBJECTS: &[&str] = &[
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove",
];

/// A named hallucination metric over prediction/reference text pairs
pub trait Metric {
    fn name(&self) -> &'static str;

    /// Compute named scores; `predictions` and `references` must be the
    /// same length
    fn compute(&self, predictions: &[String], references: &[String])
        -> Result<BTreeMap<String, f64>>;
}

fn check_lengths(predictions: &[String], references: &[String]) -> Result<()> {
    if predictions.len() != references.len() {
        anyhow::bail!(
            "Prediction/reference length mismatch: {} vs {}",
            predictions.len(),
            references.len()
        );
    }
    Ok(())
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

// =========================================================================
// CHAIR
// =========================================================================

/// CHAIR (Caption Hallucination Assessment with Image Relevance)
///
/// Flags caption words from the object vocabulary that do not appear in the
/// reference. `CHAIR_S` is the fraction of captions with at least one
/// hallucinated object; `CHAIR_I` is the fraction of mentioned objects that
/// are hallucinated.
pub struct ChairScore {
    objects: HashSet<String>,
}

impl ChairScore {
    /// Create with the built-in COCO object vocabulary
    pub fn new() -> Self {
        Self {
            objects: DEFAULT_COCO_OBJECTS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Create with an object vocabulary loaded from a JSON array of strings
    pub fn from_vocabulary_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read object vocabulary: {}", path.display()))?;
        let objects: Vec<String> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse object vocabulary: {}", path.display()))?;
        Ok(Self {
            objects: objects.into_iter().map(|s| s.to_lowercase()).collect(),
        })
    }

    /// Vocabulary words mentioned in the text
    fn extract_objects(&self, text: &str) -> HashSet<String> {
        text.to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty() && self.objects.contains(*w))
            .map(|w| w.to_string())
            .collect()
    }
}

impl Default for ChairScore {
    fn default() -> Self {
        Self::new()
    }
}

impl Metric for ChairScore {
    fn name(&self) -> &'static str {
        "chair"
    }

    fn compute(
        &self,
        predictions: &[String],
        references: &[String],
    ) -> Result<BTreeMap<String, f64>> {
        check_lengths(predictions, references)?;

        let mut hallucinated_sentences = 0;
        let mut total_mentioned = 0;
        let mut total_hallucinated = 0;

        for (pred, reference) in predictions.iter().zip(references) {
            let pred_objects = self.extract_objects(pred);
            let ref_objects = self.extract_objects(reference);
            let hallucinated = pred_objects.difference(&ref_objects).count();

            if hallucinated > 0 {
                hallucinated_sentences += 1;
            }
            total_mentioned += pred_objects.len();
            total_hallucinated += hallucinated;
        }

        let chair_s = ratio(hallucinated_sentences, predictions.len());
        let chair_i = ratio(total_hallucinated, total_mentioned);

        let mut scores = BTreeMap::new();
        scores.insert("CHAIR_S".to_string(), chair_s);
        scores.insert("CHAIR_I".to_string(), chair_i);
        scores.insert("CHAIR_avg".to_string(), (chair_s + chair_i) / 2.0);
        Ok(scores)
    }
}

// =========================================================================
// POPE
// =========================================================================

/// POPE (Polling-based Object Probing Evaluation)
///
/// Parses free-text answers to yes/no object-existence questions and
/// reports classification quality. The hallucination rate is the false
/// positive rate: claiming an absent object exists.
pub struct PopeEvaluator;

const POSITIVE_KEYWORDS: &[&str] = &["yes", "true", "correct", "right", "sure", "definitely"];
const NEGATIVE_KEYWORDS: &[&str] = &["no", "false", "incorrect", "wrong", "not", "never"];

impl PopeEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Parse a free-text response to a binary answer
    ///
    /// Positive keywords win over negative ones, and an answer matching
    /// neither set defaults to positive.
    fn parse_response(response: &str) -> bool {
        let lower = response.to_lowercase();
        let words: HashSet<&str> = lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        if POSITIVE_KEYWORDS.iter().any(|k| words.contains(k)) {
            true
        } else {
            !NEGATIVE_KEYWORDS.iter().any(|k| words.contains(k))
        }
    }
}

impl Default for PopeEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Metric for PopeEvaluator {
    fn name(&self) -> &'static str {
        "pope"
    }

    fn compute(
        &self,
        predictions: &[String],
        references: &[String],
    ) -> Result<BTreeMap<String, f64>> {
        check_lengths(predictions, references)?;

        let mut tp = 0usize;
        let mut fp = 0usize;
        let mut tn = 0usize;
        let mut fn_ = 0usize;

        for (pred, reference) in predictions.iter().zip(references) {
            let p = Self::parse_response(pred);
            let r = matches!(reference.to_lowercase().trim(), "yes" | "true" | "1");
            match (p, r) {
                (true, true) => tp += 1,
                (true, false) => fp += 1,
                (false, false) => tn += 1,
                (false, true) => fn_ += 1,
            }
        }

        let accuracy = ratio(tp + tn, predictions.len());
        let precision = ratio(tp, tp + fp);
        let recall = ratio(tp, tp + fn_);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };
        let hallucination_rate = ratio(fp, fp + tn);

        let mut scores = BTreeMap::new();
        scores.insert("accuracy".to_string(), accuracy);
        scores.insert("precision".to_string(), precision);
        scores.insert("recall".to_string(), recall);
        scores.insert("f1_score".to_string(), f1);
        scores.insert("hallucination_rate".to_string(), hallucination_rate);
        scores.insert("true_positives".to_string(), tp as f64);
        scores.insert("false_positives".to_string(), fp as f64);
        scores.insert("true_negatives".to_string(), tn as f64);
        scores.insert("false_negatives".to_string(), fn_ as f64);
        Ok(scores)
    }
}

// =========================================================================
// Hallucination rate
// =========================================================================

/// Length-heuristic hallucination flagging
///
/// A prediction more than 1.5x longer (in words) than its reference is
/// flagged as hallucinated. Crude, but annotation-free.
pub struct HallucinationRate;

impl HallucinationRate {
    pub fn new() -> Self {
        Self
    }
}

impl Default for HallucinationRate {
    fn default() -> Self {
        Self::new()
    }
}

impl Metric for HallucinationRate {
    fn name(&self) -> &'static str {
        "hallucination_rate"
    }

    fn compute(
        &self,
        predictions: &[String],
        references: &[String],
    ) -> Result<BTreeMap<String, f64>> {
        check_lengths(predictions, references)?;

        let hallucinations = predictions
            .iter()
            .zip(references)
            .filter(|(pred, reference)| {
                let pred_words = pred.split_whitespace().count();
                let ref_words = reference.split_whitespace().count();
                pred_words as f64 > ref_words as f64 * 1.5
            })
            .count();

        let mut scores = BTreeMap::new();
        scores.insert(
            "overall_hallucination_rate".to_string(),
            ratio(hallucinations, predictions.len()),
        );
        Ok(scores)
    }
}

// =========================================================================
// Faithfulness
// =========================================================================

/// Word-overlap faithfulness between predictions and references
///
/// Similarity is Jaccard overlap of the lowercased word sets; a pair at or
/// above the threshold counts as faithful.
pub struct FaithfulnessScore {
    similarity_threshold: f64,
}

impl FaithfulnessScore {
    /// Create with the given faithfulness threshold (default 0.8)
    pub fn new(similarity_threshold: f64) -> Self {
        Self {
            similarity_threshold,
        }
    }

    fn similarity(text1: &str, text2: &str) -> f64 {
        let lower1 = text1.to_lowercase();
        let lower2 = text2.to_lowercase();
        let words1: HashSet<&str> = lower1.split_whitespace().collect();
        let words2: HashSet<&str> = lower2.split_whitespace().collect();

        let intersection = words1.intersection(&words2).count();
        let union = words1.union(&words2).count();
        ratio(intersection, union)
    }
}

impl Default for FaithfulnessScore {
    fn default() -> Self {
        Self::new(0.8)
    }
}

impl Metric for FaithfulnessScore {
    fn name(&self) -> &'static str {
        "faithfulness"
    }

    fn compute(
        &self,
        predictions: &[String],
        references: &[String],
    ) -> Result<BTreeMap<String, f64>> {
        check_lengths(predictions, references)?;

        let similarities: Vec<f64> = predictions
            .iter()
            .zip(references)
            .map(|(p, r)| Self::similarity(p, r))
            .collect();
        let faithful = similarities
            .iter()
            .filter(|&&s| s >= self.similarity_threshold)
            .count();

        let avg = if similarities.is_empty() {
            0.0
        } else {
            similarities.iter().sum::<f64>() / similarities.len() as f64
        };
        let min = similarities.iter().copied().fold(f64::INFINITY, f64::min);
        let max = similarities
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);

        let mut scores = BTreeMap::new();
        scores.insert("avg_faithfulness".to_string(), avg);
        scores.insert(
            "faithfulness_rate".to_string(),
            ratio(faithful, predictions.len()),
        );
        scores.insert(
            "min_faithfulness".to_string(),
            if similarities.is_empty() { 0.0 } else { min },
        );
        scores.insert(
            "max_faithfulness".to_string(),
            if similarities.is_empty() { 0.0 } else { max },
        );
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_chair_detects_hallucinated_objects() {
        let metric = ChairScore::new();
        let predictions = strings(&["a cat and a dog on a bench", "a person with a bicycle"]);
        let references = strings(&["a cat sits on a bench", "a person with a bicycle"]);
        let scores = metric.compute(&predictions, &references).unwrap();

        // First caption hallucinates "dog"; second is clean
        assert!((scores["CHAIR_S"] - 0.5).abs() < 1e-9);
        // 5 vocabulary mentions total, 1 hallucinated
        assert!((scores["CHAIR_I"] - 0.2).abs() < 1e-9);
        assert!((scores["CHAIR_avg"] - 0.35).abs() < 1e-9);
    }

    #[test]
    fn test_chair_ignores_non_vocabulary_words() {
        let metric = ChairScore::new();
        let predictions = strings(&["a purple dinosaur flying"]);
        let references = strings(&["an empty street"]);
        let scores = metric.compute(&predictions, &references).unwrap();
        assert_eq!(scores["CHAIR_S"], 0.0);
        assert_eq!(scores["CHAIR_I"], 0.0);
    }

    #[test]
    fn test_pope_parsing() {
        assert!(PopeEvaluator::parse_response("Yes, there is a cat."));
        assert!(!PopeEvaluator::parse_response("No, I don't see one."));
        assert!(!PopeEvaluator::parse_response("That is not present"));
        // Ambiguous answers default to positive
        assert!(PopeEvaluator::parse_response("maybe"));
    }

    #[test]
    fn test_pope_counts() {
        let metric = PopeEvaluator::new();
        let predictions = strings(&["yes", "no", "yes", "no"]);
        let references = strings(&["yes", "no", "no", "yes"]);
        let scores = metric.compute(&predictions, &references).unwrap();

        assert_eq!(scores["true_positives"], 1.0);
        assert_eq!(scores["true_negatives"], 1.0);
        assert_eq!(scores["false_positives"], 1.0);
        assert_eq!(scores["false_negatives"], 1.0);
        assert!((scores["accuracy"] - 0.5).abs() < 1e-9);
        assert!((scores["precision"] - 0.5).abs() < 1e-9);
        assert!((scores["recall"] - 0.5).abs() < 1e-9);
        assert!((scores["hallucination_rate"] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_pope_all_correct() {
        let metric = PopeEvaluator::new();
        let predictions = strings(&["yes", "no"]);
        let references = strings(&["yes", "no"]);
        let scores = metric.compute(&predictions, &references).unwrap();
        assert_eq!(scores["accuracy"], 1.0);
        assert_eq!(scores["f1_score"], 1.0);
        assert_eq!(scores["hallucination_rate"], 0.0);
    }

    #[test]
    fn test_hallucination_rate_length_heuristic() {
        let metric = HallucinationRate::new();
        let predictions = strings(&["one two three four", "short answer"]);
        let references = strings(&["one two", "short answer here"]);
        let scores = metric.compute(&predictions, &references).unwrap();
        // 4 words > 2 * 1.5 flags the first pair only
        assert!((scores["overall_hallucination_rate"] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_faithfulness_identical_and_disjoint() {
        let metric = FaithfulnessScore::default();
        let predictions = strings(&["the cat sat", "alpha beta"]);
        let references = strings(&["the cat sat", "gamma delta"]);
        let scores = metric.compute(&predictions, &references).unwrap();

        assert!((scores["avg_faithfulness"] - 0.5).abs() < 1e-9);
        assert_eq!(scores["max_faithfulness"], 1.0);
        assert_eq!(scores["min_faithfulness"], 0.0);
        assert!((scores["faithfulness_rate"] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_length_mismatch_is_error() {
        let metric = PopeEvaluator::new();
        let predictions = strings(&["yes"]);
        let references = strings(&["yes", "no"]);
        assert!(metric.compute(&predictions, &references).is_err());
    }

    #[test]
    fn test_empty_inputs() {
        let metric = ChairScore::new();
        let scores = metric.compute(&[], &[]).unwrap();
        assert_eq!(scores["CHAIR_S"], 0.0);
        let scores = FaithfulnessScore::default().compute(&[], &[]).unwrap();
        assert_eq!(scores["avg_faithfulness"], 0.0);
    }
}
