// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // AttentionModifier in modifier.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::unused_self)] // &self for API consistency
#![allow(clippy::trivially_copy_pass_by_ref)] // &usize for API consistency
#![allow(clippy::struct_field_names)] // field postfix patterns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::unnecessary_wraps)] // Result for future error handling
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! deephallu-rs: attention-level hallucination analysis for VLMs
//!
//! Investigates how modality-aware attention rewriting affects
//! hallucination in vision-language models: intercepts attention weights
//! at inference time, applies per-quadrant transforms, and measures the
//! entropy of generated token distributions.
//!
//! ## Architecture
//!
//! - `model`: Hookable/generative model traits and the mock VLM
//! - `masks`: Causal and modality attention mask construction
//! - `transforms`: Attention tensor transforms (sparsify, symmetrize, causal)
//! - `modifier`: Runtime attention interception and before/after snapshots
//! - `fusion`: Vision-text embedding fusion strategies
//! - `entropy`: Per-step token probability and entropy analysis
//! - `dataset`: Benchmark sample loading
//! - `metrics`: Hallucination evaluation metrics (CHAIR, POPE, ...)
//! - `recorder`: Batch generation with CSV entropy records

pub mod dataset;
pub mod entropy;
pub mod fusion;
pub mod masks;
pub mod metrics;
pub mod model;
pub mod modifier;
pub mod recorder;
pub mod transforms;

pub use dataset::{BenchmarkDataset, BenchmarkRecord};
pub use entropy::{
    distribution_entropy, mean_entropy, LogBase, RawTokenDecoder, StepAnalyzer, StepRecord,
    TokenDecoder, TokenPrediction, STEP_ENTROPY_EPS,
};
pub use fusion::{EmbeddingFuser, FusionMethod};
pub use masks::{create_causal_mask, create_modality_mask, CrossAttentionType};
pub use metrics::{ChairScore, FaithfulnessScore, HallucinationRate, Metric, PopeEvaluator};
pub use model::{
    AttentionOutput, ForwardHook, GenerationOutput, GenerativeModel, HookHandle, HookableModel,
    MockVlm, MockVlmConfig,
};
pub use modifier::{
    AttentionModifier, AttentionPolicy, AttentionSnapshot, LayerAttentionStats, TextAttentionType,
    VisionAttentionType,
};
pub use recorder::{GenerationRecorder, RecorderConfig, RecordingReport, SampleSummary};
pub use transforms::{
    apply_causal, attention_change, attention_entropy, attention_sparsity, sparsify, symmetrize,
    SparsifyMethod, ATTN_ENTROPY_EPS, DEFAULT_SPARSITY_THRESHOLD,
};
