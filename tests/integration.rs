//! Integration tests for deephallu-rs
//!
//! Exercises the full pipeline against the mock VLM: hook lifecycle,
//! attention modification end to end, and batch entropy recording.

use std::io::Write;

use anyhow::Result;
use candle_core::{Device, Tensor};
use deephallu_rs::{
    AttentionModifier, AttentionPolicy, BenchmarkDataset, ForwardHook, GenerationOutput,
    GenerationRecorder, GenerativeModel, HookHandle, HookableModel, LogBase, MockVlm,
    MockVlmConfig, RawTokenDecoder, RecorderConfig, SparsifyMethod,
};
use tempfile::NamedTempFile;

fn mock_inputs(batch: usize, vision_len: usize, feat: usize, text_len: usize) -> (Tensor, Tensor) {
    let vision_data: Vec<f32> = (0..batch * vision_len * feat)
        .map(|i| (i % 11) as f32 * 0.05)
        .collect();
    let vision = Tensor::from_vec(vision_data, (batch, vision_len, feat), &Device::Cpu).unwrap();
    let ids: Vec<u32> = (0..batch * text_len).map(|i| (i % 64) as u32).collect();
    let input_ids = Tensor::from_vec(ids, (batch, text_len), &Device::Cpu).unwrap();
    (vision, input_ids)
}

fn dataset_file(n: usize) -> NamedTempFile {
    let records: Vec<serde_json::Value> = (0..n)
        .map(|i| {
            serde_json::json!({
                "id": format!("sample_{i}"),
                "image_path": format!("images/{i}.jpg"),
                "image_name": format!("{i}.jpg"),
                "category": if i % 2 == 0 { "existence" } else { "count" },
                "question": format!("Is object {i} present?"),
                "answer": "yes"
            })
        })
        .collect();
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(serde_json::to_string(&records).unwrap().as_bytes())
        .unwrap();
    file
}

/// Removing hooks restores the model's baseline behavior exactly
#[test]
fn test_hook_lifecycle_restores_baseline() {
    let cfg = MockVlmConfig::default();
    let text_len = 6;
    let mut model = MockVlm::new(cfg.clone(), &Device::Cpu).unwrap();
    let (vision, input_ids) = mock_inputs(1, cfg.vision_len, cfg.vision_feat_dim, text_len);

    let baseline = model.forward(&vision, &input_ids).unwrap();

    let mut modifier = AttentionModifier::new(AttentionPolicy {
        vision_sparsity_ratio: 0.5,
        ..AttentionPolicy::default()
    })
    .unwrap();
    modifier
        .run_with_hooks(&mut model, cfg.vision_len, text_len, None, |m| {
            m.forward(&vision, &input_ids)
        })
        .unwrap();

    // After removal the same inputs reproduce the baseline attention
    let after = model.forward(&vision, &input_ids).unwrap();
    for (before, after) in baseline
        .attention_weights
        .iter()
        .zip(&after.attention_weights)
    {
        let b: Vec<f32> = before.flatten_all().unwrap().to_vec1().unwrap();
        let a: Vec<f32> = after.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(b.len(), a.len());
        for (x, y) in b.iter().zip(&a) {
            assert!((x - y).abs() < 1e-6);
        }
    }
}

/// End-to-end modification: sparsity rises and the change is measurable
#[test]
fn test_modification_end_to_end() {
    let cfg = MockVlmConfig {
        vision_len: 4,
        ..MockVlmConfig::default()
    };
    let text_len = 6;
    let mut model = MockVlm::new(cfg.clone(), &Device::Cpu).unwrap();
    let (vision, input_ids) = mock_inputs(1, cfg.vision_len, cfg.vision_feat_dim, text_len);

    let mut modifier = AttentionModifier::new(AttentionPolicy {
        vision_sparsity_ratio: 0.5,
        sparsify_method: SparsifyMethod::TopK,
        ..AttentionPolicy::default()
    })
    .unwrap();

    modifier
        .run_with_hooks(&mut model, cfg.vision_len, text_len, None, |m| {
            m.forward(&vision, &input_ids)
        })
        .unwrap();

    let analysis = modifier.get_attention_analysis().unwrap();
    assert_eq!(analysis.len(), cfg.num_layers);
    for (layer, stats) in &analysis {
        assert!(
            stats.modified_sparsity.unwrap() >= stats.attention_sparsity,
            "sparsity should not decrease on {layer}"
        );
        let change = stats.attention_change.unwrap();
        assert!(change.is_finite() && change >= 0.0, "bad change on {layer}");
        assert!(stats.modified_entropy.unwrap().is_finite());
    }

    // Snapshots expose the raw before/after tensors too
    let layers = modifier.snapshot_layers();
    assert_eq!(layers.len(), cfg.num_layers);
    let snapshot = modifier.snapshot(&layers[0]).unwrap();
    let total = cfg.vision_len + text_len;
    assert_eq!(snapshot.original.dims(), &[1, cfg.num_heads, total, total]);
    assert_eq!(
        snapshot.modified.unwrap().dims(),
        &[1, cfg.num_heads, total, total]
    );
}

/// A hookable model defined entirely outside the library, minting its own
/// handles from local bookkeeping
struct CustomVlmWrapper {
    hooks: Vec<(HookHandle, ForwardHook)>,
    next_id: usize,
}

impl HookableModel for CustomVlmWrapper {
    fn attention_layer_names(&self) -> Vec<String> {
        vec!["encoder.attention.0".to_string()]
    }

    fn register_forward_hook(&mut self, layer: &str, hook: ForwardHook) -> Result<HookHandle> {
        let handle = HookHandle::new(layer, self.next_id);
        self.next_id += 1;
        self.hooks.push((handle.clone(), hook));
        Ok(handle)
    }

    fn remove_forward_hook(&mut self, handle: &HookHandle) {
        self.hooks.retain(|(h, _)| h != handle);
    }
}

/// The hook capability can be implemented for a downstream model type
#[test]
fn test_hookable_model_implemented_downstream() {
    let mut model = CustomVlmWrapper {
        hooks: Vec::new(),
        next_id: 0,
    };
    let mut modifier = AttentionModifier::new(AttentionPolicy::default()).unwrap();

    modifier.register_hooks(&mut model, 2, 2, None).unwrap();
    assert_eq!(modifier.n_hooks(), 1);
    assert_eq!(model.hooks[0].0.layer(), "encoder.attention.0");
    assert_eq!(model.hooks[0].0.id(), 0);

    modifier.remove_hooks(&mut model);
    assert!(model.hooks.is_empty());
}

/// Wrapper that fails generation for selected sample questions
struct FlakyModel {
    inner: MockVlm,
    calls: usize,
    fail_on_call: usize,
}

impl GenerativeModel for FlakyModel {
    fn generate(
        &mut self,
        image_path: &str,
        question: &str,
        max_new_tokens: usize,
    ) -> Result<GenerationOutput> {
        self.calls += 1;
        if self.calls == self.fail_on_call {
            anyhow::bail!("Simulated generation failure");
        }
        self.inner.generate(image_path, question, max_new_tokens)
    }
}

/// A failing sample is skipped; the rest of the run completes
#[test]
fn test_recorder_skips_failed_samples() {
    let file = dataset_file(3);
    let dataset = BenchmarkDataset::load(file.path()).unwrap();

    let mut model = FlakyModel {
        inner: MockVlm::new(MockVlmConfig::default(), &Device::Cpu).unwrap(),
        calls: 0,
        fail_on_call: 2,
    };

    let dir = tempfile::tempdir().unwrap();
    let recorder = GenerationRecorder::new(RecorderConfig {
        max_new_tokens: 4,
        top_k: 2,
        log_base: LogBase::Nats,
        output_dir: dir.path().to_path_buf(),
    })
    .unwrap();
    let report = recorder.run(&mut model, &dataset, &RawTokenDecoder).unwrap();

    assert_eq!(report.summaries.len(), 2);
    assert_eq!(report.failed_samples, 1);
    let ids: Vec<&str> = report
        .summaries
        .iter()
        .map(|s| s.sample_id.as_str())
        .collect();
    assert_eq!(ids, vec!["sample_0", "sample_2"]);

    // Both CSV files reflect the surviving samples only
    let results = std::fs::read_to_string(&report.results_path).unwrap();
    assert_eq!(results.lines().count(), 3);
    let details = std::fs::read_to_string(&report.step_details_path).unwrap();
    assert_eq!(details.lines().count(), 1 + 2 * 4);
}

/// Dataset filtering feeds through the recording pipeline
#[test]
fn test_recorder_with_category_filter() {
    let file = dataset_file(4);
    let dataset = BenchmarkDataset::load(file.path())
        .unwrap()
        .with_categories(&["count".to_string()]);
    assert_eq!(dataset.len(), 2);

    let mut model = MockVlm::new(MockVlmConfig::default(), &Device::Cpu).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let recorder = GenerationRecorder::new(RecorderConfig {
        max_new_tokens: 3,
        top_k: 2,
        log_base: LogBase::Bits,
        output_dir: dir.path().to_path_buf(),
    })
    .unwrap();
    let report = recorder.run(&mut model, &dataset, &RawTokenDecoder).unwrap();

    assert_eq!(report.summaries.len(), 2);
    assert!(report
        .summaries
        .iter()
        .all(|s| s.category == "count" && s.avg_entropy >= 0.0));
}

/// Generation on the mock model is deterministic per question
#[test]
fn test_generation_determinism_across_runs() {
    let cfg = MockVlmConfig::default();
    let mut model = MockVlm::new(cfg, &Device::Cpu).unwrap();

    let first = model.generate("img.jpg", "Is there a cat?", 5).unwrap();
    let second = model.generate("img.jpg", "Is there a cat?", 5).unwrap();
    assert_eq!(first.step_scores.len(), 5);

    for (a, b) in first.step_scores.iter().zip(&second.step_scores) {
        let av: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        let bv: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(av, bv);
    }
}
