//! Model capabilities and a mock vision-language model
//!
//! The toolkit never owns a pretrained VLM. It consumes two capabilities:
//!
//! - [`HookableModel`]: attention submodules discoverable by name, with
//!   forward-hook interception on their outputs
//! - [`GenerativeModel`]: generation that returns per-step score tensors
//!
//! [`MockVlm`] is a small self-contained stand-in with real softmax
//! attention, used by the CLI's mock mode and throughout the tests. It
//! mirrors the mock model the original experiments ship for running the
//! pipeline without GPU weights.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{embedding, linear, Embedding, Linear, Module, VarBuilder, VarMap};
use rand::{Rng, SeedableRng};

/// Output of one attention submodule's forward pass
///
/// Covers both styles of attention exposure: a `(hidden_states,
/// attention_weights)` pair and hidden states alone (weights unavailable).
#[derive(Debug)]
pub struct AttentionOutput {
    /// Hidden states produced by the layer, `[batch, seq, hidden]`
    pub hidden_states: Tensor,
    /// Post-softmax attention weights `[batch, heads, seq, seq]`, if the
    /// layer exposes them
    pub attention_weights: Option<Tensor>,
}

/// Interception callback applied to an attention layer's output
pub type ForwardHook = Box<dyn FnMut(AttentionOutput) -> Result<AttentionOutput>>;

/// Handle returned by [`HookableModel::register_forward_hook`]
///
/// Identifies one installed hook; release it with
/// [`HookableModel::remove_forward_hook`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HookHandle {
    layer: String,
    id: usize,
}

impl HookHandle {
    /// Create a handle for the given layer and registration id
    ///
    /// Implementors of [`HookableModel`] mint handles from their own hook
    /// bookkeeping; the `(layer, id)` pair must uniquely identify one
    /// installed hook.
    pub fn new(layer: impl Into<String>, id: usize) -> Self {
        Self {
            layer: layer.into(),
            id,
        }
    }

    /// Name of the hooked layer
    pub fn layer(&self) -> &str {
        &self.layer
    }

    /// Registration id within the model's hook bookkeeping
    pub fn id(&self) -> usize {
        self.id
    }
}

/// A model whose attention submodules can be discovered and intercepted
pub trait HookableModel {
    /// Names of all attention submodules, in forward order
    fn attention_layer_names(&self) -> Vec<String>;

    /// Install a forward hook on the named layer
    ///
    /// Hooks run in registration order on every forward pass; each receives
    /// the (possibly already rewritten) layer output and returns the output
    /// to propagate.
    fn register_forward_hook(&mut self, layer: &str, hook: ForwardHook) -> Result<HookHandle>;

    /// Remove a previously installed hook; unknown handles are ignored
    fn remove_forward_hook(&mut self, handle: &HookHandle);
}

/// Result of a generation call
#[derive(Debug)]
pub struct GenerationOutput {
    /// Decoded generated text
    pub text: String,
    /// One logits tensor per decoding step, each `[batch, vocab]`
    pub step_scores: Vec<Tensor>,
}

/// A model that can generate text with per-step scores
pub trait GenerativeModel {
    fn generate(
        &mut self,
        image_path: &str,
        question: &str,
        max_new_tokens: usize,
    ) -> Result<GenerationOutput>;
}

/// Configuration for [`MockVlm`]
#[derive(Debug, Clone)]
pub struct MockVlmConfig {
    pub hidden_dim: usize,
    pub num_heads: usize,
    pub num_layers: usize,
    pub vocab_size: usize,
    pub vision_feat_dim: usize,
    pub vision_len: usize,
    pub seed: u64,
}

impl Default for MockVlmConfig {
    fn default() -> Self {
        Self {
            hidden_dim: 64,
            num_heads: 4,
            num_layers: 2,
            vocab_size: 512,
            vision_feat_dim: 32,
            vision_len: 8,
            seed: 42,
        }
    }
}

/// One self-attention block of the mock model
struct MockAttentionLayer {
    name: String,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    head_dim: usize,
}

impl MockAttentionLayer {
    /// Forward pass returning `(hidden_states, attention_weights)`
    fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&scores)?;

        let attn_output = attn_weights
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, seq_len, ()))?;
        let attn_output = self.o_proj.forward(&attn_output)?;

        // Residual connection keeps activations in a sane range
        let hidden = (x + attn_output)?;
        Ok((hidden, attn_weights))
    }
}

/// Full forward output of the mock model
#[derive(Debug)]
pub struct MockForwardOutput {
    /// `[batch, seq, vocab]`
    pub logits: Tensor,
    /// `[batch, seq, hidden]`
    pub hidden_states: Tensor,
    /// Attention weights per layer, as seen after any installed hooks
    pub attention_weights: Vec<Tensor>,
}

/// Small vision-language model double with hookable attention
///
/// Vision features pass through a linear projector, text ids through an
/// embedding table; the concatenated sequence runs through `num_layers`
/// self-attention blocks and an output head. Weights are randomly
/// initialized, so outputs are meaningless but shapes and attention
/// structure are real.
pub struct MockVlm {
    cfg: MockVlmConfig,
    device: Device,
    vision_proj: Linear,
    token_embed: Embedding,
    layers: Vec<MockAttentionLayer>,
    output_proj: Linear,
    hooks: HashMap<String, Vec<(usize, ForwardHook)>>,
    next_hook_id: usize,
    response: String,
    _varmap: VarMap,
}

impl MockVlm {
    /// Build a mock model on the given device
    pub fn new(cfg: MockVlmConfig, device: &Device) -> Result<Self> {
        if cfg.hidden_dim % cfg.num_heads != 0 {
            anyhow::bail!(
                "hidden_dim {} not divisible by num_heads {}",
                cfg.hidden_dim,
                cfg.num_heads
            );
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let vision_proj = linear(cfg.vision_feat_dim, cfg.hidden_dim, vb.pp("vision_proj"))?;
        let token_embed = embedding(cfg.vocab_size, cfg.hidden_dim, vb.pp("token_embed"))?;

        let head_dim = cfg.hidden_dim / cfg.num_heads;
        let mut layers = Vec::with_capacity(cfg.num_layers);
        for i in 0..cfg.num_layers {
            let name = format!("layers.{i}.attn");
            let lvb = vb.pp(&name);
            layers.push(MockAttentionLayer {
                name,
                q_proj: linear(cfg.hidden_dim, cfg.hidden_dim, lvb.pp("q_proj"))?,
                k_proj: linear(cfg.hidden_dim, cfg.hidden_dim, lvb.pp("k_proj"))?,
                v_proj: linear(cfg.hidden_dim, cfg.hidden_dim, lvb.pp("v_proj"))?,
                o_proj: linear(cfg.hidden_dim, cfg.hidden_dim, lvb.pp("o_proj"))?,
                num_heads: cfg.num_heads,
                head_dim,
            });
        }

        let output_proj = linear(cfg.hidden_dim, cfg.vocab_size, vb.pp("output_proj"))?;

        Ok(Self {
            cfg,
            device: device.clone(),
            vision_proj,
            token_embed,
            layers,
            output_proj,
            hooks: HashMap::new(),
            next_hook_id: 0,
            response: "a photo of an object".to_string(),
            _varmap: varmap,
        })
    }

    /// Override the canned generation response
    pub fn with_response(mut self, text: &str) -> Self {
        self.response = text.to_string();
        self
    }

    /// Number of attention layers
    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Number of attention heads per layer
    pub fn num_heads(&self) -> usize {
        self.cfg.num_heads
    }

    /// Configured vision segment length used by [`GenerativeModel::generate`]
    pub fn vision_len(&self) -> usize {
        self.cfg.vision_len
    }

    pub fn vocab_size(&self) -> usize {
        self.cfg.vocab_size
    }

    /// Forward pass over vision features `[batch, V, feat]` and token ids
    /// `[batch, T]`, running installed hooks on each attention layer output
    pub fn forward(
        &mut self,
        vision_features: &Tensor,
        input_ids: &Tensor,
    ) -> Result<MockForwardOutput> {
        let vision = self.vision_proj.forward(vision_features)?;
        let text = self.token_embed.forward(input_ids)?;
        let mut hidden = Tensor::cat(&[&vision, &text], 1)?;

        let layers = &self.layers;
        let hooks = &mut self.hooks;
        let mut attention_weights = Vec::with_capacity(layers.len());

        for layer in layers {
            let (new_hidden, weights) = layer.forward(&hidden)?;
            let mut out = AttentionOutput {
                hidden_states: new_hidden,
                attention_weights: Some(weights),
            };
            if let Some(entries) = hooks.get_mut(&layer.name) {
                for (_, hook) in entries.iter_mut() {
                    out = hook(out)?;
                }
            }
            hidden = out.hidden_states;
            if let Some(w) = out.attention_weights {
                attention_weights.push(w);
            }
        }

        let logits = self.output_proj.forward(&hidden)?;
        Ok(MockForwardOutput {
            logits,
            hidden_states: hidden,
            attention_weights,
        })
    }

    /// Deterministic pseudo-inputs for a question string
    fn mock_inputs(&self, question: &str, rng: &mut rand::rngs::StdRng) -> Result<(Tensor, Tensor)> {
        let v = self.cfg.vision_len;
        let feat = self.cfg.vision_feat_dim;
        let vision: Vec<f32> = (0..v * feat).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect();
        let vision = Tensor::from_vec(vision, (1, v, feat), &self.device)?;

        let mut ids: Vec<u32> = question
            .bytes()
            .take(32)
            .map(|b| u32::from(b) % self.cfg.vocab_size as u32)
            .collect();
        if ids.is_empty() {
            ids.push(0);
        }
        let text_len = ids.len();
        let input_ids = Tensor::from_vec(ids, (1, text_len), &self.device)?;
        Ok((vision, input_ids))
    }
}

impl HookableModel for MockVlm {
    fn attention_layer_names(&self) -> Vec<String> {
        self.layers.iter().map(|l| l.name.clone()).collect()
    }

    fn register_forward_hook(&mut self, layer: &str, hook: ForwardHook) -> Result<HookHandle> {
        if !self.layers.iter().any(|l| l.name == layer) {
            anyhow::bail!("No attention layer named {layer}");
        }
        let id = self.next_hook_id;
        self.next_hook_id += 1;
        self.hooks.entry(layer.to_string()).or_default().push((id, hook));
        Ok(HookHandle::new(layer, id))
    }

    fn remove_forward_hook(&mut self, handle: &HookHandle) {
        if let Some(entries) = self.hooks.get_mut(&handle.layer) {
            entries.retain(|(id, _)| *id != handle.id);
        }
    }
}

impl GenerativeModel for MockVlm {
    /// Deterministic per-question generation: the same question yields the
    /// same step scores, so analysis results are reproducible in tests
    fn generate(
        &mut self,
        _image_path: &str,
        question: &str,
        max_new_tokens: usize,
    ) -> Result<GenerationOutput> {
        let mut hasher = DefaultHasher::new();
        question.hash(&mut hasher);
        let mut rng = rand::rngs::StdRng::seed_from_u64(hasher.finish() ^ self.cfg.seed);

        let (vision, input_ids) = self.mock_inputs(question, &mut rng)?;
        let _ = self.forward(&vision, &input_ids)?;

        let vocab = self.cfg.vocab_size;
        let mut step_scores = Vec::with_capacity(max_new_tokens);
        for _ in 0..max_new_tokens {
            let logits: Vec<f32> = (0..vocab).map(|_| rng.gen::<f32>() * 4.0 - 2.0).collect();
            step_scores.push(Tensor::from_vec(logits, (1, vocab), &self.device)?);
        }

        Ok(GenerationOutput {
            text: self.response.clone(),
            step_scores,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_inputs(model: &MockVlm, text_len: usize) -> (Tensor, Tensor) {
        let cfg = &model.cfg;
        let vision = Tensor::zeros(
            (1, cfg.vision_len, cfg.vision_feat_dim),
            DType::F32,
            &Device::Cpu,
        )
        .unwrap();
        let ids: Vec<u32> = (0..text_len as u32).collect();
        let input_ids = Tensor::from_vec(ids, (1, text_len), &Device::Cpu).unwrap();
        (vision, input_ids)
    }

    #[test]
    fn test_forward_shapes() {
        let cfg = MockVlmConfig::default();
        let mut model = MockVlm::new(cfg.clone(), &Device::Cpu).unwrap();
        let (vision, ids) = test_inputs(&model, 6);
        let out = model.forward(&vision, &ids).unwrap();

        let total = cfg.vision_len + 6;
        assert_eq!(out.logits.dims(), &[1, total, cfg.vocab_size]);
        assert_eq!(out.hidden_states.dims(), &[1, total, cfg.hidden_dim]);
        assert_eq!(out.attention_weights.len(), cfg.num_layers);
        assert_eq!(
            out.attention_weights[0].dims(),
            &[1, cfg.num_heads, total, total]
        );
    }

    #[test]
    fn test_attention_rows_sum_to_one() {
        let mut model = MockVlm::new(MockVlmConfig::default(), &Device::Cpu).unwrap();
        let (vision, ids) = test_inputs(&model, 4);
        let out = model.forward(&vision, &ids).unwrap();

        let attn = &out.attention_weights[0];
        let row_len = attn.dims()[3];
        let flat: Vec<f32> = attn.flatten_all().unwrap().to_vec1().unwrap();
        for row in flat.chunks(row_len) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_hooks_rewrite_recorded_weights() {
        let mut model = MockVlm::new(MockVlmConfig::default(), &Device::Cpu).unwrap();
        let layer = model.attention_layer_names()[0].clone();

        let handle = model
            .register_forward_hook(
                &layer,
                Box::new(|mut out| {
                    if let Some(w) = out.attention_weights.take() {
                        out.attention_weights = Some(w.zeros_like()?);
                    }
                    Ok(out)
                }),
            )
            .unwrap();

        let (vision, ids) = test_inputs(&model, 4);
        let out = model.forward(&vision, &ids).unwrap();
        let flat: Vec<f32> = out.attention_weights[0]
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(flat.iter().all(|&x| x == 0.0));

        model.remove_forward_hook(&handle);
        let out = model.forward(&vision, &ids).unwrap();
        let flat: Vec<f32> = out.attention_weights[0]
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(flat.iter().any(|&x| x != 0.0));
    }

    #[test]
    fn test_register_unknown_layer_fails() {
        let mut model = MockVlm::new(MockVlmConfig::default(), &Device::Cpu).unwrap();
        let result = model.register_forward_hook("layers.99.attn", Box::new(|out| Ok(out)));
        assert!(result.is_err());
    }

    #[test]
    fn test_generate_is_deterministic_per_question() {
        let mut model = MockVlm::new(MockVlmConfig::default(), &Device::Cpu).unwrap();
        let a = model.generate("img.png", "Is there a cat?", 3).unwrap();
        let b = model.generate("img.png", "Is there a cat?", 3).unwrap();

        assert_eq!(a.step_scores.len(), 3);
        let va: Vec<f32> = a.step_scores[0].flatten_all().unwrap().to_vec1().unwrap();
        let vb: Vec<f32> = b.step_scores[0].flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(va, vb);
    }
}
