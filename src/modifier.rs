//! Runtime attention interception and rewriting
//!
//! [`AttentionModifier`] installs forward hooks on a model's attention
//! submodules and rewrites the intercepted weight tensors according to an
//! [`AttentionPolicy`]: the vision→vision quadrant is sparsified and
//! symmetrized, the text→text quadrant is re-masked causally, cross-modal
//! quadrants pass through, and the reassembled tensor is multiplied by the
//! modality mask. Original and modified tensors are snapshotted per layer
//! for before/after analysis.
//!
//! The modality-mask multiply runs after the per-quadrant softmaxes and is
//! deliberately not followed by a renormalization, so rows touched by the
//! mask can sum to less than 1. Entropy and sparsity statistics read the
//! tensor as-is.
//!
//! Single-threaded by contract: snapshots are written by hook callbacks
//! during a forward pass and read afterwards on the same thread. Use one
//! modifier per concurrent forward pass if this is ever parallelized.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::rc::Rc;

use anyhow::Result;
use candle_core::Tensor;
use serde::Serialize;
use tracing::{debug, info};

use crate::masks::{create_modality_mask, CrossAttentionType};
use crate::model::{AttentionOutput, HookHandle, HookableModel};
use crate::transforms::{
    apply_causal, attention_change, attention_entropy, attention_sparsity, sparsify, symmetrize,
    SparsifyMethod, DEFAULT_SPARSITY_THRESHOLD,
};

/// Intra-segment attention style for the vision block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VisionAttentionType {
    /// Symmetrized bidirectional attention
    #[default]
    Symmetric,
}

/// Intra-segment attention style for the text block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextAttentionType {
    /// Lower-triangular causal attention
    #[default]
    Causal,
}

/// Immutable per-experiment attention-modification policy
#[derive(Debug, Clone, Copy)]
pub struct AttentionPolicy {
    /// Fraction of vision→vision weights to keep, in `[0, 1]`;
    /// `1.0` disables sparsification
    pub vision_sparsity_ratio: f32,
    pub vision_attention_type: VisionAttentionType,
    pub text_attention_type: TextAttentionType,
    pub cross_attention_type: CrossAttentionType,
    /// Weight-selection strategy for the sparsification step
    pub sparsify_method: SparsifyMethod,
}

impl Default for AttentionPolicy {
    fn default() -> Self {
        Self {
            vision_sparsity_ratio: 0.1,
            vision_attention_type: VisionAttentionType::Symmetric,
            text_attention_type: TextAttentionType::Causal,
            cross_attention_type: CrossAttentionType::Bidirectional,
            sparsify_method: SparsifyMethod::TopK,
        }
    }
}

impl AttentionPolicy {
    /// Validate field ranges; ratio outside `[0, 1]` is a contract error
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.vision_sparsity_ratio) {
            anyhow::bail!(
                "vision_sparsity_ratio must be in [0, 1], got {}",
                self.vision_sparsity_ratio
            );
        }
        Ok(())
    }
}

/// Before/after attention tensors for one hooked layer
///
/// Overwritten on every forward pass; no history is retained.
#[derive(Debug, Clone)]
pub struct AttentionSnapshot {
    /// Attention weights as produced by the model
    pub original: Tensor,
    /// Attention weights as returned to the computation, when a
    /// modification ran
    pub modified: Option<Tensor>,
}

/// Entropy/sparsity summary for one layer's snapshot
#[derive(Debug, Clone, Serialize)]
pub struct LayerAttentionStats {
    pub attention_entropy: f32,
    pub attention_sparsity: f32,
    pub modified_entropy: Option<f32>,
    pub modified_sparsity: Option<f32>,
    /// L2 distance between original and modified tensors
    pub attention_change: Option<f32>,
}

type SnapshotMap = Rc<RefCell<BTreeMap<String, AttentionSnapshot>>>;

/// Intercepts and rewrites attention at inference time
///
/// Lifecycle: `Idle` → [`register_hooks`](Self::register_hooks) → `Active`
/// (snapshots accumulate per forward pass) →
/// [`remove_hooks`](Self::remove_hooks) → `Idle`. There is no guard against
/// double registration; calling `register_hooks` twice without removal
/// installs duplicate hooks. Prefer [`run_with_hooks`](Self::run_with_hooks),
/// which pairs the two on every exit path.
pub struct AttentionModifier {
    policy: AttentionPolicy,
    hooks: Vec<HookHandle>,
    snapshots: SnapshotMap,
}

impl AttentionModifier {
    /// Create a modifier for the given policy
    pub fn new(policy: AttentionPolicy) -> Result<Self> {
        policy.validate()?;
        Ok(Self {
            policy,
            hooks: Vec::new(),
            snapshots: Rc::new(RefCell::new(BTreeMap::new())),
        })
    }

    /// The active policy
    pub fn policy(&self) -> &AttentionPolicy {
        &self.policy
    }

    /// Number of currently installed hooks
    pub fn n_hooks(&self) -> usize {
        self.hooks.len()
    }

    /// Install interception hooks on every matching attention layer
    ///
    /// Layers are matched by case-insensitive substring (`"attention"` or
    /// `"attn"`) against the model's submodule names, then filtered by
    /// `target_layers` (substring match) when provided. The segment lengths
    /// are captured per registration and checked against each intercepted
    /// tensor's trailing dimension.
    ///
    /// All-or-nothing: if any registration fails, hooks installed on
    /// earlier layers are released before the error is returned.
    pub fn register_hooks<M: HookableModel + ?Sized>(
        &mut self,
        model: &mut M,
        vision_len: usize,
        text_len: usize,
        target_layers: Option<&[String]>,
    ) -> Result<()> {
        for name in model.attention_layer_names() {
            let lower = name.to_lowercase();
            if !lower.contains("attention") && !lower.contains("attn") {
                continue;
            }
            if let Some(targets) = target_layers {
                if !targets.iter().any(|t| name.contains(t.as_str())) {
                    continue;
                }
            }

            let policy = self.policy;
            let snapshots = Rc::clone(&self.snapshots);
            let layer = name.clone();
            let hook = Box::new(move |output: AttentionOutput| {
                modify_attention_output(&policy, &snapshots, &layer, output, vision_len, text_len)
            });

            let handle = match model.register_forward_hook(&name, hook) {
                Ok(handle) => handle,
                Err(err) => {
                    self.remove_hooks(model);
                    return Err(err);
                }
            };
            info!("Registered hook on layer: {name}");
            self.hooks.push(handle);
        }
        Ok(())
    }

    /// Release every installed hook; safe to call when already idle
    pub fn remove_hooks<M: HookableModel + ?Sized>(&mut self, model: &mut M) {
        for handle in self.hooks.drain(..) {
            model.remove_forward_hook(&handle);
        }
        debug!("All hooks removed");
    }

    /// Scoped acquisition: register hooks, run `f`, remove hooks
    ///
    /// Hooks are released whether `f` succeeds or fails, so an erroring
    /// forward pass cannot leak an instrumented model back to the caller.
    pub fn run_with_hooks<M, R>(
        &mut self,
        model: &mut M,
        vision_len: usize,
        text_len: usize,
        target_layers: Option<&[String]>,
        f: impl FnOnce(&mut M) -> Result<R>,
    ) -> Result<R>
    where
        M: HookableModel + ?Sized,
    {
        self.register_hooks(model, vision_len, text_len, target_layers)?;
        let result = f(model);
        self.remove_hooks(model);
        result
    }

    /// Snapshot of the named layer's last forward pass, if any
    pub fn snapshot(&self, layer: &str) -> Option<AttentionSnapshot> {
        self.snapshots.borrow().get(layer).cloned()
    }

    /// Names of layers with a recorded snapshot
    pub fn snapshot_layers(&self) -> Vec<String> {
        self.snapshots.borrow().keys().cloned().collect()
    }

    /// Drop all recorded snapshots
    pub fn clear_snapshots(&mut self) {
        self.snapshots.borrow_mut().clear();
    }

    /// Per-layer entropy/sparsity analysis of the recorded snapshots
    ///
    /// Pure read; statistics are computed over the tensors exactly as
    /// stored (sub-stochastic rows included).
    pub fn get_attention_analysis(&self) -> Result<BTreeMap<String, LayerAttentionStats>> {
        let mut analysis = BTreeMap::new();
        for (layer, snapshot) in self.snapshots.borrow().iter() {
            let mut stats = LayerAttentionStats {
                attention_entropy: attention_entropy(&snapshot.original)?,
                attention_sparsity: attention_sparsity(
                    &snapshot.original,
                    DEFAULT_SPARSITY_THRESHOLD,
                )?,
                modified_entropy: None,
                modified_sparsity: None,
                attention_change: None,
            };
            if let Some(modified) = &snapshot.modified {
                stats.modified_entropy = Some(attention_entropy(modified)?);
                stats.modified_sparsity =
                    Some(attention_sparsity(modified, DEFAULT_SPARSITY_THRESHOLD)?);
                stats.attention_change = Some(attention_change(&snapshot.original, modified)?);
            }
            analysis.insert(layer.clone(), stats);
        }
        Ok(analysis)
    }
}

/// The interception body applied to one hooked layer's output
///
/// Passes through untouched when no attention weights are obtainable.
/// A segment-length mismatch against the observed tensor is a contract
/// error and propagates out of the forward pass.
fn modify_attention_output(
    policy: &AttentionPolicy,
    snapshots: &SnapshotMap,
    layer: &str,
    output: AttentionOutput,
    vision_len: usize,
    text_len: usize,
) -> Result<AttentionOutput> {
    let Some(weights) = output.attention_weights else {
        debug!("Layer {layer}: no attention weights, passing through");
        return Ok(output);
    };

    let (batch, heads, q_len, k_len) = weights.dims4()?;
    if vision_len + text_len != k_len || q_len != k_len {
        anyhow::bail!(
            "Segment lengths ({vision_len} vision + {text_len} text) do not match \
             attention shape [{batch}, {heads}, {q_len}, {k_len}] on layer {layer}"
        );
    }

    snapshots.borrow_mut().insert(
        layer.to_string(),
        AttentionSnapshot {
            original: weights.clone(),
            modified: None,
        },
    );

    let mask = create_modality_mask(
        vision_len,
        text_len,
        batch,
        heads,
        policy.cross_attention_type,
        weights.device(),
        weights.dtype(),
    )?;

    let modified = rebuild_attention(policy, &weights, vision_len, text_len)?;
    let modified = modified.broadcast_mul(&mask)?;

    if let Some(snapshot) = snapshots.borrow_mut().get_mut(layer) {
        snapshot.modified = Some(modified.clone());
    }

    Ok(AttentionOutput {
        hidden_states: output.hidden_states,
        attention_weights: Some(modified),
    })
}

/// Split into modality quadrants, transform, and reassemble
///
/// vision→vision is sparsified then symmetrized; text→text is re-masked
/// causally; cross quadrants pass through unmodified.
fn rebuild_attention(
    policy: &AttentionPolicy,
    weights: &Tensor,
    vision_len: usize,
    text_len: usize,
) -> Result<Tensor> {
    // Degenerate segments: only one quadrant exists
    if vision_len == 0 {
        return apply_causal(weights);
    }
    if text_len == 0 {
        let vision = if policy.vision_sparsity_ratio < 1.0 {
            sparsify(weights, policy.vision_sparsity_ratio, policy.sparsify_method)?
        } else {
            weights.clone()
        };
        return symmetrize(&vision);
    }

    let v2v = weights
        .narrow(2, 0, vision_len)?
        .narrow(3, 0, vision_len)?
        .contiguous()?;
    let t2t = weights
        .narrow(2, vision_len, text_len)?
        .narrow(3, vision_len, text_len)?
        .contiguous()?;
    let v2t = weights
        .narrow(2, 0, vision_len)?
        .narrow(3, vision_len, text_len)?
        .contiguous()?;
    let t2v = weights
        .narrow(2, vision_len, text_len)?
        .narrow(3, 0, vision_len)?
        .contiguous()?;

    let v2v = if policy.vision_sparsity_ratio < 1.0 {
        sparsify(&v2v, policy.vision_sparsity_ratio, policy.sparsify_method)?
    } else {
        v2v
    };
    let v2v = symmetrize(&v2v)?;
    let t2t = apply_causal(&t2t)?;

    let top = Tensor::cat(&[&v2v, &v2t], 3)?;
    let bottom = Tensor::cat(&[&t2v, &t2t], 3)?;
    Ok(Tensor::cat(&[&top, &bottom], 2)?)
}
