//! Vision-text embedding fusion
//!
//! [`EmbeddingFuser`] combines a vision embedding sequence `[batch, V, h]`
//! with a text embedding sequence `[batch, T, h]` into a fused sequence of
//! feature width `fusion_dim`. Four strategies are provided:
//!
//! - `concat`: concatenate along the sequence axis, then project
//! - `add`: element-wise sum over the overlapping prefix, then project
//! - `gated`: per-pair sigmoid gate blending each vision/text pair
//! - `attention`: multi-head cross-attention with vision as query
//!
//! Projection weights are freshly initialized per fuser; this module studies
//! fusion geometry, not pretrained alignment.

use std::str::FromStr;

use anyhow::Result;
use candle_core::{DType, Device, Tensor, D};
use candle_nn::ops::{sigmoid, softmax_last_dim};
use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};

/// Strategy for combining vision and text embeddings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FusionMethod {
    /// Sequence-axis concatenation followed by projection
    #[default]
    Concat,
    /// Element-wise addition over the shared prefix
    Add,
    /// Pairwise sigmoid-gated blend
    Gated,
    /// Cross-attention, vision queries over text keys/values
    Attention,
}

impl FromStr for FusionMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "concat" => Ok(Self::Concat),
            "add" => Ok(Self::Add),
            "gated" => Ok(Self::Gated),
            "attention" => Ok(Self::Attention),
            other => anyhow::bail!("Unknown fusion method: {other}"),
        }
    }
}

/// Learnable projections shared by all fusion strategies
struct FusionLayers {
    /// hidden → fusion output projection
    output_proj: Linear,
    /// 2·hidden → 1 gate scorer, gated fusion only
    gate: Linear,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
}

/// Combines vision and text embedding sequences
pub struct EmbeddingFuser {
    method: FusionMethod,
    hidden_dim: usize,
    fusion_dim: usize,
    num_heads: usize,
    layers: FusionLayers,
    #[allow(dead_code)]
    varmap: VarMap,
}

impl EmbeddingFuser {
    /// Create a fuser with freshly initialized projection weights
    ///
    /// `hidden_dim` must be divisible by `num_heads` for the attention
    /// strategy; validated up front so every method shares one contract.
    pub fn new(
        method: FusionMethod,
        hidden_dim: usize,
        fusion_dim: usize,
        num_heads: usize,
        device: &Device,
    ) -> Result<Self> {
        if hidden_dim == 0 || fusion_dim == 0 {
            anyhow::bail!("hidden_dim and fusion_dim must be nonzero");
        }
        if num_heads == 0 || hidden_dim % num_heads != 0 {
            anyhow::bail!(
                "hidden_dim {hidden_dim} must be divisible by num_heads {num_heads}"
            );
        }

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let layers = FusionLayers {
            output_proj: linear(hidden_dim, fusion_dim, vb.pp("output_proj"))?,
            gate: linear(2 * hidden_dim, 1, vb.pp("gate"))?,
            q_proj: linear(hidden_dim, hidden_dim, vb.pp("q_proj"))?,
            k_proj: linear(hidden_dim, hidden_dim, vb.pp("k_proj"))?,
            v_proj: linear(hidden_dim, hidden_dim, vb.pp("v_proj"))?,
            o_proj: linear(hidden_dim, hidden_dim, vb.pp("o_proj"))?,
        };

        Ok(Self {
            method,
            hidden_dim,
            fusion_dim,
            num_heads,
            layers,
            varmap,
        })
    }

    pub fn method(&self) -> FusionMethod {
        self.method
    }

    pub fn fusion_dim(&self) -> usize {
        self.fusion_dim
    }

    /// Fuse a vision sequence `[batch, V, h]` with a text sequence
    /// `[batch, T, h]`
    ///
    /// Output shape depends on the strategy: `[batch, V+T, fusion]` for
    /// concat and attention, `[batch, min(V,T), fusion]` for add, and
    /// `[batch, V·T, fusion]` for gated.
    pub fn fuse(&self, vision: &Tensor, text: &Tensor) -> Result<Tensor> {
        let (vb, _, vh) = vision.dims3()?;
        let (tb, _, th) = text.dims3()?;
        if vb != tb {
            anyhow::bail!("Batch size mismatch: vision {vb} vs text {tb}");
        }
        if vh != self.hidden_dim || th != self.hidden_dim {
            anyhow::bail!(
                "Feature width mismatch: expected {}, got vision {vh} / text {th}",
                self.hidden_dim
            );
        }

        match self.method {
            FusionMethod::Concat => self.fuse_concat(vision, text),
            FusionMethod::Add => self.fuse_add(vision, text),
            FusionMethod::Gated => self.fuse_gated(vision, text),
            FusionMethod::Attention => self.fuse_attention(vision, text),
        }
    }

    fn fuse_concat(&self, vision: &Tensor, text: &Tensor) -> Result<Tensor> {
        let combined = Tensor::cat(&[vision, text], 1)?;
        Ok(self.layers.output_proj.forward(&combined)?)
    }

    /// Truncate both sequences to the shorter length and add element-wise
    fn fuse_add(&self, vision: &Tensor, text: &Tensor) -> Result<Tensor> {
        let v_len = vision.dim(1)?;
        let t_len = text.dim(1)?;
        let shared = v_len.min(t_len);
        if shared == 0 {
            anyhow::bail!("Add fusion needs at least one position in each modality");
        }
        let summed = vision
            .narrow(1, 0, shared)?
            .add(&text.narrow(1, 0, shared)?)?;
        Ok(self.layers.output_proj.forward(&summed)?)
    }

    /// Blend every (vision, text) position pair through a learned gate
    ///
    /// For pair (i, j): `g = σ(W[v_i ; t_j])`, output `g·v_i + (1−g)·t_j`.
    /// Yields a `[batch, V·T, fusion]` sequence, vision-major.
    fn fuse_gated(&self, vision: &Tensor, text: &Tensor) -> Result<Tensor> {
        let (batch, v_len, h) = vision.dims3()?;
        let t_len = text.dim(1)?;
        if v_len == 0 || t_len == 0 {
            anyhow::bail!("Gated fusion needs at least one position in each modality");
        }

        // Expand to all pairs: [batch, V, T, h] for each side
        let v_exp = vision
            .unsqueeze(2)?
            .expand((batch, v_len, t_len, h))?
            .contiguous()?;
        let t_exp = text
            .unsqueeze(1)?
            .expand((batch, v_len, t_len, h))?
            .contiguous()?;

        let pairs = Tensor::cat(&[&v_exp, &t_exp], D::Minus1)?;
        let gate = sigmoid(&self.layers.gate.forward(&pairs)?)?;

        let blended = v_exp
            .broadcast_mul(&gate)?
            .add(&t_exp.broadcast_mul(&(gate.affine(-1.0, 1.0)?))?)?;
        let blended = blended.reshape((batch, v_len * t_len, h))?;
        Ok(self.layers.output_proj.forward(&blended)?)
    }

    /// Multi-head cross-attention: vision queries attend over text keys
    /// and values, the attended vision sequence is concatenated with the
    /// raw text sequence, then projected.
    fn fuse_attention(&self, vision: &Tensor, text: &Tensor) -> Result<Tensor> {
        let (batch, v_len, _) = vision.dims3()?;
        let t_len = text.dim(1)?;
        if t_len == 0 {
            anyhow::bail!("Attention fusion needs a nonempty text sequence");
        }
        let head_dim = self.hidden_dim / self.num_heads;

        let q = self
            .layers
            .q_proj
            .forward(vision)?
            .reshape((batch, v_len, self.num_heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .layers
            .k_proj
            .forward(text)?
            .reshape((batch, t_len, self.num_heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .layers
            .v_proj
            .forward(text)?
            .reshape((batch, t_len, self.num_heads, head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * scale)?;
        let weights = softmax_last_dim(&scores)?;
        let attended = weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((batch, v_len, self.hidden_dim))?;
        let attended = self.layers.o_proj.forward(&attended)?;

        let combined = Tensor::cat(&[&attended, text], 1)?;
        Ok(self.layers.output_proj.forward(&combined)?)
    }
}
