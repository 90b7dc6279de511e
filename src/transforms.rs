//! Pure transforms over attention-weight tensors
//!
//! Every function takes a `[batch, heads, query, key]` tensor and returns a
//! tensor of identical shape (statistics functions return scalars instead).
//! Heavy per-row bookkeeping is done on extracted `Vec` data rather than
//! through gather/scatter kernels; attention matrices in this toolkit are
//! small enough that clarity wins.

use std::str::FromStr;

use anyhow::Result;
use candle_core::{DType, Tensor};
use rand::Rng;

use crate::masks::create_causal_mask;

/// Epsilon added inside the log when computing attention-row entropy
pub const ATTN_ENTROPY_EPS: f32 = 1e-8;

/// Weights strictly below this count as "sparse" in [`attention_sparsity`]
pub const DEFAULT_SPARSITY_THRESHOLD: f32 = 0.01;

/// How to choose which attention weights to keep when sparsifying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SparsifyMethod {
    /// Keep the `max(1, floor(seq_len·ratio))` largest weights per query row
    #[default]
    TopK,
    /// Keep weights at or above the `(1-ratio)` quantile of the flattened
    /// weight distribution
    Threshold,
    /// Keep each weight independently with probability `ratio`
    /// (non-deterministic; seed control is the caller's concern)
    Random,
}

impl FromStr for SparsifyMethod {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "topk" => Ok(Self::TopK),
            "threshold" => Ok(Self::Threshold),
            "random" => Ok(Self::Random),
            other => anyhow::bail!("Unknown sparsification method: {other}"),
        }
    }
}

/// Extract 4D tensor data to nested Vecs
///
/// Candle doesn't have to_vec4(), so we flatten and reshape manually.
fn tensor_to_vec4(tensor: &Tensor) -> Result<Vec<Vec<Vec<Vec<f32>>>>> {
    let dims = tensor.dims();
    if dims.len() != 4 {
        anyhow::bail!("Expected 4D tensor, got {}D", dims.len());
    }
    let (d0, d1, d2, d3) = (dims[0], dims[1], dims[2], dims[3]);

    let flat: Vec<f32> = tensor.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;

    let mut result = Vec::with_capacity(d0);
    let mut iter = flat.into_iter();
    for _ in 0..d0 {
        let mut dim1 = Vec::with_capacity(d1);
        for _ in 0..d1 {
            let mut dim2 = Vec::with_capacity(d2);
            for _ in 0..d2 {
                let dim3: Vec<f32> = iter.by_ref().take(d3).collect();
                dim2.push(dim3);
            }
            dim1.push(dim2);
        }
        result.push(dim1);
    }

    Ok(result)
}

/// Zero all but a retained subset of attention weights
///
/// Keeps at least one non-zero connection per query row for the `TopK`
/// method; `Threshold` and `Random` may zero whole rows.
///
/// # Arguments
/// * `attn` - Attention weights `[batch, heads, seq, seq]`
/// * `ratio` - Fraction of weights to keep, in `[0, 1]`
/// * `method` - Selection strategy
pub fn sparsify(attn: &Tensor, ratio: f32, method: SparsifyMethod) -> Result<Tensor> {
    if !(0.0..=1.0).contains(&ratio) {
        anyhow::bail!("Sparsity ratio must be in [0, 1], got {ratio}");
    }
    // A zero-sized dimension leaves nothing to select from
    if attn.elem_count() == 0 {
        return Ok(attn.clone());
    }
    let original_dtype = attn.dtype();
    let device = attn.device();
    let mut data = tensor_to_vec4(attn)?;

    match method {
        SparsifyMethod::TopK => {
            for batch_data in &mut data {
                for head_data in batch_data {
                    for row in head_data {
                        let seq_len = row.len();
                        let k = ((seq_len as f32 * ratio).floor() as usize).max(1);

                        let mut indexed: Vec<(usize, f32)> =
                            row.iter().copied().enumerate().collect();
                        indexed.sort_by(|a, b| {
                            b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal)
                        });
                        let keep: std::collections::HashSet<usize> =
                            indexed.into_iter().take(k).map(|(i, _)| i).collect();

                        for (j, val) in row.iter_mut().enumerate() {
                            if !keep.contains(&j) {
                                *val = 0.0;
                            }
                        }
                    }
                }
            }
        }
        SparsifyMethod::Threshold => {
            let mut flat: Vec<f32> = data
                .iter()
                .flatten()
                .flatten()
                .flatten()
                .copied()
                .collect();
            flat.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let n = flat.len();
            let idx = (((1.0 - ratio) * (n as f32 - 1.0)).round() as usize).min(n - 1);
            let threshold = flat[idx];

            for batch_data in &mut data {
                for head_data in batch_data {
                    for row in head_data {
                        for val in row {
                            if *val < threshold {
                                *val = 0.0;
                            }
                        }
                    }
                }
            }
        }
        SparsifyMethod::Random => {
            let mut rng = rand::thread_rng();
            for batch_data in &mut data {
                for head_data in batch_data {
                    for row in head_data {
                        for val in row {
                            if rng.gen::<f32>() >= ratio {
                                *val = 0.0;
                            }
                        }
                    }
                }
            }
        }
    }

    let result = Tensor::new(data, device)?.to_dtype(original_dtype)?;
    Ok(result)
}

/// Symmetrize attention: `A_ij ← (A_ij + A_ji) / 2`, then row softmax
///
/// The query and key axes must be the same size. Note the softmax runs on
/// the averaged probabilities, not on logits; this mirrors the modification
/// pipeline's renormalization step.
pub fn symmetrize(attn: &Tensor) -> Result<Tensor> {
    let (_b, _h, q, k) = attn.dims4()?;
    if q != k {
        anyhow::bail!("Cannot symmetrize non-square attention block ({q}x{k})");
    }
    let original_dtype = attn.dtype();
    let attn_f32 = attn.to_dtype(DType::F32)?;
    let symmetric = ((&attn_f32 + &attn_f32.transpose(2, 3)?.contiguous()?)? * 0.5)?;
    let renormalized = candle_nn::ops::softmax_last_dim(&symmetric)?;
    Ok(renormalized.to_dtype(original_dtype)?)
}

/// Enforce causality: strictly-upper-triangular entries go to −inf, then
/// a row softmax renormalizes
pub fn apply_causal(attn: &Tensor) -> Result<Tensor> {
    let (_b, _h, q, k) = attn.dims4()?;
    if q != k {
        anyhow::bail!("Cannot apply causal mask to non-square attention block ({q}x{k})");
    }
    let original_dtype = attn.dtype();
    let attn_f32 = attn.to_dtype(DType::F32)?;
    let mask = create_causal_mask(q, attn.device(), DType::F32)?;
    let masked = attn_f32.broadcast_add(&mask)?;
    let renormalized = candle_nn::ops::softmax_last_dim(&masked)?;
    Ok(renormalized.to_dtype(original_dtype)?)
}

/// Mean Shannon entropy (nats) of attention rows
///
/// Each query row is treated as a distribution over key positions;
/// the result averages over all rows, heads, and batch elements.
pub fn attention_entropy(attn: &Tensor) -> Result<f32> {
    let dims = attn.dims();
    if dims.len() != 4 {
        anyhow::bail!("Expected 4D attention tensor, got {}D", dims.len());
    }
    let row_len = dims[3];
    let flat: Vec<f32> = attn.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    if flat.is_empty() {
        return Ok(0.0);
    }

    let n_rows = flat.len() / row_len;
    let total: f32 = flat
        .chunks(row_len)
        .map(|row| -row.iter().map(|&p| p * (p + ATTN_ENTROPY_EPS).ln()).sum::<f32>())
        .sum();
    Ok(total / n_rows as f32)
}

/// Fraction of attention entries strictly below `threshold`
pub fn attention_sparsity(attn: &Tensor, threshold: f32) -> Result<f32> {
    let flat: Vec<f32> = attn.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
    if flat.is_empty() {
        return Ok(0.0);
    }
    let below = flat.iter().filter(|&&x| x < threshold).count();
    Ok(below as f32 / flat.len() as f32)
}

/// L2 norm of the difference between two attention tensors
pub fn attention_change(original: &Tensor, modified: &Tensor) -> Result<f32> {
    let diff = (original.to_dtype(DType::F32)? - modified.to_dtype(DType::F32)?)?;
    let sum_sq: f32 = diff.sqr()?.sum_all()?.to_scalar()?;
    Ok(sum_sq.sqrt())
}
