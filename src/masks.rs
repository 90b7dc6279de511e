//! Modality-aware attention mask construction
//!
//! A vision-language sequence is an ordered partition of the attention axis
//! into a vision segment `[0, V)` followed by a text segment `[V, V+T)`.
//! Masks built here encode visibility policy per quadrant, independent of
//! tensor content:
//!
//! - vision→vision: fully open (sparsification happens later, on weights)
//! - text→text: lower-triangular causal
//! - cross-modal: configurable via [`CrossAttentionType`]
//!
//! The modality mask is 1/0-valued because it multiplies post-softmax
//! attention weights. The additive −inf causal mask is kept separately for
//! pre-softmax use.

use std::str::FromStr;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};

/// Visibility policy for cross-modal attention edges
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrossAttentionType {
    /// Both directions open
    #[default]
    Bidirectional,
    /// Only vision may attend to text (text→vision edges zeroed)
    VisionToText,
    /// Only text may attend to vision (vision→text edges zeroed)
    TextToVision,
}

impl FromStr for CrossAttentionType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "bidirectional" => Ok(Self::Bidirectional),
            "vision_to_text" => Ok(Self::VisionToText),
            "text_to_vision" => Ok(Self::TextToVision),
            other => anyhow::bail!("Unknown cross attention type: {other}"),
        }
    }
}

/// Create an additive causal mask for pre-softmax attention scores
///
/// # Returns
///
/// A tensor of shape `[1, 1, seq_len, seq_len]` where:
/// - `0.0` for positions that can attend (j <= i)
/// - `-inf` for positions that cannot attend (j > i)
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    let mask_tensor = Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?;
    Ok(mask_tensor)
}

/// Create the multiplicative modality mask for a mixed vision-text sequence
///
/// # Returns
///
/// A tensor of shape `[batch, heads, V+T, V+T]` with value `1.0` for open
/// attention edges and `0.0` for closed ones:
/// - vision→vision block: all ones
/// - text→text block: lower-triangular ones (causal)
/// - cross blocks: per `cross` policy
///
/// A zero-length vision segment degrades to a pure causal mask; a
/// zero-length text segment degrades to an all-ones mask.
pub fn create_modality_mask(
    vision_len: usize,
    text_len: usize,
    batch_size: usize,
    num_heads: usize,
    cross: CrossAttentionType,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    let total = vision_len + text_len;
    let mut data = vec![0.0f32; total * total];

    for i in 0..total {
        for j in 0..total {
            let open = match (i < vision_len, j < vision_len) {
                // vision→vision: fully open
                (true, true) => true,
                // text→text: causal within the text block
                (false, false) => j - vision_len <= i - vision_len,
                // vision→text edge (vision query, text key)
                (true, false) => cross != CrossAttentionType::TextToVision,
                // text→vision edge (text query, vision key)
                (false, true) => cross != CrossAttentionType::VisionToText,
            };
            if open {
                data[i * total + j] = 1.0;
            }
        }
    }

    let mask = Tensor::from_vec(data, (1, 1, total, total), device)?
        .to_dtype(dtype)?
        .expand((batch_size, num_heads, total, total))?;
    Ok(mask)
}
