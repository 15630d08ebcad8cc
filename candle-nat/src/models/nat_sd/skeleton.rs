//! Output skeletons: the `bos unk .. unk eos pad ..` token grids the decoder refines.
use candle::{Device, Result, Tensor};

use super::SpecialTokens;

/// Shortest skeleton, room for `bos` and `eos`.
pub const MIN_SKELETON_LEN: usize = 2;

/// Number of non-pad tokens in every row of a `[B, T]` u32 token tensor.
pub fn non_pad_lengths(tokens: &Tensor, pad: u32) -> Result<Vec<usize>> {
    let rows = tokens.to_vec2::<u32>()?;
    Ok(rows
        .iter()
        .map(|row| row.iter().filter(|&&t| t != pad).count())
        .collect())
}

/// Build a `[B, max(len)]` skeleton where row `b` is `bos`, `len_b - 2` times `unk`,
/// `eos`, then padding. Lengths below two are raised to two.
pub fn skeleton_from_lengths(
    lengths: &[usize],
    special: &SpecialTokens,
    device: &Device,
) -> Result<Tensor> {
    let lengths: Vec<usize> = lengths.iter().map(|&l| l.max(MIN_SKELETON_LEN)).collect();
    let max_len = lengths.iter().copied().max().unwrap_or(MIN_SKELETON_LEN);
    let mut data = Vec::with_capacity(lengths.len() * max_len);
    for &len in lengths.iter() {
        for t in 0..max_len {
            let token = if t == 0 {
                special.bos
            } else if t + 1 == len {
                special.eos
            } else if t < len {
                special.unk
            } else {
                special.pad
            };
            data.push(token);
        }
    }
    Tensor::from_vec(data, (lengths.len(), max_len), device)
}

/// Repeat every source column `scale` times: `[B, S]` becomes `[B, S * scale]`.
pub fn repeat_source_tokens(src_tokens: &Tensor, scale: usize) -> Result<Tensor> {
    if scale <= 1 {
        return Ok(src_tokens.clone());
    }
    let (b_sz, src_len) = src_tokens.dims2()?;
    src_tokens
        .unsqueeze(2)?
        .broadcast_as((b_sz, src_len, scale))?
        .contiguous()?
        .reshape((b_sz, src_len * scale))
}

/// Initial output tokens from the source length: either the source tokens
/// repeated `scale` times or a skeleton of `count_nonpad(src) * scale` tokens.
pub fn upsampled_output_tokens(
    src_tokens: &Tensor,
    scale: usize,
    copy_src_token: bool,
    special: &SpecialTokens,
) -> Result<Tensor> {
    if copy_src_token {
        return repeat_source_tokens(src_tokens, scale);
    }
    let lengths: Vec<usize> = non_pad_lengths(src_tokens, special.pad)?
        .into_iter()
        .map(|l| l * scale)
        .collect();
    skeleton_from_lengths(&lengths, special, src_tokens.device())
}

/// Expand every length into `beam_size` candidates around it, clamped to two.
///
/// Offsets run from `-(beam_size / 2)` to `beam_size - 1 - beam_size / 2`, the
/// output is example-major: the candidates of example `b` are contiguous.
pub fn length_beam(lengths: &[usize], beam_size: usize) -> Vec<usize> {
    let half = (beam_size / 2) as i64;
    lengths
        .iter()
        .flat_map(|&len| {
            (0..beam_size as i64)
                .map(move |k| (len as i64 + k - half).max(MIN_SKELETON_LEN as i64) as usize)
        })
        .collect()
}

/// Row order mapping every length-beam candidate back to its source example.
pub fn length_beam_order(batch_size: usize, beam_size: usize) -> Vec<u32> {
    (0..batch_size as u32)
        .flat_map(|b| std::iter::repeat_n(b, beam_size))
        .collect()
}

/// Replace every non-special token of the reference by `unk`, keeping
/// `bos`, `eos` and padding in place.
pub fn full_mask_skeleton(tgt_tokens: &Tensor, special: &SpecialTokens) -> Result<Tensor> {
    let (b_sz, tgt_len) = tgt_tokens.dims2()?;
    let data: Vec<u32> = tgt_tokens
        .flatten_all()?
        .to_vec1::<u32>()?
        .into_iter()
        .map(|t| if special.is_special(t) { t } else { special.unk })
        .collect();
    Tensor::from_vec(data, (b_sz, tgt_len), tgt_tokens.device())
}
