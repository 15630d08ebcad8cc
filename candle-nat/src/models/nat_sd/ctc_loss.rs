//! CTC alignment loss over per-layer decoder logits.
//!
//! The loss is the negative log of the summed probability of every alignment
//! that collapses to the target, computed with the log-space forward
//! recursion over the blank-extended label sequence. It is built from tensor
//! ops only, so gradients flow back into the logits.
use candle::{DType, IndexOp, Result, Tensor, D};
use rand::Rng;

/// Log-space stand-in for `-inf`, keeps every intermediate finite in f32.
const LOG_ZERO: f32 = -1e30;
/// Losses above this mark alignments that are impossible.
const INFEASIBLE_NLL: f32 = 1e20;

fn logsumexp(xs: &[Tensor]) -> Result<Tensor> {
    let stacked = Tensor::stack(xs, 0)?;
    let max = stacked.max_keepdim(0)?.detach();
    let summed = stacked.broadcast_sub(&max)?.exp()?.sum_keepdim(0)?.log()?;
    (summed + max)?.squeeze(0)
}

/// Shift `[B, S]` right by `n` along the label axis, filling with `LOG_ZERO`.
fn shift_right(alpha: &Tensor, n: usize) -> Result<Tensor> {
    let (b_sz, s_len) = alpha.dims2()?;
    let fill = Tensor::full(LOG_ZERO, (b_sz, n.min(s_len)), alpha.device())?;
    if n >= s_len {
        return Ok(fill);
    }
    Tensor::cat(&[&fill, &alpha.narrow(1, 0, s_len - n)?], 1)
}

/// Per-example CTC negative log-likelihood `[B]` (f32).
///
/// `log_probs` is `[B, T, V]`, example `b` uses its first `input_lengths[b]`
/// frames. With `zero_infinity`, examples without any valid alignment get a
/// loss of zero and no gradient, otherwise their loss is about `1e30`.
pub fn ctc_loss(
    log_probs: &Tensor,
    targets: &[Vec<u32>],
    input_lengths: &[usize],
    blank: u32,
    zero_infinity: bool,
) -> Result<Tensor> {
    let _span = tracing::span!(tracing::Level::TRACE, "ctc-loss").entered();
    let log_probs = log_probs.to_dtype(DType::F32)?;
    let (b_sz, t_max, vocab) = log_probs.dims3()?;
    if targets.len() != b_sz || input_lengths.len() != b_sz {
        candle::bail!(
            "ctc loss got {} targets and {} input lengths for a batch of {b_sz}",
            targets.len(),
            input_lengths.len()
        )
    }
    if let Some(&len) = input_lengths.iter().find(|&&l| l == 0 || l > t_max) {
        candle::bail!("ctc input length {len} outside 1..={t_max}")
    }
    if let Some(&tok) = targets
        .iter()
        .flatten()
        .find(|&&t| t == blank || t as usize >= vocab)
    {
        candle::bail!("invalid ctc target token {tok} (blank {blank}, vocab {vocab})")
    }
    let dev = log_probs.device();
    let max_tgt = targets.iter().map(|t| t.len()).max().unwrap_or(0);
    let s_len = 2 * max_tgt + 1;

    // blank-extended labels and the additive mask of allowed two-step skips
    let mut ext = vec![blank; b_sz * s_len];
    let mut skip = vec![LOG_ZERO; b_sz * s_len];
    for (b, tgt) in targets.iter().enumerate() {
        for (j, &tok) in tgt.iter().enumerate() {
            let s = b * s_len + 2 * j + 1;
            ext[s] = tok;
            if j > 0 && tgt[j - 1] != tok {
                skip[s] = 0.;
            }
        }
    }
    let ext = Tensor::from_vec(ext, (b_sz, 1, s_len), dev)?
        .broadcast_as((b_sz, t_max, s_len))?
        .contiguous()?;
    let emissions = log_probs.gather(&ext, 2)?;
    let skip = Tensor::from_vec(skip, (b_sz, s_len), dev)?;

    let init: Vec<f32> = (0..s_len)
        .map(|s| if s < 2 { 0. } else { LOG_ZERO })
        .collect();
    let init = Tensor::from_vec(init, (1, s_len), dev)?;
    let mut alpha = emissions.i((.., 0, ..))?.broadcast_add(&init)?;
    for t in 1..t_max {
        let stay = alpha.clone();
        let step = shift_right(&alpha, 1)?;
        let jump = (shift_right(&alpha, 2)? + &skip)?;
        let next = (logsumexp(&[stay, step, jump])? + emissions.i((.., t, ..))?)?;
        let active: Vec<u8> = input_lengths.iter().map(|&l| u8::from(t < l)).collect();
        let active = Tensor::from_vec(active, (b_sz, 1), dev)?
            .broadcast_as((b_sz, s_len))?
            .contiguous()?;
        alpha = active.where_cond(&next, &alpha)?;
    }

    let mut last = Vec::with_capacity(b_sz);
    let mut before_last = Vec::with_capacity(b_sz);
    let mut before_last_mask = Vec::with_capacity(b_sz);
    for tgt in targets.iter() {
        let len = tgt.len() as u32;
        last.push(2 * len);
        before_last.push((2 * len).saturating_sub(1));
        before_last_mask.push(if len > 0 { 0. } else { LOG_ZERO });
    }
    let last = alpha.gather(&Tensor::from_vec(last, (b_sz, 1), dev)?, 1)?;
    let before_last = (alpha.gather(&Tensor::from_vec(before_last, (b_sz, 1), dev)?, 1)?
        + Tensor::from_vec(before_last_mask, (b_sz, 1), dev)?)?;
    let nll = logsumexp(&[last, before_last])?.squeeze(1)?.neg()?;
    if zero_infinity {
        let zeros = nll.zeros_like()?;
        nll.ge(INFEASIBLE_NLL)?.where_cond(&zeros, &nll)
    } else {
        Ok(nll)
    }
}

/// Reference tokens and masks shared by every CTC loss call of a batch.
#[derive(Debug, Clone, Copy)]
pub struct CtcTargets<'a> {
    /// `[B, T]` u8, `1` for output positions taking part in the alignment.
    pub logit_mask: &'a Tensor,
    /// `[B, L]` u32 reference tokens.
    pub targets: &'a Tensor,
    /// `[B, L]` u8, `1` for reference positions that are not padding.
    pub target_mask: &'a Tensor,
    pub blank: u32,
    pub label_smoothing: f64,
}

#[derive(Debug, Clone)]
pub struct CtcLossOutput {
    /// Scalar loss: per-example NLL divided by the target length, averaged over the batch.
    pub loss: Tensor,
    /// Number of examples whose output is shorter than their target.
    pub n_invalid: usize,
}

fn mask_lengths(mask: &Tensor) -> Result<Vec<usize>> {
    Ok(mask
        .to_dtype(DType::U8)?
        .to_vec2::<u8>()?
        .iter()
        .map(|row| row.iter().filter(|&&m| m != 0).count())
        .collect())
}

/// CTC loss of one logits tensor `[B, T, V]` against the masked reference.
pub fn sequence_ctc_loss_with_logits(logits: &Tensor, targets: &CtcTargets) -> Result<CtcLossOutput> {
    let logit_lengths = mask_lengths(targets.logit_mask)?;
    let target_rows = targets.targets.to_vec2::<u32>()?;
    let mask_rows = targets.target_mask.to_dtype(DType::U8)?.to_vec2::<u8>()?;
    let target_seqs: Vec<Vec<u32>> = target_rows
        .iter()
        .zip(mask_rows.iter())
        .map(|(row, mask)| {
            row.iter()
                .zip(mask.iter())
                .filter(|(_, &m)| m != 0)
                .map(|(&t, _)| t)
                .collect()
        })
        .collect();

    let n_invalid = logit_lengths
        .iter()
        .zip(target_seqs.iter())
        .filter(|(&logit_len, tgt)| logit_len < tgt.len())
        .count();
    if n_invalid > 0 {
        tracing::warn!(
            "{n_invalid} samples have a predicted alignment shorter than their target, increase the upsample factor"
        );
    }

    let log_probs = candle_nn::ops::log_softmax(&logits.to_dtype(DType::F32)?, D::Minus1)?;
    let nll = ctc_loss(&log_probs, &target_seqs, &logit_lengths, targets.blank, true)?;
    let target_lengths: Vec<f32> = target_seqs.iter().map(|t| t.len().max(1) as f32).collect();
    let target_lengths = Tensor::from_vec(target_lengths, nll.dims1()?, nll.device())?;
    let mut loss = (nll / target_lengths)?.mean_all()?;

    if targets.label_smoothing > 0. {
        let keep = targets.logit_mask.to_dtype(DType::F32)?;
        let count = keep.sum_all()?.to_scalar::<f32>()?.max(1.0) as f64;
        let smoothed = (log_probs.mean(D::Minus1)? * keep)?
            .sum_all()?
            .neg()?
            .affine(1. / count, 0.)?;
        let ls = targets.label_smoothing;
        loss = (loss.affine(1. - ls, 0.)? + smoothed.affine(ls, 0.)?)?;
    }
    Ok(CtcLossOutput { loss, n_invalid })
}

/// Uniform average of the CTC loss of every layer.
pub fn layer_averaged_ctc_loss(logits: &[Tensor], targets: &CtcTargets) -> Result<CtcLossOutput> {
    if logits.is_empty() {
        candle::bail!("no decoder logits to compute the ctc loss on")
    }
    let mut total = None;
    let mut n_invalid = 0;
    for layer_logits in logits.iter() {
        let out = sequence_ctc_loss_with_logits(layer_logits, targets)?;
        n_invalid = out.n_invalid;
        total = Some(match total {
            None => out.loss,
            Some(total) => (total + out.loss)?,
        });
    }
    let loss = match total {
        Some(total) => (total / logits.len() as f64)?,
        None => candle::bail!("no decoder logits to compute the ctc loss on"),
    };
    Ok(CtcLossOutput { loss, n_invalid })
}

/// Pick a random layer for every output position and gather its logits into
/// one mixed-layer tensor `[B, T, V]`.
pub fn sample_cross_layer_logits<R: Rng + ?Sized>(logits: &[Tensor], rng: &mut R) -> Result<Tensor> {
    let stacked = Tensor::stack(logits, 0)?;
    let (num_layers, b_sz, seq_len, vocab) = stacked.dims4()?;
    let positions = b_sz * seq_len;
    let rows: Vec<u32> = (0..positions)
        .map(|p| (rng.random_range(0..num_layers) * positions + p) as u32)
        .collect();
    let rows = Tensor::from_vec(rows, positions, stacked.device())?;
    stacked
        .reshape((num_layers * positions, vocab))?
        .index_select(&rows, 0)?
        .reshape((b_sz, seq_len, vocab))
}

/// Monte-Carlo estimate of the layer-averaged loss: `n_samples` CTC losses,
/// each over independently sampled mixed-layer logits, averaged.
pub fn cross_layer_sampled_ctc_loss<R: Rng + ?Sized>(
    logits: &[Tensor],
    n_samples: usize,
    targets: &CtcTargets,
    rng: &mut R,
) -> Result<CtcLossOutput> {
    if logits.is_empty() || n_samples == 0 {
        candle::bail!(
            "cross-layer sampling needs logits and samples, got {} layers and {n_samples} samples",
            logits.len()
        )
    }
    let mut total = None;
    let mut n_invalid = 0;
    for _ in 0..n_samples {
        let mixed = sample_cross_layer_logits(logits, rng)?;
        let out = sequence_ctc_loss_with_logits(&mixed, targets)?;
        n_invalid = out.n_invalid;
        total = Some(match total {
            None => out.loss,
            Some(total) => (total + out.loss)?,
        });
    }
    let loss = match total {
        Some(total) => (total / n_samples as f64)?,
        None => candle::bail!("no cross-layer samples drawn"),
    };
    Ok(CtcLossOutput { loss, n_invalid })
}
