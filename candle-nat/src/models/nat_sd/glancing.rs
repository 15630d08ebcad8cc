//! Glancing training: reveal part of the reference to the decoder input,
//! more of it while the model is still inaccurate.
use candle::{Result, Tensor, D};
use rand::Rng;

use super::decoder::{DecoderOptions, NatDecoder};
use super::transformer::EncoderOut;
use super::{GlancingConfig, KeepSource, SpecialTokens, WeightSchedule};

/// How much of the reference a training call may reveal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum GlatMode {
    /// Keep probability scaled by the probe pass error rate times `context_p`.
    ContextP(f64),
    /// Fixed keep probability. Not supported.
    Schedule(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GlatStats {
    /// Token accuracy of the probe pass over non-pad reference positions.
    pub accuracy: f64,
    /// Mean keep probability over the batch.
    pub keep_prob: f64,
    pub context_p: f64,
    /// Batch-mean accuracy of every probe layer.
    pub layer_accuracy: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct GlancingOutput {
    pub prev_output_tokens: Tensor,
    pub tgt_tokens: Tensor,
    /// One `[B]` blend weight per decoder layer.
    pub layer_weights: Vec<Tensor>,
    pub stats: GlatStats,
}

/// `(seq_len - same) / seq_len * context_p` per example, zero for empty references.
pub fn keep_probabilities(same: &[usize], seq_lens: &[usize], context_p: f64) -> Vec<f64> {
    same.iter()
        .zip(seq_lens.iter())
        .map(|(&same, &len)| {
            if len == 0 {
                0.0
            } else {
                (len.saturating_sub(same)) as f64 / len as f64 * context_p
            }
        })
        .collect()
}

/// Blend weights `[layer][example]` for a schedule.
pub fn layer_weight_values(
    schedule: WeightSchedule,
    layer_accuracy: &[Vec<f64>],
    train_ratio: f64,
) -> Vec<Vec<f64>> {
    layer_accuracy
        .iter()
        .map(|acc| match schedule {
            WeightSchedule::FixedRatio => vec![(train_ratio * 10.0).min(0.5); acc.len()],
            WeightSchedule::ConstantHalf => vec![0.5; acc.len()],
            WeightSchedule::Accuracy => acc.iter().map(|a| a.sqrt() / 2.0).collect(),
        })
        .collect()
}

pub struct GlancingController<'a> {
    decoder: &'a NatDecoder,
    cfg: GlancingConfig,
    special: SpecialTokens,
}

impl<'a> GlancingController<'a> {
    pub fn new(decoder: &'a NatDecoder, cfg: GlancingConfig, special: SpecialTokens) -> Self {
        Self {
            decoder,
            cfg,
            special,
        }
    }

    /// Probe the decoder without gradients, then build the glanced decoder
    /// input, the reduced reference and the per-layer blend weights.
    pub fn glance<R: Rng + ?Sized>(
        &self,
        encoder_out: &EncoderOut,
        prev_output_tokens: &Tensor,
        tgt_tokens: &Tensor,
        mode: GlatMode,
        train_ratio: f64,
        rng: &mut R,
    ) -> Result<GlancingOutput> {
        let context_p = match mode {
            GlatMode::ContextP(p) => p,
            GlatMode::Schedule(_) => candle::bail!("the glancing schedule mode is not implemented"),
        };
        if prev_output_tokens.dims() != tgt_tokens.dims() {
            candle::bail!(
                "glancing needs decoder input {:?} and reference {:?} of the same shape",
                prev_output_tokens.dims(),
                tgt_tokens.dims()
            )
        }
        let pad = self.special.pad;

        let probe: Vec<Tensor> = self
            .decoder
            .forward(prev_output_tokens, encoder_out, &DecoderOptions::default(), false, true)?
            .into_iter()
            .map(|logits| logits.detach())
            .collect();
        let last = match probe.last() {
            Some(last) => last,
            None => candle::bail!("decoder produced no logits"),
        };
        let pred = last.argmax(D::Minus1)?.to_vec2::<u32>()?;
        let prev = prev_output_tokens.to_vec2::<u32>()?;
        let tgt = tgt_tokens.to_vec2::<u32>()?;

        let mut same = Vec::with_capacity(tgt.len());
        let mut seq_lens = Vec::with_capacity(tgt.len());
        for (pred_row, tgt_row) in pred.iter().zip(tgt.iter()) {
            let nonpad = tgt_row.iter().filter(|&&t| t != pad).count();
            let hits = pred_row
                .iter()
                .zip(tgt_row.iter())
                .filter(|(&p, &t)| t != pad && p == t)
                .count();
            same.push(hits);
            seq_lens.push(nonpad);
        }
        let keep_prob = keep_probabilities(&same, &seq_lens, context_p);

        let (b_sz, seq_len) = tgt_tokens.dims2()?;
        let mut glat_prev = Vec::with_capacity(b_sz * seq_len);
        let mut glat_tgt = Vec::with_capacity(b_sz * seq_len);
        for b in 0..b_sz {
            for t in 0..seq_len {
                let keep = rng.random::<f64>() < keep_prob[b];
                let skeleton_token = prev[b][t];
                if keep {
                    let input = match self.cfg.keep_source {
                        // special skeleton positions stay in place
                        KeepSource::Prediction if !self.special.is_special(skeleton_token) => {
                            pred[b][t]
                        }
                        _ => skeleton_token,
                    };
                    glat_prev.push(input);
                    glat_tgt.push(pad);
                } else {
                    glat_prev.push(tgt[b][t]);
                    glat_tgt.push(tgt[b][t]);
                }
            }
        }

        // accuracy against the reduced reference over the unglanced non-pad positions
        let mut layer_accuracy = Vec::with_capacity(probe.len());
        for logits in probe.iter() {
            let layer_pred = logits.argmax(D::Minus1)?.to_vec2::<u32>()?;
            let acc: Vec<f64> = (0..b_sz)
                .map(|b| {
                    let hits = (0..seq_len)
                        .filter(|&t| tgt[b][t] != pad && layer_pred[b][t] == glat_tgt[b * seq_len + t])
                        .count();
                    hits as f64 / seq_lens[b].max(1) as f64
                })
                .collect();
            layer_accuracy.push(acc);
        }

        let weights = layer_weight_values(self.cfg.weight_schedule, &layer_accuracy, train_ratio);
        let dtype = last.dtype();
        let device = tgt_tokens.device();
        let layer_weights = weights
            .into_iter()
            .map(|w| Tensor::from_vec(w, b_sz, device)?.to_dtype(dtype))
            .collect::<Result<Vec<_>>>()?;

        let total_same: usize = same.iter().sum();
        let total_len: usize = seq_lens.iter().sum();
        let stats = GlatStats {
            accuracy: total_same as f64 / total_len.max(1) as f64,
            keep_prob: keep_prob.iter().sum::<f64>() / keep_prob.len().max(1) as f64,
            context_p,
            layer_accuracy: layer_accuracy
                .iter()
                .map(|acc| acc.iter().sum::<f64>() / acc.len().max(1) as f64)
                .collect(),
        };
        tracing::debug!(
            accuracy = stats.accuracy,
            keep_prob = stats.keep_prob,
            context_p,
            "glancing"
        );

        Ok(GlancingOutput {
            prev_output_tokens: Tensor::from_vec(glat_prev, (b_sz, seq_len), device)?,
            tgt_tokens: Tensor::from_vec(glat_tgt, (b_sz, seq_len), device)?,
            layer_weights,
            stats,
        })
    }
}
