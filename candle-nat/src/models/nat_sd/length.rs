//! Target length prediction from mean-pooled encoder states.
use candle::{DType, Result, Tensor, D};
use candle_nn::VarBuilder;

use super::transformer::{masked_mean, EncoderOut};
use super::LengthConfig;
use crate::models::with_tracing::Embedding;

/// Number of length classes.
pub const LENGTH_BUCKETS: usize = 256;
/// Class of a zero length difference when predicting offsets.
pub const LENGTH_OFFSET: i64 = 128;

/// Classifier over [`LENGTH_BUCKETS`] length classes. The class embedding table
/// doubles as the output projection: `logits = mean_pool(enc) @ E^T`.
#[derive(Debug, Clone)]
pub struct LengthPredictor {
    embed_length: Embedding,
    pred_length_offset: bool,
    sg_length_pred: bool,
    span: tracing::Span,
}

impl LengthPredictor {
    pub fn new(d_model: usize, cfg: &LengthConfig, vb: VarBuilder) -> Result<Self> {
        let embed_length = Embedding::new(LENGTH_BUCKETS, d_model, vb.pp("embed_length"))?;
        Ok(Self {
            embed_length,
            pred_length_offset: cfg.pred_length_offset,
            sg_length_pred: cfg.sg_length_pred,
            span: tracing::span!(tracing::Level::TRACE, "length"),
        })
    }

    /// Length class scores `[B, 256]`, log-softmax normalised when `normalize`.
    pub fn forward(&self, encoder_out: &EncoderOut, normalize: bool) -> Result<Tensor> {
        let _enter = self.span.enter();
        let enc_feats = masked_mean(
            &encoder_out.encoder_out,
            encoder_out.encoder_padding_mask.as_ref(),
        )?;
        let enc_feats = if self.sg_length_pred {
            enc_feats.detach()
        } else {
            enc_feats
        };
        let length_out = enc_feats.matmul(&self.embed_length.embeddings().t()?)?;
        if normalize {
            candle_nn::ops::log_softmax(&length_out, D::Minus1)
        } else {
            Ok(length_out)
        }
    }

    fn source_lengths(&self, encoder_out: &EncoderOut, b_sz: usize) -> Result<Vec<i64>> {
        match encoder_out.source_lengths()? {
            Some(lengths) => Ok(lengths.into_iter().map(|l| l as i64).collect()),
            None if self.pred_length_offset => {
                candle::bail!("offset length prediction requires an encoder padding mask")
            }
            None => Ok(vec![0; b_sz]),
        }
    }

    /// Training targets `[B]` (u32 classes) from the reference tokens.
    pub fn length_targets(
        &self,
        encoder_out: &EncoderOut,
        tgt_tokens: &Tensor,
        pad: u32,
    ) -> Result<Tensor> {
        let tgt_lengths = super::skeleton::non_pad_lengths(tgt_tokens, pad)?;
        let targets = if self.pred_length_offset {
            let src_lengths = self.source_lengths(encoder_out, tgt_lengths.len())?;
            tgt_lengths
                .iter()
                .zip(src_lengths.iter())
                .map(|(&tgt, &src)| tgt as i64 - src + LENGTH_OFFSET)
                .collect::<Vec<_>>()
        } else {
            tgt_lengths.iter().map(|&l| l as i64).collect()
        };
        let targets: Vec<u32> = targets
            .into_iter()
            .map(|t| t.clamp(0, LENGTH_BUCKETS as i64 - 1) as u32)
            .collect();
        let b_sz = targets.len();
        Tensor::from_vec(targets, b_sz, tgt_tokens.device())
    }

    /// Greedy length decisions, converted back to absolute lengths.
    pub fn predict_lengths(&self, length_out: &Tensor, encoder_out: &EncoderOut) -> Result<Vec<usize>> {
        let classes = length_out.argmax(D::Minus1)?.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        if !self.pred_length_offset {
            return Ok(classes.into_iter().map(|c| c as usize).collect());
        }
        let src_lengths = self.source_lengths(encoder_out, classes.len())?;
        Ok(classes
            .iter()
            .zip(src_lengths.iter())
            .map(|(&c, &src)| (c as i64 - LENGTH_OFFSET + src).max(0) as usize)
            .collect())
    }
}

/// Cross-entropy of the length classifier, scaled by `factor`.
pub fn length_loss(length_out: &Tensor, length_targets: &Tensor, factor: f64) -> Result<Tensor> {
    let length_out = length_out.to_dtype(DType::F32)?;
    candle_nn::loss::cross_entropy(&length_out, length_targets)? * factor
}
