//! Full NAT-SD model: encoder, self-conditioning decoder, optional length head,
//! training objectives and the iterative refinement entry points.
use candle::{DType, Result, Tensor, D};
use candle_nn::VarBuilder;
use rand::Rng;

use super::ctc::CtcBeamDecoder;
use super::ctc_loss::{
    cross_layer_sampled_ctc_loss, layer_averaged_ctc_loss, CtcLossOutput, CtcTargets,
};
use super::decoder::{DecoderOptions, NatDecoder};
use super::glancing::{GlancingController, GlatMode, GlatStats};
use super::length::{length_loss, LengthPredictor};
use super::skeleton;
use super::state::DecoderOut;
use super::transformer::{EncoderOut, SourceEncoder, TransformerEncoder};
use super::{Config, LengthSource, Objective};
use crate::models::with_tracing::Embedding;

/// One training batch, all tensors `[B, *]` u32.
#[derive(Debug, Clone)]
pub struct NatBatch {
    pub src_tokens: Tensor,
    /// Noised decoder input. Only read with a predicted length, a fully
    /// masked copy of the reference is used when absent.
    pub prev_output_tokens: Option<Tensor>,
    pub tgt_tokens: Tensor,
}

#[derive(Debug, Clone)]
pub struct NatTrainOutput {
    /// Scalar sum of every entry in `losses`.
    pub loss: Tensor,
    pub losses: Vec<(String, Tensor)>,
    /// Examples whose output skeleton is shorter than their reference.
    pub n_invalid_ctc: usize,
    pub glat: Option<GlatStats>,
}

pub struct NatModel {
    encoder: Box<dyn SourceEncoder + Send + Sync>,
    decoder: NatDecoder,
    length: Option<LengthPredictor>,
    ctc_decoder: Option<CtcBeamDecoder>,
    cfg: Config,
    span: tracing::Span,
}

impl NatModel {
    pub fn new(cfg: &Config, vb: VarBuilder) -> Result<Self> {
        let tcfg = &cfg.transformer;
        let pad = cfg.special_tokens.pad;
        let embed_tokens =
            Embedding::new(tcfg.vocab_size, tcfg.d_model, vb.pp("decoder.embed_tokens"))?;
        let src_embed_tokens = match tcfg.src_vocab_size {
            None => embed_tokens.clone(),
            Some(src_vocab_size) => {
                Embedding::new(src_vocab_size, tcfg.d_model, vb.pp("encoder.embed_tokens"))?
            }
        };
        let encoder = TransformerEncoder::new(tcfg, src_embed_tokens, pad, vb.pp("encoder"))?;
        Self::with_encoder(cfg, Box::new(encoder), embed_tokens, vb)
    }

    /// Build the decoder side around an externally provided encoder.
    pub fn with_encoder(
        cfg: &Config,
        encoder: Box<dyn SourceEncoder + Send + Sync>,
        embed_tokens: Embedding,
        vb: VarBuilder,
    ) -> Result<Self> {
        let vb_d = vb.pp("decoder");
        let decoder = NatDecoder::new(cfg, embed_tokens, vb_d.clone())?;
        let length = match cfg.length.source {
            LengthSource::Predicted => Some(LengthPredictor::new(
                cfg.transformer.d_model,
                &cfg.length,
                vb_d,
            )?),
            LengthSource::Upsample { .. } => None,
        };
        let ctc_decoder = match cfg.objective {
            Objective::Ctc => Some(CtcBeamDecoder::from_config(
                &cfg.ctc,
                cfg.special_tokens.blank()?,
            )?),
            Objective::TokenNll => None,
        };
        Ok(Self {
            encoder,
            decoder,
            length,
            ctc_decoder,
            cfg: cfg.clone(),
            span: tracing::span!(tracing::Level::TRACE, "nat-model"),
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn decoder(&self) -> &NatDecoder {
        &self.decoder
    }

    pub fn length_predictor(&self) -> Option<&LengthPredictor> {
        self.length.as_ref()
    }

    pub fn allow_length_beam(&self) -> bool {
        true
    }

    pub fn encode(&self, src_tokens: &Tensor, train: bool) -> Result<EncoderOut> {
        self.encoder.encode(src_tokens, train)
    }

    fn source_output_tokens(&self, src_tokens: &Tensor, scale: usize) -> Result<Tensor> {
        skeleton::upsampled_output_tokens(
            src_tokens,
            scale,
            self.cfg.length.copy_src_token,
            &self.cfg.special_tokens,
        )
    }

    /// Training pass. `glat` enables glancing, `train_ratio` is the fraction of
    /// training done so far and drives the fixed-ratio blend schedule.
    pub fn forward_t<R: Rng + ?Sized>(
        &self,
        batch: &NatBatch,
        glat: Option<GlatMode>,
        train_ratio: Option<f64>,
        rng: &mut R,
        train: bool,
    ) -> Result<NatTrainOutput> {
        let _enter = self.span.enter();
        let special = &self.cfg.special_tokens;
        let encoder_out = self.encode(&batch.src_tokens, train)?;

        let mut losses = Vec::new();
        if let Some(length) = &self.length {
            let length_out = length.forward(&encoder_out, false)?;
            let length_tgt = length.length_targets(&encoder_out, &batch.tgt_tokens, special.pad)?;
            let loss = length_loss(&length_out, &length_tgt, self.cfg.length.length_loss_factor)?;
            losses.push(("length".to_string(), loss));
        }

        let mut prev_output_tokens = match (self.cfg.length.source, &batch.prev_output_tokens) {
            (LengthSource::Upsample { scale }, _) => {
                self.source_output_tokens(&batch.src_tokens, scale)?
            }
            (LengthSource::Predicted, Some(prev)) => prev.clone(),
            (LengthSource::Predicted, None) => {
                skeleton::full_mask_skeleton(&batch.tgt_tokens, special)?
            }
        };
        let mut tgt_tokens = batch.tgt_tokens.clone();

        let mut glat_stats = None;
        let mut layer_weights = None;
        if let Some(mode) = glat {
            let controller =
                GlancingController::new(&self.decoder, self.cfg.glancing, *special);
            let glanced = controller.glance(
                &encoder_out,
                &prev_output_tokens,
                &tgt_tokens,
                mode,
                train_ratio.unwrap_or(0.0),
                rng,
            )?;
            prev_output_tokens = glanced.prev_output_tokens;
            tgt_tokens = glanced.tgt_tokens;
            glat_stats = Some(glanced.stats);
            layer_weights = Some(glanced.layer_weights);
        }

        let opts = DecoderOptions {
            feedback_weights: if train {
                layer_weights.as_deref()
            } else {
                None
            },
            ..DecoderOptions::default()
        };
        let logits = self
            .decoder
            .forward(&prev_output_tokens, &encoder_out, &opts, false, train)?;

        // glanced positions carry a pad target and drop out of both objectives
        let tgt_mask = tgt_tokens.ne(special.pad)?;
        let mut n_invalid_ctc = 0;
        match self.cfg.objective {
            Objective::Ctc => {
                let logit_mask = prev_output_tokens.ne(special.pad)?;
                let targets = CtcTargets {
                    logit_mask: &logit_mask,
                    targets: &tgt_tokens,
                    target_mask: &tgt_mask,
                    blank: special.blank()?,
                    label_smoothing: self.cfg.label_smoothing,
                };
                let CtcLossOutput { loss, n_invalid } = match self.cfg.ctc.num_cross_layer_sample {
                    0 => layer_averaged_ctc_loss(&logits, &targets)?,
                    n => cross_layer_sampled_ctc_loss(&logits, n, &targets, rng)?,
                };
                n_invalid_ctc = n_invalid;
                losses.push(("ctc".to_string(), loss));
            }
            Objective::TokenNll => {
                let factor = 1.0 / self.decoder.num_layers() as f64;
                for (idx, layer_logits) in logits.iter().enumerate() {
                    let loss = token_nll_loss(
                        layer_logits,
                        &tgt_tokens,
                        &tgt_mask,
                        self.cfg.label_smoothing,
                    )?;
                    losses.push((format!("word_ins_{idx}"), (loss * factor)?));
                }
            }
        }

        let mut total: Option<Tensor> = None;
        for (_, loss) in losses.iter() {
            total = Some(match total {
                None => loss.clone(),
                Some(total) => (total + loss)?,
            });
        }
        let loss = match total {
            Some(loss) => loss,
            None => candle::bail!("no loss was computed"),
        };
        Ok(NatTrainOutput {
            loss,
            losses,
            n_invalid_ctc,
            glat: glat_stats,
        })
    }

    /// Initial refinement state: a skeleton sized from the source or from the
    /// length head, with zero scores.
    pub fn initialize_output_tokens(
        &self,
        encoder_out: &EncoderOut,
        src_tokens: &Tensor,
    ) -> Result<DecoderOut> {
        let output_tokens = match (&self.length, self.cfg.length.source) {
            (Some(length), LengthSource::Predicted) => {
                let length_out = length.forward(encoder_out, true)?;
                let lengths = length.predict_lengths(&length_out, encoder_out)?;
                skeleton::skeleton_from_lengths(
                    &lengths,
                    &self.cfg.special_tokens,
                    src_tokens.device(),
                )?
            }
            (_, LengthSource::Upsample { scale }) => self.source_output_tokens(src_tokens, scale)?,
            (None, LengthSource::Predicted) => {
                candle::bail!("length prediction is configured but the model has no length head")
            }
        };
        let output_scores = output_tokens
            .zeros_like()?
            .to_dtype(encoder_out.encoder_out.dtype())?;
        Ok(DecoderOut::new(output_tokens, output_scores))
    }

    pub fn forward_decoder(&self, state: &DecoderOut, encoder_out: &EncoderOut) -> Result<DecoderOut> {
        self.forward_decoder_t(state, encoder_out, false)
    }

    /// One refinement step. Token-level models and plain CTC take the argmax of
    /// the inference layer on non-pad positions, CTC models otherwise replace
    /// the whole output with the best beam.
    pub fn forward_decoder_t(
        &self,
        state: &DecoderOut,
        encoder_out: &EncoderOut,
        train: bool,
    ) -> Result<DecoderOut> {
        let _enter = self.span.enter();
        let pad = self.cfg.special_tokens.pad;
        let normalize = self.cfg.objective == Objective::TokenNll;
        let opts = DecoderOptions {
            step: state.step,
            ..DecoderOptions::default()
        };
        let mut logits =
            self.decoder
                .forward(&state.output_tokens, encoder_out, &opts, normalize, train)?;
        let idx = self.cfg.inference_layer_index(logits.len())?;
        let output_logits = logits.swap_remove(idx);

        let ctc_decoder = match (&self.ctc_decoder, self.cfg.ctc.plain_ctc) {
            (Some(ctc_decoder), false) => ctc_decoder,
            _ => {
                // argmax only, CTC repeats and blanks are left in place
                let scores = output_logits.max(D::Minus1)?;
                let tokens = output_logits.argmax(D::Minus1)?;
                let keep = state.output_tokens.ne(pad)?;
                let output_tokens = keep.where_cond(&tokens, &state.output_tokens)?;
                let output_scores = keep.where_cond(
                    &scores.to_dtype(state.output_scores.dtype())?,
                    &state.output_scores,
                )?;
                return Ok(state.with_output(output_tokens, output_scores));
            }
        };

        let beam_size = if train {
            self.cfg.ctc.beam_size_train
        } else {
            self.cfg.ctc.beam_size
        };
        let probs = candle_nn::ops::softmax_last_dim(&output_logits.detach())?;
        let lengths = skeleton::non_pad_lengths(&state.output_tokens, pad)?;
        let beams = ctc_decoder.with_beam_width(beam_size).decode(&probs, &lengths)?;
        let (_, width) = state.output_tokens.dims2()?;
        let output_tokens = beams.top_tokens(width, pad, state.output_tokens.device())?;
        let output_scores = output_tokens.ones_like()?.to_dtype(state.output_scores.dtype())?;
        Ok(state.with_output(output_tokens, output_scores))
    }

    /// Replace every example by `beam_size` fresh skeletons centred on its current length.
    pub fn regenerate_length_beam(&self, state: &DecoderOut, beam_size: usize) -> Result<DecoderOut> {
        let special = &self.cfg.special_tokens;
        let lengths = skeleton::non_pad_lengths(&state.output_tokens, special.pad)?;
        let lengths = skeleton::length_beam(&lengths, beam_size);
        let output_tokens =
            skeleton::skeleton_from_lengths(&lengths, special, state.output_tokens.device())?;
        let output_scores = output_tokens
            .zeros_like()?
            .to_dtype(state.output_scores.dtype())?;
        Ok(DecoderOut {
            output_tokens,
            output_scores,
            ..state.clone()
        })
    }

    /// Every CTC beam of the inference layer: tokens `[B, beam, L]` and scores `[B, beam]`.
    pub fn search_results(
        &self,
        state: &DecoderOut,
        encoder_out: &EncoderOut,
        beam_size: Option<usize>,
    ) -> Result<(Tensor, Tensor)> {
        let ctc_decoder = match &self.ctc_decoder {
            Some(ctc_decoder) => ctc_decoder,
            None => candle::bail!("beam search results need the CTC objective"),
        };
        let pad = self.cfg.special_tokens.pad;
        let opts = DecoderOptions {
            step: state.step,
            ..DecoderOptions::default()
        };
        let mut logits =
            self.decoder
                .forward(&state.output_tokens, encoder_out, &opts, false, false)?;
        let idx = self.cfg.inference_layer_index(logits.len())?;
        let probs = candle_nn::ops::softmax_last_dim(&logits.swap_remove(idx).detach())?;
        let lengths = skeleton::non_pad_lengths(&state.output_tokens, pad)?;
        let ctc_decoder = match beam_size {
            Some(beam_size) => ctc_decoder.with_beam_width(beam_size),
            None => ctc_decoder.clone(),
        };
        ctc_decoder
            .decode(&probs, &lengths)?
            .beam_tensors(pad, state.output_tokens.device())
    }
}

/// Label-smoothed NLL over the non-pad reference positions, zero when there are none.
fn token_nll_loss(
    logits: &Tensor,
    targets: &Tensor,
    target_mask: &Tensor,
    label_smoothing: f64,
) -> Result<Tensor> {
    let (b_sz, seq_len, vocab) = logits.dims3()?;
    let positions: Vec<u32> = target_mask
        .flatten_all()?
        .to_vec1::<u8>()?
        .iter()
        .enumerate()
        .filter(|(_, &m)| m != 0)
        .map(|(i, _)| i as u32)
        .collect();
    if positions.is_empty() {
        return Tensor::zeros((), DType::F32, logits.device());
    }
    let n = positions.len();
    let positions = Tensor::from_vec(positions, n, logits.device())?;
    let log_probs = candle_nn::ops::log_softmax(
        &logits
            .to_dtype(DType::F32)?
            .reshape((b_sz * seq_len, vocab))?
            .index_select(&positions, 0)?,
        D::Minus1,
    )?;
    let targets = targets.flatten_all()?.index_select(&positions, 0)?;
    let nll = candle_nn::loss::nll(&log_probs, &targets)?;
    if label_smoothing > 0. {
        let smoothed = log_probs.mean_all()?.neg()?;
        nll.affine(1. - label_smoothing, 0.)? + smoothed.affine(label_smoothing, 0.)?
    } else {
        Ok(nll)
    }
}
