//! Layer-wise self-conditioning decoder.
//!
//! Before every layer `i` the current hidden state is projected to vocabulary
//! logits. From layer 1 on, those logits are mapped back into embedding space
//! (soft mixture or hard argmax) and blended into the hidden state that layer
//! `i` consumes.
use candle::{Module, Result, Tensor, D};
use candle_nn::{Dropout, VarBuilder};

use super::transformer::{
    padding_mask, DecoderLayer, EncoderOut, SinusoidalPositionalEmbedding,
};
use super::{Config, SelfConditioningConfig};
use crate::models::with_tracing::{layer_norm, linear_no_bias, Embedding, LayerNorm, Linear};

/// Policy turning layer logits into an embedding-space feedback signal.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Feedback {
    /// `softmax(logits.detach() / temperature) @ E`
    Soft { temperature: f64 },
    /// `E[argmax(logits)]`
    Hard,
}

impl Feedback {
    pub fn from_config(cfg: &SelfConditioningConfig) -> Self {
        if cfg.hard_argmax {
            Feedback::Hard
        } else {
            Feedback::Soft {
                temperature: cfg.yhat_temp,
            }
        }
    }
}

/// Per-call decoder options.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecoderOptions<'a> {
    /// Refinement step, source embedding copy only applies at step 0.
    pub step: usize,
    /// Run only the first `n` layers.
    pub early_exit: Option<usize>,
    /// Per-layer blend weights, each `[B]` in `[0, 1]`, indexed by layer.
    pub feedback_weights: Option<&'a [Tensor]>,
}

#[derive(Debug, Clone)]
pub struct DecoderOutput {
    /// Logits computed before layer 0, never fed back.
    pub first_layer_logits: Tensor,
    /// Logits feeding layers `1..n`, followed by the logits of the final hidden state.
    pub layer_logits: Vec<Tensor>,
    /// Final hidden state `[B, T, C]`.
    pub features: Tensor,
    /// Decoder input followed by every layer output.
    pub inner_states: Vec<Tensor>,
}

impl DecoderOutput {
    /// Every logits tensor computed in the pass, `layers run + 1` entries.
    pub fn all_logits(&self) -> Vec<Tensor> {
        let mut all = Vec::with_capacity(self.layer_logits.len() + 1);
        all.push(self.first_layer_logits.clone());
        all.extend(self.layer_logits.iter().cloned());
        all
    }

    pub fn num_logits(&self) -> usize {
        self.layer_logits.len() + 1
    }
}

/// Norm preserving blend of the hidden state and the feedback embedding.
///
/// Without a weight this is `(x + y_hat) / sqrt(2)`, with a per-example weight
/// `p` it is `(p x + (1 - p) y_hat) / sqrt(p^2 + (1 - p)^2)`.
pub fn blend(xs: &Tensor, y_hat: &Tensor, weight: Option<&Tensor>) -> Result<Tensor> {
    match weight {
        None => (xs + y_hat)? / std::f64::consts::SQRT_2,
        Some(p) => {
            let b_sz = xs.dim(0)?;
            let p = p.to_dtype(xs.dtype())?.reshape((b_sz, 1, 1))?;
            let one_minus_p = p.affine(-1., 1.)?;
            let norm = (p.sqr()? + one_minus_p.sqr()?)?.sqrt()?;
            (xs.broadcast_mul(&p)? + y_hat.broadcast_mul(&one_minus_p)?)?.broadcast_div(&norm)
        }
    }
}

/// Monotonic source index for every target position: `round(t * (S - 1) / (T - 1))`,
/// rounding halves to even.
/// Positions past a target's length map to source position 0.
pub fn uniform_assignment(src_lens: &[usize], tgt_lens: &[usize], max_tgt_len: usize) -> Vec<u32> {
    let mut ids = Vec::with_capacity(src_lens.len() * max_tgt_len);
    for (&src_len, &tgt_len) in src_lens.iter().zip(tgt_lens.iter()) {
        let step = src_len.saturating_sub(1) as f64 / tgt_len.saturating_sub(1).max(1) as f64;
        for t in 0..max_tgt_len {
            if t < tgt_len {
                ids.push((step * t as f64).round_ties_even() as u32);
            } else {
                ids.push(0);
            }
        }
    }
    ids
}

#[derive(Debug, Clone)]
pub struct NatDecoder {
    embed_tokens: Embedding,
    embed_positions: SinusoidalPositionalEmbedding,
    embed_scale: f64,
    layers: Vec<DecoderLayer>,
    layer_norm: Option<LayerNorm>,
    output_projection: Linear,
    dropout: Dropout,
    feedback: Feedback,
    src_embedding_copy: bool,
    padding_idx: u32,
    span: tracing::Span,
}

impl NatDecoder {
    pub fn new(cfg: &Config, embed_tokens: Embedding, vb: VarBuilder) -> Result<Self> {
        let tcfg = &cfg.transformer;
        let padding_idx = cfg.special_tokens.pad;
        let embed_positions = SinusoidalPositionalEmbedding::new(
            tcfg.max_target_positions,
            tcfg.d_model,
            padding_idx,
            vb.dtype(),
            vb.device(),
        )?;
        let vb_l = vb.pp("layers");
        let layers = (0..tcfg.decoder_layers)
            .map(|i| DecoderLayer::new(tcfg, vb_l.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let layer_norm = if tcfg.normalize_before {
            Some(layer_norm(tcfg.d_model, tcfg.layer_norm_eps, vb.pp("layer_norm"))?)
        } else {
            None
        };
        let output_projection = if tcfg.share_decoder_input_output_embed {
            Linear::from_weights(embed_tokens.embeddings().clone(), None)
        } else {
            linear_no_bias(tcfg.d_model, tcfg.vocab_size, vb.pp("output_projection"))?
        };
        let embed_scale = if tcfg.scale_embedding {
            (tcfg.d_model as f64).sqrt()
        } else {
            1.0
        };
        Ok(Self {
            embed_tokens,
            embed_positions,
            embed_scale,
            layers,
            layer_norm,
            output_projection,
            dropout: Dropout::new(tcfg.dropout),
            feedback: Feedback::from_config(&cfg.self_conditioning),
            src_embedding_copy: cfg.length.src_embedding_copy,
            padding_idx,
            span: tracing::span!(tracing::Level::TRACE, "nat-decoder"),
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn embed_tokens(&self) -> &Embedding {
        &self.embed_tokens
    }

    pub fn feedback(&self) -> Feedback {
        self.feedback
    }

    pub fn output_layer(&self, xs: &Tensor) -> Result<Tensor> {
        self.output_projection.forward(xs)
    }

    /// Map logits `[B, T, V]` to the embedding-space feedback `[B, T, C]`.
    pub fn feedback_embedding(&self, logits: &Tensor) -> Result<Tensor> {
        match self.feedback {
            Feedback::Soft { temperature } => {
                let (b_sz, seq_len, vocab) = logits.dims3()?;
                let probs = candle_nn::ops::softmax_last_dim(&(logits.detach() / temperature)?)?;
                let embeddings = self.embed_tokens.embeddings();
                probs
                    .reshape((b_sz * seq_len, vocab))?
                    .matmul(embeddings)?
                    .reshape((b_sz, seq_len, ()))
            }
            Feedback::Hard => self.embed_tokens.forward(&logits.argmax(D::Minus1)?),
        }
    }

    /// Token (or supplied state) embeddings plus positions, and the target padding mask.
    pub fn forward_embedding(
        &self,
        prev_output_tokens: &Tensor,
        states: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let xs = match states {
            Some(states) => states.clone(),
            None => (self.embed_tokens.forward(prev_output_tokens)? * self.embed_scale)?,
        };
        let positions = self.embed_positions.forward(prev_output_tokens)?;
        let xs = self.dropout.forward(&(xs + positions)?, train)?;
        Ok((xs, padding_mask(prev_output_tokens, self.padding_idx)?))
    }

    /// Copy source embeddings onto the target positions with a uniform monotonic alignment.
    pub fn forward_copying_source(
        &self,
        encoder_out: &EncoderOut,
        prev_output_tokens: &Tensor,
    ) -> Result<Tensor> {
        let src_embeds = match &encoder_out.encoder_embedding {
            Some(embeds) => embeds,
            None => candle::bail!("source embedding copy requires the encoder embeddings"),
        };
        let (b_sz, src_len, hidden) = src_embeds.dims3()?;
        let src_lens = match encoder_out.source_lengths()? {
            Some(lens) => lens,
            None => vec![src_len; b_sz],
        };
        let (_, tgt_len) = prev_output_tokens.dims2()?;
        let tgt_lens = super::skeleton::non_pad_lengths(prev_output_tokens, self.padding_idx)?;
        let ids = uniform_assignment(&src_lens, &tgt_lens, tgt_len);
        let ids = Tensor::from_vec(ids, (b_sz, tgt_len, 1), src_embeds.device())?
            .broadcast_as((b_sz, tgt_len, hidden))?
            .contiguous()?;
        src_embeds.gather(&ids, 1)
    }

    pub fn extract_features(
        &self,
        prev_output_tokens: &Tensor,
        encoder_out: &EncoderOut,
        opts: &DecoderOptions,
        train: bool,
    ) -> Result<DecoderOutput> {
        let _enter = self.span.enter();
        let num_layers = match opts.early_exit {
            None => self.layers.len(),
            Some(0) => candle::bail!("early exit must run at least one decoder layer"),
            Some(n) if n > self.layers.len() => {
                candle::bail!("early exit {n} exceeds the {} decoder layers", self.layers.len())
            }
            Some(n) => n,
        };
        if let Some(weights) = opts.feedback_weights {
            if weights.len() < num_layers {
                candle::bail!(
                    "{} feedback weights supplied for {num_layers} decoder layers",
                    weights.len()
                )
            }
        }

        let states = if self.src_embedding_copy && opts.step == 0 {
            Some(self.forward_copying_source(encoder_out, prev_output_tokens)?)
        } else {
            None
        };
        let (mut xs, self_padding_mask) =
            self.forward_embedding(prev_output_tokens, states.as_ref(), train)?;

        let mut inner_states = Vec::with_capacity(num_layers + 1);
        inner_states.push(xs.clone());
        let mut first_layer_logits = None;
        let mut layer_logits = Vec::with_capacity(num_layers);
        for (i, layer) in self.layers.iter().take(num_layers).enumerate() {
            let logits = self.output_layer(&xs)?;
            if i == 0 {
                first_layer_logits = Some(logits);
            } else {
                let y_hat = self.feedback_embedding(&logits)?;
                let weight = opts.feedback_weights.map(|w| &w[i]);
                xs = blend(&xs, &y_hat, weight)?;
                layer_logits.push(logits);
            }
            xs = layer.forward(&xs, Some(&self_padding_mask), encoder_out, train)?;
            inner_states.push(xs.clone());
        }
        if let Some(layer_norm) = &self.layer_norm {
            xs = xs.apply(layer_norm)?;
        }
        layer_logits.push(self.output_layer(&xs)?);

        let first_layer_logits = match first_layer_logits {
            Some(logits) => logits,
            None => candle::bail!("decoder ran no layers"),
        };
        Ok(DecoderOutput {
            first_layer_logits,
            layer_logits,
            features: xs,
            inner_states,
        })
    }

    /// Per-layer logits (log-probabilities when `normalize`), one entry per layer run.
    pub fn forward(
        &self,
        prev_output_tokens: &Tensor,
        encoder_out: &EncoderOut,
        opts: &DecoderOptions,
        normalize: bool,
        train: bool,
    ) -> Result<Vec<Tensor>> {
        let out = self.extract_features(prev_output_tokens, encoder_out, opts, train)?;
        if normalize {
            out.layer_logits
                .iter()
                .map(|logits| candle_nn::ops::log_softmax(logits, D::Minus1))
                .collect()
        } else {
            Ok(out.layer_logits)
        }
    }
}
