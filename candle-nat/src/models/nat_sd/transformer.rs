//! Transformer encoder and decoder layers laid out like fairseq checkpoints.
//!
//! All activations are batch-first `[B, T, C]`. Key padding masks are `u8`
//! tensors of shape `[B, S]` where `1` marks a padding position.
use candle::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{Dropout, VarBuilder};

use super::TransformerConfig;
use crate::models::with_tracing::{layer_norm, linear, Embedding, LayerNorm, Linear};

/// Additive attention bias for masked keys, finite in f16, bf16 and f32.
const MASK_FILL: f64 = -1e4;

/// Encoder state handed to the decoder and the length head.
#[derive(Debug, Clone)]
pub struct EncoderOut {
    /// `[B, S, C]`
    pub encoder_out: Tensor,
    /// `[B, S]` u8, `1` for padding. `None` when the source has no padding information.
    pub encoder_padding_mask: Option<Tensor>,
    /// Scaled token embeddings of the source, `[B, S, C]`.
    pub encoder_embedding: Option<Tensor>,
}

impl EncoderOut {
    pub fn new(encoder_out: Tensor) -> Self {
        Self {
            encoder_out,
            encoder_padding_mask: None,
            encoder_embedding: None,
        }
    }

    pub fn with_padding_mask(mut self, mask: Tensor) -> Self {
        self.encoder_padding_mask = Some(mask);
        self
    }

    pub fn with_embedding(mut self, embedding: Tensor) -> Self {
        self.encoder_embedding = Some(embedding);
        self
    }

    pub fn batch_size(&self) -> Result<usize> {
        self.encoder_out.dim(0)
    }

    /// Number of non-pad source positions per example, `None` without a mask.
    pub fn source_lengths(&self) -> Result<Option<Vec<usize>>> {
        let mask = match &self.encoder_padding_mask {
            None => return Ok(None),
            Some(mask) => mask,
        };
        let rows = mask.to_vec2::<u8>()?;
        Ok(Some(
            rows.iter()
                .map(|row| row.iter().filter(|&&m| m == 0).count())
                .collect(),
        ))
    }

    /// Reorder (and possibly repeat) the batch rows, e.g. for a length beam.
    pub fn index_select(&self, order: &[u32]) -> Result<Self> {
        let ids = Tensor::new(order, self.encoder_out.device())?;
        let select = |t: &Tensor| t.index_select(&ids, 0);
        Ok(Self {
            encoder_out: select(&self.encoder_out)?,
            encoder_padding_mask: self.encoder_padding_mask.as_ref().map(select).transpose()?,
            encoder_embedding: self.encoder_embedding.as_ref().map(select).transpose()?,
        })
    }
}

/// Source-side encoder consumed by the NAT model.
pub trait SourceEncoder {
    fn encode(&self, src_tokens: &Tensor, train: bool) -> Result<EncoderOut>;
}

/// `[B, T]` u8 mask with `1` at every `pad` token.
pub fn padding_mask(tokens: &Tensor, pad: u32) -> Result<Tensor> {
    tokens.eq(pad)
}

fn padding_bias(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    let (b_sz, src_len) = mask.dims2()?;
    mask.to_dtype(dtype)?
        .affine(MASK_FILL, 0.)?
        .reshape((b_sz, 1, 1, src_len))
}

/// Fixed sinusoidal positions; non-pad tokens are numbered from `pad + 1` and
/// pad tokens map to an all-zero row.
#[derive(Debug, Clone)]
pub struct SinusoidalPositionalEmbedding {
    table: Tensor,
    padding_idx: u32,
}

impl SinusoidalPositionalEmbedding {
    pub fn new(
        max_positions: usize,
        dim: usize,
        padding_idx: u32,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let num_embeddings = max_positions + padding_idx as usize + 1;
        let half_dim = dim / 2;
        if half_dim < 2 {
            candle::bail!("sinusoidal positions need an embedding dim of at least 4, got {dim}")
        }
        let scale = (10000f64).ln() / (half_dim - 1) as f64;
        let inv_freq: Vec<f64> = (0..half_dim).map(|i| (-(i as f64) * scale).exp()).collect();
        let mut data = Vec::with_capacity(num_embeddings * dim);
        for pos in 0..num_embeddings {
            if pos == padding_idx as usize {
                data.extend(std::iter::repeat_n(0f32, dim));
                continue;
            }
            let pos = pos as f64;
            data.extend(inv_freq.iter().map(|f| (pos * f).sin() as f32));
            data.extend(inv_freq.iter().map(|f| (pos * f).cos() as f32));
            if dim % 2 == 1 {
                data.push(0f32);
            }
        }
        let table = Tensor::from_vec(data, (num_embeddings, dim), device)?.to_dtype(dtype)?;
        Ok(Self { table, padding_idx })
    }

    pub fn forward(&self, tokens: &Tensor) -> Result<Tensor> {
        let (b_sz, seq_len) = tokens.dims2()?;
        let num_embeddings = self.table.dim(0)?;
        let mut positions = Vec::with_capacity(b_sz * seq_len);
        for row in tokens.to_vec2::<u32>()? {
            let mut next = self.padding_idx + 1;
            for token in row {
                if token == self.padding_idx {
                    positions.push(self.padding_idx);
                } else {
                    positions.push(next);
                    next += 1;
                }
            }
        }
        if let Some(&max) = positions.iter().max() {
            if max as usize >= num_embeddings {
                candle::bail!("sequence of {seq_len} tokens exceeds the {num_embeddings} positions")
            }
        }
        let ids = Tensor::from_vec(positions, b_sz * seq_len, tokens.device())?;
        self.table
            .index_select(&ids, 0)?
            .reshape((b_sz, seq_len, ()))
    }
}

#[derive(Debug, Clone)]
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    out_proj: Linear,
    scaling: f64,
    num_heads: usize,
    head_dim: usize,
    dropout: Dropout,
    span: tracing::Span,
}

impl Attention {
    fn new(embed_dim: usize, num_heads: usize, dropout: f32, vb: VarBuilder) -> Result<Self> {
        if embed_dim % num_heads != 0 {
            candle::bail!("embed dim {embed_dim} is not divisible by {num_heads} heads")
        }
        let head_dim = embed_dim / num_heads;
        let scaling = (head_dim as f64).powf(-0.5);
        let q_proj = linear(embed_dim, embed_dim, vb.pp("q_proj"))?;
        let k_proj = linear(embed_dim, embed_dim, vb.pp("k_proj"))?;
        let v_proj = linear(embed_dim, embed_dim, vb.pp("v_proj"))?;
        let out_proj = linear(embed_dim, embed_dim, vb.pp("out_proj"))?;
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            out_proj,
            scaling,
            num_heads,
            head_dim,
            dropout: Dropout::new(dropout),
            span: tracing::span!(tracing::Level::TRACE, "attn"),
        })
    }

    fn shape(&self, tensor: &Tensor, b_sz: usize) -> Result<Tensor> {
        tensor
            .reshape((b_sz, (), self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()
    }

    fn forward(
        &self,
        xs: &Tensor,
        kv_states: Option<&Tensor>,
        key_padding_mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let _enter = self.span.enter();
        let (b_sz, tgt_len, _) = xs.dims3()?;
        let kv_states = kv_states.unwrap_or(xs);
        let query_states = self.shape(&(xs.apply(&self.q_proj)? * self.scaling)?, b_sz)?;
        let key_states = self.shape(&kv_states.apply(&self.k_proj)?, b_sz)?;
        let value_states = self.shape(&kv_states.apply(&self.v_proj)?, b_sz)?;

        let attn_weights = query_states.matmul(&key_states.t()?)?;
        let attn_weights = match key_padding_mask {
            None => attn_weights,
            Some(mask) => attn_weights.broadcast_add(&padding_bias(mask, attn_weights.dtype())?)?,
        };
        let attn_probs = candle_nn::ops::softmax(&attn_weights, D::Minus1)?;
        let attn_probs = self.dropout.forward(&attn_probs, train)?;
        attn_probs
            .matmul(&value_states)?
            .transpose(1, 2)?
            .reshape((b_sz, tgt_len, self.head_dim * self.num_heads))?
            .apply(&self.out_proj)
    }
}

#[derive(Debug, Clone)]
struct FeedForward {
    fc1: Linear,
    fc2: Linear,
    activation_fn: candle_nn::Activation,
    activation_dropout: Dropout,
}

impl FeedForward {
    fn new(cfg: &TransformerConfig, ffn_dim: usize, vb: &VarBuilder) -> Result<Self> {
        Ok(Self {
            fc1: linear(cfg.d_model, ffn_dim, vb.pp("fc1"))?,
            fc2: linear(ffn_dim, cfg.d_model, vb.pp("fc2"))?,
            activation_fn: cfg.activation_function,
            activation_dropout: Dropout::new(cfg.activation_dropout),
        })
    }

    fn forward(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = xs.apply(&self.fc1)?.apply(&self.activation_fn)?;
        self.activation_dropout.forward(&xs, train)?.apply(&self.fc2)
    }
}

/// Residual wrapper shared by every sub-block: pre-norm applies the layer norm
/// to the block input, post-norm to the residual sum.
#[derive(Debug, Clone)]
struct Residual {
    layer_norm: LayerNorm,
    normalize_before: bool,
    dropout: Dropout,
}

impl Residual {
    fn new(cfg: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            layer_norm: layer_norm(cfg.d_model, cfg.layer_norm_eps, vb)?,
            normalize_before: cfg.normalize_before,
            dropout: Dropout::new(cfg.dropout),
        })
    }

    fn forward<F>(&self, xs: &Tensor, train: bool, block: F) -> Result<Tensor>
    where
        F: FnOnce(&Tensor) -> Result<Tensor>,
    {
        let ys = if self.normalize_before {
            block(&xs.apply(&self.layer_norm)?)?
        } else {
            block(xs)?
        };
        let ys = (self.dropout.forward(&ys, train)? + xs)?;
        if self.normalize_before {
            Ok(ys)
        } else {
            ys.apply(&self.layer_norm)
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncoderLayer {
    self_attn: Attention,
    self_attn_block: Residual,
    ffn: FeedForward,
    ffn_block: Residual,
}

impl EncoderLayer {
    pub fn new(cfg: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let self_attn = Attention::new(
            cfg.d_model,
            cfg.encoder_attention_heads,
            cfg.attention_dropout,
            vb.pp("self_attn"),
        )?;
        Ok(Self {
            self_attn,
            self_attn_block: Residual::new(cfg, vb.pp("self_attn_layer_norm"))?,
            ffn: FeedForward::new(cfg, cfg.encoder_ffn_dim, &vb)?,
            ffn_block: Residual::new(cfg, vb.pp("final_layer_norm"))?,
        })
    }

    pub fn forward(&self, xs: &Tensor, padding_mask: Option<&Tensor>, train: bool) -> Result<Tensor> {
        let xs = self.self_attn_block.forward(xs, train, |xs| {
            self.self_attn.forward(xs, None, padding_mask, train)
        })?;
        self.ffn_block
            .forward(&xs, train, |xs| self.ffn.forward(xs, train))
    }
}

#[derive(Debug, Clone)]
pub struct DecoderLayer {
    self_attn: Attention,
    self_attn_block: Residual,
    encoder_attn: Attention,
    encoder_attn_block: Residual,
    ffn: FeedForward,
    ffn_block: Residual,
}

impl DecoderLayer {
    pub fn new(cfg: &TransformerConfig, vb: VarBuilder) -> Result<Self> {
        let self_attn = Attention::new(
            cfg.d_model,
            cfg.decoder_attention_heads,
            cfg.attention_dropout,
            vb.pp("self_attn"),
        )?;
        let encoder_attn = Attention::new(
            cfg.d_model,
            cfg.decoder_attention_heads,
            cfg.attention_dropout,
            vb.pp("encoder_attn"),
        )?;
        Ok(Self {
            self_attn,
            self_attn_block: Residual::new(cfg, vb.pp("self_attn_layer_norm"))?,
            encoder_attn,
            encoder_attn_block: Residual::new(cfg, vb.pp("encoder_attn_layer_norm"))?,
            ffn: FeedForward::new(cfg, cfg.decoder_ffn_dim, &vb)?,
            ffn_block: Residual::new(cfg, vb.pp("final_layer_norm"))?,
        })
    }

    /// Bidirectional self-attention over the target, then cross-attention.
    pub fn forward(
        &self,
        xs: &Tensor,
        self_padding_mask: Option<&Tensor>,
        encoder_out: &EncoderOut,
        train: bool,
    ) -> Result<Tensor> {
        let xs = self.self_attn_block.forward(xs, train, |xs| {
            self.self_attn.forward(xs, None, self_padding_mask, train)
        })?;
        let xs = self.encoder_attn_block.forward(&xs, train, |xs| {
            self.encoder_attn.forward(
                xs,
                Some(&encoder_out.encoder_out),
                encoder_out.encoder_padding_mask.as_ref(),
                train,
            )
        })?;
        self.ffn_block
            .forward(&xs, train, |xs| self.ffn.forward(xs, train))
    }
}

#[derive(Debug, Clone)]
pub struct TransformerEncoder {
    embed_tokens: Embedding,
    embed_positions: SinusoidalPositionalEmbedding,
    embed_scale: f64,
    layers: Vec<EncoderLayer>,
    layer_norm: Option<LayerNorm>,
    dropout: Dropout,
    padding_idx: u32,
    span: tracing::Span,
}

impl TransformerEncoder {
    pub fn new(
        cfg: &TransformerConfig,
        embed_tokens: Embedding,
        padding_idx: u32,
        vb: VarBuilder,
    ) -> Result<Self> {
        let embed_positions = SinusoidalPositionalEmbedding::new(
            cfg.max_source_positions,
            cfg.d_model,
            padding_idx,
            vb.dtype(),
            vb.device(),
        )?;
        let vb_l = vb.pp("layers");
        let layers = (0..cfg.encoder_layers)
            .map(|i| EncoderLayer::new(cfg, vb_l.pp(i)))
            .collect::<Result<Vec<_>>>()?;
        let layer_norm = if cfg.normalize_before {
            Some(layer_norm(cfg.d_model, cfg.layer_norm_eps, vb.pp("layer_norm"))?)
        } else {
            None
        };
        let embed_scale = if cfg.scale_embedding {
            (cfg.d_model as f64).sqrt()
        } else {
            1.0
        };
        Ok(Self {
            embed_tokens,
            embed_positions,
            embed_scale,
            layers,
            layer_norm,
            dropout: Dropout::new(cfg.dropout),
            padding_idx,
            span: tracing::span!(tracing::Level::TRACE, "encoder"),
        })
    }
}

impl SourceEncoder for TransformerEncoder {
    fn encode(&self, src_tokens: &Tensor, train: bool) -> Result<EncoderOut> {
        let _enter = self.span.enter();
        let embedding = (self.embed_tokens.forward(src_tokens)? * self.embed_scale)?;
        let xs = (&embedding + self.embed_positions.forward(src_tokens)?)?;
        let mut xs = self.dropout.forward(&xs, train)?;
        let mask = padding_mask(src_tokens, self.padding_idx)?;
        for layer in self.layers.iter() {
            xs = layer.forward(&xs, Some(&mask), train)?;
        }
        if let Some(layer_norm) = &self.layer_norm {
            xs = xs.apply(layer_norm)?;
        }
        Ok(EncoderOut::new(xs)
            .with_padding_mask(mask)
            .with_embedding(embedding))
    }
}

/// Mean over the time axis that ignores padded positions.
pub fn masked_mean(xs: &Tensor, padding_mask: Option<&Tensor>) -> Result<Tensor> {
    match padding_mask {
        None => xs.mean(1),
        Some(mask) => {
            let keep = mask.ones_like()?.sub(mask)?.to_dtype(xs.dtype())?;
            let summed = xs.broadcast_mul(&keep.unsqueeze(D::Minus1)?)?.sum(1)?;
            // all-pad rows average to zero
            let counts = keep.sum_keepdim(1)?.maximum(1f64)?;
            summed.broadcast_div(&counts)
        }
    }
}
