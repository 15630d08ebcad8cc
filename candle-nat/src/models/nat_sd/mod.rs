//! Self-conditioned non-autoregressive translation (NAT-SD).
//!
//! A non-autoregressive transformer decoder where every layer predicts a token
//! distribution and feeds it back, as an embedding-space signal, into the input
//! of the next layer. Two training objectives share the same decoder core:
//!
//! | Objective | Output length | Training signal | Inference |
//! |-----------|---------------|-----------------|-----------|
//! | CTC | upsampled source length | CTC alignment loss on every layer | CTC beam search (or plain argmax) |
//! | Token NLL | predicted by the length head | per-layer NLL with glancing training | argmax over the inference layer |
//!
//! ```text
//! src tokens ─► encoder ─► length head / upsampling ─► skeleton [bos unk .. unk eos pad ..]
//!                  │                                        │
//!                  └──────────────► decoder layer 0 ◄───────┘
//!                                       │ logits ─► y_hat ─┐
//!                                   blend(x, y_hat) ◄──────┘
//!                                       ▼
//!                                 decoder layer 1 ... ─► per-layer logits
//! ```
//!
//! During training the glancing controller can run a no-gradient probe pass,
//! reveal part of the reference to the decoder input and derive per-layer
//! blending weights from the probe's accuracy.

pub mod ctc;
pub mod ctc_loss;
pub mod decoder;
pub mod glancing;
pub mod length;
pub mod model;
pub mod skeleton;
pub mod state;
pub mod transformer;

use candle::Result;
use candle_nn::Activation;
use serde::Deserialize;

// ============================================================================
// Special tokens
// ============================================================================

fn default_bos() -> u32 {
    0
}
fn default_pad() -> u32 {
    1
}
fn default_eos() -> u32 {
    2
}
fn default_unk() -> u32 {
    3
}

/// Ids of the reserved symbols of the target dictionary.
///
/// Defaults follow the fairseq dictionary layout (`<s>`, `<pad>`, `</s>`, `<unk>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SpecialTokens {
    #[serde(default = "default_bos")]
    pub bos: u32,
    #[serde(default = "default_pad")]
    pub pad: u32,
    #[serde(default = "default_eos")]
    pub eos: u32,
    #[serde(default = "default_unk")]
    pub unk: u32,
    /// CTC blank symbol. Only the CTC objective needs it.
    #[serde(default)]
    pub blank: Option<u32>,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            bos: 0,
            pad: 1,
            eos: 2,
            unk: 3,
            blank: None,
        }
    }
}

impl SpecialTokens {
    pub fn blank(&self) -> Result<u32> {
        match self.blank {
            Some(blank) => Ok(blank),
            None => candle::bail!("the CTC objective requires a blank token id in the dictionary"),
        }
    }

    pub fn is_special(&self, token: u32) -> bool {
        token == self.bos || token == self.pad || token == self.eos
    }
}

// ============================================================================
// Transformer body
// ============================================================================

fn default_d_model() -> usize {
    512
}
fn default_layers() -> usize {
    6
}
fn default_attention_heads() -> usize {
    8
}
fn default_ffn_dim() -> usize {
    2048
}
fn default_activation() -> Activation {
    Activation::Relu
}
fn default_dropout() -> f32 {
    0.1
}
fn default_zero() -> f32 {
    0.0
}
fn default_true() -> bool {
    true
}
fn default_max_positions() -> usize {
    1024
}
fn default_layer_norm_eps() -> f64 {
    1e-5
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TransformerConfig {
    /// Size of the target dictionary (including the blank symbol for CTC).
    pub vocab_size: usize,
    /// Size of the source dictionary. `None` shares the decoder embedding table.
    #[serde(default)]
    pub src_vocab_size: Option<usize>,
    #[serde(default = "default_d_model")]
    pub d_model: usize,
    #[serde(default = "default_layers")]
    pub encoder_layers: usize,
    #[serde(default = "default_attention_heads")]
    pub encoder_attention_heads: usize,
    #[serde(default = "default_ffn_dim")]
    pub encoder_ffn_dim: usize,
    #[serde(default = "default_layers")]
    pub decoder_layers: usize,
    #[serde(default = "default_attention_heads")]
    pub decoder_attention_heads: usize,
    #[serde(default = "default_ffn_dim")]
    pub decoder_ffn_dim: usize,
    #[serde(default = "default_activation")]
    pub activation_function: Activation,
    #[serde(default = "default_dropout")]
    pub dropout: f32,
    #[serde(default = "default_zero")]
    pub attention_dropout: f32,
    #[serde(default = "default_zero")]
    pub activation_dropout: f32,
    /// Pre-norm residual blocks plus a final layer norm on each stack.
    #[serde(default)]
    pub normalize_before: bool,
    /// Multiply token embeddings by `sqrt(d_model)`.
    #[serde(default = "default_true")]
    pub scale_embedding: bool,
    /// Tie the decoder output projection to the decoder embedding table.
    #[serde(default)]
    pub share_decoder_input_output_embed: bool,
    #[serde(default = "default_max_positions")]
    pub max_source_positions: usize,
    #[serde(default = "default_max_positions")]
    pub max_target_positions: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
}

impl TransformerConfig {
    /// transformer-base sized body (512 hidden, 8 heads, 6+6 layers).
    pub fn base(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            src_vocab_size: None,
            d_model: 512,
            encoder_layers: 6,
            encoder_attention_heads: 8,
            encoder_ffn_dim: 2048,
            decoder_layers: 6,
            decoder_attention_heads: 8,
            decoder_ffn_dim: 2048,
            activation_function: Activation::Relu,
            dropout: 0.1,
            attention_dropout: 0.0,
            activation_dropout: 0.0,
            normalize_before: false,
            scale_embedding: true,
            share_decoder_input_output_embed: false,
            max_source_positions: 1024,
            max_target_positions: 1024,
            layer_norm_eps: 1e-5,
        }
    }

    pub fn src_vocab_size(&self) -> usize {
        self.src_vocab_size.unwrap_or(self.vocab_size)
    }
}

// ============================================================================
// Component configurations
// ============================================================================

fn default_yhat_temp() -> f64 {
    0.1
}

/// How a layer's logits are turned into the embedding-space feedback signal.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct SelfConditioningConfig {
    /// Feed back the embedding of the argmax token instead of the soft mixture.
    #[serde(default)]
    pub hard_argmax: bool,
    /// Softmax temperature of the soft feedback.
    #[serde(default = "default_yhat_temp")]
    pub yhat_temp: f64,
}

impl Default for SelfConditioningConfig {
    fn default() -> Self {
        Self {
            hard_argmax: false,
            yhat_temp: 0.1,
        }
    }
}

/// Where the output skeleton length comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LengthSource {
    /// `target_len = count_nonpad(src) * scale`.
    Upsample { scale: usize },
    /// Greedy argmax of the length prediction head.
    Predicted,
}

impl Default for LengthSource {
    fn default() -> Self {
        LengthSource::Upsample { scale: 1 }
    }
}

fn default_length_loss_factor() -> f64 {
    0.1
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct LengthConfig {
    #[serde(default)]
    pub source: LengthSource,
    /// With upsampling, repeat the source tokens instead of building a
    /// `bos unk .. eos` skeleton.
    #[serde(default)]
    pub copy_src_token: bool,
    /// Predict `target_len - source_len + 128` instead of the absolute length.
    #[serde(default)]
    pub pred_length_offset: bool,
    /// Stop gradients from the length head into the encoder.
    #[serde(default)]
    pub sg_length_pred: bool,
    #[serde(default = "default_length_loss_factor")]
    pub length_loss_factor: f64,
    /// Initialise the first refinement step from uniformly copied source embeddings.
    #[serde(default)]
    pub src_embedding_copy: bool,
}

impl Default for LengthConfig {
    fn default() -> Self {
        Self {
            source: LengthSource::default(),
            copy_src_token: false,
            pred_length_offset: false,
            sg_length_pred: false,
            length_loss_factor: 0.1,
            src_embedding_copy: false,
        }
    }
}

/// Per-layer blending weight derived by the glancing controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightSchedule {
    /// `sqrt(layer_accuracy) / 2`, per example.
    #[default]
    Accuracy,
    /// `min(0.5, 10 * train_ratio)`.
    FixedRatio,
    /// Constant `0.5`.
    ConstantHalf,
}

/// Input token placed at positions the glancing mask keeps hidden.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepSource {
    /// The probe pass's own prediction.
    #[default]
    Prediction,
    /// The untouched skeleton token (usually `unk`).
    Skeleton,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub struct GlancingConfig {
    #[serde(default)]
    pub weight_schedule: WeightSchedule,
    #[serde(default)]
    pub keep_source: KeepSource,
}

fn default_one() -> usize {
    1
}
fn default_cutoff_top_n() -> usize {
    40
}
fn default_cutoff_prob() -> f64 {
    1.0
}
fn default_num_workers() -> usize {
    20
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct CtcConfig {
    /// Beam width used at inference.
    #[serde(default = "default_one")]
    pub beam_size: usize,
    /// Beam width used when decoding with `train == true`.
    #[serde(default = "default_one")]
    pub beam_size_train: usize,
    /// Only the `n` most likely symbols of a frame, blank included, are considered.
    #[serde(default = "default_cutoff_top_n")]
    pub cutoff_top_n: usize,
    /// Cumulative probability mass kept per frame.
    #[serde(default = "default_cutoff_prob")]
    pub cutoff_prob: f64,
    /// Worker threads used to decode a batch.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,
    /// Number of cross-layer samples in the loss, `0` averages over layers.
    #[serde(default)]
    pub num_cross_layer_sample: usize,
    /// Skip beam search and fill the skeleton with per-position argmax.
    #[serde(default)]
    pub plain_ctc: bool,
}

impl Default for CtcConfig {
    fn default() -> Self {
        Self {
            beam_size: 1,
            beam_size_train: 1,
            cutoff_top_n: 40,
            cutoff_prob: 1.0,
            num_workers: 20,
            num_cross_layer_sample: 0,
            plain_ctc: false,
        }
    }
}

/// Training objective, which also selects the inference path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Objective {
    #[default]
    Ctc,
    TokenNll,
}

fn default_inference_decoder_layer() -> i64 {
    -1
}

/// Full NAT-SD configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Config {
    pub transformer: TransformerConfig,
    #[serde(default)]
    pub special_tokens: SpecialTokens,
    #[serde(default)]
    pub self_conditioning: SelfConditioningConfig,
    #[serde(default)]
    pub length: LengthConfig,
    #[serde(default)]
    pub glancing: GlancingConfig,
    #[serde(default)]
    pub ctc: CtcConfig,
    #[serde(default)]
    pub objective: Objective,
    /// Layer whose logits are decoded, negative values index from the end.
    #[serde(default = "default_inference_decoder_layer")]
    pub inference_decoder_layer: i64,
    #[serde(default)]
    pub label_smoothing: f64,
}

impl Config {
    /// CTC model with 6 decoder layers.
    pub fn nat_ctc_sd(vocab_size: usize, blank: u32) -> Self {
        Self {
            transformer: TransformerConfig::base(vocab_size),
            special_tokens: SpecialTokens {
                blank: Some(blank),
                ..SpecialTokens::default()
            },
            self_conditioning: SelfConditioningConfig::default(),
            length: LengthConfig::default(),
            glancing: GlancingConfig::default(),
            ctc: CtcConfig::default(),
            objective: Objective::Ctc,
            inference_decoder_layer: -1,
            label_smoothing: 0.0,
        }
    }

    pub fn nat_ctc_sd_12d(vocab_size: usize, blank: u32) -> Self {
        let mut cfg = Self::nat_ctc_sd(vocab_size, blank);
        cfg.transformer.decoder_layers = 12;
        cfg
    }

    pub fn nat_ctc_sd_24d(vocab_size: usize, blank: u32) -> Self {
        let mut cfg = Self::nat_ctc_sd(vocab_size, blank);
        cfg.transformer.decoder_layers = 24;
        cfg
    }

    /// Glancing-trained model with a length prediction head and 6 decoder layers.
    pub fn nat_sd_glat_anneal(vocab_size: usize) -> Self {
        Self {
            transformer: TransformerConfig::base(vocab_size),
            special_tokens: SpecialTokens::default(),
            self_conditioning: SelfConditioningConfig::default(),
            length: LengthConfig {
                source: LengthSource::Predicted,
                ..LengthConfig::default()
            },
            glancing: GlancingConfig::default(),
            ctc: CtcConfig::default(),
            objective: Objective::TokenNll,
            inference_decoder_layer: -1,
            label_smoothing: 0.0,
        }
    }

    pub fn nat_sd_glat_anneal_12d(vocab_size: usize) -> Self {
        let mut cfg = Self::nat_sd_glat_anneal(vocab_size);
        cfg.transformer.decoder_layers = 12;
        cfg
    }

    pub fn nat_sd_glat_anneal_24d(vocab_size: usize) -> Self {
        let mut cfg = Self::nat_sd_glat_anneal(vocab_size);
        cfg.transformer.decoder_layers = 24;
        cfg
    }

    /// 12 encoder layers, 6 decoder layers.
    pub fn nat_sd_glat_anneal_12e(vocab_size: usize) -> Self {
        let mut cfg = Self::nat_sd_glat_anneal(vocab_size);
        cfg.transformer.encoder_layers = 12;
        cfg
    }

    /// Resolve `inference_decoder_layer` against the number of logits produced.
    pub fn inference_layer_index(&self, num_logits: usize) -> Result<usize> {
        let idx = self.inference_decoder_layer;
        let resolved = if idx < 0 { num_logits as i64 + idx } else { idx };
        if resolved < 0 || resolved >= num_logits as i64 {
            candle::bail!(
                "inference decoder layer {idx} out of range for {num_logits} layer outputs"
            )
        }
        Ok(resolved as usize)
    }
}

pub use ctc::{CtcBeam, CtcBeamDecoder, CtcBeamOutput};
pub use ctc_loss::{ctc_loss, CtcLossOutput, CtcTargets};
pub use decoder::{DecoderOptions, DecoderOutput, Feedback, NatDecoder};
pub use glancing::{GlancingController, GlancingOutput, GlatMode, GlatStats};
pub use length::LengthPredictor;
pub use model::{NatBatch, NatModel, NatTrainOutput};
pub use state::DecoderOut;
pub use transformer::{EncoderOut, SourceEncoder, TransformerEncoder};
