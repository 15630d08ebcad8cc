//! Refinement state exchanged with an iterative decoding driver.
use candle::Tensor;

/// Decoder state between refinement steps.
///
/// Updates never touch an existing value: every `with_*` method returns a new
/// state, so snapshots kept by the driver stay valid.
#[derive(Debug, Clone)]
pub struct DecoderOut {
    /// `[B, T]` u32 tokens.
    pub output_tokens: Tensor,
    /// `[B, T]` per-token scores.
    pub output_scores: Tensor,
    pub attn: Option<Tensor>,
    pub step: usize,
    pub max_step: usize,
    /// Output tokens after every step, `None` when history is not tracked.
    pub history: Option<Vec<Tensor>>,
}

impl DecoderOut {
    pub fn new(output_tokens: Tensor, output_scores: Tensor) -> Self {
        Self {
            output_tokens,
            output_scores,
            attn: None,
            step: 0,
            max_step: 0,
            history: None,
        }
    }

    /// Start tracking history, seeded with the current tokens.
    pub fn with_history(&self) -> Self {
        Self {
            history: Some(vec![self.output_tokens.clone()]),
            ..self.clone()
        }
    }

    pub fn with_step(&self, step: usize, max_step: usize) -> Self {
        Self {
            step,
            max_step,
            ..self.clone()
        }
    }

    /// Replace tokens and scores, appending the new tokens to the history if tracked.
    pub fn with_output(&self, output_tokens: Tensor, output_scores: Tensor) -> Self {
        let history = self.history.as_ref().map(|history| {
            let mut history = history.clone();
            history.push(output_tokens.clone());
            history
        });
        Self {
            output_tokens,
            output_scores,
            attn: None,
            step: self.step,
            max_step: self.max_step,
            history,
        }
    }
}
