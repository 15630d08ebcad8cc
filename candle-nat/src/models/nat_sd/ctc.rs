//! CTC prefix beam search over decoder output probabilities.
//!
//! Every beam is a collapsed token prefix with two log probabilities: paths
//! ending in blank and paths ending in the prefix's last token. Prefixes
//! reached through different alignments are merged. Examples of a batch are
//! decoded in parallel on a dedicated thread pool.
use std::collections::HashMap;
use std::sync::Arc;

use candle::{DType, Device, Result, Tensor};
use rayon::prelude::*;

use super::CtcConfig;

/// One decoded hypothesis.
#[derive(Debug, Clone, PartialEq)]
pub struct CtcBeam {
    pub tokens: Vec<u32>,
    /// Frame at which each token was first emitted.
    pub timesteps: Vec<usize>,
    /// Negative log probability of the prefix, lower is better.
    pub score: f32,
}

impl CtcBeam {
    fn empty() -> Self {
        Self {
            tokens: vec![],
            timesteps: vec![],
            score: f32::INFINITY,
        }
    }
}

/// Beams of a batch, `beam_width` per example sorted best first.
#[derive(Debug, Clone)]
pub struct CtcBeamOutput {
    pub beams: Vec<Vec<CtcBeam>>,
}

impl CtcBeamOutput {
    pub fn best(&self, batch_idx: usize) -> Option<&CtcBeam> {
        self.beams.get(batch_idx).and_then(|beams| beams.first())
    }

    /// Token count of every beam, `[B][beam]`.
    pub fn output_lengths(&self) -> Vec<Vec<usize>> {
        self.beams
            .iter()
            .map(|beams| beams.iter().map(|b| b.tokens.len()).collect())
            .collect()
    }

    /// Best hypothesis per example as `[B, width]`, padded with `pad`.
    pub fn top_tokens(&self, width: usize, pad: u32, device: &Device) -> Result<Tensor> {
        let mut data = Vec::with_capacity(self.beams.len() * width);
        for beams in self.beams.iter() {
            let tokens = beams.first().map(|b| b.tokens.as_slice()).unwrap_or(&[]);
            if tokens.len() > width {
                candle::bail!("decoded {} tokens into {width} positions", tokens.len())
            }
            data.extend_from_slice(tokens);
            data.extend(std::iter::repeat_n(pad, width - tokens.len()));
        }
        Tensor::from_vec(data, (self.beams.len(), width), device)
    }

    /// Every beam as `[B, beam, L]` (pad filled, `L` the longest beam, at least 1)
    /// and the beam scores `[B, beam]`.
    pub fn beam_tensors(&self, pad: u32, device: &Device) -> Result<(Tensor, Tensor)> {
        let b_sz = self.beams.len();
        let beam = self.beams.first().map_or(0, |b| b.len());
        if self.beams.iter().any(|b| b.len() != beam) {
            candle::bail!("examples carry a different number of beams")
        }
        let max_len = self
            .beams
            .iter()
            .flatten()
            .map(|b| b.tokens.len())
            .max()
            .unwrap_or(0)
            .max(1);
        let mut tokens = Vec::with_capacity(b_sz * beam * max_len);
        let mut scores = Vec::with_capacity(b_sz * beam);
        for hyp in self.beams.iter().flatten() {
            tokens.extend_from_slice(&hyp.tokens);
            tokens.extend(std::iter::repeat_n(pad, max_len - hyp.tokens.len()));
            scores.push(hyp.score);
        }
        let tokens = Tensor::from_vec(tokens, (b_sz, beam, max_len), device)?;
        let scores = Tensor::from_vec(scores, (b_sz, beam), device)?;
        Ok((tokens, scores))
    }
}

struct BeamState {
    p_blank: f32,
    p_non_blank: f32,
    timesteps: Vec<usize>,
}

impl BeamState {
    fn new(timesteps: Vec<usize>) -> Self {
        Self {
            p_blank: f32::NEG_INFINITY,
            p_non_blank: f32::NEG_INFINITY,
            timesteps,
        }
    }

    fn total_prob(&self) -> f32 {
        log_sum_exp(self.p_blank, self.p_non_blank)
    }
}

/// Log-sum-exp of two log probabilities
fn log_sum_exp(a: f32, b: f32) -> f32 {
    if a == f32::NEG_INFINITY {
        b
    } else if b == f32::NEG_INFINITY {
        a
    } else {
        let max = a.max(b);
        max + ((a - max).exp() + (b - max).exp()).ln()
    }
}

#[derive(Debug, Clone)]
pub struct CtcBeamDecoder {
    blank_id: u32,
    beam_width: usize,
    cutoff_top_n: usize,
    cutoff_prob: f64,
    pool: Arc<rayon::ThreadPool>,
    span: tracing::Span,
}

impl CtcBeamDecoder {
    pub fn new(
        blank_id: u32,
        beam_width: usize,
        cutoff_top_n: usize,
        cutoff_prob: f64,
        num_workers: usize,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_workers.max(1))
            .thread_name(|i| format!("ctc-decode-{i}"))
            .build()
            .map_err(candle::Error::wrap)?;
        Ok(Self {
            blank_id,
            beam_width: beam_width.max(1),
            cutoff_top_n: cutoff_top_n.max(1),
            cutoff_prob,
            pool: Arc::new(pool),
            span: tracing::span!(tracing::Level::TRACE, "ctc-beam"),
        })
    }

    pub fn from_config(cfg: &CtcConfig, blank_id: u32) -> Result<Self> {
        Self::new(
            blank_id,
            cfg.beam_size,
            cfg.cutoff_top_n,
            cfg.cutoff_prob,
            cfg.num_workers,
        )
    }

    pub fn beam_width(&self) -> usize {
        self.beam_width
    }

    pub fn set_beam_width(&mut self, beam_width: usize) {
        self.beam_width = beam_width.max(1)
    }

    /// A decoder sharing this one's thread pool with another beam width.
    pub fn with_beam_width(&self, beam_width: usize) -> Self {
        let mut decoder = self.clone();
        decoder.set_beam_width(beam_width);
        decoder
    }

    /// Decode `[B, T, V]` probabilities, example `b` reading its first `lengths[b]` frames.
    /// Blocks until the whole batch is decoded.
    pub fn decode(&self, probs: &Tensor, lengths: &[usize]) -> Result<CtcBeamOutput> {
        let _enter = self.span.enter();
        let (b_sz, t_max, vocab) = probs.dims3()?;
        if lengths.len() != b_sz {
            candle::bail!("{} lengths for a batch of {b_sz}", lengths.len())
        }
        if let Some(&len) = lengths.iter().find(|&&l| l > t_max) {
            candle::bail!("length {len} exceeds the {t_max} decoded frames")
        }
        if self.blank_id as usize >= vocab {
            candle::bail!("blank id {} outside a vocabulary of {vocab}", self.blank_id)
        }
        let probs = probs.to_dtype(DType::F32)?.to_vec3::<f32>()?;
        let beams = self.pool.install(|| {
            probs
                .par_iter()
                .zip(lengths.par_iter())
                .map(|(frames, &len)| self.decode_sequence(&frames[..len]))
                .collect::<Vec<_>>()
        });
        Ok(CtcBeamOutput { beams })
    }

    /// Non-blank symbols allowed to extend beams at this frame.
    ///
    /// Symbols are ranked with blank included: at most `cutoff_top_n` of them,
    /// stopping once their cumulative mass reaches `cutoff_prob`. Blank is then
    /// dropped from the list, it always extends every beam.
    fn candidates(&self, frame: &[f32]) -> Vec<usize> {
        let blank = self.blank_id as usize;
        let mut ids: Vec<usize> = (0..frame.len()).collect();
        ids.sort_by(|&a, &b| frame[b].total_cmp(&frame[a]));
        ids.truncate(self.cutoff_top_n);
        if self.cutoff_prob < 1.0 {
            let mut cumulative = 0f64;
            let mut keep = 0;
            for &i in ids.iter() {
                cumulative += frame[i] as f64;
                keep += 1;
                if cumulative >= self.cutoff_prob {
                    break;
                }
            }
            ids.truncate(keep);
        }
        ids.retain(|&i| i != blank);
        ids
    }

    fn decode_sequence(&self, frames: &[Vec<f32>]) -> Vec<CtcBeam> {
        let blank = self.blank_id as usize;
        let mut beams: Vec<(Vec<u32>, BeamState)> = vec![(
            vec![],
            BeamState {
                p_blank: 0.0,
                p_non_blank: f32::NEG_INFINITY,
                timesteps: vec![],
            },
        )];

        for (t, frame) in frames.iter().enumerate() {
            let log_frame: Vec<f32> = frame.iter().map(|p| p.ln()).collect();
            let candidates = self.candidates(frame);
            let mut next: HashMap<Vec<u32>, BeamState> = HashMap::new();

            for (prefix, beam) in beams.iter() {
                let p_total = beam.total_prob();

                // blank keeps the prefix
                let entry = next
                    .entry(prefix.clone())
                    .or_insert_with(|| BeamState::new(beam.timesteps.clone()));
                entry.p_blank = log_sum_exp(entry.p_blank, p_total + log_frame[blank]);

                // repeating the last token collapses onto the same prefix
                let last = prefix.last().copied();
                if let Some(last) = last {
                    entry.p_non_blank = log_sum_exp(
                        entry.p_non_blank,
                        beam.p_non_blank + log_frame[last as usize],
                    );
                }

                for &c in candidates.iter() {
                    let c = c as u32;
                    // the same token twice needs a blank in between
                    let p = if Some(c) == last {
                        beam.p_blank + log_frame[c as usize]
                    } else {
                        p_total + log_frame[c as usize]
                    };
                    let mut new_prefix = prefix.clone();
                    new_prefix.push(c);
                    let entry = next.entry(new_prefix).or_insert_with(|| {
                        let mut timesteps = beam.timesteps.clone();
                        timesteps.push(t);
                        BeamState::new(timesteps)
                    });
                    entry.p_non_blank = log_sum_exp(entry.p_non_blank, p);
                }
            }

            let mut beam_vec: Vec<(Vec<u32>, BeamState)> = next.into_iter().collect();
            beam_vec.sort_by(|a, b| {
                b.1.total_prob()
                    .total_cmp(&a.1.total_prob())
                    .then_with(|| a.0.cmp(&b.0))
            });
            beam_vec.truncate(self.beam_width);
            beams = beam_vec;
        }

        let mut out: Vec<CtcBeam> = beams
            .into_iter()
            .map(|(tokens, state)| CtcBeam {
                score: -state.total_prob(),
                tokens,
                timesteps: state.timesteps,
            })
            .collect();
        out.resize_with(self.beam_width, CtcBeam::empty);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames_tensor(frames: &[Vec<f32>]) -> Result<Tensor> {
        let t = frames.len();
        let v = frames[0].len();
        let data: Vec<f32> = frames.iter().flatten().copied().collect();
        Tensor::from_vec(data, (1, t, v), &Device::Cpu)
    }

    fn peaked(ids: &[usize], vocab: usize) -> Vec<Vec<f32>> {
        ids.iter()
            .map(|&i| {
                let mut row = vec![0.02f32; vocab];
                row[i] = 1.0 - 0.02 * (vocab - 1) as f32;
                row
            })
            .collect()
    }

    #[test]
    fn test_collapse_and_blank_separation() -> Result<()> {
        let decoder = CtcBeamDecoder::new(0, 4, 40, 1.0, 2)?;
        let out = decoder.decode(&frames_tensor(&peaked(&[1, 1, 0, 2, 2], 4))?, &[5])?;
        assert_eq!(out.best(0).map(|b| b.tokens.clone()), Some(vec![1, 2]));
        assert_eq!(out.best(0).map(|b| b.timesteps.clone()), Some(vec![0, 3]));

        let out = decoder.decode(&frames_tensor(&peaked(&[3, 0, 3], 4))?, &[3])?;
        assert_eq!(out.best(0).map(|b| b.tokens.clone()), Some(vec![3, 3]));
        Ok(())
    }

    #[test]
    fn test_exact_prefix_probability() -> Result<()> {
        // no pruning: the best beam carries the summed probability of its alignments
        let frames = vec![
            vec![0.5f32, 0.3, 0.2],
            vec![0.4, 0.4, 0.2],
            vec![0.3, 0.5, 0.2],
        ];
        let decoder = CtcBeamDecoder::new(0, 50, 40, 1.0, 1)?;
        let out = decoder.decode(&frames_tensor(&frames)?, &[3])?;

        let mut by_prefix: HashMap<Vec<u32>, f64> = HashMap::new();
        for code in 0..27usize {
            let path = [code % 3, (code / 3) % 3, code / 9];
            let mut prefix = vec![];
            let mut prev = None;
            for &s in path.iter() {
                if s != 0 && Some(s) != prev {
                    prefix.push(s as u32);
                }
                prev = Some(s);
            }
            let p: f64 = path.iter().enumerate().map(|(t, &s)| frames[t][s] as f64).product();
            *by_prefix.entry(prefix).or_default() += p;
        }
        let (best_prefix, best_p) = by_prefix
            .iter()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(k, v)| (k.clone(), *v))
            .unwrap_or_default();
        let best = out.best(0).cloned().unwrap_or_else(CtcBeam::empty);
        assert_eq!(best.tokens, best_prefix);
        assert!((best.score as f64 + best_p.ln()).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn test_batch_lengths_and_padding() -> Result<()> {
        let mut data = peaked(&[1, 0, 2, 2], 3);
        data.extend(peaked(&[2, 2, 1, 1], 3));
        let flat: Vec<f32> = data.iter().flatten().copied().collect();
        let probs = Tensor::from_vec(flat, (2, 4, 3), &Device::Cpu)?;
        let decoder = CtcBeamDecoder::new(0, 3, 40, 1.0, 2)?;
        // the second example stops after two frames
        let out = decoder.decode(&probs, &[4, 2])?;
        assert_eq!(out.beams.len(), 2);
        assert!(out.beams.iter().all(|b| b.len() == 3));
        for beams in out.beams.iter() {
            assert!(beams.windows(2).all(|w| w[0].score <= w[1].score));
        }
        let top = out.top_tokens(4, 9, &Device::Cpu)?;
        assert_eq!(top.to_vec2::<u32>()?, [[1, 2, 9, 9], [2, 9, 9, 9]]);
        let (tokens, scores) = out.beam_tensors(9, &Device::Cpu)?;
        assert_eq!(tokens.dims()[..2], [2, 3]);
        assert_eq!(scores.dims(), &[2, 3]);
        assert!(decoder.decode(&probs, &[5, 2]).is_err());
        Ok(())
    }

    #[test]
    fn test_cutoff_and_beam_width() -> Result<()> {
        let decoder = CtcBeamDecoder::new(0, 2, 1, 1.0, 1)?;
        assert_eq!(decoder.candidates(&[0.1, 0.2, 0.6, 0.1]), [2]);
        // a dominant blank uses up the single slot
        assert!(decoder.candidates(&[0.5, 0.1, 0.3, 0.1]).is_empty());
        let wide = decoder.with_beam_width(5);
        assert_eq!(wide.beam_width(), 5);
        assert_eq!(decoder.beam_width(), 2);
        let decoder = CtcBeamDecoder::new(0, 2, 40, 0.5, 1)?;
        assert_eq!(decoder.candidates(&[0.1, 0.3, 0.4, 0.2]), [2, 1]);
        // blank mass counts towards the cutoff
        assert_eq!(decoder.candidates(&[0.45, 0.1, 0.3, 0.15]), [2]);
        assert!(decoder.candidates(&[0.6, 0.1, 0.2, 0.1]).is_empty());
        Ok(())
    }
}
