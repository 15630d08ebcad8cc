//! Non-autoregressive translation with a self-conditioned NAT decoder.
//!
//! Runs iterative refinement over every line of the input file and prints the
//! best hypothesis of each line.
//!
//! ```bash
//! cargo run --example nat_sd --release -- \
//!     --config config.json --weights model.safetensors \
//!     --vocab dict.txt --input source.txt --length-beam 3
//!
//! # smoke test with random weights
//! cargo run --example nat_sd --release -- \
//!     --preset nat-ctc-sd --random-init --vocab dict.txt --input source.txt --cpu
//! ```

use anyhow::Result;
use candle::{DType, Tensor};
use candle_nn::{VarBuilder, VarMap};
use clap::Parser;

use candle_nat::models::nat_sd::skeleton::length_beam_order;
use candle_nat::models::nat_sd::{Config, DecoderOut, NatModel, Objective};
use candle_nat_examples::Vocab;

#[derive(Clone, Copy, Debug, Default, clap::ValueEnum)]
enum Preset {
    /// CTC objective, upsampled source length
    #[default]
    NatCtcSd,
    NatCtcSd12d,
    NatCtcSd24d,
    /// Glancing-trained, predicted length
    NatSdGlatAnneal,
    NatSdGlatAnneal12d,
    NatSdGlatAnneal24d,
    NatSdGlatAnneal12e,
}

impl Preset {
    fn config(&self, vocab: &Vocab) -> Result<Config> {
        let size = vocab.len();
        let blank = || match vocab.blank() {
            Some(blank) => Ok(blank),
            None => anyhow::bail!("CTC presets need a dictionary loaded with --blank"),
        };
        let cfg = match self {
            Self::NatCtcSd => Config::nat_ctc_sd(size, blank()?),
            Self::NatCtcSd12d => Config::nat_ctc_sd_12d(size, blank()?),
            Self::NatCtcSd24d => Config::nat_ctc_sd_24d(size, blank()?),
            Self::NatSdGlatAnneal => Config::nat_sd_glat_anneal(size),
            Self::NatSdGlatAnneal12d => Config::nat_sd_glat_anneal_12d(size),
            Self::NatSdGlatAnneal24d => Config::nat_sd_glat_anneal_24d(size),
            Self::NatSdGlatAnneal12e => Config::nat_sd_glat_anneal_12e(size),
        };
        Ok(cfg)
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,

    /// JSON model configuration, overrides --preset.
    #[arg(long)]
    config: Option<String>,

    #[arg(long, value_enum, default_value = "nat-ctc-sd")]
    preset: Preset,

    /// Model weights in safetensors format, fairseq parameter names.
    #[arg(long)]
    weights: Option<String>,

    /// Initialise the model randomly instead of loading weights.
    #[arg(long)]
    random_init: bool,

    /// Target dictionary in fairseq `dict.txt` format.
    #[arg(long)]
    vocab: String,

    /// Append a `<blank>` symbol to the dictionary (CTC models).
    #[arg(long)]
    blank: bool,

    /// Source sentences, one tokenized sentence per line.
    #[arg(long)]
    input: String,

    /// Maximum number of refinement steps.
    #[arg(long, default_value_t = 10)]
    max_iter: usize,

    /// Number of length candidates decoded per sentence.
    #[arg(long, default_value_t = 1)]
    length_beam: usize,

    /// CTC beam width at inference.
    #[arg(long)]
    ctc_beam: Option<usize>,

    /// Decoder layer whose logits are decoded, negative values index from the end.
    #[arg(long)]
    inference_layer: Option<i64>,

    /// Sentences per batch.
    #[arg(long, default_value_t = 16)]
    batch_size: usize,
}

/// Mean score over the non-pad positions of every row.
fn average_scores(state: &DecoderOut, pad: u32) -> Result<Vec<f32>> {
    let tokens = state.output_tokens.to_vec2::<u32>()?;
    let scores = state.output_scores.to_dtype(DType::F32)?.to_vec2::<f32>()?;
    Ok(tokens
        .iter()
        .zip(scores.iter())
        .map(|(tokens, scores)| {
            let (sum, count) = tokens
                .iter()
                .zip(scores.iter())
                .filter(|(&t, _)| t != pad)
                .fold((0f32, 0usize), |(sum, count), (_, &s)| (sum + s, count + 1));
            sum / count.max(1) as f32
        })
        .collect())
}

fn translate(
    model: &NatModel,
    src_tokens: &Tensor,
    args: &Args,
) -> Result<Vec<Vec<u32>>> {
    let cfg = model.config();
    let b_sz = src_tokens.dim(0)?;
    let mut encoder_out = model.encode(src_tokens, false)?;
    let mut state = model.initialize_output_tokens(&encoder_out, src_tokens)?;
    let beam = if model.allow_length_beam() {
        args.length_beam.max(1)
    } else {
        1
    };
    if beam > 1 {
        state = model.regenerate_length_beam(&state, beam)?;
        encoder_out = encoder_out.index_select(&length_beam_order(b_sz, beam))?;
    }

    for step in 0..args.max_iter {
        let next = model.forward_decoder(&state.with_step(step, args.max_iter), &encoder_out)?;
        let converged = next.output_tokens.dims() == state.output_tokens.dims()
            && next.output_tokens.to_vec2::<u32>()? == state.output_tokens.to_vec2::<u32>()?;
        state = next;
        tracing::debug!(step, converged, "refinement step");
        if converged {
            break;
        }
    }

    let pad = cfg.special_tokens.pad;
    let scores = average_scores(&state, pad)?;
    let tokens = state.output_tokens.to_vec2::<u32>()?;
    let mut best = Vec::with_capacity(b_sz);
    for b in 0..b_sz {
        let candidates = b * beam..(b + 1) * beam;
        let idx = candidates
            .max_by(|&i, &j| scores[i].total_cmp(&scores[j]))
            .unwrap_or(b * beam);
        best.push(tokens[idx].clone());
    }
    Ok(best)
}

fn main() -> Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();
    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        None
    };

    let device = candle_nat_examples::device(args.cpu)?;
    let vocab = Vocab::from_dict_file(&args.vocab, args.blank)?;
    let mut cfg = match &args.config {
        Some(path) => serde_json::from_slice::<Config>(&std::fs::read(path)?)?,
        None => args.preset.config(&vocab)?,
    };
    if cfg.transformer.vocab_size != vocab.len() {
        anyhow::bail!(
            "model vocabulary {} does not match the dictionary size {}",
            cfg.transformer.vocab_size,
            vocab.len()
        )
    }
    if let Some(beam) = args.ctc_beam {
        cfg.ctc.beam_size = beam;
    }
    if let Some(layer) = args.inference_layer {
        cfg.inference_decoder_layer = layer;
    }

    let start = std::time::Instant::now();
    let varmap = VarMap::new();
    let vb = match (&args.weights, args.random_init) {
        (_, true) => VarBuilder::from_varmap(&varmap, DType::F32, &device),
        (Some(weights), false) => unsafe {
            VarBuilder::from_mmaped_safetensors(&[weights], DType::F32, &device)?
        },
        (None, false) => anyhow::bail!("either --weights or --random-init is required"),
    };
    let model = NatModel::new(&cfg, vb)?;
    println!(
        "loaded the model in {:?}, {} decoder layers, {} objective",
        start.elapsed(),
        model.decoder().num_layers(),
        match cfg.objective {
            Objective::Ctc => "ctc",
            Objective::TokenNll => "token nll",
        }
    );

    let lines: Vec<String> = std::fs::read_to_string(&args.input)?
        .lines()
        .map(str::to_string)
        .filter(|l| !l.trim().is_empty())
        .collect();
    let start = std::time::Instant::now();
    for chunk in lines.chunks(args.batch_size.max(1)) {
        let src_tokens = vocab.batch(chunk, &device)?;
        for (line, hypo) in chunk.iter().zip(translate(&model, &src_tokens, &args)?) {
            println!("S\t{line}");
            println!("H\t{}", vocab.decode(&hypo));
        }
    }
    println!("translated {} sentences in {:?}", lines.len(), start.elapsed());
    Ok(())
}
