use candle::{test_device, DType, Device, Result, Tensor, D};
use candle_nn::{VarBuilder, VarMap};
use rand::{rngs::StdRng, SeedableRng};

use candle_nat::models::nat_sd::skeleton::{length_beam_order, non_pad_lengths, skeleton_from_lengths};
use candle_nat::models::nat_sd::{
    Config, DecoderOptions, DecoderOut, EncoderOut, Feedback, GlancingController, GlatMode,
    KeepSource, LengthSource, NatBatch, NatModel, Objective,
};

const VOCAB: usize = 12;
const BLANK: u32 = 4;

fn tiny(mut cfg: Config) -> Config {
    let t = &mut cfg.transformer;
    t.d_model = 16;
    t.encoder_layers = 1;
    t.encoder_attention_heads = 2;
    t.encoder_ffn_dim = 32;
    t.decoder_layers = 3;
    t.decoder_attention_heads = 2;
    t.decoder_ffn_dim = 32;
    t.dropout = 0.0;
    cfg.ctc.num_workers = 2;
    cfg
}

fn ctc_config(scale: usize) -> Config {
    let mut cfg = tiny(Config::nat_ctc_sd(VOCAB, BLANK));
    cfg.length.source = LengthSource::Upsample { scale };
    cfg
}

fn glat_config() -> Config {
    tiny(Config::nat_sd_glat_anneal(VOCAB))
}

fn build(cfg: &Config, dev: &Device) -> Result<(NatModel, VarMap)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, dev);
    let model = NatModel::new(cfg, vb)?;
    Ok((model, varmap))
}

fn assert_skeleton(tokens: &Tensor, cfg: &Config) -> Result<()> {
    let special = cfg.special_tokens;
    for row in tokens.to_vec2::<u32>()? {
        let len = row.iter().filter(|&&t| t != special.pad).count();
        assert!(len >= 2);
        assert_eq!(row[0], special.bos);
        assert_eq!(row[len - 1], special.eos);
        assert!(row[1..len - 1].iter().all(|&t| t == special.unk));
        assert!(row[len..].iter().all(|&t| t == special.pad));
    }
    Ok(())
}

fn initialize_upsampled(dev: &Device) -> Result<()> {
    let cfg = ctc_config(2);
    let (model, _varmap) = build(&cfg, dev)?;
    let src = Tensor::new(&[[5u32, 6, 7, 8, 2], [5, 6, 2, 1, 1]], dev)?;
    let enc = model.encode(&src, false)?;
    let state = model.initialize_output_tokens(&enc, &src)?;
    assert_eq!(state.output_tokens.dims(), [2, 10]);
    assert_eq!(non_pad_lengths(&state.output_tokens, 1)?, [10, 6]);
    assert_skeleton(&state.output_tokens, &cfg)?;
    assert_eq!(state.output_scores.sum_all()?.to_scalar::<f32>()?, 0.0);
    assert_eq!(state.step, 0);
    Ok(())
}

fn initialize_predicted(dev: &Device) -> Result<()> {
    let cfg = glat_config();
    let (model, _varmap) = build(&cfg, dev)?;
    let src = Tensor::new(&[[5u32, 6, 7, 2], [8, 2, 1, 1]], dev)?;
    let enc = model.encode(&src, false)?;
    let state = model.initialize_output_tokens(&enc, &src)?;
    assert_eq!(state.output_tokens.dim(0)?, 2);
    assert_skeleton(&state.output_tokens, &cfg)
}

fn logits_count_with_early_exit(dev: &Device) -> Result<()> {
    let cfg = glat_config();
    let (model, _varmap) = build(&cfg, dev)?;
    let src = Tensor::new(&[[5u32, 6, 7, 2]], dev)?;
    let enc = model.encode(&src, false)?;
    let prev = skeleton_from_lengths(&[5], &cfg.special_tokens, dev)?;
    let decoder = model.decoder();
    for early_exit in 1..=decoder.num_layers() {
        let opts = DecoderOptions {
            early_exit: Some(early_exit),
            ..DecoderOptions::default()
        };
        let out = decoder.extract_features(&prev, &enc, &opts, false)?;
        assert_eq!(out.num_logits(), early_exit + 1);
        assert_eq!(out.all_logits().len(), early_exit + 1);
        assert_eq!(out.layer_logits.len(), early_exit);
        assert_eq!(out.layer_logits[0].dims(), [1, 5, VOCAB]);
    }
    for early_exit in [0, decoder.num_layers() + 1] {
        let opts = DecoderOptions {
            early_exit: Some(early_exit),
            ..DecoderOptions::default()
        };
        assert!(decoder.extract_features(&prev, &enc, &opts, false).is_err());
    }
    Ok(())
}

fn forward_decoder_deterministic(dev: &Device) -> Result<()> {
    for cfg in [glat_config(), ctc_config(2)] {
        let (model, _varmap) = build(&cfg, dev)?;
        let src = Tensor::new(&[[5u32, 6, 7, 2], [9, 10, 2, 1]], dev)?;
        let enc = model.encode(&src, false)?;
        let state = model.initialize_output_tokens(&enc, &src)?.with_history();
        let first = model.forward_decoder(&state, &enc)?;
        let second = model.forward_decoder(&state, &enc)?;
        assert_eq!(
            first.output_tokens.to_vec2::<u32>()?,
            second.output_tokens.to_vec2::<u32>()?
        );
        assert_eq!(
            first.output_scores.to_vec2::<f32>()?,
            second.output_scores.to_vec2::<f32>()?
        );
        assert_eq!(first.output_tokens.dims(), state.output_tokens.dims());
        assert_eq!(first.history.as_ref().map(|h| h.len()), Some(2));
        // the input state is never modified
        assert_eq!(state.history.as_ref().map(|h| h.len()), Some(1));
    }
    Ok(())
}

fn ctc_output_is_pad_filled_best_beam(dev: &Device) -> Result<()> {
    let cfg = ctc_config(2);
    let (model, _varmap) = build(&cfg, dev)?;
    let src = Tensor::new(&[[5u32, 6, 7, 2], [9, 2, 1, 1]], dev)?;
    let enc = model.encode(&src, false)?;
    let state = model.initialize_output_tokens(&enc, &src)?;
    let next = model.forward_decoder(&state, &enc)?;
    assert_eq!(next.output_tokens.dims(), state.output_tokens.dims());
    for row in next.output_tokens.to_vec2::<u32>()? {
        assert!(row.iter().all(|&t| t != BLANK));
    }
    let scores = next.output_scores.flatten_all()?.to_vec1::<f32>()?;
    assert!(scores.iter().all(|&s| s == 1.0));
    Ok(())
}

fn plain_ctc_keeps_blanks_and_repeats(dev: &Device) -> Result<()> {
    let mut cfg = ctc_config(2);
    cfg.ctc.plain_ctc = true;
    let (model, _varmap) = build(&cfg, dev)?;
    let src = Tensor::new(&[[5u32, 6, 7, 2], [9, 2, 1, 1]], dev)?;
    let enc = model.encode(&src, false)?;
    let state = model.initialize_output_tokens(&enc, &src)?;
    let next = model.forward_decoder(&state, &enc)?;

    let logits = model
        .decoder()
        .forward(&state.output_tokens, &enc, &DecoderOptions::default(), false, false)?;
    let layer = &logits[cfg.inference_layer_index(logits.len())?];
    let argmax = layer.argmax(D::Minus1)?.to_vec2::<u32>()?;
    let best = layer.max(D::Minus1)?.to_vec2::<f32>()?;

    let before = state.output_tokens.to_vec2::<u32>()?;
    let tokens = next.output_tokens.to_vec2::<u32>()?;
    let scores = next.output_scores.to_vec2::<f32>()?;
    assert_eq!(next.output_tokens.dims(), state.output_tokens.dims());
    for b in 0..before.len() {
        for t in 0..before[b].len() {
            if before[b][t] == cfg.special_tokens.pad {
                assert_eq!(tokens[b][t], cfg.special_tokens.pad);
                assert_eq!(scores[b][t], 0.0);
            } else {
                // no collapse: every position keeps its own argmax, blank included
                assert_eq!(tokens[b][t], argmax[b][t]);
                assert_eq!(scores[b][t], best[b][t]);
            }
        }
    }
    assert_eq!(non_pad_lengths(&next.output_tokens, 1)?, non_pad_lengths(&state.output_tokens, 1)?);
    Ok(())
}

fn hard_feedback_is_argmax_embedding(dev: &Device) -> Result<()> {
    let mut cfg = glat_config();
    cfg.self_conditioning.hard_argmax = true;
    let (model, _varmap) = build(&cfg, dev)?;
    let decoder = model.decoder();
    assert_eq!(decoder.feedback(), Feedback::Hard);

    let ids = [[7u32, 0, 11], [3, 3, 5]];
    let mut data = vec![0f32; 2 * 3 * VOCAB];
    for (b, row) in ids.iter().enumerate() {
        for (t, &id) in row.iter().enumerate() {
            data[(b * 3 + t) * VOCAB + id as usize] = 2.5;
        }
    }
    let logits = Tensor::from_vec(data, (2, 3, VOCAB), dev)?;
    let feedback = decoder.feedback_embedding(&logits)?;
    assert_eq!(feedback.dims(), [2, 3, 16]);
    let flat_ids = Tensor::new(&[7u32, 0, 11, 3, 3, 5], dev)?;
    let expected = decoder.embed_tokens().embeddings().index_select(&flat_ids, 0)?;
    assert_eq!(
        feedback.reshape((6, 16))?.to_vec2::<f32>()?,
        expected.to_vec2::<f32>()?
    );

    // every decoder pass still runs end to end on hard feedback
    let src = Tensor::new(&[[5u32, 6, 7, 2]], dev)?;
    let enc = model.encode(&src, false)?;
    let state = model.initialize_output_tokens(&enc, &src)?;
    let next = model.forward_decoder(&state, &enc)?;
    assert_eq!(next.output_tokens.dims(), state.output_tokens.dims());
    Ok(())
}

fn source_embedding_copy_on_first_step(dev: &Device) -> Result<()> {
    let mut cfg = glat_config();
    cfg.length.src_embedding_copy = true;
    let (model, _varmap) = build(&cfg, dev)?;
    let decoder = model.decoder();
    let src = Tensor::new(&[[5u32, 6, 7, 8, 2], [9, 2, 1, 1, 1]], dev)?;
    let enc = model.encode(&src, false)?;
    let prev = skeleton_from_lengths(&[5, 3], &cfg.special_tokens, dev)?;

    let copied = decoder.forward_copying_source(&enc, &prev)?;
    let src_embeds = match &enc.encoder_embedding {
        Some(embeds) => embeds.to_vec3::<f32>()?,
        None => candle::bail!("encoder embeddings missing"),
    };
    let copied_rows = copied.to_vec3::<f32>()?;
    // source lengths 5 and 2 spread over target lengths 5 and 3, pads read position 0
    let expected = [[0usize, 1, 2, 3, 4], [0, 0, 1, 0, 0]];
    for b in 0..2 {
        for t in 0..5 {
            assert_eq!(copied_rows[b][t], src_embeds[b][expected[b][t]]);
        }
    }

    let first = decoder.extract_features(&prev, &enc, &DecoderOptions::default(), false)?;
    let (with_copy, _) = decoder.forward_embedding(&prev, Some(&copied), false)?;
    assert_eq!(first.inner_states[0].to_vec3::<f32>()?, with_copy.to_vec3::<f32>()?);

    let opts = DecoderOptions {
        step: 1,
        ..DecoderOptions::default()
    };
    let later = decoder.extract_features(&prev, &enc, &opts, false)?;
    let (from_tokens, _) = decoder.forward_embedding(&prev, None, false)?;
    assert_eq!(later.inner_states[0].to_vec3::<f32>()?, from_tokens.to_vec3::<f32>()?);
    assert_ne!(with_copy.to_vec3::<f32>()?, from_tokens.to_vec3::<f32>()?);

    // with a length beam the copy follows the reordered encoder output
    let tokens = skeleton_from_lengths(&[4, 3], &cfg.special_tokens, dev)?;
    let scores = tokens.zeros_like()?.to_dtype(DType::F32)?;
    let beam = model.regenerate_length_beam(&DecoderOut::new(tokens, scores), 3)?;
    let enc = enc.index_select(&length_beam_order(2, 3))?;
    let next = model.forward_decoder(&beam, &enc)?;
    assert_eq!(next.output_tokens.dims(), [6, 5]);
    Ok(())
}

/// Skeleton input, the decoder's own prediction for it and the encoder output.
fn glancing_setup(model: &NatModel, dev: &Device) -> Result<(Tensor, Vec<Vec<u32>>, EncoderOut)> {
    let src = Tensor::new(&[[5u32, 6, 7, 8, 2], [9, 10, 2, 1, 1]], dev)?;
    let enc = model.encode(&src, true)?;
    let prev = skeleton_from_lengths(&[5, 3], &model.config().special_tokens, dev)?;
    let logits = model
        .decoder()
        .forward(&prev, &enc, &DecoderOptions::default(), false, true)?;
    let pred = match logits.last() {
        Some(last) => last.argmax(D::Minus1)?.to_vec2::<u32>()?,
        None => candle::bail!("decoder produced no logits"),
    };
    Ok((prev, pred, enc))
}

fn glancing_mask_semantics(dev: &Device) -> Result<()> {
    let cfg = glat_config();
    let (model, _varmap) = build(&cfg, dev)?;
    let special = cfg.special_tokens;
    let (prev, pred, enc) = glancing_setup(&model, dev)?;
    let skeleton = prev.to_vec2::<u32>()?;
    let mut rng = StdRng::seed_from_u64(5);

    // a reference the decoder misses everywhere keeps every position at context_p = 1
    let missed: Vec<Vec<u32>> = pred
        .iter()
        .map(|row| row.iter().map(|&p| if p == 5 { 6 } else { 5 }).collect())
        .collect();
    let tgt = Tensor::new(missed.clone(), dev)?;
    for keep_source in [KeepSource::Prediction, KeepSource::Skeleton] {
        let mut glancing = cfg.glancing;
        glancing.keep_source = keep_source;
        let controller = GlancingController::new(model.decoder(), glancing, special);
        let out = controller.glance(&enc, &prev, &tgt, GlatMode::ContextP(1.0), 0.0, &mut rng)?;
        assert_eq!(out.stats.keep_prob, 1.0);
        assert_eq!(out.stats.accuracy, 0.0);
        assert_eq!(out.layer_weights.len(), cfg.transformer.decoder_layers);
        let glat_prev = out.prev_output_tokens.to_vec2::<u32>()?;
        let glat_tgt = out.tgt_tokens.to_vec2::<u32>()?;
        for b in 0..2 {
            for t in 0..5 {
                let expected = match keep_source {
                    KeepSource::Prediction if !special.is_special(skeleton[b][t]) => pred[b][t],
                    _ => skeleton[b][t],
                };
                assert_eq!(glat_prev[b][t], expected);
                assert_eq!(glat_tgt[b][t], special.pad);
            }
        }
    }

    // nothing is kept at context_p = 0
    let controller = GlancingController::new(model.decoder(), cfg.glancing, special);
    let out = controller.glance(&enc, &prev, &tgt, GlatMode::ContextP(0.0), 0.0, &mut rng)?;
    assert_eq!(out.stats.keep_prob, 0.0);
    assert_eq!(out.prev_output_tokens.to_vec2::<u32>()?, missed);
    assert_eq!(out.tgt_tokens.to_vec2::<u32>()?, missed);

    // partial keeping: kept positions lose their target, revealed ones take the reference
    let out = controller.glance(&enc, &prev, &tgt, GlatMode::ContextP(0.5), 0.0, &mut rng)?;
    let glat_prev = out.prev_output_tokens.to_vec2::<u32>()?;
    let glat_tgt = out.tgt_tokens.to_vec2::<u32>()?;
    for b in 0..2 {
        for t in 0..5 {
            if glat_tgt[b][t] == special.pad {
                let expected = if special.is_special(skeleton[b][t]) {
                    skeleton[b][t]
                } else {
                    pred[b][t]
                };
                assert_eq!(glat_prev[b][t], expected);
            } else {
                assert_eq!(glat_prev[b][t], missed[b][t]);
                assert_eq!(glat_tgt[b][t], missed[b][t]);
            }
        }
    }
    Ok(())
}

fn glancing_exact_match_keeps_nothing(dev: &Device) -> Result<()> {
    let cfg = glat_config();
    let (model, _varmap) = build(&cfg, dev)?;
    let pad = cfg.special_tokens.pad;
    let (prev, pred, enc) = glancing_setup(&model, dev)?;
    let skeleton = prev.to_vec2::<u32>()?;

    // the reference equals the prediction on non-pad positions, whatever the prediction
    // is on the skeleton's padding
    let matched: Vec<Vec<u32>> = pred
        .iter()
        .zip(skeleton.iter())
        .map(|(p, s)| {
            p.iter()
                .zip(s.iter())
                .map(|(&p, &s)| if s == pad { pad } else { p })
                .collect()
        })
        .collect();
    let tgt = Tensor::new(matched.clone(), dev)?;
    let controller = GlancingController::new(model.decoder(), cfg.glancing, cfg.special_tokens);
    let mut rng = StdRng::seed_from_u64(9);
    let out = controller.glance(&enc, &prev, &tgt, GlatMode::ContextP(1.0), 0.0, &mut rng)?;
    assert_eq!(out.stats.keep_prob, 0.0);
    if matched.iter().flatten().any(|&t| t != pad) {
        assert_eq!(out.stats.accuracy, 1.0);
    }
    assert_eq!(out.prev_output_tokens.to_vec2::<u32>()?, matched);
    assert_eq!(out.tgt_tokens.to_vec2::<u32>()?, matched);
    Ok(())
}

fn ctc_training_loss(dev: &Device) -> Result<()> {
    let cfg = ctc_config(2);
    let (model, _varmap) = build(&cfg, dev)?;
    let mut rng = StdRng::seed_from_u64(42);
    // source length 5 upsampled to 10 output positions, target eos at column 3
    let batch = NatBatch {
        src_tokens: Tensor::new(&[[5u32, 6, 7, 8, 2], [9, 10, 2, 1, 1]], dev)?,
        prev_output_tokens: None,
        tgt_tokens: Tensor::new(&[[5u32, 6, 7, 2], [9, 2, 1, 1]], dev)?,
    };
    let out = model.forward_t(&batch, None, None, &mut rng, true)?;
    let loss = out.loss.to_scalar::<f32>()?;
    assert!(loss.is_finite() && loss >= 0.0, "{loss}");
    assert_eq!(out.n_invalid_ctc, 0);
    assert_eq!(out.losses.len(), 1);
    assert!(out.glat.is_none());
    Ok(())
}

fn ctc_invalid_examples_are_counted(dev: &Device) -> Result<()> {
    let cfg = ctc_config(1);
    let (model, _varmap) = build(&cfg, dev)?;
    let mut rng = StdRng::seed_from_u64(0);
    let batch = NatBatch {
        src_tokens: Tensor::new(&[[5u32, 2, 1, 1], [5, 6, 7, 2]], dev)?,
        prev_output_tokens: None,
        tgt_tokens: Tensor::new(&[[5u32, 6, 7, 8, 9, 2], [5, 6, 2, 1, 1, 1]], dev)?,
    };
    let out = model.forward_t(&batch, None, None, &mut rng, true)?;
    assert_eq!(out.n_invalid_ctc, 1);
    let loss = out.loss.to_scalar::<f32>()?;
    assert!(loss.is_finite() && loss >= 0.0, "{loss}");
    Ok(())
}

fn ctc_cross_layer_sampling(dev: &Device) -> Result<()> {
    let mut cfg = ctc_config(2);
    cfg.ctc.num_cross_layer_sample = 3;
    let (model, _varmap) = build(&cfg, dev)?;
    let mut rng = StdRng::seed_from_u64(7);
    let batch = NatBatch {
        src_tokens: Tensor::new(&[[5u32, 6, 7, 2]], dev)?,
        prev_output_tokens: None,
        tgt_tokens: Tensor::new(&[[6u32, 6, 2]], dev)?,
    };
    let out = model.forward_t(&batch, None, None, &mut rng, true)?;
    let loss = out.loss.to_scalar::<f32>()?;
    assert!(loss.is_finite() && loss >= 0.0, "{loss}");
    Ok(())
}

fn glat_training_step(dev: &Device) -> Result<()> {
    let cfg = glat_config();
    let (model, varmap) = build(&cfg, dev)?;
    let mut rng = StdRng::seed_from_u64(3);
    let batch = NatBatch {
        src_tokens: Tensor::new(&[[5u32, 6, 7, 8, 2], [9, 10, 2, 1, 1]], dev)?,
        prev_output_tokens: None,
        tgt_tokens: Tensor::new(&[[0u32, 5, 6, 7, 2], [0, 9, 2, 1, 1]], dev)?,
    };
    let out = model.forward_t(&batch, Some(GlatMode::ContextP(0.5)), Some(0.1), &mut rng, true)?;
    let stats = match &out.glat {
        Some(stats) => stats,
        None => candle::bail!("glancing statistics missing"),
    };
    assert!((0.0..=0.5).contains(&stats.keep_prob));
    assert!((0.0..=1.0).contains(&stats.accuracy));
    assert_eq!(stats.context_p, 0.5);
    assert_eq!(stats.layer_accuracy.len(), cfg.transformer.decoder_layers);
    // length loss plus one token loss per decoder layer
    assert_eq!(out.losses.len(), cfg.transformer.decoder_layers + 1);
    assert_eq!(out.losses[0].0, "length");
    let loss = out.loss.to_scalar::<f32>()?;
    assert!(loss.is_finite() && loss > 0.0, "{loss}");

    let grads = out.loss.backward()?;
    let vars = varmap.data().lock().unwrap();
    for name in [
        "decoder.embed_tokens.weight",
        "decoder.embed_length.weight",
        "decoder.layers.0.self_attn.q_proj.weight",
        "encoder.layers.0.fc1.weight",
    ] {
        let var = match vars.get(name) {
            Some(var) => var,
            None => candle::bail!("missing variable {name}"),
        };
        assert!(grads.get(var.as_tensor()).is_some(), "no gradient for {name}");
    }
    Ok(())
}

fn glat_schedule_mode_fails(dev: &Device) -> Result<()> {
    let cfg = glat_config();
    let (model, _varmap) = build(&cfg, dev)?;
    let mut rng = StdRng::seed_from_u64(3);
    let batch = NatBatch {
        src_tokens: Tensor::new(&[[5u32, 6, 2]], dev)?,
        prev_output_tokens: None,
        tgt_tokens: Tensor::new(&[[0u32, 5, 2]], dev)?,
    };
    assert!(model
        .forward_t(&batch, Some(GlatMode::Schedule(0.3)), None, &mut rng, true)
        .is_err());
    Ok(())
}

fn length_beam_refinement(dev: &Device) -> Result<()> {
    let cfg = glat_config();
    let (model, _varmap) = build(&cfg, dev)?;
    let src = Tensor::new(&[[5u32, 6, 7, 2], [8, 9, 2, 1]], dev)?;
    let enc = model.encode(&src, false)?;
    let tokens = skeleton_from_lengths(&[6, 2], &cfg.special_tokens, dev)?;
    let scores = tokens.zeros_like()?.to_dtype(DType::F32)?;
    let state = DecoderOut::new(tokens, scores).with_step(0, 4);

    let beam = model.regenerate_length_beam(&state, 3)?;
    assert_eq!(non_pad_lengths(&beam.output_tokens, 1)?, [5, 6, 7, 2, 2, 3]);
    assert_skeleton(&beam.output_tokens, &cfg)?;
    assert_eq!(beam.max_step, 4);

    let enc = enc.index_select(&length_beam_order(2, 3))?;
    assert_eq!(enc.batch_size()?, 6);
    let next = model.forward_decoder(&beam.with_step(1, 4), &enc)?;
    assert_eq!(next.output_tokens.dims(), [6, 7]);
    assert_eq!(next.step, 1);
    Ok(())
}

fn ctc_search_results(dev: &Device) -> Result<()> {
    let cfg = ctc_config(3);
    let (model, _varmap) = build(&cfg, dev)?;
    let src = Tensor::new(&[[5u32, 6, 2], [7, 2, 1]], dev)?;
    let enc = model.encode(&src, false)?;
    let state = model.initialize_output_tokens(&enc, &src)?;
    let (tokens, scores) = model.search_results(&state, &enc, Some(2))?;
    let (b_sz, beam, _) = tokens.dims3()?;
    assert_eq!((b_sz, beam), (2, 2));
    assert_eq!(scores.dims(), [2, 2]);
    let scores = scores.to_vec2::<f32>()?;
    for row in scores.iter() {
        assert!(row[0] <= row[1]);
    }

    let glat = glat_config();
    let (model, _varmap) = build(&glat, dev)?;
    let enc = model.encode(&src, false)?;
    let state = model.initialize_output_tokens(&enc, &src)?;
    assert!(model.search_results(&state, &enc, None).is_err());
    Ok(())
}

fn ctc_requires_blank(dev: &Device) -> Result<()> {
    let mut cfg = ctc_config(2);
    cfg.special_tokens.blank = None;
    assert!(build(&cfg, dev).is_err());
    cfg.objective = Objective::TokenNll;
    assert!(build(&cfg, dev).is_ok());
    Ok(())
}

test_device!(initialize_upsampled, initialize_upsampled_cpu, initialize_upsampled_gpu, initialize_upsampled_metal);
test_device!(initialize_predicted, initialize_predicted_cpu, initialize_predicted_gpu, initialize_predicted_metal);
test_device!(
    logits_count_with_early_exit,
    logits_count_with_early_exit_cpu,
    logits_count_with_early_exit_gpu,
    logits_count_with_early_exit_metal
);
test_device!(
    forward_decoder_deterministic,
    forward_decoder_deterministic_cpu,
    forward_decoder_deterministic_gpu,
    forward_decoder_deterministic_metal
);
test_device!(
    ctc_output_is_pad_filled_best_beam,
    ctc_output_is_pad_filled_best_beam_cpu,
    ctc_output_is_pad_filled_best_beam_gpu,
    ctc_output_is_pad_filled_best_beam_metal
);
test_device!(ctc_training_loss, ctc_training_loss_cpu, ctc_training_loss_gpu, ctc_training_loss_metal);
test_device!(
    ctc_invalid_examples_are_counted,
    ctc_invalid_examples_are_counted_cpu,
    ctc_invalid_examples_are_counted_gpu,
    ctc_invalid_examples_are_counted_metal
);
test_device!(
    ctc_cross_layer_sampling,
    ctc_cross_layer_sampling_cpu,
    ctc_cross_layer_sampling_gpu,
    ctc_cross_layer_sampling_metal
);
test_device!(glat_training_step, glat_training_step_cpu, glat_training_step_gpu, glat_training_step_metal);
test_device!(
    glat_schedule_mode_fails,
    glat_schedule_mode_fails_cpu,
    glat_schedule_mode_fails_gpu,
    glat_schedule_mode_fails_metal
);
test_device!(
    length_beam_refinement,
    length_beam_refinement_cpu,
    length_beam_refinement_gpu,
    length_beam_refinement_metal
);
test_device!(ctc_search_results, ctc_search_results_cpu, ctc_search_results_gpu, ctc_search_results_metal);
test_device!(ctc_requires_blank, ctc_requires_blank_cpu, ctc_requires_blank_gpu, ctc_requires_blank_metal);
test_device!(
    plain_ctc_keeps_blanks_and_repeats,
    plain_ctc_keeps_blanks_and_repeats_cpu,
    plain_ctc_keeps_blanks_and_repeats_gpu,
    plain_ctc_keeps_blanks_and_repeats_metal
);
test_device!(
    hard_feedback_is_argmax_embedding,
    hard_feedback_is_argmax_embedding_cpu,
    hard_feedback_is_argmax_embedding_gpu,
    hard_feedback_is_argmax_embedding_metal
);
test_device!(
    source_embedding_copy_on_first_step,
    source_embedding_copy_on_first_step_cpu,
    source_embedding_copy_on_first_step_gpu,
    source_embedding_copy_on_first_step_metal
);
test_device!(
    glancing_mask_semantics,
    glancing_mask_semantics_cpu,
    glancing_mask_semantics_gpu,
    glancing_mask_semantics_metal
);
test_device!(
    glancing_exact_match_keeps_nothing,
    glancing_exact_match_keeps_nothing_cpu,
    glancing_exact_match_keeps_nothing_gpu,
    glancing_exact_match_keeps_nothing_metal
);
