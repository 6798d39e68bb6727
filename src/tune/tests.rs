use super::*;
use crate::autograd::{mean, mse_loss, Tensor};
use crate::model::{BlockSequence, QuantExec, QuantModel, SampleContext, SequentialModel};
use crate::quant::{
    GroupSize, LayerConfigMap, LayerQuantInfo, QuantConfig, WrapperRegistry, WrapperSnapshot,
};
use approx::assert_abs_diff_eq;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const HIDDEN: usize = 8;

fn model() -> SequentialModel {
    SequentialModel::new(16, HIDDEN, 12, 3, 11).unwrap()
}

fn inputs(n: usize, seed: u64) -> Vec<Array2<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| Array2::from_shape_simple_fn((4, HIDDEN), || rng.random::<f32>() * 2.0 - 1.0))
        .collect()
}

fn layer_config(model: &SequentialModel, bits: u32) -> LayerConfigMap {
    let mut map = LayerConfigMap::new();
    for name in model.linear_names() {
        let config = QuantConfig::new(bits, GroupSize::PerChannel, true);
        map.insert(name, LayerQuantInfo::from_config(&config));
    }
    map
}

/// Whole-population batches so every iteration sees the same loss surface
fn full_batch_settings(nsamples: usize) -> TuneSettings {
    TuneSettings {
        iters: 25,
        batch_size: nsamples,
        lr: 0.05,
        enable_minmax_tuning: false,
        sampler: SamplerKind::Fixed,
        ..TuneSettings::default()
    }
}

fn single_block(model: &SequentialModel, index: usize) -> WindowSegments<'_> {
    WindowSegments {
        fine_tune: BlockSequence::from_model(model, &[format!("model.layers.{index}")]).unwrap(),
        ..WindowSegments::default()
    }
}

/// Mean window loss with the given snapshot loaded into fresh wrappers
fn replay_loss(
    segments: &WindowSegments<'_>,
    xs: &[Array2<f32>],
    outcome: &WindowOutcome,
    contexts: &[SampleContext],
    config: &LayerConfigMap,
    snapshot: &WrapperSnapshot,
) -> f32 {
    let mut registry = WrapperRegistry::new(false);
    for name in segments.fine_tune.linear_names() {
        let layer = segments.fine_tune.linear(&name).unwrap();
        registry.wrap(&name, layer, config.get(&name).unwrap().quant_config()).unwrap();
    }
    registry.load_snapshot(snapshot).unwrap();
    let losses: Vec<Tensor> = xs
        .iter()
        .zip(&outcome.fp_outputs)
        .zip(contexts)
        .map(|((x, target), ctx)| {
            let mut exec = QuantExec::new(&registry);
            let q = segments
                .fine_tune
                .forward(&Tensor::from_array2(x, false), ctx, &mut exec)
                .unwrap();
            mse_loss(&q, &Tensor::from_array2(target, false)).unwrap()
        })
        .collect();
    mean(&losses).unwrap().item()
}

#[test]
fn test_best_snapshot_reproduces_best_loss() {
    let m = model();
    let segments = single_block(&m, 0);
    let xs = inputs(6, 1);
    let contexts = vec![SampleContext::default(); xs.len()];
    let config = layer_config(&m, 2);
    let outcome = tune_window(
        &segments,
        &xs,
        None,
        &contexts,
        &config,
        &full_batch_settings(xs.len()),
    )
    .unwrap();
    let tuning = outcome.tuning.as_ref().expect("block has trainable layers");

    let min = tuning.loss_history.iter().copied().fold(f32::INFINITY, f32::min);
    assert_eq!(tuning.best_loss, min);
    assert_eq!(tuning.loss_history[tuning.best_iter], tuning.best_loss);
    assert!(tuning.best_loss <= tuning.init_loss);

    let best = tuning.best.as_ref().unwrap();
    let replayed = replay_loss(&segments, &xs, &outcome, &contexts, &config, best);
    assert_abs_diff_eq!(replayed, tuning.best_loss, epsilon = 1e-5);
}

#[test]
fn test_best_snapshot_reproduces_best_loss_with_minmax_tuning() {
    let m = model();
    let segments = single_block(&m, 0);
    let xs = inputs(6, 1);
    let contexts = vec![SampleContext::default(); xs.len()];
    let config = layer_config(&m, 2);
    let settings = TuneSettings {
        enable_minmax_tuning: true,
        minmax_lr: 0.05,
        ..full_batch_settings(xs.len())
    };
    let outcome = tune_window(&segments, &xs, None, &contexts, &config, &settings).unwrap();
    let tuning = outcome.tuning.as_ref().unwrap();

    let best = tuning.best.as_ref().unwrap();
    for layer in &best.layers {
        let scales = layer.min_scale.iter().chain(layer.max_scale.iter());
        assert!(scales.copied().all(|x| (0.0..=1.0).contains(&x)));
    }
    let replayed = replay_loss(&segments, &xs, &outcome, &contexts, &config, best);
    assert_abs_diff_eq!(replayed, tuning.best_loss, epsilon = 1e-5);
}

#[test]
fn test_tuning_lowers_loss_and_folds_every_layer() {
    let m = model();
    let segments = single_block(&m, 1);
    let xs = inputs(8, 2);
    let contexts = vec![SampleContext::default(); xs.len()];
    let settings = TuneSettings {
        iters: 40,
        batch_size: 4,
        lr: 0.02,
        ..TuneSettings::default()
    };
    let outcome =
        tune_window(&segments, &xs, None, &contexts, &layer_config(&m, 2), &settings).unwrap();
    let tuning = outcome.tuning.unwrap();
    assert_eq!(tuning.iterations_run, 40);
    assert_eq!(tuning.loss_history.len(), 40);
    assert!(tuning.final_loss <= tuning.init_loss);
    assert_eq!(
        tuning.folded.iter().map(|l| l.name.clone()).collect::<Vec<_>>(),
        segments.fine_tune.linear_names()
    );
    for folded in &tuning.folded {
        let original = segments.fine_tune.linear(&folded.name).unwrap();
        assert_eq!(folded.weight.len(), original.weight.len());
    }
}

#[test]
fn test_model_weights_untouched_by_tuning() {
    let m = model();
    let before = m.linear("model.layers.0.mlp.up_proj").unwrap().weight.clone();
    let xs = inputs(4, 3);
    let contexts = vec![SampleContext::default(); xs.len()];
    tune_window(
        &single_block(&m, 0),
        &xs,
        None,
        &contexts,
        &layer_config(&m, 4),
        &full_batch_settings(xs.len()),
    )
    .unwrap();
    assert_eq!(m.linear("model.layers.0.mlp.up_proj").unwrap().weight, before);
}

#[test]
fn test_stagnation_stops_early() {
    let m = model();
    let xs = inputs(4, 4);
    let contexts = vec![SampleContext::default(); xs.len()];
    let settings = TuneSettings {
        iters: 50,
        lr: 0.0,
        dynamic_max_gap: 3,
        ..full_batch_settings(xs.len())
    };
    let tuning = tune_window(
        &single_block(&m, 0),
        &xs,
        None,
        &contexts,
        &layer_config(&m, 4),
        &settings,
    )
    .unwrap()
    .tuning
    .unwrap();
    // a frozen loss never strictly improves after the first iteration
    assert_eq!(tuning.best_iter, 0);
    assert_eq!(tuning.early_stopped_at, Some(3));
    assert_eq!(tuning.iterations_run, 4);
}

#[test]
fn test_last_iteration_folded_without_best_checkpoint() {
    let m = model();
    let xs = inputs(4, 5);
    let contexts = vec![SampleContext::default(); xs.len()];
    let settings = TuneSettings {
        iters: 12,
        not_use_best_mse: true,
        dynamic_max_gap: 1,
        ..full_batch_settings(xs.len())
    };
    let tuning = tune_window(
        &single_block(&m, 2),
        &xs,
        None,
        &contexts,
        &layer_config(&m, 2),
        &settings,
    )
    .unwrap()
    .tuning
    .unwrap();
    assert_eq!(tuning.iterations_run, 12);
    assert_eq!(tuning.early_stopped_at, None);
    assert_eq!(tuning.best_iter, 12);
    assert_eq!(Some(&tuning.final_loss), tuning.loss_history.last());
    assert!(tuning.best.is_some());
}

#[test]
fn test_float_block_is_skipped() {
    let m = model();
    let segments = single_block(&m, 0);
    let xs = inputs(3, 6);
    let contexts = vec![SampleContext::default(); xs.len()];
    let outcome = tune_window(
        &segments,
        &xs,
        None,
        &contexts,
        &layer_config(&m, 16),
        &TuneSettings::default(),
    )
    .unwrap();
    assert!(outcome.tuning.is_none());
    assert!(outcome.quantized_layers.is_empty());
    assert_eq!(outcome.unquantized_layers, segments.fine_tune.linear_names());
    assert_eq!(outcome.fp_outputs.len(), 3);
    assert!(outcome.observe_history().is_empty());
}

#[test]
fn test_observe_segment_is_tracked() {
    let m = model();
    let segments = WindowSegments {
        fine_tune: BlockSequence::from_model(&m, &["model.layers.0".to_string()]).unwrap(),
        attach: BlockSequence::from_model(&m, &["model.layers.1".to_string()]).unwrap(),
        observe: BlockSequence::from_model(&m, &["model.layers.2".to_string()]).unwrap(),
    };
    let xs = inputs(4, 7);
    let contexts = vec![SampleContext::default(); xs.len()];
    let outcome = tune_window(
        &segments,
        &xs,
        None,
        &contexts,
        &layer_config(&m, 2),
        &full_batch_settings(xs.len()),
    )
    .unwrap();
    assert_eq!(outcome.observe_history().len(), 25);
    assert!(outcome.observe_history().iter().all(|v| v.is_finite() && *v >= 0.0));
    // only fine-tune layers are wrapped
    let tuning = outcome.tuning.unwrap();
    assert_eq!(tuning.quantized_layers.len(), 2);
    assert!(tuning.quantized_layers.iter().all(|n| n.starts_with("model.layers.0.")));
}

#[test]
fn test_stream_length_mismatch_rejected() {
    let m = model();
    let xs = inputs(4, 8);
    let contexts = vec![SampleContext::default(); 3];
    let err = tune_window(
        &single_block(&m, 0),
        &xs,
        None,
        &contexts,
        &layer_config(&m, 4),
        &TuneSettings::default(),
    );
    assert!(err.is_err());
    assert!(tune_window(
        &single_block(&m, 0),
        &[],
        None,
        &[],
        &layer_config(&m, 4),
        &TuneSettings::default(),
    )
    .is_err());
}

#[test]
fn test_tune_single_layer() {
    let m = model();
    let head = m.linear(crate::model::LM_HEAD).unwrap();
    let xs = inputs(6, 9);
    let settings = TuneSettings {
        iters: 30,
        batch_size: 3,
        lr: 0.02,
        ..TuneSettings::default()
    }
    .for_layer();
    assert_eq!(settings.batch_size, 1);
    assert_eq!(settings.gradient_accumulate_steps, 3);
    let result = tune_layer(
        crate::model::LM_HEAD,
        head,
        QuantConfig::new(3, GroupSize::PerChannel, false),
        &xs,
        None,
        &settings,
    )
    .unwrap();
    assert_eq!(result.unit, crate::model::LM_HEAD);
    assert_eq!(result.folded.len(), 1);
    assert!(result.best_loss <= result.init_loss);
    assert_eq!(result.observe_history.len(), result.loss_history.len());
}

#[test]
fn test_reseeded_settings_differ_only_in_seed() {
    let base = TuneSettings::default();
    let next = base.reseeded(3);
    assert_ne!(next.seed, base.seed);
    assert_eq!(TuneSettings { seed: base.seed, ..next }, base);
    assert_eq!(base.pick_samples(), 8);
}
