//! Activation capture against the reference model

use autoround::calib::{capture_with_fallback, CalibrationData, CaptureSettings, CaptureTargets};
use autoround::model::{Device, Precision, QuantModel, SequentialModel, TokenSample, LM_HEAD};
use autoround::Error;

fn samples(n: usize, len: usize) -> Vec<TokenSample> {
    (0..n)
        .map(|i| TokenSample::new((0..len).map(|t| ((i + t * 2) % 12) as u32).collect()))
        .collect()
}

fn settings(nsamples: usize) -> CaptureSettings {
    CaptureSettings {
        seqlen: 4,
        nsamples,
        precision: Precision::F32,
    }
}

#[test]
fn test_capture_blocks_and_head() {
    let mut model = SequentialModel::new(12, 6, 10, 2, 4).unwrap();
    let targets = CaptureTargets::new(
        vec!["model.layers.0".to_string()],
        vec![LM_HEAD.to_string()],
    );
    let cache = capture_with_fallback(&mut model, &samples(5, 4), &targets, &settings(5)).unwrap();

    assert_eq!(cache.num_samples(), 5);
    let block = cache.get("model.layers.0").unwrap();
    assert_eq!(block.len(), 5);
    assert_eq!(block.hidden()[0].dim(), (4, 6));
    let head = cache.get(LM_HEAD).unwrap();
    assert_eq!(head.hidden()[0].ncols(), 6);
    assert_eq!(model.device(), Device::Cpu);
}

#[test]
fn test_short_samples_are_skipped() {
    let mut model = SequentialModel::new(12, 6, 10, 1, 4).unwrap();
    let mut data = samples(3, 2);
    data.extend(samples(2, 4));
    let targets = CaptureTargets::new(vec!["model.layers.0".to_string()], Vec::new());
    let cache = capture_with_fallback(&mut model, &data, &targets, &settings(8)).unwrap();
    assert_eq!(cache.num_samples(), 2);

    let err = capture_with_fallback(&mut model, &samples(3, 2), &targets, &settings(8)).unwrap_err();
    assert!(matches!(err, Error::NoCalibrationData(_)));
}

#[test]
fn test_accelerator_overflow_falls_back() {
    let mut model = SequentialModel::new(12, 6, 10, 2, 4).unwrap().with_accelerator(32);
    let targets = CaptureTargets::new(vec!["model.layers.0".to_string()], Vec::new());
    let cache = capture_with_fallback(&mut model, &samples(4, 4), &targets, &settings(4)).unwrap();
    assert_eq!(cache.num_samples(), 4);
    assert_eq!(model.device(), Device::Cpu);
}

#[test]
fn test_inline_samples_resolve_without_loader() {
    let data = CalibrationData::Samples(samples(3, 4));
    assert_eq!(data.resolve(None, 4, 3, 0).unwrap().len(), 3);
    let named = CalibrationData::Named("pile".to_string());
    assert!(matches!(named.resolve(None, 4, 3, 0), Err(Error::ConfigError(_))));
}
