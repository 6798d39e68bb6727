use super::*;
use crate::quant::{QuantConfig, WrapperRegistry};
use approx::assert_abs_diff_eq;

fn model() -> SequentialModel {
    SequentialModel::new(16, 8, 12, 3, 7).unwrap()
}

fn sample() -> TokenSample {
    TokenSample::new(vec![1, 4, 9, 2])
}

/// Records every block and layer input it sees; breaks at `stop_at`
#[derive(Default)]
struct Recorder {
    blocks: Vec<String>,
    layers: Vec<String>,
    stop_at: Option<String>,
}

impl ForwardHooks for Recorder {
    fn before_block(
        &mut self,
        name: &str,
        _hidden: &ndarray::Array2<f32>,
        _ctx: &SampleContext,
    ) -> crate::Result<ControlFlow<()>> {
        self.blocks.push(name.to_string());
        Ok(if self.stop_at.as_deref() == Some(name) {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        })
    }

    fn before_linear(
        &mut self,
        name: &str,
        _input: &ndarray::Array2<f32>,
    ) -> crate::Result<ControlFlow<()>> {
        self.layers.push(name.to_string());
        Ok(if self.stop_at.as_deref() == Some(name) {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        })
    }
}

#[test]
fn test_names_and_lookup() {
    let mut m = model();
    assert_eq!(
        m.block_groups(),
        vec![vec![
            "model.layers.0".to_string(),
            "model.layers.1".to_string(),
            "model.layers.2".to_string()
        ]]
    );
    let names = m.linear_names();
    assert_eq!(names.len(), 7);
    assert_eq!(names[0], "model.layers.0.mlp.up_proj");
    assert_eq!(names[6], LM_HEAD);
    assert!(m.linear("model.layers.2.mlp.down_proj").is_some());
    assert!(m.linear_mut(LM_HEAD).is_some());
    assert!(m.block("model.layers.9").is_none());
    assert!(m.block_mut("model.layers.1").is_some());
}

#[test]
fn test_forward_is_deterministic() {
    let a = model().forward(&sample()).unwrap();
    let b = model().forward(&sample()).unwrap();
    assert_eq!(a.dim(), (4, 16));
    assert_eq!(a, b);
}

#[test]
fn test_out_of_vocab_token_fails() {
    let err = model().forward(&TokenSample::new(vec![99])).unwrap_err();
    assert!(matches!(err, crate::Error::Forward(_)));
}

#[test]
fn test_hooks_see_every_input_in_order() {
    let m = model();
    let mut rec = Recorder::default();
    let out = m.forward_with_hooks(&sample(), &mut rec).unwrap();
    assert!(out.is_continue());
    assert_eq!(rec.blocks.len(), 3);
    assert_eq!(rec.layers.len(), 7);
    assert_eq!(rec.layers.last().map(String::as_str), Some(LM_HEAD));
}

#[test]
fn test_hooks_break_at_block_and_layer() {
    let m = model();
    let mut rec = Recorder {
        stop_at: Some("model.layers.1".to_string()),
        ..Recorder::default()
    };
    assert!(m.forward_with_hooks(&sample(), &mut rec).unwrap().is_break());
    assert_eq!(rec.blocks, vec!["model.layers.0", "model.layers.1"]);

    let mut rec = Recorder {
        stop_at: Some("model.layers.0.mlp.up_proj".to_string()),
        ..Recorder::default()
    };
    assert!(m.forward_with_hooks(&sample(), &mut rec).unwrap().is_break());
    assert_eq!(rec.blocks.len(), 1);
    // the stopping block finishes its own forward without reporting further
    assert_eq!(rec.layers, vec!["model.layers.0.mlp.up_proj"]);
}

#[test]
fn test_empty_sequence_is_identity() {
    let seq = BlockSequence::empty();
    let x = ndarray::Array2::from_shape_fn((2, 3), |(r, c)| (r + c) as f32);
    let out = seq
        .forward_sample(&x, &SampleContext::default(), &mut PlainExec)
        .unwrap();
    assert_eq!(out, x);
    assert!(seq.linear_names().is_empty());
}

#[test]
fn test_sequence_matches_block_chain() {
    let m = model();
    let names = m.block_groups().remove(0);
    let all = BlockSequence::from_model(&m, &names).unwrap();
    let first = BlockSequence::from_model(&m, &names[..1]).unwrap();
    let rest = BlockSequence::from_model(&m, &names[1..]).unwrap();
    assert!(BlockSequence::from_model(&m, &["nope".to_string()]).is_err());

    let x = ndarray::Array2::from_shape_fn((3, 8), |(r, c)| ((r * 8 + c) as f32 * 0.1).cos());
    let ctx = SampleContext::default();
    let direct = all.forward_sample(&x, &ctx, &mut PlainExec).unwrap();
    let mid = first.forward_sample(&x, &ctx, &mut PlainExec).unwrap();
    let chained = rest.forward_sample(&mid, &ctx, &mut PlainExec).unwrap();
    for (a, b) in direct.iter().zip(chained.iter()) {
        assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
    }
}

#[test]
fn test_attention_mask_zeroes_block_update() {
    let m = model();
    let names = m.block_groups().remove(0);
    let seq = BlockSequence::from_model(&m, &names[..1]).unwrap();
    let x = ndarray::Array2::from_elem((2, 8), 0.3f32);
    let ctx = SampleContext {
        attention_mask: Some(ndarray::arr1(&[1.0, 0.0])),
        ..SampleContext::default()
    };
    let out = seq.forward_sample(&x, &ctx, &mut PlainExec).unwrap();
    assert_eq!(out.row(1), x.row(1));
    assert_ne!(out.row(0), x.row(0));
}

#[test]
fn test_quant_exec_with_wrapped_layer() {
    let m = model();
    let seq = BlockSequence::from_model(&m, &["model.layers.0".to_string()]).unwrap();
    let x = ndarray::Array2::from_shape_fn((2, 8), |(r, c)| (r as f32 - c as f32) * 0.05);
    let ctx = SampleContext::default();

    let empty = WrapperRegistry::new(true);
    let plain = seq.forward_sample(&x, &ctx, &mut PlainExec).unwrap();
    let same = seq
        .forward_sample(&x, &ctx, &mut QuantExec::new(&empty))
        .unwrap();
    assert_eq!(plain, same);

    let mut reg = WrapperRegistry::new(true);
    let name = "model.layers.0.mlp.up_proj";
    let config = QuantConfig::new(2, crate::quant::GroupSize::PerChannel, true);
    reg.wrap(name, seq.linear(name).unwrap(), config).unwrap();
    let quant = seq
        .forward_sample(&x, &ctx, &mut QuantExec::new(&reg))
        .unwrap();
    assert_ne!(plain, quant);
}

#[test]
fn test_forward_stream_rounds_outputs() {
    let m = model();
    let seq = BlockSequence::from_model(&m, &["model.layers.0".to_string()]).unwrap();
    let inputs = vec![ndarray::Array2::from_elem((1, 8), 0.1f32); 2];
    let contexts = vec![SampleContext::default(); 2];
    let out = seq
        .forward_stream(&inputs, &contexts, Precision::Bf16, &mut PlainExec)
        .unwrap();
    assert_eq!(out.len(), 2);
    assert!(out[0].iter().all(|&v| Precision::Bf16.round(v) == v));
    assert!(seq
        .forward_stream(&inputs, &contexts[..1], Precision::F32, &mut PlainExec)
        .is_err());
}

#[test]
fn test_accelerator_capacity_only_on_accelerator() {
    let mut m = model().with_accelerator(1024);
    assert_eq!(m.memory_capacity(), Some(1024));
    m.to_device(Device::Cpu).unwrap();
    assert_eq!(m.memory_capacity(), None);
}
