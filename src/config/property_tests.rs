//! Property tests for the configuration schema and its validation

#[cfg(test)]
mod tests {
    use crate::config::schema::*;
    use crate::config::validate::{validate_config, ValidationError};
    use crate::quant::{GroupSize, ScaleDtype};
    use crate::tune::SamplerKind;
    use proptest::prelude::*;

    // ============================================================
    // Arbitrary Generators
    // ============================================================

    fn arb_group_size() -> impl Strategy<Value = i64> {
        prop_oneof![Just(-1i64), 1i64..512]
    }

    fn arb_scale_dtype() -> impl Strategy<Value = ScaleDtype> {
        prop_oneof![
            Just(ScaleDtype::Fp16),
            Just(ScaleDtype::Bf16),
            Just(ScaleDtype::Fp32)
        ]
    }

    fn arb_layer_override() -> impl Strategy<Value = LayerOverride> {
        (
            proptest::option::of(1u32..=32),
            proptest::option::of(arb_group_size()),
            proptest::option::of(any::<bool>()),
            proptest::option::of(arb_scale_dtype()),
        )
            .prop_map(|(bits, group_size, sym, scale_dtype)| LayerOverride {
                bits,
                group_size,
                sym,
                scale_dtype,
                ..LayerOverride::default()
            })
    }

    fn arb_layer_name() -> impl Strategy<Value = String> {
        prop::string::string_regex("model\\.layers\\.[0-9]\\.mlp\\.(up|down)_proj").unwrap()
    }

    fn arb_config() -> impl Strategy<Value = AutoRoundConfig> {
        (
            (1u32..=8, arb_group_size(), any::<bool>(), -10i64..500),
            (1usize..64, 1usize..8, 1usize..4096),
            (1usize..6, 0usize..6, 0usize..4),
            prop_oneof![Just(SamplerKind::Rand), Just(SamplerKind::Fixed)],
            proptest::collection::btree_map(arb_layer_name(), arb_layer_override(), 0..4),
        )
            .prop_flat_map(
                |((bits, group_size, sym, iters), (bs, gas, seqlen), (nblocks, look, observe), sampler, layers)| {
                    (1..=nblocks).prop_map(move |step| AutoRoundConfig {
                        bits,
                        group_size,
                        sym,
                        iters,
                        batch_size: bs,
                        gradient_accumulate_steps: gas,
                        seqlen,
                        nblocks,
                        block_step_size: step,
                        num_lookahead_blocks: look,
                        num_observe_blocks: observe,
                        sampler,
                        layer_config: layers.clone(),
                        ..AutoRoundConfig::default()
                    })
                },
            )
    }

    // ============================================================
    // Round-Trip Serialization Tests
    // ============================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_config_round_trip(config in arb_config()) {
            let yaml = serde_yaml::to_string(&config).unwrap();
            let parsed: AutoRoundConfig = serde_yaml::from_str(&yaml).unwrap();
            prop_assert_eq!(config, parsed);
        }

        #[test]
        fn prop_layer_override_round_trip(over in arb_layer_override()) {
            let json = serde_json::to_string(&over).unwrap();
            let parsed: LayerOverride = serde_json::from_str(&json).unwrap();
            prop_assert_eq!(over, parsed);
        }
    }

    // ============================================================
    // Validation Properties
    // ============================================================

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_generated_configs_validate(config in arb_config()) {
            prop_assert!(validate_config(&config).is_ok());
            prop_assert!(config.resolved_iters() > 0);
            prop_assert!(config.resolved_lr() > 0.0);
        }

        #[test]
        fn prop_layer_configs_resolve(config in arb_config()) {
            for over in config.layer_config.values() {
                let qc = config.layer_quant_config(over).unwrap();
                prop_assert_eq!(qc.bits, over.bits.unwrap_or(config.bits));
                let expected = GroupSize::try_from(over.group_size.unwrap_or(config.group_size)).unwrap();
                prop_assert_eq!(qc.group_size, expected);
            }
        }

        #[test]
        fn prop_invalid_group_size_rejected(group_size in -1000i64..=0) {
            prop_assume!(group_size != -1);
            let config = AutoRoundConfig { group_size, ..AutoRoundConfig::default() };
            prop_assert_eq!(
                validate_config(&config),
                Err(ValidationError::InvalidGroupSize(group_size))
            );
        }

        #[test]
        fn prop_step_beyond_nblocks_rejected(nblocks in 1usize..10, extra in 1usize..5) {
            let config = AutoRoundConfig {
                nblocks,
                block_step_size: nblocks + extra,
                ..AutoRoundConfig::default()
            };
            let rejected = matches!(
                validate_config(&config),
                Err(ValidationError::InvalidBlockStepSize { .. })
            );
            prop_assert!(rejected);
        }
    }
}
