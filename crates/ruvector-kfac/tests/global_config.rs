//! Process-wide configuration
//!
//! Kept in its own test binary: the global config can be installed once per
//! process, and only before any factor exists.

use ndarray::array;
use ruvector_kfac::prelude::*;

#[test]
fn test_install_global_before_any_factor() {
    let config = FactorConfig::identity_init().with_default_ema_decay(0.9);
    assert_eq!(FactorConfig::global(), FactorConfig::default());

    assert!(FactorConfig::default()
        .with_default_ema_decay(1.5)
        .install_global()
        .is_err());
    config.install_global().unwrap();
    assert_eq!(FactorConfig::global(), config);

    // registries created without an explicit config pick it up
    let registry = FactorRegistry::new();
    assert_eq!(registry.config(), config);

    let mut block = FullyConnectedKFACBasicFB::new(&registry, false);
    block
        .register_additional_tower(Tensor::from(array![[1.0, 2.0]]), Tensor::from(array![[3.0]]))
        .unwrap();
    block
        .instantiate_factors(&[vec![vec![Tensor::from(array![[1.0]])]]], 0.1)
        .unwrap();
    assert!(block.factors()[0].read().config().zero_debias == config.zero_debias);

    // a second install fails, whether or not it matches
    assert!(config.install_global().is_err());
    assert!(FactorConfig::default().install_global().is_err());
}

#[test]
fn test_config_json_roundtrip() {
    let config = FactorConfig::identity_init()
        .with_zero_debias(true)
        .with_default_ema_decay(0.99);
    let json = serde_json::to_string_pretty(&config).unwrap();
    assert!(json.contains("\"default_ema_decay\": 0.99"));
    let back: FactorConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, config);
    assert!(back.validate().is_ok());
}
