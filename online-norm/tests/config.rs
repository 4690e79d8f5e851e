use online_norm::{
    build, ControlNormConfig, NormError, OnlineNormConfig, Strategy, DEFAULT_ALPHA_BKW,
    DEFAULT_ALPHA_FWD, DEFAULT_DECAY_FLOOR, DEFAULT_EPS,
};
use serde_json::json;

#[test]
fn test_defaults_fill_missing_fields() {
    let config: ControlNormConfig =
        serde_json::from_value(json!({"num_features": 3, "batch_size": 8})).unwrap();
    assert_eq!(config, ControlNormConfig::new(3, 8));
    assert_eq!(config.alpha_fwd, DEFAULT_ALPHA_FWD);
    assert_eq!(config.alpha_bkw, DEFAULT_ALPHA_BKW);
    assert_eq!(config.eps, DEFAULT_EPS);
    assert_eq!(config.decay_floor, DEFAULT_DECAY_FLOOR);
    assert_eq!(config.strategy, Strategy::Linearized);
}

#[test]
fn test_strategy_and_map_conversion() {
    let value = json!({
        "num_features": 2,
        "batch_size": 4,
        "alpha_fwd": 0.9,
        "strategy": "sequential",
    });
    let config = ControlNormConfig::try_from(value.as_object().unwrap().clone()).unwrap();
    assert_eq!(config.strategy, Strategy::Sequential);
    assert_eq!(config.alpha_fwd, 0.9);
    assert_eq!(serde_json::to_value(Strategy::Linearized).unwrap(), json!("linearized"));

    let bad = json!({"num_features": 2, "batch_size": 4, "strategy": "parallel"});
    assert!(ControlNormConfig::try_from(bad.as_object().unwrap().clone()).is_err());
}

#[test]
fn test_online_norm_config_flattens_control() {
    let config: OnlineNormConfig = serde_json::from_value(json!({
        "num_features": 5,
        "batch_size": 2,
        "eps": 1e-3,
        "bias": false,
    }))
    .unwrap();
    assert_eq!(config.control.num_features, 5);
    assert_eq!(config.control.eps, 1e-3);
    assert!(config.weight);
    assert!(!config.bias);
    assert!(config.layer_scaling);
}

#[test]
fn test_validation_rejects_bad_configs() {
    assert_eq!(
        ControlNormConfig::new(2, 0).validate(),
        Err(NormError::InvalidBatchSize)
    );
    assert_eq!(
        ControlNormConfig::new(0, 2).validate(),
        Err(NormError::InvalidFeatureCount)
    );
    assert_eq!(
        ControlNormConfig::new(2, 2).with_decay(1.5, 0.9).validate(),
        Err(NormError::InvalidDecayRate {
            name: "alpha_fwd",
            value: 1.5
        })
    );
    assert!(matches!(
        ControlNormConfig::new(2, 2).with_decay(0.9, -0.1).validate(),
        Err(NormError::InvalidDecayRate {
            name: "alpha_bkw",
            ..
        })
    ));
    assert!(matches!(
        ControlNormConfig::new(2, 2).with_decay(f64::NAN, 0.9).validate(),
        Err(NormError::InvalidDecayRate { .. })
    ));
    assert_eq!(
        ControlNormConfig::new(2, 2).with_eps(0.0).validate(),
        Err(NormError::InvalidEpsilon(0.0))
    );
    assert_eq!(
        ControlNormConfig::new(2, 2).with_decay_floor(-1.0).validate(),
        Err(NormError::InvalidDecayFloor(-1.0))
    );
    assert!(build(ControlNormConfig::new(2, 0)).is_err());
    assert!(build(ControlNormConfig::new(2, 2).with_strategy(Strategy::Sequential)).is_ok());
}

#[test]
fn test_boundary_decay_rates_are_accepted() {
    assert!(ControlNormConfig::new(2, 2).with_decay(0.0, 1.0).validate().is_ok());
}
