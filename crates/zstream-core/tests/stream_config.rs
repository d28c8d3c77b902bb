use zstream_core::{ConfigError, StreamConfig};

#[test]
fn min_above_max_is_invalid() {
    let cfg = StreamConfig {
        min_batch_size: 64,
        max_batch_size: 8,
        ..StreamConfig::default()
    };
    assert_eq!(
        cfg.validate(),
        Err(ConfigError::BatchBounds { min: 64, max: 8 })
    );
}

#[test]
fn adjustment_factor_must_be_strictly_inside_unit_interval() {
    for f in [0.0, 1.0, 1.5, -0.2] {
        let cfg = StreamConfig {
            batch_adjustment_factor: f,
            ..StreamConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::AdjustmentFactor(f)));
    }
}

#[test]
fn zero_counts_are_invalid() {
    let cases = [
        (
            StreamConfig {
                worker_count: 0,
                ..StreamConfig::default()
            },
            ConfigError::ZeroWorkers,
        ),
        (
            StreamConfig {
                prefetch_lookahead: 0,
                ..StreamConfig::default()
            },
            ConfigError::ZeroLookahead,
        ),
        (
            StreamConfig {
                monitoring_window: 0,
                ..StreamConfig::default()
            },
            ConfigError::ZeroMonitoringWindow,
        ),
        (
            StreamConfig {
                min_batch_size: 0,
                ..StreamConfig::default()
            },
            ConfigError::ZeroMinBatchSize,
        ),
    ];
    for (cfg, expected) in cases {
        assert_eq!(cfg.validate(), Err(expected));
    }
}

#[test]
fn pattern_history_must_hold_the_stability_run() {
    let cfg = StreamConfig {
        pattern_history: 2,
        pattern_min_stable_transitions: 2,
        ..StreamConfig::default()
    };
    assert_eq!(
        cfg.validate(),
        Err(ConfigError::PatternHistoryTooShort {
            history: 2,
            required: 3
        })
    );
}

#[test]
fn initial_batch_size_is_clamped() {
    let cfg = StreamConfig {
        batch_size: 500,
        min_batch_size: 4,
        max_batch_size: 64,
        ..StreamConfig::default()
    };
    assert_eq!(cfg.initial_batch_size(), 64);
}

#[test]
fn partial_json_config_fills_defaults() -> anyhow::Result<()> {
    let cfg: StreamConfig =
        serde_json::from_str(r#"{"prefetch_strategy": "sequential", "worker_count": 4}"#)?;
    assert_eq!(cfg.worker_count, 4);
    assert_eq!(cfg.prefetch_lookahead, 3);
    assert_eq!(cfg.validate(), Ok(()));
    Ok(())
}
