//! Band planning.
//!
//! Turns a [`TestConfiguration`] into the fixed sequence of (workers,
//! connections) pairs the controller walks through. Growth strategies that
//! overshoot the maximum before the band count is exhausted clamp to the
//! maximum and repeat it for the remaining bands.

use crate::error::{EngineError, Result};
use crate::models::{BandPlan, Strategy, TestConfiguration};
use tracing::debug;

/// Check the parts of a configuration the planner depends on.
pub fn validate(config: &TestConfiguration) -> Result<()> {
    if config.band_count < 1 {
        return Err(EngineError::invalid_config("band count must be at least 1"));
    }
    if config.min_workers == 0 || config.min_connections == 0 {
        return Err(EngineError::invalid_config(
            "minimum workers and connections must be at least 1",
        ));
    }
    if config.min_workers > config.max_workers {
        return Err(EngineError::invalid_config(format!(
            "min workers ({}) exceeds max workers ({})",
            config.min_workers, config.max_workers
        )));
    }
    if config.min_connections > config.max_connections {
        return Err(EngineError::invalid_config(format!(
            "min connections ({}) exceeds max connections ({})",
            config.min_connections, config.max_connections
        )));
    }
    if config.band_count == 1
        && (config.min_workers != config.max_workers
            || config.min_connections != config.max_connections)
    {
        return Err(EngineError::invalid_config(
            "a single band requires min and max to be equal",
        ));
    }
    if config.band_duration.is_zero() {
        return Err(EngineError::invalid_config("band duration must be non-zero"));
    }
    Ok(())
}

/// Produce the full band sequence for `config`.
pub fn plan_bands(config: &TestConfiguration) -> Result<Vec<BandPlan>> {
    validate(config)?;

    let workers = series(
        config.strategy,
        config.min_workers,
        config.max_workers,
        config.band_count,
    );
    let connections = series(
        config.strategy,
        config.min_connections,
        config.max_connections,
        config.band_count,
    );

    let plans: Vec<BandPlan> = workers
        .into_iter()
        .zip(connections)
        .enumerate()
        .map(|(index, (workers, connections))| BandPlan {
            index,
            workers,
            connections,
        })
        .collect();

    debug!(
        "Planned {} bands ({} strategy): {:?}",
        plans.len(),
        config.strategy,
        plans
            .iter()
            .map(|p| (p.workers, p.connections))
            .collect::<Vec<_>>()
    );

    Ok(plans)
}

/// Values for one dimension. `count` is at least 1 and `min <= max`.
fn series(strategy: Strategy, min: u32, max: u32, count: usize) -> Vec<u32> {
    if count == 1 {
        return vec![max];
    }

    let mut values: Vec<u32> = match strategy {
        Strategy::Linear => (0..count)
            .map(|i| {
                let progress = i as f64 / (count - 1) as f64;
                let value = min as f64 + (max - min) as f64 * progress;
                (value.round() as u32).clamp(min, max)
            })
            .collect(),
        Strategy::Exponential => {
            let mut value = min as u64;
            (0..count)
                .map(|_| {
                    let current = value.min(max as u64) as u32;
                    value = value.saturating_mul(2);
                    current
                })
                .collect()
        }
        Strategy::Fibonacci => {
            let (mut a, mut b) = (1u64, 2u64);
            (0..count)
                .map(|_| {
                    let current = (min as u64).saturating_mul(a).min(max as u64) as u32;
                    let next = a.saturating_add(b);
                    a = b;
                    b = next;
                    current
                })
                .collect()
        }
    };

    // The last band always reaches the maximum.
    if let Some(last) = values.last_mut() {
        *last = max;
    }
    values
}
