//! Round runner
//!
//! Loads a TOML run configuration, builds the configured algorithms from
//! the static registry and drives them through an evaluation harness.

pub mod agents;
pub mod config;
pub mod registry;
pub mod report;

use anyhow::{bail, Context, Result};
use round_harness::protocol::ProtocolRunner;
use std::path::PathBuf;
use tracing::info;

use config::RunnerConfig;
use report::RunSummary;

/// Run every configured algorithm and write the run summary
pub fn execute(config: &RunnerConfig) -> Result<(RunSummary, PathBuf)> {
    config.validate()?;
    let harness = config.harness.build()?;
    let mut algorithms = registry::build_all(&config.algorithms)?;

    info!(
        harness = harness.name(),
        protocol = %config.protocol.protocol,
        algorithms = algorithms.len(),
        "Round runner starting"
    );
    let harness_name = harness.name();
    let runner = ProtocolRunner::new(harness, config.protocol.clone());
    let reports = runner
        .run(&mut algorithms)
        .context("Protocol run failed")?;

    let summary = RunSummary::new(&config.protocol, harness_name, &reports);
    let path = summary.write(config.harness.output_dir())?;
    Ok((summary, path))
}

/// Request the test id list for the configured protocol and domain
pub fn request_test_ids(config: &RunnerConfig) -> Result<PathBuf> {
    let protocol = &config.protocol;
    let Some(seed) = protocol.detector_seed.as_deref() else {
        bail!("detector_seed is required to request test ids");
    };
    let harness = config.harness.build()?;
    let path = harness
        .test_ids_request(
            protocol.protocol.as_str(),
            &protocol.domain,
            seed,
            protocol.test_assumptions.as_deref(),
        )
        .context("Test id request failed")?;
    Ok(path)
}
