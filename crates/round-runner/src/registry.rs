//! Static algorithm registry, resolved once at startup from the config.

use anyhow::{bail, Result};
use round_harness::protocol::{AlgorithmAttributes, NoveltyAlgorithm, RegisteredAlgorithm};
use tracing::info;

use crate::agents::{mock, precomputed};
use crate::config::AlgorithmConfig;

pub type AlgorithmBuilder = fn(&AlgorithmConfig) -> Result<Box<dyn NoveltyAlgorithm>>;

const BUILDERS: &[(&str, AlgorithmBuilder)] = &[
    ("mock", mock::build),
    ("precomputed", precomputed::build),
];

/// Registered kinds, in registration order
pub fn kinds() -> Vec<&'static str> {
    BUILDERS.iter().map(|(kind, _)| *kind).collect()
}

pub fn builder(kind: &str) -> Option<AlgorithmBuilder> {
    BUILDERS
        .iter()
        .find(|(k, _)| *k == kind)
        .map(|(_, builder)| *builder)
}

/// Build one configured algorithm together with its session attributes
pub fn build(config: &AlgorithmConfig) -> Result<RegisteredAlgorithm> {
    let Some(builder) = builder(&config.kind) else {
        bail!(
            "Unknown algorithm kind {:?} for {} (known: {})",
            config.kind,
            config.name,
            kinds().join(", ")
        );
    };
    let algorithm = builder(config)?;

    let mut attributes = AlgorithmAttributes::new(&config.name, config.detection_threshold);
    attributes.version = config.version.clone();
    attributes.parameters = config.parameters.clone();
    info!(algorithm = %config.name, kind = %config.kind, "Built algorithm");
    Ok(RegisteredAlgorithm::new(attributes, algorithm))
}

pub fn build_all(configs: &[AlgorithmConfig]) -> Result<Vec<RegisteredAlgorithm>> {
    configs.iter().map(build).collect()
}
