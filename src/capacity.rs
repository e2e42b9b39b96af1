//! Per-endpoint capacity estimation.
//!
//! An endpoint's capacity is the number of inference requests it can serve
//! concurrently. Plain HTTP endpoints get a configured constant; SageMaker-
//! style endpoints are described through the metadata service and each
//! production variant contributes either its serverless `max_concurrency` or
//! `instance_count * per_instance_concurrency`.

use std::sync::Arc;

use log::warn;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedError};
use crate::is_http_endpoint;
use crate::metadata::{MetadataCache, ProductionVariant};

/// Endpoint tag naming the per-instance concurrency of instance-backed
/// variants.
pub const INSTANCE_CONCURRENCY_TAG: &str = "osml:instance-concurrency";

/// The backend flavor of an endpoint variant, resolved once per lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Http,
    SageMakerServerless,
    SageMakerInstanceBacked,
}

impl EndpointKind {
    pub fn of(endpoint_id: &str, variant: &ProductionVariant) -> Self {
        if is_http_endpoint(endpoint_id) {
            EndpointKind::Http
        } else if variant.serverless_config.is_some() {
            EndpointKind::SageMakerServerless
        } else {
            EndpointKind::SageMakerInstanceBacked
        }
    }
}

/// Estimates the maximum concurrent-request capacity of model endpoints.
///
/// Metadata lookups go through the shared [`MetadataCache`], so repeated
/// estimates within the TTL cost nothing and a flaky metadata service
/// degrades to the last known answer.
pub struct CapacityEstimator {
    metadata: Arc<MetadataCache>,
}

impl CapacityEstimator {
    pub fn new(metadata: Arc<MetadataCache>) -> Self {
        CapacityEstimator { metadata }
    }

    /// Maximum concurrent requests for an endpoint, or for one of its
    /// variants if `variant_name` is given.
    pub fn estimate_capacity(
        &self,
        endpoint_id: &str,
        variant_name: Option<&str>,
        config: &SchedulerConfig,
    ) -> Result<u32> {
        if is_http_endpoint(endpoint_id) {
            return Ok(config.default_http_endpoint_concurrency);
        }

        let description = self.metadata.describe(endpoint_id)?;

        let per_instance = per_instance_concurrency(endpoint_id, &description.tags, config);

        match variant_name {
            Some(name) => {
                let variant = description
                    .production_variants
                    .iter()
                    .find(|v| v.name == name)
                    .ok_or_else(|| SchedError::CapacityLookup {
                        endpoint: endpoint_id.to_string(),
                        cause: format!("no production variant named {}", name),
                    })?;

                Ok(variant_capacity(variant, per_instance))
            }

            None => Ok(description
                .production_variants
                .iter()
                .map(|v| variant_capacity(v, per_instance))
                .sum()),
        }
    }
}

fn variant_capacity(variant: &ProductionVariant, per_instance: u32) -> u32 {
    match &variant.serverless_config {
        Some(serverless) => serverless.max_concurrency,
        None => variant.instance_count * per_instance,
    }
}

fn per_instance_concurrency(
    endpoint_id: &str,
    tags: &std::collections::HashMap<String, String>,
    config: &SchedulerConfig,
) -> u32 {
    match tags.get(INSTANCE_CONCURRENCY_TAG) {
        None => config.default_instance_concurrency,
        Some(raw) => match raw.parse::<u32>() {
            Ok(v) if v >= 1 => v,
            _ => {
                warn!(
                    "Endpoint {} has unparseable {} tag {:?}; using default {}",
                    endpoint_id, INSTANCE_CONCURRENCY_TAG, raw, config.default_instance_concurrency
                );
                config.default_instance_concurrency
            }
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metadata::test_support::*;
    use crate::metadata::EndpointDescription;
    use std::time::Duration;

    fn estimator_for(endpoint_id: &str, description: EndpointDescription) -> CapacityEstimator {
        let cache = MetadataCache::new(
            Box::new(FakeDescribe::single(endpoint_id, description)),
            Duration::from_secs(300),
        );
        CapacityEstimator::new(Arc::new(cache))
    }

    #[test]
    fn http_endpoints_use_configured_concurrency() {
        let estimator = estimator_for("unused", description(vec![]));
        let config = SchedulerConfig::default();

        for url in &[
            "http://models.internal:8080/detect",
            "https://models.internal/detect",
        ] {
            assert_eq!(
                estimator.estimate_capacity(url, None, &config).unwrap(),
                config.default_http_endpoint_concurrency
            );
        }
    }

    #[test]
    fn serverless_capacity_is_max_concurrency() {
        let config = SchedulerConfig::default();

        for max in &[1u32, 10, 100, 10_000] {
            let estimator = estimator_for(
                "detector",
                description(vec![serverless_variant("main", 1.0, *max)]),
            );
            assert_eq!(
                estimator
                    .estimate_capacity("detector", Some("main"), &config)
                    .unwrap(),
                *max
            );
        }
    }

    #[test]
    fn instance_backed_capacity_uses_tag() {
        let config = SchedulerConfig::default();

        for &(instances, per_instance) in &[(1u32, 1u32), (3, 5), (100, 100), (7, 1)] {
            let mut desc = description(vec![instance_variant("main", 1.0, instances)]);
            desc.tags
                .insert(INSTANCE_CONCURRENCY_TAG.into(), per_instance.to_string());

            let estimator = estimator_for("detector", desc);
            assert_eq!(
                estimator
                    .estimate_capacity("detector", Some("main"), &config)
                    .unwrap(),
                instances * per_instance
            );
        }
    }

    #[test]
    fn instance_backed_capacity_without_tag_uses_default() {
        let config = SchedulerConfig::default();

        for &instances in &[1u32, 4, 100] {
            let estimator = estimator_for(
                "detector",
                description(vec![instance_variant("main", 1.0, instances)]),
            );
            assert_eq!(
                estimator
                    .estimate_capacity("detector", Some("main"), &config)
                    .unwrap(),
                instances * config.default_instance_concurrency
            );
        }
    }

    #[test]
    fn unparseable_tag_falls_back_to_default() {
        let config = SchedulerConfig::default();

        for bad in &["zero", "-4", "0", ""] {
            let mut desc = description(vec![instance_variant("main", 1.0, 3)]);
            desc.tags
                .insert(INSTANCE_CONCURRENCY_TAG.into(), bad.to_string());

            let estimator = estimator_for("detector", desc);
            assert_eq!(
                estimator
                    .estimate_capacity("detector", Some("main"), &config)
                    .unwrap(),
                3 * config.default_instance_concurrency
            );
        }
    }

    #[test]
    fn unnamed_variant_sums_all_variants() {
        let config = SchedulerConfig::default();

        let estimator = estimator_for(
            "detector",
            description(vec![
                serverless_variant("fast", 1.0, 40),
                instance_variant("steady", 1.0, 3),
            ]),
        );

        // 40 serverless + 3 instances * default 2.
        assert_eq!(
            estimator
                .estimate_capacity("detector", None, &config)
                .unwrap(),
            46
        );
    }

    #[test]
    fn unknown_variant_name_is_a_lookup_error() {
        let config = SchedulerConfig::default();
        let estimator = estimator_for(
            "detector",
            description(vec![instance_variant("main", 1.0, 1)]),
        );

        match estimator.estimate_capacity("detector", Some("missing"), &config) {
            Err(SchedError::CapacityLookup { .. }) => {}
            other => panic!("expected capacity lookup error, got {:?}", other),
        }
    }

    #[test]
    fn endpoint_kind_resolution() {
        let serverless = serverless_variant("a", 1.0, 5);
        let backed = instance_variant("b", 1.0, 2);

        assert_eq!(
            EndpointKind::of("http://x", &backed),
            EndpointKind::Http
        );
        assert_eq!(
            EndpointKind::of("detector", &serverless),
            EndpointKind::SageMakerServerless
        );
        assert_eq!(
            EndpointKind::of("detector", &backed),
            EndpointKind::SageMakerInstanceBacked
        );
    }
}
