//! Variant selection for requests that do not pin one.
//!
//! SageMaker-style endpoints serve several production variants with traffic
//! weights. A request without an explicit variant gets one drawn at random,
//! with probability proportional to `current_weight`, so a fleet of workers
//! spreads images across variants the same way the endpoint spreads traffic.

use std::sync::{Arc, Mutex};

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::error::{Result, SchedError};
use crate::is_http_endpoint;
use crate::metadata::MetadataCache;
use crate::ImageRequest;

/// Assigns production variants by weighted random selection.
///
/// The generator is seedable so selection is reproducible under test; it
/// lives behind a mutex rather than thread-local state so a worker draws
/// from one stream no matter which thread ticks.
pub struct VariantSelector {
    metadata: Arc<MetadataCache>,
    rng: Mutex<StdRng>,
}

impl VariantSelector {
    pub fn new(metadata: Arc<MetadataCache>) -> Self {
        VariantSelector {
            metadata,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(metadata: Arc<MetadataCache>, seed: u64) -> Self {
        VariantSelector {
            metadata,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Resolve the variant for a request. Requests with an explicit variant
    /// and requests against HTTP endpoints come back unchanged.
    pub fn select_variant(&self, request: ImageRequest) -> Result<ImageRequest> {
        if request.variant.is_some() || is_http_endpoint(&request.endpoint_id) {
            return Ok(request);
        }

        let description = self.metadata.describe(&request.endpoint_id)?;
        let variants = &description.production_variants;

        let selection_err = |cause: &str| SchedError::VariantSelection {
            endpoint: request.endpoint_id.clone(),
            cause: cause.to_string(),
        };

        let chosen = match variants.len() {
            0 => return Err(selection_err("endpoint has no production variants")),
            1 => variants[0].name.clone(),
            _ => {
                let weights: Vec<f64> = variants.iter().map(|v| v.current_weight).collect();
                let dist = WeightedIndex::new(&weights)
                    .map_err(|_| selection_err("all variant weights are zero"))?;

                let index = dist.sample(&mut *self.rng.lock().unwrap());
                variants[index].name.clone()
            }
        };

        Ok(ImageRequest {
            variant: Some(chosen),
            ..request
        })
    }
}
