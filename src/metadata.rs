//! Endpoint metadata: the describe-endpoint contract and a cached client.
//!
//! Capacity estimation and variant selection both read the same metadata, so
//! they share one process-wide cache. The cache allows concurrent reads and
//! coordinates refetches so that many scheduler ticks racing on a cold or
//! expired key produce exactly one describe call.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedError};

/// Timeout for a describe round trip.
const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One production configuration of a model endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductionVariant {
    /// Variant name, unique within the endpoint.
    pub name: String,

    /// Traffic weight. Selection probability is `weight / sum(weights)`.
    pub current_weight: f64,

    /// Number of instances backing the variant. Ignored for serverless
    /// variants.
    #[serde(default)]
    pub instance_count: u32,

    /// Present iff the variant is serverless.
    #[serde(default)]
    pub serverless_config: Option<ServerlessConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerlessConfig {
    /// Maximum concurrent invocations the serverless variant accepts.
    pub max_concurrency: u32,
}

/// The answer to a describe-endpoint call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointDescription {
    pub production_variants: Vec<ProductionVariant>,

    /// Endpoint tags. The scheduler reads `osml:instance-concurrency`.
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// The model-hosting metadata service contract.
pub trait DescribeEndpoints: Send + Sync {
    fn describe_endpoint(&self, endpoint_id: &str) -> Result<EndpointDescription>;
}

impl<T: DescribeEndpoints + ?Sized> DescribeEndpoints for Arc<T> {
    fn describe_endpoint(&self, endpoint_id: &str) -> Result<EndpointDescription> {
        (**self).describe_endpoint(endpoint_id)
    }
}

/// Describe client speaking JSON over HTTP:
/// `GET {base}/endpoints/{endpoint_id}`.
pub struct HttpDescribeClient {
    base: String,
    client: reqwest::blocking::Client,
}

impl HttpDescribeClient {
    pub fn new(base: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(DESCRIBE_TIMEOUT)
            .build()
            .map_err(|e| SchedError::Store(format!("metadata client: {}", e)))?;

        Ok(HttpDescribeClient {
            base: base.trim_end_matches('/').to_string(),
            client,
        })
    }
}

impl DescribeEndpoints for HttpDescribeClient {
    fn describe_endpoint(&self, endpoint_id: &str) -> Result<EndpointDescription> {
        let url = format!("{}/endpoints/{}", self.base, endpoint_id);

        let lookup = |cause: String| SchedError::CapacityLookup {
            endpoint: endpoint_id.to_string(),
            cause,
        };

        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| lookup(e.to_string()))?;

        if !response.status().is_success() {
            return Err(lookup(format!("describe returned {}", response.status())));
        }

        response.json().map_err(|e| lookup(e.to_string()))
    }
}

struct CacheEntry {
    description: Arc<EndpointDescription>,
    fetched_at: Instant,
}

/// Process-wide cache over a [`DescribeEndpoints`] backend.
///
/// Reads are concurrent; a refetch for a given endpoint is single-flight:
/// the first caller fetches while later callers wait on the condvar and then
/// read the refreshed entry. A failed refetch falls back to the last known
/// value with a warning; with no prior value the failure propagates.
pub struct MetadataCache {
    backend: Box<dyn DescribeEndpoints>,
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
    in_flight: Mutex<HashSet<String>>,
    fetch_done: Condvar,
}

impl MetadataCache {
    pub fn new(backend: Box<dyn DescribeEndpoints>, ttl: Duration) -> Self {
        MetadataCache {
            backend,
            ttl,
            entries: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashSet::new()),
            fetch_done: Condvar::new(),
        }
    }

    /// Get the (possibly cached) description of an endpoint.
    pub fn describe(&self, endpoint_id: &str) -> Result<Arc<EndpointDescription>> {
        if let Some(description) = self.fresh(endpoint_id) {
            return Ok(description);
        }

        // Claim the refetch or wait for whoever already claimed it.
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            while in_flight.contains(endpoint_id) {
                in_flight = self.fetch_done.wait(in_flight).unwrap();
            }

            // The winner of the race may have refreshed the entry while we
            // were waiting.
            if let Some(description) = self.fresh(endpoint_id) {
                return Ok(description);
            }

            in_flight.insert(endpoint_id.to_string());
        }

        let fetched = self.backend.describe_endpoint(endpoint_id);

        let result = match fetched {
            Ok(description) => {
                let description = Arc::new(description);
                self.entries.write().unwrap().insert(
                    endpoint_id.to_string(),
                    CacheEntry {
                        description: Arc::clone(&description),
                        fetched_at: Instant::now(),
                    },
                );
                Ok(description)
            }

            Err(e) => {
                // Fall back to the stale entry if there is one. Its clock is
                // restarted so a flaky metadata service is retried once per
                // TTL, not once per tick.
                let mut entries = self.entries.write().unwrap();
                if let Some(entry) = entries.get_mut(endpoint_id) {
                    warn!(
                        "Metadata refetch for {} failed ({}); using last known value",
                        endpoint_id, e
                    );
                    entry.fetched_at = Instant::now();
                    Ok(Arc::clone(&entry.description))
                } else {
                    Err(e)
                }
            }
        };

        {
            let mut in_flight = self.in_flight.lock().unwrap();
            in_flight.remove(endpoint_id);
        }
        self.fetch_done.notify_all();

        result
    }

    fn fresh(&self, endpoint_id: &str) -> Option<Arc<EndpointDescription>> {
        let entries = self.entries.read().unwrap();
        entries.get(endpoint_id).and_then(|entry| {
            if entry.fetched_at.elapsed() < self.ttl {
                Some(Arc::clone(&entry.description))
            } else {
                None
            }
        })
    }
}
