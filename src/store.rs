//! The outstanding-jobs store.
//!
//! Every validated job lives here from acceptance until it terminates and
//! its TTL lapses. All access goes through atomic operations; in particular
//! `start_next_attempt` is the single point where endpoint capacity is
//! effectively reserved, and exactly one concurrent caller wins it.
//!
//! [`MemStore`] is the authoritative state machine. The state server hosts
//! one and serializes the fleet's mutations through it; tests drive it
//! directly; [`RemoteStore`] is the client workers use.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedError};
use crate::{protocol_request, ImageRequest, StoreReq, StoreResp};

/// Estimated region count for records persisted before region calculation
/// existed (`region_count` absent).
pub const LEGACY_REGION_ESTIMATE: u32 = 20;

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptState {
    New,
    InProgress,
    Succeeded,
    Failed,
}

impl AttemptState {
    /// Terminal states are eligible for TTL expiry.
    pub fn is_terminal(self) -> bool {
        match self {
            AttemptState::Succeeded | AttemptState::Failed => true,
            AttemptState::New | AttemptState::InProgress => false,
        }
    }
}

/// The outcome reported when an attempt finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Succeeded,
    Failed,
}

/// One persisted job, keyed by `(endpoint_id, job_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutstandingJobRecord {
    pub endpoint_id: String,
    pub job_id: String,

    /// Resolved variant; empty for HTTP endpoints.
    pub variant: String,

    /// Number of regions the image decomposes into. `None` only on records
    /// from before region calculation existed.
    pub region_count: Option<u32>,

    pub attempt_state: AttemptState,

    /// Times the job has been started.
    pub attempt_count: u32,

    pub created_at: DateTime<Utc>,
    pub last_transition_at: DateTime<Utc>,
    pub expire_time: DateTime<Utc>,

    /// The original request, carried for the processing pipeline.
    pub request_payload: ImageRequest,
}

impl OutstandingJobRecord {
    pub fn new(
        request: ImageRequest,
        variant: String,
        region_count: u32,
        ttl: chrono::Duration,
    ) -> Self {
        let now = Utc::now();
        OutstandingJobRecord {
            endpoint_id: request.endpoint_id.clone(),
            job_id: request.job_id.clone(),
            variant,
            region_count: Some(region_count),
            attempt_state: AttemptState::New,
            attempt_count: 0,
            created_at: now,
            last_transition_at: now,
            expire_time: now + ttl,
            request_payload: request,
        }
    }

    /// Estimated concurrent inference requests this job generates:
    /// `region_count * tile_workers`.
    pub fn estimated_load(&self, tile_workers: u32) -> u32 {
        self.region_count.unwrap_or(LEGACY_REGION_ESTIMATE) * tile_workers
    }

    /// Whether this record is waiting to be started.
    pub fn is_startable(&self) -> bool {
        match self.attempt_state {
            AttemptState::New | AttemptState::Failed => true,
            AttemptState::InProgress | AttemptState::Succeeded => false,
        }
    }
}

/// The store contract. All operations are atomic with serializable
/// semantics; `start_next_attempt` arbitrates races between workers.
pub trait JobStore: Send + Sync {
    /// Insert a new record. Fails with `DuplicateJob` if the key exists.
    fn insert(&self, record: OutstandingJobRecord) -> Result<()>;

    /// All records not yet succeeded.
    fn list_outstanding(&self) -> Result<Vec<OutstandingJobRecord>>;

    /// Outstanding records for one endpoint.
    fn list_for_endpoint(&self, endpoint_id: &str) -> Result<Vec<OutstandingJobRecord>>;

    /// Conditionally transition to in-progress. `Ok(true)` for exactly one
    /// concurrent caller when the record is startable; `Ok(false)` for the
    /// losers.
    fn start_next_attempt(&self, endpoint_id: &str, job_id: &str) -> Result<bool>;

    /// Record the outcome of a finished attempt.
    fn complete(&self, endpoint_id: &str, job_id: &str, outcome: JobOutcome) -> Result<()>;

    /// Refresh a record's expiry.
    fn touch_ttl(&self, endpoint_id: &str, job_id: &str) -> Result<()>;
}

/// In-memory store with the canonical transactional semantics.
pub struct MemStore {
    records: Mutex<HashMap<(String, String), OutstandingJobRecord>>,
    ttl: chrono::Duration,
}

impl MemStore {
    pub fn new(ttl: chrono::Duration) -> Self {
        MemStore {
            records: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Every record, including succeeded ones. Used by listings.
    pub fn list_all(&self) -> Vec<OutstandingJobRecord> {
        let mut records = self.records.lock().unwrap();
        Self::sweep(&mut records);
        let mut all: Vec<_> = records.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.job_id.cmp(&b.job_id)));
        all
    }

    /// Drop terminal records whose TTL has lapsed.
    fn sweep(records: &mut HashMap<(String, String), OutstandingJobRecord>) {
        let now = Utc::now();
        records.retain(|_, r| !(r.attempt_state.is_terminal() && r.expire_time < now));
    }

    fn key(endpoint_id: &str, job_id: &str) -> (String, String) {
        (endpoint_id.to_string(), job_id.to_string())
    }
}

impl JobStore for MemStore {
    fn insert(&self, record: OutstandingJobRecord) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        let key = Self::key(&record.endpoint_id, &record.job_id);

        if records.contains_key(&key) {
            return Err(SchedError::DuplicateJob {
                endpoint: record.endpoint_id,
                job: record.job_id,
            });
        }

        records.insert(key, record);
        Ok(())
    }

    fn list_outstanding(&self) -> Result<Vec<OutstandingJobRecord>> {
        let mut records = self.records.lock().unwrap();
        Self::sweep(&mut records);

        let mut outstanding: Vec<_> = records
            .values()
            .filter(|r| r.attempt_state != AttemptState::Succeeded)
            .cloned()
            .collect();
        outstanding.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.job_id.cmp(&b.job_id)));
        Ok(outstanding)
    }

    fn list_for_endpoint(&self, endpoint_id: &str) -> Result<Vec<OutstandingJobRecord>> {
        Ok(self
            .list_outstanding()?
            .into_iter()
            .filter(|r| r.endpoint_id == endpoint_id)
            .collect())
    }

    fn start_next_attempt(&self, endpoint_id: &str, job_id: &str) -> Result<bool> {
        let mut records = self.records.lock().unwrap();

        let record = records
            .get_mut(&Self::key(endpoint_id, job_id))
            .ok_or_else(|| SchedError::NoSuchJob {
                endpoint: endpoint_id.to_string(),
                job: job_id.to_string(),
            })?;

        if !record.is_startable() {
            return Ok(false);
        }

        record.attempt_state = AttemptState::InProgress;
        record.attempt_count += 1;
        record.last_transition_at = Utc::now();
        Ok(true)
    }

    fn complete(&self, endpoint_id: &str, job_id: &str, outcome: JobOutcome) -> Result<()> {
        let mut records = self.records.lock().unwrap();

        let record = records
            .get_mut(&Self::key(endpoint_id, job_id))
            .ok_or_else(|| SchedError::NoSuchJob {
                endpoint: endpoint_id.to_string(),
                job: job_id.to_string(),
            })?;

        record.attempt_state = match outcome {
            JobOutcome::Succeeded => AttemptState::Succeeded,
            JobOutcome::Failed => AttemptState::Failed,
        };
        record.last_transition_at = Utc::now();
        Ok(())
    }

    fn touch_ttl(&self, endpoint_id: &str, job_id: &str) -> Result<()> {
        let mut records = self.records.lock().unwrap();

        let record = records
            .get_mut(&Self::key(endpoint_id, job_id))
            .ok_or_else(|| SchedError::NoSuchJob {
                endpoint: endpoint_id.to_string(),
                job: job_id.to_string(),
            })?;

        record.expire_time = Utc::now() + self.ttl;
        Ok(())
    }
}

/// Store client backed by the state server.
pub struct RemoteStore {
    addr: String,
}

impl RemoteStore {
    pub fn new(addr: &str) -> Self {
        RemoteStore {
            addr: addr.to_string(),
        }
    }

    fn request(&self, req: StoreReq) -> Result<StoreResp> {
        protocol_request(&self.addr, &req)
    }
}

impl JobStore for RemoteStore {
    fn insert(&self, record: OutstandingJobRecord) -> Result<()> {
        let endpoint = record.endpoint_id.clone();
        let job = record.job_id.clone();

        match self.request(StoreReq::Insert { record })? {
            StoreResp::Ok => Ok(()),
            StoreResp::DuplicateJob => Err(SchedError::DuplicateJob { endpoint, job }),
            other => Err(SchedError::Store(format!("unexpected response {:?}", other))),
        }
    }

    fn list_outstanding(&self) -> Result<Vec<OutstandingJobRecord>> {
        match self.request(StoreReq::ListOutstanding)? {
            StoreResp::Records(records) => Ok(records),
            other => Err(SchedError::Store(format!("unexpected response {:?}", other))),
        }
    }

    fn list_for_endpoint(&self, endpoint_id: &str) -> Result<Vec<OutstandingJobRecord>> {
        let req = StoreReq::ListForEndpoint {
            endpoint_id: endpoint_id.to_string(),
        };
        match self.request(req)? {
            StoreResp::Records(records) => Ok(records),
            other => Err(SchedError::Store(format!("unexpected response {:?}", other))),
        }
    }

    fn start_next_attempt(&self, endpoint_id: &str, job_id: &str) -> Result<bool> {
        let req = StoreReq::StartNextAttempt {
            endpoint_id: endpoint_id.to_string(),
            job_id: job_id.to_string(),
        };
        match self.request(req)? {
            StoreResp::Started(won) => Ok(won),
            StoreResp::NoSuchJob => Err(SchedError::NoSuchJob {
                endpoint: endpoint_id.to_string(),
                job: job_id.to_string(),
            }),
            other => Err(SchedError::Store(format!("unexpected response {:?}", other))),
        }
    }

    fn complete(&self, endpoint_id: &str, job_id: &str, outcome: JobOutcome) -> Result<()> {
        let req = StoreReq::Complete {
            endpoint_id: endpoint_id.to_string(),
            job_id: job_id.to_string(),
            outcome,
        };
        match self.request(req)? {
            StoreResp::Ok => Ok(()),
            StoreResp::NoSuchJob => Err(SchedError::NoSuchJob {
                endpoint: endpoint_id.to_string(),
                job: job_id.to_string(),
            }),
            other => Err(SchedError::Store(format!("unexpected response {:?}", other))),
        }
    }

    fn touch_ttl(&self, endpoint_id: &str, job_id: &str) -> Result<()> {
        let req = StoreReq::TouchTtl {
            endpoint_id: endpoint_id.to_string(),
            job_id: job_id.to_string(),
        };
        match self.request(req)? {
            StoreResp::Ok => Ok(()),
            StoreResp::NoSuchJob => Err(SchedError::NoSuchJob {
                endpoint: endpoint_id.to_string(),
                job: job_id.to_string(),
            }),
            other => Err(SchedError::Store(format!("unexpected response {:?}", other))),
        }
    }
}
