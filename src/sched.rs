//! The endpoint-load scheduler.
//!
//! Each tick looks at every outstanding job in the fleet, groups them by
//! `(endpoint, variant)`, and tries to start the oldest waiting job on the
//! least-loaded endpoint that has room for it. Capacity is only ever
//! reserved through the store's conditional `start_next_attempt`, so any
//! number of workers can tick concurrently against the same view.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use crossbeam::channel::Sender;
use itertools::Itertools;
use log::{debug, error, info, warn};

use crate::capacity::CapacityEstimator;
use crate::config::SchedulerConfig;
use crate::store::{AttemptState, JobStore, OutstandingJobRecord};

/// A tick that runs longer than this is abandoned.
const TICK_BUDGET: Duration = Duration::from_secs(60);

/// One `(endpoint, variant)` group of outstanding records.
struct Partition {
    endpoint_id: String,
    variant: String,
    records: Vec<OutstandingJobRecord>,

    /// `sum(region_count * workers)` over every outstanding record, waiting
    /// or running. Measures how backed up the partition is.
    backlog_load: u32,

    /// Same sum over in-progress records only. This is the capacity that is
    /// actually reserved on the endpoint right now.
    reserved_load: u32,

    /// Capacity cap for this partition; `None` when throttling is off.
    target_capacity: Option<u32>,
}

impl Partition {
    /// Sort key: fill ratio under throttling, raw backlog otherwise.
    fn load_ratio(&self) -> f64 {
        match self.target_capacity {
            Some(0) => f64::INFINITY,
            Some(target) => f64::from(self.backlog_load) / f64::from(target),
            None => f64::from(self.backlog_load),
        }
    }
}

/// Picks and atomically starts jobs, one per tick.
pub struct EndpointLoadScheduler {
    store: Arc<dyn JobStore>,
    capacity: CapacityEstimator,
    emit: Sender<OutstandingJobRecord>,
}

impl EndpointLoadScheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        capacity: CapacityEstimator,
        emit: Sender<OutstandingJobRecord>,
    ) -> Self {
        EndpointLoadScheduler {
            store,
            capacity,
            emit,
        }
    }

    /// Run one scheduling tick. Returns the started record, if any; the
    /// caller sleeps and re-ticks either way.
    pub fn tick(&self, config: &SchedulerConfig) -> Option<OutstandingJobRecord> {
        let started_at = Instant::now();

        let outstanding = match self.store.list_outstanding() {
            Ok(outstanding) => outstanding,
            Err(e) => {
                error!("Unable to list outstanding jobs: {}", e);
                return None;
            }
        };

        if outstanding.is_empty() {
            debug!("No outstanding jobs.");
            return None;
        }

        let mut partitions = self.build_partitions(outstanding, config);

        // Least-loaded first; ties go to the lexicographically smaller
        // endpoint, then variant.
        partitions.sort_by(|a, b| {
            a.load_ratio()
                .partial_cmp(&b.load_ratio())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.endpoint_id.cmp(&b.endpoint_id))
                .then_with(|| a.variant.cmp(&b.variant))
        });

        for partition in &partitions {
            if started_at.elapsed() > TICK_BUDGET {
                error!("Scheduling tick overran its budget; abandoning");
                return None;
            }

            if let Some(record) = self.try_partition(partition, config) {
                return Some(record);
            }
        }

        debug!("No job can start this tick.");
        None
    }

    /// Group outstanding records by `(endpoint, variant)` and compute each
    /// group's load and capacity target. Partitions whose capacity cannot be
    /// determined are dropped for the tick.
    fn build_partitions(
        &self,
        outstanding: Vec<OutstandingJobRecord>,
        config: &SchedulerConfig,
    ) -> Vec<Partition> {
        let workers = config.tile_workers_per_instance;

        let groups = outstanding
            .into_iter()
            .map(|r| ((r.endpoint_id.clone(), r.variant.clone()), r))
            .into_group_map();

        let mut partitions = Vec::with_capacity(groups.len());

        for ((endpoint_id, variant), records) in groups {
            let backlog_load = records.iter().map(|r| r.estimated_load(workers)).sum();
            let reserved_load = records
                .iter()
                .filter(|r| r.attempt_state == AttemptState::InProgress)
                .map(|r| r.estimated_load(workers))
                .sum();

            let target_capacity = if config.throttling_enabled {
                let variant_name = if variant.is_empty() {
                    None
                } else {
                    Some(variant.as_str())
                };

                match self
                    .capacity
                    .estimate_capacity(&endpoint_id, variant_name, config)
                {
                    Ok(max) => Some(config.target_capacity(max)),
                    Err(e) => {
                        error!(
                            "Skipping endpoint {} variant {:?} this tick: {}",
                            endpoint_id, variant, e
                        );
                        continue;
                    }
                }
            } else {
                None
            };

            partitions.push(Partition {
                endpoint_id,
                variant,
                records,
                backlog_load,
                reserved_load,
                target_capacity,
            });
        }

        partitions
    }

    /// Walk a partition's waiting records oldest-first and start the first
    /// one that fits. A record blocked by capacity does not block the ones
    /// behind it.
    fn try_partition(
        &self,
        partition: &Partition,
        config: &SchedulerConfig,
    ) -> Option<OutstandingJobRecord> {
        let workers = config.tile_workers_per_instance;
        let only_record = partition.records.len() == 1;

        let candidates = partition
            .records
            .iter()
            .filter(|r| r.is_startable())
            .sorted_by(|a, b| a.created_at.cmp(&b.created_at).then(a.job_id.cmp(&b.job_id)));

        for candidate in candidates {
            let load = candidate.estimated_load(workers);

            if let Some(target) = partition.target_capacity {
                let available = i64::from(target) - i64::from(partition.reserved_load);

                if available < i64::from(load) && !only_record {
                    debug!(
                        "Job {} needs {} but endpoint {} has {} available",
                        candidate.job_id, load, partition.endpoint_id, available
                    );
                    continue;
                }

                if available < i64::from(load) {
                    // Sole job on the partition: start it anyway, or an image
                    // larger than its endpoint would wait forever.
                    info!(
                        "Starting job {} over capacity on {}: only outstanding job",
                        candidate.job_id, partition.endpoint_id
                    );
                }
            }

            match self
                .store
                .start_next_attempt(&candidate.endpoint_id, &candidate.job_id)
            {
                Ok(true) => {
                    let mut started = candidate.clone();
                    started.attempt_state = AttemptState::InProgress;
                    started.attempt_count += 1;
                    started.last_transition_at = Utc::now();

                    info!(
                        "Starting job {} on endpoint {} variant {:?} (attempt {}, load {})",
                        started.job_id,
                        started.endpoint_id,
                        started.variant,
                        started.attempt_count,
                        load
                    );

                    if let Err(e) = self.emit.send(started.clone()) {
                        error!("Processing pipeline is gone: {}", e);
                    }

                    return Some(started);
                }

                // Another worker won the race; move on.
                Ok(false) => {
                    debug!(
                        "Lost the race to start job {} on {}",
                        candidate.job_id, candidate.endpoint_id
                    );
                    continue;
                }

                Err(e) => {
                    warn!(
                        "Start attempt for job {} on {} failed: {}",
                        candidate.job_id, candidate.endpoint_id, e
                    );
                    continue;
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::Result;
    use crate::metadata::test_support::*;
    use crate::metadata::{EndpointDescription, MetadataCache};
    use crate::store::test_support::*;
    use crate::store::{JobOutcome, MemStore};
    use crossbeam::channel::{unbounded, Receiver};
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    struct Fixture {
        store: Arc<MemStore>,
        describe: Arc<FakeDescribe>,
        sched: EndpointLoadScheduler,
        emitted: Receiver<OutstandingJobRecord>,
    }

    fn fixture(descriptions: HashMap<String, EndpointDescription>) -> Fixture {
        let store = Arc::new(MemStore::new(chrono::Duration::days(7)));
        let describe = Arc::new(FakeDescribe::new(descriptions));
        let cache = Arc::new(MetadataCache::new(
            Box::new(Arc::clone(&describe)),
            std::time::Duration::from_secs(300),
        ));
        let (sender, emitted) = unbounded();

        let sched = EndpointLoadScheduler::new(
            Arc::clone(&store) as Arc<dyn JobStore>,
            CapacityEstimator::new(cache),
            sender,
        );

        Fixture {
            store,
            describe,
            sched,
            emitted,
        }
    }

    fn serverless_endpoint(name: &str, variant: &str, max_concurrency: u32) -> (String, EndpointDescription) {
        (
            name.to_string(),
            description(vec![serverless_variant(variant, 1.0, max_concurrency)]),
        )
    }

    fn add_job(f: &Fixture, endpoint: &str, variant: &str, job_id: &str, regions: u32) {
        let mut record = record_for(endpoint, job_id, regions);
        record.variant = variant.to_string();
        f.store.insert(record).unwrap();
    }

    #[test]
    fn single_job_on_roomy_endpoint_starts_first_tick() {
        let f = fixture(vec![serverless_endpoint("e1", "main", 100)].into_iter().collect());
        add_job(&f, "e1", "main", "j1", 10);

        let started = f.sched.tick(&SchedulerConfig::default()).unwrap();
        assert_eq!(started.job_id, "j1");
        assert_eq!(started.attempt_state, AttemptState::InProgress);
        assert_eq!(started.attempt_count, 1);

        // Emitted to the processing pipeline too.
        assert_eq!(f.emitted.recv().unwrap().job_id, "j1");

        // Nothing left to start.
        assert!(f.sched.tick(&SchedulerConfig::default()).is_none());
    }

    #[test]
    fn full_endpoint_blocks_new_jobs_until_one_completes() {
        // Instance-backed: 3 instances x tag 5 = capacity 15.
        let mut desc = description(vec![instance_variant("main", 1.0, 3)]);
        desc.tags.insert(
            crate::capacity::INSTANCE_CONCURRENCY_TAG.into(),
            "5".into(),
        );
        let f = fixture(vec![("e2".to_string(), desc)].into_iter().collect());

        // Two in-progress jobs of load 8 each (16 > 15).
        for job in &["j1", "j2"] {
            add_job(&f, "e2", "main", job, 2);
            assert!(f.store.start_next_attempt("e2", job).unwrap());
        }
        add_job(&f, "e2", "main", "j3", 1);

        assert!(f.sched.tick(&SchedulerConfig::default()).is_none());

        f.store.complete("e2", "j1", JobOutcome::Succeeded).unwrap();

        // Load is now 8; 15 - 8 = 7 >= 4.
        let started = f.sched.tick(&SchedulerConfig::default()).unwrap();
        assert_eq!(started.job_id, "j3");
    }

    #[test]
    fn oversized_sole_job_starts_anyway() {
        let f = fixture(vec![serverless_endpoint("e3", "main", 10)].into_iter().collect());

        // Load 40 against capacity 10, but nothing else is outstanding.
        add_job(&f, "e3", "main", "j4", 10);

        let started = f.sched.tick(&SchedulerConfig::default()).unwrap();
        assert_eq!(started.job_id, "j4");
    }

    #[test]
    fn oversized_job_with_company_stays_blocked() {
        let f = fixture(vec![serverless_endpoint("e3", "main", 10)].into_iter().collect());

        add_job(&f, "e3", "main", "j1", 10);
        add_job(&f, "e3", "main", "j2", 10);

        // Neither fits and neither is alone.
        assert!(f.sched.tick(&SchedulerConfig::default()).is_none());
    }

    #[test]
    fn target_percentage_scales_capacity() {
        let f = fixture(vec![serverless_endpoint("e5", "main", 100)].into_iter().collect());

        let mut config = SchedulerConfig::default();
        config.capacity_target_percentage = 0.8;
        config.tile_workers_per_instance = 1;

        // In-progress load 70 against a target of 80.
        add_job(&f, "e5", "main", "busy", 70);
        assert!(f.store.start_next_attempt("e5", "busy").unwrap());

        // A 20-load job does not fit in the remaining 10...
        add_job(&f, "e5", "main", "wide", 20);
        assert!(f.sched.tick(&config).is_none());

        // ...but a 5-load job behind it does.
        add_job(&f, "e5", "main", "slim", 5);
        let started = f.sched.tick(&config).unwrap();
        assert_eq!(started.job_id, "slim");
    }

    #[test]
    fn disabled_throttling_never_consults_capacity() {
        let f = fixture(HashMap::new());

        let mut config = SchedulerConfig::default();
        config.throttling_enabled = false;

        // Metadata for this endpoint does not even exist.
        add_job(&f, "e9", "main", "j1", 1000);
        add_job(&f, "e9", "main", "j2", 1000);

        let started = f.sched.tick(&config).unwrap();
        assert_eq!(started.job_id, "j1");
        assert_eq!(f.describe.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn least_loaded_endpoint_goes_first() {
        let descriptions: HashMap<_, _> = vec![
            serverless_endpoint("busy", "main", 100),
            serverless_endpoint("idle", "main", 100),
        ]
        .into_iter()
        .collect();
        let f = fixture(descriptions);

        // "busy" carries an in-progress job; "idle" carries nothing.
        add_job(&f, "busy", "main", "running", 5);
        assert!(f.store.start_next_attempt("busy", "running").unwrap());
        add_job(&f, "busy", "main", "b1", 1);
        add_job(&f, "idle", "main", "i1", 1);

        let started = f.sched.tick(&SchedulerConfig::default()).unwrap();
        assert_eq!(started.endpoint_id, "idle");
        assert_eq!(started.job_id, "i1");
    }

    #[test]
    fn oldest_job_wins_within_a_partition() {
        let f = fixture(vec![serverless_endpoint("e1", "main", 1000)].into_iter().collect());

        let mut first = record_for("e1", "newer", 1);
        first.variant = "main".into();
        let mut second = record_for("e1", "older", 1);
        second.variant = "main".into();
        second.created_at = second.created_at - chrono::Duration::seconds(10);
        f.store.insert(first).unwrap();
        f.store.insert(second).unwrap();

        let started = f.sched.tick(&SchedulerConfig::default()).unwrap();
        assert_eq!(started.job_id, "older");
    }

    #[test]
    fn created_at_ties_break_by_job_id() {
        let f = fixture(vec![serverless_endpoint("e1", "main", 1000)].into_iter().collect());

        let now = Utc::now();
        for job in &["b", "a"] {
            let mut record = record_for("e1", job, 1);
            record.variant = "main".into();
            record.created_at = now;
            f.store.insert(record).unwrap();
        }

        let started = f.sched.tick(&SchedulerConfig::default()).unwrap();
        assert_eq!(started.job_id, "a");
    }

    #[test]
    fn failed_jobs_are_retried() {
        let f = fixture(vec![serverless_endpoint("e1", "main", 100)].into_iter().collect());
        add_job(&f, "e1", "main", "j1", 1);

        assert!(f.store.start_next_attempt("e1", "j1").unwrap());
        f.store.complete("e1", "j1", JobOutcome::Failed).unwrap();

        let started = f.sched.tick(&SchedulerConfig::default()).unwrap();
        assert_eq!(started.job_id, "j1");
        assert_eq!(started.attempt_count, 2);
    }

    #[test]
    fn legacy_records_without_region_count_use_the_default_estimate() {
        let f = fixture(vec![serverless_endpoint("e1", "main", 100)].into_iter().collect());

        // 20 * 4 = 80 fits in 100; a second such job would not.
        let mut legacy = record_for("e1", "old1", 1);
        legacy.variant = "main".into();
        legacy.region_count = None;
        f.store.insert(legacy).unwrap();
        assert!(f.store.start_next_attempt("e1", "old1").unwrap());

        let mut legacy2 = record_for("e1", "old2", 1);
        legacy2.variant = "main".into();
        legacy2.region_count = None;
        f.store.insert(legacy2).unwrap();

        assert!(f.sched.tick(&SchedulerConfig::default()).is_none());
    }

    #[test]
    fn unknown_endpoint_capacity_skips_partition_not_tick() {
        let descriptions: HashMap<_, _> =
            vec![serverless_endpoint("known", "main", 100)].into_iter().collect();
        let f = fixture(descriptions);

        add_job(&f, "mystery", "main", "m1", 1);
        add_job(&f, "known", "main", "k1", 1);

        // The mystery endpoint has no metadata; the known one still starts.
        let started = f.sched.tick(&SchedulerConfig::default()).unwrap();
        assert_eq!(started.job_id, "k1");
    }

    #[test]
    fn in_progress_load_never_exceeds_target_with_company() {
        // Property: repeatedly tick and complete; whenever two or more jobs
        // are outstanding on the partition, in-progress load stays within
        // the target.
        let f = fixture(vec![serverless_endpoint("e1", "main", 40)].into_iter().collect());
        let config = SchedulerConfig::default();

        for i in 0..8 {
            add_job(&f, "e1", "main", &format!("j{}", i), 2);
        }

        loop {
            let outstanding = f.store.list_outstanding().unwrap();
            if outstanding.is_empty() {
                break;
            }

            if f.sched.tick(&config).is_none() {
                // Drain one running job to make room.
                let running = outstanding
                    .iter()
                    .find(|r| r.attempt_state == AttemptState::InProgress)
                    .expect("blocked tick with nothing running");
                f.store
                    .complete("e1", &running.job_id, JobOutcome::Succeeded)
                    .unwrap();
                continue;
            }

            let outstanding = f.store.list_outstanding().unwrap();
            let in_progress_load: u32 = outstanding
                .iter()
                .filter(|r| r.attempt_state == AttemptState::InProgress)
                .map(|r| r.estimated_load(config.tile_workers_per_instance))
                .sum();

            if outstanding.len() > 1 {
                assert!(
                    in_progress_load <= 40,
                    "in-progress load {} exceeds target",
                    in_progress_load
                );
            }
        }
    }

    #[test]
    fn http_endpoints_schedule_with_default_concurrency() {
        let f = fixture(HashMap::new());

        // Variant stays empty for HTTP endpoints and capacity needs no
        // metadata call.
        add_job(&f, "https://models.internal/detect", "", "j1", 2);

        let started = f.sched.tick(&SchedulerConfig::default()).unwrap();
        assert_eq!(started.job_id, "j1");
        assert_eq!(f.describe.calls.load(Ordering::SeqCst), 0);
    }

    /// Store wrapper that makes the wrapped job lose every start race.
    struct RacyStore {
        inner: Arc<MemStore>,
        loser: String,
    }

    impl JobStore for RacyStore {
        fn insert(&self, record: OutstandingJobRecord) -> Result<()> {
            self.inner.insert(record)
        }
        fn list_outstanding(&self) -> Result<Vec<OutstandingJobRecord>> {
            self.inner.list_outstanding()
        }
        fn list_for_endpoint(&self, endpoint_id: &str) -> Result<Vec<OutstandingJobRecord>> {
            self.inner.list_for_endpoint(endpoint_id)
        }
        fn start_next_attempt(&self, endpoint_id: &str, job_id: &str) -> Result<bool> {
            if job_id == self.loser {
                return Ok(false);
            }
            self.inner.start_next_attempt(endpoint_id, job_id)
        }
        fn complete(&self, endpoint_id: &str, job_id: &str, outcome: JobOutcome) -> Result<()> {
            self.inner.complete(endpoint_id, job_id, outcome)
        }
        fn touch_ttl(&self, endpoint_id: &str, job_id: &str) -> Result<()> {
            self.inner.touch_ttl(endpoint_id, job_id)
        }
    }

    #[test]
    fn race_losses_continue_the_walk() {
        let mem = Arc::new(MemStore::new(chrono::Duration::days(7)));
        let store = Arc::new(RacyStore {
            inner: Arc::clone(&mem),
            loser: "contested".to_string(),
        });

        let cache = Arc::new(MetadataCache::new(
            Box::new(FakeDescribe::single(
                "e1",
                description(vec![serverless_variant("main", 1.0, 1000)]),
            )),
            std::time::Duration::from_secs(300),
        ));
        let (sender, emitted) = unbounded();
        let sched = EndpointLoadScheduler::new(
            Arc::clone(&store) as Arc<dyn JobStore>,
            CapacityEstimator::new(cache),
            sender,
        );

        let now = Utc::now();
        let mut contested = record_for("e1", "contested", 1);
        contested.variant = "main".into();
        contested.created_at = now - chrono::Duration::seconds(10);
        mem.insert(contested).unwrap();

        let mut fallback = record_for("e1", "fallback", 1);
        fallback.variant = "main".into();
        fallback.created_at = now;
        mem.insert(fallback).unwrap();

        // The oldest job is lost to a concurrent worker; the walk moves on.
        let started = sched.tick(&SchedulerConfig::default()).unwrap();
        assert_eq!(started.job_id, "fallback");
        assert_eq!(emitted.recv().unwrap().job_id, "fallback");
    }
}
