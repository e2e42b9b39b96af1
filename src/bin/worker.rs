//! Worker daemon: runs the scheduling loop against the shared state server.
//!
//! Each tick drains and enriches newly queued requests, then tries to start
//! the best waiting job. Started jobs are handed to the tile-dispatch
//! pipeline through an in-process channel; everything past that channel is
//! another subsystem's problem.

use std::sync::Arc;
use std::time::Duration;

use clap::clap_app;

use crossbeam::channel::{unbounded, Receiver};

use imageserver::capacity::CapacityEstimator;
use imageserver::config::SchedulerConfig;
use imageserver::imagery::GeoTiffHeaderReader;
use imageserver::metadata::{HttpDescribeClient, MetadataCache};
use imageserver::queue::{BufferedRequestQueue, RemoteQueue, RequestQueue};
use imageserver::regions::RegionCalculator;
use imageserver::sched::EndpointLoadScheduler;
use imageserver::store::{JobStore, OutstandingJobRecord, RemoteStore};
use imageserver::variant::VariantSelector;
use imageserver::SERVER_ADDR;

use log::{error, info};

/// Pause between ticks when there is nothing to do.
const TICK_PAUSE: Duration = Duration::from_secs(1);

/// Consumes started jobs on behalf of the tile-dispatch subsystem.
fn start_dispatch_thread(started: Receiver<OutstandingJobRecord>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        for record in started.iter() {
            info!(
                "Dispatching job {} on endpoint {} ({:?} regions, attempt {})",
                record.job_id, record.endpoint_id, record.region_count, record.attempt_count
            );
        }
    })
}

fn run(server_addr: &str, metadata_base: &str, seed: Option<u64>) -> Result<(), failure::Error> {
    let config = SchedulerConfig::from_env();
    info!("Worker configuration: {:?}", config);

    let store: Arc<dyn JobStore> = Arc::new(RemoteStore::new(server_addr));
    let queue: Arc<dyn RequestQueue> = Arc::new(RemoteQueue::new(server_addr));

    let metadata = Arc::new(MetadataCache::new(
        Box::new(HttpDescribeClient::new(metadata_base)?),
        config.metadata_cache_ttl,
    ));

    let selector = Arc::new(match seed {
        Some(seed) => VariantSelector::with_seed(Arc::clone(&metadata), seed),
        None => VariantSelector::new(Arc::clone(&metadata)),
    });

    let regions = Arc::new(RegionCalculator::new(Box::new(GeoTiffHeaderReader::new()?)));

    let buffered = BufferedRequestQueue::new(
        Arc::clone(&queue),
        Arc::clone(&store),
        selector,
        regions,
    );

    let (sender, receiver) = unbounded();
    let _dispatch = start_dispatch_thread(receiver);

    let scheduler = EndpointLoadScheduler::new(Arc::clone(&store), CapacityEstimator::new(metadata), sender);

    info!("Scheduling against state server at {}", server_addr);

    loop {
        // Options are re-read every tick so operators can retune a live
        // worker.
        let config = SchedulerConfig::from_env();

        let accepted = buffered.tick(&config);
        if accepted > 0 {
            info!(
                "Accepted {} new jobs ({} image access errors so far)",
                accepted,
                buffered.image_access_errors()
            );
        }

        if scheduler.tick(&config).is_none() {
            std::thread::sleep(TICK_PAUSE);
        }
    }
}

fn main() {
    let matches = clap_app! { worker =>
        (about: "Schedules image-processing jobs onto model endpoints")
        (@arg ADDR: --addr +takes_value
         "The IP:PORT of the state server (defaults to `localhost:3040`)")
        (@arg METADATA: --metadata +takes_value +required
         "Base URL of the model-hosting metadata service")
        (@arg SEED: --seed +takes_value
         "Fixed seed for variant selection (defaults to entropy)")
    }
    .get_matches();

    let addr = matches.value_of("ADDR").unwrap_or(SERVER_ADDR);
    let metadata = matches.value_of("METADATA").unwrap();
    let seed = matches
        .value_of("SEED")
        .map(|s| s.parse().expect("seed must be an integer"));

    // Start logger
    env_logger::init();

    if let Err(e) = run(addr, metadata, seed) {
        error!("Worker failed: {}", e);
        std::process::exit(1);
    }
}
