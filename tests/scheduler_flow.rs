//! End-to-end flow: submit requests, validate and enrich them through the
//! buffered queue, and schedule them against endpoint capacity. Also
//! exercises the wire protocol against a live TCP listener.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpListener};
use std::sync::Arc;

use crossbeam::channel::unbounded;

use imageserver::capacity::CapacityEstimator;
use imageserver::config::SchedulerConfig;
use imageserver::error::{Result, SchedError};
use imageserver::imagery::{ImageHeader, ImageHeaderReader};
use imageserver::metadata::{
    DescribeEndpoints, EndpointDescription, MetadataCache, ProductionVariant, ServerlessConfig,
};
use imageserver::queue::{BufferedRequestQueue, MemQueue, RequestQueue};
use imageserver::regions::RegionCalculator;
use imageserver::sched::EndpointLoadScheduler;
use imageserver::store::{AttemptState, JobOutcome, JobStore, MemStore, RemoteStore};
use imageserver::{StoreReq, StoreResp};

const IMAGE_URL: &str = "https://imagery.example.com/scene.tif";

struct StaticMetadata(HashMap<String, EndpointDescription>);

impl DescribeEndpoints for StaticMetadata {
    fn describe_endpoint(&self, endpoint_id: &str) -> Result<EndpointDescription> {
        self.0
            .get(endpoint_id)
            .cloned()
            .ok_or_else(|| SchedError::CapacityLookup {
                endpoint: endpoint_id.to_string(),
                cause: "unknown endpoint".into(),
            })
    }
}

struct StaticImagery(HashMap<String, ImageHeader>);

impl ImageHeaderReader for StaticImagery {
    fn read_header(&self, url: &str, _read_role: Option<&str>) -> Result<ImageHeader> {
        self.0
            .get(url)
            .cloned()
            .ok_or_else(|| SchedError::LoadImage {
                url: url.to_string(),
                cause: "AccessDenied when reading header".into(),
            })
    }
}

fn payload(job_id: &str, image_url: &str) -> String {
    serde_json::json!({
        "job_id": job_id,
        "job_name": "flow test",
        "image_urls": [image_url],
        "outputs": [],
        "endpoint": "detector",
        "tile_size": 512,
        "tile_overlap": 32,
        "tile_format": "GTIFF",
        "tile_compression": "NONE"
    })
    .to_string()
}

#[test]
fn submissions_flow_from_queue_to_dispatch() {
    let queue = Arc::new(MemQueue::new(3));
    let store = Arc::new(MemStore::new(chrono::Duration::days(7)));

    let mut endpoints = HashMap::new();
    endpoints.insert(
        "detector".to_string(),
        EndpointDescription {
            production_variants: vec![ProductionVariant {
                name: "main".into(),
                current_weight: 1.0,
                instance_count: 0,
                serverless_config: Some(ServerlessConfig {
                    max_concurrency: 100,
                }),
            }],
            tags: HashMap::new(),
        },
    );
    let metadata = Arc::new(MetadataCache::new(
        Box::new(StaticMetadata(endpoints)),
        std::time::Duration::from_secs(300),
    ));

    let mut images = HashMap::new();
    images.insert(
        IMAGE_URL.to_string(),
        ImageHeader {
            width: 102400,
            height: 51200,
            sensor_model: None,
        },
    );

    let buffered = BufferedRequestQueue::new(
        Arc::clone(&queue) as Arc<dyn RequestQueue>,
        Arc::clone(&store) as Arc<dyn JobStore>,
        Arc::new(imageserver::variant::VariantSelector::with_seed(
            Arc::clone(&metadata),
            7,
        )),
        Arc::new(RegionCalculator::new(Box::new(StaticImagery(images)))),
    );

    let (sender, receiver) = unbounded();
    let scheduler = EndpointLoadScheduler::new(
        Arc::clone(&store) as Arc<dyn JobStore>,
        CapacityEstimator::new(metadata),
        sender,
    );

    let config = SchedulerConfig::default();

    // One good request, one structurally broken one, one whose image header
    // cannot be read.
    queue.submit(&payload("good", IMAGE_URL)).unwrap();
    queue.submit("{\"garbage\": true}").unwrap();
    queue
        .submit(&payload("dark", "https://imagery.example.com/forbidden.tif"))
        .unwrap();

    assert_eq!(buffered.tick(&config), 1);

    // Only the good job was persisted; the other two are dead letters.
    let outstanding = store.list_outstanding().unwrap();
    assert_eq!(outstanding.len(), 1);
    assert_eq!(outstanding[0].job_id, "good");
    assert_eq!(outstanding[0].variant, "main");
    // 102400 x 51200 at 10240-pixel regions.
    assert_eq!(outstanding[0].region_count, Some(50));

    let dlq = queue.list_dlq().unwrap();
    assert_eq!(dlq.len(), 2);
    assert!(dlq.iter().any(|l| l.cause.contains("malformed request")));
    assert!(dlq.iter().any(|l| l.cause.contains("unable to load image")));

    // The scheduler starts the job and hands it to the dispatch channel.
    let started = scheduler.tick(&config).expect("job should start");
    assert_eq!(started.job_id, "good");
    assert_eq!(started.attempt_state, AttemptState::InProgress);
    assert_eq!(receiver.recv().unwrap().job_id, "good");

    // Nothing more to start, and completion clears the backlog.
    assert!(scheduler.tick(&config).is_none());
    store
        .complete("detector", "good", JobOutcome::Succeeded)
        .unwrap();
    assert!(store.list_outstanding().unwrap().is_empty());
}

/// Serve the store protocol for a fixed number of connections.
fn serve_store(listener: TcpListener, store: Arc<MemStore>, connections: usize) {
    std::thread::spawn(move || {
        for stream in listener.incoming().take(connections) {
            let mut stream = stream.unwrap();

            let mut request = String::new();
            stream.read_to_string(&mut request).unwrap();
            stream.shutdown(Shutdown::Read).unwrap();

            let request: StoreReq = serde_json::from_str(&request).unwrap();
            let response = match request {
                StoreReq::Insert { record } => match store.insert(record) {
                    Ok(()) => StoreResp::Ok,
                    Err(SchedError::DuplicateJob { .. }) => StoreResp::DuplicateJob,
                    Err(_) => StoreResp::NoSuchJob,
                },
                StoreReq::ListOutstanding => {
                    StoreResp::Records(store.list_outstanding().unwrap())
                }
                StoreReq::StartNextAttempt {
                    endpoint_id,
                    job_id,
                } => match store.start_next_attempt(&endpoint_id, &job_id) {
                    Ok(won) => StoreResp::Started(won),
                    Err(_) => StoreResp::NoSuchJob,
                },
                StoreReq::Complete {
                    endpoint_id,
                    job_id,
                    outcome,
                } => match store.complete(&endpoint_id, &job_id, outcome) {
                    Ok(()) => StoreResp::Ok,
                    Err(_) => StoreResp::NoSuchJob,
                },
                other => panic!("unexpected request {:?}", other),
            };

            let response = serde_json::to_string(&response).unwrap();
            stream.write_all(response.as_bytes()).unwrap();
        }
    });
}

#[test]
fn remote_store_round_trips_the_wire_protocol() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let backing = Arc::new(MemStore::new(chrono::Duration::days(7)));
    serve_store(listener, Arc::clone(&backing), 6);

    let remote = RemoteStore::new(&addr);

    let request = imageserver::RawRequestMessage::parse(&payload("wire", IMAGE_URL)).unwrap();
    let record = imageserver::store::OutstandingJobRecord::new(
        request,
        "main".into(),
        4,
        chrono::Duration::days(7),
    );

    remote.insert(record.clone()).unwrap();

    // A second insert reports the duplicate through the protocol.
    match remote.insert(record) {
        Err(SchedError::DuplicateJob { .. }) => {}
        other => panic!("expected duplicate, got {:?}", other),
    }

    let listed = remote.list_outstanding().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].job_id, "wire");
    assert_eq!(listed[0].region_count, Some(4));

    assert!(remote.start_next_attempt("detector", "wire").unwrap());
    assert!(!remote.start_next_attempt("detector", "wire").unwrap());

    remote
        .complete("detector", "wire", JobOutcome::Succeeded)
        .unwrap();
    assert_eq!(backing.list_outstanding().unwrap().len(), 0);
}
