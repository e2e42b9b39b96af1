//! The request queue: external FIFO, dead-letter queue, and the buffered
//! validation pipeline in front of the store.
//!
//! The FIFO delivers at least once, so everything downstream of `receive`
//! must tolerate redelivery: enrichment is read-only against collaborators
//! and insertion treats a duplicate key as success.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedError};
use crate::regions::RegionCalculator;
use crate::store::{JobStore, OutstandingJobRecord};
use crate::variant::VariantSelector;
use crate::{protocol_request, RawRequestMessage, StoreReq, StoreResp};

/// How long a received message stays invisible before redelivery.
const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// A FIFO message as handed to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedMessage {
    /// Receipt handle for deleting this delivery.
    pub receipt: String,

    /// The raw request payload.
    pub body: String,

    /// How many times this message has been delivered.
    pub receive_count: u32,
}

/// An unprocessable payload, parked with its cause.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub body: String,
    pub cause: String,
    pub at: DateTime<Utc>,
}

/// The external FIFO contract: at-least-once delivery, per-message delete,
/// explicit dead-lettering.
pub trait RequestQueue: Send + Sync {
    fn submit(&self, body: &str) -> Result<()>;
    fn receive(&self, max: u32) -> Result<Vec<QueuedMessage>>;
    fn delete(&self, receipt: &str) -> Result<()>;
    fn publish_dlq(&self, body: &str, cause: &str) -> Result<()>;
    fn list_dlq(&self) -> Result<Vec<DeadLetter>>;
}

struct StoredMessage {
    id: u64,
    body: String,
    receive_count: u32,
    invisible_until: Option<Instant>,
}

struct QueueInner {
    messages: VecDeque<StoredMessage>,
    dlq: Vec<DeadLetter>,
    next_id: u64,
}

/// In-memory FIFO with the canonical delivery semantics. Hosted by the
/// state server; driven directly by tests.
pub struct MemQueue {
    inner: Mutex<QueueInner>,
    max_receive_count: u32,
}

impl MemQueue {
    pub fn new(max_receive_count: u32) -> Self {
        MemQueue {
            inner: Mutex::new(QueueInner {
                messages: VecDeque::new(),
                dlq: Vec::new(),
                next_id: 0,
            }),
            max_receive_count,
        }
    }
}

impl RequestQueue for MemQueue {
    fn submit(&self, body: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;

        inner.messages.push_back(StoredMessage {
            id,
            body: body.to_string(),
            receive_count: 0,
            invisible_until: None,
        });
        Ok(())
    }

    fn receive(&self, max: u32) -> Result<Vec<QueuedMessage>> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let max_receive_count = self.max_receive_count;

        let mut delivered = Vec::new();
        let mut exhausted = Vec::new();

        for message in inner.messages.iter_mut() {
            if delivered.len() as u32 >= max {
                break;
            }

            let visible = match message.invisible_until {
                None => true,
                Some(until) => until <= now,
            };
            if !visible {
                continue;
            }

            message.receive_count += 1;

            if message.receive_count > max_receive_count {
                exhausted.push(message.id);
                continue;
            }

            message.invisible_until = Some(now + VISIBILITY_TIMEOUT);
            delivered.push(QueuedMessage {
                receipt: format!("{}:{}", message.id, message.receive_count),
                body: message.body.clone(),
                receive_count: message.receive_count,
            });
        }

        // Messages past their receive budget route to the DLQ automatically.
        for id in exhausted {
            if let Some(pos) = inner.messages.iter().position(|m| m.id == id) {
                let message = inner.messages.remove(pos).unwrap();
                warn!(
                    "Message {} exceeded {} receives; dead-lettering",
                    id, max_receive_count
                );
                inner.dlq.push(DeadLetter {
                    body: message.body,
                    cause: format!("exceeded max receive count {}", max_receive_count),
                    at: Utc::now(),
                });
            }
        }

        Ok(delivered)
    }

    fn delete(&self, receipt: &str) -> Result<()> {
        let (id, count) = parse_receipt(receipt)?;
        let mut inner = self.inner.lock().unwrap();

        let pos = inner
            .messages
            .iter()
            .position(|m| m.id == id && m.receive_count == count);

        match pos {
            Some(pos) => {
                inner.messages.remove(pos);
                Ok(())
            }
            None => Err(SchedError::NoSuchMessage(receipt.to_string())),
        }
    }

    fn publish_dlq(&self, body: &str, cause: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.dlq.push(DeadLetter {
            body: body.to_string(),
            cause: cause.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    fn list_dlq(&self) -> Result<Vec<DeadLetter>> {
        Ok(self.inner.lock().unwrap().dlq.clone())
    }
}

fn parse_receipt(receipt: &str) -> Result<(u64, u32)> {
    let bad = || SchedError::NoSuchMessage(receipt.to_string());

    let mut parts = receipt.splitn(2, ':');
    let id = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    let count = parts.next().and_then(|s| s.parse().ok()).ok_or_else(bad)?;
    Ok((id, count))
}

/// Queue client backed by the state server.
pub struct RemoteQueue {
    addr: String,
}

impl RemoteQueue {
    pub fn new(addr: &str) -> Self {
        RemoteQueue {
            addr: addr.to_string(),
        }
    }

    fn request(&self, req: StoreReq) -> Result<StoreResp> {
        protocol_request(&self.addr, &req)
    }
}

impl RequestQueue for RemoteQueue {
    fn submit(&self, body: &str) -> Result<()> {
        match self.request(StoreReq::SubmitRequest {
            body: body.to_string(),
        })? {
            StoreResp::Ok => Ok(()),
            other => Err(SchedError::Queue(format!("unexpected response {:?}", other))),
        }
    }

    fn receive(&self, max: u32) -> Result<Vec<QueuedMessage>> {
        match self.request(StoreReq::ReceiveRequests { max })? {
            StoreResp::Messages(messages) => Ok(messages),
            other => Err(SchedError::Queue(format!("unexpected response {:?}", other))),
        }
    }

    fn delete(&self, receipt: &str) -> Result<()> {
        match self.request(StoreReq::DeleteMessage {
            receipt: receipt.to_string(),
        })? {
            StoreResp::Ok => Ok(()),
            StoreResp::NoSuchMessage => Err(SchedError::NoSuchMessage(receipt.to_string())),
            other => Err(SchedError::Queue(format!("unexpected response {:?}", other))),
        }
    }

    fn publish_dlq(&self, body: &str, cause: &str) -> Result<()> {
        match self.request(StoreReq::PublishDlq {
            body: body.to_string(),
            cause: cause.to_string(),
        })? {
            StoreResp::Ok => Ok(()),
            other => Err(SchedError::Queue(format!("unexpected response {:?}", other))),
        }
    }

    fn list_dlq(&self) -> Result<Vec<DeadLetter>> {
        match self.request(StoreReq::ListDlq)? {
            StoreResp::DeadLetters(letters) => Ok(letters),
            other => Err(SchedError::Queue(format!("unexpected response {:?}", other))),
        }
    }
}

/// Pulls requests from the FIFO, validates and enriches them, and persists
/// them so the scheduler can see upcoming work.
pub struct BufferedRequestQueue {
    queue: Arc<dyn RequestQueue>,
    store: Arc<dyn JobStore>,
    selector: Arc<VariantSelector>,
    regions: Arc<RegionCalculator>,

    /// Requests dead-lettered because their image header was unreadable.
    image_access_errors: AtomicU64,
}

impl BufferedRequestQueue {
    pub fn new(
        queue: Arc<dyn RequestQueue>,
        store: Arc<dyn JobStore>,
        selector: Arc<VariantSelector>,
        regions: Arc<RegionCalculator>,
    ) -> Self {
        BufferedRequestQueue {
            queue,
            store,
            selector,
            regions,
            image_access_errors: AtomicU64::new(0),
        }
    }

    pub fn image_access_errors(&self) -> u64 {
        self.image_access_errors.load(Ordering::Relaxed)
    }

    /// Drain one batch from the FIFO. Returns the number of jobs accepted
    /// into the store.
    pub fn tick(&self, config: &SchedulerConfig) -> u32 {
        let messages = match self.queue.receive(config.fifo_fetch_limit) {
            Ok(messages) => messages,
            Err(e) => {
                warn!("FIFO receive failed: {}", e);
                return 0;
            }
        };

        if messages.is_empty() {
            debug!("No queued requests.");
            return 0;
        }

        let mut accepted = 0;
        for message in messages {
            match self.process(&message, config) {
                Ok(true) => accepted += 1,
                Ok(false) => {}
                Err(e) => {
                    // Transient: leave the message for redelivery.
                    warn!("Deferring message {}: {}", message.receipt, e);
                }
            }
        }

        accepted
    }

    /// Handle one delivery. `Ok(true)` means a new record was accepted,
    /// `Ok(false)` means the message was disposed of without one (DLQ'd or
    /// a duplicate); errors mean the message was left in the FIFO.
    fn process(&self, message: &QueuedMessage, config: &SchedulerConfig) -> Result<bool> {
        let request = match RawRequestMessage::parse(&message.body) {
            Ok(request) => request,
            Err(e) => {
                info!("Dead-lettering malformed request: {}", e);
                self.dead_letter(message, &e)?;
                return Ok(false);
            }
        };

        // Both enrichment calls are read-only, so a redelivered message can
        // safely repeat them.
        let request = self.selector.select_variant(request)?;

        let region_count = match self.regions.calculate_regions(
            &request.image_url,
            config.region_size,
            request.tile_size,
            request.tile_overlap,
            request.roi.as_deref(),
            request.image_read_role.as_deref(),
        ) {
            Ok(regions) => regions.len() as u32,
            Err(e) => {
                if e.is_fatal_for_request() {
                    if let SchedError::LoadImage { .. } = e {
                        self.image_access_errors.fetch_add(1, Ordering::Relaxed);
                    }
                    info!("Dead-lettering job {}: {}", request.job_id, e);
                    self.dead_letter(message, &e)?;
                    return Ok(false);
                }
                return Err(e);
            }
        };

        let variant = request.variant.clone().unwrap_or_default();
        let record =
            OutstandingJobRecord::new(request, variant, region_count, config.record_ttl);

        let endpoint_id = record.endpoint_id.clone();
        let job_id = record.job_id.clone();

        match self.store.insert(record) {
            Ok(()) => {
                info!(
                    "Accepted job {} for endpoint {} ({} regions)",
                    job_id, endpoint_id, region_count
                );
                self.queue.delete(&message.receipt)?;
                Ok(true)
            }

            // Redelivery of a request we already hold.
            Err(SchedError::DuplicateJob { .. }) => {
                debug!("Duplicate insert for job {}; deleting redelivery", job_id);
                self.queue.delete(&message.receipt)?;
                Ok(false)
            }

            Err(e) => Err(e),
        }
    }

    fn dead_letter(&self, message: &QueuedMessage, cause: &SchedError) -> Result<()> {
        self.queue
            .publish_dlq(&message.body, &cause.to_string())?;
        self.queue.delete(&message.receipt)
    }
}
