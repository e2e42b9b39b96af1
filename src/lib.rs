//! Common definitions for the state server, the scheduler workers, and the
//! operator client.
//!
//! Very large overhead images are submitted as jobs, decomposed into regions
//! and tiles, and dispatched to ML model endpoints. The pieces in this crate
//! decide *when* a job may start and *which* endpoint variant it targets:
//! workers pull requests from a shared FIFO, enrich them with a variant and a
//! region count, persist them, and then race to atomically start the least
//! disruptive job per tick.

pub mod capacity;
pub mod config;
pub mod error;
pub mod imagery;
pub mod metadata;
pub mod queue;
pub mod regions;
pub mod sched;
pub mod store;
pub mod variant;

use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedError};
use crate::queue::{DeadLetter, QueuedMessage};
use crate::store::{JobOutcome, OutstandingJobRecord};

/// The address where the state server listens.
pub const SERVER_ADDR: &str = "127.0.0.1:3040";

/// Timeout applied to every store/queue round trip.
pub const STORE_OP_TIMEOUT: Duration = Duration::from_secs(2);

/// Whether an endpoint identifier names a plain HTTP endpoint rather than a
/// model-hosting (SageMaker-style) endpoint.
pub fn is_http_endpoint(endpoint_id: &str) -> bool {
    endpoint_id.starts_with("http://") || endpoint_id.starts_with("https://")
}

/// A request to the state server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreReq {
    /// Used for debugging.
    Ping,

    /// Append a raw request payload to the FIFO.
    SubmitRequest {
        /// The JSON request payload as submitted.
        body: String,
    },

    /// Receive up to `max` visible FIFO messages.
    ReceiveRequests { max: u32 },

    /// Delete a FIFO message by its receipt handle.
    DeleteMessage { receipt: String },

    /// Publish an unprocessable payload to the dead-letter queue.
    PublishDlq { body: String, cause: String },

    /// List dead-lettered payloads.
    ListDlq,

    /// Insert a new outstanding job record.
    Insert { record: OutstandingJobRecord },

    /// List all records not yet succeeded.
    ListOutstanding,

    /// List outstanding records for one endpoint.
    ListForEndpoint { endpoint_id: String },

    /// List every record, including succeeded ones.
    ListAll,

    /// Conditionally transition a record to in-progress.
    StartNextAttempt { endpoint_id: String, job_id: String },

    /// Record the outcome of a finished attempt.
    Complete {
        endpoint_id: String,
        job_id: String,
        outcome: JobOutcome,
    },

    /// Refresh a record's expiry.
    TouchTtl { endpoint_id: String, job_id: String },
}

/// A response from the state server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreResp {
    /// Succeeded. No return value.
    Ok,

    /// Succeeded. FIFO messages with their receipt handles.
    Messages(Vec<QueuedMessage>),

    /// Succeeded. The dead-letter queue contents.
    DeadLetters(Vec<DeadLetter>),

    /// Succeeded. Job records.
    Records(Vec<OutstandingJobRecord>),

    /// The result of a conditional start: `true` for the single winner.
    Started(bool),

    /// Error. A record with that key already exists.
    DuplicateJob,

    /// Error. No such job record.
    NoSuchJob,

    /// Error. No such FIFO message, or the receipt handle is stale.
    NoSuchMessage,
}

/// Perform one request/response round trip with the state server.
///
/// One connection per request: write the request, shut down the write side,
/// and read the response to EOF.
pub fn protocol_request(addr: &str, request: &StoreReq) -> Result<StoreResp> {
    let transport = |e: std::io::Error| SchedError::Store(format!("{}: {}", addr, e));

    let mut stream = TcpStream::connect(addr).map_err(transport)?;
    stream
        .set_read_timeout(Some(STORE_OP_TIMEOUT))
        .map_err(transport)?;
    stream
        .set_write_timeout(Some(STORE_OP_TIMEOUT))
        .map_err(transport)?;

    let request =
        serde_json::to_string(request).map_err(|e| SchedError::Store(format!("encode: {}", e)))?;

    stream.write_all(request.as_bytes()).map_err(transport)?;
    stream.shutdown(Shutdown::Write).map_err(transport)?;

    let mut response = String::new();
    stream.read_to_string(&mut response).map_err(transport)?;

    serde_json::from_str(&response).map_err(|e| SchedError::Store(format!("decode: {}", e)))
}

/// An image-processing request, validated and ready for enrichment.
///
/// Immutable once persisted inside an [`OutstandingJobRecord`]; later state
/// lives on the record, never on the request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageRequest {
    /// Unique job identifier.
    pub job_id: String,

    /// Human-readable job name.
    pub job_name: String,

    /// URL of the image to process. Only the first URL of a submission is
    /// used.
    pub image_url: String,

    /// The model endpoint: a SageMaker-style endpoint name or an
    /// `http(s)://` URL.
    pub endpoint_id: String,

    /// Explicit production variant, if the submitter pinned one.
    pub variant: Option<String>,

    /// Tile edge length in pixels.
    pub tile_size: u32,

    /// Overlap between adjacent tiles in pixels.
    pub tile_overlap: u32,

    /// Tile encoding handed to the endpoint.
    pub tile_format: String,

    /// Tile compression handed to the endpoint.
    pub tile_compression: String,

    /// Optional region of interest, WKT or GeoJSON polygon.
    pub roi: Option<String>,

    /// Output sink descriptors. Opaque to the scheduler.
    pub outputs: serde_json::Value,

    /// Credentials hint for reading the image.
    pub image_read_role: Option<String>,
}

/// The raw payload shape accepted from submitters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRequestMessage {
    pub job_id: String,
    #[serde(default)]
    pub job_name: String,
    pub image_urls: Vec<String>,
    #[serde(default)]
    pub outputs: serde_json::Value,
    pub endpoint: String,
    #[serde(default)]
    pub variant: Option<String>,
    pub tile_size: u32,
    pub tile_overlap: u32,
    pub tile_format: String,
    pub tile_compression: String,
    #[serde(default)]
    pub roi: Option<String>,
    #[serde(default)]
    pub image_read_role: Option<String>,
}

impl RawRequestMessage {
    /// Parse and structurally validate a request payload.
    pub fn parse(body: &str) -> Result<ImageRequest> {
        let raw: RawRequestMessage = serde_json::from_str(body)
            .map_err(|e| SchedError::Validation(format!("unparseable payload: {}", e)))?;

        if raw.job_id.is_empty() {
            return Err(SchedError::Validation("empty job_id".into()));
        }

        if raw.endpoint.is_empty() {
            return Err(SchedError::Validation("empty endpoint".into()));
        }

        let image_url = match raw.image_urls.first() {
            Some(url) if !url.is_empty() => url.clone(),
            _ => return Err(SchedError::Validation("no image URL".into())),
        };

        if raw.tile_size == 0 {
            return Err(SchedError::Validation("tile_size must be positive".into()));
        }

        if raw.tile_overlap >= raw.tile_size {
            return Err(SchedError::Validation(format!(
                "tile_overlap {} must be smaller than tile_size {}",
                raw.tile_overlap, raw.tile_size
            )));
        }

        Ok(ImageRequest {
            job_id: raw.job_id,
            job_name: raw.job_name,
            image_url,
            endpoint_id: raw.endpoint,
            variant: raw.variant,
            tile_size: raw.tile_size,
            tile_overlap: raw.tile_overlap,
            tile_format: raw.tile_format,
            tile_compression: raw.tile_compression,
            roi: raw.roi,
            outputs: raw.outputs,
            image_read_role: raw.image_read_role,
        })
    }
}
