//! Error taxonomy for the scheduling core.

use failure::Fail;

/// Errors produced by the scheduling core.
///
/// `DuplicateJob` and start-attempt race losses are part of normal operation
/// and are handled where they occur; everything else is contained to the
/// smallest meaningful unit of work (a message, a partition walk step, a
/// tick).
#[derive(Debug, Fail)]
pub enum SchedError {
    /// The request is structurally malformed and can never succeed.
    #[fail(display = "malformed request: {}", _0)]
    Validation(String),

    /// The image header could not be read. Fail-fast: such requests are
    /// dead-lettered and never persisted.
    #[fail(display = "unable to load image {}: {}", url, cause)]
    LoadImage { url: String, cause: String },

    /// Endpoint metadata could not be fetched and no cached value exists.
    #[fail(display = "capacity lookup failed for endpoint {}: {}", endpoint, cause)]
    CapacityLookup { endpoint: String, cause: String },

    /// No usable production variant (empty list or all weights zero).
    #[fail(display = "variant selection failed for endpoint {}: {}", endpoint, cause)]
    VariantSelection { endpoint: String, cause: String },

    /// A record with this `(endpoint_id, job_id)` already exists. Treated as
    /// idempotent success by the request queue.
    #[fail(display = "job ({}, {}) already exists", endpoint, job)]
    DuplicateJob { endpoint: String, job: String },

    /// The referenced record does not exist.
    #[fail(display = "no such job ({}, {})", endpoint, job)]
    NoSuchJob { endpoint: String, job: String },

    /// The referenced queue message does not exist or its receipt is stale.
    #[fail(display = "no such message: {}", _0)]
    NoSuchMessage(String),

    /// A store operation failed for transport or protocol reasons.
    #[fail(display = "store operation failed: {}", _0)]
    Store(String),

    /// A queue operation failed for transport or protocol reasons.
    #[fail(display = "queue operation failed: {}", _0)]
    Queue(String),
}

impl SchedError {
    /// Whether this error dooms the request (DLQ) rather than being worth a
    /// redelivery.
    pub fn is_fatal_for_request(&self) -> bool {
        match self {
            SchedError::Validation(..) | SchedError::LoadImage { .. } => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedError>;
