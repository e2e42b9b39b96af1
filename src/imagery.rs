//! Remote image header access.
//!
//! Region calculation needs only an image's dimensions and, when present,
//! its geo transform. Images are hundreds of gigabytes, so the reader never
//! downloads one: a `Read + Seek` adapter issues HTTP range requests on
//! demand and the TIFF decoder pulls just the header bytes through it.

use std::io::{self, Read, Seek, SeekFrom};
use std::time::Duration;

use tiff::decoder::Decoder;
use tiff::tags::Tag;

use crate::error::{Result, SchedError};

/// Timeout for a single range request.
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Bytes fetched per range request. Header IFDs fit in a few chunks.
const FETCH_CHUNK: u64 = 64 * 1024;

/// Header forwarding the submitter's credentials hint to the object store.
const READ_ROLE_HEADER: &str = "x-image-read-role";

/// What the scheduler needs from an image header.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageHeader {
    /// Raster width in pixels.
    pub width: u64,

    /// Raster height in pixels.
    pub height: u64,

    /// Affine pixel/world mapping, when the image is georeferenced.
    pub sensor_model: Option<SensorModel>,
}

/// Affine sensor model from GeoTIFF pixel-scale and tiepoint tags.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorModel {
    pub scale_x: f64,
    pub scale_y: f64,
    pub tiepoint_px: f64,
    pub tiepoint_py: f64,
    pub tiepoint_wx: f64,
    pub tiepoint_wy: f64,
}

impl SensorModel {
    /// Map world coordinates to (column, row) pixel coordinates.
    pub fn world_to_pixel(&self, wx: f64, wy: f64) -> (f64, f64) {
        let px = self.tiepoint_px + (wx - self.tiepoint_wx) / self.scale_x;
        let py = self.tiepoint_py + (self.tiepoint_wy - wy) / self.scale_y;
        (px, py)
    }

    /// Map (column, row) pixel coordinates to world coordinates.
    pub fn pixel_to_world(&self, px: f64, py: f64) -> (f64, f64) {
        let wx = self.tiepoint_wx + (px - self.tiepoint_px) * self.scale_x;
        let wy = self.tiepoint_wy - (py - self.tiepoint_py) * self.scale_y;
        (wx, wy)
    }
}

/// Contract for reading a remote image's header.
pub trait ImageHeaderReader: Send + Sync {
    fn read_header(&self, url: &str, read_role: Option<&str>) -> Result<ImageHeader>;
}

/// One fetched byte range plus the total object length reported alongside.
pub struct FetchedRange {
    pub bytes: Vec<u8>,
    pub total_len: u64,
}

/// Transport for partial object reads.
pub trait RangeFetch {
    /// Fetch up to `len` bytes starting at `start`. May return fewer bytes
    /// at end of object.
    fn fetch(&self, start: u64, len: u64) -> Result<FetchedRange>;
}

/// `Read + Seek` over a [`RangeFetch`], buffering one chunk at a time.
pub struct RangeReader<F: RangeFetch> {
    fetch: F,
    pos: u64,
    total_len: Option<u64>,
    buf: Vec<u8>,
    buf_start: u64,
}

impl<F: RangeFetch> RangeReader<F> {
    pub fn new(fetch: F) -> Self {
        RangeReader {
            fetch,
            pos: 0,
            total_len: None,
            buf: Vec::new(),
            buf_start: 0,
        }
    }

    fn fill_at(&mut self, pos: u64) -> io::Result<()> {
        let fetched = self
            .fetch
            .fetch(pos, FETCH_CHUNK)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        self.total_len = Some(fetched.total_len);
        self.buf = fetched.bytes;
        self.buf_start = pos;
        Ok(())
    }

    fn known_len(&mut self) -> io::Result<u64> {
        match self.total_len {
            Some(len) => Ok(len),
            None => {
                self.fill_at(0)?;
                Ok(self.total_len.unwrap())
            }
        }
    }
}

impl<F: RangeFetch> Read for RangeReader<F> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        if let Some(total) = self.total_len {
            if self.pos >= total {
                return Ok(0);
            }
        }

        let buf_end = self.buf_start + self.buf.len() as u64;
        if self.pos < self.buf_start || self.pos >= buf_end {
            self.fill_at(self.pos)?;
            if self.buf.is_empty() {
                return Ok(0);
            }
        }

        let offset = (self.pos - self.buf_start) as usize;
        let n = out.len().min(self.buf.len() - offset);
        out[..n].copy_from_slice(&self.buf[offset..offset + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl<F: RangeFetch> Seek for RangeReader<F> {
    fn seek(&mut self, target: SeekFrom) -> io::Result<u64> {
        let new_pos = match target {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::Current(d) => {
                if d >= 0 {
                    self.pos.checked_add(d as u64)
                } else {
                    self.pos.checked_sub(d.unsigned_abs())
                }
            }
            SeekFrom::End(d) => {
                let len = self.known_len()?;
                if d >= 0 {
                    len.checked_add(d as u64)
                } else {
                    len.checked_sub(d.unsigned_abs())
                }
            }
        };

        match new_pos {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of object",
            )),
        }
    }
}

/// Range transport over HTTP.
pub struct HttpRangeFetch {
    client: reqwest::blocking::Client,
    url: String,
    read_role: Option<String>,
}

impl HttpRangeFetch {
    pub fn new(client: reqwest::blocking::Client, url: &str, read_role: Option<&str>) -> Self {
        HttpRangeFetch {
            client,
            url: url.to_string(),
            read_role: read_role.map(String::from),
        }
    }

    fn load_err(&self, cause: String) -> SchedError {
        SchedError::LoadImage {
            url: self.url.clone(),
            cause,
        }
    }
}

impl RangeFetch for HttpRangeFetch {
    fn fetch(&self, start: u64, len: u64) -> Result<FetchedRange> {
        let mut request = self.client.get(&self.url).header(
            reqwest::header::RANGE,
            format!("bytes={}-{}", start, start + len - 1),
        );

        if let Some(role) = &self.read_role {
            request = request.header(READ_ROLE_HEADER, role.as_str());
        }

        let response = request.send().map_err(|e| self.load_err(e.to_string()))?;
        let status = response.status();

        if status == reqwest::StatusCode::PARTIAL_CONTENT {
            let total = response
                .headers()
                .get(reqwest::header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_content_range_total)
                .ok_or_else(|| self.load_err("missing or bad Content-Range".into()))?;

            let bytes = response
                .bytes()
                .map_err(|e| self.load_err(e.to_string()))?
                .to_vec();

            Ok(FetchedRange {
                bytes,
                total_len: total,
            })
        } else if status.is_success() {
            // The server ignored the range request and sent the whole object.
            let body = response
                .bytes()
                .map_err(|e| self.load_err(e.to_string()))?
                .to_vec();
            let total = body.len() as u64;

            let start = start.min(total) as usize;
            let end = (start + len as usize).min(body.len());

            Ok(FetchedRange {
                bytes: body[start..end].to_vec(),
                total_len: total,
            })
        } else {
            Err(self.load_err(format!("range read returned {}", status)))
        }
    }
}

/// `Content-Range: bytes 0-65535/1234567` -> total length.
fn parse_content_range_total(value: &str) -> Option<u64> {
    value.rsplit('/').next()?.trim().parse().ok()
}

/// Reads GeoTIFF headers over HTTP range requests.
pub struct GeoTiffHeaderReader {
    client: reqwest::blocking::Client,
}

impl GeoTiffHeaderReader {
    pub fn new() -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(HEADER_READ_TIMEOUT)
            .build()
            .map_err(|e| SchedError::LoadImage {
                url: String::new(),
                cause: format!("http client: {}", e),
            })?;

        Ok(GeoTiffHeaderReader { client })
    }
}

impl ImageHeaderReader for GeoTiffHeaderReader {
    fn read_header(&self, url: &str, read_role: Option<&str>) -> Result<ImageHeader> {
        let fetch = HttpRangeFetch::new(self.client.clone(), url, read_role);
        let reader = RangeReader::new(fetch);
        decode_header(reader).map_err(|cause| SchedError::LoadImage {
            url: url.to_string(),
            cause,
        })
    }
}

/// Decode dimensions and geo tags from a TIFF stream.
fn decode_header<R: Read + Seek>(reader: R) -> std::result::Result<ImageHeader, String> {
    let mut decoder = Decoder::new(reader).map_err(|e| format!("not a readable TIFF: {}", e))?;

    let (width, height) = decoder
        .dimensions()
        .map_err(|e| format!("no image dimensions: {}", e))?;

    let pixel_scale = read_f64_tag(&mut decoder, Tag::ModelPixelScaleTag);
    let tiepoint = read_f64_tag(&mut decoder, Tag::ModelTiepointTag);

    let sensor_model = match (pixel_scale, tiepoint) {
        (Some(scale), Some(tie)) if scale.len() >= 2 && tie.len() >= 6 => Some(SensorModel {
            scale_x: scale[0],
            scale_y: scale[1],
            tiepoint_px: tie[0],
            tiepoint_py: tie[1],
            tiepoint_wx: tie[3],
            tiepoint_wy: tie[4],
        }),
        _ => None,
    };

    Ok(ImageHeader {
        width: u64::from(width),
        height: u64::from(height),
        sensor_model,
    })
}

fn read_f64_tag<R: Read + Seek>(decoder: &mut Decoder<R>, tag: Tag) -> Option<Vec<f64>> {
    decoder
        .find_tag(tag)
        .ok()
        .and_then(|value| value)
        .and_then(|value| value.into_f64_vec().ok())
}
