//! Region calculation.
//!
//! A job's scheduling load is proportional to the number of regions its
//! image decomposes into, so the calculator runs before a job is persisted.
//! It reads only the image header (dimensions plus geo transform), clips the
//! extent to the optional region of interest, and lays a row-major grid of
//! regions over the result. An unreadable header is the fail-fast boundary:
//! the request is dead-lettered and never enters the store.

use geo::BoundingRect;
use serde::{Deserialize, Serialize};
use wkt::TryFromWkt;

use crate::error::{Result, SchedError};
use crate::imagery::{ImageHeader, ImageHeaderReader};

/// One rectangular subdivision of an image, in pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionBounds {
    pub col_off: u64,
    pub row_off: u64,
    pub width: u64,
    pub height: u64,
}

/// Pixel-space processing bounds, half-open on both axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PixelBounds {
    x0: u64,
    y0: u64,
    x1: u64,
    y1: u64,
}

/// Computes the region decomposition of a remote image.
pub struct RegionCalculator {
    reader: Box<dyn ImageHeaderReader>,
}

impl RegionCalculator {
    pub fn new(reader: Box<dyn ImageHeaderReader>) -> Self {
        RegionCalculator { reader }
    }

    /// Decompose an image into regions.
    ///
    /// Returns the row-major list of region bounds. Regions tile the
    /// effective bounds without overlap, but each region is padded by
    /// `tile_overlap` at edges shared with a neighbor so detections crossing
    /// a boundary are seen by at least one region.
    pub fn calculate_regions(
        &self,
        image_url: &str,
        region_size: u32,
        tile_size: u32,
        tile_overlap: u32,
        roi: Option<&str>,
        read_role: Option<&str>,
    ) -> Result<Vec<RegionBounds>> {
        if tile_size == 0 || region_size < tile_size {
            return Err(SchedError::Validation(format!(
                "region size {} cannot hold a {} pixel tile",
                region_size, tile_size
            )));
        }

        let header = self.reader.read_header(image_url, read_role)?;

        let bounds = effective_bounds(&header, roi)?;

        Ok(decompose(
            bounds,
            u64::from(region_size),
            u64::from(tile_overlap),
        ))
    }
}

/// Intersect the image extent with the ROI, if any.
fn effective_bounds(header: &ImageHeader, roi: Option<&str>) -> Result<PixelBounds> {
    let full = PixelBounds {
        x0: 0,
        y0: 0,
        x1: header.width,
        y1: header.height,
    };

    let roi = match roi {
        None => return Ok(full),
        Some(roi) => roi,
    };

    let polygon = parse_roi(roi)?;

    // A georeferenced image gets a world-space ROI mapped through its sensor
    // model; otherwise the ROI is taken to be in pixel coordinates already.
    let (min_x, min_y, max_x, max_y) = match &header.sensor_model {
        Some(model) => {
            let mut min_x = f64::INFINITY;
            let mut min_y = f64::INFINITY;
            let mut max_x = f64::NEG_INFINITY;
            let mut max_y = f64::NEG_INFINITY;

            for coord in polygon.exterior().coords() {
                let (px, py) = model.world_to_pixel(coord.x, coord.y);
                min_x = min_x.min(px);
                min_y = min_y.min(py);
                max_x = max_x.max(px);
                max_y = max_y.max(py);
            }

            (min_x, min_y, max_x, max_y)
        }

        None => {
            let rect = polygon
                .bounding_rect()
                .ok_or_else(|| SchedError::Validation("empty ROI polygon".into()))?;
            (rect.min().x, rect.min().y, rect.max().x, rect.max().y)
        }
    };

    let x0 = min_x.floor().max(0.0) as u64;
    let y0 = min_y.floor().max(0.0) as u64;
    let x1 = (max_x.ceil() as u64).min(full.x1);
    let y1 = (max_y.ceil() as u64).min(full.y1);

    if x0 >= x1 || y0 >= y1 {
        return Err(SchedError::Validation(
            "ROI does not intersect the image extent".into(),
        ));
    }

    Ok(PixelBounds { x0, y0, x1, y1 })
}

/// Parse an ROI string: GeoJSON if it starts with `{`, WKT otherwise.
fn parse_roi(roi: &str) -> Result<geo::Polygon<f64>> {
    if roi.trim_start().starts_with('{') {
        parse_geojson_polygon(roi)
    } else {
        geo::Polygon::try_from_wkt_str(roi)
            .map_err(|_| SchedError::Validation(format!("unparseable WKT ROI: {:?}", roi)))
    }
}

#[derive(Deserialize)]
struct GeoJsonPolygon {
    #[serde(rename = "type")]
    kind: String,
    coordinates: Vec<Vec<[f64; 2]>>,
}

fn parse_geojson_polygon(roi: &str) -> Result<geo::Polygon<f64>> {
    let parsed: GeoJsonPolygon = serde_json::from_str(roi)
        .map_err(|e| SchedError::Validation(format!("unparseable GeoJSON ROI: {}", e)))?;

    if parsed.kind != "Polygon" {
        return Err(SchedError::Validation(format!(
            "ROI must be a Polygon, got {}",
            parsed.kind
        )));
    }

    let exterior = parsed
        .coordinates
        .first()
        .ok_or_else(|| SchedError::Validation("GeoJSON ROI has no rings".into()))?;

    let coords: Vec<(f64, f64)> = exterior.iter().map(|c| (c[0], c[1])).collect();
    Ok(geo::Polygon::new(geo::LineString::from(coords), vec![]))
}

/// Lay a row-major grid of `region_size` regions over the bounds, padding
/// interior edges by `overlap`.
fn decompose(bounds: PixelBounds, region_size: u64, overlap: u64) -> Vec<RegionBounds> {
    let mut regions = Vec::new();

    let mut row = bounds.y0;
    while row < bounds.y1 {
        let row_end = (row + region_size).min(bounds.y1);

        let mut col = bounds.x0;
        while col < bounds.x1 {
            let col_end = (col + region_size).min(bounds.x1);

            // Pad edges that have a neighboring region.
            let left = if col > bounds.x0 { col - overlap } else { col };
            let top = if row > bounds.y0 { row - overlap } else { row };
            let right = if col_end < bounds.x1 {
                (col_end + overlap).min(bounds.x1)
            } else {
                col_end
            };
            let bottom = if row_end < bounds.y1 {
                (row_end + overlap).min(bounds.y1)
            } else {
                row_end
            };

            regions.push(RegionBounds {
                col_off: left,
                row_off: top,
                width: right - left,
                height: bottom - top,
            });

            col += region_size;
        }

        row += region_size;
    }

    regions
}
