use chrono::{DateTime, Utc};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Raw digital-number raster as stored in the archive products
pub type DnRaster = Array2<u16>;

/// Physical-unit raster (reflectance fraction or Kelvin)
pub type SciRaster = Array2<f64>;

/// Per-pixel validity; `false` means no-data for every band of the image
pub type PixelMask = Array2<bool>;

/// Storage for a single named band.
///
/// QA bands and unscaled digital numbers live in the integer variant; bitwise
/// quality tests are only defined there. Rescaled bands live in the float
/// variant.
#[derive(Debug, Clone)]
pub enum BandData {
    U16(DnRaster),
    F64(SciRaster),
}

impl BandData {
    pub fn dim(&self) -> (usize, usize) {
        match self {
            BandData::U16(a) => a.dim(),
            BandData::F64(a) => a.dim(),
        }
    }

    /// The integer raster, or an error if the band has already been converted
    /// to physical units and no longer supports bitwise tests.
    pub fn as_dn(&self, band: &str) -> MaskResult<&DnRaster> {
        match self {
            BandData::U16(a) => Ok(a),
            BandData::F64(_) => Err(MaskError::MalformedBitField {
                band: band.to_string(),
                reason: "band holds floating-point values".to_string(),
            }),
        }
    }

    /// View of the band as physical values, converting digital numbers 1:1.
    pub fn to_sci(&self) -> SciRaster {
        match self {
            BandData::U16(a) => a.mapv(f64::from),
            BandData::F64(a) => a.clone(),
        }
    }
}

/// Per-image metadata value (e.g. CLOUDY_PIXEL_PERCENTAGE, system:index)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Number(f64),
    Text(String),
}

/// Geographic bounding box in degrees
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_lon <= other.max_lon
            && self.max_lon >= other.min_lon
            && self.min_lat <= other.max_lat
            && self.max_lat >= other.min_lat
    }

    /// Extent in degrees, (width, height)
    pub fn extent(&self) -> (f64, f64) {
        (self.max_lon - self.min_lon, self.max_lat - self.min_lat)
    }
}

/// A multi-band raster image with an explicit per-pixel validity mask.
///
/// All bands and the mask share one shape; the constructors enforce it so the
/// mask can never silently drift from the data. Transforms never mutate an
/// image in place, they produce a new one.
#[derive(Debug, Clone)]
pub struct Image {
    bands: BTreeMap<String, BandData>,
    mask: PixelMask,
    pub properties: HashMap<String, PropertyValue>,
    pub acquisition_time: Option<DateTime<Utc>>,
    pub footprint: Option<BoundingBox>,
}

impl Image {
    /// An image of the given shape with no bands yet and an all-valid mask.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            bands: BTreeMap::new(),
            mask: Array2::from_elem((rows, cols), true),
            properties: HashMap::new(),
            acquisition_time: None,
            footprint: None,
        }
    }

    pub fn dim(&self) -> (usize, usize) {
        self.mask.dim()
    }

    /// Add or replace a band, rejecting shape disagreements.
    pub fn insert_band(&mut self, name: &str, data: BandData) -> MaskResult<()> {
        if data.dim() != self.dim() {
            return Err(MaskError::ShapeMismatch(format!(
                "band '{}' is {:?} but image is {:?}",
                name,
                data.dim(),
                self.dim()
            )));
        }
        self.bands.insert(name.to_string(), data);
        Ok(())
    }

    pub fn band(&self, name: &str) -> MaskResult<&BandData> {
        self.bands
            .get(name)
            .ok_or_else(|| MaskError::MissingBand(name.to_string()))
    }

    pub fn has_band(&self, name: &str) -> bool {
        self.bands.contains_key(name)
    }

    /// Band names in deterministic (lexicographic) order.
    pub fn band_names(&self) -> Vec<&str> {
        self.bands.keys().map(String::as_str).collect()
    }

    pub fn mask(&self) -> &PixelMask {
        &self.mask
    }

    /// Restrict validity: pixels invalid in `update` become invalid here.
    /// Applying the same update twice is a no-op the second time.
    pub fn and_mask(&mut self, update: &PixelMask) -> MaskResult<()> {
        if update.dim() != self.dim() {
            return Err(MaskError::ShapeMismatch(format!(
                "mask update is {:?} but image is {:?}",
                update.dim(),
                self.dim()
            )));
        }
        ndarray::Zip::from(&mut self.mask)
            .and(update)
            .for_each(|m, &u| *m = *m && u);
        Ok(())
    }

    pub fn valid_pixel_count(&self) -> usize {
        self.mask.iter().filter(|&&v| v).count()
    }

    pub fn set_number_property(&mut self, key: &str, value: f64) {
        self.properties
            .insert(key.to_string(), PropertyValue::Number(value));
    }

    pub fn set_text_property(&mut self, key: &str, value: &str) {
        self.properties
            .insert(key.to_string(), PropertyValue::Text(value.to_string()));
    }

    pub fn number_property(&self, key: &str) -> Option<f64> {
        match self.properties.get(key) {
            Some(PropertyValue::Number(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn text_property(&self, key: &str) -> Option<&str> {
        match self.properties.get(key) {
            Some(PropertyValue::Text(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// Error types for masking and compositing
#[derive(Debug, thiserror::Error)]
pub enum MaskError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("required band '{0}' is missing")]
    MissingBand(String),

    #[error("QA band '{band}' does not support bitwise tests: {reason}")]
    MalformedBitField { band: String, reason: String },

    #[error("no images to process: {0}")]
    EmptyInput(String),

    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("processing error: {0}")]
    Processing(String),
}

/// Result type for masking operations
pub type MaskResult<T> = Result<T, MaskError>;
