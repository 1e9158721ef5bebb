use crate::types::{BoundingBox, Image, MaskError, MaskResult};
use chrono::NaiveDate;

/// Scene-level cloud fraction property carried by Sentinel-2 products
pub const CLOUDY_PIXEL_PERCENTAGE: &str = "CLOUDY_PIXEL_PERCENTAGE";

/// Archive identifier property, e.g. `20200101T100319_20200101T100321_T32TQM`
pub const SYSTEM_INDEX: &str = "system:index";

/// An ordered sequence of images from one archive, with the filter and
/// selection operations a compositing pipeline needs. Filters consume the
/// collection and return a reduced one; images themselves are never modified.
#[derive(Debug, Clone, Default)]
pub struct ImageCollection {
    images: Vec<Image>,
}

impl ImageCollection {
    pub fn from_images(images: Vec<Image>) -> Self {
        Self { images }
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn images(&self) -> &[Image] {
        &self.images
    }

    pub fn into_images(self) -> Vec<Image> {
        self.images
    }

    pub fn first(&self) -> Option<&Image> {
        self.images.first()
    }

    /// Keep images acquired in the half-open date range `[start, end)`.
    /// Images without an acquisition timestamp are dropped.
    pub fn filter_date(mut self, start: NaiveDate, end: NaiveDate) -> Self {
        self.images.retain(|img| match img.acquisition_time {
            Some(t) => {
                let d = t.date_naive();
                d >= start && d < end
            }
            None => false,
        });
        log::debug!("filter_date kept {} image(s)", self.images.len());
        self
    }

    /// Keep images whose footprint intersects the area of interest.
    pub fn filter_bounds(mut self, aoi: &BoundingBox) -> Self {
        self.images.retain(|img| {
            img.footprint
                .map(|fp| fp.intersects(aoi))
                .unwrap_or(false)
        });
        log::debug!("filter_bounds kept {} image(s)", self.images.len());
        self
    }

    /// Keep images whose numeric property is strictly below `threshold`,
    /// e.g. `CLOUDY_PIXEL_PERCENTAGE < 20`. Images lacking the property are
    /// dropped.
    pub fn filter_lt(mut self, property: &str, threshold: f64) -> Self {
        self.images.retain(|img| {
            img.number_property(property)
                .map(|v| v < threshold)
                .unwrap_or(false)
        });
        log::debug!(
            "filter_lt({} < {}) kept {} image(s)",
            property,
            threshold,
            self.images.len()
        );
        self
    }

    /// Stable ascending sort on a numeric property; images lacking the
    /// property sort last. `sorted_by(..).first()` selects e.g. the least
    /// cloudy scene.
    pub fn sorted_by(mut self, property: &str) -> Self {
        self.images.sort_by(|a, b| {
            let ka = a.number_property(property).unwrap_or(f64::INFINITY);
            let kb = b.number_property(property).unwrap_or(f64::INFINITY);
            ka.partial_cmp(&kb).unwrap_or(std::cmp::Ordering::Equal)
        });
        self
    }

    /// The image with the lowest `CLOUDY_PIXEL_PERCENTAGE`.
    pub fn least_cloudy(&self) -> MaskResult<&Image> {
        self.images
            .iter()
            .filter(|img| img.number_property(CLOUDY_PIXEL_PERCENTAGE).is_some())
            .min_by(|a, b| {
                let ka = a.number_property(CLOUDY_PIXEL_PERCENTAGE).unwrap_or(f64::INFINITY);
                let kb = b.number_property(CLOUDY_PIXEL_PERCENTAGE).unwrap_or(f64::INFINITY);
                ka.partial_cmp(&kb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .ok_or_else(|| {
                MaskError::EmptyInput(format!(
                    "no image carries the {} property",
                    CLOUDY_PIXEL_PERCENTAGE
                ))
            })
    }
}

/// Acquisition date from a Sentinel-2 `system:index` value.
///
/// The harmonized SR collection carries no start-time property, so the date
/// comes from the first 8 characters of the identifier
/// (`20200101T100319_20200101T100321_T32TQM` -> 2020-01-01).
pub fn acquisition_date_from_index(index: &str) -> MaskResult<NaiveDate> {
    let stamp = index.get(..8).ok_or_else(|| {
        MaskError::Processing(format!("identifier '{}' is too short for a date", index))
    })?;
    NaiveDate::parse_from_str(stamp, "%Y%m%d").map_err(|e| {
        MaskError::Processing(format!("identifier '{}' has no leading date: {}", index, e))
    })
}
