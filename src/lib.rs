//! cloudfree: Cloud Masking and Compositing for Landsat 8 and Sentinel-2
//!
//! This library turns raw Landsat 8 Collection 2 Level-2 and Sentinel-2
//! Surface Reflectance scenes into analysis-ready imagery: per-pixel QA
//! bit tests mask clouds, cirrus, shadow and saturation, digital numbers are
//! rescaled to physical units, and masked sequences reduce to median
//! composites or a least-cloudy selection.

pub mod core;
pub mod io;
pub mod types;

// Re-export main types and functions for easier access
pub use types::{
    BandData, BoundingBox, Image, MaskError, MaskResult, PixelMask, PropertyValue,
};

pub use crate::core::{median_composite, CollectionTransform, MaskProcessor, SensorConfig};
pub use crate::io::{export_image, ExportParams, ImageCollection, VisParams};
