//! Core masking and compositing modules

pub mod composite;
pub mod mask;

// Re-export main types
pub use composite::median_composite;
pub use mask::{
    CollectionTransform, MaskProcessor, QaRule, RescaleRule, SaturationRule, SensorConfig,
};
