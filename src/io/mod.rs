//! Collection handling and export

pub mod catalog;
pub mod export;

pub use catalog::{acquisition_date_from_index, ImageCollection};
pub use export::{export_image, ExportParams, VisParams};
