use crate::types::{BoundingBox, Image, MaskError, MaskResult};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// Rough metres per degree of longitude/latitude, for sizing export grids
const METERS_PER_DEGREE: f64 = 111_320.0;

/// Configuration of one export job.
///
/// The durable file format is deliberately minimal (one flat little-endian
/// f32 raster per band); region, scale, CRS and the pixel-count guard follow
/// the conventional export-job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportParams {
    pub description: String,
    pub file_name_prefix: String,
    /// Bands to write, e.g. ["SR_B4", "SR_B3", "SR_B2"]
    pub bands: Vec<String>,
    pub region: BoundingBox,
    /// Spatial resolution in metres per pixel
    pub scale: f64,
    /// Coordinate reference system code, e.g. "EPSG:4326"
    pub crs: String,
    /// Upper bound on output grid size; oversized jobs are rejected up front
    pub max_pixels: u64,
}

impl ExportParams {
    /// Output grid size implied by region extent and scale.
    pub fn estimated_pixels(&self) -> u64 {
        let (w_deg, h_deg) = self.region.extent();
        let cols = (w_deg.abs() * METERS_PER_DEGREE / self.scale).ceil().max(1.0);
        let rows = (h_deg.abs() * METERS_PER_DEGREE / self.scale).ceil().max(1.0);
        (cols * rows) as u64
    }

    pub fn validate(&self, image: &Image) -> MaskResult<()> {
        if self.bands.is_empty() {
            return Err(MaskError::Processing(
                "export requires at least one band".to_string(),
            ));
        }
        if !(self.scale > 0.0) {
            return Err(MaskError::Processing(format!(
                "export scale must be positive, got {}",
                self.scale
            )));
        }
        for band in &self.bands {
            if !image.has_band(band) {
                return Err(MaskError::MissingBand(band.clone()));
            }
        }
        let estimated = self.estimated_pixels();
        if estimated > self.max_pixels {
            return Err(MaskError::Processing(format!(
                "export '{}' needs ~{} pixels, above the max_pixels limit of {}",
                self.description, estimated, self.max_pixels
            )));
        }
        Ok(())
    }
}

/// Write the selected bands of an image under `output_dir`, one `.bin` file
/// per band in row-major little-endian f32, masked pixels as NaN. Returns the
/// written paths.
pub fn export_image(
    image: &Image,
    params: &ExportParams,
    output_dir: &Path,
) -> MaskResult<Vec<PathBuf>> {
    params.validate(image)?;
    std::fs::create_dir_all(output_dir)?;

    let (rows, cols) = image.dim();
    let mut written = Vec::with_capacity(params.bands.len());
    for band in &params.bands {
        let sci = image.band(band)?.to_sci();
        let path = output_dir.join(format!("{}_{}.bin", params.file_name_prefix, band));
        let mut writer = BufWriter::new(File::create(&path)?);

        for i in 0..rows {
            for j in 0..cols {
                let value = if image.mask()[[i, j]] {
                    sci[[i, j]] as f32
                } else {
                    f32::NAN
                };
                writer.write_all(&value.to_le_bytes())?;
            }
        }
        writer.flush()?;
        log::info!(
            "exported band {} of '{}' ({}x{}) to {}",
            band,
            params.description,
            rows,
            cols,
            path.display()
        );
        written.push(path);
    }
    Ok(written)
}

/// Band-to-channel mapping and stretch for display collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisParams {
    /// (red, green, blue) band names
    pub bands: [String; 3],
    pub min: f64,
    pub max: f64,
    pub gamma: Option<f64>,
}

impl VisParams {
    /// True-colour stretch for rescaled Landsat 8 surface reflectance.
    pub fn landsat8_true_color() -> Self {
        Self {
            bands: ["SR_B4".to_string(), "SR_B3".to_string(), "SR_B2".to_string()],
            min: 0.0,
            max: 0.3,
            gamma: None,
        }
    }

    /// True-colour stretch for rescaled Sentinel-2 surface reflectance.
    pub fn sentinel2_true_color() -> Self {
        Self {
            bands: ["B4".to_string(), "B3".to_string(), "B2".to_string()],
            min: 0.0,
            max: 0.3,
            gamma: Some(1.2),
        }
    }

    /// Map a band value into [0, 1] for rendering: clamp to [min, max],
    /// stretch linearly, then apply the inverse-gamma curve if configured.
    pub fn normalize(&self, value: f64) -> f64 {
        let clamped = value.clamp(self.min, self.max);
        let stretched = (clamped - self.min) / (self.max - self.min);
        match self.gamma {
            Some(g) if g > 0.0 => stretched.powf(1.0 / g),
            _ => stretched,
        }
    }
}
