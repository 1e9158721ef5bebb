use crate::types::{BandData, Image, MaskError, MaskResult, PixelMask};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Bit layout of the Landsat Collection 2 Level-2 `QA_PIXEL` band.
///
/// Positions are fixed by the USGS product format; a pixel is usable only if
/// all five of these flags are unset.
pub mod landsat_qa {
    pub const FILL: u16 = 1 << 0;
    pub const DILATED_CLOUD: u16 = 1 << 1;
    pub const CIRRUS: u16 = 1 << 2;
    pub const CLOUD: u16 = 1 << 3;
    pub const CLOUD_SHADOW: u16 = 1 << 4;

    /// Bits that must all be clear for a pixel to count as cloud-free
    pub const CLEAR_MASK: u16 = FILL | DILATED_CLOUD | CIRRUS | CLOUD | CLOUD_SHADOW;
}

/// Bit layout of the Sentinel-2 `QA60` cloud band (ESA format).
pub mod sentinel2_qa {
    pub const OPAQUE_CLOUD: u16 = 1 << 10;
    pub const CIRRUS: u16 = 1 << 11;

    pub const CLEAR_MASK: u16 = OPAQUE_CLOUD | CIRRUS;
}

/// Bitwise clear test against a QA band: a pixel passes when
/// `(qa & clear_mask) == 0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaRule {
    pub band: String,
    pub clear_mask: u16,
}

/// Saturation test against a radiometric-saturation band.
///
/// This is a whole-field equality test, not a bit test: `QA_RADSAT` flags
/// saturation per spectral band, and any set bit means some band saturated,
/// so only an exactly-zero field passes. Do not fold this into `QaRule`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaturationRule {
    pub band: String,
}

/// Linear rescale from digital numbers to physical units for every band whose
/// name matches `pattern`. Each sensor carries its own (gain, offset) pairs;
/// they are not interchangeable between sensors or band groups.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescaleRule {
    /// Anchored regex over band names, e.g. `^SR_B\d+$`
    pub pattern: String,
    pub gain: f64,
    pub offset: f64,
}

/// Per-sensor masking and rescaling configuration.
///
/// Everything sensor-specific lives here as data so that one engine serves
/// both archives and a provider-side bit addition stays a one-line change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorConfig {
    pub name: String,
    pub qa: QaRule,
    pub saturation: Option<SaturationRule>,
    pub rescale: Vec<RescaleRule>,
}

impl SensorConfig {
    /// Landsat 8 Collection 2, Level 2 surface reflectance + surface temperature.
    pub fn landsat8_c2l2() -> Self {
        Self {
            name: "LANDSAT/LC08/C02/T1_L2".to_string(),
            qa: QaRule {
                band: "QA_PIXEL".to_string(),
                clear_mask: landsat_qa::CLEAR_MASK,
            },
            saturation: Some(SaturationRule {
                band: "QA_RADSAT".to_string(),
            }),
            rescale: vec![
                RescaleRule {
                    pattern: r"^SR_B\d+$".to_string(),
                    gain: 0.0000275,
                    offset: -0.2,
                },
                RescaleRule {
                    pattern: r"^ST_B\d+$".to_string(),
                    gain: 0.00341802,
                    offset: 149.0,
                },
            ],
        }
    }

    /// Sentinel-2 Surface Reflectance (harmonized collection).
    ///
    /// Unlike Landsat, the rescale is uniform: every band is divided by 10000,
    /// QA60 included, matching the archive-wide digital-number convention.
    pub fn sentinel2_sr() -> Self {
        Self {
            name: "COPERNICUS/S2_SR_HARMONIZED".to_string(),
            qa: QaRule {
                band: "QA60".to_string(),
                clear_mask: sentinel2_qa::CLEAR_MASK,
            },
            saturation: None,
            rescale: vec![RescaleRule {
                pattern: r"^.*$".to_string(),
                gain: 1.0 / 10000.0,
                offset: 0.0,
            }],
        }
    }
}

/// Quality-mask and rescale processor for one sensor
pub struct MaskProcessor {
    config: SensorConfig,
    patterns: Vec<Regex>,
}

impl MaskProcessor {
    pub fn new(config: SensorConfig) -> MaskResult<Self> {
        let patterns = config
            .rescale
            .iter()
            .map(|rule| {
                Regex::new(&rule.pattern).map_err(|e| {
                    MaskError::Processing(format!(
                        "invalid band pattern '{}': {}",
                        rule.pattern, e
                    ))
                })
            })
            .collect::<MaskResult<Vec<_>>>()?;

        Ok(Self { config, patterns })
    }

    pub fn config(&self) -> &SensorConfig {
        &self.config
    }

    /// Per-pixel validity from the raw QA bands.
    ///
    /// Operates on unscaled integer values only; it must run before any
    /// rescaling so that bit tests never see transformed data.
    pub fn compute_mask(&self, image: &Image) -> MaskResult<PixelMask> {
        let qa = image.band(&self.config.qa.band)?.as_dn(&self.config.qa.band)?;
        let clear_mask = self.config.qa.clear_mask;
        let mut valid = qa.mapv(|v| v & clear_mask == 0);

        if let Some(sat) = &self.config.saturation {
            let radsat = image.band(&sat.band)?.as_dn(&sat.band)?;
            ndarray::Zip::from(&mut valid)
                .and(radsat)
                .for_each(|m, &v| *m = *m && v == 0);
        }

        Ok(valid)
    }

    /// Mask clouds/saturation and rescale to physical units.
    ///
    /// Pure transform: the input is untouched, the output carries rescaled
    /// bands, pass-through copies of everything else, and a validity mask
    /// restricted by the QA tests. Rescaling is applied exactly once per
    /// matched band.
    pub fn transform(&self, image: &Image) -> MaskResult<Image> {
        log::debug!(
            "masking {} image of {:?} with {} band(s)",
            self.config.name,
            image.dim(),
            image.band_names().len()
        );

        // QA tests first, on raw digital numbers
        let valid = self.compute_mask(image)?;

        let (rows, cols) = image.dim();
        let mut output = Image::new(rows, cols);
        output.properties = image.properties.clone();
        output.acquisition_time = image.acquisition_time;
        output.footprint = image.footprint;
        output.and_mask(image.mask())?;

        let mut matched = vec![0usize; self.config.rescale.len()];
        for name in image.band_names() {
            let band = image.band(name)?;
            let rule = self
                .patterns
                .iter()
                .position(|re| re.is_match(name));

            match rule {
                Some(idx) => {
                    matched[idx] += 1;
                    let rule = &self.config.rescale[idx];
                    let scaled = band.to_sci().mapv(|v| v * rule.gain + rule.offset);
                    output.insert_band(name, BandData::F64(scaled))?;
                }
                None => {
                    output.insert_band(name, band.clone())?;
                }
            }
        }

        // A rescale pattern with nothing to act on means the image does not
        // follow the sensor's band naming; never substitute defaults.
        for (idx, count) in matched.iter().enumerate() {
            if *count == 0 {
                return Err(MaskError::MissingBand(format!(
                    "no band matches '{}'",
                    self.config.rescale[idx].pattern
                )));
            }
        }

        output.and_mask(&valid)?;
        log::debug!(
            "{} of {} pixels valid after QA masking",
            output.valid_pixel_count(),
            rows * cols
        );
        Ok(output)
    }
}

/// Result of masking a sequence of images with per-image failure isolation
#[derive(Debug)]
pub struct CollectionTransform {
    pub images: Vec<Image>,
    /// (input index, error) for images that failed to transform
    pub failures: Vec<(usize, MaskError)>,
}

impl MaskProcessor {
    /// Transform each image independently; a failing image is recorded and
    /// skipped rather than aborting its siblings.
    pub fn transform_collection(&self, images: &[Image]) -> CollectionTransform {
        let results: Vec<MaskResult<Image>> =
            images.iter().map(|img| self.transform(img)).collect();
        Self::partition(results)
    }

    /// Parallel variant: transforms carry no shared state, so images map
    /// independently across threads with no ordering dependency.
    #[cfg(feature = "parallel")]
    pub fn transform_collection_parallel(&self, images: &[Image]) -> CollectionTransform {
        use rayon::prelude::*;

        let results: Vec<MaskResult<Image>> =
            images.par_iter().map(|img| self.transform(img)).collect();
        Self::partition(results)
    }

    fn partition(results: Vec<MaskResult<Image>>) -> CollectionTransform {
        let mut images = Vec::new();
        let mut failures = Vec::new();
        for (idx, result) in results.into_iter().enumerate() {
            match result {
                Ok(img) => images.push(img),
                Err(e) => {
                    log::warn!("image {} failed QA transform: {}", idx, e);
                    failures.push((idx, e));
                }
            }
        }
        CollectionTransform { images, failures }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DnRaster;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn landsat_image(qa_pixel: u16, qa_radsat: u16, sr_b4: u16, st_b10: u16) -> Image {
        let mut image = Image::new(1, 1);
        image
            .insert_band("QA_PIXEL", BandData::U16(Array2::from_elem((1, 1), qa_pixel)))
            .unwrap();
        image
            .insert_band("QA_RADSAT", BandData::U16(Array2::from_elem((1, 1), qa_radsat)))
            .unwrap();
        image
            .insert_band("SR_B4", BandData::U16(Array2::from_elem((1, 1), sr_b4)))
            .unwrap();
        image
            .insert_band("ST_B10", BandData::U16(Array2::from_elem((1, 1), st_b10)))
            .unwrap();
        image
    }

    fn sentinel_image(qa60: u16, b4: u16) -> Image {
        let mut image = Image::new(1, 1);
        image
            .insert_band("QA60", BandData::U16(Array2::from_elem((1, 1), qa60)))
            .unwrap();
        image
            .insert_band("B4", BandData::U16(Array2::from_elem((1, 1), b4)))
            .unwrap();
        image
    }

    fn sci_value(image: &Image, band: &str) -> f64 {
        image.band(band).unwrap().to_sci()[[0, 0]]
    }

    #[test]
    fn test_landsat_clear_pixel_is_scaled() {
        let processor = MaskProcessor::new(SensorConfig::landsat8_c2l2()).unwrap();
        let output = processor.transform(&landsat_image(0, 0, 8000, 30000)).unwrap();

        assert!(output.mask()[[0, 0]]);
        assert_relative_eq!(
            sci_value(&output, "SR_B4"),
            8000.0 * 0.0000275 - 0.2,
            max_relative = 1e-12
        );
        assert_relative_eq!(
            sci_value(&output, "ST_B10"),
            30000.0 * 0.00341802 + 149.0,
            max_relative = 1e-12
        );
    }

    #[test]
    fn test_landsat_any_low_qa_bit_invalidates() {
        let processor = MaskProcessor::new(SensorConfig::landsat8_c2l2()).unwrap();
        for bit in [
            landsat_qa::FILL,
            landsat_qa::DILATED_CLOUD,
            landsat_qa::CIRRUS,
            landsat_qa::CLOUD,
            landsat_qa::CLOUD_SHADOW,
        ] {
            let output = processor.transform(&landsat_image(bit, 0, 8000, 30000)).unwrap();
            assert!(!output.mask()[[0, 0]], "bit {:#07b} should invalidate", bit);
        }

        // Higher QA_PIXEL bits (confidence fields) are not part of the test
        let output = processor.transform(&landsat_image(1 << 6, 0, 8000, 30000)).unwrap();
        assert!(output.mask()[[0, 0]]);
    }

    #[test]
    fn test_landsat_saturation_is_whole_field_equality() {
        let processor = MaskProcessor::new(SensorConfig::landsat8_c2l2()).unwrap();

        // Any nonzero RADSAT value invalidates, including bits outside 0-4
        for radsat in [1u16, 1 << 7, 0b1010] {
            let output = processor
                .transform(&landsat_image(0, radsat, 8000, 30000))
                .unwrap();
            assert!(!output.mask()[[0, 0]], "RADSAT {:#b} should invalidate", radsat);
        }
    }

    #[test]
    fn test_landsat_qa_bands_pass_through_unscaled() {
        let processor = MaskProcessor::new(SensorConfig::landsat8_c2l2()).unwrap();
        let output = processor.transform(&landsat_image(0, 0, 8000, 30000)).unwrap();

        // QA bands keep their raw integer values
        let qa = output.band("QA_PIXEL").unwrap().as_dn("QA_PIXEL").unwrap();
        assert_eq!(qa[[0, 0]], 0);
    }

    #[test]
    fn test_landsat_missing_qa_band_fails() {
        let processor = MaskProcessor::new(SensorConfig::landsat8_c2l2()).unwrap();
        let mut image = Image::new(1, 1);
        image
            .insert_band("SR_B4", BandData::U16(Array2::zeros((1, 1))))
            .unwrap();

        assert!(matches!(
            processor.transform(&image),
            Err(MaskError::MissingBand(_))
        ));
    }

    #[test]
    fn test_landsat_missing_band_pattern_fails() {
        let processor = MaskProcessor::new(SensorConfig::landsat8_c2l2()).unwrap();
        let mut image = Image::new(1, 1);
        image
            .insert_band("QA_PIXEL", BandData::U16(Array2::zeros((1, 1))))
            .unwrap();
        image
            .insert_band("QA_RADSAT", BandData::U16(Array2::zeros((1, 1))))
            .unwrap();
        image
            .insert_band("SR_B4", BandData::U16(Array2::zeros((1, 1))))
            .unwrap();
        // No ST_B* band at all

        assert!(matches!(
            processor.transform(&image),
            Err(MaskError::MissingBand(_))
        ));
    }

    #[test]
    fn test_float_qa_band_is_malformed() {
        let processor = MaskProcessor::new(SensorConfig::landsat8_c2l2()).unwrap();
        let mut image = landsat_image(0, 0, 8000, 30000);
        image
            .insert_band("QA_PIXEL", BandData::F64(Array2::zeros((1, 1))))
            .unwrap();

        assert!(matches!(
            processor.transform(&image),
            Err(MaskError::MalformedBitField { .. })
        ));
    }

    #[test]
    fn test_sentinel_cloud_and_cirrus_bits() {
        let processor = MaskProcessor::new(SensorConfig::sentinel2_sr()).unwrap();

        for qa in [
            sentinel2_qa::OPAQUE_CLOUD,
            sentinel2_qa::CIRRUS,
            sentinel2_qa::OPAQUE_CLOUD | sentinel2_qa::CIRRUS,
        ] {
            let output = processor.transform(&sentinel_image(qa, 7500)).unwrap();
            assert!(!output.mask()[[0, 0]], "QA60 {:#b} should invalidate", qa);
        }

        let output = processor.transform(&sentinel_image(0, 7500)).unwrap();
        assert!(output.mask()[[0, 0]]);
    }

    #[test]
    fn test_sentinel_rescale_is_uniform() {
        let processor = MaskProcessor::new(SensorConfig::sentinel2_sr()).unwrap();
        let output = processor.transform(&sentinel_image(0, 7500)).unwrap();

        assert_relative_eq!(sci_value(&output, "B4"), 7500.0 / 10000.0, max_relative = 1e-12);
        // QA60 is rescaled too; the uniform divide spares no band
        assert_relative_eq!(sci_value(&output, "QA60"), 0.0, max_relative = 1e-12);
    }

    #[test]
    fn test_mask_computation_is_idempotent() {
        let processor = MaskProcessor::new(SensorConfig::landsat8_c2l2()).unwrap();
        let image = landsat_image(landsat_qa::CLOUD, 0, 8000, 30000);

        let first = processor.compute_mask(&image).unwrap();
        let second = processor.compute_mask(&image).unwrap();
        assert_eq!(first, second);

        // Re-applying an identical mask restricts nothing further
        let mut output = processor.transform(&image).unwrap();
        let valid_once = output.valid_pixel_count();
        output.and_mask(&first).unwrap();
        assert_eq!(output.valid_pixel_count(), valid_once);
    }

    #[test]
    fn test_collection_isolates_failures() {
        let processor = MaskProcessor::new(SensorConfig::landsat8_c2l2()).unwrap();
        let good = landsat_image(0, 0, 8000, 30000);
        let mut bad = Image::new(1, 1);
        bad.insert_band("SR_B4", BandData::U16(DnRaster::zeros((1, 1))))
            .unwrap();

        let result = processor.transform_collection(&[good.clone(), bad, good]);
        assert_eq!(result.images.len(), 2);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].0, 1);
    }

    #[cfg(feature = "parallel")]
    #[test]
    fn test_parallel_collection_matches_serial() {
        let processor = MaskProcessor::new(SensorConfig::sentinel2_sr()).unwrap();
        let images: Vec<Image> = (0..8)
            .map(|i| sentinel_image(0, 1000 + i * 100))
            .collect();

        let serial = processor.transform_collection(&images);
        let parallel = processor.transform_collection_parallel(&images);
        assert_eq!(serial.images.len(), parallel.images.len());
        for (a, b) in serial.images.iter().zip(parallel.images.iter()) {
            assert_eq!(
                a.band("B4").unwrap().to_sci(),
                b.band("B4").unwrap().to_sci()
            );
        }
    }
}
