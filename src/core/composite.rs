use crate::types::{BandData, BoundingBox, Image, MaskError, MaskResult, SciRaster};
use num_traits::Float;

/// Median of a non-empty slice; an even count averages the two central values.
fn median_in_place<T: Float>(values: &mut [T]) -> T {
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        let two = T::one() + T::one();
        (values[n / 2 - 1] + values[n / 2]) / two
    }
}

/// Rescaled band names shared by every image in the sequence.
fn common_sci_bands(images: &[Image]) -> Vec<String> {
    let mut names: Vec<String> = images[0]
        .band_names()
        .into_iter()
        .filter(|name| matches!(images[0].band(name), Ok(BandData::F64(_))))
        .map(str::to_string)
        .collect();
    names.retain(|name| {
        images
            .iter()
            .all(|img| matches!(img.band(name), Ok(BandData::F64(_))))
    });
    names
}

fn footprint_union(images: &[Image]) -> Option<BoundingBox> {
    let mut boxes = images.iter().filter_map(|img| img.footprint);
    let first = boxes.next()?;
    Some(boxes.fold(first, |acc, b| BoundingBox {
        min_lon: acc.min_lon.min(b.min_lon),
        max_lon: acc.max_lon.max(b.max_lon),
        min_lat: acc.min_lat.min(b.min_lat),
        max_lat: acc.max_lat.max(b.max_lat),
    }))
}

/// Per-pixel median composite over a sequence of masked, rescaled images.
///
/// A pixel contributes to the median only in images where it is valid; pixels
/// valid nowhere are masked in the composite. Only rescaled (float) bands
/// present in every image are composited; QA and other integer bands do not
/// survive aggregation.
pub fn median_composite(images: &[Image]) -> MaskResult<Image> {
    if images.is_empty() {
        return Err(MaskError::EmptyInput(
            "cannot composite an empty image sequence".to_string(),
        ));
    }

    let (rows, cols) = images[0].dim();
    for (idx, img) in images.iter().enumerate() {
        if img.dim() != (rows, cols) {
            return Err(MaskError::ShapeMismatch(format!(
                "image {} is {:?}, expected {:?}",
                idx,
                img.dim(),
                (rows, cols)
            )));
        }
    }

    let bands = common_sci_bands(images);
    if bands.is_empty() {
        return Err(MaskError::Processing(
            "no rescaled band is present in every image".to_string(),
        ));
    }
    log::info!(
        "median composite over {} image(s), {} band(s), {}x{}",
        images.len(),
        bands.len(),
        rows,
        cols
    );

    // Per-pixel validity of the composite: valid anywhere in the stack
    let mut valid = images[0].mask().clone();
    for img in &images[1..] {
        ndarray::Zip::from(&mut valid)
            .and(img.mask())
            .for_each(|v, &m| *v = *v || m);
    }

    let mut composite = Image::new(rows, cols);
    composite.footprint = footprint_union(images);

    for name in &bands {
        let stack: Vec<&SciRaster> = images
            .iter()
            .map(|img| match img.band(name) {
                Ok(BandData::F64(a)) => Ok(a),
                _ => Err(MaskError::MissingBand(name.clone())),
            })
            .collect::<MaskResult<_>>()?;

        let mut out = SciRaster::from_elem((rows, cols), f64::NAN);
        let mut values = Vec::with_capacity(images.len());
        for i in 0..rows {
            for j in 0..cols {
                values.clear();
                for (raster, img) in stack.iter().zip(images.iter()) {
                    if img.mask()[[i, j]] {
                        values.push(raster[[i, j]]);
                    }
                }
                if !values.is_empty() {
                    out[[i, j]] = median_in_place(&mut values);
                }
            }
        }
        composite.insert_band(name, BandData::F64(out))?;
    }

    composite.and_mask(&valid)?;
    if composite.valid_pixel_count() == 0 {
        log::warn!("composite has no valid pixels; every input pixel was masked");
    }
    Ok(composite)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::mask::{landsat_qa, MaskProcessor, SensorConfig};
    use crate::types::DnRaster;
    use approx::assert_relative_eq;
    use ndarray::Array2;

    fn landsat_image(qa_pixel: u16, sr_b4: u16) -> Image {
        let mut image = Image::new(1, 1);
        image
            .insert_band("QA_PIXEL", BandData::U16(Array2::from_elem((1, 1), qa_pixel)))
            .unwrap();
        image
            .insert_band("QA_RADSAT", BandData::U16(DnRaster::zeros((1, 1))))
            .unwrap();
        image
            .insert_band("SR_B4", BandData::U16(Array2::from_elem((1, 1), sr_b4)))
            .unwrap();
        image
            .insert_band("ST_B10", BandData::U16(Array2::from_elem((1, 1), 25000)))
            .unwrap();
        image
    }

    #[test]
    fn test_median_ignores_masked_images() {
        let processor = MaskProcessor::new(SensorConfig::landsat8_c2l2()).unwrap();
        let inputs = [
            landsat_image(0, 8000),
            landsat_image(0, 12000),
            landsat_image(landsat_qa::CLOUD, 60000),
        ];
        let masked: Vec<Image> = inputs
            .iter()
            .map(|img| processor.transform(img).unwrap())
            .collect();

        let composite = median_composite(&masked).unwrap();
        assert!(composite.mask()[[0, 0]]);

        // Median of the two valid scaled values only
        let a = 8000.0 * 0.0000275 - 0.2;
        let b = 12000.0 * 0.0000275 - 0.2;
        let value = composite.band("SR_B4").unwrap().to_sci()[[0, 0]];
        assert_relative_eq!(value, (a + b) / 2.0, max_relative = 1e-12);
    }

    #[test]
    fn test_odd_count_takes_central_value() {
        let mut vals = [3.0, 1.0, 2.0];
        assert_relative_eq!(median_in_place(&mut vals), 2.0);
    }

    #[test]
    fn test_empty_sequence_is_an_error() {
        assert!(matches!(
            median_composite(&[]),
            Err(MaskError::EmptyInput(_))
        ));
    }

    #[test]
    fn test_all_masked_pixel_stays_masked() {
        let processor = MaskProcessor::new(SensorConfig::landsat8_c2l2()).unwrap();
        let masked: Vec<Image> = [
            landsat_image(landsat_qa::FILL, 8000),
            landsat_image(landsat_qa::CLOUD, 12000),
        ]
        .iter()
        .map(|img| processor.transform(img).unwrap())
        .collect();

        let composite = median_composite(&masked).unwrap();
        assert!(!composite.mask()[[0, 0]]);
        assert_eq!(composite.valid_pixel_count(), 0);
    }

    #[test]
    fn test_shape_mismatch_is_rejected() {
        let processor = MaskProcessor::new(SensorConfig::landsat8_c2l2()).unwrap();
        let a = processor.transform(&landsat_image(0, 8000)).unwrap();
        let mut big = Image::new(2, 2);
        big.insert_band("SR_B4", BandData::F64(Array2::zeros((2, 2))))
            .unwrap();

        assert!(matches!(
            median_composite(&[a, big]),
            Err(MaskError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_integer_bands_do_not_survive_compositing() {
        let processor = MaskProcessor::new(SensorConfig::landsat8_c2l2()).unwrap();
        let masked: Vec<Image> = [landsat_image(0, 8000), landsat_image(0, 9000)]
            .iter()
            .map(|img| processor.transform(img).unwrap())
            .collect();

        let composite = median_composite(&masked).unwrap();
        assert!(!composite.has_band("QA_PIXEL"));
        assert!(composite.has_band("SR_B4"));
        assert!(composite.has_band("ST_B10"));
    }
}
