// THEORY:
// The background reference is what "empty" looks like. The engine supports two
// variants, chosen when the pipeline is built:
//
// - `StaticBackground`: one snapshot of the empty scene. Cheap, deterministic,
//   and blind to lighting drift.
// - `AdaptiveBackground`: a per-pixel Gaussian mixture that keeps learning from
//   the stream (see `adaptive_background`). It follows slow changes but must be
//   warmed up before its verdicts mean anything.
//
// Both variants can hand out an intensity image of the background, which is
// what the texture, gradient and histogram signals are compared against.

use crate::core_modules::adaptive_background::AdaptiveBackground;
use crate::core_modules::pixel::intensity_image;
use crate::core_modules::region::Region;
use crate::core_modules::signals::{changed_pixel_count, smooth};
use crate::error::{OccupancyError, OccupancyResult};
use image::{GrayImage, RgbImage};

/// How pixel differences are filtered before they are counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoiseFilter {
    /// A pixel counts as changed when its intensity differs by more than this.
    /// The default of 0 counts any difference.
    pub pixel_delta: u8,
    /// Median filter radius applied to both crops; 2 gives a 5x5 window.
    pub smoothing_radius: u32,
}

impl Default for NoiseFilter {
    fn default() -> Self {
        Self {
            pixel_delta: 0,
            smoothing_radius: 2,
        }
    }
}

/// A snapshot of the empty scene.
#[derive(Debug, Clone)]
pub struct StaticBackground {
    reference: RgbImage,
    intensity: GrayImage,
    noise: NoiseFilter,
}

impl StaticBackground {
    pub fn new(reference: RgbImage) -> Self {
        Self::with_noise_filter(reference, NoiseFilter::default())
    }

    pub fn with_noise_filter(reference: RgbImage, noise: NoiseFilter) -> Self {
        let intensity = intensity_image(&reference);
        Self {
            reference,
            intensity,
            noise,
        }
    }

    pub fn reference(&self) -> &RgbImage {
        &self.reference
    }

    pub fn intensity(&self) -> &GrayImage {
        &self.intensity
    }

    pub fn noise_filter(&self) -> NoiseFilter {
        self.noise
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.reference.dimensions()
    }

    pub fn check_frame(&self, frame_width: u32, frame_height: u32) -> OccupancyResult<()> {
        check_dimensions(self.dimensions(), (frame_width, frame_height))
    }

    /// Number of masked pixels in `region` whose intensity differs from the
    /// reference, after noise smoothing.
    pub fn diff(&self, frame: &RgbImage, region: &Region) -> OccupancyResult<u32> {
        self.diff_intensity(&intensity_image(frame), region)
    }

    /// `diff` for a frame that was already converted to intensity.
    pub fn diff_intensity(&self, frame: &GrayImage, region: &Region) -> OccupancyResult<u32> {
        self.check_frame(frame.width(), frame.height())?;
        let (current, mask) = region.extract(frame)?;
        let (background, _) = region.extract(&self.intensity)?;
        let current = smooth(&current, &mask, self.noise.smoothing_radius);
        let background = smooth(&background, &mask, self.noise.smoothing_radius);
        Ok(changed_pixel_count(
            &current,
            &background,
            &mask,
            self.noise.pixel_delta,
        ))
    }
}

/// The background the engine compares against.
#[derive(Debug)]
pub enum BackgroundReference {
    Static(StaticBackground),
    Adaptive(AdaptiveBackground),
}

impl BackgroundReference {
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            BackgroundReference::Static(background) => background.dimensions(),
            BackgroundReference::Adaptive(model) => model.dimensions(),
        }
    }

    /// A static view of the current background estimate.
    pub fn snapshot(&self, noise: NoiseFilter) -> StaticBackground {
        match self {
            BackgroundReference::Static(background) => {
                StaticBackground::with_noise_filter(background.reference().clone(), noise)
            }
            BackgroundReference::Adaptive(model) => {
                StaticBackground::with_noise_filter(model.background_image(), noise)
            }
        }
    }
}

pub(crate) fn check_dimensions(expected: (u32, u32), actual: (u32, u32)) -> OccupancyResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(OccupancyError::FrameSizeMismatch { expected, actual })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::region::Geometry;
    use image::Rgb;

    #[test]
    fn identical_frame_has_zero_diff() {
        let frame = RgbImage::from_fn(60, 40, |x, y| Rgb([(x * 4) as u8, (y * 6) as u8, 30]));
        let background = StaticBackground::new(frame.clone());
        let region = Region::build(0, Geometry::rectangle(5, 5, 20, 20)).unwrap();
        assert_eq!(background.diff(&frame, &region).unwrap(), 0);
    }

    #[test]
    fn filled_region_counts_every_masked_pixel() {
        let background = StaticBackground::new(RgbImage::new(60, 40));
        let mut frame = RgbImage::new(60, 40);
        for y in 5..25 {
            for x in 5..25 {
                frame.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        let region = Region::build(0, Geometry::rectangle(5, 5, 20, 20)).unwrap();
        assert_eq!(background.diff(&frame, &region).unwrap(), 400);
    }

    #[test]
    fn any_difference_counts_without_smoothing() {
        let noise = NoiseFilter {
            pixel_delta: 0,
            smoothing_radius: 0,
        };
        let background = StaticBackground::with_noise_filter(RgbImage::new(10, 10), noise);
        let mut frame = RgbImage::new(10, 10);
        frame.put_pixel(2, 2, Rgb([3, 3, 3]));
        let region = Region::build(0, Geometry::rectangle(0, 0, 10, 10)).unwrap();
        assert_eq!(background.diff(&frame, &region).unwrap(), 1);
    }

    #[test]
    fn mismatched_frame_is_rejected() {
        let background = StaticBackground::new(RgbImage::new(10, 10));
        let region = Region::build(0, Geometry::rectangle(0, 0, 5, 5)).unwrap();
        let err = background.diff(&RgbImage::new(12, 10), &region).unwrap_err();
        assert_eq!(
            err,
            OccupancyError::FrameSizeMismatch {
                expected: (10, 10),
                actual: (12, 10)
            }
        );
    }
}
