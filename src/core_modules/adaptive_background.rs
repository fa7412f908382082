// THEORY:
// `AdaptiveBackground` is the stateful, learning half of the background
// reference. Like a `SmartChunk` learning what "normal" change looks like for
// its patch, every pixel here learns what "empty" looks like for its location:
// a small mixture of Gaussians in RGB space, each with a weight, a mean and an
// isotropic variance.
//
// Per observed frame:
// 1.  **Classify**: a pixel is background when it lies within
//     `variance_threshold` squared-sigmas of one of the heaviest modes (the ones
//     that together explain `background_ratio` of the weight). Otherwise it is
//     foreground, unless shadow detection recognises it as a darker copy of a
//     background mode, in which case it is suppressed.
// 2.  **Learn**: weights decay with learning rate `1 / min(2n, history)`; the
//     first mode close enough to the sample absorbs it; a sample no mode
//     explains spawns a new mode, replacing the weakest when all slots are used.
//
// The learning rate starts high and settles at `1 / history`, so the model
// converges fast during warm-up and then remembers roughly `history` frames.
// Frames must be fed in stream order: the estimate is order-dependent.

use crate::core_modules::background::check_dimensions;
use crate::error::{OccupancyError, OccupancyResult};
use image::{GrayImage, Luma, Rgb, RgbImage};
use std::fmt;

const FOREGROUND: u8 = 255;

/// Tunables of the mixture model. Defaults follow the common MOG2 settings.
#[derive(Debug, Clone, PartialEq)]
pub struct AdaptiveBackgroundConfig {
    /// Frames of memory once the learning rate has settled.
    pub history: u32,
    /// Squared Mahalanobis distance under which a sample matches a background mode.
    pub variance_threshold: f64,
    /// Squared distance under which a sample updates an existing mode.
    pub variance_threshold_gen: f64,
    /// Suppress shadows instead of reporting them as foreground.
    pub detect_shadows: bool,
    /// Lowest brightness ratio (sample / mode) still treated as shadow.
    pub shadow_threshold: f64,
    /// Share of the total weight that makes up the background modes.
    pub background_ratio: f64,
    /// Upper bound on modes per pixel.
    pub max_modes: usize,
    pub initial_variance: f64,
    pub min_variance: f64,
    pub max_variance: f64,
    /// Weight decay applied to every mode to prune unsupported ones.
    pub complexity_reduction: f64,
    /// Frames the model must observe before its output is trusted.
    pub warmup_frames: u64,
}

impl Default for AdaptiveBackgroundConfig {
    fn default() -> Self {
        Self {
            history: 500,
            variance_threshold: 16.0,
            variance_threshold_gen: 9.0,
            detect_shadows: true,
            shadow_threshold: 0.5,
            background_ratio: 0.9,
            max_modes: 3,
            initial_variance: 15.0,
            min_variance: 4.0,
            max_variance: 75.0,
            complexity_reduction: 0.05,
            warmup_frames: 30,
        }
    }
}

impl AdaptiveBackgroundConfig {
    fn validate(&self) -> OccupancyResult<()> {
        if self.history == 0 {
            return Err(OccupancyError::InvalidConfig("history must be positive".into()));
        }
        if self.max_modes == 0 || self.max_modes > u8::MAX as usize {
            return Err(OccupancyError::InvalidConfig(format!(
                "max_modes must be within 1..=255, got {}",
                self.max_modes
            )));
        }
        if self.min_variance <= 0.0 || self.min_variance > self.max_variance {
            return Err(OccupancyError::InvalidConfig(format!(
                "variance bounds {}..{} are not a valid range",
                self.min_variance, self.max_variance
            )));
        }
        if !(0.0..=1.0).contains(&self.background_ratio) {
            return Err(OccupancyError::InvalidConfig(format!(
                "background_ratio {} outside 0..=1",
                self.background_ratio
            )));
        }
        Ok(())
    }
}

/// How a single pixel was classified against the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelClass {
    Background,
    Shadow,
    Foreground,
}

#[derive(Debug, Clone, Copy, Default)]
struct Mode {
    weight: f32,
    mean: [f32; 3],
    variance: f32,
}

impl Mode {
    fn distance_squared(&self, sample: &[f32; 3]) -> f32 {
        self.mean
            .iter()
            .zip(sample.iter())
            .map(|(m, s)| (s - m) * (s - m))
            .sum()
    }
}

/// A per-pixel Gaussian-mixture background estimate.
pub struct AdaptiveBackground {
    config: AdaptiveBackgroundConfig,
    width: u32,
    height: u32,
    /// `max_modes` slots per pixel, heaviest first.
    modes: Vec<Mode>,
    mode_counts: Vec<u8>,
    frames_observed: u64,
}

impl fmt::Debug for AdaptiveBackground {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdaptiveBackground")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("frames_observed", &self.frames_observed)
            .field("config", &self.config)
            .finish()
    }
}

impl AdaptiveBackground {
    pub fn new(width: u32, height: u32, config: AdaptiveBackgroundConfig) -> OccupancyResult<Self> {
        config.validate()?;
        let pixels = (width as usize) * (height as usize);
        Ok(Self {
            modes: vec![Mode::default(); pixels * config.max_modes],
            mode_counts: vec![0; pixels],
            config,
            width,
            height,
            frames_observed: 0,
        })
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn config(&self) -> &AdaptiveBackgroundConfig {
        &self.config
    }

    pub fn frames_observed(&self) -> u64 {
        self.frames_observed
    }

    pub fn is_warmed_up(&self) -> bool {
        self.frames_observed >= self.config.warmup_frames
    }

    /// Fails with `BackgroundWarmingUp` until enough frames were observed.
    pub fn ensure_warmed_up(&self) -> OccupancyResult<()> {
        if self.is_warmed_up() {
            Ok(())
        } else {
            Err(OccupancyError::BackgroundWarmingUp {
                observed: self.frames_observed,
                required: self.config.warmup_frames,
            })
        }
    }

    /// Primes the model by observing a known-empty frame repeatedly.
    pub fn warm_up(&mut self, empty_frame: &RgbImage, repetitions: u32) -> OccupancyResult<()> {
        for _ in 0..repetitions {
            self.observe(empty_frame)?;
        }
        Ok(())
    }

    /// Classifies `frame` against the current estimate, then folds it into the
    /// estimate. Returns the foreground mask of the frame (255 = foreground).
    pub fn observe(&mut self, frame: &RgbImage) -> OccupancyResult<GrayImage> {
        check_dimensions(self.dimensions(), frame.dimensions())?;
        let mask = self.foreground_mask(frame)?;

        self.frames_observed += 1;
        let alpha = 1.0
            / (2 * self.frames_observed).min(self.config.history as u64) as f32;
        for (index, pixel) in frame.pixels().enumerate() {
            self.update_pixel(index, sample(pixel), alpha);
        }
        Ok(mask)
    }

    /// Foreground mask of `frame` against the current estimate, without learning.
    /// Shadows are suppressed when shadow detection is on.
    pub fn foreground_mask(&self, frame: &RgbImage) -> OccupancyResult<GrayImage> {
        check_dimensions(self.dimensions(), frame.dimensions())?;
        let mut mask = GrayImage::new(self.width, self.height);
        for ((index, pixel), out) in frame.pixels().enumerate().zip(mask.pixels_mut()) {
            if self.classify_pixel(index, &sample(pixel)) == PixelClass::Foreground {
                *out = Luma([FOREGROUND]);
            }
        }
        Ok(mask)
    }

    /// Per-pixel classification of `frame`, row-major.
    pub fn classify(&self, frame: &RgbImage) -> OccupancyResult<Vec<PixelClass>> {
        check_dimensions(self.dimensions(), frame.dimensions())?;
        Ok(frame
            .pixels()
            .enumerate()
            .map(|(index, pixel)| self.classify_pixel(index, &sample(pixel)))
            .collect())
    }

    /// The mean of each pixel's heaviest mode; black where nothing was learned.
    pub fn background_image(&self) -> RgbImage {
        let k = self.config.max_modes;
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let index = (y * self.width + x) as usize;
            if self.mode_counts[index] == 0 {
                return Rgb([0, 0, 0]);
            }
            let mean = self.modes[index * k].mean;
            Rgb(mean.map(|c| c.round().clamp(0.0, 255.0) as u8))
        })
    }

    fn pixel_modes(&self, index: usize) -> &[Mode] {
        let k = self.config.max_modes;
        let start = index * k;
        &self.modes[start..start + self.mode_counts[index] as usize]
    }

    fn classify_pixel(&self, index: usize, x: &[f32; 3]) -> PixelClass {
        let modes = self.pixel_modes(index);
        let ratio = self.config.background_ratio as f32;
        let threshold = self.config.variance_threshold as f32;

        let mut cumulative = 0.0f32;
        for mode in modes {
            if cumulative >= ratio {
                break;
            }
            if mode.distance_squared(x) < threshold * mode.variance {
                return PixelClass::Background;
            }
            cumulative += mode.weight;
        }

        if self.config.detect_shadows && self.is_shadow(modes, x) {
            return PixelClass::Shadow;
        }
        PixelClass::Foreground
    }

    /// A shadow is a uniformly darker copy of a background mode: the sample is
    /// close to `a * mean` for some brightness ratio `a` in [tau, 1].
    fn is_shadow(&self, modes: &[Mode], x: &[f32; 3]) -> bool {
        let ratio = self.config.background_ratio as f32;
        let threshold = self.config.variance_threshold as f32;
        let tau = self.config.shadow_threshold as f32;

        let mut cumulative = 0.0f32;
        for mode in modes {
            let numerator: f32 = mode.mean.iter().zip(x.iter()).map(|(m, s)| m * s).sum();
            let denominator: f32 = mode.mean.iter().map(|m| m * m).sum();
            if denominator <= f32::EPSILON {
                return false;
            }
            if numerator <= denominator && numerator >= tau * denominator {
                let a = numerator / denominator;
                let dist2a: f32 = mode
                    .mean
                    .iter()
                    .zip(x.iter())
                    .map(|(m, s)| (a * m - s) * (a * m - s))
                    .sum();
                if dist2a < threshold * mode.variance * a * a {
                    return true;
                }
            }
            cumulative += mode.weight;
            if cumulative > ratio {
                return false;
            }
        }
        false
    }

    fn update_pixel(&mut self, index: usize, x: [f32; 3], alpha: f32) {
        let k = self.config.max_modes;
        let start = index * k;
        let mut count = self.mode_counts[index] as usize;
        let prune = -alpha * self.config.complexity_reduction as f32;
        let gen_threshold = self.config.variance_threshold_gen as f32;
        let (min_var, max_var) = (
            self.config.min_variance as f32,
            self.config.max_variance as f32,
        );

        let mut fits = false;
        let mut total = 0.0f32;
        let mut m = 0;
        while m < count {
            let mode = &mut self.modes[start + m];
            let mut weight = (1.0 - alpha) * mode.weight + prune;
            if !fits {
                let dist2 = mode.distance_squared(&x);
                if dist2 < gen_threshold * mode.variance {
                    fits = true;
                    weight += alpha;
                    let step = alpha / weight;
                    for (mean, s) in mode.mean.iter_mut().zip(x.iter()) {
                        *mean += step * (s - *mean);
                    }
                    mode.variance =
                        (mode.variance + step * (dist2 - mode.variance)).clamp(min_var, max_var);
                }
            }
            if weight < -prune {
                // Unsupported mode: drop it and close the gap.
                self.modes.copy_within(start + m + 1..start + count, start + m);
                count -= 1;
                continue;
            }
            self.modes[start + m].weight = weight;
            total += weight;
            m += 1;
        }

        let modes = &mut self.modes[start..start + k];
        if total > 0.0 {
            for mode in modes[..count].iter_mut() {
                mode.weight /= total;
            }
        }

        if !fits {
            let slot = if count == k { k - 1 } else { count };
            if count < k {
                count += 1;
            }
            if count == 1 {
                modes[slot].weight = 1.0;
            } else {
                for mode in modes[..count].iter_mut() {
                    mode.weight *= 1.0 - alpha;
                }
                modes[slot].weight = alpha;
            }
            modes[slot].mean = x;
            modes[slot].variance = self.config.initial_variance as f32;
        }

        // Heaviest first; at most `k` elements, so insertion sort is enough.
        for i in 1..count {
            let mut j = i;
            while j > 0 && modes[j].weight > modes[j - 1].weight {
                modes.swap(j, j - 1);
                j -= 1;
            }
        }
        self.mode_counts[index] = count as u8;
    }
}

fn sample(pixel: &Rgb<u8>) -> [f32; 3] {
    pixel.0.map(|c| c as f32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn warmed(frame: &RgbImage) -> AdaptiveBackground {
        let (w, h) = frame.dimensions();
        let mut model = AdaptiveBackground::new(w, h, AdaptiveBackgroundConfig::default()).unwrap();
        model.warm_up(frame, 30).unwrap();
        model
    }

    fn count_foreground(mask: &GrayImage) -> usize {
        mask.pixels().filter(|p| p.0[0] == FOREGROUND).count()
    }

    #[test]
    fn not_trusted_before_warm_up() {
        let frame = RgbImage::from_pixel(8, 8, Rgb([90, 90, 90]));
        let mut model = AdaptiveBackground::new(8, 8, AdaptiveBackgroundConfig::default()).unwrap();
        model.observe(&frame).unwrap();
        assert!(!model.is_warmed_up());
        assert!(matches!(
            model.ensure_warmed_up(),
            Err(OccupancyError::BackgroundWarmingUp { observed: 1, required: 30 })
        ));
        model.warm_up(&frame, 29).unwrap();
        assert!(model.ensure_warmed_up().is_ok());
    }

    #[test]
    fn learned_frame_is_background() {
        let frame = RgbImage::from_fn(16, 16, |x, y| Rgb([(x * 10) as u8, (y * 10) as u8, 50]));
        let model = warmed(&frame);
        let mask = model.foreground_mask(&frame).unwrap();
        assert_eq!(count_foreground(&mask), 0);
        assert_eq!(model.background_image(), frame);
    }

    #[test]
    fn new_object_is_foreground() {
        let empty = RgbImage::from_pixel(16, 16, Rgb([40, 40, 40]));
        let model = warmed(&empty);
        let mut busy = empty.clone();
        for y in 4..8 {
            for x in 4..8 {
                busy.put_pixel(x, y, Rgb([220, 30, 30]));
            }
        }
        let mask = model.foreground_mask(&busy).unwrap();
        assert_eq!(count_foreground(&mask), 16);
        assert_eq!(mask.get_pixel(5, 5).0[0], FOREGROUND);
    }

    #[test]
    fn shadows_are_suppressed() {
        let empty = RgbImage::from_pixel(4, 4, Rgb([160, 160, 160]));
        let model = warmed(&empty);
        let shaded = RgbImage::from_pixel(4, 4, Rgb([100, 100, 100]));
        assert_eq!(count_foreground(&model.foreground_mask(&shaded).unwrap()), 0);
        assert!(model.classify(&shaded).unwrap().iter().all(|c| *c == PixelClass::Shadow));

        let config = AdaptiveBackgroundConfig {
            detect_shadows: false,
            ..AdaptiveBackgroundConfig::default()
        };
        let mut plain = AdaptiveBackground::new(4, 4, config).unwrap();
        plain.warm_up(&empty, 30).unwrap();
        assert_eq!(count_foreground(&plain.foreground_mask(&shaded).unwrap()), 16);
    }

    #[test]
    fn persistent_change_is_absorbed() {
        let empty = RgbImage::from_pixel(4, 4, Rgb([40, 40, 40]));
        let mut model = warmed(&empty);
        let parked = RgbImage::from_pixel(4, 4, Rgb([200, 200, 20]));
        let first = model.observe(&parked).unwrap();
        assert_eq!(count_foreground(&first), 16);
        for _ in 0..200 {
            model.observe(&parked).unwrap();
        }
        assert_eq!(count_foreground(&model.foreground_mask(&parked).unwrap()), 0);
    }

    #[test]
    fn size_mismatch_is_rejected() {
        let mut model = AdaptiveBackground::new(4, 4, AdaptiveBackgroundConfig::default()).unwrap();
        let err = model.observe(&RgbImage::new(5, 4)).unwrap_err();
        assert!(matches!(err, OccupancyError::FrameSizeMismatch { .. }));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = AdaptiveBackgroundConfig {
            max_modes: 0,
            ..AdaptiveBackgroundConfig::default()
        };
        assert!(matches!(
            AdaptiveBackground::new(4, 4, config),
            Err(OccupancyError::InvalidConfig(_))
        ));
    }
}
