// THEORY:
// The `signals` module turns a pair of intensity crops (current frame and
// background, both cut to the same region) into the scalar evidence the
// classifier votes on. It is the regional-analysis layer: every reduction here
// honours the region mask, so polygon regions only ever see their own pixels.
//
// Signals, each measured inside the mask:
// - changed pixels: how many pixels differ from the background by more than a
//   per-pixel delta (or, for the adaptive background, how many are foreground),
// - texture delta: |variance(current) - variance(background)|,
// - gradient mean: mean Sobel magnitude of the current crop (edge energy),
// - histogram correlation: Pearson correlation of the two 256-bin histograms.
//
// Both crops are median-smoothed first when a smoothing radius is set, which
// removes single-pixel sensor noise before anything is counted. The median
// window only draws on pixels inside the mask, so the unmasked margin around
// a polygon never bleeds into its edge pixels.

use crate::core_modules::region::fit_mask;
use image::{GrayImage, Luma};
use imageproc::gradients::{horizontal_sobel, vertical_sobel};

pub const HISTOGRAM_BINS: usize = 256;

/// Everything measured for one region in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionSignals {
    /// Pixels inside the mask.
    pub area: u32,
    pub changed_pixels: u32,
    pub texture_delta: f64,
    pub gradient_mean: f64,
    pub histogram_correlation: f64,
    pub current: IntensityProfile,
    pub background: IntensityProfile,
}

/// Mean and population variance of the masked intensities.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct IntensityProfile {
    pub mean: f64,
    pub variance: f64,
}

impl IntensityProfile {
    pub fn measure(gray: &GrayImage, mask: &GrayImage) -> Self {
        let mask = fit_mask(mask, gray.width(), gray.height());
        let mut count = 0u64;
        let mut sum = 0f64;
        let mut sum_sq = 0f64;
        for (value, m) in gray.pixels().zip(mask.pixels()) {
            if m.0[0] > 0 {
                let v = value.0[0] as f64;
                count += 1;
                sum += v;
                sum_sq += v * v;
            }
        }
        if count == 0 {
            return Self::default();
        }
        let mean = sum / count as f64;
        let variance = (sum_sq / count as f64 - mean * mean).max(0.0);
        Self { mean, variance }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.sqrt()
    }
}

impl RegionSignals {
    /// Measures a region against a background crop of the same footprint.
    pub fn measure(
        current: &GrayImage,
        background: &GrayImage,
        mask: &GrayImage,
        pixel_delta: u8,
        smoothing_radius: u32,
    ) -> Self {
        let mask = fit_mask(mask, current.width(), current.height());
        let current = smooth(current, &mask, smoothing_radius);
        let background = smooth(background, &mask, smoothing_radius);
        let changed = changed_pixel_count(&current, &background, &mask, pixel_delta);
        Self::assemble(&current, &background, &mask, changed)
    }

    /// Like `measure`, but the changed-pixel count comes from a foreground
    /// mask produced by an adaptive background model.
    pub fn measure_with_foreground(
        current: &GrayImage,
        background: &GrayImage,
        foreground: &GrayImage,
        mask: &GrayImage,
        smoothing_radius: u32,
    ) -> Self {
        let mask = fit_mask(mask, current.width(), current.height());
        let current = smooth(current, &mask, smoothing_radius);
        let background = smooth(background, &mask, smoothing_radius);
        let foreground = fit_mask(foreground, current.width(), current.height());
        let changed = masked_count(&foreground, &mask);
        Self::assemble(&current, &background, &mask, changed)
    }

    fn assemble(current: &GrayImage, background: &GrayImage, mask: &GrayImage, changed: u32) -> Self {
        let current_profile = IntensityProfile::measure(current, mask);
        let background_profile = IntensityProfile::measure(background, mask);
        Self {
            area: masked_count(mask, mask),
            changed_pixels: changed,
            texture_delta: (current_profile.variance - background_profile.variance).abs(),
            gradient_mean: gradient_mean(current, mask),
            histogram_correlation: histogram_correlation(
                &histogram(current, mask),
                &histogram(background, mask),
            ),
            current: current_profile,
            background: background_profile,
        }
    }
}

/// Median filter with a square window of `2 * radius + 1`, restricted to the
/// mask: each masked pixel takes the median of the masked pixels in its window
/// and unmasked pixels are copied through. Radius 0 is a copy.
pub fn smooth(gray: &GrayImage, mask: &GrayImage, radius: u32) -> GrayImage {
    if radius == 0 {
        return gray.clone();
    }
    let (width, height) = gray.dimensions();
    let side = 2 * radius as usize + 1;
    let mut window: Vec<u8> = Vec::with_capacity(side * side);
    let mut out = gray.clone();
    for y in 0..height {
        for x in 0..width {
            if mask.get_pixel(x, y).0[0] == 0 {
                continue;
            }
            window.clear();
            for wy in y.saturating_sub(radius)..(y + radius + 1).min(height) {
                for wx in x.saturating_sub(radius)..(x + radius + 1).min(width) {
                    if mask.get_pixel(wx, wy).0[0] > 0 {
                        window.push(gray.get_pixel(wx, wy).0[0]);
                    }
                }
            }
            let middle = window.len() / 2;
            let (_, median, _) = window.select_nth_unstable(middle);
            out.put_pixel(x, y, Luma([*median]));
        }
    }
    out
}

/// Masked pixels whose absolute difference exceeds `pixel_delta`.
pub fn changed_pixel_count(
    current: &GrayImage,
    background: &GrayImage,
    mask: &GrayImage,
    pixel_delta: u8,
) -> u32 {
    current
        .pixels()
        .zip(background.pixels())
        .zip(mask.pixels())
        .filter(|((c, b), m)| m.0[0] > 0 && c.0[0].abs_diff(b.0[0]) > pixel_delta)
        .count() as u32
}

/// Pixels set in both `image` and `mask`.
pub fn masked_count(image: &GrayImage, mask: &GrayImage) -> u32 {
    image
        .pixels()
        .zip(mask.pixels())
        .filter(|(p, m)| p.0[0] > 0 && m.0[0] > 0)
        .count() as u32
}

/// Mean Sobel gradient magnitude over the masked pixels.
pub fn gradient_mean(gray: &GrayImage, mask: &GrayImage) -> f64 {
    let gx = horizontal_sobel(gray);
    let gy = vertical_sobel(gray);
    let mut count = 0u64;
    let mut total = 0f64;
    for ((x, y), m) in gx.pixels().zip(gy.pixels()).zip(mask.pixels()) {
        if m.0[0] > 0 {
            let (x, y) = (x.0[0] as f64, y.0[0] as f64);
            total += (x * x + y * y).sqrt();
            count += 1;
        }
    }
    if count == 0 { 0.0 } else { total / count as f64 }
}

pub fn histogram(gray: &GrayImage, mask: &GrayImage) -> [f64; HISTOGRAM_BINS] {
    let mut bins = [0f64; HISTOGRAM_BINS];
    for (p, m) in gray.pixels().zip(mask.pixels()) {
        if m.0[0] > 0 {
            bins[p.0[0] as usize] += 1.0;
        }
    }
    bins
}

/// Pearson correlation of two histograms. Returns 1.0 when either histogram
/// is flat, since there is no variation to disagree on.
pub fn histogram_correlation(a: &[f64; HISTOGRAM_BINS], b: &[f64; HISTOGRAM_BINS]) -> f64 {
    let n = HISTOGRAM_BINS as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let (mut num, mut den_a, mut den_b) = (0f64, 0f64, 0f64);
    for (x, y) in a.iter().zip(b.iter()) {
        let (da, db) = (x - mean_a, y - mean_b);
        num += da * db;
        den_a += da * da;
        den_b += db * db;
    }
    let den = den_a * den_b;
    if den.abs() > f64::EPSILON {
        num / den.sqrt()
    } else {
        1.0
    }
}
