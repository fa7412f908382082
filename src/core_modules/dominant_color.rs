// THEORY:
// The dominant color of an occupied region is the centroid of the most
// populous color cluster among its masked pixels. Clustering is plain k-means
// in RGB space with random initial centers, repeated for several attempts and
// keeping the tightest result (lowest sum of squared distances).
//
// Determinism matters more here than raw speed: the same pixels must always
// yield the same color. The random generator is seeded from the config, and
// the samples are put in a canonical (sorted) order before clustering, so the
// result does not depend on the order pixels were read in.

use crate::core_modules::pixel::Color;
use crate::core_modules::region::fit_mask;
use crate::error::{OccupancyError, OccupancyResult};
use image::{GrayImage, RgbImage};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;

type Sample = [f32; 3];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColorStrategy {
    /// Most populous k-means cluster.
    KMeans,
    /// Plain average of the masked pixels.
    MaskedMean,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColorConfig {
    pub strategy: ColorStrategy,
    /// Number of clusters (k).
    pub clusters: usize,
    /// Refinement passes per attempt.
    pub max_iterations: u32,
    /// An attempt stops early once no center moves farther than this.
    pub epsilon: f64,
    /// Independent random initialisations; the most compact one wins.
    pub attempts: u32,
    pub seed: u64,
    /// Attach the nearest palette name to every extracted color.
    pub name_colors: bool,
}

impl Default for ColorConfig {
    fn default() -> Self {
        Self {
            strategy: ColorStrategy::KMeans,
            clusters: 3,
            max_iterations: 10,
            epsilon: 1.0,
            attempts: 10,
            seed: 0x5eed_c010,
            name_colors: false,
        }
    }
}

impl ColorConfig {
    pub fn validate(&self) -> OccupancyResult<()> {
        if self.clusters == 0 {
            return Err(OccupancyError::InvalidConfig("clusters must be at least 1".into()));
        }
        if self.attempts == 0 || self.max_iterations == 0 {
            return Err(OccupancyError::InvalidConfig(
                "attempts and max_iterations must be at least 1".into(),
            ));
        }
        if !(self.epsilon >= 0.0) {
            return Err(OccupancyError::InvalidConfig(format!(
                "epsilon {} must be non-negative",
                self.epsilon
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DominantColorExtractor {
    config: ColorConfig,
}

impl DominantColorExtractor {
    pub fn new(config: ColorConfig) -> OccupancyResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ColorConfig {
        &self.config
    }

    /// Returns `None` when the mask selects no pixels.
    pub fn dominant_color(&self, sub_frame: &RgbImage, mask: Option<&GrayImage>) -> Option<Color> {
        let samples = collect_samples(sub_frame, mask);
        if samples.is_empty() {
            return None;
        }
        match self.config.strategy {
            ColorStrategy::MaskedMean => Some(mean_color(&samples)),
            ColorStrategy::KMeans => Some(self.largest_cluster(samples)),
        }
    }

    fn largest_cluster(&self, mut samples: Vec<Sample>) -> Color {
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let k = self.config.clusters.min(samples.len());
        let epsilon_sq = (self.config.epsilon * self.config.epsilon) as f32;
        let mut rng = StdRng::seed_from_u64(self.config.seed);

        let mut best: Option<Clustering> = None;
        for _ in 0..self.config.attempts {
            let mut centers: Vec<Sample> = index::sample(&mut rng, samples.len(), k)
                .into_iter()
                .map(|i| samples[i])
                .collect();
            let mut labels = vec![0usize; samples.len()];

            for _ in 0..self.config.max_iterations {
                assign(&samples, &centers, &mut labels);
                let shift = recenter(&samples, &labels, &mut centers);
                if shift <= epsilon_sq {
                    break;
                }
            }
            let compactness = assign(&samples, &centers, &mut labels);

            if best.as_ref().is_none_or(|b| compactness < b.compactness) {
                best = Some(Clustering {
                    centers,
                    labels,
                    compactness,
                });
            }
        }

        let Some(best) = best else {
            return mean_color(&samples);
        };
        let mut counts = vec![0usize; k];
        for label in &best.labels {
            counts[*label] += 1;
        }
        let mut dominant = 0;
        for (cluster, count) in counts.iter().enumerate() {
            if *count > counts[dominant] {
                dominant = cluster;
            }
        }
        quantize(&best.centers[dominant])
    }
}

struct Clustering {
    centers: Vec<Sample>,
    labels: Vec<usize>,
    compactness: f64,
}

/// Dominant color with the default clustering settings and `k` clusters.
pub fn dominant_color(sub_frame: &RgbImage, mask: Option<&GrayImage>, k: usize) -> Option<Color> {
    let config = ColorConfig {
        clusters: k.max(1),
        ..ColorConfig::default()
    };
    DominantColorExtractor { config }.dominant_color(sub_frame, mask)
}

fn collect_samples(sub_frame: &RgbImage, mask: Option<&GrayImage>) -> Vec<Sample> {
    match mask {
        None => sub_frame.pixels().map(|p| p.0.map(|c| c as f32)).collect(),
        Some(mask) => {
            let mask = fit_mask(mask, sub_frame.width(), sub_frame.height());
            sub_frame
                .pixels()
                .zip(mask.pixels())
                .filter(|(_, m)| m.0[0] > 0)
                .map(|(p, _)| p.0.map(|c| c as f32))
                .collect()
        }
    }
}

fn distance_squared(a: &Sample, b: &Sample) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Labels every sample with its nearest center (lowest index on ties) and
/// returns the total squared distance.
fn assign(samples: &[Sample], centers: &[Sample], labels: &mut [usize]) -> f64 {
    let mut compactness = 0f64;
    for (sample, label) in samples.iter().zip(labels.iter_mut()) {
        let mut nearest = 0;
        let mut nearest_dist = f32::INFINITY;
        for (i, center) in centers.iter().enumerate() {
            let d = distance_squared(sample, center);
            if d < nearest_dist {
                nearest = i;
                nearest_dist = d;
            }
        }
        *label = nearest;
        compactness += nearest_dist as f64;
    }
    compactness
}

/// Moves centers to their cluster means and returns the largest squared shift.
/// Empty clusters keep their previous center.
fn recenter(samples: &[Sample], labels: &[usize], centers: &mut [Sample]) -> f32 {
    let mut sums = vec![[0f64; 3]; centers.len()];
    let mut counts = vec![0usize; centers.len()];
    for (sample, label) in samples.iter().zip(labels.iter()) {
        for c in 0..3 {
            sums[*label][c] += sample[c] as f64;
        }
        counts[*label] += 1;
    }
    let mut max_shift = 0f32;
    for ((center, sum), count) in centers.iter_mut().zip(sums.iter()).zip(counts.iter()) {
        if *count == 0 {
            continue;
        }
        let updated = sum.map(|s| (s / *count as f64) as f32);
        max_shift = max_shift.max(distance_squared(center, &updated));
        *center = updated;
    }
    max_shift
}

fn mean_color(samples: &[Sample]) -> Color {
    let mut sum = [0f64; 3];
    for sample in samples {
        for c in 0..3 {
            sum[c] += sample[c] as f64;
        }
    }
    let n = samples.len().max(1) as f64;
    quantize(&sum.map(|s| (s / n) as f32))
}

fn quantize(center: &Sample) -> Color {
    Color::from(center.map(|c| c.round().clamp(0.0, 255.0) as u8))
}

/// A palette entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NamedColor {
    pub name: &'static str,
    pub color: Color,
}

const fn named(name: &'static str, red: u8, green: u8, blue: u8) -> NamedColor {
    NamedColor {
        name,
        color: Color::new(red, green, blue),
    }
}

/// The fixed palette colors are named from, in lookup order.
pub const PALETTE: &[NamedColor] = &[
    named("black", 0, 0, 0),
    named("white", 255, 255, 255),
    named("gray", 128, 128, 128),
    named("silver", 192, 192, 192),
    named("red", 255, 0, 0),
    named("maroon", 128, 0, 0),
    named("orange", 255, 165, 0),
    named("brown", 139, 69, 19),
    named("yellow", 255, 255, 0),
    named("olive", 128, 128, 0),
    named("lime", 0, 255, 0),
    named("green", 0, 128, 0),
    named("cyan", 0, 255, 255),
    named("teal", 0, 128, 128),
    named("blue", 0, 0, 255),
    named("navy", 0, 0, 128),
    named("magenta", 255, 0, 255),
    named("purple", 128, 0, 128),
];

/// The palette entry closest to `color`; the first entry wins ties.
pub fn nearest_named_color(color: Color) -> &'static NamedColor {
    let mut nearest = &PALETTE[0];
    let mut nearest_dist = color.distance_squared(&nearest.color);
    for entry in &PALETTE[1..] {
        let d = color.distance_squared(&entry.color);
        if d < nearest_dist {
            nearest = entry;
            nearest_dist = d;
        }
    }
    nearest
}
