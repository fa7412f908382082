// THEORY:
// Threshold calibration replaces one global "how many pixels must change"
// constant with a per-region value learned from a batch of sample frames. For
// every region it measures the changed-pixel count of each sample against the
// background, takes a high percentile of those counts as the region's noise
// floor, and adds a share of the region's area so that large regions need
// proportionally more change before they count as occupied.
//
// The result is an immutable `ThresholdTable`. Recalibration builds a new table;
// the pipeline swaps it in as a whole.

use crate::core_modules::background::StaticBackground;
use crate::core_modules::pixel::intensity_image;
use crate::core_modules::region::Region;
use crate::error::{OccupancyError, OccupancyResult};
use image::RgbImage;
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct CalibrationConfig {
    /// Percentile (0..=100) of the sample counts used as the noise floor.
    pub percentile: f64,
    /// Share of the region area added on top of the noise floor.
    pub area_fraction: f64,
    /// Below this many samples calibration still runs, with a warning.
    pub recommended_samples: usize,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            percentile: 90.0,
            area_fraction: 0.1,
            recommended_samples: 5,
        }
    }
}

impl CalibrationConfig {
    pub fn validate(&self) -> OccupancyResult<()> {
        if !(0.0..=100.0).contains(&self.percentile) {
            return Err(OccupancyError::InvalidConfig(format!(
                "percentile {} outside 0..=100",
                self.percentile
            )));
        }
        if !(self.area_fraction >= 0.0) {
            return Err(OccupancyError::InvalidConfig(format!(
                "area_fraction {} must be non-negative",
                self.area_fraction
            )));
        }
        Ok(())
    }
}

/// What calibration learned about one region.
#[derive(Debug, Clone, PartialEq)]
pub struct RegionCalibration {
    pub region: usize,
    /// Changed-pixel count of every sample frame, in sample order.
    pub difference_counts: Vec<u32>,
    pub noise_floor: f64,
    pub threshold: f64,
}

/// Per-region calibrated thresholds. Empty until a calibration succeeds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdTable {
    entries: BTreeMap<usize, RegionCalibration>,
}

impl ThresholdTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn get(&self, region: usize) -> Option<f64> {
        self.entries.get(&region).map(|entry| entry.threshold)
    }

    pub fn calibration(&self, region: usize) -> Option<&RegionCalibration> {
        self.entries.get(&region)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.entries.iter().map(|(index, entry)| (*index, entry.threshold))
    }
}

#[derive(Debug, Clone)]
pub struct ThresholdCalibrator {
    config: CalibrationConfig,
}

impl ThresholdCalibrator {
    pub fn new(config: CalibrationConfig) -> OccupancyResult<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn calibrate(
        &self,
        background: &StaticBackground,
        sample_frames: &[RgbImage],
        regions: &[Region],
    ) -> OccupancyResult<ThresholdTable> {
        if sample_frames.is_empty() {
            return Err(OccupancyError::InsufficientSamples {
                required: 1,
                provided: 0,
            });
        }
        if sample_frames.len() < self.config.recommended_samples {
            warn!(
                samples = sample_frames.len(),
                recommended = self.config.recommended_samples,
                "calibrating with few sample frames, thresholds may be unreliable"
            );
        }
        for frame in sample_frames {
            background.check_frame(frame.width(), frame.height())?;
        }

        let intensities: Vec<_> = sample_frames.iter().map(intensity_image).collect();
        let mut entries = BTreeMap::new();
        for region in regions {
            let difference_counts = intensities
                .iter()
                .map(|gray| background.diff_intensity(gray, region))
                .collect::<OccupancyResult<Vec<u32>>>()?;
            let values: Vec<f64> = difference_counts.iter().map(|c| *c as f64).collect();
            let noise_floor = percentile(&values, self.config.percentile);
            let threshold = noise_floor + region.area() as f64 * self.config.area_fraction;

            info!(
                region = region.index,
                noise_floor,
                threshold,
                "calibrated region threshold"
            );
            entries.insert(
                region.index,
                RegionCalibration {
                    region: region.index,
                    difference_counts,
                    noise_floor,
                    threshold,
                },
            );
        }
        Ok(ThresholdTable { entries })
    }
}

/// The `p`-th percentile (0..=100) of `values`, interpolating linearly between
/// the closest ranks. Returns 0 for an empty slice.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    let fraction = rank - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}
