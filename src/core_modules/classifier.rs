// THEORY:
// The `OccupancyClassifier` is the decision core. It never touches pixels
// itself; it receives the `RegionSignals` measured for a region and turns them
// into an occupied/free verdict.
//
// Modes:
// 1.  **Single criterion**: occupied when the changed-pixel count reaches the
//     region's threshold.
// 2.  **Multi criterion**: four independent votes (pixel difference, texture
//     change, edge energy, histogram decorrelation); occupied when at least
//     `required_votes` of them agree. One noisy signal cannot flip a verdict on
//     its own.
// 3.  **No background**: a weak, context-free heuristic on the region's own
//     intensity profile (textured and not pavement-grey).
//
// The threshold for the pixel-difference test is the calibrated table entry
// when there is one, else a fallback derived from the config. All comparisons
// are inclusive: a value that reaches its floor votes.
//
// Every numeric default below is a tunable heuristic, not a derived constant.

use crate::core_modules::background::NoiseFilter;
use crate::core_modules::calibrator::ThresholdTable;
use crate::core_modules::region::Region;
use crate::core_modules::signals::{IntensityProfile, RegionSignals};
use crate::error::{OccupancyError, OccupancyResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClassifierMode {
    SingleCriterion,
    #[default]
    MultiCriterion,
}

/// Threshold used for regions without a calibrated entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FallbackThreshold {
    /// One global changed-pixel count for every region.
    Fixed(f64),
    /// `max(minimum, area * fraction)`.
    AreaScaled { minimum: f64, fraction: f64 },
}

impl FallbackThreshold {
    pub fn for_area(&self, area: u32) -> f64 {
        match *self {
            FallbackThreshold::Fixed(value) => value,
            FallbackThreshold::AreaScaled { minimum, fraction } => minimum.max(area as f64 * fraction),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierConfig {
    pub noise: NoiseFilter,
    pub fallback_threshold: FallbackThreshold,
    /// Minimum |variance(current) - variance(background)| for the texture vote.
    pub texture_floor: f64,
    /// Minimum mean Sobel magnitude for the edge vote.
    pub gradient_floor: f64,
    /// Histogram correlation at or below this votes for "changed".
    pub histogram_correlation_ceiling: f64,
    /// Votes out of four needed for "occupied".
    pub required_votes: u8,
    /// Minimum intensity variance for the no-background heuristic.
    pub heuristic_variance_floor: f64,
    /// Mean intensities inside this band look like empty pavement.
    pub pavement_band: (f64, f64),
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            noise: NoiseFilter::default(),
            fallback_threshold: FallbackThreshold::AreaScaled {
                minimum: 5000.0,
                fraction: 0.15,
            },
            texture_floor: 50.0,
            gradient_floor: 10.0,
            histogram_correlation_ceiling: 0.7,
            required_votes: 2,
            heuristic_variance_floor: 300.0,
            pavement_band: (60.0, 120.0),
        }
    }
}

impl ClassifierConfig {
    pub fn validate(&self) -> OccupancyResult<()> {
        if self.required_votes == 0 || self.required_votes > 4 {
            return Err(OccupancyError::InvalidConfig(format!(
                "required_votes must be within 1..=4, got {}",
                self.required_votes
            )));
        }
        if self.pavement_band.0 > self.pavement_band.1 {
            return Err(OccupancyError::InvalidConfig(format!(
                "pavement band {:?} is inverted",
                self.pavement_band
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdSource {
    Calibrated,
    Fallback,
}

/// The four multi-criterion votes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Votes {
    pub pixel_difference: bool,
    pub texture: bool,
    pub gradient: bool,
    pub histogram: bool,
}

impl Votes {
    pub fn count(&self) -> u8 {
        [self.pixel_difference, self.texture, self.gradient, self.histogram]
            .iter()
            .filter(|v| **v)
            .count() as u8
    }
}

/// A verdict plus how it was reached.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub occupied: bool,
    pub threshold: f64,
    pub source: ThresholdSource,
    /// Present in multi-criterion mode.
    pub votes: Option<Votes>,
}

#[derive(Debug, Clone)]
pub struct OccupancyClassifier {
    mode: ClassifierMode,
    config: ClassifierConfig,
}

impl OccupancyClassifier {
    pub fn new(mode: ClassifierMode, config: ClassifierConfig) -> OccupancyResult<Self> {
        config.validate()?;
        Ok(Self { mode, config })
    }

    pub fn mode(&self) -> ClassifierMode {
        self.mode
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// The changed-pixel threshold for `region` and where it came from.
    pub fn threshold_for(&self, region: &Region, table: &ThresholdTable) -> (f64, ThresholdSource) {
        match table.get(region.index) {
            Some(threshold) => (threshold, ThresholdSource::Calibrated),
            None => (
                self.config.fallback_threshold.for_area(region.area()),
                ThresholdSource::Fallback,
            ),
        }
    }

    pub fn votes(&self, signals: &RegionSignals, threshold: f64) -> Votes {
        Votes {
            pixel_difference: signals.changed_pixels as f64 >= threshold,
            texture: signals.texture_delta >= self.config.texture_floor,
            gradient: signals.gradient_mean >= self.config.gradient_floor,
            histogram: signals.histogram_correlation <= self.config.histogram_correlation_ceiling,
        }
    }

    /// Decides occupancy of `region` from signals measured against a background.
    pub fn classify(&self, region: &Region, signals: &RegionSignals, table: &ThresholdTable) -> Decision {
        let (threshold, source) = self.threshold_for(region, table);
        match self.mode {
            ClassifierMode::SingleCriterion => Decision {
                occupied: signals.changed_pixels as f64 >= threshold,
                threshold,
                source,
                votes: None,
            },
            ClassifierMode::MultiCriterion => {
                let votes = self.votes(signals, threshold);
                Decision {
                    occupied: votes.count() >= self.config.required_votes,
                    threshold,
                    source,
                    votes: Some(votes),
                }
            }
        }
    }

    /// Background-free heuristic: textured and not pavement-grey.
    pub fn classify_without_background(&self, profile: &IntensityProfile) -> bool {
        let (low, high) = self.config.pavement_band;
        profile.variance >= self.config.heuristic_variance_floor
            && (profile.mean < low || profile.mean > high)
    }
}
