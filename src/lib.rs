// THEORY:
// This file is the main entry point for the `vacancy_vision` library crate.
// The public API is the `OccupancyPipeline` (sequential) and the
// `ParallelPipeline` (per-region fan-out on tokio), configured through a
// single `PipelineConfig` value. Each pipeline answers one question per frame
// and region: is it occupied, and if so, what color is the occupant.
//
// The analysis building blocks live in `core_modules` and are public so that
// callers can use a single piece (a region mask, a dominant color, a
// calibration run) without the pipeline around it.

pub mod core_modules;
pub mod error;
pub mod logging;
pub mod parallel_pipeline;
pub mod pipeline;

pub use core_modules::adaptive_background::{AdaptiveBackground, AdaptiveBackgroundConfig};
pub use core_modules::background::{BackgroundReference, NoiseFilter, StaticBackground};
pub use core_modules::calibrator::{CalibrationConfig, RegionCalibration, ThresholdCalibrator, ThresholdTable};
pub use core_modules::classifier::{
    ClassifierConfig, ClassifierMode, Decision, FallbackThreshold, OccupancyClassifier, ThresholdSource, Votes,
};
pub use core_modules::dominant_color::{
    nearest_named_color, ColorConfig, ColorStrategy, DominantColorExtractor, NamedColor, PALETTE,
};
pub use core_modules::pixel::Color;
pub use core_modules::region::{BoundingBox, Geometry, Region};
pub use error::{OccupancyError, OccupancyResult};
pub use parallel_pipeline::ParallelPipeline;
pub use pipeline::{
    OccupancyPipeline, OccupancyVerdict, PipelineConfig, RegionDiagnostics, SweepPoint,
    DEFAULT_THRESHOLD_SWEEP,
};
