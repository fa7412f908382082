// THEORY:
// A single error type for the whole engine. Geometry problems surface when a
// region is built, never during detection. Everything the detection path can
// reject (frames that do not fit the regions, a background that is still
// learning) is reported here instead of being clamped away.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OccupancyError {
    #[error("invalid region geometry: {0}")]
    InvalidGeometry(String),

    #[error("calibration needs at least {required} sample frame(s), got {provided}")]
    InsufficientSamples { required: usize, provided: usize },

    #[error(
        "region {region} ({x},{y} {width}x{height}) lies outside the {frame_width}x{frame_height} frame"
    )]
    RegionOutOfBounds {
        region: usize,
        x: i64,
        y: i64,
        width: u32,
        height: u32,
        frame_width: u32,
        frame_height: u32,
    },

    #[error("frame is {}x{} but the background reference is {}x{}", actual.0, actual.1, expected.0, expected.1)]
    FrameSizeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("background model has observed {observed} of {required} warm-up frames")]
    BackgroundWarmingUp { observed: u64, required: u64 },

    #[error("calibration needs a background reference, but none was configured")]
    MissingBackground,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("region worker failed: {0}")]
    Worker(String),
}

pub type OccupancyResult<T> = Result<T, OccupancyError>;
