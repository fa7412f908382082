pub mod adaptive_background;
pub mod background;
pub mod calibrator;
pub mod classifier;
pub mod dominant_color;
pub mod pixel;
pub mod region;
pub mod signals;
