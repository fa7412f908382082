// THEORY:
// The `pipeline` module is the top-level API of the occupancy engine. An
// `OccupancyPipeline` owns everything one camera view needs: the regions, the
// background reference, the current threshold table and the configured
// classifier and color extractor. Nothing is process-wide; two pipelines never
// share state.
//
// A frame goes through two stages:
// 1.  **Prepare** (sequential): the frame is converted to intensity, the
//     adaptive background (if any) observes it, and a read-only `FrameContext`
//     is assembled with the background intensity, the foreground mask and a
//     snapshot of the threshold table.
// 2.  **Classify** (per region, independent): each region is measured against
//     the context and judged by the classifier. Occupied regions are annotated
//     with their dominant color.
//
// Stage 2 reads nothing mutable, which is what lets `ParallelPipeline` fan it
// out. The threshold table lives behind a single `Arc` that calibration
// replaces as a whole, so a context sees either the old or the new table.

use crate::core_modules::adaptive_background::{AdaptiveBackground, AdaptiveBackgroundConfig};
use crate::core_modules::background::{BackgroundReference, StaticBackground};
use crate::core_modules::calibrator::{CalibrationConfig, ThresholdCalibrator, ThresholdTable};
use crate::core_modules::classifier::{
    ClassifierConfig, ClassifierMode, Decision, OccupancyClassifier,
};
use crate::core_modules::dominant_color::{nearest_named_color, ColorConfig, DominantColorExtractor};
use crate::core_modules::pixel::{intensity_image, Color};
use crate::core_modules::region::{Geometry, Region};
use crate::core_modules::signals::{IntensityProfile, RegionSignals};
use crate::error::{OccupancyError, OccupancyResult};
use image::{GrayImage, RgbImage};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info};

/// Candidate thresholds for `diagnose` when the caller has none in mind.
pub const DEFAULT_THRESHOLD_SWEEP: [f64; 6] = [100.0, 200.0, 300.0, 500.0, 1000.0, 2000.0];

/// Configuration for the OccupancyPipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub mode: ClassifierMode,
    pub classifier: ClassifierConfig,
    pub calibration: CalibrationConfig,
    pub color: ColorConfig,
    /// Region workers used by `ParallelPipeline`.
    pub worker_count: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            mode: ClassifierMode::default(),
            classifier: ClassifierConfig::default(),
            calibration: CalibrationConfig::default(),
            color: ColorConfig::default(),
            worker_count: num_cpus::get(),
        }
    }
}

/// The verdict for one region in one frame.
#[derive(Debug, Clone, PartialEq)]
pub struct OccupancyVerdict {
    pub region: usize,
    pub occupied: bool,
    /// Dominant color of an occupied region; `None` when free or nothing was sampled.
    pub color: Option<Color>,
    /// Palette name of `color`, when color naming is enabled.
    pub color_name: Option<&'static str>,
}

/// The verdict a region would get under one candidate threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepPoint {
    pub threshold: f64,
    pub occupied: bool,
}

/// Everything computed for one region, for tuning and debugging.
#[derive(Debug, Clone)]
pub struct RegionDiagnostics {
    pub region: usize,
    pub area: u32,
    pub occupied: bool,
    /// `None` when no background is configured.
    pub signals: Option<RegionSignals>,
    /// `None` when no background is configured.
    pub decision: Option<Decision>,
    /// Intensity profile of the current crop.
    pub profile: IntensityProfile,
    pub sweep: Vec<SweepPoint>,
}

/// Read-only per-frame state shared by all region classifications.
#[derive(Debug)]
pub struct FrameContext {
    frame: RgbImage,
    intensity: GrayImage,
    background: Option<GrayImage>,
    foreground: Option<GrayImage>,
    thresholds: Arc<ThresholdTable>,
}

impl FrameContext {
    /// The table this frame is classified against, fixed when it was prepared.
    pub fn thresholds(&self) -> &ThresholdTable {
        &self.thresholds
    }
}

struct Evaluation {
    occupied: bool,
    signals: Option<RegionSignals>,
    decision: Option<Decision>,
    profile: IntensityProfile,
}

/// The main, top-level struct for the occupancy engine.
pub struct OccupancyPipeline {
    config: PipelineConfig,
    regions: Vec<Region>,
    background: Option<Mutex<BackgroundReference>>,
    thresholds: RwLock<Arc<ThresholdTable>>,
    classifier: OccupancyClassifier,
    calibrator: ThresholdCalibrator,
    extractor: DominantColorExtractor,
}

impl OccupancyPipeline {
    /// Builds the regions (index = position in `geometries`) and checks them
    /// against the background size, if there is a background.
    pub fn new(
        config: PipelineConfig,
        geometries: Vec<Geometry>,
        background: Option<BackgroundReference>,
    ) -> OccupancyResult<Self> {
        if config.worker_count == 0 {
            return Err(OccupancyError::InvalidConfig(
                "worker_count must be at least 1".to_string(),
            ));
        }
        let classifier = OccupancyClassifier::new(config.mode, config.classifier.clone())?;
        let calibrator = ThresholdCalibrator::new(config.calibration.clone())?;
        let extractor = DominantColorExtractor::new(config.color.clone())?;

        let regions = geometries
            .into_iter()
            .enumerate()
            .map(|(index, geometry)| Region::build(index, geometry))
            .collect::<OccupancyResult<Vec<_>>>()?;

        if let Some(reference) = &background {
            let (width, height) = reference.dimensions();
            for region in &regions {
                region.check_bounds(width, height)?;
            }
        }

        let variant = match &background {
            Some(BackgroundReference::Static(_)) => "static",
            Some(BackgroundReference::Adaptive(_)) => "adaptive",
            None => "none",
        };
        info!(
            regions = regions.len(),
            mode = ?config.mode,
            background = variant,
            "occupancy pipeline ready"
        );

        Ok(Self {
            config,
            regions,
            background: background.map(Mutex::new),
            thresholds: RwLock::new(Arc::new(ThresholdTable::empty())),
            classifier,
            calibrator,
            extractor,
        })
    }

    pub fn with_static_background(
        config: PipelineConfig,
        geometries: Vec<Geometry>,
        reference: RgbImage,
    ) -> OccupancyResult<Self> {
        let background = StaticBackground::with_noise_filter(reference, config.classifier.noise);
        Self::new(config, geometries, Some(BackgroundReference::Static(background)))
    }

    pub fn with_adaptive_background(
        config: PipelineConfig,
        geometries: Vec<Geometry>,
        width: u32,
        height: u32,
        adaptive: AdaptiveBackgroundConfig,
    ) -> OccupancyResult<Self> {
        let model = AdaptiveBackground::new(width, height, adaptive)?;
        Self::new(config, geometries, Some(BackgroundReference::Adaptive(model)))
    }

    pub fn without_background(config: PipelineConfig, geometries: Vec<Geometry>) -> OccupancyResult<Self> {
        Self::new(config, geometries, None)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Primes an adaptive background with a known-empty frame. A static
    /// background needs no warm-up.
    pub fn warm_up(&self, empty_frame: &RgbImage, repetitions: u32) -> OccupancyResult<()> {
        if let Some(background) = &self.background {
            if let BackgroundReference::Adaptive(model) = &mut *background.lock() {
                model.warm_up(empty_frame, repetitions)?;
                debug!(frames = model.frames_observed(), "adaptive background primed");
            }
        }
        Ok(())
    }

    /// Snapshot of the current threshold table.
    pub fn thresholds(&self) -> Arc<ThresholdTable> {
        self.thresholds.read().clone()
    }

    pub fn is_calibrated(&self) -> bool {
        !self.thresholds.read().is_empty()
    }

    /// Learns per-region thresholds from `samples` and swaps them in.
    pub fn calibrate(&self, samples: &[RgbImage]) -> OccupancyResult<Arc<ThresholdTable>> {
        let snapshot = {
            let background = self.background.as_ref().ok_or(OccupancyError::MissingBackground)?;
            let background = background.lock();
            if let BackgroundReference::Adaptive(model) = &*background {
                model.ensure_warmed_up()?;
            }
            background.snapshot(self.config.classifier.noise)
        };

        let table = Arc::new(self.calibrator.calibrate(&snapshot, samples, &self.regions)?);
        *self.thresholds.write() = Arc::clone(&table);
        info!(regions = table.len(), samples = samples.len(), "threshold table replaced");
        Ok(table)
    }

    /// Runs the sequential stage for `frame`. An adaptive background observes
    /// the frame here, so frames must be prepared in stream order.
    pub fn prepare(&self, frame: &RgbImage) -> OccupancyResult<FrameContext> {
        self.prepare_owned(frame.clone())
    }

    /// `prepare` for a frame the caller no longer needs.
    pub fn prepare_owned(&self, frame: RgbImage) -> OccupancyResult<FrameContext> {
        let intensity = intensity_image(&frame);
        let (background, foreground) = match &self.background {
            None => (None, None),
            Some(background) => match &mut *background.lock() {
                BackgroundReference::Static(reference) => {
                    reference.check_frame(frame.width(), frame.height())?;
                    (Some(reference.intensity().clone()), None)
                }
                BackgroundReference::Adaptive(model) => {
                    let foreground = model.observe(&frame)?;
                    model.ensure_warmed_up()?;
                    let background = intensity_image(&model.background_image());
                    (Some(background), Some(foreground))
                }
            },
        };

        Ok(FrameContext {
            frame,
            intensity,
            background,
            foreground,
            thresholds: self.thresholds(),
        })
    }

    /// Classifies every region in `frame`, in region order.
    pub fn detect(&self, frame: &RgbImage) -> OccupancyResult<Vec<OccupancyVerdict>> {
        let context = self.prepare(frame)?;
        (0..self.regions.len())
            .map(|index| self.classify_region(&context, index))
            .collect()
    }

    /// Classifies a single region against a prepared frame.
    pub fn classify_region(&self, context: &FrameContext, index: usize) -> OccupancyResult<OccupancyVerdict> {
        let region = self.region(index)?;
        let evaluation = self.evaluate(context, region)?;

        let color = if evaluation.occupied {
            let (sub_frame, mask) = region.extract(&context.frame)?;
            self.extractor.dominant_color(&sub_frame, Some(&mask))
        } else {
            None
        };
        let color_name = if self.config.color.name_colors {
            color.map(|c| nearest_named_color(c).name)
        } else {
            None
        };

        Ok(OccupancyVerdict {
            region: index,
            occupied: evaluation.occupied,
            color,
            color_name,
        })
    }

    /// Every signal, the decision, and the verdict under each candidate
    /// threshold, for every region. Observes the frame like `detect` does.
    pub fn diagnose(&self, frame: &RgbImage, sweep: &[f64]) -> OccupancyResult<Vec<RegionDiagnostics>> {
        let context = self.prepare(frame)?;
        self.regions
            .iter()
            .map(|region| {
                let evaluation = self.evaluate(&context, region)?;
                let sweep = match &evaluation.signals {
                    Some(signals) => sweep
                        .iter()
                        .map(|threshold| SweepPoint {
                            threshold: *threshold,
                            occupied: signals.changed_pixels as f64 >= *threshold,
                        })
                        .collect(),
                    None => Vec::new(),
                };
                Ok(RegionDiagnostics {
                    region: region.index,
                    area: region.area(),
                    occupied: evaluation.occupied,
                    signals: evaluation.signals,
                    decision: evaluation.decision,
                    profile: evaluation.profile,
                    sweep,
                })
            })
            .collect()
    }

    fn region(&self, index: usize) -> OccupancyResult<&Region> {
        self.regions.get(index).ok_or_else(|| {
            OccupancyError::InvalidConfig(format!(
                "region {index} does not exist, the pipeline has {}",
                self.regions.len()
            ))
        })
    }

    fn evaluate(&self, context: &FrameContext, region: &Region) -> OccupancyResult<Evaluation> {
        let (current, mask) = region.extract(&context.intensity)?;

        let Some(background) = &context.background else {
            let profile = IntensityProfile::measure(&current, &mask);
            let occupied = self.classifier.classify_without_background(&profile);
            debug!(
                region = region.index,
                mean = profile.mean,
                variance = profile.variance,
                occupied,
                "region classified without background"
            );
            return Ok(Evaluation {
                occupied,
                signals: None,
                decision: None,
                profile,
            });
        };

        let noise = self.config.classifier.noise;
        let (background, _) = region.extract(background)?;
        let signals = match &context.foreground {
            Some(foreground) => {
                let (foreground, _) = region.extract(foreground)?;
                RegionSignals::measure_with_foreground(
                    &current,
                    &background,
                    &foreground,
                    &mask,
                    noise.smoothing_radius,
                )
            }
            None => RegionSignals::measure(
                &current,
                &background,
                &mask,
                noise.pixel_delta,
                noise.smoothing_radius,
            ),
        };
        let decision = self.classifier.classify(region, &signals, &context.thresholds);

        debug!(
            region = region.index,
            changed = signals.changed_pixels,
            texture = signals.texture_delta,
            gradient = signals.gradient_mean,
            correlation = signals.histogram_correlation,
            threshold = decision.threshold,
            source = ?decision.source,
            occupied = decision.occupied,
            "region classified"
        );

        Ok(Evaluation {
            occupied: decision.occupied,
            profile: signals.current,
            signals: Some(signals),
            decision: Some(decision),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_modules::background::NoiseFilter;
    use crate::core_modules::classifier::{FallbackThreshold, ThresholdSource};
    use image::Rgb;

    fn filled(width: u32, height: u32, rect: (u32, u32, u32, u32), value: u8) -> RgbImage {
        let mut frame = RgbImage::new(width, height);
        for y in rect.1..rect.1 + rect.3 {
            for x in rect.0..rect.0 + rect.2 {
                frame.put_pixel(x, y, Rgb([value, value, value]));
            }
        }
        frame
    }

    fn single_criterion() -> PipelineConfig {
        PipelineConfig {
            mode: ClassifierMode::SingleCriterion,
            worker_count: 2,
            ..PipelineConfig::default()
        }
    }

    #[test]
    fn regions_are_checked_against_the_background() {
        let err = OccupancyPipeline::with_static_background(
            single_criterion(),
            vec![Geometry::rectangle(50, 50, 100, 100)],
            RgbImage::new(100, 100),
        )
        .err()
        .unwrap();
        assert!(matches!(err, OccupancyError::RegionOutOfBounds { region: 0, .. }));
    }

    #[test]
    fn verdicts_follow_region_order() {
        let pipeline = OccupancyPipeline::with_static_background(
            single_criterion(),
            vec![
                Geometry::rectangle(0, 0, 100, 100),
                Geometry::rectangle(100, 0, 100, 100),
            ],
            RgbImage::new(200, 100),
        )
        .unwrap();
        let frame = filled(200, 100, (100, 0, 100, 100), 255);

        let verdicts = pipeline.detect(&frame).unwrap();
        assert_eq!(verdicts.len(), 2);
        assert_eq!((verdicts[0].region, verdicts[0].occupied), (0, false));
        assert_eq!((verdicts[1].region, verdicts[1].occupied), (1, true));
        assert_eq!(verdicts[1].color, Some(Color::new(255, 255, 255)));
    }

    #[test]
    fn color_names_are_attached_when_enabled() {
        let mut config = single_criterion();
        config.color.name_colors = true;
        let pipeline = OccupancyPipeline::with_static_background(
            config,
            vec![Geometry::rectangle(0, 0, 100, 100)],
            RgbImage::new(100, 100),
        )
        .unwrap();
        let verdict = &pipeline.detect(&filled(100, 100, (0, 0, 100, 100), 255)).unwrap()[0];
        assert_eq!(verdict.color_name, Some("white"));
    }

    #[test]
    fn calibration_requires_a_background() {
        let pipeline =
            OccupancyPipeline::without_background(single_criterion(), vec![Geometry::rectangle(0, 0, 10, 10)])
                .unwrap();
        let err = pipeline.calibrate(&[RgbImage::new(10, 10)]).unwrap_err();
        assert_eq!(err, OccupancyError::MissingBackground);
    }

    #[test]
    fn calibration_swaps_the_table() {
        let pipeline = OccupancyPipeline::with_static_background(
            single_criterion(),
            vec![Geometry::rectangle(0, 0, 100, 100)],
            RgbImage::new(100, 100),
        )
        .unwrap();
        assert!(!pipeline.is_calibrated());
        let before = pipeline.thresholds();

        pipeline.calibrate(&[RgbImage::new(100, 100)]).unwrap();
        assert!(pipeline.is_calibrated());
        assert!(before.is_empty());
        assert_eq!(pipeline.thresholds().get(0), Some(1000.0));
    }

    #[test]
    fn prepared_frame_keeps_the_table_it_started_with() {
        let pipeline = OccupancyPipeline::with_static_background(
            single_criterion(),
            vec![Geometry::rectangle(0, 0, 100, 100)],
            RgbImage::new(100, 100),
        )
        .unwrap();
        // 3000 changed pixels: under the 5000 fallback, over the calibrated 1000.
        let frame = RgbImage::from_fn(100, 100, |_, y| if y < 30 { Rgb([250, 250, 250]) } else { Rgb([0, 0, 0]) });
        let before = pipeline.prepare(&frame).unwrap();

        pipeline.calibrate(&[RgbImage::new(100, 100)]).unwrap();
        let after = pipeline.prepare(&frame).unwrap();

        assert!(before.thresholds().is_empty());
        assert_eq!(after.thresholds().get(0), Some(1000.0));
        assert!(!pipeline.classify_region(&before, 0).unwrap().occupied);
        assert!(pipeline.classify_region(&after, 0).unwrap().occupied);
    }

    #[test]
    fn no_background_uses_the_heuristic() {
        let pipeline =
            OccupancyPipeline::without_background(single_criterion(), vec![Geometry::rectangle(0, 0, 40, 40)])
                .unwrap();
        let checkerboard = RgbImage::from_fn(40, 40, |x, y| {
            if (x + y) % 2 == 0 { Rgb([0, 0, 0]) } else { Rgb([250, 250, 250]) }
        });
        let pavement = RgbImage::from_pixel(40, 40, Rgb([90, 90, 90]));

        assert!(pipeline.detect(&checkerboard).unwrap()[0].occupied);
        assert!(!pipeline.detect(&pavement).unwrap()[0].occupied);
    }

    #[test]
    fn adaptive_background_refuses_decisions_until_warm() {
        let pipeline = OccupancyPipeline::with_adaptive_background(
            PipelineConfig::default(),
            vec![Geometry::rectangle(0, 0, 20, 20)],
            40,
            40,
            AdaptiveBackgroundConfig::default(),
        )
        .unwrap();
        let empty = RgbImage::from_pixel(40, 40, Rgb([80, 80, 80]));

        let err = pipeline.detect(&empty).unwrap_err();
        assert!(matches!(err, OccupancyError::BackgroundWarmingUp { .. }));

        pipeline.warm_up(&empty, 30).unwrap();
        assert!(!pipeline.detect(&empty).unwrap()[0].occupied);
    }

    #[test]
    fn diagnose_reports_signals_and_sweep() {
        let mut config = single_criterion();
        config.classifier.noise = NoiseFilter {
            pixel_delta: 0,
            smoothing_radius: 0,
        };
        config.classifier.fallback_threshold = FallbackThreshold::Fixed(500.0);
        let pipeline = OccupancyPipeline::with_static_background(
            config,
            vec![Geometry::rectangle(0, 0, 100, 100)],
            RgbImage::new(100, 100),
        )
        .unwrap();
        // 300 changed pixels.
        let frame = filled(100, 100, (0, 0, 100, 3), 200);

        let report = pipeline.diagnose(&frame, &DEFAULT_THRESHOLD_SWEEP).unwrap();
        let region = &report[0];
        assert_eq!(region.signals.as_ref().unwrap().changed_pixels, 300);
        assert_eq!(region.decision.unwrap().source, ThresholdSource::Fallback);
        assert!(!region.occupied);
        let verdicts: Vec<bool> = region.sweep.iter().map(|p| p.occupied).collect();
        assert_eq!(verdicts, vec![true, true, true, false, false, false]);
    }

    #[test]
    fn zero_workers_is_rejected() {
        let config = PipelineConfig {
            worker_count: 0,
            ..PipelineConfig::default()
        };
        assert!(OccupancyPipeline::without_background(config, vec![]).is_err());
    }
}
