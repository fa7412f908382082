use image::{Rgb, RgbImage};
use vacancy_vision::{
    ClassifierMode, Color, FallbackThreshold, Geometry, NoiseFilter, OccupancyError, OccupancyPipeline,
    PipelineConfig, Region,
};

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

fn config(mode: ClassifierMode) -> PipelineConfig {
    PipelineConfig {
        mode,
        worker_count: 2,
        ..PipelineConfig::default()
    }
}

fn black() -> RgbImage {
    RgbImage::new(WIDTH, HEIGHT)
}

fn textured() -> RgbImage {
    RgbImage::from_fn(WIDTH, HEIGHT, |x, y| {
        Rgb([(x * 7 % 256) as u8, (y * 3 % 256) as u8, ((x ^ y) % 256) as u8])
    })
}

/// A black frame with `changed` pixels of the first region rows turned grey.
fn sample_with_changes(changed: u32) -> RgbImage {
    let mut frame = black();
    for i in 0..changed {
        frame.put_pixel(i % 100, i / 100, Rgb([40, 40, 40]));
    }
    frame
}

fn fill(frame: &mut RgbImage, x0: u32, y0: u32, width: u32, height: u32, value: u8) {
    for y in y0..y0 + height {
        for x in x0..x0 + width {
            frame.put_pixel(x, y, Rgb([value, value, value]));
        }
    }
}

#[test]
fn scenario_a_identical_frame_is_free() {
    let pipeline = OccupancyPipeline::with_static_background(
        config(ClassifierMode::SingleCriterion),
        vec![Geometry::rectangle(0, 0, 100, 100)],
        black(),
    )
    .unwrap();

    let verdicts = pipeline.detect(&black()).unwrap();
    assert_eq!(verdicts.len(), 1);
    assert!(!verdicts[0].occupied);
    assert_eq!(verdicts[0].color, None);
}

#[test]
fn scenario_b_filled_region_is_occupied_and_white() {
    for mode in [ClassifierMode::SingleCriterion, ClassifierMode::MultiCriterion] {
        let pipeline = OccupancyPipeline::with_static_background(
            config(mode),
            vec![Geometry::rectangle(0, 0, 100, 100)],
            black(),
        )
        .unwrap();
        let mut frame = black();
        fill(&mut frame, 0, 0, 100, 100, 255);

        let verdict = &pipeline.detect(&frame).unwrap()[0];
        assert!(verdict.occupied, "{mode:?}");
        let color = verdict.color.unwrap();
        assert!(color.distance_squared(&Color::new(255, 255, 255)) <= 3, "{color:?}");
    }
}

#[test]
fn scenario_c_recalibration_tracks_the_noise_floor() {
    let mut config = config(ClassifierMode::SingleCriterion);
    config.classifier.noise = NoiseFilter {
        pixel_delta: 0,
        smoothing_radius: 0,
    };
    let pipeline =
        OccupancyPipeline::with_static_background(config, vec![Geometry::rectangle(0, 0, 100, 100)], black())
            .unwrap();

    let quiet: Vec<RgbImage> = (45..55).map(sample_with_changes).collect();
    let first = pipeline.calibrate(&quiet).unwrap().get(0).unwrap();
    assert!((first - (53.1 + 1000.0)).abs() < 1e-6, "{first}");

    let busy: Vec<RgbImage> = (495..505).map(sample_with_changes).collect();
    let second = pipeline.calibrate(&busy).unwrap().get(0).unwrap();
    assert!((second - (503.1 + 1000.0)).abs() < 1e-6, "{second}");
    assert!(second > first);
}

#[test]
fn identical_frames_are_free_in_both_modes() {
    let regions = vec![
        Geometry::rectangle(10, 10, 120, 80),
        Geometry::polygon([(200.0, 50.0), (320.0, 60.0), (300.0, 200.0), (190.0, 170.0)]),
    ];
    for mode in [ClassifierMode::SingleCriterion, ClassifierMode::MultiCriterion] {
        let pipeline =
            OccupancyPipeline::with_static_background(config(mode), regions.clone(), textured()).unwrap();
        for verdict in pipeline.detect(&textured()).unwrap() {
            assert!(!verdict.occupied, "{mode:?} region {}", verdict.region);
            assert_eq!(verdict.color, None);
        }
    }
}

#[test]
fn maximal_difference_reaching_the_threshold_is_occupied() {
    let mut config = config(ClassifierMode::SingleCriterion);
    config.classifier.fallback_threshold = FallbackThreshold::Fixed(2_400.0);
    let pipeline = OccupancyPipeline::with_static_background(
        config,
        vec![
            Geometry::rectangle(0, 0, 60, 40),
            Geometry::rectangle(300, 300, 40, 40),
        ],
        black(),
    )
    .unwrap();
    let mut frame = black();
    fill(&mut frame, 0, 0, 60, 40, 255);
    fill(&mut frame, 300, 300, 40, 40, 255);

    let verdicts = pipeline.detect(&frame).unwrap();
    // 60 * 40 = 2400 reaches the threshold, 40 * 40 = 1600 does not.
    assert!(verdicts[0].occupied);
    assert!(!verdicts[1].occupied);
}

#[test]
fn polygon_filled_to_its_area_is_occupied() {
    let triangle = Geometry::polygon([(100.0, 100.0), (220.0, 100.0), (100.0, 160.0)]);
    let region = Region::build(0, triangle.clone()).unwrap();
    let mut config = config(ClassifierMode::SingleCriterion);
    config.classifier.fallback_threshold = FallbackThreshold::Fixed(region.area() as f64);
    let pipeline = OccupancyPipeline::with_static_background(config, vec![triangle], black()).unwrap();

    // Change exactly the pixels inside the mask, with the default smoothing on.
    let (mask, bbox) = region.mask_and_bbox();
    let mut frame = black();
    for (x, y, m) in mask.enumerate_pixels() {
        if m.0[0] > 0 {
            frame.put_pixel(bbox.x as u32 + x, bbox.y as u32 + y, Rgb([255, 255, 255]));
        }
    }

    assert!(pipeline.detect(&frame).unwrap()[0].occupied);
    let report = &pipeline.diagnose(&frame, &[]).unwrap()[0];
    assert_eq!(report.signals.as_ref().unwrap().changed_pixels, region.area());
}

#[test]
fn polygon_region_reports_the_occupant_color() {
    let mut config = config(ClassifierMode::SingleCriterion);
    config.classifier.fallback_threshold = FallbackThreshold::Fixed(500.0);
    let pipeline = OccupancyPipeline::with_static_background(
        config,
        vec![Geometry::polygon([(100.0, 100.0), (200.0, 100.0), (200.0, 180.0), (100.0, 180.0)])],
        black(),
    )
    .unwrap();
    let mut frame = black();
    for y in 95..187 {
        for x in 95..207 {
            frame.put_pixel(x, y, Rgb([200, 30, 30]));
        }
    }

    let verdict = &pipeline.detect(&frame).unwrap()[0];
    assert!(verdict.occupied);
    assert_eq!(verdict.color, Some(Color::new(200, 30, 30)));
}

#[test]
fn mismatched_frame_size_fails_loudly() {
    let pipeline = OccupancyPipeline::with_static_background(
        config(ClassifierMode::MultiCriterion),
        vec![Geometry::rectangle(0, 0, 100, 100)],
        black(),
    )
    .unwrap();
    let err = pipeline.detect(&RgbImage::new(320, 240)).unwrap_err();
    assert_eq!(
        err,
        OccupancyError::FrameSizeMismatch {
            expected: (WIDTH, HEIGHT),
            actual: (320, 240)
        }
    );
}

#[test]
fn region_outside_the_frame_fails_loudly() {
    let pipeline = OccupancyPipeline::without_background(
        config(ClassifierMode::SingleCriterion),
        vec![Geometry::rectangle(0, 0, 100, 100)],
    )
    .unwrap();
    let err = pipeline.detect(&RgbImage::new(50, 50)).unwrap_err();
    assert!(matches!(err, OccupancyError::RegionOutOfBounds { region: 0, .. }));
}

#[test]
fn degenerate_geometry_is_rejected_at_construction() {
    let collinear = Geometry::polygon([(0.0, 0.0), (10.0, 10.0), (20.0, 20.0)]);
    let err = OccupancyPipeline::without_background(config(ClassifierMode::MultiCriterion), vec![collinear])
        .err()
        .unwrap();
    assert!(matches!(err, OccupancyError::InvalidGeometry(_)));

    let flat = Geometry::rectangle(0, 0, 10, 0);
    assert!(OccupancyPipeline::without_background(config(ClassifierMode::MultiCriterion), vec![flat]).is_err());
}
