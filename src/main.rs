// Example runner for the `vacancy_vision` library: classifies still frames
// loaded from disk against a set of regions given on the command line.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use image::RgbImage;
use std::path::{Path, PathBuf};
use vacancy_vision::logging::init_logging;
use vacancy_vision::{
    AdaptiveBackgroundConfig, ClassifierMode, Geometry, OccupancyPipeline, ParallelPipeline, PipelineConfig,
    DEFAULT_THRESHOLD_SWEEP,
};

const WARMUP_REPETITIONS: u32 = 30;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    Single,
    Multi,
}

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Image of the empty scene.
    #[arg(long)]
    background: Option<PathBuf>,
    /// Use an adaptive background model, primed with `--background` when given.
    #[arg(long)]
    adaptive: bool,
    /// Rectangle region as `x,y,width,height`. Repeatable.
    #[arg(long = "rect")]
    rects: Vec<String>,
    /// Polygon region as `x,y;x,y;x,y...`. Repeatable.
    #[arg(long = "polygon")]
    polygons: Vec<String>,
    #[arg(long, value_enum, default_value_t = Mode::Multi)]
    mode: Mode,
    /// Sample frames to calibrate per-region thresholds from.
    #[arg(long, num_args = 1..)]
    calibrate: Vec<PathBuf>,
    /// Print every signal and a threshold sweep instead of plain verdicts.
    #[arg(long)]
    diagnose: bool,
    /// Name the dominant color of occupied regions.
    #[arg(long)]
    name_colors: bool,
    /// Region workers; defaults to the number of CPUs.
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long, default_value = "info")]
    log_level: String,
    /// Frames to classify, in stream order.
    frames: Vec<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let mut geometries = args
        .rects
        .iter()
        .map(|s| parse_rect(s))
        .collect::<Result<Vec<_>>>()?;
    for polygon in &args.polygons {
        geometries.push(parse_polygon(polygon)?);
    }
    if geometries.is_empty() {
        bail!("at least one --rect or --polygon region is required");
    }

    let mut config = PipelineConfig {
        mode: match args.mode {
            Mode::Single => ClassifierMode::SingleCriterion,
            Mode::Multi => ClassifierMode::MultiCriterion,
        },
        ..PipelineConfig::default()
    };
    config.color.name_colors = args.name_colors;
    if let Some(workers) = args.workers {
        config.worker_count = workers;
    }

    let background = args.background.as_deref().map(load_frame).transpose()?;
    let pipeline = match (&background, args.adaptive) {
        (_, true) => {
            let (width, height) = match &background {
                Some(frame) => frame.dimensions(),
                None => {
                    let first = args.frames.first().ok_or_else(|| anyhow!("no frames to size the model"))?;
                    load_frame(first)?.dimensions()
                }
            };
            let pipeline = OccupancyPipeline::with_adaptive_background(
                config,
                geometries,
                width,
                height,
                AdaptiveBackgroundConfig::default(),
            )?;
            if let Some(empty) = &background {
                pipeline.warm_up(empty, WARMUP_REPETITIONS)?;
            }
            pipeline
        }
        (Some(frame), false) => OccupancyPipeline::with_static_background(config, geometries, frame.clone())?,
        (None, false) => OccupancyPipeline::without_background(config, geometries)?,
    };

    if !args.calibrate.is_empty() {
        let samples = args
            .calibrate
            .iter()
            .map(|path| load_frame(path))
            .collect::<Result<Vec<_>>>()?;
        let table = pipeline.calibrate(&samples)?;
        for (region, threshold) in table.iter() {
            println!("region {region}: calibrated threshold {threshold:.1}");
        }
    }

    if args.diagnose {
        for path in &args.frames {
            let frame = load_frame(path)?;
            println!("{}", path.display());
            for report in pipeline.diagnose(&frame, &DEFAULT_THRESHOLD_SWEEP)? {
                println!("  {report:#?}");
            }
        }
        return Ok(());
    }

    let parallel = ParallelPipeline::new(pipeline);
    for path in &args.frames {
        let frame = load_frame(path)?;
        let verdicts = parallel.process_frame(&frame).await?;
        println!("{}", path.display());
        for verdict in verdicts {
            let color = match (verdict.color.map(|c| c.channels()), verdict.color_name) {
                (Some([r, g, b]), Some(name)) => format!(" ({r}, {g}, {b}) {name}"),
                (Some([r, g, b]), None) => format!(" ({r}, {g}, {b})"),
                _ => String::new(),
            };
            let state = if verdict.occupied { "occupied" } else { "free" };
            println!("  region {}: {state}{color}", verdict.region);
        }
    }
    parallel.shutdown().await;
    Ok(())
}

fn load_frame(path: &Path) -> Result<RgbImage> {
    Ok(image::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .to_rgb8())
}

fn parse_rect(arg: &str) -> Result<Geometry> {
    let values = arg
        .split(',')
        .map(|v| v.trim().parse::<i32>())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("bad rectangle {arg:?}"))?;
    match values[..] {
        [x, y, width, height] => Ok(Geometry::rectangle(x, y, width, height)),
        _ => bail!("rectangle {arg:?} needs four values x,y,width,height"),
    }
}

fn parse_polygon(arg: &str) -> Result<Geometry> {
    let points = arg
        .split(';')
        .map(|point| -> Result<(f64, f64)> {
            let (x, y) = point
                .split_once(',')
                .ok_or_else(|| anyhow!("bad polygon point {point:?}"))?;
            Ok((x.trim().parse::<f64>()?, y.trim().parse::<f64>()?))
        })
        .collect::<Result<Vec<_>>>()
        .with_context(|| format!("bad polygon {arg:?}"))?;
    Ok(Geometry::polygon(points))
}
