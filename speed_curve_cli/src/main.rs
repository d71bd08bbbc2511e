use std::fs::{self, File};
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{ArgAction, Parser, ValueHint};
use serde::Serialize;
use serde_json::Value as JsonValue;
use speed_curve::{
    analyze, compose, AggregateSeries, Analysis, ChartStyle, IngestStats, Params, Rgb,
    TrendCurve,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod plot;

use plot::{render_figure, ChartKind};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Plot mean speed against vehicle count for traffic simulation logs",
    long_about = None
)]
struct Cli {
    /// Simulation log (`numCar;density;speed...` per line, speeds in m/s)
    #[arg(value_parser = existing_file, value_hint = ValueHint::FilePath)]
    input: PathBuf,

    /// Output PNG figure path (defaults next to the input)
    #[arg(long, value_hint = ValueHint::FilePath)]
    png: Option<PathBuf>,

    /// Output SVG figure path
    #[arg(long, value_hint = ValueHint::FilePath)]
    svg: Option<PathBuf>,

    /// Disable plot generation
    #[arg(long, action = ArgAction::SetTrue)]
    no_plot: bool,

    /// Per-vehicle-count summary CSV (`-` for stdout)
    #[arg(long, value_hint = ValueHint::FilePath)]
    csv: Option<PathBuf>,

    /// JSON summary with ingest counters, series and trend coefficients
    #[arg(long, value_hint = ValueHint::FilePath)]
    summary_json: Option<PathBuf>,

    /// Chart style JSON; keys left out keep their defaults
    #[arg(long, value_hint = ValueHint::FilePath)]
    style: Option<PathBuf>,

    /// Polynomial degree of the trend curve
    #[arg(long)]
    degree: Option<usize>,

    /// Label every Nth vehicle-count tick
    #[arg(long)]
    label_step: Option<usize>,

    /// Raw-sample bar color (name or #rrggbb)
    #[arg(long)]
    bar_color: Option<Rgb>,

    /// Raw-sample bar width in vehicles
    #[arg(long)]
    bar_width: Option<f64>,

    /// Half height of each raw-sample bar in km/h
    #[arg(long)]
    bar_offset: Option<f64>,

    /// Raw-sample bar opacity (0..1)
    #[arg(long)]
    bar_alpha: Option<f64>,

    /// Mean line color
    #[arg(long)]
    mean_color: Option<Rgb>,

    /// Trend line color
    #[arg(long)]
    trend_color: Option<Rgb>,

    /// Standard deviation line color
    #[arg(long)]
    std_color: Option<Rgb>,

    /// Hide raw-sample bars
    #[arg(long, action = ArgAction::SetTrue)]
    no_bars: bool,

    /// Hide the mean line
    #[arg(long, action = ArgAction::SetTrue)]
    no_mean: bool,

    /// Hide the trend curve and skip fitting it
    #[arg(long, action = ArgAction::SetTrue)]
    no_trend: bool,

    /// Hide the ±1 standard deviation lines
    #[arg(long, action = ArgAction::SetTrue)]
    no_dispersion: bool,

    /// Figure width in pixels
    #[arg(long)]
    width: Option<u32>,

    /// Figure height in pixels
    #[arg(long)]
    height: Option<u32>,

    /// Verbose logging
    #[arg(long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Profile major stages with timings
    #[arg(long, action = ArgAction::SetTrue)]
    profile: bool,
}

fn existing_file(value: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(value);
    if path.is_file() {
        Ok(path)
    } else {
        Err(format!("file '{}' does not exist", value))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();

    handle_plot(cli)
}

fn handle_plot(cli: Cli) -> Result<()> {
    let style = build_style(&cli)?;
    let params = Params {
        fit_trend: style.trend.enabled,
        trend_degree: style.trend_degree,
        ..Params::default()
    };

    let t_parse = Instant::now();
    let file = File::open(&cli.input)
        .with_context(|| format!("failed to open {}", cli.input.display()))?;
    let analysis = analyze(BufReader::new(file), &params)
        .with_context(|| format!("failed to analyze {}", cli.input.display()))?;
    if cli.profile || cli.verbose {
        info!(
            "Analysis stage: {:.1} ms",
            t_parse.elapsed().as_secs_f64() * 1000.0
        );
    }

    for rejection in &analysis.rejections {
        warn!("{}", rejection);
    }
    log_summary(&analysis);

    if let Some(path) = cli.csv.as_ref() {
        if path.as_os_str() == "-" {
            write_series_stdout(&analysis.series, analysis.trend.as_ref())?;
        } else {
            write_series_csv(&analysis.series, analysis.trend.as_ref(), path)?;
            info!("Wrote summary CSV: {}", path.display());
        }
    }

    if let Some(path) = cli.summary_json.as_ref() {
        write_summary_json(&analysis, &cli.input, path)?;
        info!("Wrote summary JSON: {}", path.display());
    }

    if cli.no_plot {
        return Ok(());
    }

    let t_plot = Instant::now();
    let figure = compose(&analysis.series, analysis.trend.as_ref(), &style)?;

    let png = cli.png.clone().or_else(|| {
        if cli.svg.is_some() {
            None
        } else {
            Some(cli.input.with_extension("png"))
        }
    });
    if let Some(path) = png.as_ref() {
        render_figure(&figure, path, ChartKind::Png)
            .with_context(|| format!("failed to render {}", path.display()))?;
        info!("Wrote plot: {}", path.display());
    }
    if let Some(path) = cli.svg.as_ref() {
        render_figure(&figure, path, ChartKind::Svg)
            .with_context(|| format!("failed to render {}", path.display()))?;
        info!("Wrote plot: {}", path.display());
    }
    if cli.profile || cli.verbose {
        info!(
            "Plot stage: {:.1} ms",
            t_plot.elapsed().as_secs_f64() * 1000.0
        );
    }

    Ok(())
}

fn log_summary(analysis: &Analysis) {
    let stats = &analysis.stats;
    info!(
        "Parsed {} lines: {} records, {} samples, {} rejected lines, {} rejected speed values",
        stats.lines, stats.records, stats.samples, stats.rejected_lines, stats.rejected_tokens
    );
    debug!(
        "Ignored {} blank and {} short lines",
        stats.blank, stats.skipped
    );
    let (min, max) = analysis.series.x_bounds();
    info!(
        "Aggregated {} vehicle counts ({} to {})",
        analysis.series.len(),
        min,
        max
    );
    if let Some(trend) = analysis.trend.as_ref() {
        info!(
            "Trend degree {} coefficients (lowest power first): {:?}",
            trend.degree, trend.coefficients
        );
    }
}

fn build_style(cli: &Cli) -> Result<ChartStyle> {
    let mut style = match cli.style.as_ref() {
        Some(path) => load_style(path)?,
        None => ChartStyle::default(),
    };

    if let Some(degree) = cli.degree {
        style.trend_degree = degree;
    }
    if let Some(step) = cli.label_step {
        style.label_step = step;
    }
    if let Some(color) = cli.bar_color {
        style.bars.color = color;
    }
    if let Some(width) = cli.bar_width {
        style.bars.width = width;
    }
    if let Some(offset) = cli.bar_offset {
        style.bars.vertical_offset = offset;
    }
    if let Some(alpha) = cli.bar_alpha {
        style.bars.alpha = alpha;
    }
    if let Some(color) = cli.mean_color {
        style.mean.color = color;
    }
    if let Some(color) = cli.trend_color {
        style.trend.color = color;
    }
    if let Some(color) = cli.std_color {
        style.dispersion.color = color;
    }
    if let Some(width) = cli.width {
        style.width = width;
    }
    if let Some(height) = cli.height {
        style.height = height;
    }
    style.bars.enabled &= !cli.no_bars;
    style.mean.enabled &= !cli.no_mean;
    style.trend.enabled &= !cli.no_trend;
    style.dispersion.enabled &= !cli.no_dispersion;

    style.validate()?;
    Ok(style)
}

fn load_style(path: &Path) -> Result<ChartStyle> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read style {}", path.display()))?;
    parse_style(&text).with_context(|| format!("invalid style file {}", path.display()))
}

/// Parse a style document; sections and keys left out keep their defaults.
fn parse_style(text: &str) -> Result<ChartStyle> {
    let doc: JsonValue = serde_json::from_str(text)?;
    if !doc.is_object() {
        return Err(anyhow!("style must be a JSON object"));
    }
    Ok(serde_json::from_value(doc)?)
}

fn write_series_stdout(series: &AggregateSeries, trend: Option<&TrendCurve>) -> Result<()> {
    let stdout = io::stdout();
    let handle = stdout.lock();
    let mut writer = csv::Writer::from_writer(handle);
    write_series_rows(series, trend, &mut writer)
}

fn write_series_csv(series: &AggregateSeries, trend: Option<&TrendCurve>, path: &Path) -> Result<()> {
    let file =
        File::create(path).with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = csv::Writer::from_writer(file);
    write_series_rows(series, trend, &mut writer)
}

fn write_series_rows<W: Write>(
    series: &AggregateSeries,
    trend: Option<&TrendCurve>,
    writer: &mut csv::Writer<W>,
) -> Result<()> {
    writer.write_record([
        "vehicle_count",
        "density",
        "samples",
        "mean_kmh",
        "std_dev_kmh",
        "lower_kmh",
        "upper_kmh",
        "trend_kmh",
    ])?;

    for point in series.points() {
        let trend_value = trend.map(|t| t.evaluate(point.vehicle_count as f64));
        writer.write_record([
            point.vehicle_count.to_string(),
            format!("{:.3}", point.density),
            point.sample_count.to_string(),
            format!("{:.3}", point.mean),
            format!("{:.3}", point.std_dev),
            format!("{:.3}", point.lower()),
            format!("{:.3}", point.upper()),
            trend_value
                .map(|v| format!("{:.3}", v))
                .unwrap_or_default(),
        ])?;
    }

    writer.flush()?;
    Ok(())
}

#[derive(Serialize)]
struct Summary<'a> {
    generated_at: DateTime<Utc>,
    input: String,
    stats: &'a IngestStats,
    series: &'a AggregateSeries,
    trend: Option<TrendSummary<'a>>,
}

#[derive(Serialize)]
struct TrendSummary<'a> {
    degree: usize,
    coefficients: &'a [f64],
}

fn write_summary_json(analysis: &Analysis, input: &Path, path: &Path) -> Result<()> {
    let summary = Summary {
        generated_at: Utc::now(),
        input: input.display().to_string(),
        stats: &analysis.stats,
        series: &analysis.series,
        trend: analysis.trend.as_ref().map(|t| TrendSummary {
            degree: t.degree,
            coefficients: &t.coefficients,
        }),
    };
    let text = serde_json::to_string_pretty(&summary)?;
    fs::write(path, text).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
