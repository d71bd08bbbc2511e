use std::fs;
use std::ops::Range;
use std::panic;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use plotters::coord::ranged1d::{DefaultFormatting, KeyPointHint, Ranged};
use plotters::prelude::*;
use plotters::element::{DashedPathElement, DynElement, IntoDynElement};
use plotters::series::DashedLineSeries;
use plotters::style::{FontDesc, FontFamily, FontStyle, FontTransform};
use speed_curve::{Figure, LineDash, Rgb};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChartKind {
    Png,
    Svg,
}

impl ChartKind {
    fn extension(self) -> &'static str {
        match self {
            ChartKind::Png => "png",
            ChartKind::Svg => "svg",
        }
    }
}

/// Render `figure` to `path`. The image is drawn into a hidden sibling file and
/// renamed into place, so `path` is either absent or complete.
pub fn render_figure(figure: &Figure, path: &Path, kind: ChartKind) -> Result<()> {
    let partial = partial_path(path, kind);
    match render_guard(figure, &partial, kind) {
        Ok(()) => fs::rename(&partial, path).or_else(|err| {
            let _ = fs::remove_file(&partial);
            Err(err).with_context(|| {
                format!(
                    "failed to move {} into {}",
                    partial.display(),
                    path.display()
                )
            })
        }),
        Err(err) => {
            let _ = fs::remove_file(&partial);
            Err(err)
        }
    }
}

pub fn partial_path(path: &Path, kind: ChartKind) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("speed_curve");
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or(kind.extension());
    path.with_file_name(format!(".{}.partial.{}", stem, ext))
}

fn render_guard(figure: &Figure, path: &Path, kind: ChartKind) -> Result<()> {
    let render = || -> Result<()> {
        let size = (figure.width, figure.height);
        match kind {
            ChartKind::Png => draw_figure(BitMapBackend::new(path, size).into_drawing_area(), figure),
            ChartKind::Svg => draw_figure(SVGBackend::new(path, size).into_drawing_area(), figure),
        }
    };

    panic::catch_unwind(panic::AssertUnwindSafe(render))
        .map_err(|_| anyhow!("plotting backend panicked"))?
        .with_context(|| format!("plotting error for {}", path.display()))
}

fn draw_figure<DB>(root: DrawingArea<DB, plotters::coord::Shift>, figure: &Figure) -> Result<()>
where
    DB: DrawingBackend,
    DB::ErrorType: 'static,
{
    root.fill(&WHITE)?;

    let (x_lo, x_hi) = figure.x_range;
    let (y_lo, y_hi) = figure.y_range;
    let tick_positions: Vec<f64> = figure.ticks.iter().map(|t| t.x).collect();

    let mut chart = ChartBuilder::on(&root)
        .caption(
            figure.title,
            FontDesc::new(FontFamily::SansSerif, 22.0, FontStyle::Normal),
        )
        .margin(20)
        .set_label_area_size(LabelAreaPosition::Left, 60)
        .set_label_area_size(LabelAreaPosition::Bottom, 90)
        .build_cartesian_2d(VehicleAxis::new(x_lo..x_hi, tick_positions), y_lo..y_hi)?;

    let tick_label = |x: &f64| {
        figure
            .ticks
            .iter()
            .find(|t| (t.x - *x).abs() < 1e-9)
            .map(|t| t.label.clone())
            .unwrap_or_default()
    };

    chart
        .configure_mesh()
        .light_line_style(&TRANSPARENT)
        .bold_line_style(&TRANSPARENT)
        .x_labels(figure.ticks.len().max(1))
        .x_label_formatter(&tick_label)
        .y_label_formatter(&|v| format!("{:.0}", v))
        .x_desc(figure.x_caption)
        .y_desc(figure.y_caption)
        .label_style(FontDesc::new(FontFamily::SansSerif, 14.0, FontStyle::Normal))
        .x_label_style(
            FontDesc::new(FontFamily::SansSerif, 12.0, FontStyle::Normal)
                .transform(FontTransform::Rotate90),
        )
        .draw()?;

    if !figure.bars.is_empty() {
        let bar_style = ShapeStyle {
            color: rgb(figure.bar_color).mix(figure.bar_alpha),
            filled: true,
            stroke_width: 0,
        };
        chart.draw_series(
            figure
                .bars
                .iter()
                .map(|b| Rectangle::new([(b.x0, b.y0), (b.x1, b.y1)], bar_style)),
        )?;
    }

    for line in &figure.lines {
        let style = ShapeStyle {
            color: rgb(line.style.color).to_rgba(),
            filled: false,
            stroke_width: stroke_width(line.style.width),
        };
        let points = line.points.iter().copied();
        let dash = line.style.dash;
        let anno = match dash_pattern(dash) {
            None => chart.draw_series(LineSeries::new(points, style))?,
            Some((size, spacing)) => {
                chart.draw_series(DashedLineSeries::new(points, size, spacing, style))?
            }
        };
        anno.label(line.label).legend(
            move |(x, y)| -> DynElement<'static, DB, (i32, i32)> {
                let swatch = vec![(x, y), (x + 30, y)];
                match dash_pattern(dash) {
                    None => PathElement::new(swatch, style).into_dyn(),
                    Some((size, spacing)) => {
                        DashedPathElement::new(swatch, size, spacing, style).into_dyn()
                    }
                }
            },
        );
    }

    if !figure.lines.is_empty() {
        chart
            .configure_series_labels()
            .background_style(&WHITE.mix(0.8))
            .border_style(&BLACK.mix(0.3))
            .label_font(FontDesc::new(FontFamily::SansSerif, 14.0, FontStyle::Normal))
            .position(SeriesLabelPosition::UpperRight)
            .draw()?;
    }

    root.present()?;
    Ok(())
}

/// Linear x axis whose key points are exactly the observed vehicle counts.
struct VehicleAxis {
    range: Range<f64>,
    ticks: Vec<f64>,
}

impl VehicleAxis {
    fn new(range: Range<f64>, ticks: Vec<f64>) -> Self {
        Self { range, ticks }
    }
}

impl Ranged for VehicleAxis {
    type FormatOption = DefaultFormatting;
    type ValueType = f64;

    fn map(&self, value: &f64, limit: (i32, i32)) -> i32 {
        let span = self.range.end - self.range.start;
        if span <= 0.0 {
            return limit.0;
        }
        let frac = (value - self.range.start) / span;
        limit.0 + (frac * (limit.1 - limit.0) as f64).round() as i32
    }

    fn key_points<Hint: KeyPointHint>(&self, _hint: Hint) -> Vec<f64> {
        self.ticks.clone()
    }

    fn range(&self) -> Range<f64> {
        self.range.clone()
    }
}

/// Dash length and gap in pixels; `None` for a solid stroke.
fn dash_pattern(dash: LineDash) -> Option<(u32, u32)> {
    match dash {
        LineDash::Solid => None,
        LineDash::Dashed => Some((10, 6)),
        LineDash::Dotted => Some((2, 4)),
    }
}

fn rgb(color: Rgb) -> RGBColor {
    RGBColor(color.0, color.1, color.2)
}

fn stroke_width(width: f64) -> u32 {
    width.round().max(1.0) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_is_a_hidden_sibling() {
        let partial = partial_path(Path::new("out/run_40.png"), ChartKind::Png);
        assert_eq!(partial, PathBuf::from("out/.run_40.partial.png"));

        let partial = partial_path(Path::new("figure"), ChartKind::Svg);
        assert_eq!(partial, PathBuf::from(".figure.partial.svg"));
    }

    #[test]
    fn vehicle_axis_maps_linearly() {
        let axis = VehicleAxis::new(9.5..20.5, vec![10.0, 15.0, 20.0]);
        assert_eq!(axis.map(&9.5, (0, 1100)), 0);
        assert_eq!(axis.map(&20.5, (0, 1100)), 1100);
        assert_eq!(axis.map(&15.0, (100, 1200)), 650);
        assert_eq!(axis.range(), 9.5..20.5);
    }

    #[test]
    fn legend_uses_the_series_dash() {
        assert_eq!(dash_pattern(LineDash::Solid), None);
        assert_eq!(dash_pattern(LineDash::Dashed), Some((10, 6)));
        assert_eq!(dash_pattern(LineDash::Dotted), Some((2, 4)));
    }

    #[test]
    fn failed_move_removes_the_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("chart.svg");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("occupied"), "x").unwrap();

        let figure = figure();
        assert!(render_figure(&figure, &target, ChartKind::Svg).is_err());
        assert!(!partial_path(&target, ChartKind::Svg).exists());
        assert!(target.is_dir());
    }

    #[test]
    fn svg_is_written_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("chart.svg");
        render_figure(&figure(), &target, ChartKind::Svg).unwrap();
        let svg = fs::read_to_string(&target).unwrap();
        assert!(svg.contains("<svg"));
        assert!(!partial_path(&target, ChartKind::Svg).exists());
    }

    fn figure() -> Figure {
        let input = "1;10.0;20.0\n2;20.0;15.0;15.0\n3;30.0;10.0;10.0;10.0\n";
        let analysis = speed_curve::analyze(input.as_bytes(), &speed_curve::Params::default())
            .unwrap();
        speed_curve::compose(
            &analysis.series,
            analysis.trend.as_ref(),
            &speed_curve::ChartStyle::default(),
        )
        .unwrap()
    }

    #[test]
    fn stroke_widths_round_to_pixels() {
        assert_eq!(stroke_width(1.5), 2);
        assert_eq!(stroke_width(2.0), 2);
        assert_eq!(stroke_width(0.2), 1);
    }
}
