//! Backend-neutral chart composition.
//!
//! [`compose`] turns the aggregated series and trend into a [`Figure`]: a list
//! of bars, polylines and ticks in data coordinates. Drawing it is left to the
//! caller.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::aggregate::AggregateSeries;
use crate::trend::TrendCurve;
use crate::ScError;

pub const TITLE: &str = "Number of Vehicles vs Average Speeds with Std Deviation";
pub const X_CAPTION: &str = "Number of Vehicles (Density)";
pub const Y_CAPTION: &str = "Average Speed (km/h)";

const X_MARGIN: f64 = 0.5;
const Y_PADDING_FRACTION: f64 = 0.05;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Rgb(pub u8, pub u8, pub u8);

impl Rgb {
    pub const BLUE: Rgb = Rgb(0, 0, 255);
    pub const RED: Rgb = Rgb(255, 0, 0);
    pub const GREEN: Rgb = Rgb(0, 128, 0);
    pub const PURPLE: Rgb = Rgb(128, 0, 128);
}

impl FromStr for Rgb {
    type Err = ScError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        let named = match name.as_str() {
            "blue" => Some(Rgb::BLUE),
            "red" => Some(Rgb::RED),
            "green" => Some(Rgb::GREEN),
            "purple" => Some(Rgb::PURPLE),
            "black" => Some(Rgb(0, 0, 0)),
            "white" => Some(Rgb(255, 255, 255)),
            "gray" | "grey" => Some(Rgb(128, 128, 128)),
            "orange" => Some(Rgb(255, 165, 0)),
            "cyan" => Some(Rgb(0, 255, 255)),
            "magenta" => Some(Rgb(255, 0, 255)),
            "yellow" => Some(Rgb(255, 255, 0)),
            "brown" => Some(Rgb(165, 42, 42)),
            _ => None,
        };
        if let Some(rgb) = named {
            return Ok(rgb);
        }

        let invalid = || ScError::InvalidParameter(format!("unknown color '{}'", s));
        let hex = name.strip_prefix('#').ok_or_else(invalid)?;
        if hex.len() != 6 || !hex.is_ascii() {
            return Err(invalid());
        }
        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&hex[range], 16).map_err(|_| invalid())
        };
        Ok(Rgb(channel(0..2)?, channel(2..4)?, channel(4..6)?))
    }
}

impl TryFrom<String> for Rgb {
    type Error = ScError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Rgb> for String {
    fn from(value: Rgb) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Rgb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02x}{:02x}{:02x}", self.0, self.1, self.2)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineDash {
    Solid,
    Dashed,
    Dotted,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LineStyle {
    pub enabled: bool,
    pub color: Rgb,
    pub dash: LineDash,
    pub width: f64,
}

impl LineStyle {
    fn new(color: Rgb, dash: LineDash, width: f64) -> Self {
        Self {
            enabled: true,
            color,
            dash,
            width,
        }
    }
}

impl Default for LineStyle {
    fn default() -> Self {
        Self::new(Rgb(0, 0, 0), LineDash::Solid, 1.0)
    }
}

/// Raw-sample overlay: one translucent bar per sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BarStyle {
    pub enabled: bool,
    pub color: Rgb,
    /// Horizontal extent in data units.
    pub width: f64,
    /// Each bar spans `speed - vertical_offset ..= speed + vertical_offset`.
    pub vertical_offset: f64,
    pub alpha: f64,
}

impl Default for BarStyle {
    fn default() -> Self {
        Self {
            enabled: true,
            color: Rgb::BLUE,
            width: 1.0,
            vertical_offset: 0.3,
            alpha: 0.1,
        }
    }
}

/// Deserializes section by section: keys missing from a section keep that
/// section's own default, so `{"mean": {"color": "#00ff00"}}` stays 2.0 wide.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "StyleDocument")]
pub struct ChartStyle {
    pub bars: BarStyle,
    pub mean: LineStyle,
    pub trend: LineStyle,
    /// Polynomial degree of the trend fit.
    pub trend_degree: usize,
    pub dispersion: LineStyle,
    /// Only every `label_step`-th x tick carries text.
    pub label_step: usize,
    pub width: u32,
    pub height: u32,
}

impl Default for ChartStyle {
    fn default() -> Self {
        Self {
            bars: BarStyle::default(),
            mean: LineStyle::new(Rgb::RED, LineDash::Solid, 2.0),
            trend: LineStyle::new(Rgb::GREEN, LineDash::Solid, 2.0),
            trend_degree: 1,
            dispersion: LineStyle::new(Rgb::PURPLE, LineDash::Dashed, 1.5),
            label_step: 4,
            width: 1000,
            height: 600,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LinePatch {
    enabled: Option<bool>,
    color: Option<Rgb>,
    dash: Option<LineDash>,
    width: Option<f64>,
}

impl LinePatch {
    fn apply(self, base: LineStyle) -> LineStyle {
        LineStyle {
            enabled: self.enabled.unwrap_or(base.enabled),
            color: self.color.unwrap_or(base.color),
            dash: self.dash.unwrap_or(base.dash),
            width: self.width.unwrap_or(base.width),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StyleDocument {
    bars: BarStyle,
    mean: LinePatch,
    trend: LinePatch,
    trend_degree: Option<usize>,
    dispersion: LinePatch,
    label_step: Option<usize>,
    width: Option<u32>,
    height: Option<u32>,
}

impl From<StyleDocument> for ChartStyle {
    fn from(doc: StyleDocument) -> Self {
        let base = ChartStyle::default();
        Self {
            bars: doc.bars,
            mean: doc.mean.apply(base.mean),
            trend: doc.trend.apply(base.trend),
            trend_degree: doc.trend_degree.unwrap_or(base.trend_degree),
            dispersion: doc.dispersion.apply(base.dispersion),
            label_step: doc.label_step.unwrap_or(base.label_step),
            width: doc.width.unwrap_or(base.width),
            height: doc.height.unwrap_or(base.height),
        }
    }
}

impl ChartStyle {
    pub fn validate(&self) -> Result<(), ScError> {
        let invalid = |msg: String| Err(ScError::InvalidParameter(msg));
        if self.label_step == 0 {
            return invalid("label_step must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.bars.alpha) {
            return invalid(format!("bar alpha {} is outside [0, 1]", self.bars.alpha));
        }
        if !(self.bars.width > 0.0) {
            return invalid(format!("bar width {} must be positive", self.bars.width));
        }
        if !(self.bars.vertical_offset >= 0.0) {
            return invalid(format!(
                "bar vertical offset {} must not be negative",
                self.bars.vertical_offset
            ));
        }
        for (name, line) in [
            ("mean", &self.mean),
            ("trend", &self.trend),
            ("dispersion", &self.dispersion),
        ] {
            if !(line.width > 0.0) {
                return invalid(format!("{} line width {} must be positive", name, line.width));
            }
        }
        if self.width == 0 || self.height == 0 {
            return invalid(format!(
                "figure size {}x{} must be non-zero",
                self.width, self.height
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Tick {
    pub x: f64,
    pub label: String,
}

/// Axis-aligned rectangle in data coordinates.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Bar {
    pub x0: f64,
    pub x1: f64,
    pub y0: f64,
    pub y1: f64,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Polyline {
    pub label: &'static str,
    pub points: Vec<(f64, f64)>,
    pub style: LineStyle,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Figure {
    pub title: &'static str,
    pub x_caption: &'static str,
    pub y_caption: &'static str,
    pub width: u32,
    pub height: u32,
    pub x_range: (f64, f64),
    pub y_range: (f64, f64),
    pub ticks: Vec<Tick>,
    pub bars: Vec<Bar>,
    pub bar_color: Rgb,
    pub bar_alpha: f64,
    pub lines: Vec<Polyline>,
}

impl Figure {
    pub fn line(&self, label: &str) -> Option<&Polyline> {
        self.lines.iter().find(|l| l.label == label)
    }
}

/// `"<count> (<density>)"` on every `step`-th tick, empty text elsewhere.
pub fn tick_labels(series: &AggregateSeries, step: usize) -> Vec<Tick> {
    let step = step.max(1);
    series
        .points()
        .iter()
        .enumerate()
        .map(|(idx, point)| Tick {
            x: point.vehicle_count as f64,
            label: if idx % step == 0 {
                format!("{} ({:.0})", point.vehicle_count, point.density)
            } else {
                String::new()
            },
        })
        .collect()
}

/// Assemble every enabled layer. `trend` is required when the trend layer is on.
pub fn compose(
    series: &AggregateSeries,
    trend: Option<&TrendCurve>,
    style: &ChartStyle,
) -> Result<Figure, ScError> {
    style.validate()?;
    if series.is_empty() {
        return Err(ScError::EmptyDataset);
    }

    let mut bars = Vec::new();
    if style.bars.enabled {
        let half_width = style.bars.width / 2.0;
        let offset = style.bars.vertical_offset;
        bars.extend(series.raw_points().map(|(x, y)| Bar {
            x0: x - half_width,
            x1: x + half_width,
            y0: y - offset,
            y1: y + offset,
        }));
    }

    let mut lines = Vec::new();
    let points = series.points();
    if style.mean.enabled {
        lines.push(Polyline {
            label: "Mean Speed",
            points: points
                .iter()
                .map(|p| (p.vehicle_count as f64, p.mean))
                .collect(),
            style: style.mean.clone(),
        });
    }
    if style.trend.enabled {
        let trend = trend.ok_or_else(|| {
            ScError::InvalidParameter("trend layer enabled but no trend curve supplied".into())
        })?;
        lines.push(Polyline {
            label: "Trend Curve",
            points: trend.points().collect(),
            style: style.trend.clone(),
        });
    }
    if style.dispersion.enabled {
        lines.push(Polyline {
            label: "+1 Std Dev",
            points: points
                .iter()
                .map(|p| (p.vehicle_count as f64, p.upper()))
                .collect(),
            style: style.dispersion.clone(),
        });
        lines.push(Polyline {
            label: "-1 Std Dev",
            points: points
                .iter()
                .map(|p| (p.vehicle_count as f64, p.lower()))
                .collect(),
            style: style.dispersion.clone(),
        });
    }

    let (x_min, x_max) = series.x_bounds();
    let x_margin = X_MARGIN.max(if style.bars.enabled {
        style.bars.width / 2.0
    } else {
        0.0
    });
    let x_range = (x_min - x_margin, x_max + x_margin);
    let y_range = y_extent(&bars, &lines, series);

    Ok(Figure {
        title: TITLE,
        x_caption: X_CAPTION,
        y_caption: Y_CAPTION,
        width: style.width,
        height: style.height,
        x_range,
        y_range,
        ticks: tick_labels(series, style.label_step),
        bars,
        bar_color: style.bars.color,
        bar_alpha: style.bars.alpha,
        lines,
    })
}

fn y_extent(bars: &[Bar], lines: &[Polyline], series: &AggregateSeries) -> (f64, f64) {
    let values = bars
        .iter()
        .flat_map(|b| [b.y0, b.y1])
        .chain(lines.iter().flat_map(|l| l.points.iter().map(|p| p.1)))
        .chain(series.points().iter().map(|p| p.mean))
        .filter(|v| v.is_finite());
    let (lo, hi) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| {
        (lo.min(v), hi.max(v))
    });
    if !lo.is_finite() || !hi.is_finite() {
        return (0.0, 1.0);
    }
    let span = hi - lo;
    let pad = if span > 0.0 {
        span * Y_PADDING_FRACTION
    } else {
        lo.abs().max(1.0) * Y_PADDING_FRACTION
    };
    (lo - pad, hi + pad)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::Aggregator;
    use crate::record::Record;
    use crate::trend::{fit_trend, TREND_SAMPLES};

    fn series(counts: &[(u32, f64, &[f64])]) -> AggregateSeries {
        let mut agg = Aggregator::new();
        for &(vehicle_count, density, speeds) in counts {
            agg.push(Record {
                vehicle_count,
                density,
                speeds_kmh: speeds.to_vec(),
            });
        }
        agg.finish().unwrap()
    }

    fn sample_series() -> AggregateSeries {
        series(&[
            (10, 12.4, &[60.0, 62.0]),
            (20, 24.6, &[50.0]),
            (30, 37.0, &[41.0, 39.0]),
            (40, 49.5, &[30.0]),
            (50, 61.2, &[22.0, 18.0]),
            (60, 73.9, &[10.0]),
        ])
    }

    #[test]
    fn every_fourth_tick_is_labelled() {
        let ticks = tick_labels(&sample_series(), 4);
        assert_eq!(ticks.len(), 6);
        assert_eq!(ticks[0].label, "10 (12)");
        assert_eq!(ticks[0].x, 10.0);
        assert!(ticks[1].label.is_empty());
        assert!(ticks[2].label.is_empty());
        assert!(ticks[3].label.is_empty());
        assert_eq!(ticks[4].label, "50 (61)");
        assert_eq!(ticks[4].x, 50.0);
        assert!(ticks[5].label.is_empty());
        assert_eq!(ticks[5].x, 60.0);
    }

    #[test]
    fn step_of_one_labels_everything() {
        let ticks = tick_labels(&sample_series(), 1);
        assert!(ticks.iter().all(|t| !t.label.is_empty()));
        assert_eq!(ticks[1].label, "20 (25)");
    }

    #[test]
    fn default_style_matches_documented_values() {
        let style = ChartStyle::default();
        assert_eq!(style.bars.color, Rgb::BLUE);
        assert_eq!(style.bars.width, 1.0);
        assert_eq!(style.bars.vertical_offset, 0.3);
        assert_eq!(style.bars.alpha, 0.1);
        assert_eq!(style.mean.color, Rgb::RED);
        assert_eq!(style.mean.width, 2.0);
        assert_eq!(style.trend.color, Rgb::GREEN);
        assert_eq!(style.trend_degree, 1);
        assert_eq!(style.dispersion.color, Rgb::PURPLE);
        assert_eq!(style.dispersion.dash, LineDash::Dashed);
        assert_eq!(style.dispersion.width, 1.5);
        assert_eq!(style.label_step, 4);
        assert!(style.validate().is_ok());
    }

    #[test]
    fn composes_all_layers() {
        let series = sample_series();
        let trend = fit_trend(&series, 1, TREND_SAMPLES).unwrap();
        let figure = compose(&series, Some(&trend), &ChartStyle::default()).unwrap();

        assert_eq!(figure.bars.len(), series.total_samples());
        let first = figure.bars[0];
        assert!((first.x0 - 9.5).abs() < 1e-12);
        assert!((first.x1 - 10.5).abs() < 1e-12);
        assert!((first.y0 - 59.7).abs() < 1e-9);
        assert!((first.y1 - 60.3).abs() < 1e-9);

        let labels: Vec<_> = figure.lines.iter().map(|l| l.label).collect();
        assert_eq!(
            labels,
            vec!["Mean Speed", "Trend Curve", "+1 Std Dev", "-1 Std Dev"]
        );
        assert_eq!(figure.line("Trend Curve").unwrap().points.len(), 300);

        let upper = figure.line("+1 Std Dev").unwrap();
        let lower = figure.line("-1 Std Dev").unwrap();
        assert_eq!(upper.points[0], (10.0, 62.0));
        assert_eq!(lower.points[0], (10.0, 60.0));
        assert!(upper.points.windows(2).all(|w| w[0].0 < w[1].0));

        assert_eq!(figure.x_range, (9.5, 60.5));
        assert!(figure.y_range.0 < 9.7);
        assert!(figure.y_range.1 > 62.3);
        assert_eq!(figure.title, TITLE);
    }

    #[test]
    fn layers_can_be_switched_off() {
        let series = sample_series();
        let mut style = ChartStyle::default();
        style.bars.enabled = false;
        style.trend.enabled = false;
        style.dispersion.enabled = false;
        let figure = compose(&series, None, &style).unwrap();
        assert!(figure.bars.is_empty());
        assert_eq!(figure.lines.len(), 1);
        assert_eq!(figure.lines[0].label, "Mean Speed");
    }

    #[test]
    fn trend_layer_needs_a_curve() {
        let err = compose(&sample_series(), None, &ChartStyle::default()).unwrap_err();
        assert!(matches!(err, ScError::InvalidParameter(_)));
    }

    #[test]
    fn wide_bars_widen_the_x_range() {
        let series = sample_series();
        let mut style = ChartStyle::default();
        style.bars.width = 4.0;
        style.trend.enabled = false;
        let figure = compose(&series, None, &style).unwrap();
        assert_eq!(figure.x_range, (8.0, 62.0));
    }

    #[test]
    fn invalid_styles_are_rejected() {
        let mut style = ChartStyle::default();
        style.label_step = 0;
        assert!(style.validate().is_err());

        let mut style = ChartStyle::default();
        style.bars.alpha = 1.5;
        assert!(style.validate().is_err());

        let mut style = ChartStyle::default();
        style.dispersion.width = 0.0;
        assert!(style.validate().is_err());

        let mut style = ChartStyle::default();
        style.bars.vertical_offset = -1.0;
        assert!(style.validate().is_err());
    }

    #[test]
    fn colors_parse_from_names_and_hex() {
        assert_eq!("blue".parse::<Rgb>().unwrap(), Rgb::BLUE);
        assert_eq!(" Purple ".parse::<Rgb>().unwrap(), Rgb::PURPLE);
        assert_eq!("#1e90ff".parse::<Rgb>().unwrap(), Rgb(30, 144, 255));
        assert!("#12345".parse::<Rgb>().is_err());
        assert!("chartreuse-ish".parse::<Rgb>().is_err());
        assert_eq!(Rgb(30, 144, 255).to_string(), "#1e90ff");
    }

    #[test]
    fn style_round_trips_through_json_with_defaults() {
        let style: ChartStyle = serde_json::from_str(
            r##"{
                "label_step": 2,
                "trend_degree": 2,
                "mean": {"enabled": true, "color": "#00ff00", "dash": "dotted", "width": 3.0}
            }"##,
        )
        .unwrap();
        assert_eq!(style.label_step, 2);
        assert_eq!(style.trend_degree, 2);
        assert_eq!(style.mean.color, Rgb(0, 255, 0));
        assert_eq!(style.mean.dash, LineDash::Dotted);
        assert_eq!(style.mean.width, 3.0);
        assert_eq!(style.trend, ChartStyle::default().trend);
        assert_eq!(style.bars, BarStyle::default());

        let encoded = serde_json::to_string(&ChartStyle::default()).unwrap();
        let decoded: ChartStyle = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, ChartStyle::default());
    }

    #[test]
    fn partial_sections_keep_their_own_defaults() {
        let style: ChartStyle = serde_json::from_str(
            r##"{"mean": {"color": "#00ff00"}, "dispersion": {"enabled": false}, "bars": {"alpha": 0.5}}"##,
        )
        .unwrap();
        assert_eq!(style.mean.color, Rgb(0, 255, 0));
        assert_eq!(style.mean.width, 2.0);
        assert_eq!(style.mean.dash, LineDash::Solid);
        assert!(!style.dispersion.enabled);
        assert_eq!(style.dispersion.dash, LineDash::Dashed);
        assert_eq!(style.dispersion.color, Rgb::PURPLE);
        assert_eq!(style.bars.alpha, 0.5);
        assert_eq!(style.bars.color, Rgb::BLUE);
        assert_eq!(style.trend, ChartStyle::default().trend);

        let empty: ChartStyle = serde_json::from_str("{}").unwrap();
        assert_eq!(empty, ChartStyle::default());
        assert!(serde_json::from_str::<ChartStyle>(r#"{"mean": {"dash": "wavy"}}"#).is_err());
    }
}
