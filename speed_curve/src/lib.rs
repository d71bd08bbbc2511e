//! Speed-versus-vehicle-count analysis for traffic simulation logs.
//!
//! The pipeline runs forward only: lines are parsed by [`record`], grouped by
//! [`aggregate`], fitted by [`trend`] and laid out by [`chart`].

use std::io::BufRead;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod aggregate;
pub mod chart;
pub mod record;
pub mod trend;

pub use aggregate::{AggregateSeries, Aggregator, Bucket, SeriesPoint};
pub use chart::{compose, ChartStyle, Figure, LineDash, Rgb};
pub use record::{parse_line, LineError, LineOutcome, Record, Rejection, KMH_PER_MPS};
pub use trend::{fit_trend, polyfit, Polynomial, TrendCurve, TREND_SAMPLES};

#[derive(Error, Debug)]
pub enum ScError {
    #[error("no valid data found")]
    EmptyDataset,
    #[error("cannot fit a degree {degree} trend to {distinct} distinct vehicle counts")]
    DegenerateFit { degree: usize, distinct: usize },
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("failed to read input: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Params {
    /// Skip the trend fit entirely when false.
    pub fit_trend: bool,
    pub trend_degree: usize,
    pub trend_samples: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            fit_trend: true,
            trend_degree: 1,
            trend_samples: TREND_SAMPLES,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestStats {
    pub lines: usize,
    pub blank: usize,
    pub skipped: usize,
    pub records: usize,
    pub rejected_lines: usize,
    pub rejected_tokens: usize,
    pub samples: usize,
}

/// Everything collected from one pass over the input.
#[derive(Debug, Default)]
pub struct Ingest {
    pub aggregator: Aggregator,
    pub rejections: Vec<Rejection>,
    pub stats: IngestStats,
}

/// Parse every line of `reader` into an [`Aggregator`]. Bad lines, including
/// lines that are not UTF-8, are recorded and never fatal; only read errors abort.
pub fn ingest<R: BufRead>(mut reader: R) -> Result<Ingest, ScError> {
    let mut out = Ingest::default();
    let mut buf = Vec::new();
    let mut line_number = 0;
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        line_number += 1;
        out.stats.lines += 1;
        let outcome = match std::str::from_utf8(&buf) {
            Ok(line) => parse_line(line, line_number),
            Err(_) => LineOutcome::Rejected(Rejection {
                line_number,
                error: LineError::Encoding,
            }),
        };
        match outcome {
            LineOutcome::Blank => out.stats.blank += 1,
            LineOutcome::Skipped => out.stats.skipped += 1,
            LineOutcome::Rejected(rejection) => {
                out.stats.rejected_lines += 1;
                out.rejections.push(rejection);
            }
            LineOutcome::Parsed { record, rejections } => {
                out.stats.records += 1;
                out.stats.rejected_tokens += rejections.len();
                out.stats.samples += record.speeds_kmh.len();
                out.rejections.extend(rejections);
                out.aggregator.push(record);
            }
        }
    }
    Ok(out)
}

#[derive(Debug)]
pub struct Analysis {
    pub series: AggregateSeries,
    pub trend: Option<TrendCurve>,
    pub rejections: Vec<Rejection>,
    pub stats: IngestStats,
}

/// Run the full ingest → aggregate → fit pipeline.
///
/// Returns [`ScError::EmptyDataset`] when no sample survived parsing, and
/// [`ScError::DegenerateFit`] when the requested trend is under-determined.
pub fn analyze<R: BufRead>(reader: R, params: &Params) -> Result<Analysis, ScError> {
    let Ingest {
        aggregator,
        rejections,
        stats,
    } = ingest(reader)?;
    let series = aggregator.finish()?;
    let trend = if params.fit_trend {
        Some(fit_trend(
            &series,
            params.trend_degree,
            params.trend_samples,
        )?)
    } else {
        None
    };
    Ok(Analysis {
        series,
        trend,
        rejections,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn ingest_counts_every_outcome() {
        let input = "3;25.0;10.0;20.0;30.0\n\n7\n2;10.0;5.0\n1;5.0;abc\n1;5.0;2.0\n";
        let ingest = ingest(Cursor::new(input)).unwrap();
        assert_eq!(
            ingest.stats,
            IngestStats {
                lines: 6,
                blank: 1,
                skipped: 1,
                records: 3,
                rejected_lines: 1,
                rejected_tokens: 1,
                samples: 4,
            }
        );
        let lines: Vec<_> = ingest.rejections.iter().map(|r| r.line_number).collect();
        assert_eq!(lines, vec![4, 5]);
        assert_eq!(ingest.aggregator.sample_count(), 4);
    }

    #[test]
    fn ingest_rejects_lines_that_are_not_utf8() {
        let input: &[u8] = b"1;10.0;20.0\n\xff\xfe;1\n2;20.0;15.0;14.0\r\n";
        let ingest = ingest(input).unwrap();
        assert_eq!(ingest.stats.lines, 3);
        assert_eq!(ingest.stats.records, 2);
        assert_eq!(ingest.stats.rejected_lines, 1);
        assert_eq!(ingest.rejections[0].line_number, 2);
        assert_eq!(ingest.rejections[0].error, LineError::Encoding);
        assert_eq!(
            ingest.rejections[0].to_string(),
            "line 2: line is not valid UTF-8"
        );
        assert_eq!(ingest.aggregator.sample_count(), 3);
    }

    #[test]
    fn analyze_builds_series_and_trend() {
        let input = "1;10.0;20.0\n2;20.0;15.0;15.0\n3;30.0;10.0;10.0;10.0\n";
        let analysis = analyze(Cursor::new(input), &Params::default()).unwrap();
        assert_eq!(analysis.series.len(), 3);
        assert_eq!(analysis.stats.samples, 6);
        let trend = analysis.trend.unwrap();
        assert_eq!(trend.x.len(), TREND_SAMPLES);
        assert!((trend.coefficients[1] + 18.0).abs() < 1e-9);
        assert!(analysis.rejections.is_empty());
    }

    #[test]
    fn analyze_rejects_empty_input() {
        let err = analyze(Cursor::new(""), &Params::default()).unwrap_err();
        assert!(matches!(err, ScError::EmptyDataset));

        let err = analyze(Cursor::new("x;y\n2;1.0;3.0\n1;1.0;nan?\n"), &Params::default())
            .unwrap_err();
        assert!(matches!(err, ScError::EmptyDataset));
        assert_eq!(err.to_string(), "no valid data found");
    }

    #[test]
    fn analyze_fails_fast_on_degenerate_trend() {
        let input = "4;10.0;1.0;2.0;3.0;4.0\n";
        let err = analyze(Cursor::new(input), &Params::default()).unwrap_err();
        assert!(matches!(
            err,
            ScError::DegenerateFit {
                degree: 1,
                distinct: 1
            }
        ));

        let params = Params {
            fit_trend: false,
            ..Params::default()
        };
        let analysis = analyze(Cursor::new(input), &params).unwrap();
        assert!(analysis.trend.is_none());
        assert_eq!(analysis.series.len(), 1);
    }
}
