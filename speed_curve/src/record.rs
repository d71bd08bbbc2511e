//! Line-level parsing of simulation speed logs.
//!
//! A line looks like `numCar;density;v0;v1;...` with speeds in m/s. Parsing
//! never aborts the caller: every problem is returned as a [`Rejection`] so
//! the driver can report it and move on.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// m/s → km/h.
pub const KMH_PER_MPS: f64 = 3.6;

const FIELD_SEPARATOR: char = ';';

/// One simulation run with its speeds already converted to km/h.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub vehicle_count: u32,
    pub density: f64,
    pub speeds_kmh: Vec<f64>,
}

#[derive(Error, Clone, Debug, PartialEq)]
pub enum LineError {
    #[error("cannot parse vehicle count or density from {tokens:?}")]
    Header { tokens: Vec<String> },
    #[error("expected {expected} values, found {found}")]
    FieldCount { expected: usize, found: usize },
    #[error("cannot convert '{token}' to float")]
    Speed { token: String },
    #[error("line is not valid UTF-8")]
    Encoding,
}

/// A discarded line or token, tagged with its 1-based line number.
#[derive(Clone, Debug, PartialEq)]
pub struct Rejection {
    pub line_number: usize,
    pub error: LineError,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line_number, self.error)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum LineOutcome {
    /// Whitespace only.
    Blank,
    /// Fewer than two tokens; not enough to identify the run.
    Skipped,
    /// The whole line was discarded.
    Rejected(Rejection),
    /// A record, plus one rejection per speed token that failed to parse.
    Parsed {
        record: Record,
        rejections: Vec<Rejection>,
    },
}

/// Parse one raw line. `line_number` is 1-based and only used for diagnostics.
pub fn parse_line(line: &str, line_number: usize) -> LineOutcome {
    let line = line.trim();
    if line.is_empty() {
        return LineOutcome::Blank;
    }

    let tokens = tokenize(line);
    if tokens.len() < 2 {
        return LineOutcome::Skipped;
    }

    let header = tokens[0]
        .parse::<u32>()
        .ok()
        .zip(tokens[1].parse::<f64>().ok());
    let Some((vehicle_count, density)) = header else {
        return LineOutcome::Rejected(Rejection {
            line_number,
            error: LineError::Header {
                tokens: tokens[..2].iter().map(|t| t.to_string()).collect(),
            },
        });
    };

    let expected = 2 + vehicle_count as usize;
    if tokens.len() < expected {
        return LineOutcome::Rejected(Rejection {
            line_number,
            error: LineError::FieldCount {
                expected,
                found: tokens.len(),
            },
        });
    }

    let mut speeds_kmh = Vec::with_capacity(tokens.len() - 2);
    let mut rejections = Vec::new();
    for token in &tokens[2..] {
        match parse_speed(token) {
            Ok(kmh) => speeds_kmh.push(kmh),
            Err(error) => rejections.push(Rejection { line_number, error }),
        }
    }

    LineOutcome::Parsed {
        record: Record {
            vehicle_count,
            density,
            speeds_kmh,
        },
        rejections,
    }
}

fn tokenize(line: &str) -> Vec<&str> {
    line.split(FIELD_SEPARATOR)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect()
}

/// Parse a speed token in m/s and convert it to km/h. Negative values pass through.
pub fn parse_speed(token: &str) -> Result<f64, LineError> {
    token
        .parse::<f64>()
        .map(|mps| mps * KMH_PER_MPS)
        .map_err(|_| LineError::Speed {
            token: token.to_string(),
        })
}
