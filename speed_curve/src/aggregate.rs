use std::collections::BTreeMap;

use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};

use crate::record::Record;
use crate::ScError;

/// Samples collected for one vehicle count.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Bucket {
    pub density: f64,
    pub samples: Vec<f64>,
}

/// Groups speed samples by vehicle count.
///
/// Buckets are created on the first sample seen for a count and live until
/// [`Aggregator::finish`]. The density of a bucket is whatever the most recent
/// record for that count carried.
#[derive(Clone, Debug, Default)]
pub struct Aggregator {
    buckets: BTreeMap<u32, Bucket>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: Record) {
        let Record {
            vehicle_count,
            density,
            speeds_kmh,
        } = record;

        if speeds_kmh.is_empty() {
            if let Some(bucket) = self.buckets.get_mut(&vehicle_count) {
                bucket.density = density;
            }
            return;
        }

        let bucket = self.buckets.entry(vehicle_count).or_default();
        bucket.density = density;
        bucket.samples.extend(speeds_kmh);
    }

    pub fn bucket(&self, vehicle_count: u32) -> Option<&Bucket> {
        self.buckets.get(&vehicle_count)
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn sample_count(&self) -> usize {
        self.buckets.values().map(|b| b.samples.len()).sum()
    }

    /// Reduce every bucket to mean and population standard deviation.
    pub fn finish(self) -> Result<AggregateSeries, ScError> {
        if self.buckets.is_empty() {
            return Err(ScError::EmptyDataset);
        }
        let points = self
            .buckets
            .into_iter()
            .map(|(vehicle_count, bucket)| {
                let view = ArrayView1::from(bucket.samples.as_slice());
                let mean = view.mean().unwrap_or(0.0);
                let std_dev = view.std(0.0);
                SeriesPoint {
                    vehicle_count,
                    density: bucket.density,
                    mean,
                    std_dev,
                    sample_count: bucket.samples.len(),
                    samples: bucket.samples,
                }
            })
            .collect();
        Ok(AggregateSeries { points })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub vehicle_count: u32,
    pub density: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub sample_count: usize,
    #[serde(skip)]
    pub samples: Vec<f64>,
}

impl SeriesPoint {
    pub fn upper(&self) -> f64 {
        self.mean + self.std_dev
    }

    pub fn lower(&self) -> f64 {
        self.mean - self.std_dev
    }
}

/// Per-count statistics in ascending vehicle-count order. Never empty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateSeries {
    points: Vec<SeriesPoint>,
}

impl AggregateSeries {
    pub fn points(&self) -> &[SeriesPoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn vehicle_counts(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.vehicle_count as f64).collect()
    }

    pub fn means(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.mean).collect()
    }

    pub fn density(&self, vehicle_count: u32) -> Option<f64> {
        self.points
            .binary_search_by_key(&vehicle_count, |p| p.vehicle_count)
            .ok()
            .map(|idx| self.points[idx].density)
    }

    /// `(min, max)` vehicle count.
    pub fn x_bounds(&self) -> (f64, f64) {
        let first = self.points.first().map_or(0.0, |p| p.vehicle_count as f64);
        let last = self.points.last().map_or(0.0, |p| p.vehicle_count as f64);
        (first, last)
    }

    /// Every individual sample as `(vehicle_count, speed_kmh)`.
    pub fn raw_points(&self) -> impl Iterator<Item = (f64, f64)> + '_ {
        self.points.iter().flat_map(|p| {
            let x = p.vehicle_count as f64;
            p.samples.iter().map(move |&y| (x, y))
        })
    }

    pub fn total_samples(&self) -> usize {
        self.points.iter().map(|p| p.sample_count).sum()
    }
}
