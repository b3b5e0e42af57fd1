//! Latency samples of a sampling run, and their output formats.

use crate::error::ExperimentError;
use itertools::{Itertools, MinMaxResult};
use rmp_serde::{Deserializer, Serializer};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

/// Start and end tick of every sample, indexed by sample id.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyTrace {
    pub starts: Vec<u64>,
    pub ends: Vec<u64>,
    pub ticks_per_ns: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LatencySummary {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl LatencyTrace {
    pub const EXTENSION_ZSTD: &'static str = "latency.msgpack.zst";

    pub fn new(starts: Vec<u64>, ends: Vec<u64>, ticks_per_ns: f64) -> Self {
        assert_eq!(starts.len(), ends.len());
        LatencyTrace {
            starts,
            ends,
            ticks_per_ns,
        }
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }

    /// Latency of sample `i` in nanoseconds. The tick difference is taken as signed, a sample
    /// whose completion was stamped before its issue shows up negative.
    pub fn latency_ns(&self, i: usize) -> f64 {
        let ticks = self.ends[i].wrapping_sub(self.starts[i]) as i64;
        ticks as f64 / self.ticks_per_ns
    }

    pub fn latencies(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.len()).map(|i| self.latency_ns(i))
    }

    /// One latency per line, in sample order.
    pub fn write_lines<W: Write>(&self, out: &mut W) -> std::io::Result<()> {
        for latency in self.latencies() {
            writeln!(out, "{:.2}", latency)?;
        }
        out.flush()
    }

    /// Count, mean and extrema of the latencies, the first `skip` samples left out.
    pub fn summary(&self, skip: usize) -> Option<LatencySummary> {
        let kept: Vec<f64> = self.latencies().skip(skip).collect();
        let (min, max) = match kept.iter().copied().minmax_by(f64::total_cmp) {
            MinMaxResult::NoElements => return None,
            MinMaxResult::OneElement(x) => (x, x),
            MinMaxResult::MinMax(min, max) => (min, max),
        };
        Some(LatencySummary {
            count: kept.len(),
            mean: kept.iter().sum::<f64>() / kept.len() as f64,
            min,
            max,
        })
    }

    pub fn read_msgpack_zstd(path: impl AsRef<Path>) -> Result<Self, ExperimentError> {
        let file = std::fs::File::open(path)?;
        let decoder = zstd::Decoder::new(file)?;
        let mut deserializer = Deserializer::new(decoder);
        Ok(LatencyTrace::deserialize(&mut deserializer)?)
    }

    pub fn write_msgpack_zstd(&self, path: impl AsRef<Path>) -> Result<(), ExperimentError> {
        let file = std::fs::File::create(path)?;
        let mut encoder = zstd::Encoder::new(file, 0)?.auto_finish();
        let mut serializer = Serializer::new(&mut encoder);
        self.serialize(&mut serializer)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace() -> LatencyTrace {
        LatencyTrace::new(vec![0, 100, 200, 300], vec![200, 500, 400, 900], 2.0)
    }

    #[test]
    fn latencies_are_converted_to_nanoseconds() {
        let t = trace();
        let mut out = Vec::new();
        t.write_lines(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "100.00\n200.00\n100.00\n300.00\n"
        );
    }

    #[test]
    fn completion_before_issue_is_negative() {
        let t = LatencyTrace::new(vec![1000], vec![800], 2.0);
        assert_eq!(t.latency_ns(0), -100.0);
    }

    #[test]
    fn summary_skips_warmup() {
        let s = trace().summary(1).unwrap();
        assert_eq!(s.count, 3);
        assert_eq!(s.min, 100.0);
        assert_eq!(s.max, 300.0);
        assert_eq!(s.mean, 200.0);
        assert!(trace().summary(4).is_none());
    }

    #[test]
    fn compressed_trace_file() {
        let path = std::env::temp_dir().join(format!(
            "row_conflict_{}.{}",
            std::process::id(),
            LatencyTrace::EXTENSION_ZSTD
        ));
        let t = trace();
        t.write_msgpack_zstd(&path).unwrap();
        let back = LatencyTrace::read_msgpack_zstd(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(back, t);
    }
}
