//! Feeds component A: parses a PLINK-style genetic map and interpolates a
//! cM position for every marker's bp position (spec 10.G).

use std::io::BufRead;

use crate::errors::{LaiError, LaiResult};

/// Average recombination rate assumed when no `--gen` file is supplied, or
/// for markers outside the supplied map's bp range, 1 cM per Mb -- the
/// conventional PLINK-world default.
const DEFAULT_CM_PER_MB: f64 = 1.0;

/// A chromosome's `bp -> cM` map, sorted ascending by bp.
#[derive(Clone, Debug, Default)]
pub struct GeneticMap {
    bp: Vec<i64>,
    cm: Vec<f64>,
}

impl GeneticMap {
    /// Parse the four whitespace-delimited columns `chrom rsID cM bp`,
    /// keeping only rows for `chrom`. Lines are not required to be sorted;
    /// the result is sorted by bp.
    pub fn parse<R: BufRead>(reader: R, chrom: &str) -> LaiResult<Self> {
        let mut rows: Vec<(i64, f64)> = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| LaiError::io("genetic map", e))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 4 {
                return Err(LaiError::invalid_field(
                    "genetic map",
                    format!("line {}", lineno + 1),
                    "expected 4 columns: chrom rsID cM bp",
                ));
            }
            if fields[0] != chrom {
                continue;
            }
            let cm: f64 = fields[2].parse().map_err(|_| {
                LaiError::invalid_field("genetic map", format!("line {}", lineno + 1), "cM is not a number")
            })?;
            let bp: i64 = fields[3].parse().map_err(|_| {
                LaiError::invalid_field("genetic map", format!("line {}", lineno + 1), "bp is not an integer")
            })?;
            rows.push((bp, cm));
        }
        rows.sort_by_key(|&(bp, _)| bp);
        let bp = rows.iter().map(|&(bp, _)| bp).collect();
        let cm = rows.iter().map(|&(_, cm)| cm).collect();
        Ok(GeneticMap { bp, cm })
    }

    pub fn is_empty(&self) -> bool {
        self.bp.is_empty()
    }

    /// Interpolate (or, with no map loaded, approximate at 1 cM/Mb) a cM
    /// position for every bp position in `marker_bp`, which must already be
    /// sorted ascending.
    pub fn interpolate(&self, marker_bp: &[i64]) -> Vec<f64> {
        if self.is_empty() {
            return marker_bp
                .iter()
                .map(|&bp| bp as f64 / 1_000_000.0 * DEFAULT_CM_PER_MB)
                .collect();
        }
        marker_bp.iter().map(|&bp| self.cm_at(bp)).collect()
    }

    fn cm_at(&self, bp: i64) -> f64 {
        let n = self.bp.len();
        if bp <= self.bp[0] {
            if n == 1 {
                return self.cm[0];
            }
            let slope = (self.cm[1] - self.cm[0]) / (self.bp[1] - self.bp[0]) as f64;
            return self.cm[0] + slope * (bp - self.bp[0]) as f64;
        }
        if bp >= self.bp[n - 1] {
            if n == 1 {
                return self.cm[0];
            }
            let slope = (self.cm[n - 1] - self.cm[n - 2]) / (self.bp[n - 1] - self.bp[n - 2]) as f64;
            return self.cm[n - 1] + slope * (bp - self.bp[n - 1]) as f64;
        }
        // binary search for the bracketing interval.
        let idx = self.bp.partition_point(|&x| x <= bp);
        let (lo, hi) = (idx - 1, idx);
        if self.bp[hi] == self.bp[lo] {
            return self.cm[lo];
        }
        let frac = (bp - self.bp[lo]) as f64 / (self.bp[hi] - self.bp[lo]) as f64;
        self.cm[lo] + frac * (self.cm[hi] - self.cm[lo])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_map_falls_back_to_one_cm_per_mb() {
        let map = GeneticMap::default();
        let cm = map.interpolate(&[0, 1_000_000, 2_000_000]);
        assert_eq!(cm, vec![0.0, 1.0, 2.0]);
    }

    #[test]
    fn interpolates_between_known_points() {
        let map = GeneticMap {
            bp: vec![0, 1_000_000],
            cm: vec![0.0, 1.0],
        };
        let cm = map.interpolate(&[500_000]);
        assert!((cm[0] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn extrapolates_past_the_last_known_point() {
        let map = GeneticMap {
            bp: vec![0, 1_000_000],
            cm: vec![0.0, 1.0],
        };
        let cm = map.interpolate(&[2_000_000]);
        assert!((cm[0] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn parse_keeps_only_requested_chromosome_and_sorts_by_bp() {
        let text = "1 rs1 0.5 2000\n2 rsX 9.0 1\n1 rs0 0.0 1000\n";
        let map = GeneticMap::parse(text.as_bytes(), "1").unwrap();
        assert_eq!(map.bp, vec![1000, 2000]);
        assert_eq!(map.cm, vec![0.0, 0.5]);
    }
}
