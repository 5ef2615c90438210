//! Global-ancestries TSV writer: `SAMPLE <ancIds>` header then per-sample
//! mean posterior ancestry over all markers and both haplotypes, 3 decimals.

use std::io::Write;

use crate::errors::{LaiError, LaiResult};

pub fn write_global_ancestry<W: Write>(
    mut writer: W,
    ancestry_names: &[String],
    // `per_sample[k] = (sample_name, mean_ancestry)`, in output order.
    per_sample: &[(String, Vec<f64>)],
) -> LaiResult<()> {
    let io_err = |e: std::io::Error| LaiError::io("global ancestries output", e);
    writeln!(writer, "SAMPLE\t{}", ancestry_names.join("\t")).map_err(io_err)?;
    for (sample, means) in per_sample {
        let formatted: Vec<String> = means.iter().map(|v| format!("{v:.3}")).collect();
        writeln!(writer, "{sample}\t{}", formatted.join("\t")).map_err(io_err)?;
    }
    Ok(())
}

/// Average two haplotypes' per-marker ancestry posteriors into one
/// per-sample mean ancestry vector. `hap_posteriors` holds, for each of the
/// sample's two haplotypes, a `Vec<Vec<f64>>` of per-marker posteriors.
pub fn mean_ancestry(hap_posteriors: &[Vec<Vec<f64>>], n_ancestries: usize) -> Vec<f64> {
    let mut sums = vec![0.0; n_ancestries];
    let mut n = 0usize;
    for hap in hap_posteriors {
        for marker_post in hap {
            for (i, &v) in marker_post.iter().enumerate() {
                sums[i] += v;
            }
            n += 1;
        }
    }
    if n == 0 {
        return sums;
    }
    sums.into_iter().map(|s| s / n as f64).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mean_ancestry_averages_across_markers_and_haplotypes() {
        let hap0 = vec![vec![1.0, 0.0], vec![0.5, 0.5]];
        let hap1 = vec![vec![0.0, 1.0], vec![0.5, 0.5]];
        let mean = mean_ancestry(&[hap0, hap1], 2);
        assert!((mean[0] - 0.5).abs() < 1e-9);
        assert!((mean[1] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn write_global_ancestry_formats_three_decimals() {
        let mut buf = Vec::new();
        write_global_ancestry(
            &mut buf,
            &["A0".to_string(), "A1".to_string()],
            &[("sampleA".to_string(), vec![0.333333, 0.666667])],
        )
        .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("sampleA\t0.333\t0.667"));
    }
}
