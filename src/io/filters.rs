//! Supplemented features (SPEC_FULL.md 10, "Supplemented features"):
//! `--excludemarkers`, `min-maf`/`min-mac` pre-filtering, and the
//! target/reference marker-intersection step `--array` skips.

use std::collections::HashSet;
use std::io::BufRead;

use crate::errors::{LaiError, LaiResult};

/// One marker ID per line.
pub fn parse_exclude_markers<R: BufRead>(reader: R) -> LaiResult<HashSet<String>> {
    reader
        .lines()
        .map(|line| line.map_err(|e| LaiError::io("excludemarkers file", e)))
        .map(|line| line.map(|l| l.trim().to_string()))
        .filter(|l| l.as_ref().map(|s| !s.is_empty()).unwrap_or(true))
        .collect()
}

/// Minor-allele frequency (folded to `[0, 0.5]`) and minor-allele count.
pub fn maf_and_mac(ref_alleles: &[u8]) -> (f64, usize) {
    let alt = ref_alleles.iter().filter(|&&a| a == 1).count();
    let ref_count = ref_alleles.len() - alt;
    let mac = alt.min(ref_count);
    let maf = if ref_alleles.is_empty() {
        0.0
    } else {
        mac as f64 / ref_alleles.len() as f64
    };
    (maf, mac)
}

/// Marker-index keep mask combining `--excludemarkers`, `min-maf`, and
/// `min-mac`. `marker_ids` and `ref_alleles_per_marker` are aligned 1:1.
pub fn keep_mask(
    marker_ids: &[String],
    ref_alleles_per_marker: &[Vec<u8>],
    excluded: &HashSet<String>,
    min_maf: f64,
    min_mac: usize,
) -> Vec<bool> {
    marker_ids
        .iter()
        .zip(ref_alleles_per_marker)
        .map(|(id, alleles)| {
            if excluded.contains(id) {
                return false;
            }
            let (maf, mac) = maf_and_mac(alleles);
            maf >= min_maf && mac >= min_mac
        })
        .collect()
}

/// Intersect target and reference marker positions by bp, returning the
/// indices into each that survive, in ascending-bp order. When `array` is
/// set, the caller skips this step entirely and assumes the two marker sets
/// already coincide (spec 10, "Supplemented features").
pub fn intersect_markers(target_bp: &[i64], reference_bp: &[i64]) -> LaiResult<(Vec<usize>, Vec<usize>)> {
    let mut ref_index: std::collections::HashMap<i64, usize> = std::collections::HashMap::new();
    for (idx, &bp) in reference_bp.iter().enumerate() {
        ref_index.entry(bp).or_insert(idx);
    }
    let mut target_keep = Vec::new();
    let mut reference_keep = Vec::new();
    for (t_idx, &bp) in target_bp.iter().enumerate() {
        if let Some(&r_idx) = ref_index.get(&bp) {
            target_keep.push(t_idx);
            reference_keep.push(r_idx);
        }
    }
    if target_keep.is_empty() {
        return Err(LaiError::Compatibility(
            "reference and target share no markers".to_string(),
        ));
    }
    Ok((target_keep, reference_keep))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maf_and_mac_folds_to_the_minor_allele() {
        let alleles = vec![0, 0, 0, 1];
        let (maf, mac) = maf_and_mac(&alleles);
        assert_eq!(mac, 1);
        assert!((maf - 0.25).abs() < 1e-9);
    }

    #[test]
    fn intersect_markers_errors_on_empty_overlap() {
        let target = vec![100, 200];
        let reference = vec![300, 400];
        assert!(intersect_markers(&target, &reference).is_err());
    }

    #[test]
    fn intersect_markers_keeps_only_shared_positions_in_target_order() {
        let target = vec![100, 200, 300];
        let reference = vec![300, 100];
        let (t_keep, r_keep) = intersect_markers(&target, &reference).unwrap();
        assert_eq!(t_keep, vec![0, 2]);
        assert_eq!(r_keep, vec![1, 0]);
    }

    #[test]
    fn keep_mask_respects_exclusion_and_thresholds() {
        let ids = vec!["m0".to_string(), "m1".to_string()];
        let alleles = vec![vec![0, 0, 1, 1], vec![0, 0, 0, 1]];
        let mut excluded = HashSet::new();
        excluded.insert("m1".to_string());
        let mask = keep_mask(&ids, &alleles, &excluded, 0.1, 1);
        assert_eq!(mask, vec![true, false]);
    }
}
