//! Component B: partition markers into equal-cM steps and reduce each
//! haplotype's allele sequence within a step to a small step-local integer.

use crate::markers::Markers;
use crate::pbwt;

/// One equal-cM interval of markers, plus every haplotype's distinct-
/// sequence index within it.
#[derive(Clone, Debug)]
pub struct CodedStep {
    /// First marker index covered by this step (inclusive).
    pub start_marker: usize,
    /// One past the last marker index covered by this step (exclusive).
    pub end_marker: usize,
    /// `hap_to_seq[h]` is haplotype `h`'s distinct-sequence index within
    /// this step. Step-local: comparable only against other haplotypes'
    /// entries for the *same* step.
    pub hap_to_seq: Vec<u32>,
    /// Number of distinct sequences assigned this step (`hap_to_seq`'s
    /// value range is `[0, num_symbols)`).
    pub num_symbols: u32,
}

/// Partition `markers` into `ceil(total_cm / step_cm)` adjacent half-open
/// intervals of roughly equal cM width, then code each one.
pub fn build_steps(markers: &Markers, alleles: &[Vec<u8>], step_cm: f64) -> Vec<CodedStep> {
    let m = markers.len();
    if m == 0 {
        return Vec::new();
    }
    let boundaries = step_boundaries(markers, step_cm);
    boundaries
        .windows(2)
        .map(|w| code_step(w[0], w[1], alleles))
        .collect()
}

fn step_boundaries(markers: &Markers, step_cm: f64) -> Vec<usize> {
    let m = markers.len();
    let start_cm = markers.cm[0];
    let total_cm = markers.total_cm().max(step_cm);
    let n_steps = (total_cm / step_cm).ceil().max(1.0) as usize;

    let mut boundaries = Vec::with_capacity(n_steps + 1);
    boundaries.push(0);
    let mut next_threshold = start_cm + step_cm;
    let mut marker = 1;
    while marker < m {
        if markers.cm[marker] >= next_threshold {
            boundaries.push(marker);
            next_threshold += step_cm;
            // a step may span more than one `step_cm` if markers are
            // sparse; keep advancing the threshold until it is ahead.
            while marker < m && markers.cm[marker] >= next_threshold {
                next_threshold += step_cm;
            }
        }
        marker += 1;
    }
    if *boundaries.last().unwrap() != m {
        boundaries.push(m);
    }
    boundaries
}

/// Code one step's markers: single-marker steps use the allele directly
/// (alphabet size 2); multi-marker steps run a per-marker PBWT across the
/// step and assign a fresh sequence index whenever a haplotype's divergence
/// exceeds the step's start marker (spec 4.B).
fn code_step(start_marker: usize, end_marker: usize, alleles: &[Vec<u8>]) -> CodedStep {
    let h = alleles[start_marker].len();

    if end_marker - start_marker == 1 {
        let hap_to_seq: Vec<u32> = alleles[start_marker].iter().map(|&b| b as u32).collect();
        return CodedStep {
            start_marker,
            end_marker,
            hap_to_seq,
            num_symbols: 2,
        };
    }

    let mut a: Vec<u32> = (0..h as u32).collect();
    let mut d: Vec<u32> = vec![start_marker as u32; h];
    for marker in start_marker..end_marker {
        let symbol: Vec<u32> = alleles[marker].iter().map(|&b| b as u32).collect();
        pbwt::advance(&mut a, &mut d, &symbol, 2, marker as u32);
    }

    // Assign a new sequence index to haplotype a[i] whenever its divergence
    // exceeds the step's start: that haplotype's run within this step does
    // not extend back to the step boundary, so it is not IBS, within this
    // step, with its predecessor in sort order.
    let mut hap_to_seq = vec![0u32; h];
    let mut next_seq: u32 = 0;
    for i in 0..h {
        if i == 0 || d[i] > start_marker as u32 {
            next_seq += if i == 0 { 0 } else { 1 };
        }
        hap_to_seq[a[i] as usize] = next_seq;
    }
    CodedStep {
        start_marker,
        end_marker,
        hap_to_seq,
        num_symbols: next_seq + 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::markers::Markers;

    fn toy_markers(cm: Vec<f64>) -> Markers {
        let bp = (0..cm.len() as i64).map(|i| i * 100).collect();
        Markers {
            chrom: "1".into(),
            bp,
            cm,
        }
    }

    #[test]
    fn single_marker_step_uses_allele_directly() {
        let markers = toy_markers(vec![0.0, 1.0, 2.0]);
        let alleles = vec![vec![0, 1], vec![1, 0], vec![0, 0]];
        let steps = build_steps(&markers, &alleles, 1.0);
        assert_eq!(steps.len(), 3);
        assert_eq!(steps[0].hap_to_seq, vec![0, 1]);
    }

    #[test]
    fn identical_haplotypes_share_a_sequence_index() {
        let markers = toy_markers(vec![0.0, 0.001, 0.002, 1.0]);
        let alleles = vec![
            vec![0, 0, 1],
            vec![1, 1, 0],
            vec![0, 0, 1],
            vec![1, 1, 1],
        ];
        let steps = build_steps(&markers, &alleles, 1.0);
        // haplotypes 0 and 1 are identical across the multi-marker step
        // and must share a sequence index; haplotype 2 differs and must
        // get a different one.
        let step = &steps[0];
        assert_eq!(step.hap_to_seq[0], step.hap_to_seq[1]);
        assert_ne!(step.hap_to_seq[0], step.hap_to_seq[2]);
    }

    #[test]
    fn num_symbols_bounds_hap_to_seq_values() {
        let markers = toy_markers(vec![0.0, 0.001, 0.002, 1.0]);
        let alleles = vec![
            vec![0, 0, 1],
            vec![1, 1, 0],
            vec![0, 0, 1],
            vec![1, 1, 1],
        ];
        let steps = build_steps(&markers, &alleles, 1.0);
        let step = &steps[0];
        assert!(step.hap_to_seq.iter().all(|&s| s < step.num_symbols));
    }
}
