//! Component C (and the shared primitive behind component B): the
//! positional Burrows-Wheeler transform and the IBS scanner built on top of
//! it.
//!
//! [`advance`] is the classical Durbin PBWT update generalized to a
//! non-binary alphabet by cascading the textbook two-bucket split over the
//! bits of the per-step symbol value. With `num_symbols <= 2` this is
//! exactly the classical biallelic update (one cascade level), which is
//! what the coded-steps builder (component B) uses per marker; the IBS
//! scanner (this module) drives the same routine once per *step*, over the
//! step-local sequence indices component B produced.

use crate::errors::LaiResult;

/// Prefix-order permutation `a[]` and divergence array `d[]` maintained
/// across an ordered sequence of positions (markers, for component B; steps,
/// for the IBS scanner). `d[i]` is the position at which the match between
/// the haplotypes at sorted ranks `i-1` and `i` began; smaller values mean a
/// longer shared run. Array length is `H`, not `H+1`: the two sentinel edges
/// spec 4.C describes are handled by bounds checks in the callers rather
/// than stored entries, since they never participate in a divergence
/// comparison.
#[derive(Clone, Debug)]
pub struct PrefixDivergence {
    pub a: Vec<u32>,
    pub d: Vec<u32>,
}

impl PrefixDivergence {
    pub fn identity(h: usize, sentinel: u32) -> Self {
        PrefixDivergence {
            a: (0..h as u32).collect(),
            d: vec![sentinel; h],
        }
    }

    pub fn len(&self) -> usize {
        self.a.len()
    }

    pub fn is_empty(&self) -> bool {
        self.a.is_empty()
    }

    /// Rank of haplotype `hap` in the current sort order. `O(H)`; callers
    /// that need many lookups per step should build an inverse index
    /// instead (the IBS scanner does).
    pub fn rank_of(&self, hap: u32) -> Option<usize> {
        self.a.iter().position(|&x| x == hap)
    }

    /// Re-sort `a`/`d` by `symbol[hap]`, a small non-negative integer
    /// alphabet of size `num_symbols`. `position` is the current marker or
    /// step index, used as the "just diverged here" sentinel for brand-new
    /// runs.
    pub fn advance(&mut self, symbol: &[u32], num_symbols: u32, position: u32) {
        advance(&mut self.a, &mut self.d, symbol, num_symbols, position);
    }
}

/// The core generalized PBWT update, exposed standalone so component B can
/// drive it per marker without constructing a [`PrefixDivergence`] per step.
pub fn advance(a: &mut Vec<u32>, d: &mut Vec<u32>, symbol: &[u32], num_symbols: u32, position: u32) {
    if num_symbols <= 1 || a.is_empty() {
        return;
    }
    let bits = 32 - (num_symbols - 1).leading_zeros();
    for bit in (0..bits).rev() {
        let h = a.len();
        let mut a0 = Vec::with_capacity(h);
        let mut a1 = Vec::with_capacity(h);
        let mut d0 = Vec::with_capacity(h);
        let mut d1 = Vec::with_capacity(h);
        let mut p0 = position;
        let mut p1 = position;
        for i in 0..h {
            let div = d[i];
            if div > p0 {
                p0 = div;
            }
            if div > p1 {
                p1 = div;
            }
            let hap = a[i];
            if (symbol[hap as usize] >> bit) & 1 == 0 {
                a0.push(hap);
                d0.push(p0);
                p0 = position;
            } else {
                a1.push(hap);
                d1.push(p1);
                p1 = position;
            }
        }
        a0.extend(a1);
        d0.extend(d1);
        *a = a0;
        *d = d0;
    }
}

/// Up to `k/2` forward (or backward) IBS emissions for one query haplotype
/// at one step. Unused slots are `-1` per spec 4.C.
pub const NO_HAP: i64 = -1;

/// Walk outward from the query's rank, alternating toward whichever
/// boundary currently shows the smaller divergence (spec 4.C's "more
/// recent" boundary; ties favor the lower boundary, matching the
/// composite-state assembler's tie-break policy in 4.D). Reference
/// haplotypes are emitted in walk order; the walk stops at `max_emit`
/// emissions, at an array edge, or once both remaining boundaries'
/// divergence reaches `position` (no historical match left to extend).
pub fn emit_ibs_neighbors(
    pd: &PrefixDivergence,
    rank_of_query: usize,
    position: u32,
    is_reference: impl Fn(u32) -> bool,
    max_emit: usize,
) -> Vec<i64> {
    let h = pd.len();
    let mut out = Vec::with_capacity(max_emit);
    if h == 0 || max_emit == 0 {
        return out;
    }

    // `u` walks upward (smaller ranks); `du` is the divergence of the pair
    // immediately above the current window. `v` walks downward similarly.
    let mut u = rank_of_query;
    let mut du = if u > 0 { pd.d[u] } else { u32::MAX };
    let mut v = rank_of_query + 1;
    let mut dv = if v < h { pd.d[v] } else { u32::MAX };

    while out.len() < max_emit {
        let can_up = u > 0 && du < position;
        let can_down = v < h && dv < position;
        if !can_up && !can_down {
            break;
        }
        // smaller divergence wins; ties favor the lower boundary (`v`).
        let take_down = if can_up && can_down {
            dv <= du
        } else {
            can_down
        };

        if take_down {
            let hap = pd.a[v];
            if is_reference(hap) {
                out.push(hap as i64);
            }
            v += 1;
            dv = if v < h { dv.max(pd.d[v]) } else { u32::MAX };
        } else {
            let hap = pd.a[u - 1];
            if is_reference(hap) {
                out.push(hap as i64);
            }
            u -= 1;
            du = if u > 0 { du.max(pd.d[u]) } else { u32::MAX };
        }
    }
    out
}

/// Result of scanning one direction (forward or backward) over a batch of
/// steps for one query haplotype: for every step in the batch, up to `k/2`
/// emitted reference haplotypes, `-1`-padded.
#[derive(Clone, Debug)]
pub struct IbsEmissions {
    pub per_step: Vec<Vec<i64>>,
}

/// Scan a batch of steps in the given order, updating `pd` in place and
/// collecting emissions for every haplotype in `queries` at every step.
/// `symbols_at` returns the step-local sequence index for every haplotype at
/// a given step index (component B's `hapToSeq`); `num_symbols_at` returns
/// that step's distinct-sequence count.
pub fn scan_steps(
    pd: &mut PrefixDivergence,
    step_order: &[usize],
    symbols_at: impl Fn(usize) -> Vec<u32>,
    num_symbols_at: impl Fn(usize) -> u32,
    queries: &[u32],
    n_target_haps: u32,
    k_per_direction: usize,
) -> LaiResult<Vec<IbsEmissions>> {
    let is_reference = |hap: u32| hap >= n_target_haps;
    let mut results: Vec<IbsEmissions> = queries
        .iter()
        .map(|_| IbsEmissions {
            per_step: Vec::with_capacity(step_order.len()),
        })
        .collect();

    for &step in step_order {
        let symbol = symbols_at(step);
        let num_symbols = num_symbols_at(step);
        pd.advance(&symbol, num_symbols, step as u32);

        for (qi, &q) in queries.iter().enumerate() {
            let rank = pd.rank_of(q).unwrap_or(0);
            let mut emitted = emit_ibs_neighbors(
                pd,
                rank,
                step as u32,
                is_reference,
                k_per_direction,
            );
            while emitted.len() < k_per_direction {
                emitted.push(NO_HAP);
            }
            results[qi].per_step.push(emitted);
        }
    }
    Ok(results)
}
