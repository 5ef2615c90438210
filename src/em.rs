//! Component H: the EM driver (spec 4.H), at the same contract level as the
//! spec's language-neutral pseudocode -- it knows nothing about how a single
//! target haplotype's accumulator contribution is computed (that is the
//! composite assembler + HMM evaluator's job, wired in by `engine`), only how
//! to iterate, select, reduce, and check convergence.

use rand::rngs::SmallRng;
use rand::seq::index;
use rand::SeedableRng;
use rayon::prelude::*;

use crate::accumulators::Accumulators;
use crate::params::Params;

/// The numeric knobs spec section 6 names for the EM driver.
#[derive(Clone, Debug)]
pub struct EmConfig {
    pub em_its: usize,
    pub em_haps: usize,
    pub em_anc_prob: f64,
    pub delta_mu: f64,
    pub delta_p: f64,
    pub update_p: bool,
    pub seed: u64,
}

impl Default for EmConfig {
    fn default() -> Self {
        EmConfig {
            em_its: 20,
            em_haps: 100,
            em_anc_prob: 0.3,
            delta_mu: 0.03,
            delta_p: 0.03,
            update_p: false,
            seed: 0,
        }
    }
}

/// Outcome of a completed EM run: the final parameter bundle and the number
/// of iterations actually performed (`< em_its` if convergence was declared
/// early).
pub struct EmResult {
    pub params: Params,
    pub iterations: usize,
    pub converged: bool,
}

/// Run EM to convergence (or `config.em_its` iterations). `accumulate_one`
/// computes one target haplotype's contribution to the sufficient
/// statistics under the current parameter bundle; it is called concurrently
/// across the iteration's selected subset (spec 5's "fixed-size thread pool,
/// one worker per target haplotype" -- `rayon`'s work-stealing pool plays
/// that role here, as the teacher's hot numeric loops already use it).
pub fn run_em(
    initial: Params,
    n_target_haps: usize,
    config: &EmConfig,
    accumulate_one: impl Fn(u32, &Params) -> Accumulators + Sync,
) -> EmResult {
    let a = initial.mu.len();
    let n_panels = initial.p.first().map(|row| row.len()).unwrap_or(0);
    let mut params = initial;
    let mut rng = SmallRng::seed_from_u64(config.seed);
    let mut converged = false;
    let mut iterations_run = 0;

    for _iter in 0..config.em_its {
        iterations_run += 1;
        let selected = select_subset(n_target_haps, config.em_haps, &mut rng);

        let acc = selected
            .par_iter()
            .map(|&hap| accumulate_one(hap, &params))
            .reduce(
                || Accumulators::zeros(a, n_panels),
                |mut merged, part| {
                    merged.merge(&part);
                    merged
                },
            );

        let candidate = acc.estimate(&params, config.update_p);

        let delta_mu = params
            .mu
            .iter()
            .zip(candidate.mu.iter())
            .fold(0.0_f64, |worst, (old, new)| worst.max((old - new).abs()));
        let delta_p = if config.update_p {
            params
                .p
                .iter()
                .zip(candidate.p.iter())
                .flat_map(|(old_row, new_row)| old_row.iter().zip(new_row.iter()))
                .fold(0.0_f64, |worst, (old, new)| worst.max((old - new).abs()))
        } else {
            0.0
        };

        params = candidate;

        if delta_mu <= config.delta_mu && (!config.update_p || delta_p <= config.delta_p) {
            converged = true;
            break;
        }
    }

    EmResult {
        params,
        iterations: iterations_run,
        converged,
    }
}

/// A deterministic PRNG-seeded subset of `[0, n)` of size `min(k, n)`,
/// without replacement, per spec 4.H "Random subsets use a deterministic
/// PRNG seeded by the user-supplied seed."
fn select_subset(n: usize, k: usize, rng: &mut SmallRng) -> Vec<u32> {
    if k >= n {
        return (0..n as u32).collect();
    }
    index::sample(rng, n, k).into_iter().map(|i| i as u32).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn toy_params() -> Params {
        Params {
            t: 8.0,
            mu: vec![0.5, 0.5],
            p: vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            theta: vec![vec![0.01, 0.01], vec![0.01, 0.01]],
            rho: vec![8.0, 8.0],
        }
    }

    #[test]
    fn select_subset_is_deterministic_given_seed() {
        let mut rng_a = SmallRng::seed_from_u64(42);
        let mut rng_b = SmallRng::seed_from_u64(42);
        let a = select_subset(1000, 50, &mut rng_a);
        let b = select_subset(1000, 50, &mut rng_b);
        assert_eq!(a, b);
    }

    #[test]
    fn select_subset_caps_at_population_size() {
        let mut rng = SmallRng::seed_from_u64(1);
        let subset = select_subset(5, 50, &mut rng);
        assert_eq!(subset.len(), 5);
    }

    #[test]
    fn run_em_converges_when_accumulator_reproduces_current_params() {
        // An accumulator that always reports perfect confirmation of the
        // current mu converges on iteration 1.
        let config = EmConfig {
            em_its: 5,
            em_haps: 10,
            update_p: false,
            ..EmConfig::default()
        };
        let params = toy_params();
        let mu = params.mu.clone();
        let result = run_em(params, 20, &config, move |_hap, _params| {
            let mut acc = Accumulators::zeros(2, 2);
            acc.state_probs[0][0] = mu[0] * 10.0;
            acc.state_probs[1][1] = mu[1] * 10.0;
            acc.sum_rho_switch = vec![1.0, 1.0];
            acc.sum_rho_gen_dist = vec![1.0, 1.0];
            acc.sum_t_switch = 1.0;
            acc.sum_t_gen_dist = 1.0;
            acc
        });
        assert!(result.converged);
        assert_eq!(result.iterations, 1);
    }

    #[test]
    fn run_em_calls_accumulate_once_per_selected_haplotype_per_iteration() {
        let calls = std::sync::Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let config = EmConfig {
            em_its: 3,
            em_haps: 4,
            update_p: false,
            delta_mu: -1.0, // never converge
            ..EmConfig::default()
        };
        let params = toy_params();
        let _ = run_em(params, 10, &config, move |_hap, _params| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Accumulators::zeros(2, 2)
        });
        assert_eq!(calls.load(Ordering::SeqCst), 3 * 4);
    }
}
