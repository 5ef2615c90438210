//! Component G: the per-purpose consumers of the forward/backward evaluator
//! (spec 4.F "Modes") and the thread-safe accumulators they feed.

use crate::hmm::{MarkerContext, MarkerSink};
use crate::params::Params;

/// Mode (i): collect the normalized ancestry posterior at every marker.
/// `posteriors[m][i]`.
pub struct PosteriorSink {
    pub posteriors: Vec<Vec<f64>>,
}

impl PosteriorSink {
    pub fn with_capacity(n_markers: usize) -> Self {
        PosteriorSink {
            posteriors: Vec::with_capacity(n_markers),
        }
    }
}

impl MarkerSink for PosteriorSink {
    fn marker(&mut self, ctx: &MarkerContext) {
        let a = ctx.fwd_cur.shape()[0];
        let n_slots = ctx.fwd_cur.shape()[1];
        let mut post = vec![0.0; a];
        for i in 0..a {
            let mut mass = 0.0;
            for s in 0..n_slots {
                mass += ctx.fwd_cur[[i, s]] * ctx.bwd_cur[[i, s]];
            }
            post[i] = mass;
        }
        let total: f64 = post.iter().sum();
        if total > 0.0 {
            for v in post.iter_mut() {
                *v /= total;
            }
        }
        self.posteriors.push(post);
    }
}

/// Modes (ii) and (iii) combined: the {mu, T} and {rho, p} sufficient
/// statistics share the same forward/backward lattices at every marker, so
/// one evaluator pass accumulates both rather than running the evaluator
/// twice per target haplotype.
///
/// `state_probs[i][j]` is the mu-free occupancy weight spec 4.G's `mu_new`
/// and `p_new` both read from; `sum_rho_switch`/`sum_rho_gen_dist` and
/// `sum_t_switch`/`sum_t_gen_dist` are the rate-estimator numerator/
/// denominator pairs spec 4.G's `rho_new`/`T_new` read from.
#[derive(Clone, Debug)]
pub struct Accumulators {
    pub state_probs: Vec<Vec<f64>>,
    pub sum_rho_switch: Vec<f64>,
    pub sum_rho_gen_dist: Vec<f64>,
    pub sum_t_switch: f64,
    pub sum_t_gen_dist: f64,
}

impl Accumulators {
    pub fn zeros(n_ancestries: usize, n_panels: usize) -> Self {
        Accumulators {
            state_probs: vec![vec![0.0; n_panels]; n_ancestries],
            sum_rho_switch: vec![0.0; n_ancestries],
            sum_rho_gen_dist: vec![0.0; n_ancestries],
            sum_t_switch: 0.0,
            sum_t_gen_dist: 0.0,
        }
    }

    /// Fold another worker's partial accumulator into this one. Commutative
    /// and associative, per spec 5's "commutative numeric adds" -- callers
    /// reduce per-thread partials in any order.
    pub fn merge(&mut self, other: &Accumulators) {
        for i in 0..self.state_probs.len() {
            for j in 0..self.state_probs[i].len() {
                self.state_probs[i][j] += other.state_probs[i][j];
            }
            self.sum_rho_switch[i] += other.sum_rho_switch[i];
            self.sum_rho_gen_dist[i] += other.sum_rho_gen_dist[i];
        }
        self.sum_t_switch += other.sum_t_switch;
        self.sum_t_gen_dist += other.sum_t_gen_dist;
    }

    /// spec 4.G's final normalization, with fallback-to-previous-iterate
    /// guards on every degenerate case.
    pub fn estimate(&self, previous: &Params, update_p: bool) -> Params {
        let a = self.state_probs.len();

        let total_state: f64 = self.state_probs.iter().flatten().sum();
        let mu = if total_state > 0.0 {
            self.state_probs
                .iter()
                .map(|row| row.iter().sum::<f64>() / total_state)
                .collect()
        } else {
            previous.mu.clone()
        };

        let p = if update_p {
            (0..a)
                .map(|i| {
                    let row_total: f64 = self.state_probs[i].iter().sum();
                    if row_total > 0.0 {
                        self.state_probs[i].iter().map(|&v| v / row_total).collect()
                    } else {
                        previous.p[i].clone()
                    }
                })
                .collect()
        } else {
            previous.p.clone()
        };

        let rho = (0..a)
            .map(|i| {
                let candidate = self.sum_rho_switch[i] / self.sum_rho_gen_dist[i];
                if candidate.is_finite() && candidate > 0.0 {
                    candidate
                } else {
                    previous.rho[i]
                }
            })
            .collect();

        let t_candidate = self.sum_t_switch / self.sum_t_gen_dist;
        let t = if t_candidate.is_finite() && t_candidate > 0.0 {
            t_candidate
        } else {
            previous.t
        };

        Params {
            t,
            mu,
            p,
            theta: previous.theta.clone(),
            rho,
        }
    }
}

/// Per-worker sink that drives one target haplotype's contribution to a
/// private [`Accumulators`], merged into the global totals once the worker
/// finishes its queue slice (spec 5: per-thread partials, reduced at the
/// end, no locking in the hot loop).
pub struct EmStatsSink<'a> {
    pub acc: &'a mut Accumulators,
    pub em_anc_prob: f64,
}

impl<'a> MarkerSink for EmStatsSink<'a> {
    fn marker(&mut self, ctx: &MarkerContext) {
        let a = ctx.fwd_cur.shape()[0];
        let n_slots = ctx.fwd_cur.shape()[1];
        let m = ctx.m;

        // Posterior ancestry mass at this marker, used both to gate
        // low-confidence state-occupancy contributions and to weight the
        // rho exposure denominator.
        let mut anc_post = vec![0.0; a];
        for i in 0..a {
            let mut mass = 0.0;
            for s in 0..n_slots {
                mass += ctx.fwd_cur[[i, s]] * ctx.bwd_cur[[i, s]];
            }
            anc_post[i] = mass;
        }
        let post_total: f64 = anc_post.iter().sum();
        if post_total > 0.0 {
            for v in anc_post.iter_mut() {
                *v /= post_total;
            }
        }

        for i in 0..a {
            if anc_post[i] < self.em_anc_prob {
                continue;
            }
            for s in 0..n_slots {
                let j = ctx.obs.panel[m][s];
                self.acc.state_probs[i][j] += ctx.fwd_cur[[i, s]] * ctx.bwd_cur[[i, s]] / post_total.max(f64::MIN_POSITIVE);
            }
        }

        // Transition-level statistics need the joint two-slice posterior
        // between m-1 and m; nothing to accumulate at the first marker.
        if m == 0 {
            return;
        }
        let cache = ctx.cache;
        let gen_dist = cache.gen_dist[m];

        // Total unnormalized two-slice mass, recovered via fwd_sum (the
        // pre-scale sum `fwd_cur` was divided by) since fwd_cur/bwd_cur are
        // each separately renormalized to 1.
        let mut joint_total = 0.0;
        for i in 0..a {
            for s in 0..n_slots {
                joint_total += ctx.fwd_cur[[i, s]] * ctx.bwd_cur[[i, s]];
            }
        }
        let z = ctx.fwd_sum * joint_total;
        if !(z > 0.0) {
            return;
        }

        let mut jump_num = 0.0;
        let mut switch_num = vec![0.0; a];
        for i in 0..a {
            for s in 0..n_slots {
                let j = ctx.obs.panel[m][s];
                let mismatch = ctx.obs.mismatch[m][s] as usize;
                let p_obs = cache.p_obs[i][j][mismatch];
                let bwd = ctx.bwd_cur[[i, s]];

                jump_num += p_obs * cache.p_rec_t[m] * cache.q_mu[i][j] * bwd;
                switch_num[i] += p_obs
                    * cache.p_no_rec_t_rec_rho[i][m]
                    * ctx.anc_mass_prev[i]
                    * cache.q[i][j]
                    * bwd;
            }
        }

        self.acc.sum_t_switch += jump_num / z;
        self.acc.sum_t_gen_dist += gen_dist;

        for i in 0..a {
            self.acc.sum_rho_switch[i] += switch_num[i] / z;
            self.acc.sum_rho_gen_dist[i] += gen_dist * anc_post[i];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composite::SlotObservations;
    use crate::hmm::HmmEvaluator;
    use crate::markers::GenDistTable;
    use crate::transition_cache::TransitionCache;

    fn toy_cache_and_obs(m: usize) -> (TransitionCache, SlotObservations) {
        let params = Params {
            t: 10.0,
            mu: vec![0.5, 0.5],
            p: vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            theta: vec![vec![0.01, 0.01], vec![0.01, 0.01]],
            rho: vec![2.0, 2.0],
        };
        let cm: Vec<f64> = (0..m).map(|i| i as f64 * 0.01).collect();
        let gen_dist = GenDistTable::from_cm(&cm);
        let cache = TransitionCache::build(&params, &gen_dist, &[10, 10]);
        let panel = vec![vec![0usize, 1usize]; m];
        let mismatch = vec![vec![0u8, 0u8]; m];
        (cache, SlotObservations { panel, mismatch })
    }

    #[test]
    fn posterior_sink_produces_one_row_per_marker() {
        let m = 20;
        let (cache, obs) = toy_cache_and_obs(m);
        let mut evaluator = HmmEvaluator::new(m, 2, 2);
        let mut sink = PosteriorSink::with_capacity(m);
        evaluator.evaluate(&cache, &obs, &mut sink).unwrap();
        assert_eq!(sink.posteriors.len(), m);
        for post in &sink.posteriors {
            let sum: f64 = post.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn em_stats_sink_accumulates_nonnegative_state_probs() {
        let m = 20;
        let (cache, obs) = toy_cache_and_obs(m);
        let mut evaluator = HmmEvaluator::new(m, 2, 2);
        let mut acc = Accumulators::zeros(2, 2);
        {
            let mut sink = EmStatsSink {
                acc: &mut acc,
                em_anc_prob: 0.0,
            };
            evaluator.evaluate(&cache, &obs, &mut sink).unwrap();
        }
        for row in &acc.state_probs {
            for &v in row {
                assert!(v >= 0.0);
            }
        }
        assert!(acc.sum_t_gen_dist > 0.0);
        assert!(acc.sum_rho_gen_dist.iter().all(|&v| v >= 0.0));
    }

    #[test]
    fn estimate_falls_back_to_previous_on_zero_accumulator() {
        let previous = Params {
            t: 7.0,
            mu: vec![0.4, 0.6],
            p: vec![vec![0.9, 0.1], vec![0.2, 0.8]],
            theta: vec![vec![0.01, 0.01], vec![0.01, 0.01]],
            rho: vec![3.0, 4.0],
        };
        let acc = Accumulators::zeros(2, 2);
        let estimated = acc.estimate(&previous, true);
        assert_eq!(estimated.mu, previous.mu);
        assert_eq!(estimated.rho, previous.rho);
        assert_eq!(estimated.t, previous.t);
    }

    #[test]
    fn estimate_leaves_p_untouched_when_update_p_is_false() {
        let previous = Params {
            t: 7.0,
            mu: vec![0.4, 0.6],
            p: vec![vec![0.9, 0.1], vec![0.2, 0.8]],
            theta: vec![vec![0.01, 0.01], vec![0.01, 0.01]],
            rho: vec![3.0, 4.0],
        };
        let mut acc = Accumulators::zeros(2, 2);
        acc.state_probs = vec![vec![5.0, 1.0], vec![1.0, 5.0]];
        let estimated = acc.estimate(&previous, false);
        assert_eq!(estimated.p, previous.p);
        assert_ne!(estimated.mu, previous.mu);
    }
}
