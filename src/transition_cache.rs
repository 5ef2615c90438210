//! Component E: precompute the per-marker, per-ancestry transition and
//! emission factors the HMM evaluator's hot loop consumes.

use crate::markers::GenDistTable;
use crate::params::ParamSource;

/// All factors needed to run the forward/backward recursion for one
/// chromosome under one parameter bundle. Built once per EM iteration (or
/// once for inference with a fixed model), shared read-only across worker
/// threads.
pub struct TransitionCache {
    pub n_ancestries: usize,
    pub n_panels: usize,
    /// Raw intermarker cM distances, kept alongside the derived curves below
    /// so the EM accumulators can weight switch counts by genetic exposure.
    pub gen_dist: Vec<f64>,
    /// `pRecT[m] = 1 - exp(-0.01 * gen_dist[m] * T)`.
    pub p_rec_t: Vec<f64>,
    /// `1 / (1 - pRecT[m])`; safe because `pRecT < 1` for any finite
    /// positive `T * gen_dist`.
    pub inv_p_no_rec_t: Vec<f64>,
    /// `pRecRho[i][m]`, per ancestry.
    pub p_rec_rho: Vec<Vec<f64>>,
    /// `pNoRecT * pRecRho[i][m]`.
    pub p_no_rec_t_rec_rho: Vec<Vec<f64>>,
    /// `pNoRecT * pNoRecRho[i][m]`.
    pub p_no_rec_t_no_rec_rho: Vec<Vec<f64>>,
    /// `q[i][j] = p[i][j] / nHapsInPanel[j]`.
    pub q: Vec<Vec<f64>>,
    /// `qMu[i][j] = mu[i] * q[i][j]`.
    pub q_mu: Vec<Vec<f64>>,
    /// `pObs[i][j][mismatch]`, mismatch indexed `0` (match) / `1`
    /// (mismatch).
    pub p_obs: Vec<Vec<[f64; 2]>>,
}

impl TransitionCache {
    pub fn build(
        params: &dyn ParamSource,
        gen_dist: &GenDistTable,
        n_haps_in_panel: &[usize],
    ) -> Self {
        let m = gen_dist.len();
        let a = params.n_ancestries();
        let n_panels = n_haps_in_panel.len();

        let p_rec_t = gen_dist.p_rec(params.t());
        let inv_p_no_rec_t = p_rec_t.iter().map(|&r| 1.0 / (1.0 - r)).collect();

        let mut p_rec_rho = Vec::with_capacity(a);
        let mut p_no_rec_t_rec_rho = Vec::with_capacity(a);
        let mut p_no_rec_t_no_rec_rho = Vec::with_capacity(a);
        for i in 0..a {
            let rec_rho = gen_dist.p_rec(params.rho()[i]);
            let no_rec_t_rec_rho: Vec<f64> = (0..m)
                .map(|mi| (1.0 - p_rec_t[mi]) * rec_rho[mi])
                .collect();
            let no_rec_t_no_rec_rho: Vec<f64> = (0..m)
                .map(|mi| (1.0 - p_rec_t[mi]) * (1.0 - rec_rho[mi]))
                .collect();
            p_rec_rho.push(rec_rho);
            p_no_rec_t_rec_rho.push(no_rec_t_rec_rho);
            p_no_rec_t_no_rec_rho.push(no_rec_t_no_rec_rho);
        }

        let mut q = vec![vec![0.0; n_panels]; a];
        let mut q_mu = vec![vec![0.0; n_panels]; a];
        for i in 0..a {
            for j in 0..n_panels {
                let denom = n_haps_in_panel[j].max(1) as f64;
                q[i][j] = params.p()[i][j] / denom;
                q_mu[i][j] = params.mu()[i] * q[i][j];
            }
        }

        let mut p_obs = vec![vec![[0.0; 2]; n_panels]; a];
        for i in 0..a {
            for j in 0..n_panels {
                let theta = params.theta()[i][j];
                p_obs[i][j] = [1.0 - theta, theta];
            }
        }

        TransitionCache {
            n_ancestries: a,
            n_panels,
            gen_dist: gen_dist.gen_dist.clone(),
            p_rec_t,
            inv_p_no_rec_t,
            p_rec_rho,
            p_no_rec_t_rec_rho,
            p_no_rec_t_no_rec_rho,
            q,
            q_mu,
            p_obs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Params;

    fn toy_params() -> Params {
        Params {
            t: 10.0,
            mu: vec![0.5, 0.5],
            p: vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            theta: vec![vec![0.01, 0.01], vec![0.01, 0.01]],
            rho: vec![2.0, 2.0],
        }
    }

    #[test]
    fn p_rec_t_is_zero_at_first_marker() {
        let params = toy_params();
        let gen_dist = GenDistTable::from_cm(&[0.0, 0.5, 1.0]);
        let cache = TransitionCache::build(&params, &gen_dist, &[10, 10]);
        assert_eq!(cache.p_rec_t[0], 0.0);
        assert_eq!(cache.inv_p_no_rec_t[0], 1.0);
    }

    #[test]
    fn q_mu_is_product_of_mu_and_q() {
        let params = toy_params();
        let gen_dist = GenDistTable::from_cm(&[0.0, 0.5, 1.0]);
        let cache = TransitionCache::build(&params, &gen_dist, &[10, 10]);
        for i in 0..2 {
            for j in 0..2 {
                assert!((cache.q_mu[i][j] - params.mu[i] * cache.q[i][j]).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn p_obs_rows_sum_to_one() {
        let params = toy_params();
        let gen_dist = GenDistTable::from_cm(&[0.0, 0.5, 1.0]);
        let cache = TransitionCache::build(&params, &gen_dist, &[10, 10]);
        for i in 0..2 {
            for j in 0..2 {
                let sum: f64 = cache.p_obs[i][j].iter().sum();
                assert!((sum - 1.0).abs() < 1e-12);
            }
        }
    }
}
