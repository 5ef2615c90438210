//! Component F: the scaled forward/backward evaluator over the
//! (ancestry x composite-slot) lattice, with the checkpoint + window
//! strategy that bounds backward-pass memory to `O(sqrt(M) * A * S)`.

use crate::composite::SlotObservations;
use crate::errors::{LaiError, LaiResult};
use crate::transition_cache::TransitionCache;
use ndarray::Array2;

/// Everything a per-marker accumulation needs: both lattices at the current
/// marker, the forward mass at the previous marker (needed by the
/// `{T, mu}` sufficient statistic), and the shared cache/observations.
pub struct MarkerContext<'a> {
    pub m: usize,
    pub fwd_prev: &'a Array2<f64>,
    pub fwd_cur: &'a Array2<f64>,
    pub bwd_cur: &'a Array2<f64>,
    pub anc_mass_prev: &'a [f64],
    pub anc_mass_cur: &'a [f64],
    /// Pre-scale sum of `fwd_cur` before it was renormalized to 1, needed to
    /// recover the unnormalized two-slice transition mass for the EM
    /// sufficient-statistic sinks.
    pub fwd_sum: f64,
    pub cache: &'a TransitionCache,
    pub obs: &'a SlotObservations,
}

/// The per-purpose consumer of one marker's forward/backward state (spec
/// 4.F's "modes" / component G's accumulators). Implementors decide what to
/// do with each marker; the evaluator itself is agnostic.
pub trait MarkerSink {
    fn marker(&mut self, ctx: &MarkerContext);
}

/// Reusable per-worker buffers for one evaluator run. Allocated once per
/// worker thread and reused across target haplotypes, per the resource
/// model's "allocate once, reuse" guidance.
pub struct HmmEvaluator {
    n_ancestries: usize,
    window_size: usize,
    bwd_sum: Vec<f64>,
    checkpoints: Vec<Array2<f64>>,
    bwd_window: Vec<Array2<f64>>,
}

impl HmmEvaluator {
    pub fn new(n_markers: usize, n_ancestries: usize, n_slots: usize) -> Self {
        let window_size = (n_markers as f64).sqrt().ceil().max(1.0) as usize;
        let n_windows = (n_markers + window_size - 1) / window_size.max(1);
        HmmEvaluator {
            n_ancestries,
            window_size,
            bwd_sum: vec![0.0; n_markers.max(1)],
            checkpoints: (0..n_windows.max(1))
                .map(|_| Array2::zeros((n_ancestries, n_slots)))
                .collect(),
            bwd_window: (0..window_size.max(1))
                .map(|_| Array2::zeros((n_ancestries, n_slots)))
                .collect(),
        }
    }

    /// Run the full forward/backward evaluation over one target haplotype's
    /// composite state, feeding every marker to `sink` in increasing marker
    /// order.
    pub fn evaluate(
        &mut self,
        cache: &TransitionCache,
        obs: &SlotObservations,
        sink: &mut dyn MarkerSink,
    ) -> LaiResult<()> {
        let m_total = obs.panel.len();
        if m_total == 0 {
            return Ok(());
        }
        let n_slots = obs.panel[0].len();
        let a = self.n_ancestries;

        self.backward_checkpoint_sweep(cache, obs)?;

        let mut fwd_prev = Array2::<f64>::zeros((a, n_slots));
        let mut anc_mass_prev = vec![0.0; a];
        let mut fwd_cur = Array2::<f64>::zeros((a, n_slots));
        let mut anc_mass_cur = vec![0.0; a];

        for m in 0..m_total {
            let fwd_sum = if m == 0 {
                for i in 0..a {
                    for s in 0..n_slots {
                        let j = obs.panel[m][s];
                        fwd_cur[[i, s]] = cache.q_mu[i][j];
                    }
                }
                normalize_lattice(&mut fwd_cur, &mut anc_mass_cur)?
            } else {
                forward_step(&fwd_prev, &anc_mass_prev, cache, obs, m, &mut fwd_cur)?;
                normalize_lattice(&mut fwd_cur, &mut anc_mass_cur)?
            };

            if m % self.window_size == 0 {
                self.recompute_window(cache, obs, m)?;
            }
            let bwd_cur = &self.bwd_window[m % self.window_size];

            let ctx = MarkerContext {
                m,
                fwd_prev: &fwd_prev,
                fwd_cur: &fwd_cur,
                bwd_cur,
                anc_mass_prev: &anc_mass_prev,
                anc_mass_cur: &anc_mass_cur,
                fwd_sum,
                cache,
                obs,
            };
            sink.marker(&ctx);

            std::mem::swap(&mut fwd_prev, &mut fwd_cur);
            anc_mass_prev.copy_from_slice(&anc_mass_cur);
        }
        Ok(())
    }

    /// Single full backward sweep from `M-1` down to `0`, storing only the
    /// per-marker scalar `bwdSum[m]` and a full-lattice checkpoint at the
    /// last marker of each window.
    fn backward_checkpoint_sweep(
        &mut self,
        cache: &TransitionCache,
        obs: &SlotObservations,
    ) -> LaiResult<()> {
        let m_total = obs.panel.len();
        let a = self.n_ancestries;
        let n_slots = obs.panel[0].len();

        let mut bwd_next =
            Array2::<f64>::from_elem((a, n_slots), 1.0 / (a * n_slots.max(1)) as f64);
        let mut bwd_cur = Array2::<f64>::zeros((a, n_slots));
        self.bwd_sum[m_total - 1] = 1.0;

        let window_end_of = |m: usize| {
            let w = m / self.window_size;
            ((w + 1) * self.window_size).min(m_total) - 1
        };
        if window_end_of(m_total - 1) == m_total - 1 {
            let w = (m_total - 1) / self.window_size;
            self.checkpoints[w].assign(&bwd_next);
        }

        for m in (0..m_total - 1).rev() {
            let prescale = backward_step(&bwd_next, cache, obs, m, &mut bwd_cur)?;
            self.bwd_sum[m] = prescale;
            if window_end_of(m) == m {
                let w = m / self.window_size;
                self.checkpoints[w].assign(&bwd_cur);
            }
            std::mem::swap(&mut bwd_next, &mut bwd_cur);
        }
        Ok(())
    }

    /// Recompute the backward window containing marker `m_window_start`
    /// into `self.bwd_window`, starting from the checkpoint at the window's
    /// last marker and recursing backward through it.
    fn recompute_window(
        &mut self,
        cache: &TransitionCache,
        obs: &SlotObservations,
        m_window_start: usize,
    ) -> LaiResult<()> {
        let m_total = obs.panel.len();
        let w = m_window_start / self.window_size;
        let window_end = ((w + 1) * self.window_size).min(m_total) - 1;

        let mut bwd_next = self.checkpoints[w].clone();
        let local_idx = window_end - m_window_start;
        self.bwd_window[local_idx].assign(&bwd_next);

        let mut bwd_cur = Array2::<f64>::zeros(bwd_next.raw_dim());
        for m in (m_window_start..window_end).rev() {
            backward_step(&bwd_next, cache, obs, m, &mut bwd_cur)?;
            self.bwd_window[m - m_window_start].assign(&bwd_cur);
            std::mem::swap(&mut bwd_next, &mut bwd_cur);
        }
        Ok(())
    }
}

/// `fwd[i][s] <- pObs[i][panel(s@m)][mismatch(s@m)] * (scale*fwd_prev[i][s] + shift[panel(s@m)])`
fn forward_step(
    fwd_prev: &Array2<f64>,
    anc_mass_prev: &[f64],
    cache: &TransitionCache,
    obs: &SlotObservations,
    m: usize,
    out: &mut Array2<f64>,
) -> LaiResult<()> {
    let a = cache.n_ancestries;
    let n_slots = obs.panel[m].len();
    for i in 0..a {
        let scale = cache.p_no_rec_t_no_rec_rho[i][m];
        for s in 0..n_slots {
            let j = obs.panel[m][s];
            let shift = cache.p_rec_t[m] * cache.q_mu[i][j]
                + cache.p_no_rec_t_rec_rho[i][m] * anc_mass_prev[i] * cache.q[i][j];
            let mismatch = obs.mismatch[m][s] as usize;
            out[[i, s]] = cache.p_obs[i][j][mismatch] * (scale * fwd_prev[[i, s]] + shift);
        }
    }
    Ok(())
}

/// Backward recursion from marker `m+1` to `m`; `bwd_next` must already
/// hold the (normalized) backward lattice at `m+1`.
fn backward_step(
    bwd_next: &Array2<f64>,
    cache: &TransitionCache,
    obs: &SlotObservations,
    m: usize,
    out: &mut Array2<f64>,
) -> LaiResult<f64> {
    let a = cache.n_ancestries;
    let m_next = m + 1;
    let n_slots = obs.panel[m_next].len();

    // emit_bwd[i][s] = pObs[i][panel(s@m+1)][mismatch(s@m+1)] * bwd_next[i][s]
    let mut emit_bwd = Array2::<f64>::zeros((a, n_slots));
    let mut global_sum = 0.0;
    let mut within_ancestry_sum = vec![0.0; a];
    for i in 0..a {
        for s in 0..n_slots {
            let j = obs.panel[m_next][s];
            let mismatch = obs.mismatch[m_next][s] as usize;
            let v = cache.p_obs[i][j][mismatch] * bwd_next[[i, s]];
            emit_bwd[[i, s]] = v;
            global_sum += cache.q_mu[i][j] * v;
            within_ancestry_sum[i] += cache.q[i][j] * v;
        }
    }

    let mut total = 0.0;
    for i in 0..a {
        let bwd_shift = cache.p_rec_t[m_next] * global_sum
            + cache.p_no_rec_t_rec_rho[i][m_next] * within_ancestry_sum[i];
        let scale = cache.p_no_rec_t_no_rec_rho[i][m_next];
        for s in 0..n_slots {
            let v = bwd_shift + scale * emit_bwd[[i, s]];
            out[[i, s]] = v;
            total += v;
        }
    }
    if total <= 0.0 || !total.is_finite() {
        return Err(LaiError::internal(
            "backward pass produced a non-positive or non-finite scaling sum",
        ));
    }
    out.mapv_inplace(|v| v / total);
    Ok(total)
}

/// Rescale `lattice` to sum to 1 and return the pre-scale sum; also fills
/// `anc_mass` with the post-scale per-ancestry marginal.
fn normalize_lattice(lattice: &mut Array2<f64>, anc_mass: &mut [f64]) -> LaiResult<f64> {
    let total: f64 = lattice.sum();
    if total <= 0.0 || !total.is_finite() {
        return Err(LaiError::internal(
            "forward pass produced a non-positive or non-finite scaling sum",
        ));
    }
    lattice.mapv_inplace(|v| v / total);
    for (i, row) in lattice.rows().into_iter().enumerate() {
        anc_mass[i] = row.sum();
    }
    Ok(total)
}
