//! Component I: the immutable parameter bundle and sample metadata.
//!
//! The HMM evaluator and the EM estimator both consume parameters only
//! through the [`ParamSource`] trait, never through whichever concrete path
//! produced them (defaults, a model file, a per-ancestry bootstrap, a fresh
//! EM estimate, or a partially-updated merge of a bootstrap with defaults).
//! [`ParamProvenance`] exists purely so logging and the model-file writer
//! can say where a bundle came from; nothing downstream inspects it.

use crate::errors::{LaiError, LaiResult};

/// `T`, `mu`, `p`, `theta`, `rho` -- generations since admixture, global
/// ancestry proportions, panel-copying probabilities, miscopy rates, and
/// pre-admixture switch rates. See spec section 3.
#[derive(Clone, Debug, PartialEq)]
pub struct Params {
    pub t: f64,
    pub mu: Vec<f64>,
    pub p: Vec<Vec<f64>>,
    pub theta: Vec<Vec<f64>>,
    pub rho: Vec<f64>,
}

/// Where a [`Params`] bundle came from. Informational only -- carried for
/// logging and for the model-file header, never branched on by the HMM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParamProvenance {
    Defaults,
    ModelFile,
    PerAncestryBootstrap,
    EmEstimated { iterations: usize },
    PartiallyUpdated,
}

/// The capability set the HMM evaluator and EM estimator depend on. Any
/// concrete way of obtaining a parameter bundle need only produce a
/// [`Params`] value; this trait is the seam Design Note 9 asks for, kept
/// thin because `Params` itself is already an immutable value type.
pub trait ParamSource {
    fn t(&self) -> f64;
    fn mu(&self) -> &[f64];
    fn p(&self) -> &[Vec<f64>];
    fn theta(&self) -> &[Vec<f64>];
    fn rho(&self) -> &[f64];
    fn n_ancestries(&self) -> usize {
        self.mu().len()
    }
}

impl ParamSource for Params {
    fn t(&self) -> f64 {
        self.t
    }
    fn mu(&self) -> &[f64] {
        &self.mu
    }
    fn p(&self) -> &[Vec<f64>] {
        &self.p
    }
    fn theta(&self) -> &[Vec<f64>] {
        &self.theta
    }
    fn rho(&self) -> &[f64] {
        &self.rho
    }
}

impl Params {
    /// Flat, uninformative starting point: uniform mu, uniform p restricted
    /// to each ancestry's allowed panels, a fixed miscopy rate, T=8, rho=T.
    pub fn defaults(meta: &SampleMetadata) -> Self {
        let a = meta.n_ancestries;
        let n_panels = meta.n_panels;
        let mu = vec![1.0 / a as f64; a];
        let p = (0..a)
            .map(|i| {
                let allowed = &meta.ancestry_panels[i];
                let w = 1.0 / allowed.len().max(1) as f64;
                let mut row = vec![0.0; n_panels];
                for &j in allowed {
                    row[j] = w;
                }
                row
            })
            .collect();
        let theta = vec![vec![0.001; n_panels]; a];
        let rho = vec![8.0; a];
        Params {
            t: 8.0,
            mu,
            p,
            theta,
            rho,
        }
    }

    /// Merge a per-ancestry bootstrap's `p` row and `rho` entry into a
    /// bundle that otherwise holds defaults, per spec 4.H `initParams`
    /// option (ii). `bootstrap` supplies one `(p_row, rho)` pair per
    /// ancestry, in ancestry order.
    pub fn partially_updated(
        meta: &SampleMetadata,
        bootstrap: Vec<(Vec<f64>, f64)>,
    ) -> LaiResult<Self> {
        let mut params = Params::defaults(meta);
        if bootstrap.len() != meta.n_ancestries {
            return Err(LaiError::internal(
                "bootstrap parameter count does not match ancestry count",
            ));
        }
        for (i, (p_row, rho)) in bootstrap.into_iter().enumerate() {
            params.p[i] = p_row;
            params.rho[i] = rho;
        }
        Ok(params)
    }

    /// Validate the invariants spec section 3 requires: `mu` and every row
    /// of `p` are probability simplices (tolerance `1e-2`, per the model
    /// file's documented tolerance), `theta` entries are in `[0, 1]`, and
    /// `rho`/`T` are finite and strictly positive.
    pub fn validate(&self, tolerance: f64) -> LaiResult<()> {
        let sum_mu: f64 = self.mu.iter().sum();
        if (sum_mu - 1.0).abs() > tolerance {
            return Err(LaiError::invalid(
                "model",
                format!("mu sums to {sum_mu}, expected 1.0 +/- {tolerance}"),
            ));
        }
        for (i, row) in self.p.iter().enumerate() {
            let sum: f64 = row.iter().sum();
            if (sum - 1.0).abs() > tolerance {
                return Err(LaiError::invalid(
                    "model",
                    format!("p row {i} sums to {sum}, expected 1.0 +/- {tolerance}"),
                ));
            }
        }
        for row in &self.theta {
            for &v in row {
                if !(0.0..=1.0).contains(&v) {
                    return Err(LaiError::invalid("model", "theta entry outside [0,1]"));
                }
            }
        }
        if !self.t.is_finite() || self.t <= 0.0 {
            return Err(LaiError::invalid("model", "T must be finite and positive"));
        }
        for &r in &self.rho {
            if !r.is_finite() || r <= 0.0 {
                return Err(LaiError::invalid(
                    "model",
                    "rho entries must be finite and positive",
                ));
            }
        }
        Ok(())
    }
}

/// Sample/panel/ancestry bookkeeping that accompanies a [`Params`] bundle.
/// Immutable once constructed from the reference panel map and (optional)
/// ancestry-panel allowlist.
#[derive(Clone, Debug)]
pub struct SampleMetadata {
    pub n_panels: usize,
    pub n_ancestries: usize,
    pub panel_names: Vec<String>,
    pub ancestry_names: Vec<String>,
    /// `hap_panel[h]` is the panel index of reference haplotype `h` (0-based
    /// within the reference haplotype block, i.e. indices `[0, H - 2*nTarg)`).
    pub hap_panel: Vec<usize>,
    /// Reference haplotype count per panel; never zero for a panel that
    /// appears in any ancestry's allowlist (spec section 3 invariant).
    pub n_haps_in_panel: Vec<usize>,
    /// `ancestry_panels[i]` lists the panel indices ancestry `i` may copy
    /// from. A bijection (one panel per ancestry) when no explicit
    /// ancestry map was supplied.
    pub ancestry_panels: Vec<Vec<usize>>,
}

impl SampleMetadata {
    pub fn validate(&self) -> LaiResult<()> {
        if self.n_ancestries < 2 {
            return Err(LaiError::invalid(
                "ref-panel/ancestry map",
                "fewer than 2 ancestries",
            ));
        }
        if self.n_panels > 32_767 {
            return Err(LaiError::Compatibility(format!(
                "more than 32767 reference panels ({})",
                self.n_panels
            )));
        }
        for (i, panels) in self.ancestry_panels.iter().enumerate() {
            for &j in panels {
                if self.n_haps_in_panel[j] == 0 {
                    return Err(LaiError::invalid(
                        "ancestry map",
                        format!(
                            "ancestry {} allows panel {} which has no reference haplotypes",
                            self.ancestry_names.get(i).cloned().unwrap_or_default(),
                            self.panel_names.get(j).cloned().unwrap_or_default()
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toy_meta() -> SampleMetadata {
        SampleMetadata {
            n_panels: 2,
            n_ancestries: 2,
            panel_names: vec!["P0".into(), "P1".into()],
            ancestry_names: vec!["A0".into(), "A1".into()],
            hap_panel: vec![0, 0, 1, 1],
            n_haps_in_panel: vec![2, 2],
            ancestry_panels: vec![vec![0], vec![1]],
        }
    }

    #[test]
    fn defaults_are_valid_simplices() {
        let meta = toy_meta();
        let params = Params::defaults(&meta);
        params.validate(1e-9).unwrap();
    }

    #[test]
    fn validate_rejects_bad_mu() {
        let meta = toy_meta();
        let mut params = Params::defaults(&meta);
        params.mu = vec![0.4, 0.4];
        assert!(params.validate(1e-2).is_err());
    }

    #[test]
    fn metadata_rejects_empty_allowed_panel() {
        let mut meta = toy_meta();
        meta.n_haps_in_panel[0] = 0;
        assert!(meta.validate().is_err());
    }
}
