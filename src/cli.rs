//! Component 10.C: the CLI surface of spec.md section 6, as a `clap` v4
//! derive `Args`/`Parser` struct. Validation happens immediately after
//! parsing and raises `LaiError::InputValidation` before any file I/O,
//! matching the teacher's fail-fast CLI validation style.

use clap::Parser;

use crate::errors::{LaiError, LaiResult};

#[derive(Parser, Debug, Clone)]
#[command(name = "laihmm", version, about = "Local ancestry inference from phased haplotypes")]
pub struct Cli {
    /// Reference phased genotypes: a VCF path or a bref3 binary reference.
    #[arg(long)]
    pub r#ref: String,

    /// Reference panel map: two whitespace-delimited columns `sampleId panelId`.
    #[arg(long)]
    pub ref_panel: String,

    /// Target phased genotypes (VCF).
    #[arg(long)]
    pub gt: String,

    /// Genetic map, PLINK-style `chrom rsID cM bp`.
    #[arg(long)]
    pub map: String,

    /// Output path prefix; `<out>.vcf.gz`, `<out>.model`, `<out>.global-ancestry.tsv`
    /// are all derived from it.
    #[arg(long)]
    pub out: String,

    /// Optional ancestry->panels map restricting/grouping panels into ancestries.
    #[arg(long)]
    pub gt_ancestries: Option<String>,

    /// Restrict to the listed VCF sample names (comma-separated).
    #[arg(long, value_delimiter = ',')]
    pub gt_samples: Option<Vec<String>>,

    /// Optional pre-estimated model file; skips EM when supplied.
    #[arg(long)]
    pub model: Option<String>,

    /// Optional per-target ancestry proportions file.
    #[arg(long)]
    pub anc_proportions: Option<String>,

    /// Marker IDs to exclude, one per line.
    #[arg(long)]
    pub excludemarkers: Option<String>,

    /// Run EM to estimate parameters (ignored, and a warning logged, when `--model` is set).
    #[arg(long, default_value_t = true)]
    pub em: bool,

    /// Also re-estimate the panel-copying matrix `p` during EM (requires `--em`).
    #[arg(long, default_value_t = false)]
    pub update_p: bool,

    #[arg(long, default_value_t = 20)]
    pub em_its: usize,

    #[arg(long, default_value_t = 100)]
    pub em_haps: usize,

    #[arg(long, default_value_t = 0.3)]
    pub em_anc_prob: f64,

    #[arg(long, default_value_t = 0.03)]
    pub delta_mu: f64,

    #[arg(long, default_value_t = 0.03)]
    pub delta_p: f64,

    #[arg(long, default_value_t = 0.01)]
    pub ibs_step: f64,

    #[arg(long, default_value_t = 2.0)]
    pub ibs_buffer: f64,

    #[arg(long, default_value_t = 4)]
    pub ibs_haps: usize,

    #[arg(long, default_value_t = 4.0)]
    pub ibs_recycle: f64,

    #[arg(long, default_value_t = 100)]
    pub states: usize,

    /// Assume target and reference already share the exact marker set,
    /// skipping the marker-intersection step.
    #[arg(long, default_value_t = false)]
    pub array: bool,

    #[arg(long, default_value_t = 0.0)]
    pub min_maf: f64,

    #[arg(long, default_value_t = 0)]
    pub min_mac: usize,

    /// Emit per-haplotype ancestry-probability vectors (`ANP1`/`ANP2`) in
    /// addition to the argmax call.
    #[arg(long, default_value_t = false)]
    pub probs: bool,

    /// Worker thread count for the per-chromosome target-haplotype pool.
    #[arg(long, default_value_t = 1)]
    pub nthreads: usize,

    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Cross-argument consistency checks that do not require touching any
    /// file (spec 10.C: "update-p requiring em", numeric ranges).
    pub fn validate(&self) -> LaiResult<()> {
        if self.update_p && !self.em {
            return Err(LaiError::invalid("cli arguments", "--update-p requires --em"));
        }
        if self.em_its == 0 {
            return Err(LaiError::invalid("cli arguments", "--em-its must be at least 1"));
        }
        if self.em_haps == 0 {
            return Err(LaiError::invalid("cli arguments", "--em-haps must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.em_anc_prob) {
            return Err(LaiError::invalid("cli arguments", "--em-anc-prob must be in [0,1]"));
        }
        if self.delta_mu < 0.0 || self.delta_p < 0.0 {
            return Err(LaiError::invalid("cli arguments", "--delta-mu/--delta-p must be non-negative"));
        }
        if self.ibs_step <= 0.0 {
            return Err(LaiError::invalid("cli arguments", "--ibs-step must be positive"));
        }
        if self.ibs_buffer < 0.0 {
            return Err(LaiError::invalid("cli arguments", "--ibs-buffer must be non-negative"));
        }
        if self.ibs_haps == 0 {
            return Err(LaiError::invalid("cli arguments", "--ibs-haps must be at least 1"));
        }
        if self.states == 0 {
            return Err(LaiError::invalid("cli arguments", "--states must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.min_maf) {
            return Err(LaiError::invalid("cli arguments", "--min-maf must be in [0,1]"));
        }
        if self.nthreads == 0 {
            return Err(LaiError::invalid("cli arguments", "--nthreads must be at least 1"));
        }
        if self.model.is_some() && self.gt_ancestries.is_some() {
            log::warn!("--gt-ancestries is ignored when --model is supplied");
        }
        Ok(())
    }

    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            _ => log::LevelFilter::Debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_args() -> Vec<&'static str> {
        vec![
            "laihmm",
            "--ref", "ref.vcf.gz",
            "--ref-panel", "panels.txt",
            "--gt", "target.vcf.gz",
            "--map", "map.txt",
            "--out", "out",
        ]
    }

    #[test]
    fn parses_required_arguments_with_defaults() {
        let cli = Cli::try_parse_from(base_args()).unwrap();
        assert_eq!(cli.em_its, 20);
        assert_eq!(cli.states, 100);
        assert!(cli.validate().is_ok());
    }

    #[test]
    fn rejects_update_p_without_em() {
        let mut cli = Cli::try_parse_from(base_args()).unwrap();
        cli.em = false;
        cli.update_p = true;
        assert!(cli.validate().is_err());
    }

    #[test]
    fn rejects_zero_em_its() {
        let mut cli = Cli::try_parse_from(base_args()).unwrap();
        cli.em_its = 0;
        assert!(cli.validate().is_err());
    }
}
