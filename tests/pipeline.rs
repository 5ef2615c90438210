//! End-to-end exercise of the pieces `laihmm.rs` wires together: EM
//! refinement over a synthetic two-panel chromosome, final inference, and
//! the three output writers, round-tripped back through their own parsers.

use std::io::Cursor;

use laihmm::em::{self, EmConfig};
use laihmm::engine::{ChromosomeData, Engine, EngineConfig};
use laihmm::io::global_ancestry::{mean_ancestry, write_global_ancestry};
use laihmm::io::model_file::ModelFile;
use laihmm::io::vcf_writer::{self, SampleMarkerOutput};
use laihmm::markers::{GenDistTable, Markers};
use laihmm::params::{Params, SampleMetadata};

/// Two reference panels (allele `0` vs allele `1`), two target samples: one
/// whose haplotypes are pure panel-0 copies, one that switches from panel 0
/// to panel 1 at the chromosome's midpoint.
fn toy_chromosome(n_markers: usize, n_ref_per_panel: usize) -> (ChromosomeData, SampleMetadata) {
    let bp: Vec<i64> = (0..n_markers as i64).map(|i| i * 1_000).collect();
    let cm: Vec<f64> = (0..n_markers).map(|i| i as f64 * 0.05).collect();
    let markers = Markers {
        chrom: "1".into(),
        bp,
        cm: cm.clone(),
    };
    let gen_dist = GenDistTable::from_cm(&cm);

    let n_ref_haps = 2 * n_ref_per_panel;
    let half = n_markers / 2;
    let mut target_alleles = vec![vec![0u8; 4]; n_markers];
    let mut reference_alleles = vec![vec![0u8; n_ref_haps]; n_markers];
    for m in 0..n_markers {
        let switched = if m < half { 0u8 } else { 1u8 };
        // sample 0: both haplotypes stay panel 0 throughout.
        target_alleles[m][0] = 0;
        target_alleles[m][1] = 0;
        // sample 1: both haplotypes switch to panel 1 past the midpoint.
        target_alleles[m][2] = switched;
        target_alleles[m][3] = switched;
        for h in 0..n_ref_haps {
            reference_alleles[m][h] = if h < n_ref_per_panel { 0 } else { 1 };
        }
    }

    let meta = SampleMetadata {
        n_panels: 2,
        n_ancestries: 2,
        panel_names: vec!["P0".into(), "P1".into()],
        ancestry_names: vec!["A0".into(), "A1".into()],
        hap_panel: (0..n_ref_haps).map(|h| if h < n_ref_per_panel { 0 } else { 1 }).collect(),
        n_haps_in_panel: vec![n_ref_per_panel, n_ref_per_panel],
        ancestry_panels: vec![vec![0], vec![1]],
    };

    let data = ChromosomeData {
        markers,
        gen_dist,
        target_alleles,
        reference_alleles,
        meta: meta.clone(),
    };
    (data, meta)
}

fn toy_engine_config() -> EngineConfig {
    EngineConfig {
        step_cm: 0.1,
        ibs_haps: 4,
        ibs_recycle_cm: 0.4,
        states: 4,
        seed: 11,
        nthreads: 2,
    }
}

#[test]
fn em_refines_mu_toward_each_samples_true_ancestry_mix() {
    let (data, meta) = toy_chromosome(60, 8);
    let config = toy_engine_config();
    let engine = Engine::build(&data, config).unwrap();

    let initial = Params::defaults(&meta);
    let em_config = EmConfig {
        em_its: 15,
        em_haps: 4,
        em_anc_prob: 0.3,
        delta_mu: 1e-4,
        delta_p: 1e-4,
        update_p: false,
        seed: 3,
    };

    let result = em::run_em(initial, engine.n_target_haps(), &em_config, |hap, params| {
        engine.accumulate_one(hap, params, em_config.em_anc_prob)
    });

    // population mean over both samples is 3/4 ancestry 0, 1/4 ancestry 1
    // (sample 0 pure A0, sample 1 half A0/half A1).
    assert!((result.params.mu[0] - 0.75).abs() < 0.15);
    assert!((result.params.mu[1] - 0.25).abs() < 0.15);
}

#[test]
fn infer_all_recovers_the_planted_switch_and_writes_consistent_outputs() {
    let (data, meta) = toy_chromosome(60, 8);
    let config = toy_engine_config();
    let engine = Engine::build(&data, config).unwrap();

    let mut params = Params::defaults(&meta);
    params.p = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
    params.rho = vec![8.0, 8.0];
    params.validate(1e-2).unwrap();

    let results = engine.infer_all(&params);
    assert_eq!(results.len(), 4);

    // sample 0 (haps 0,1): pure panel-0 copy throughout.
    assert_eq!(results[0].argmax[0], 0);
    assert_eq!(results[0].argmax[59], 0);
    // sample 1 (haps 2,3): switches ancestry at the midpoint.
    assert_eq!(results[2].argmax[0], 0);
    assert_eq!(results[2].argmax[59], 1);
    assert_eq!(results[3].argmax[0], 0);
    assert_eq!(results[3].argmax[59], 1);

    let sample_names = vec!["s0".to_string(), "s1".to_string()];
    let ancestry_names = meta.ancestry_names.clone();

    // VCF output: one marker, both samples, probs enabled.
    let header = vcf_writer::build_header(&data.markers.chrom, &sample_names, &ancestry_names, true);
    let tmp = tempfile::NamedTempFile::new().unwrap();
    let path = tmp.path().to_str().unwrap();
    {
        let mut writer = vcf_writer::open_writer(path, &header).unwrap();
        let per_sample: Vec<SampleMarkerOutput> = (0..sample_names.len())
            .map(|s| {
                let r0 = &results[2 * s];
                let r1 = &results[2 * s + 1];
                SampleMarkerOutput {
                    gt: (data.target_alleles[0][2 * s] as i32, data.target_alleles[0][2 * s + 1] as i32),
                    an1: r0.argmax[0] as i32,
                    an2: r1.argmax[0] as i32,
                    anp1: Some(r0.probs[0].clone()),
                    anp2: Some(r1.probs[0].clone()),
                }
            })
            .collect();
        vcf_writer::write_marker(&mut writer, 0, data.markers.bp[0] - 1, ".", &per_sample, true).unwrap();
    }
    assert!(std::fs::metadata(path).unwrap().len() > 0);

    // model file round trip.
    let model = ModelFile {
        ancestry_names: ancestry_names.clone(),
        panel_names: meta.panel_names.clone(),
        params: params.clone(),
    };
    let mut buf = Vec::new();
    model.write(&mut buf).unwrap();
    let reparsed = ModelFile::parse(Cursor::new(buf)).unwrap();
    assert_eq!(reparsed.params, params);
    assert_eq!(reparsed.ancestry_names, ancestry_names);

    // global ancestry TSV: sample 1 should land near 50/50, sample 0 near pure A0.
    let n_ancestries = ancestry_names.len();
    let per_sample: Vec<(String, Vec<f64>)> = sample_names
        .iter()
        .enumerate()
        .map(|(s, name)| {
            let hap0 = results[2 * s].probs.clone();
            let hap1 = results[2 * s + 1].probs.clone();
            (name.clone(), mean_ancestry(&[hap0, hap1], n_ancestries))
        })
        .collect();
    let mut out = Vec::new();
    write_global_ancestry(&mut out, &ancestry_names, &per_sample).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.starts_with("SAMPLE\tA0\tA1\n"));
    assert!(per_sample[0].1[0] > 0.9);
    assert!((per_sample[1].1[1] - 0.5).abs() < 0.2);
}

#[test]
fn infer_all_is_deterministic_across_repeated_builds() {
    let (data, meta) = toy_chromosome(40, 6);
    let config = toy_engine_config();
    let params = {
        let mut p = Params::defaults(&meta);
        p.p = vec![vec![1.0, 0.0], vec![0.0, 1.0]];
        p
    };

    let engine_a = Engine::build(&data, config).unwrap();
    let results_a = engine_a.infer_all(&params);
    let engine_b = Engine::build(&data, config).unwrap();
    let results_b = engine_b.infer_all(&params);

    for (a, b) in results_a.iter().zip(results_b.iter()) {
        assert_eq!(a.argmax, b.argmax);
    }
}
