//! `laihmm` binary: wires the CLI surface (`cli`), file I/O (`io`), EM
//! driver (`em`) and orchestration engine (`engine`) together into the
//! end-to-end tool spec.md section 6 describes.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, BufWriter};

use clap::Parser;
use env_logger::Builder;
use rand::rngs::SmallRng;
use rand::seq::index;
use rand::SeedableRng;

use laihmm::accumulators::Accumulators;
use laihmm::cli::Cli;
use laihmm::em::{self, EmConfig};
use laihmm::engine::{ChromosomeData, Engine, EngineConfig, HaplotypeResult};
use laihmm::errors::{LaiError, LaiResult};
use laihmm::io::ancestry_proportions::AncestryProportions;
use laihmm::io::bref3::{self, Bref3File};
use laihmm::io::filters;
use laihmm::io::genetic_map::GeneticMap;
use laihmm::io::global_ancestry::{mean_ancestry, write_global_ancestry};
use laihmm::io::model_file::ModelFile;
use laihmm::io::panel_map::PanelMap;
use laihmm::io::vcf_reader::{self, HaplotypePanel};
use laihmm::io::vcf_writer::{self, SampleMarkerOutput};
use laihmm::markers::{GenDistTable, Markers};
use laihmm::params::{Params, SampleMetadata};

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(e) = cli.validate() {
        fail(&e);
    }

    if let Err(e) = rayon::ThreadPoolBuilder::new()
        .num_threads(cli.nthreads)
        .build_global()
    {
        log::warn!("global thread pool already initialized: {e}");
    }

    match run(&cli) {
        Ok(()) => log::info!("laihmm finished"),
        Err(e) => fail(&e),
    }
}

fn init_logging(cli: &Cli) {
    Builder::new().filter_level(cli.log_level()).init();
}

fn fail(e: &LaiError) -> ! {
    eprintln!("{}", e.labeled_block());
    std::process::exit(1);
}

/// A loaded reference panel: same shape as [`HaplotypePanel`], but reached
/// either through a VCF or a bref3 binary reference.
struct ReferencePanel {
    chrom: String,
    bp: Vec<i64>,
    alleles: Vec<Vec<u8>>,
    sample_names: Vec<String>,
}

fn load_reference(path: &str, chrom: &str, array: bool) -> LaiResult<ReferencePanel> {
    if path.ends_with(".bref3") {
        let file = File::open(path).map_err(|e| LaiError::io(path, e))?;
        let bref = Bref3File::read(BufReader::new(file))?;
        let block = bref
            .blocks
            .into_iter()
            .find(|b| b.chrom == chrom)
            .ok_or_else(|| LaiError::invalid(path, format!("no bref3 block for chromosome {chrom}")))?;
        if !array {
            return Err(LaiError::invalid(
                path,
                "a bref3 reference carries no marker positions to intersect against the target; \
                 pass --array to assert the marker sets already coincide, or supply a VCF reference",
            ));
        }
        let alleles = bref3::decode_block_alleles(&block);
        Ok(ReferencePanel {
            chrom: block.chrom,
            bp: Vec::new(),
            alleles,
            sample_names: bref.samples,
        })
    } else {
        let panel = vcf_reader::read_vcf(path, Some(chrom))?;
        Ok(ReferencePanel {
            chrom: panel.chrom,
            bp: panel.bp,
            alleles: panel.alleles,
            sample_names: panel.sample_names,
        })
    }
}

fn restrict_samples(panel: &mut HaplotypePanel, wanted: &[String]) -> LaiResult<()> {
    let mut keep_haps = Vec::with_capacity(wanted.len() * 2);
    let mut keep_samples = Vec::with_capacity(wanted.len());
    for name in wanted {
        let idx = panel
            .sample_names
            .iter()
            .position(|s| s == name)
            .ok_or_else(|| LaiError::invalid("target VCF", format!("sample {name} not found")))?;
        keep_haps.push(2 * idx);
        keep_haps.push(2 * idx + 1);
        keep_samples.push(name.clone());
    }
    for row in panel.alleles.iter_mut() {
        *row = keep_haps.iter().map(|&h| row[h]).collect();
    }
    panel.sample_names = keep_samples;
    Ok(())
}

/// Ancestry->panels grouping: two whitespace-delimited columns `ancestryId
/// panelId`, repeated rows grouping several panels under one ancestry.
fn parse_ancestry_panels(path: &str, panel_names: &[String]) -> LaiResult<(Vec<String>, Vec<Vec<usize>>)> {
    use std::io::BufRead;
    let file = File::open(path).map_err(|e| LaiError::io(path, e))?;
    let mut ancestry_names: Vec<String> = Vec::new();
    let mut ancestry_panels: Vec<Vec<usize>> = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| LaiError::io(path, e))?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 2 {
            return Err(LaiError::invalid_field(
                path,
                format!("line {}", lineno + 1),
                "expected 2 columns: ancestryId panelId",
            ));
        }
        let (ancestry, panel) = (fields[0], fields[1]);
        let panel_idx = panel_names
            .iter()
            .position(|p| p == panel)
            .ok_or_else(|| LaiError::invalid_field(path, format!("line {}", lineno + 1), format!("unknown panel {panel}")))?;
        let ancestry_idx = match ancestry_names.iter().position(|a| a == ancestry) {
            Some(idx) => idx,
            None => {
                ancestry_names.push(ancestry.to_string());
                ancestry_panels.push(Vec::new());
                ancestry_names.len() - 1
            }
        };
        ancestry_panels[ancestry_idx].push(panel_idx);
    }
    if ancestry_names.len() < 2 {
        return Err(LaiError::invalid(path, "fewer than 2 ancestries"));
    }
    Ok((ancestry_names, ancestry_panels))
}

fn default_ancestry_panels(panel_names: &[String]) -> (Vec<String>, Vec<Vec<usize>>) {
    let ancestry_names = panel_names.to_vec();
    let ancestry_panels = (0..panel_names.len()).map(|i| vec![i]).collect();
    (ancestry_names, ancestry_panels)
}

fn engine_config(cli: &Cli) -> EngineConfig {
    EngineConfig {
        step_cm: cli.ibs_step,
        ibs_haps: cli.ibs_haps,
        ibs_recycle_cm: cli.ibs_recycle,
        states: cli.states,
        seed: cli.seed,
        nthreads: cli.nthreads,
    }
}

/// spec 4.H `initParams` option (ii): for each ancestry, estimate a p row
/// and a rho rate from that ancestry's own reference haplotypes treated as
/// targets of the composite-reference HMM under flat defaults, then merge
/// into a partially-updated bundle. Self-matches in the composite state
/// make this a coarse estimate, good enough as an EM starting point.
fn bootstrap_params(data: &ChromosomeData, config: &EngineConfig) -> LaiResult<Params> {
    let defaults = Params::defaults(&data.meta);
    let mut rng = SmallRng::seed_from_u64(config.seed);
    let mut bootstrap = Vec::with_capacity(data.meta.n_ancestries);

    for (i, panels) in data.meta.ancestry_panels.iter().enumerate() {
        let hap_idxs: Vec<usize> = (0..data.meta.hap_panel.len())
            .filter(|&h| panels.contains(&data.meta.hap_panel[h]))
            .collect();
        if hap_idxs.is_empty() {
            bootstrap.push((defaults.p[i].clone(), defaults.rho[i]));
            continue;
        }
        let sample_n = hap_idxs.len().min(20);
        let chosen: Vec<usize> = index::sample(&mut rng, hap_idxs.len(), sample_n)
            .into_iter()
            .map(|k| hap_idxs[k])
            .collect();

        let bootstrap_target_alleles: Vec<Vec<u8>> = (0..data.n_markers())
            .map(|m| chosen.iter().map(|&h| data.reference_alleles[m][h]).collect())
            .collect();
        let bootstrap_data = ChromosomeData {
            markers: data.markers.clone(),
            gen_dist: data.gen_dist.clone(),
            target_alleles: bootstrap_target_alleles,
            reference_alleles: data.reference_alleles.clone(),
            meta: data.meta.clone(),
        };
        let bootstrap_engine = Engine::build(&bootstrap_data, *config)?;
        let mut acc = Accumulators::zeros(data.meta.n_ancestries, data.meta.n_panels);
        for hap in 0..bootstrap_engine.n_target_haps() as u32 {
            let part = bootstrap_engine.accumulate_one(hap, &defaults, 0.0);
            acc.merge(&part);
        }
        let candidate = acc.estimate(&defaults, true);
        bootstrap.push((candidate.p[i].clone(), candidate.rho[i]));
    }
    Params::partially_updated(&data.meta, bootstrap)
}

fn run(cli: &Cli) -> LaiResult<()> {
    let panel_map = {
        let file = File::open(&cli.ref_panel).map_err(|e| LaiError::io(&cli.ref_panel, e))?;
        PanelMap::parse(BufReader::new(file))?
    };

    let mut target = vcf_reader::read_vcf(&cli.gt, None)?;
    if let Some(samples) = &cli.gt_samples {
        restrict_samples(&mut target, samples)?;
    }
    if target.sample_names.is_empty() {
        return Err(LaiError::invalid(&cli.gt, "no target samples selected"));
    }

    let reference = load_reference(&cli.r#ref, &target.chrom, cli.array)?;
    if reference.sample_names.is_empty() {
        return Err(LaiError::Compatibility("reference panel has no samples".to_string()));
    }
    let target_samples: HashSet<&String> = target.sample_names.iter().collect();
    let overlap: Vec<&String> = reference
        .sample_names
        .iter()
        .filter(|s| target_samples.contains(s))
        .collect();
    if !overlap.is_empty() {
        return Err(LaiError::Compatibility(format!(
            "sample identifier(s) appear in both reference and target: {overlap:?}"
        )));
    }

    let mut hap_panel = Vec::with_capacity(reference.sample_names.len() * 2);
    for sample in &reference.sample_names {
        let panel = panel_map
            .sample_to_panel
            .get(sample)
            .ok_or_else(|| LaiError::invalid(&cli.ref_panel, format!("sample {sample} has no panel assignment")))?;
        let idx = panel_map
            .panel_index(panel)
            .expect("panel present in sample_to_panel is always present in panel_names");
        hap_panel.push(idx);
        hap_panel.push(idx);
    }
    let n_panels = panel_map.panel_names.len();
    if n_panels > 32_767 {
        return Err(LaiError::Compatibility(format!(
            "more than 32767 reference panels ({n_panels})"
        )));
    }
    let mut n_haps_in_panel = vec![0usize; n_panels];
    for &p in &hap_panel {
        n_haps_in_panel[p] += 1;
    }

    let (ancestry_names, ancestry_panels) = if let Some(path) = &cli.gt_ancestries {
        if cli.model.is_none() {
            parse_ancestry_panels(path, &panel_map.panel_names)?
        } else {
            default_ancestry_panels(&panel_map.panel_names)
        }
    } else {
        default_ancestry_panels(&panel_map.panel_names)
    };

    // Marker selection: intersect by bp unless `--array` asserts the two
    // marker sets already coincide, then apply excludemarkers/min-maf/min-mac.
    let (target_idx, reference_idx): (Vec<usize>, Vec<usize>) = if cli.array {
        if target.bp.len() != reference.alleles.len() {
            return Err(LaiError::Compatibility(
                "--array requires the target and reference to have the same marker count".to_string(),
            ));
        }
        ((0..target.bp.len()).collect(), (0..reference.alleles.len()).collect())
    } else {
        filters::intersect_markers(&target.bp, &reference.bp)?
    };

    let excluded: HashSet<String> = match &cli.excludemarkers {
        Some(path) => {
            let file = File::open(path).map_err(|e| LaiError::io(path, e))?;
            filters::parse_exclude_markers(BufReader::new(file))?
        }
        None => HashSet::new(),
    };
    let marker_ids: Vec<String> = target_idx.iter().map(|&t| target.marker_ids[t].clone()).collect();
    let ref_alleles_per_marker: Vec<Vec<u8>> = reference_idx.iter().map(|&r| reference.alleles[r].clone()).collect();
    let keep = filters::keep_mask(&marker_ids, &ref_alleles_per_marker, &excluded, cli.min_maf, cli.min_mac);

    let mut final_bp = Vec::new();
    let mut final_target_alleles = Vec::new();
    let mut final_reference_alleles = Vec::new();
    for (k, &keep_it) in keep.iter().enumerate() {
        if !keep_it {
            continue;
        }
        let t = target_idx[k];
        let r = reference_idx[k];
        final_bp.push(target.bp[t]);
        final_target_alleles.push(target.alleles[t].clone());
        final_reference_alleles.push(ref_alleles_per_marker[k].clone());
    }
    if final_bp.is_empty() {
        return Err(LaiError::Compatibility("no markers survived filtering".to_string()));
    }

    let genetic_map = {
        let file = File::open(&cli.map).map_err(|e| LaiError::io(&cli.map, e))?;
        GeneticMap::parse(BufReader::new(file), &target.chrom)?
    };
    let cm = genetic_map.interpolate(&final_bp);
    let markers = Markers {
        chrom: target.chrom.clone(),
        bp: final_bp,
        cm,
    };
    let gen_dist = GenDistTable::from_cm(&markers.cm);

    let mut meta = SampleMetadata {
        n_panels,
        n_ancestries: ancestry_names.len(),
        panel_names: panel_map.panel_names.clone(),
        ancestry_names: ancestry_names.clone(),
        hap_panel,
        n_haps_in_panel,
        ancestry_panels,
    };

    let config = engine_config(cli);

    let (params, final_ancestry_names, final_panel_names) = if let Some(model_path) = &cli.model {
        let file = File::open(model_path).map_err(|e| LaiError::io(model_path, e))?;
        let model = ModelFile::parse(BufReader::new(file))?;
        if model.panel_names != meta.panel_names {
            return Err(LaiError::Compatibility(format!(
                "model file panel list {:?} does not match reference panel map {:?}",
                model.panel_names, meta.panel_names
            )));
        }
        meta.n_ancestries = model.ancestry_names.len();
        meta.ancestry_names = model.ancestry_names.clone();
        meta.ancestry_panels = vec![Vec::new(); meta.n_ancestries];
        (model.params, model.ancestry_names, model.panel_names)
    } else {
        meta.validate()?;
        let data = ChromosomeData {
            markers: markers.clone(),
            gen_dist: gen_dist.clone(),
            target_alleles: final_target_alleles.clone(),
            reference_alleles: final_reference_alleles.clone(),
            meta: meta.clone(),
        };
        let initial = bootstrap_params(&data, &config)?;
        initial.validate(1e-2)?;

        let engine = Engine::build(&data, config)?;
        let em_config = EmConfig {
            em_its: cli.em_its,
            em_haps: cli.em_haps,
            em_anc_prob: cli.em_anc_prob,
            delta_mu: cli.delta_mu,
            delta_p: cli.delta_p,
            update_p: cli.update_p,
            seed: cli.seed,
        };
        if cli.em {
            let result = em::run_em(initial, engine.n_target_haps(), &em_config, |hap, params| {
                engine.accumulate_one(hap, params, cli.em_anc_prob)
            });
            log::info!(
                "EM finished after {} iteration(s), converged={}",
                result.iterations,
                result.converged
            );
            (result.params, meta.ancestry_names.clone(), meta.panel_names.clone())
        } else {
            (initial, meta.ancestry_names.clone(), meta.panel_names.clone())
        }
    };
    params.validate(1e-2)?;

    let data = ChromosomeData {
        markers,
        gen_dist,
        target_alleles: final_target_alleles,
        reference_alleles: final_reference_alleles,
        meta: meta.clone(),
    };
    let engine = Engine::build(&data, config)?;
    let results: Vec<HaplotypeResult> = engine.infer_all(&params);

    write_outputs(
        cli,
        &data,
        &target.sample_names,
        &final_ancestry_names,
        &final_panel_names,
        &params,
        &results,
    )?;

    if let Some(path) = &cli.anc_proportions {
        let file = File::open(path).map_err(|e| LaiError::io(path, e))?;
        let proportions = AncestryProportions::parse(BufReader::new(file))?;
        check_anc_proportions(&target.sample_names, &results, data.meta.n_ancestries, &proportions);
    }
    Ok(())
}

fn check_anc_proportions(
    sample_names: &[String],
    results: &[HaplotypeResult],
    n_ancestries: usize,
    proportions: &AncestryProportions,
) {
    for (i, sample) in sample_names.iter().enumerate() {
        let Some(expected) = proportions.per_sample.get(sample) else {
            continue;
        };
        let hap0 = &results[2 * i].probs;
        let hap1 = &results[2 * i + 1].probs;
        let observed = mean_ancestry(&[hap0.clone(), hap1.clone()], n_ancestries);
        let max_dev = observed
            .iter()
            .zip(expected.iter())
            .fold(0.0_f64, |worst, (o, e)| worst.max((o - e).abs()));
        if max_dev > 0.1 {
            log::warn!(
                "sample {sample}: inferred global ancestry {observed:?} deviates from \
                 --anc-proportions {expected:?} by up to {max_dev:.3}"
            );
        }
    }
}

fn write_outputs(
    cli: &Cli,
    data: &ChromosomeData,
    sample_names: &[String],
    ancestry_names: &[String],
    panel_names: &[String],
    params: &Params,
    results: &[HaplotypeResult],
) -> LaiResult<()> {
    let vcf_path = format!("{}.vcf", cli.out);
    let header = vcf_writer::build_header(&data.markers.chrom, sample_names, ancestry_names, cli.probs);
    let mut writer = vcf_writer::open_writer(&vcf_path, &header)?;
    for m in 0..data.n_markers() {
        let per_sample: Vec<SampleMarkerOutput> = (0..sample_names.len())
            .map(|s| {
                let r0 = &results[2 * s];
                let r1 = &results[2 * s + 1];
                SampleMarkerOutput {
                    gt: (data.target_alleles[m][2 * s] as i32, data.target_alleles[m][2 * s + 1] as i32),
                    an1: r0.argmax[m] as i32,
                    an2: r1.argmax[m] as i32,
                    anp1: cli.probs.then(|| r0.probs[m].clone()),
                    anp2: cli.probs.then(|| r1.probs[m].clone()),
                }
            })
            .collect();
        vcf_writer::write_marker(&mut writer, 0, data.markers.bp[m] - 1, ".", &per_sample, cli.probs)?;
    }

    let model_path = format!("{}.model", cli.out);
    let model_file = File::create(&model_path).map_err(|e| LaiError::io(&model_path, e))?;
    let model = ModelFile {
        ancestry_names: ancestry_names.to_vec(),
        panel_names: panel_names.to_vec(),
        params: params.clone(),
    };
    model.write(BufWriter::new(model_file))?;

    let global_path = format!("{}.global-ancestry.tsv", cli.out);
    let global_file = File::create(&global_path).map_err(|e| LaiError::io(&global_path, e))?;
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
    write_global_ancestry(BufWriter::new(global_file), ancestry_names, &per_sample)?;

    Ok(())
}
