//! Component J (external collaborator): file-format I/O. These modules are
//! codecs and line-oriented parsers -- algorithmically routine, carrying no
//! inference logic. See spec.md section 6 for every format's grammar.

pub mod ancestry_proportions;
pub mod bref3;
pub mod filters;
pub mod genetic_map;
pub mod global_ancestry;
pub mod model_file;
pub mod panel_map;
pub mod vcf_reader;
pub mod vcf_writer;
