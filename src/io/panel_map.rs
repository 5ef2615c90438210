//! Reference panel map: plain-text, two whitespace-delimited columns
//! `sampleId panelId` (spec.md section 6).

use std::collections::HashMap;
use std::io::BufRead;

use crate::errors::{LaiError, LaiResult};

/// `sample_to_panel[sampleId] = panelId`, plus the panel names in first-seen
/// order (used to assign stable panel indices).
pub struct PanelMap {
    pub sample_to_panel: HashMap<String, String>,
    pub panel_names: Vec<String>,
}

impl PanelMap {
    pub fn parse<R: BufRead>(reader: R) -> LaiResult<Self> {
        let mut sample_to_panel = HashMap::new();
        let mut panel_names: Vec<String> = Vec::new();

        for (lineno, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| LaiError::io("reference panel map", e))?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 2 {
                return Err(LaiError::invalid_field(
                    "reference panel map",
                    format!("line {}", lineno + 1),
                    "expected exactly 2 columns: sampleId panelId",
                ));
            }
            let (sample, panel) = (fields[0].to_string(), fields[1].to_string());
            if sample_to_panel.contains_key(&sample) {
                return Err(LaiError::invalid_field(
                    "reference panel map",
                    format!("line {}", lineno + 1),
                    format!("sample {sample} appears more than once"),
                ));
            }
            if !panel_names.contains(&panel) {
                panel_names.push(panel.clone());
            }
            sample_to_panel.insert(sample, panel);
        }
        Ok(PanelMap {
            sample_to_panel,
            panel_names,
        })
    }

    pub fn panel_index(&self, panel: &str) -> Option<usize> {
        self.panel_names.iter().position(|p| p == panel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sample_panel_pairs_and_orders_panels_by_first_sight() {
        let text = "s1 P1\ns2 P0\ns3 P1\n";
        let map = PanelMap::parse(text.as_bytes()).unwrap();
        assert_eq!(map.panel_names, vec!["P1".to_string(), "P0".to_string()]);
        assert_eq!(map.sample_to_panel.get("s2"), Some(&"P0".to_string()));
    }

    #[test]
    fn rejects_duplicate_sample_rows() {
        let text = "s1 P1\ns1 P0\n";
        assert!(PanelMap::parse(text.as_bytes()).is_err());
    }
}
