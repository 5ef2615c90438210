//! Optional per-target ancestry proportions file: header `SAMPLE <ancestries>`
//! then one row per sample with proportions summing to 1 (tolerance 0.01).

use std::collections::HashMap;
use std::io::BufRead;

use crate::errors::{LaiError, LaiResult};

pub struct AncestryProportions {
    pub ancestry_names: Vec<String>,
    /// `per_sample[sample] = proportions`, in `ancestry_names` order.
    pub per_sample: HashMap<String, Vec<f64>>,
}

impl AncestryProportions {
    pub fn parse<R: BufRead>(reader: R) -> LaiResult<Self> {
        let mut lines = reader.lines();
        let header = lines
            .next()
            .ok_or_else(|| LaiError::invalid("ancestry proportions file", "missing header"))?
            .map_err(|e| LaiError::io("ancestry proportions file", e))?;
        let header_fields: Vec<&str> = header.split_whitespace().collect();
        if header_fields.first() != Some(&"SAMPLE") {
            return Err(LaiError::invalid(
                "ancestry proportions file",
                "header must start with SAMPLE",
            ));
        }
        let ancestry_names: Vec<String> = header_fields[1..].iter().map(|s| s.to_string()).collect();
        let a = ancestry_names.len();

        let mut per_sample = HashMap::new();
        for (lineno, line) in lines.enumerate() {
            let line = line.map_err(|e| LaiError::io("ancestry proportions file", e))?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != a + 1 {
                return Err(LaiError::invalid_field(
                    "ancestry proportions file",
                    format!("line {}", lineno + 2),
                    format!("expected {} columns, found {}", a + 1, fields.len()),
                ));
            }
            let sample = fields[0].to_string();
            let proportions: Vec<f64> = fields[1..]
                .iter()
                .map(|tok| {
                    tok.parse::<f64>().map_err(|_| {
                        LaiError::invalid_field(
                            "ancestry proportions file",
                            format!("line {}", lineno + 2),
                            format!("{tok} is not a number"),
                        )
                    })
                })
                .collect::<LaiResult<Vec<f64>>>()?;
            let sum: f64 = proportions.iter().sum();
            if (sum - 1.0).abs() > 0.01 {
                return Err(LaiError::invalid_field(
                    "ancestry proportions file",
                    format!("line {}", lineno + 2),
                    format!("proportions sum to {sum}, expected 1.0 +/- 0.01"),
                ));
            }
            per_sample.insert(sample, proportions);
        }

        Ok(AncestryProportions {
            ancestry_names,
            per_sample,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_file() {
        let text = "SAMPLE A0 A1\nsampleA 0.3 0.7\nsampleB 0.5 0.5\n";
        let props = AncestryProportions::parse(text.as_bytes()).unwrap();
        assert_eq!(props.per_sample.get("sampleA"), Some(&vec![0.3, 0.7]));
    }

    #[test]
    fn rejects_rows_whose_proportions_do_not_sum_to_one() {
        let text = "SAMPLE A0 A1\nsampleA 0.3 0.3\n";
        assert!(AncestryProportions::parse(text.as_bytes()).is_err());
    }
}
