//! Model file grammar (spec.md section 6): an ancestry header line, a panel
//! header line, then in order T (1 number), mu (A numbers), p (A rows of P),
//! theta (A rows of P), rho (A numbers). Comments start with `#`.

use std::io::{BufRead, Write};

use crate::errors::{LaiError, LaiResult};
use crate::params::Params;

pub struct ModelFile {
    pub ancestry_names: Vec<String>,
    pub panel_names: Vec<String>,
    pub params: Params,
}

impl ModelFile {
    pub fn parse<R: BufRead>(reader: R) -> LaiResult<Self> {
        let lines: Vec<String> = reader
            .lines()
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| LaiError::io("model file", e))?
            .into_iter()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .collect();

        let mut it = lines.into_iter();
        let ancestry_names: Vec<String> = next_row(&mut it, "model file", "ancestry header")?;
        let panel_names: Vec<String> = next_row(&mut it, "model file", "panel header")?;
        let a = ancestry_names.len();
        let n_panels = panel_names.len();
        if a < 2 {
            return Err(LaiError::invalid("model file", "fewer than 2 ancestries"));
        }

        let t_row: Vec<f64> = next_numeric_row(&mut it, "model file", "T")?;
        if t_row.len() != 1 {
            return Err(LaiError::invalid_field("model file", "T", "expected exactly 1 number"));
        }
        let t = t_row[0];

        let mu = next_numeric_row(&mut it, "model file", "mu")?;
        if mu.len() != a {
            return Err(LaiError::invalid_field(
                "model file",
                "mu",
                format!("expected {a} numbers, found {}", mu.len()),
            ));
        }

        let mut p = Vec::with_capacity(a);
        for i in 0..a {
            let row = next_numeric_row(&mut it, "model file", format!("p row {i}"))?;
            if row.len() != n_panels {
                return Err(LaiError::invalid_field(
                    "model file",
                    format!("p row {i}"),
                    format!("expected {n_panels} numbers, found {}", row.len()),
                ));
            }
            p.push(row);
        }

        let mut theta = Vec::with_capacity(a);
        for i in 0..a {
            let row = next_numeric_row(&mut it, "model file", format!("theta row {i}"))?;
            if row.len() != n_panels {
                return Err(LaiError::invalid_field(
                    "model file",
                    format!("theta row {i}"),
                    format!("expected {n_panels} numbers, found {}", row.len()),
                ));
            }
            theta.push(row);
        }

        let rho = next_numeric_row(&mut it, "model file", "rho")?;
        if rho.len() != a {
            return Err(LaiError::invalid_field(
                "model file",
                "rho",
                format!("expected {a} numbers, found {}", rho.len()),
            ));
        }

        let params = Params { t, mu, p, theta, rho };
        params.validate(1e-2)?;

        Ok(ModelFile {
            ancestry_names,
            panel_names,
            params,
        })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> LaiResult<()> {
        let io_err = |e: std::io::Error| LaiError::io("model file", e);
        writeln!(writer, "{}", self.ancestry_names.join(" ")).map_err(io_err)?;
        writeln!(writer, "{}", self.panel_names.join(" ")).map_err(io_err)?;
        writeln!(writer, "{}", self.params.t).map_err(io_err)?;
        writeln!(writer, "{}", format_row(&self.params.mu)).map_err(io_err)?;
        for row in &self.params.p {
            writeln!(writer, "{}", format_row(row)).map_err(io_err)?;
        }
        for row in &self.params.theta {
            writeln!(writer, "{}", format_row(row)).map_err(io_err)?;
        }
        writeln!(writer, "{}", format_row(&self.params.rho)).map_err(io_err)?;
        Ok(())
    }
}

fn format_row(row: &[f64]) -> String {
    row.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(" ")
}

fn next_row(
    it: &mut impl Iterator<Item = String>,
    file: &str,
    field: impl Into<String>,
) -> LaiResult<Vec<String>> {
    let field = field.into();
    let line = it
        .next()
        .ok_or_else(|| LaiError::invalid_field(file, field.clone(), "unexpected end of file"))?;
    Ok(line.split_whitespace().map(str::to_string).collect())
}

fn next_numeric_row(
    it: &mut impl Iterator<Item = String>,
    file: &str,
    field: impl Into<String>,
) -> LaiResult<Vec<f64>> {
    let field = field.into();
    let tokens = next_row(it, file, field.clone())?;
    tokens
        .iter()
        .map(|tok| {
            tok.parse::<f64>()
                .map_err(|_| LaiError::invalid_field(file, field.clone(), format!("{tok} is not a number")))
        })
        .collect()
}
