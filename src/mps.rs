use std::collections::HashMap;
use std::fmt;
use std::fs;

use crate::block::Block;
use crate::constraint::ConstraintRef;
use crate::error::{ModelError, ModelResult};
use crate::function::Sense;
use crate::variable::{ColVariable, VarRef, VarType};

const OBJECTIVE_ROW: &str = "OBJ";

#[derive(Debug, PartialEq, Clone, Copy)]
enum MPSRowSense {
    Free,
    GreaterThanOrEqual,
    LessThanOrEqual,
    Equal,
}

impl MPSRowSense {
    fn code(&self) -> &'static str {
        match self {
            MPSRowSense::Free => "N",
            MPSRowSense::GreaterThanOrEqual => "G",
            MPSRowSense::LessThanOrEqual => "L",
            MPSRowSense::Equal => "E",
        }
    }
}

/// A constraint row with its RHS and optional RANGES entry
#[derive(Debug, PartialEq)]
struct MPSRow {
    sense: MPSRowSense,
    name: String,
    rhs: f64,
    range: Option<f64>,
}

impl MPSRow {
    /// `None` for a row bounded on neither side.
    fn build(name: String, lhs: f64, rhs: f64) -> Option<MPSRow> {
        let (sense, value, range) = match (lhs.is_finite(), rhs.is_finite()) {
            (false, false) => return None,
            (true, true) if lhs == rhs => (MPSRowSense::Equal, lhs, None),
            (true, true) => (MPSRowSense::GreaterThanOrEqual, lhs, Some(rhs - lhs)),
            (true, false) => (MPSRowSense::GreaterThanOrEqual, lhs, None),
            (false, true) => (MPSRowSense::LessThanOrEqual, rhs, None),
        };
        Some(MPSRow {
            sense,
            name,
            rhs: value,
            range,
        })
    }
}

impl fmt::Display for MPSRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, " {} {}", self.sense.code(), self.name)
    }
}

#[derive(Debug, PartialEq)]
struct MPSColumn {
    lower: f64,
    upper: f64,
    binary: bool,
    /// `(row index, coefficient)`, row index `None` for the objective
    factors: Vec<(Option<usize>, f64)>,
}

impl MPSColumn {
    fn new(v: &ColVariable) -> Self {
        Self {
            lower: v.lower,
            upper: v.upper,
            binary: v.var_type == VarType::Binary,
            factors: vec![],
        }
    }

    fn add_factor(&mut self, row: Option<usize>, value: f64) {
        match self.factors.last_mut() {
            Some((last, acc)) if *last == row => *acc += value,
            _ => self.factors.push((row, value)),
        }
    }
}

#[derive(Debug, PartialEq)]
enum MPSBoundType {
    Lower,
    Upper,
    Fixed,
    Free,
    MinusInfinity,
    Binary,
}

impl MPSBoundType {
    fn code(&self) -> &'static str {
        match self {
            MPSBoundType::Lower => "LO",
            MPSBoundType::Upper => "UP",
            MPSBoundType::Fixed => "FX",
            MPSBoundType::Free => "FR",
            MPSBoundType::MinusInfinity => "MI",
            MPSBoundType::Binary => "BV",
        }
    }
}

struct MPSBound {
    kind: MPSBoundType,
    column_name: String,
    value: Option<f64>,
}

impl fmt::Display for MPSBound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, " {} BND {}", self.kind.code(), self.column_name)?;
        if let Some(value) = self.value {
            write!(f, " {value}")?;
        }
        Ok(())
    }
}

/// Helper function for the BOUNDS entries of one column, relative to
/// the MPS default `[0, +inf)`
fn column_bounds(name: &str, column: &MPSColumn) -> Vec<MPSBound> {
    let bound = |kind, value| MPSBound {
        kind,
        column_name: name.to_string(),
        value,
    };
    if column.binary && column.lower == 0.0 && column.upper == 1.0 {
        return vec![bound(MPSBoundType::Binary, None)];
    }
    let (lo, up) = (column.lower, column.upper);
    if lo == up {
        return vec![bound(MPSBoundType::Fixed, Some(lo))];
    }
    let mut bounds = vec![];
    match (lo.is_finite(), up.is_finite()) {
        (false, false) => bounds.push(bound(MPSBoundType::Free, None)),
        (false, true) => {
            bounds.push(bound(MPSBoundType::MinusInfinity, None));
            bounds.push(bound(MPSBoundType::Upper, Some(up)));
        }
        (true, up_finite) => {
            if lo != 0.0 {
                bounds.push(bound(MPSBoundType::Lower, Some(lo)));
            }
            if up_finite {
                bounds.push(bound(MPSBoundType::Upper, Some(up)));
            }
        }
    }
    bounds
}

fn column_name(index: usize) -> String {
    format!("x{index}")
}

fn unknown(var: VarRef) -> ModelError {
    ModelError::UnknownVariable(var.to_string())
}

/// Flattens the generated representation of `block` and its sub-blocks
/// into free MPS text. Box constraints are folded into the column
/// bounds; rows bounded on neither side are left out.
pub fn write_mps(block: &dyn Block, name: &str) -> ModelResult<String> {
    let mut column_index = HashMap::<VarRef, usize>::new();
    let mut columns = Vec::<MPSColumn>::new();
    block.for_each_variable(&mut |var, v| {
        column_index.insert(var, columns.len());
        columns.push(MPSColumn::new(v));
    });

    let mut sense = Sense::Minimise;
    let mut objective_constant = 0.0;
    let mut objective_terms = vec![];
    let mut first = true;
    block.for_each_objective(&mut |objective| {
        if first {
            sense = objective.sense;
            first = false;
        }
        objective_constant += objective.function.constant();
        objective_terms.extend_from_slice(objective.function.terms());
    });
    for (var, coefficient) in objective_terms {
        let col = *column_index.get(&var).ok_or_else(|| unknown(var))?;
        columns[col].add_factor(None, coefficient);
    }

    let mut rows = Vec::<MPSRow>::new();
    let mut result = Ok(());
    block.for_each_constraint(&mut |family, _, c| {
        if result.is_err() {
            return;
        }
        match c {
            ConstraintRef::Box(b) => match column_index.get(&b.var) {
                Some(col) => {
                    let column = &mut columns[*col];
                    column.lower = column.lower.max(b.lhs);
                    column.upper = column.upper.min(b.rhs);
                }
                None => result = Err(unknown(b.var)),
            },
            ConstraintRef::Row(r) => {
                let row_name = format!("{family}_{}", rows.len());
                let Some(row) = MPSRow::build(row_name, r.lhs, r.rhs) else {
                    return;
                };
                let index = rows.len();
                // constants move to the right hand side
                let shift = r.function.constant();
                let row = MPSRow {
                    rhs: row.rhs - shift,
                    ..row
                };
                for (var, coefficient) in r.function.terms() {
                    match column_index.get(var) {
                        Some(col) => columns[*col].add_factor(Some(index), *coefficient),
                        None => {
                            result = Err(unknown(*var));
                            return;
                        }
                    }
                }
                rows.push(row);
            }
        }
    });
    result?;

    let mut out = String::new();
    let mut line = |text: String| {
        out.push_str(&text);
        out.push('\n');
    };
    line(format!("NAME {name}"));
    line("OBJSENSE".to_string());
    line(match sense {
        Sense::Minimise => "    MIN".to_string(),
        Sense::Maximise => "    MAX".to_string(),
    });
    line("ROWS".to_string());
    line(format!(" {} {OBJECTIVE_ROW}", MPSRowSense::Free.code()));
    for row in rows.iter() {
        line(row.to_string());
    }
    line("COLUMNS".to_string());
    for (j, column) in columns.iter().enumerate() {
        for (row, value) in column.factors.iter() {
            let row_name = match row {
                Some(i) => rows[*i].name.as_str(),
                None => OBJECTIVE_ROW,
            };
            line(format!("    {} {row_name} {value}", column_name(j)));
        }
    }
    line("RHS".to_string());
    if objective_constant != 0.0 {
        line(format!("    RHS {OBJECTIVE_ROW} {}", -objective_constant));
    }
    for row in rows.iter().filter(|r| r.rhs != 0.0) {
        line(format!("    RHS {} {}", row.name, row.rhs));
    }
    line("RANGES".to_string());
    for row in rows.iter() {
        if let Some(range) = row.range {
            line(format!("    RNG {} {range}", row.name));
        }
    }
    line("BOUNDS".to_string());
    for (j, column) in columns.iter().enumerate() {
        for bound in column_bounds(&column_name(j), column) {
            line(bound.to_string());
        }
    }
    line("ENDATA".to_string());
    Ok(out)
}

pub fn write_mps_file(block: &dyn Block, name: &str, filepath: &str) -> ModelResult<()> {
    fs::write(filepath, write_mps(block, name)?)?;
    Ok(())
}
