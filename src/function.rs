use crate::error::{ModelError, ModelResult};
use crate::variable::{VarRef, VariableLookup};

/// A linear expression `sum(coefficient * variable) + constant`.
///
/// Terms keep their insertion order: the position of a term is stable
/// for the whole life of the function, which is what lets a parent
/// block patch coefficients by position instead of rebuilding rows.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinearFunction {
    terms: Vec<(VarRef, f64)>,
    constant: f64,
}

impl LinearFunction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_terms(terms: Vec<(VarRef, f64)>) -> Self {
        Self {
            terms,
            constant: 0.0,
        }
    }

    pub fn add_variable(&mut self, var: VarRef, coefficient: f64) {
        self.terms.push((var, coefficient));
    }

    pub fn terms(&self) -> &[(VarRef, f64)] {
        &self.terms
    }

    pub fn num_terms(&self) -> usize {
        self.terms.len()
    }

    pub fn constant(&self) -> f64 {
        self.constant
    }

    pub fn set_constant(&mut self, constant: f64) {
        self.constant = constant;
    }

    pub fn coefficient_at(&self, position: usize) -> Option<f64> {
        self.terms.get(position).map(|(_, c)| *c)
    }

    /// Overwrites the coefficients of the terms at `positions` with
    /// `values`, pairwise. Every position is checked before anything is
    /// written.
    pub fn modify_coefficients(
        &mut self,
        values: &[f64],
        positions: &[usize],
    ) -> ModelResult<()> {
        if values.len() != positions.len() {
            return Err(ModelError::shape(
                "coefficient patch",
                positions.len(),
                values.len(),
            ));
        }
        let extent = self.terms.len();
        if let Some(p) = positions.iter().find(|p| **p >= extent) {
            return Err(ModelError::OutOfRangeIndex {
                what: "term",
                index: *p,
                extent,
            });
        }
        for (position, value) in positions.iter().zip(values) {
            self.terms[*position].1 = *value;
        }
        Ok(())
    }

    /// Evaluates the function at the current variable values.
    pub fn evaluate(&self, lookup: &dyn VariableLookup) -> ModelResult<f64> {
        let mut total = self.constant;
        for (var, coefficient) in self.terms.iter() {
            let v = lookup
                .lookup(*var)
                .ok_or_else(|| ModelError::UnknownVariable(var.to_string()))?;
            total += coefficient * v.value;
        }
        Ok(total)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sense {
    Minimise,
    Maximise,
}

/// The objective of a block
#[derive(Debug, Clone, PartialEq)]
pub struct Objective {
    pub function: LinearFunction,
    pub sense: Sense,
}

impl Objective {
    pub fn minimise(function: LinearFunction) -> Self {
        Self {
            function,
            sense: Sense::Minimise,
        }
    }
}
