use crate::error::{ModelError, ModelResult};
use crate::function::LinearFunction;
use crate::variable::{VarRef, VariableLookup};

/// Violation of `lhs <= value <= rhs`, optionally scaled by the
/// magnitude of the violated bound.
fn bound_violation(value: f64, lhs: f64, rhs: f64, relative: bool) -> f64 {
    let (gap, bound) = if value < lhs {
        (lhs - value, lhs)
    } else if value > rhs {
        (value - rhs, rhs)
    } else {
        return 0.0;
    };
    if relative {
        gap / bound.abs().max(1.0)
    } else {
        gap
    }
}

/// `lhs <= function <= rhs`
#[derive(Debug, Clone, PartialEq)]
pub struct RowConstraint {
    pub function: LinearFunction,
    pub lhs: f64,
    pub rhs: f64,
}

impl RowConstraint {
    pub fn new(function: LinearFunction, lhs: f64, rhs: f64) -> Self {
        Self { function, lhs, rhs }
    }

    pub fn equality(function: LinearFunction, value: f64) -> Self {
        Self::new(function, value, value)
    }

    pub fn set_both(&mut self, value: f64) {
        self.lhs = value;
        self.rhs = value;
    }

    pub fn violation(
        &self,
        lookup: &dyn VariableLookup,
        relative: bool,
    ) -> ModelResult<f64> {
        let value = self.function.evaluate(lookup)?;
        Ok(bound_violation(value, self.lhs, self.rhs, relative))
    }
}

/// `lhs <= var <= rhs`
#[derive(Debug, Clone, PartialEq)]
pub struct BoxConstraint {
    pub var: VarRef,
    pub lhs: f64,
    pub rhs: f64,
}

impl BoxConstraint {
    pub fn new(var: VarRef, lhs: f64, rhs: f64) -> Self {
        Self { var, lhs, rhs }
    }

    pub fn violation(
        &self,
        lookup: &dyn VariableLookup,
        relative: bool,
    ) -> ModelResult<f64> {
        let v = lookup
            .lookup(self.var)
            .ok_or_else(|| ModelError::UnknownVariable(self.var.to_string()))?;
        Ok(bound_violation(v.value, self.lhs, self.rhs, relative))
    }
}

/// Borrowed view over either kind of constraint, used for traversals
#[derive(Debug, Clone, Copy)]
pub enum ConstraintRef<'a> {
    Row(&'a RowConstraint),
    Box(&'a BoxConstraint),
}

impl ConstraintRef<'_> {
    pub fn bounds(&self) -> (f64, f64) {
        match self {
            ConstraintRef::Row(c) => (c.lhs, c.rhs),
            ConstraintRef::Box(c) => (c.lhs, c.rhs),
        }
    }

    pub fn nonzeros(&self) -> usize {
        match self {
            ConstraintRef::Row(c) => c.function.num_terms(),
            ConstraintRef::Box(_) => 1,
        }
    }

    pub fn violation(
        &self,
        lookup: &dyn VariableLookup,
        relative: bool,
    ) -> ModelResult<f64> {
        match self {
            ConstraintRef::Row(c) => c.violation(lookup, relative),
            ConstraintRef::Box(c) => c.violation(lookup, relative),
        }
    }
}

/// A named `rows x cols` family of constraints, stored row-major
#[derive(Debug, Clone, PartialEq)]
pub struct Family<T> {
    name: &'static str,
    cols: usize,
    items: Vec<T>,
}

impl<T> Family<T> {
    pub fn new(name: &'static str, cols: usize) -> Self {
        Self {
            name,
            cols,
            items: vec![],
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn rows(&self) -> usize {
        if self.cols == 0 {
            0
        } else {
            self.items.len() / self.cols
        }
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<&T> {
        if col >= self.cols {
            return None;
        }
        self.items.get(row * self.cols + col)
    }

    pub fn get_mut(&mut self, row: usize, col: usize) -> Option<&mut T> {
        if col >= self.cols {
            return None;
        }
        self.items.get_mut(row * self.cols + col)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl Family<RowConstraint> {
    pub fn visit(&self, f: &mut dyn FnMut(&'static str, usize, ConstraintRef<'_>)) {
        for (i, c) in self.items.iter().enumerate() {
            f(self.name, i, ConstraintRef::Row(c));
        }
    }

    pub fn is_feasible(
        &self,
        lookup: &dyn VariableLookup,
        tol: f64,
        relative: bool,
    ) -> ModelResult<bool> {
        for c in self.items.iter() {
            if c.violation(lookup, relative)? > tol {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl Family<BoxConstraint> {
    pub fn visit(&self, f: &mut dyn FnMut(&'static str, usize, ConstraintRef<'_>)) {
        for (i, c) in self.items.iter().enumerate() {
            f(self.name, i, ConstraintRef::Box(c));
        }
    }

    pub fn is_feasible(
        &self,
        lookup: &dyn VariableLookup,
        tol: f64,
        relative: bool,
    ) -> ModelResult<bool> {
        for c in self.items.iter() {
            if c.violation(lookup, relative)? > tol {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::variable::{BlockId, ColVariable, VariableStore};

    #[test]
    fn test_absolute_and_relative_violation() {
        assert_eq!(bound_violation(12.0, 0.0, 10.0, false), 2.0);
        assert_eq!(bound_violation(12.0, 0.0, 10.0, true), 0.2);
        assert_eq!(bound_violation(-0.5, 0.0, 10.0, true), 0.5);
        assert_eq!(bound_violation(5.0, 0.0, 10.0, true), 0.0);
    }

    #[test]
    fn test_row_and_box_feasibility() {
        let mut store = VariableStore::new(BlockId::fresh());
        let grid = store.add_grid(1, 2, ColVariable::continuous());
        store.get_mut(grid.slot(0, 0)).unwrap().value = 3.0;
        store.get_mut(grid.slot(0, 1)).unwrap().value = 4.0;

        let lf = LinearFunction::from_terms(vec![
            (store.var_ref(0), 1.0),
            (store.var_ref(1), 1.0),
        ]);
        let mut rows = Family::new("sum", 1);
        rows.push(RowConstraint::equality(lf, 7.0));
        assert!(rows.is_feasible(&store, 0.0, true).unwrap());
        rows.get_mut(0, 0).unwrap().set_both(6.0);
        assert!(!rows.is_feasible(&store, 0.0, true).unwrap());
        assert!(rows.is_feasible(&store, 0.2, true).unwrap());

        let mut boxes = Family::new("box", 2);
        boxes.push(BoxConstraint::new(store.var_ref(0), 0.0, 3.0));
        boxes.push(BoxConstraint::new(store.var_ref(1), 0.0, 3.0));
        assert_eq!(boxes.rows(), 1);
        assert!(!boxes.is_feasible(&store, 0.0, false).unwrap());
        assert!(boxes.is_feasible(&store, 1.0, false).unwrap());
    }
}
