use crate::config::{BlockConfig, FeasibilityConfig};
use crate::constraint::ConstraintRef;
use crate::error::ModelResult;
use crate::function::Objective;
use crate::state::GenerationState;
use crate::variable::{BlockId, ColVariable, VarRef, VariableLookup};

/// Common contract of every model block: a three step lazy generation of
/// the abstract representation and read access to what was generated.
pub trait Block {
    fn id(&self) -> BlockId;

    /// Short name of the concrete block type
    fn kind(&self) -> &'static str;

    fn generation_state(&self) -> GenerationState;

    fn generate_variables(&mut self) -> ModelResult<()>;

    fn generate_constraints(&mut self) -> ModelResult<()>;

    fn generate_objective(&mut self) -> ModelResult<()>;

    fn generate_all(&mut self) -> ModelResult<()> {
        self.generate_variables()?;
        self.generate_constraints()?;
        self.generate_objective()
    }

    /// Resolves the variables of this block and of its sub-blocks
    fn as_lookup(&self) -> &dyn VariableLookup;

    fn for_each_variable(&self, f: &mut dyn FnMut(VarRef, &ColVariable));

    fn for_each_constraint(
        &self,
        f: &mut dyn FnMut(&'static str, usize, ConstraintRef<'_>),
    );

    /// Visits the objective of this block and those of its sub-blocks
    fn for_each_objective(&self, f: &mut dyn FnMut(&Objective));

    fn config(&self) -> Option<&BlockConfig> {
        None
    }

    fn num_variables(&self) -> usize {
        let mut count = 0;
        self.for_each_variable(&mut |_, _| count += 1);
        count
    }

    fn num_constraints(&self) -> usize {
        let mut count = 0;
        self.for_each_constraint(&mut |_, _, _| count += 1);
        count
    }

    /// Total objective value at the current variable values
    fn objective_value(&self) -> ModelResult<f64> {
        let lookup = self.as_lookup();
        let mut total = Ok(0.0);
        self.for_each_objective(&mut |objective| {
            if let Ok(acc) = total {
                total = objective
                    .function
                    .evaluate(lookup)
                    .map(|value| acc + value);
            }
        });
        total
    }

    /// True when every variable sits within its bounds and every
    /// generated constraint is violated by at most the tolerance.
    /// Vacuously true before anything is generated.
    fn is_feasible(&self, config: Option<&FeasibilityConfig>) -> ModelResult<bool> {
        let cfg = BlockConfig::resolve_feasibility(config, self.config());
        let mut feasible = true;
        self.for_each_variable(&mut |_, v| {
            feasible &= v.is_feasible(cfg.tolerance);
        });
        if !feasible {
            return Ok(false);
        }
        let lookup = self.as_lookup();
        let mut result = Ok(true);
        self.for_each_constraint(&mut |_, _, c| {
            if let Ok(true) = result {
                result = c
                    .violation(lookup, cfg.relative)
                    .map(|violation| violation <= cfg.tolerance);
            }
        });
        result
    }
}
