use crate::error::{ModelError, ModelResult};

/// Progress of the abstract representation of a block.
///
/// The steps must be taken in order. Asking again for a step that was
/// already taken is a no-op, asking for a step whose predecessor is
/// missing is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum GenerationState {
    #[default]
    Empty,
    VariablesGenerated,
    ConstraintsGenerated,
    ObjectiveGenerated,
}

/// What a generation step should do given the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Run,
    Skip,
}

impl GenerationState {
    fn step_name(target: GenerationState) -> &'static str {
        match target {
            GenerationState::Empty => "nothing",
            GenerationState::VariablesGenerated => "variables",
            GenerationState::ConstraintsGenerated => "constraints",
            GenerationState::ObjectiveGenerated => "objective",
        }
    }

    fn predecessor(target: GenerationState) -> GenerationState {
        match target {
            GenerationState::Empty | GenerationState::VariablesGenerated => {
                GenerationState::Empty
            }
            GenerationState::ConstraintsGenerated => {
                GenerationState::VariablesGenerated
            }
            GenerationState::ObjectiveGenerated => {
                GenerationState::ConstraintsGenerated
            }
        }
    }

    /// Checks whether the step leading to `target` may run.
    pub fn begin(&self, target: GenerationState) -> ModelResult<StepAction> {
        if *self >= target {
            return Ok(StepAction::Skip);
        }
        if *self != Self::predecessor(target) {
            return Err(ModelError::OutOfOrder {
                step: Self::step_name(target),
                state: *self,
            });
        }
        Ok(StepAction::Run)
    }

    pub fn has_variables(&self) -> bool {
        *self >= GenerationState::VariablesGenerated
    }

    pub fn has_constraints(&self) -> bool {
        *self >= GenerationState::ConstraintsGenerated
    }

    pub fn has_objective(&self) -> bool {
        *self >= GenerationState::ObjectiveGenerated
    }
}
