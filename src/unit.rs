use std::ops::Range;

use crate::block::Block;
use crate::config::BlockConfig;
use crate::constraint::{BoxConstraint, ConstraintRef, Family, RowConstraint};
use crate::error::{ModelError, ModelResult};
use crate::function::{LinearFunction, Objective};
use crate::group::{Group, Layouts};
use crate::log;
use crate::modification::{ModKind, ModParam, Notifier, Outcome, Selection};
use crate::state::{GenerationState, StepAction};
use crate::variable::{
    BlockId, ColVariable, Grid, VarRef, VariableLookup, VariableStore,
};

/// Helper function for expanding a per-unit, per-generator or
/// per-(generator, instant) array to the full `generators x horizon` size.
fn expand(
    values: &[f64],
    generators: usize,
    horizon: usize,
    what: &str,
) -> ModelResult<Vec<f64>> {
    let full = generators * horizon;
    match values.len() {
        1 => Ok(vec![values[0]; full]),
        n if n == full => Ok(values.to_vec()),
        n if n == generators => Ok(values
            .iter()
            .flat_map(|v| std::iter::repeat(*v).take(horizon))
            .collect()),
        n => Err(ModelError::shape(what, full, n)),
    }
}

/// Writes `values` back in the most compact of the three forms
fn put_compact(group: &mut Group, name: &str, values: &[f64], horizon: usize) {
    if values.is_empty() {
        return;
    }
    if values.iter().all(|v| *v == values[0]) {
        group.put_double(name, &[], vec![values[0]]);
        return;
    }
    let per_generator = values
        .chunks(horizon)
        .all(|chunk| chunk.iter().all(|v| *v == chunk[0]));
    if per_generator {
        let compact = values.chunks(horizon).map(|chunk| chunk[0]).collect();
        group.put_double(name, &["NumberGenerators"], compact);
    } else {
        group.put_double(
            name,
            &["NumberGenerators", "TimeHorizon"],
            values.to_vec(),
        );
    }
}

/// Physical data of a group of thermal-like generators
#[derive(Debug, Clone, PartialEq)]
pub struct UnitData {
    pub number_generators: usize,
    pub time_horizon: usize,
    pub min_power: Vec<f64>,
    pub max_power: Vec<f64>,
    pub linear_cost: Vec<f64>,
    pub commitment: bool,
    pub primary_reserve: bool,
    pub secondary_reserve: bool,
    pub fixed_consumption: Vec<f64>,
    pub inertia_power: Vec<f64>,
    pub inertia_commitment: Vec<f64>,
}

impl UnitData {
    /// Generators with the given power range and no optional feature.
    pub fn new(
        number_generators: usize,
        time_horizon: usize,
        min_power: &[f64],
        max_power: &[f64],
    ) -> ModelResult<Self> {
        Ok(Self {
            number_generators,
            time_horizon,
            min_power: expand(min_power, number_generators, time_horizon, "MinPower")?,
            max_power: expand(max_power, number_generators, time_horizon, "MaxPower")?,
            linear_cost: vec![],
            commitment: false,
            primary_reserve: false,
            secondary_reserve: false,
            fixed_consumption: vec![],
            inertia_power: vec![],
            inertia_commitment: vec![],
        })
    }

    fn expanded(&self, values: &[f64], what: &str) -> ModelResult<Vec<f64>> {
        expand(values, self.number_generators, self.time_horizon, what)
    }

    pub fn with_linear_cost(mut self, cost: &[f64]) -> ModelResult<Self> {
        self.linear_cost = self.expanded(cost, "LinearCost")?;
        Ok(self)
    }

    pub fn with_commitment(mut self) -> Self {
        self.commitment = true;
        self
    }

    pub fn with_reserves(mut self, primary: bool, secondary: bool) -> Self {
        self.primary_reserve = primary;
        self.secondary_reserve = secondary;
        self
    }

    pub fn with_fixed_consumption(mut self, fc: &[f64]) -> ModelResult<Self> {
        self.fixed_consumption = self.expanded(fc, "FixedConsumption")?;
        Ok(self)
    }

    pub fn with_inertia(mut self, power: &[f64], commitment: &[f64]) -> ModelResult<Self> {
        self.inertia_power = self.expanded(power, "InertiaPower")?;
        self.inertia_commitment = self.expanded(commitment, "InertiaCommitment")?;
        Ok(self)
    }
}

/// A unit block: `G` generators over a horizon of `T` instants.
///
/// The scale factor multiplies the whole unit: the parent sees
/// `scale` identical copies of every generator.
#[derive(Debug)]
pub struct UnitBlock {
    id: BlockId,
    state: GenerationState,
    config: Option<BlockConfig>,
    notifier: Notifier,
    data: UnitData,
    scale: f64,
    store: VariableStore,
    active_power: Grid,
    commitment: Grid,
    primary_reserve: Grid,
    secondary_reserve: Grid,
    power_bounds: Family<BoxConstraint>,
    min_power_rows: Family<RowConstraint>,
    max_power_rows: Family<RowConstraint>,
    objective: Option<Objective>,
    layouts: Layouts,
}

impl UnitBlock {
    pub fn new(data: UnitData) -> Self {
        let id = BlockId::fresh();
        let horizon = data.time_horizon;
        Self {
            id,
            state: GenerationState::Empty,
            config: None,
            notifier: Notifier::new(),
            data,
            scale: 1.0,
            store: VariableStore::new(id),
            active_power: Grid::default(),
            commitment: Grid::default(),
            primary_reserve: Grid::default(),
            secondary_reserve: Grid::default(),
            power_bounds: Family::new("power_bounds", horizon),
            min_power_rows: Family::new("min_power", horizon),
            max_power_rows: Family::new("max_power", horizon),
            objective: None,
            layouts: Layouts::default(),
        }
    }

    pub fn data(&self) -> &UnitData {
        &self.data
    }

    pub fn set_notifier(&mut self, notifier: Notifier) {
        self.notifier = notifier;
    }

    pub fn set_config(&mut self, config: BlockConfig) {
        self.config = Some(config);
    }

    pub fn number_generators(&self) -> usize {
        self.data.number_generators
    }

    pub fn time_horizon(&self) -> usize {
        self.data.time_horizon
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    pub fn has_commitment(&self) -> bool {
        self.data.commitment
    }

    fn at(values: &[f64], horizon: usize, generator: usize, t: usize) -> f64 {
        if values.is_empty() {
            0.0
        } else {
            values[generator * horizon + t]
        }
    }

    pub fn min_power(&self, generator: usize, t: usize) -> f64 {
        Self::at(&self.data.min_power, self.time_horizon(), generator, t)
    }

    pub fn max_power(&self, generator: usize, t: usize) -> f64 {
        Self::at(&self.data.max_power, self.time_horizon(), generator, t)
    }

    pub fn linear_cost(&self, generator: usize, t: usize) -> f64 {
        Self::at(&self.data.linear_cost, self.time_horizon(), generator, t)
    }

    pub fn fixed_consumption(&self, generator: usize, t: usize) -> f64 {
        Self::at(&self.data.fixed_consumption, self.time_horizon(), generator, t)
    }

    pub fn has_fixed_consumption(&self) -> bool {
        !self.data.fixed_consumption.is_empty()
    }

    pub fn inertia_power(&self, generator: usize, t: usize) -> f64 {
        Self::at(&self.data.inertia_power, self.time_horizon(), generator, t)
    }

    pub fn inertia_commitment(&self, generator: usize, t: usize) -> f64 {
        Self::at(&self.data.inertia_commitment, self.time_horizon(), generator, t)
    }

    pub fn has_inertia(&self) -> bool {
        !self.data.inertia_power.is_empty() || !self.data.inertia_commitment.is_empty()
    }

    pub fn active_power(&self, generator: usize, t: usize) -> Option<VarRef> {
        Self::var(&self.store, &self.active_power, generator, t)
    }

    pub fn commitment(&self, generator: usize, t: usize) -> Option<VarRef> {
        Self::var(&self.store, &self.commitment, generator, t)
    }

    pub fn primary_reserve(&self, generator: usize, t: usize) -> Option<VarRef> {
        Self::var(&self.store, &self.primary_reserve, generator, t)
    }

    pub fn secondary_reserve(&self, generator: usize, t: usize) -> Option<VarRef> {
        Self::var(&self.store, &self.secondary_reserve, generator, t)
    }

    fn var(store: &VariableStore, grid: &Grid, generator: usize, t: usize) -> Option<VarRef> {
        if grid.is_empty() {
            None
        } else {
            Some(store.at(grid, generator, t))
        }
    }

    pub fn variable_store_mut(&mut self) -> &mut VariableStore {
        &mut self.store
    }

    pub fn objective(&self) -> Option<&Objective> {
        self.objective.as_ref()
    }

    pub fn power_bounds(&self) -> &Family<BoxConstraint> {
        &self.power_bounds
    }

    pub fn max_power_rows(&self) -> &Family<RowConstraint> {
        &self.max_power_rows
    }

    /// Scales the whole unit: the only index is 0.
    pub fn set_scale_subset(
        &mut self,
        values: &[f64],
        subset: &[usize],
        sorted: bool,
        physical_mode: ModParam,
        abstract_mode: ModParam,
    ) -> ModelResult<Outcome> {
        match Selection::subset(subset, sorted, 1, values, "scale")? {
            Some(sel) => self.update_scale(sel, values, physical_mode, abstract_mode),
            None => Ok(Outcome::Unchanged),
        }
    }

    pub fn set_scale_range(
        &mut self,
        values: &[f64],
        range: Range<usize>,
        physical_mode: ModParam,
        abstract_mode: ModParam,
    ) -> ModelResult<Outcome> {
        match Selection::range(range, 1, values, "scale")? {
            Some(sel) => self.update_scale(sel, values, physical_mode, abstract_mode),
            None => Ok(Outcome::Unchanged),
        }
    }

    pub fn set_scale(
        &mut self,
        scale: f64,
        physical_mode: ModParam,
        abstract_mode: ModParam,
    ) -> ModelResult<Outcome> {
        self.set_scale_range(&[scale], 0..1, physical_mode, abstract_mode)
    }

    fn update_scale(
        &mut self,
        sel: Selection,
        values: &[f64],
        physical_mode: ModParam,
        abstract_mode: ModParam,
    ) -> ModelResult<Outcome> {
        let mut stored = vec![self.scale];
        if !sel.differs(&stored, 1.0, values) {
            log::unchanged_update(self.id, "scale");
            return Ok(Outcome::Unchanged);
        }
        if !physical_mode.writes() {
            return Ok(Outcome::DryRun);
        }
        sel.write(&mut stored, 1, 1.0, values);
        self.scale = stored[0];
        log::physical_update(self.id, "scale", 1);
        if abstract_mode.writes() && self.objective.is_some() {
            let values = self.objective_coefficients();
            let positions: Vec<usize> = (0..values.len()).collect();
            if let Some(objective) = self.objective.as_mut() {
                objective.function.modify_coefficients(&values, &positions)?;
            }
            log::patch_summary(
                self.id,
                "objective",
                values.len(),
                abstract_mode.channel().is_some(),
            );
        }
        self.notifier
            .issue_if(physical_mode, || sel.record(self.id, ModKind::Scale));
        Ok(Outcome::Applied)
    }

    fn objective_coefficients(&self) -> Vec<f64> {
        let mut values = vec![];
        for g in 0..self.number_generators() {
            for t in 0..self.time_horizon() {
                values.push(self.scale * self.linear_cost(g, t));
            }
        }
        values
    }

    pub fn deserialize(group: &Group) -> ModelResult<Self> {
        let generators = group.dim("NumberGenerators").unwrap_or(1);
        let horizon = group.require_dim("TimeHorizon")?;
        let mut data = UnitData::new(
            generators,
            horizon,
            &group.require_double("MinPower")?,
            &group.require_double("MaxPower")?,
        )?;
        if let Some(cost) = group.double("LinearCost")? {
            data = data.with_linear_cost(&cost)?;
        }
        let flag = |name: &str| -> ModelResult<bool> {
            Ok(group
                .uint(name)?
                .and_then(|v| v.first().copied())
                .is_some_and(|v| v != 0))
        };
        data.commitment = flag("Commitment")?;
        data.primary_reserve = flag("PrimaryReserve")?;
        data.secondary_reserve = flag("SecondaryReserve")?;
        if let Some(fc) = group.double("FixedConsumption")? {
            data = data.with_fixed_consumption(&fc)?;
        }
        if let Some(ip) = group.double("InertiaPower")? {
            data.inertia_power = data.expanded(&ip, "InertiaPower")?;
        }
        if let Some(ic) = group.double("InertiaCommitment")? {
            data.inertia_commitment = data.expanded(&ic, "InertiaCommitment")?;
        }
        let mut unit = Self::new(data);
        if let Some(scale) = group.double("Scale")? {
            unit.scale = scale.first().copied().unwrap_or(1.0);
        }
        unit.layouts = Layouts::of(group);
        Ok(unit)
    }

    // Arrays read from a group go back in the form they had there
    fn put_array(&self, group: &mut Group, name: &str, values: &[f64]) {
        if self.layouts.has_array(name) {
            let dims = ["NumberGenerators", "TimeHorizon"];
            self.layouts.put_double(group, name, &dims, values);
        } else {
            put_compact(group, name, values, self.time_horizon());
        }
    }

    pub fn serialize(&self, group: &mut Group) {
        let layouts = &self.layouts;
        group.set_dim("TimeHorizon", self.time_horizon());
        if self.number_generators() != 1 || layouts.has_dim("NumberGenerators") {
            group.set_dim("NumberGenerators", self.number_generators());
        }
        self.put_array(group, "MinPower", &self.data.min_power);
        self.put_array(group, "MaxPower", &self.data.max_power);
        if self.data.linear_cost.iter().any(|c| *c != 0.0) || layouts.has_array("LinearCost") {
            self.put_array(group, "LinearCost", &self.data.linear_cost);
        }
        for (name, on) in [
            ("Commitment", self.data.commitment),
            ("PrimaryReserve", self.data.primary_reserve),
            ("SecondaryReserve", self.data.secondary_reserve),
        ] {
            if on || layouts.has_array(name) {
                group.put_uint(name, &layouts.dims_or(name, &[]), vec![usize::from(on)]);
            }
        }
        self.put_array(group, "FixedConsumption", &self.data.fixed_consumption);
        self.put_array(group, "InertiaPower", &self.data.inertia_power);
        self.put_array(group, "InertiaCommitment", &self.data.inertia_commitment);
        if self.scale != 1.0 || layouts.has_array("Scale") {
            layouts.put_double(group, "Scale", &[], &[self.scale]);
        }
    }
}

impl VariableLookup for UnitBlock {
    fn lookup(&self, var: VarRef) -> Option<&ColVariable> {
        self.store.lookup(var)
    }
}

impl Block for UnitBlock {
    fn id(&self) -> BlockId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "UnitBlock"
    }

    fn generation_state(&self) -> GenerationState {
        self.state
    }

    fn generate_variables(&mut self) -> ModelResult<()> {
        if self.state.begin(GenerationState::VariablesGenerated)? == StepAction::Skip {
            return Ok(());
        }
        let (g, t) = (self.number_generators(), self.time_horizon());
        self.active_power = self.store.add_grid(g, t, ColVariable::non_negative());
        if self.data.commitment {
            self.commitment = self.store.add_grid(g, t, ColVariable::binary());
        }
        if self.data.primary_reserve {
            self.primary_reserve = self.store.add_grid(g, t, ColVariable::non_negative());
        }
        if self.data.secondary_reserve {
            self.secondary_reserve = self.store.add_grid(g, t, ColVariable::non_negative());
        }
        self.state = GenerationState::VariablesGenerated;
        log::generation_summary(self.kind(), self.id, "variables", self.store.len());
        Ok(())
    }

    fn generate_constraints(&mut self) -> ModelResult<()> {
        if self.state.begin(GenerationState::ConstraintsGenerated)? == StepAction::Skip {
            return Ok(());
        }
        let (generators, horizon) = (self.number_generators(), self.time_horizon());
        let has_reserves = self.data.primary_reserve || self.data.secondary_reserve;
        for g in 0..generators {
            for t in 0..horizon {
                let p = self.store.at(&self.active_power, g, t);
                let (pmin, pmax) = (self.min_power(g, t), self.max_power(g, t));
                let mut upper = LinearFunction::new();
                upper.add_variable(p, 1.0);
                if let Some(r1) = self.primary_reserve(g, t) {
                    upper.add_variable(r1, 1.0);
                }
                if let Some(r2) = self.secondary_reserve(g, t) {
                    upper.add_variable(r2, 1.0);
                }
                match self.commitment(g, t) {
                    Some(u) => {
                        // p - Pmin u >= 0 and p + r1 + r2 - Pmax u <= 0
                        let lower =
                            LinearFunction::from_terms(vec![(p, 1.0), (u, -pmin)]);
                        self.min_power_rows
                            .push(RowConstraint::new(lower, 0.0, f64::INFINITY));
                        upper.add_variable(u, -pmax);
                        self.max_power_rows
                            .push(RowConstraint::new(upper, f64::NEG_INFINITY, 0.0));
                    }
                    None => {
                        self.power_bounds.push(BoxConstraint::new(p, pmin, pmax));
                        if has_reserves {
                            self.max_power_rows
                                .push(RowConstraint::new(upper, f64::NEG_INFINITY, pmax));
                        }
                    }
                }
            }
        }
        self.state = GenerationState::ConstraintsGenerated;
        log::generation_summary(self.kind(), self.id, "constraints", self.num_constraints());
        Ok(())
    }

    fn generate_objective(&mut self) -> ModelResult<()> {
        if self.state.begin(GenerationState::ObjectiveGenerated)? == StepAction::Skip {
            return Ok(());
        }
        let coefficients = self.objective_coefficients();
        let mut lf = LinearFunction::new();
        let mut i = 0;
        for g in 0..self.number_generators() {
            for t in 0..self.time_horizon() {
                lf.add_variable(self.store.at(&self.active_power, g, t), coefficients[i]);
                i += 1;
            }
        }
        log::generation_summary(self.kind(), self.id, "objective", lf.num_terms());
        self.objective = Some(Objective::minimise(lf));
        self.state = GenerationState::ObjectiveGenerated;
        Ok(())
    }

    fn as_lookup(&self) -> &dyn VariableLookup {
        self
    }

    fn for_each_variable(&self, f: &mut dyn FnMut(VarRef, &ColVariable)) {
        for (var, v) in self.store.iter() {
            f(var, v);
        }
    }

    fn for_each_constraint(
        &self,
        f: &mut dyn FnMut(&'static str, usize, ConstraintRef<'_>),
    ) {
        self.power_bounds.visit(f);
        self.min_power_rows.visit(f);
        self.max_power_rows.visit(f);
    }

    fn for_each_objective(&self, f: &mut dyn FnMut(&Objective)) {
        if let Some(objective) = self.objective.as_ref() {
            f(objective);
        }
    }

    fn config(&self) -> Option<&BlockConfig> {
        self.config.as_ref()
    }
}
