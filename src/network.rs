use std::io::Read;
use std::ops::Range;

use crate::block::Block;
use crate::config::BlockConfig;
use crate::constraint::{BoxConstraint, ConstraintRef, Family, RowConstraint};
use crate::error::{ModelError, ModelResult};
use crate::function::{LinearFunction, Objective};
use crate::group::{Group, Layouts};
use crate::log;
use crate::modification::{
    Addressing, ModKind, ModParam, Modification, Notifier, Outcome, Selection,
};
use crate::state::{GenerationState, StepAction};
use crate::topology::{DataHandle, DcNetworkData, LineType, NetworkData, NetworkDescriptor};
use crate::utils::{broadcast, dot_product};
use crate::variable::{
    BlockId, ColVariable, Grid, VarRef, VariableLookup, VariableStore,
};

/// Contract shared by every network block: node injections per interval,
/// a demand per (interval, node) and externally computed injection bounds.
pub trait NetworkBlock: Block {
    fn number_nodes(&self) -> usize;

    fn number_intervals(&self) -> usize;

    /// Demand of every node at `interval`, `None` past the last interval
    fn active_demand(&self, interval: usize) -> Option<Vec<f64>>;

    fn node_injection(&self, interval: usize, node: usize) -> Option<VarRef>;

    fn set_node_injection_bounds(
        &mut self,
        min: &[f64],
        max: &[f64],
        physical_mode: ModParam,
        abstract_mode: ModParam,
    ) -> ModelResult<Outcome>;
}

/// The flow-limit family, one variant per line classification
#[derive(Debug, Clone, PartialEq)]
pub enum FlowLimits {
    None,
    /// `kappa * min <= flow <= kappa * max`
    Hvdc(Family<BoxConstraint>),
    /// Distribution factor rows over the node injections
    Ac(Family<RowConstraint>),
    /// Distribution factor rows for AC lines, identity rows for HVDC ones
    Hybrid(Family<RowConstraint>),
}

impl FlowLimits {
    pub fn len(&self) -> usize {
        match self {
            FlowLimits::None => 0,
            FlowLimits::Hvdc(f) => f.len(),
            FlowLimits::Ac(f) | FlowLimits::Hybrid(f) => f.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bounds of the limit of `line` at `interval`
    pub fn bounds(&self, interval: usize, line: usize) -> Option<(f64, f64)> {
        match self {
            FlowLimits::None => None,
            FlowLimits::Hvdc(f) => f.get(interval, line).map(|c| (c.lhs, c.rhs)),
            FlowLimits::Ac(f) | FlowLimits::Hybrid(f) => {
                f.get(interval, line).map(|c| (c.lhs, c.rhs))
            }
        }
    }

    fn set_bounds(&mut self, interval: usize, line: usize, lhs: f64, rhs: f64) {
        match self {
            FlowLimits::None => {}
            FlowLimits::Hvdc(f) => {
                if let Some(c) = f.get_mut(interval, line) {
                    c.lhs = lhs;
                    c.rhs = rhs;
                }
            }
            FlowLimits::Ac(f) | FlowLimits::Hybrid(f) => {
                if let Some(c) = f.get_mut(interval, line) {
                    c.lhs = lhs;
                    c.rhs = rhs;
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        match self {
            FlowLimits::None => "none",
            FlowLimits::Hvdc(f) => f.name(),
            FlowLimits::Ac(f) | FlowLimits::Hybrid(f) => f.name(),
        }
    }

    fn visit(&self, f: &mut dyn FnMut(&'static str, usize, ConstraintRef<'_>)) {
        match self {
            FlowLimits::None => {}
            FlowLimits::Hvdc(family) => family.visit(f),
            FlowLimits::Ac(family) | FlowLimits::Hybrid(family) => family.visit(f),
        }
    }
}

/// Every constraint family of a network block
#[derive(Debug, Clone, PartialEq)]
struct NetworkConstraints {
    flow_limits: FlowLimits,
    injection_balance: Family<RowConstraint>,
    flow_definition: Family<RowConstraint>,
    system_balance: Family<RowConstraint>,
    relax_abs: Family<RowConstraint>,
    injection_bounds: Family<BoxConstraint>,
    /// Lines with a distribution factor row, in row order
    ac_lines: Vec<usize>,
}

impl NetworkConstraints {
    fn empty() -> Self {
        Self {
            flow_limits: FlowLimits::None,
            injection_balance: Family::new("HVDC_power_flow_injection", 0),
            flow_definition: Family::new("AC_power_flow_definition", 0),
            system_balance: Family::new("system_balance", 1),
            relax_abs: Family::new("power_flow_relax_abs", 0),
            injection_bounds: Family::new("Node_Injection_Bound_Const_Network", 0),
            ac_lines: vec![],
        }
    }
}

/// Network block over a DC topology.
///
/// The topology is classified once, when the constraints are generated,
/// and the matching flow-limit family is built: box constraints on the
/// flows for HVDC networks, distribution factor rows for AC networks and
/// a mix of both for hybrid ones. A single node network (a bus) has no
/// abstract representation of its own: the parent balances it.
#[derive(Debug)]
pub struct DcNetworkBlock {
    id: BlockId,
    state: GenerationState,
    config: Option<BlockConfig>,
    notifier: Notifier,
    network_data: Option<DataHandle<NetworkData>>,
    /// Node count when no descriptor is attached
    nodes_without_data: usize,
    number_intervals: usize,
    /// `intervals x nodes`, empty means all zero
    active_demand: Vec<f64>,
    /// One per line, empty means all one
    kappa: Vec<f64>,
    constant_term: f64,
    min_injection: Vec<f64>,
    max_injection: Vec<f64>,
    store: VariableStore,
    node_injection: Grid,
    power_flow: Grid,
    auxiliary: Grid,
    constraints: NetworkConstraints,
    objective: Option<Objective>,
    layouts: Layouts,
}

impl Default for DcNetworkBlock {
    fn default() -> Self {
        Self::new()
    }
}

impl DcNetworkBlock {
    /// A bus over a single interval.
    pub fn new() -> Self {
        let id = BlockId::fresh();
        Self {
            id,
            state: GenerationState::Empty,
            config: None,
            notifier: Notifier::new(),
            network_data: None,
            nodes_without_data: 1,
            number_intervals: 1,
            active_demand: vec![],
            kappa: vec![],
            constant_term: 0.0,
            min_injection: vec![f64::NEG_INFINITY],
            max_injection: vec![f64::INFINITY],
            store: VariableStore::new(id),
            node_injection: Grid::default(),
            power_flow: Grid::default(),
            auxiliary: Grid::default(),
            constraints: NetworkConstraints::empty(),
            objective: None,
            layouts: Layouts::default(),
        }
    }

    pub fn with_network_data(data: DataHandle<NetworkData>) -> Self {
        let mut block = Self::new();
        block.attach(data);
        block
    }

    fn attach(&mut self, data: DataHandle<NetworkData>) {
        self.network_data = Some(data);
        self.active_demand.clear();
        self.kappa.clear();
        self.reset_injection_bounds();
    }

    fn reset_injection_bounds(&mut self) {
        let size = self.number_intervals * self.number_nodes();
        self.min_injection = vec![f64::NEG_INFINITY; size];
        self.max_injection = vec![f64::INFINITY; size];
    }

    /// Replaces the descriptor. Physical data sized on the old one
    /// (demand, kappa, injection bounds) is reset.
    pub fn set_network_data(&mut self, data: DataHandle<NetworkData>) -> ModelResult<()> {
        if self.state.has_variables() {
            return Err(ModelError::TopologyFrozen(format!(
                "block {} already has an abstract representation",
                self.id
            )));
        }
        self.attach(data);
        Ok(())
    }

    pub fn network_data(&self) -> Option<&NetworkData> {
        self.network_data.as_ref().map(|h| h.get())
    }

    /// Mutable access to an owned descriptor, available until variables
    /// are generated.
    pub fn network_data_mut(&mut self) -> ModelResult<&mut NetworkData> {
        if self.state.has_variables() {
            return Err(ModelError::TopologyFrozen(format!(
                "block {} already has an abstract representation",
                self.id
            )));
        }
        match self.network_data.as_mut() {
            None => Err(ModelError::InvalidTopology(
                "no network data attached".to_string(),
            )),
            Some(handle) => handle.get_mut().ok_or_else(|| {
                ModelError::TopologyFrozen("network data is shared".to_string())
            }),
        }
    }

    fn descriptor(&self) -> Option<&dyn NetworkDescriptor> {
        self.network_data().map(|d| d.descriptor())
    }

    pub fn set_notifier(&mut self, notifier: Notifier) {
        self.notifier = notifier;
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn set_config(&mut self, config: BlockConfig) {
        self.config = Some(config);
    }

    pub fn set_number_intervals(&mut self, intervals: usize) -> ModelResult<()> {
        if self.state.has_variables() {
            return Err(ModelError::TopologyFrozen(
                "the number of intervals is fixed once variables exist".to_string(),
            ));
        }
        if intervals == 0 {
            return Err(ModelError::InvalidTopology(
                "a network needs at least one interval".to_string(),
            ));
        }
        self.number_intervals = intervals;
        self.active_demand.clear();
        self.reset_injection_bounds();
        Ok(())
    }

    pub fn number_lines(&self) -> usize {
        self.descriptor().map_or(0, |d| d.number_lines())
    }

    /// Classification of the current descriptor
    pub fn lines_type(&self) -> LineType {
        self.descriptor().map_or(LineType::None, |d| d.lines_type())
    }

    /// `None` past the last line
    pub fn kappa(&self, line: usize) -> Option<f64> {
        (line < self.number_lines()).then(|| self.kappa_at(line))
    }

    fn kappa_at(&self, line: usize) -> f64 {
        self.kappa.get(line).copied().unwrap_or(1.0)
    }

    fn demand_at(&self, interval: usize, node: usize) -> f64 {
        if self.active_demand.is_empty() {
            0.0
        } else {
            self.active_demand[interval * self.number_nodes() + node]
        }
    }

    pub fn constant_term(&self) -> f64 {
        self.constant_term
    }

    pub fn set_constant_term(&mut self, constant: f64) {
        self.constant_term = constant;
        if let Some(objective) = self.objective.as_mut() {
            objective.function.set_constant(constant);
        }
    }

    pub fn has_cost(&self) -> bool {
        self.descriptor()
            .is_some_and(|d| d.network_cost().iter().any(|c| *c != 0.0))
    }

    pub fn node_injection_bounds(&self) -> (&[f64], &[f64]) {
        (&self.min_injection, &self.max_injection)
    }

    pub fn power_flow(&self, interval: usize, line: usize) -> Option<VarRef> {
        if self.power_flow.is_empty() {
            return None;
        }
        Some(self.store.at(&self.power_flow, interval, line))
    }

    pub fn auxiliary_variables(&self) -> Grid {
        self.auxiliary
    }

    pub fn flow_limits(&self) -> &FlowLimits {
        &self.constraints.flow_limits
    }

    pub fn injection_balance(&self) -> &Family<RowConstraint> {
        &self.constraints.injection_balance
    }

    pub fn flow_definition(&self) -> &Family<RowConstraint> {
        &self.constraints.flow_definition
    }

    pub fn system_balance(&self) -> &Family<RowConstraint> {
        &self.constraints.system_balance
    }

    pub fn relax_abs(&self) -> &Family<RowConstraint> {
        &self.constraints.relax_abs
    }

    pub fn injection_bounds(&self) -> &Family<BoxConstraint> {
        &self.constraints.injection_bounds
    }

    pub fn objective(&self) -> Option<&Objective> {
        self.objective.as_ref()
    }

    pub fn variable_store(&self) -> &VariableStore {
        &self.store
    }

    pub fn variable_store_mut(&mut self) -> &mut VariableStore {
        &mut self.store
    }

    /// Plain byte streams carry no schema; use `deserialize`.
    pub fn load(&mut self, _reader: &mut dyn Read) -> ModelResult<()> {
        Err(ModelError::UnsupportedOperation(
            "DCNetworkBlock cannot be loaded from a plain stream".to_string(),
        ))
    }

    // Bounds of the flow limit of `line` at `interval`.
    fn flow_limit_range(
        &self,
        d: &dyn NetworkDescriptor,
        line_type: LineType,
        interval: usize,
        line: usize,
    ) -> (f64, f64) {
        let kappa = self.kappa_at(line);
        let lo = kappa * d.min_power_flow()[line];
        let hi = kappa * d.max_power_flow()[line];
        if line_type == LineType::Hvdc || d.is_hvdc_line(line) {
            (lo, hi)
        } else {
            let shift = self.ptdf_demand(d, interval, line);
            (lo + shift, hi + shift)
        }
    }

    // Flow on `line` caused by the demand of `interval` alone.
    fn ptdf_demand(&self, d: &dyn NetworkDescriptor, interval: usize, line: usize) -> f64 {
        let nodes = d.number_nodes();
        let row: Vec<f64> = (0..nodes).map(|n| d.ptdf_entry(line, n)).collect();
        let demand: Vec<f64> = (0..nodes).map(|n| self.demand_at(interval, n)).collect();
        dot_product(&row, &demand)
    }

    fn total_demand(&self, interval: usize) -> f64 {
        (0..self.number_nodes())
            .map(|n| self.demand_at(interval, n))
            .sum()
    }

    // Distribution factor expression of an AC line: injections minus the
    // shift due to the HVDC flows.
    fn ac_expression(
        &self,
        d: &dyn NetworkDescriptor,
        interval: usize,
        line: usize,
    ) -> LinearFunction {
        let mut lf = LinearFunction::new();
        for n in 0..d.number_nodes() {
            lf.add_variable(
                self.store.at(&self.node_injection, interval, n),
                d.ptdf_entry(line, n),
            );
        }
        for k in 0..d.number_lines() {
            if !d.is_hvdc_line(k) {
                continue;
            }
            let shift =
                d.ptdf_entry(line, d.start_line()[k]) - d.ptdf_entry(line, d.end_line()[k]);
            if shift != 0.0 {
                lf.add_variable(self.store.at(&self.power_flow, interval, k), -shift);
            }
        }
        lf
    }

    fn build_constraints(
        &self,
        d: &dyn NetworkDescriptor,
        line_type: LineType,
    ) -> NetworkConstraints {
        let intervals = self.number_intervals;
        let nodes = d.number_nodes();
        let lines = d.number_lines();
        let mut c = NetworkConstraints::empty();

        match line_type {
            LineType::Hvdc => {
                let mut limits = Family::new("HVDC_power_flow_limit", lines);
                let mut balance = Family::new("HVDC_power_flow_injection", nodes);
                for t in 0..intervals {
                    for l in 0..lines {
                        let (lo, hi) = self.flow_limit_range(d, line_type, t, l);
                        limits.push(BoxConstraint::new(
                            self.store.at(&self.power_flow, t, l),
                            lo,
                            hi,
                        ));
                    }
                    for n in 0..nodes {
                        let mut lf = LinearFunction::new();
                        lf.add_variable(self.store.at(&self.node_injection, t, n), -1.0);
                        for l in 0..lines {
                            let flow = self.store.at(&self.power_flow, t, l);
                            if d.start_line()[l] == n {
                                lf.add_variable(flow, 1.0);
                            }
                            if d.end_line()[l] == n {
                                lf.add_variable(flow, -1.0);
                            }
                        }
                        balance.push(RowConstraint::equality(lf, -self.demand_at(t, n)));
                    }
                }
                c.flow_limits = FlowLimits::Hvdc(limits);
                c.injection_balance = balance;
            }
            LineType::Ac | LineType::Hybrid => {
                let name = if line_type == LineType::Ac {
                    "AC_power_flow_limit"
                } else {
                    "AC_HVDC_power_flow_limit"
                };
                c.ac_lines = (0..lines).filter(|l| !d.is_hvdc_line(*l)).collect();
                let mut limits = Family::new(name, lines);
                let mut definition =
                    Family::new("AC_power_flow_definition", c.ac_lines.len());
                for t in 0..intervals {
                    for l in 0..lines {
                        let flow = self.store.at(&self.power_flow, t, l);
                        let (lo, hi) = self.flow_limit_range(d, line_type, t, l);
                        if d.is_hvdc_line(l) {
                            let lf = LinearFunction::from_terms(vec![(flow, 1.0)]);
                            limits.push(RowConstraint::new(lf, lo, hi));
                            continue;
                        }
                        let expression = self.ac_expression(d, t, l);
                        limits.push(RowConstraint::new(expression.clone(), lo, hi));

                        let mut lf = LinearFunction::new();
                        lf.add_variable(flow, 1.0);
                        for (var, coefficient) in expression.terms() {
                            lf.add_variable(*var, -coefficient);
                        }
                        definition.push(RowConstraint::equality(
                            lf,
                            -self.ptdf_demand(d, t, l),
                        ));
                    }
                    let lf = LinearFunction::from_terms(
                        (0..nodes)
                            .map(|n| (self.store.at(&self.node_injection, t, n), 1.0))
                            .collect(),
                    );
                    c.system_balance
                        .push(RowConstraint::equality(lf, self.total_demand(t)));
                }
                c.flow_limits = if line_type == LineType::Ac {
                    FlowLimits::Ac(limits)
                } else {
                    FlowLimits::Hybrid(limits)
                };
                c.flow_definition = definition;
            }
            LineType::None => {}
        }

        if !self.auxiliary.is_empty() {
            // aux - F >= 0 for every line, then aux + F >= 0
            let mut relax = Family::new("power_flow_relax_abs", 2 * lines);
            for t in 0..intervals {
                for sign in [-1.0, 1.0] {
                    for l in 0..lines {
                        let lf = LinearFunction::from_terms(vec![
                            (self.store.at(&self.power_flow, t, l), sign),
                            (self.store.at(&self.auxiliary, t, l), 1.0),
                        ]);
                        relax.push(RowConstraint::new(lf, 0.0, f64::INFINITY));
                    }
                }
            }
            c.relax_abs = relax;
        }

        let mut bounds = Family::new("Node_Injection_Bound_Const_Network", nodes);
        for t in 0..intervals {
            for n in 0..nodes {
                let i = t * nodes + n;
                bounds.push(BoxConstraint::new(
                    self.store.at(&self.node_injection, t, n),
                    self.min_injection[i],
                    self.max_injection[i],
                ));
            }
        }
        c.injection_bounds = bounds;
        c
    }

    /// Sets `kappa` on the lines of `subset`.
    pub fn set_kappa_subset(
        &mut self,
        values: &[f64],
        subset: &[usize],
        sorted: bool,
        physical_mode: ModParam,
        abstract_mode: ModParam,
    ) -> ModelResult<Outcome> {
        let lines = self.number_lines();
        match Selection::subset(subset, sorted, lines, values, "line")? {
            Some(sel) => self.update_kappa(sel, values, physical_mode, abstract_mode),
            None => Ok(Outcome::Unchanged),
        }
    }

    /// Sets `kappa` on the lines of `range`.
    pub fn set_kappa_range(
        &mut self,
        values: &[f64],
        range: Range<usize>,
        physical_mode: ModParam,
        abstract_mode: ModParam,
    ) -> ModelResult<Outcome> {
        let lines = self.number_lines();
        match Selection::range(range, lines, values, "line")? {
            Some(sel) => self.update_kappa(sel, values, physical_mode, abstract_mode),
            None => Ok(Outcome::Unchanged),
        }
    }

    fn update_kappa(
        &mut self,
        sel: Selection,
        values: &[f64],
        physical_mode: ModParam,
        abstract_mode: ModParam,
    ) -> ModelResult<Outcome> {
        if !sel.differs(&self.kappa, 1.0, values) {
            log::unchanged_update(self.id, "kappa");
            return Ok(Outcome::Unchanged);
        }
        if !physical_mode.writes() {
            return Ok(Outcome::DryRun);
        }
        let lines = self.number_lines();
        sel.write(&mut self.kappa, lines, 1.0, values);
        log::physical_update(self.id, "kappa", sel.indices.len());
        if abstract_mode.writes() && self.state.has_constraints() {
            self.patch_flow_limits(&sel.indices, abstract_mode);
        }
        self.notifier
            .issue_if(physical_mode, || sel.record(self.id, ModKind::Kappa));
        Ok(Outcome::Applied)
    }

    fn patch_flow_limits(&mut self, lines: &[usize], abstract_mode: ModParam) {
        let Some(d) = self.descriptor() else {
            return;
        };
        let line_type = self.constraints_line_type();
        if line_type == LineType::None {
            return;
        }
        let mut updates = vec![];
        for t in 0..self.number_intervals {
            for l in lines {
                let (lo, hi) = self.flow_limit_range(d, line_type, t, *l);
                updates.push((t, *l, lo, hi));
            }
        }
        let family = self.constraints.flow_limits.name();
        for (t, l, lo, hi) in updates.iter() {
            self.constraints.flow_limits.set_bounds(*t, *l, *lo, *hi);
        }
        log::patch_summary(self.id, family, updates.len(), abstract_mode.channel().is_some());
    }

    /// Sets the demand of the flattened `(interval, node)` entries of
    /// `subset`.
    pub fn set_active_demand_subset(
        &mut self,
        values: &[f64],
        subset: &[usize],
        sorted: bool,
        physical_mode: ModParam,
        abstract_mode: ModParam,
    ) -> ModelResult<Outcome> {
        let extent = self.number_intervals * self.number_nodes();
        match Selection::subset(subset, sorted, extent, values, "demand")? {
            Some(sel) => self.update_demand(sel, values, physical_mode, abstract_mode),
            None => Ok(Outcome::Unchanged),
        }
    }

    pub fn set_active_demand_range(
        &mut self,
        values: &[f64],
        range: Range<usize>,
        physical_mode: ModParam,
        abstract_mode: ModParam,
    ) -> ModelResult<Outcome> {
        let extent = self.number_intervals * self.number_nodes();
        match Selection::range(range, extent, values, "demand")? {
            Some(sel) => self.update_demand(sel, values, physical_mode, abstract_mode),
            None => Ok(Outcome::Unchanged),
        }
    }

    fn update_demand(
        &mut self,
        sel: Selection,
        values: &[f64],
        physical_mode: ModParam,
        abstract_mode: ModParam,
    ) -> ModelResult<Outcome> {
        if !sel.differs(&self.active_demand, 0.0, values) {
            log::unchanged_update(self.id, "active demand");
            return Ok(Outcome::Unchanged);
        }
        if !physical_mode.writes() {
            return Ok(Outcome::DryRun);
        }
        let extent = self.number_intervals * self.number_nodes();
        sel.write(&mut self.active_demand, extent, 0.0, values);
        log::physical_update(self.id, "active demand", sel.indices.len());
        if abstract_mode.writes() && self.state.has_constraints() {
            self.patch_demand(&sel.indices, abstract_mode);
        }
        self.notifier
            .issue_if(physical_mode, || sel.record(self.id, ModKind::ActiveDemand));
        Ok(Outcome::Applied)
    }

    fn patch_demand(&mut self, entries: &[usize], abstract_mode: ModParam) {
        let Some(d) = self.descriptor() else {
            return;
        };
        let nodes = d.number_nodes();
        let notify = abstract_mode.channel().is_some();
        let line_type = self.constraints_line_type();
        match line_type {
            LineType::None => {}
            LineType::Hvdc => {
                let updates: Vec<(usize, usize, f64)> = entries
                    .iter()
                    .map(|i| (i / nodes, i % nodes, -self.active_demand[*i]))
                    .collect();
                for (t, n, rhs) in updates.iter() {
                    if let Some(c) = self.constraints.injection_balance.get_mut(*t, *n) {
                        c.set_both(*rhs);
                    }
                }
                log::patch_summary(self.id, "HVDC_power_flow_injection", updates.len(), notify);
            }
            LineType::Ac | LineType::Hybrid => {
                let mut intervals: Vec<usize> = entries.iter().map(|i| i / nodes).collect();
                intervals.sort_unstable();
                intervals.dedup();
                let mut limits = vec![];
                let mut definitions = vec![];
                let mut balances = vec![];
                for t in intervals.iter() {
                    for (pos, l) in self.constraints.ac_lines.iter().enumerate() {
                        let (lo, hi) = self.flow_limit_range(d, line_type, *t, *l);
                        limits.push((*t, *l, lo, hi));
                        definitions.push((*t, pos, -self.ptdf_demand(d, *t, *l)));
                    }
                    balances.push((*t, self.total_demand(*t)));
                }
                for (t, l, lo, hi) in limits.iter() {
                    self.constraints.flow_limits.set_bounds(*t, *l, *lo, *hi);
                }
                for (t, pos, rhs) in definitions.iter() {
                    if let Some(c) = self.constraints.flow_definition.get_mut(*t, *pos) {
                        c.set_both(*rhs);
                    }
                }
                for (t, rhs) in balances.iter() {
                    if let Some(c) = self.constraints.system_balance.get_mut(*t, 0) {
                        c.set_both(*rhs);
                    }
                }
                let family = self.constraints.flow_limits.name();
                log::patch_summary(self.id, family, limits.len(), notify);
                log::patch_summary(self.id, "AC_power_flow_definition", definitions.len(), notify);
                log::patch_summary(self.id, "system_balance", balances.len(), notify);
            }
        }
    }

    fn constraints_line_type(&self) -> LineType {
        match &self.constraints.flow_limits {
            FlowLimits::None => LineType::None,
            FlowLimits::Hvdc(_) => LineType::Hvdc,
            FlowLimits::Ac(_) => LineType::Ac,
            FlowLimits::Hybrid(_) => LineType::Hybrid,
        }
    }

    /// Reads the block from `group`. When the group holds `NumberNodes`,
    /// a descriptor is read from it and owned by the block.
    pub fn deserialize(group: &Group) -> ModelResult<Self> {
        let mut block = Self::new();
        block.number_intervals = group.dim("NumberIntervals").unwrap_or(1);
        if block.number_intervals == 0 {
            return Err(ModelError::InvalidTopology(
                "NumberIntervals must be positive".to_string(),
            ));
        }
        let demand = group.double("ActiveDemand")?;
        if group.dim("NumberNodes").is_some() {
            let data = DcNetworkData::deserialize(group)?;
            block.attach(DataHandle::owned(NetworkData::Dc(data)));
        } else if let Some(demand) = &demand {
            block.nodes_without_data = (demand.len() / block.number_intervals).max(1);
            block.reset_injection_bounds();
        }
        if let Some(demand) = demand {
            let expected = block.number_intervals * block.number_nodes();
            block.active_demand = broadcast(&demand, expected, "ActiveDemand")?;
        }
        if let Some(kappa) = group.double("Kappa")? {
            block.kappa = broadcast(&kappa, block.number_lines(), "Kappa")?;
        }
        if let Some(constant) = group.double("ConstantTerm")? {
            block.constant_term = constant.first().copied().unwrap_or(0.0);
        }
        block.layouts = Layouts::of(group);
        Ok(block)
    }

    pub fn serialize(&self, group: &mut Group) {
        let nodes_dim = match self.network_data() {
            Some(data) => {
                data.serialize(group);
                "NumberNodes"
            }
            None => {
                group.set_dim("__NumberNodes__", self.number_nodes());
                "__NumberNodes__"
            }
        };
        let layouts = &self.layouts;
        if self.number_intervals > 1 || layouts.has_dim("NumberIntervals") {
            group.set_dim("NumberIntervals", self.number_intervals);
        }
        if !self.active_demand.is_empty() || layouts.has_array("ActiveDemand") {
            let nodes = self.number_nodes();
            let demand: Vec<f64> = (0..self.number_intervals * nodes)
                .map(|i| self.demand_at(i / nodes, i % nodes))
                .collect();
            let dims = if self.number_intervals > 1 {
                vec!["NumberIntervals", nodes_dim]
            } else {
                vec![nodes_dim]
            };
            layouts.put_double(group, "ActiveDemand", &dims, &demand);
        }
        if !self.kappa.is_empty() || layouts.has_array("Kappa") {
            let kappa: Vec<f64> = (0..self.number_lines()).map(|l| self.kappa_at(l)).collect();
            layouts.put_double(group, "Kappa", &["NumberLines"], &kappa);
        }
        if self.constant_term != 0.0 || layouts.has_array("ConstantTerm") {
            layouts.put_double(group, "ConstantTerm", &[], &[self.constant_term]);
        }
    }
}

impl VariableLookup for DcNetworkBlock {
    fn lookup(&self, var: VarRef) -> Option<&ColVariable> {
        self.store.lookup(var)
    }
}

impl Block for DcNetworkBlock {
    fn id(&self) -> BlockId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "DCNetworkBlock"
    }

    fn generation_state(&self) -> GenerationState {
        self.state
    }

    fn generate_variables(&mut self) -> ModelResult<()> {
        if self.state.begin(GenerationState::VariablesGenerated)? == StepAction::Skip {
            return Ok(());
        }
        let nodes = self.number_nodes();
        if nodes > 1 {
            let intervals = self.number_intervals;
            let lines = self.number_lines();
            self.node_injection =
                self.store.add_grid(intervals, nodes, ColVariable::continuous());
            if lines > 0 {
                self.power_flow =
                    self.store.add_grid(intervals, lines, ColVariable::continuous());
                if self.has_cost() {
                    self.auxiliary =
                        self.store.add_grid(intervals, lines, ColVariable::continuous());
                }
            }
        }
        self.state = GenerationState::VariablesGenerated;
        log::generation_summary(self.kind(), self.id, "variables", self.store.len());
        Ok(())
    }

    fn generate_constraints(&mut self) -> ModelResult<()> {
        if self.state.begin(GenerationState::ConstraintsGenerated)? == StepAction::Skip {
            return Ok(());
        }
        if self.number_nodes() > 1 {
            let d = self.descriptor().ok_or_else(|| {
                ModelError::InvalidTopology(
                    "a multi-node network needs network data".to_string(),
                )
            })?;
            if d.number_lines() == 0 {
                return Err(ModelError::InvalidTopology(format!(
                    "network with {} nodes has no lines",
                    d.number_nodes()
                )));
            }
            d.check_shape()?;
            let line_type = d.lines_type();
            if matches!(line_type, LineType::Ac | LineType::Hybrid) && d.ptdf().is_none() {
                return Err(ModelError::InvalidTopology(
                    "AC lines need a PTDF matrix".to_string(),
                ));
            }
            self.constraints = self.build_constraints(d, line_type);
        }
        self.state = GenerationState::ConstraintsGenerated;
        log::generation_summary(self.kind(), self.id, "constraints", self.num_constraints());
        Ok(())
    }

    fn generate_objective(&mut self) -> ModelResult<()> {
        if self.state.begin(GenerationState::ObjectiveGenerated)? == StepAction::Skip {
            return Ok(());
        }
        let mut lf = LinearFunction::new();
        if let Some(d) = self.descriptor() {
            if !self.auxiliary.is_empty() {
                for t in 0..self.number_intervals {
                    for (l, cost) in d.network_cost().iter().enumerate() {
                        lf.add_variable(self.store.at(&self.auxiliary, t, l), *cost);
                    }
                }
            }
        }
        lf.set_constant(self.constant_term);
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
        let c = &self.constraints;
        c.flow_limits.visit(f);
        c.injection_balance.visit(f);
        c.flow_definition.visit(f);
        c.system_balance.visit(f);
        c.relax_abs.visit(f);
        c.injection_bounds.visit(f);
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

impl NetworkBlock for DcNetworkBlock {
    fn number_nodes(&self) -> usize {
        self.descriptor()
            .map_or(self.nodes_without_data, |d| d.number_nodes())
    }

    fn number_intervals(&self) -> usize {
        self.number_intervals
    }

    fn active_demand(&self, interval: usize) -> Option<Vec<f64>> {
        if interval >= self.number_intervals {
            return None;
        }
        Some(
            (0..self.number_nodes())
                .map(|n| self.demand_at(interval, n))
                .collect(),
        )
    }

    fn node_injection(&self, interval: usize, node: usize) -> Option<VarRef> {
        if self.node_injection.is_empty() {
            return None;
        }
        Some(self.store.at(&self.node_injection, interval, node))
    }

    /// Bounds are given per flattened `(interval, node)` entry.
    fn set_node_injection_bounds(
        &mut self,
        min: &[f64],
        max: &[f64],
        physical_mode: ModParam,
        abstract_mode: ModParam,
    ) -> ModelResult<Outcome> {
        let size = self.number_intervals * self.number_nodes();
        if min.len() != size {
            return Err(ModelError::shape("MinNodeInjection", size, min.len()));
        }
        if max.len() != size {
            return Err(ModelError::shape("MaxNodeInjection", size, max.len()));
        }
        if min == self.min_injection.as_slice() && max == self.max_injection.as_slice() {
            log::unchanged_update(self.id, "node injection bounds");
            return Ok(Outcome::Unchanged);
        }
        if !physical_mode.writes() {
            return Ok(Outcome::DryRun);
        }
        self.min_injection = min.to_vec();
        self.max_injection = max.to_vec();
        log::physical_update(self.id, "node injection bounds", size);
        if abstract_mode.writes() && !self.constraints.injection_bounds.is_empty() {
            for (i, c) in self.constraints.injection_bounds.iter_mut().enumerate() {
                c.lhs = min[i];
                c.rhs = max[i];
            }
            log::patch_summary(
                self.id,
                "Node_Injection_Bound_Const_Network",
                size,
                abstract_mode.channel().is_some(),
            );
        }
        self.notifier.issue_if(physical_mode, || Modification {
            block: self.id,
            kind: ModKind::NodeInjectionBounds,
            addressing: Addressing::Range(0..size),
        });
        Ok(Outcome::Applied)
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::config::FeasibilityConfig;
    use crate::modification::ChannelName;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Distribution, Normal};
    use rand_xoshiro::Xoshiro256PlusPlus;

    fn three_node_data() -> DcNetworkData {
        DcNetworkData::new(3, vec![0, 1], vec![1, 2], vec![-10.0; 2], vec![10.0; 2])
            .unwrap()
    }

    fn three_node_block(data: DcNetworkData) -> DcNetworkBlock {
        let mut block =
            DcNetworkBlock::with_network_data(DataHandle::owned(NetworkData::Dc(data)));
        block
            .set_active_demand_range(
                &[5.0, 0.0, -5.0],
                0..3,
                ModParam::ApplyNoNotify,
                ModParam::ApplyNoNotify,
            )
            .unwrap();
        block
    }

    // PTDF of the chain 0 - 1 - 2 with node 2 as slack and unit susceptance
    fn chain_ptdf() -> Vec<f64> {
        vec![1.0, 0.0, 0.0, 1.0, 1.0, 0.0]
    }

    fn apply() -> ModParam {
        ModParam::Apply(ChannelName::default())
    }

    #[test]
    fn test_hvdc_generation() {
        let mut block = three_node_block(three_node_data());
        block.generate_all().unwrap();
        match block.flow_limits() {
            FlowLimits::Hvdc(family) => {
                assert_eq!(family.len(), 2);
                for c in family.iter() {
                    assert_eq!((c.lhs, c.rhs), (-10.0, 10.0));
                }
            }
            other => panic!("unexpected flow limits {other:?}"),
        }
        let balance = block.injection_balance();
        assert_eq!(balance.len(), 3);
        let rhs: Vec<f64> = balance.iter().map(|c| c.rhs).collect();
        assert_eq!(rhs, vec![-5.0, 0.0, 5.0]);
        assert!(balance.iter().all(|c| c.lhs == c.rhs));
        // node 1 is the end of line 0 and the start of line 1
        let middle = balance.get(0, 1).unwrap();
        assert_eq!(middle.function.num_terms(), 3);
        assert_eq!(block.injection_bounds().len(), 3);
    }

    #[test]
    fn test_set_kappa_patches_bounds_and_notifies_once() {
        let mut block = three_node_block(three_node_data());
        block.generate_all().unwrap();
        let rx = block.notifier().subscribe(ChannelName::default());
        let outcome = block
            .set_kappa_subset(&[2.0, 2.0], &[0, 1], true, apply(), apply())
            .unwrap();
        assert_eq!(outcome, Outcome::Applied);
        assert_eq!(block.flow_limits().bounds(0, 0), Some((-20.0, 20.0)));
        assert_eq!(block.flow_limits().bounds(0, 1), Some((-20.0, 20.0)));
        let records: Vec<Modification> = rx.try_iter().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ModKind::Kappa);
        assert_eq!(records[0].addressing, Addressing::Subset(vec![0, 1]));
    }

    #[test]
    fn test_no_cost_means_no_auxiliary() {
        let data = three_node_data().with_network_cost(vec![0.0, 0.0]).unwrap();
        let mut block = three_node_block(data);
        block.set_constant_term(4.0);
        block.generate_all().unwrap();
        assert!(block.auxiliary_variables().is_empty());
        assert!(block.relax_abs().is_empty());
        let objective = block.objective().unwrap();
        assert_eq!(objective.function.num_terms(), 0);
        assert_eq!(objective.function.constant(), 4.0);
    }

    #[test]
    fn test_cost_adds_absolute_value_rows() {
        let data = three_node_data().with_network_cost(vec![1.0, 3.0]).unwrap();
        let mut block = three_node_block(data);
        block.generate_all().unwrap();
        assert_eq!(block.auxiliary_variables().len(), 2);
        assert_eq!(block.relax_abs().len(), 4);
        assert_eq!(block.objective().unwrap().function.num_terms(), 2);
    }

    #[test]
    fn test_generation_is_idempotent() {
        let mut block = three_node_block(three_node_data());
        block.generate_all().unwrap();
        let vars = block.num_variables();
        let constraints = block.constraints.clone();
        block.generate_all().unwrap();
        assert_eq!(block.num_variables(), vars);
        assert_eq!(block.constraints, constraints);
    }

    #[test]
    fn test_out_of_order_generation_fails() {
        let mut block = three_node_block(three_node_data());
        assert!(matches!(
            block.generate_constraints(),
            Err(ModelError::OutOfOrder { .. })
        ));
    }

    #[test]
    fn test_multi_node_without_lines_is_invalid() {
        let mut group = Group::new();
        group.put_double("ActiveDemand", &["__NumberNodes__"], vec![1.0, 2.0]);
        let mut block = DcNetworkBlock::deserialize(&group).unwrap();
        assert_eq!(block.number_nodes(), 2);
        block.generate_variables().unwrap();
        assert!(matches!(
            block.generate_constraints(),
            Err(ModelError::InvalidTopology(_))
        ));
        assert_eq!(block.generation_state(), GenerationState::VariablesGenerated);
    }

    #[test]
    fn test_bus_has_no_representation() {
        let mut block = DcNetworkBlock::new();
        block.generate_all().unwrap();
        assert_eq!(block.num_variables(), 0);
        assert_eq!(block.num_constraints(), 0);
        assert!(block.is_feasible(None).unwrap());
    }

    #[test]
    fn test_same_demand_is_a_no_op() {
        let mut block = three_node_block(three_node_data());
        block.generate_all().unwrap();
        let rx = block.notifier().subscribe(ChannelName::default());
        let before = block.injection_balance().clone();
        let outcome = block
            .set_active_demand_subset(&[0.0, 5.0], &[1, 0], false, apply(), apply())
            .unwrap();
        assert_eq!(outcome, Outcome::Unchanged);
        assert_eq!(block.injection_balance(), &before);
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn test_default_kappa_is_not_materialised() {
        let mut block = three_node_block(three_node_data());
        let outcome = block
            .set_kappa_range(&[1.0, 1.0], 0..2, apply(), apply())
            .unwrap();
        assert_eq!(outcome, Outcome::Unchanged);
        assert!(block.kappa.is_empty());
    }

    #[test]
    fn test_dry_run_leaves_everything_untouched() {
        let mut block = three_node_block(three_node_data());
        block.generate_all().unwrap();
        let rx = block.notifier().subscribe(ChannelName::default());
        let outcome = block
            .set_kappa_range(&[3.0], 1..2, ModParam::DryRun, apply())
            .unwrap();
        assert_eq!(outcome, Outcome::DryRun);
        assert_eq!(block.kappa(1), Some(1.0));
        assert_eq!(block.flow_limits().bounds(0, 1), Some((-10.0, 10.0)));
        assert_eq!(rx.try_iter().count(), 0);
    }

    #[test]
    fn test_abstract_dry_run_writes_data_only() {
        let mut block = three_node_block(three_node_data());
        block.generate_all().unwrap();
        block
            .set_kappa_range(&[3.0], 1..2, apply(), ModParam::DryRun)
            .unwrap();
        assert_eq!(block.kappa(1), Some(3.0));
        assert_eq!(block.flow_limits().bounds(0, 1), Some((-10.0, 10.0)));
    }

    #[test]
    fn test_out_of_range_update_is_rejected_whole() {
        let mut block = three_node_block(three_node_data());
        block.generate_all().unwrap();
        let err = block
            .set_kappa_subset(&[2.0, 2.0], &[0, 2], true, apply(), apply())
            .unwrap_err();
        assert!(matches!(err, ModelError::OutOfRangeIndex { index: 2, .. }));
        assert_eq!(block.kappa(0), Some(1.0));
        assert!(block.set_kappa_range(&[2.0; 3], 0..3, apply(), apply()).is_err());
    }

    #[test]
    fn test_empty_addressing_is_a_no_op() {
        let mut block = three_node_block(three_node_data());
        let outcome = block
            .set_active_demand_subset(&[], &[], true, apply(), apply())
            .unwrap();
        assert_eq!(outcome, Outcome::Unchanged);
    }

    #[test]
    fn test_ac_generation_shifts_bounds_by_demand() {
        let data = three_node_data()
            .with_susceptance(vec![1.0, 1.0])
            .unwrap()
            .with_ptdf(chain_ptdf())
            .unwrap();
        let mut block = three_node_block(data);
        block.generate_all().unwrap();
        assert!(matches!(block.flow_limits(), FlowLimits::Ac(_)));
        // line 0 carries the demand of node 0, line 1 that of nodes 0 and 1
        assert_eq!(block.flow_limits().bounds(0, 0), Some((-5.0, 15.0)));
        assert_eq!(block.flow_limits().bounds(0, 1), Some((-5.0, 15.0)));
        assert_eq!(block.system_balance().len(), 1);
        assert_eq!(block.system_balance().get(0, 0).unwrap().rhs, 0.0);
        assert_eq!(block.flow_definition().len(), 2);
        assert!(block.injection_balance().is_empty());
    }

    #[test]
    fn test_ac_without_ptdf_is_invalid() {
        let data = three_node_data().with_susceptance(vec![1.0, 1.0]).unwrap();
        let mut block = three_node_block(data);
        block.generate_variables().unwrap();
        assert!(matches!(
            block.generate_constraints(),
            Err(ModelError::InvalidTopology(_))
        ));
    }

    #[test]
    fn test_hybrid_rows() {
        let data = three_node_data()
            .with_susceptance(vec![1.0, 0.0])
            .unwrap()
            .with_ptdf(chain_ptdf())
            .unwrap();
        let mut block = three_node_block(data);
        block.generate_all().unwrap();
        let FlowLimits::Hybrid(family) = block.flow_limits() else {
            panic!("expected a hybrid family");
        };
        assert_eq!(family.len(), 2);
        // the HVDC line gets an identity row
        let identity = family.get(0, 1).unwrap();
        assert_eq!(identity.function.num_terms(), 1);
        assert_eq!((identity.lhs, identity.rhs), (-10.0, 10.0));
        // dense over the node injections
        let ac = family.get(0, 0).unwrap();
        assert_eq!(ac.function.num_terms(), 3);
        assert_eq!(block.flow_definition().len(), 1);
    }

    #[test]
    fn test_topology_is_frozen_after_generation() {
        let mut block = three_node_block(three_node_data());
        assert!(block.network_data_mut().is_ok());
        block.generate_variables().unwrap();
        assert!(matches!(
            block.network_data_mut(),
            Err(ModelError::TopologyFrozen(_))
        ));
        let shared = std::rc::Rc::new(NetworkData::Dc(three_node_data()));
        let mut other = DcNetworkBlock::with_network_data(DataHandle::Shared(shared));
        assert!(matches!(
            other.network_data_mut(),
            Err(ModelError::TopologyFrozen(_))
        ));
    }

    #[test]
    fn test_feasibility_check() {
        let mut block = three_node_block(three_node_data());
        block.generate_all().unwrap();
        // flows of -5 on both lines carry the demand with no injection
        let f0 = block.power_flow(0, 0).unwrap();
        let f1 = block.power_flow(0, 1).unwrap();
        block.variable_store_mut().get_mut(f0.slot).unwrap().value = -5.0;
        block.variable_store_mut().get_mut(f1.slot).unwrap().value = -5.0;
        assert!(block.is_feasible(None).unwrap());
        block.variable_store_mut().get_mut(f1.slot).unwrap().value = -11.0;
        assert!(!block.is_feasible(None).unwrap());
        let loose = FeasibilityConfig {
            tolerance: 10.0,
            relative: false,
        };
        assert!(block.is_feasible(Some(&loose)).unwrap());
    }

    #[test]
    fn test_injection_bounds_are_patched() {
        let mut block = three_node_block(three_node_data());
        block.generate_all().unwrap();
        let outcome = block
            .set_node_injection_bounds(&[0.0; 3], &[7.0; 3], apply(), apply())
            .unwrap();
        assert_eq!(outcome, Outcome::Applied);
        assert!(block
            .injection_bounds()
            .iter()
            .all(|c| c.lhs == 0.0 && c.rhs == 7.0));
        assert!(block
            .set_node_injection_bounds(&[0.0; 2], &[7.0; 3], apply(), apply())
            .is_err());
    }

    #[test]
    fn test_load_from_stream_is_unsupported() {
        let mut block = DcNetworkBlock::new();
        let mut reader: &[u8] = b"anything";
        assert!(matches!(
            block.load(&mut reader),
            Err(ModelError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_codec_round_trip() {
        let data = three_node_data().with_network_cost(vec![1.0, 0.5]).unwrap();
        let mut block = three_node_block(data);
        block
            .set_kappa_range(&[2.0, 1.5], 0..2, ModParam::ApplyNoNotify, ModParam::ApplyNoNotify)
            .unwrap();
        block.set_constant_term(3.0);
        let mut group = Group::new();
        block.serialize(&mut group);
        let mut again = Group::new();
        DcNetworkBlock::deserialize(&group).unwrap().serialize(&mut again);
        assert_eq!(group, again);

        let plain = three_node_block(three_node_data());
        let mut group = Group::new();
        plain.serialize(&mut group);
        assert!(!group.has_var("Kappa"));
        assert!(!group.has_var("ConstantTerm"));
        assert!(!group.has_var("NetworkCost"));
    }

    #[test]
    fn test_demand_without_descriptor_round_trip() {
        let mut group = Group::new();
        group.set_dim("__NumberNodes__", 2);
        group.put_double("ActiveDemand", &["__NumberNodes__"], vec![1.0, 2.0]);
        let block = DcNetworkBlock::deserialize(&group).unwrap();
        let mut again = Group::new();
        block.serialize(&mut again);
        assert_eq!(group, again);
    }

    fn random_data(rng: &mut Xoshiro256PlusPlus, line_type: LineType) -> DcNetworkData {
        let data = three_node_data().with_network_cost(vec![1.0, 2.0]).unwrap();
        match line_type {
            LineType::Hvdc => data,
            LineType::Ac => data
                .with_susceptance(vec![rng.random_range(0.5..2.0); 2])
                .unwrap()
                .with_ptdf(chain_ptdf())
                .unwrap(),
            _ => data
                .with_susceptance(vec![1.0, 0.0])
                .unwrap()
                .with_ptdf(chain_ptdf())
                .unwrap(),
        }
    }

    #[test]
    fn test_incremental_equals_full() {
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(7);
        let normal = Normal::new(0.0, 10.0).unwrap();
        for line_type in [LineType::Hvdc, LineType::Ac, LineType::Hybrid] {
            let data = random_data(&mut rng, line_type);
            let mut block =
                DcNetworkBlock::with_network_data(DataHandle::owned(NetworkData::Dc(data.clone())));
            block.set_number_intervals(2).unwrap();
            block.generate_all().unwrap();
            for _ in 0..20 {
                if rng.random_bool(0.5) {
                    let line = rng.random_range(0..2);
                    let kappa = rng.random_range(0.5..3.0);
                    block
                        .set_kappa_subset(&[kappa], &[line], true, apply(), apply())
                        .unwrap();
                } else {
                    let start = rng.random_range(0..6);
                    let end = rng.random_range(start..=6);
                    let values: Vec<f64> =
                        (start..end).map(|_| normal.sample(&mut rng)).collect();
                    block
                        .set_active_demand_range(&values, start..end, apply(), apply())
                        .unwrap();
                }
            }

            let mut fresh =
                DcNetworkBlock::with_network_data(DataHandle::owned(NetworkData::Dc(data)));
            fresh.set_number_intervals(2).unwrap();
            fresh.active_demand = block.active_demand.clone();
            fresh.kappa = block.kappa.clone();
            fresh.generate_all().unwrap();

            let mut patched = vec![];
            block.for_each_constraint(&mut |name, i, c| patched.push((name, i, c.bounds())));
            let mut full = vec![];
            fresh.for_each_constraint(&mut |name, i, c| full.push((name, i, c.bounds())));
            assert_eq!(patched.len(), full.len());
            for (a, b) in patched.iter().zip(full.iter()) {
                assert_eq!(a.0, b.0);
                assert_eq!(a.1, b.1);
                assert!((a.2 .0 - b.2 .0).abs() < 1e-9 || a.2 .0 == b.2 .0);
                assert!((a.2 .1 - b.2 .1).abs() < 1e-9 || a.2 .1 == b.2 .1);
            }
        }
    }

    fn two_node_group() -> Group {
        let mut group = Group::new();
        group.set_dim("NumberNodes", 2);
        group.set_dim("NumberLines", 1);
        group.set_dim("NumberIntervals", 1);
        group.put_uint("StartLine", &["NumberLines"], vec![0]);
        group.put_uint("EndLine", &["NumberLines"], vec![1]);
        group.put_double("MinPowerFlow", &[], vec![-5.0]);
        group.put_double("MaxPowerFlow", &[], vec![5.0]);
        group.put_double("ActiveDemand", &[], vec![2.0]);
        group.put_double("Kappa", &[], vec![0.5]);
        group.put_double("ConstantTerm", &[], vec![0.0]);
        group
    }

    #[test]
    fn test_scalar_fields_round_trip() {
        let group = two_node_group();
        let block = DcNetworkBlock::deserialize(&group).unwrap();
        assert_eq!(block.active_demand(0), Some(vec![2.0, 2.0]));
        assert_eq!(block.kappa(0), Some(0.5));
        let mut out = Group::new();
        block.serialize(&mut out);
        assert_eq!(out, group);
    }

    #[test]
    fn test_changed_demand_is_written_in_full() {
        let mut block = DcNetworkBlock::deserialize(&two_node_group()).unwrap();
        let quiet = ModParam::ApplyNoNotify;
        block
            .set_active_demand_subset(&[3.0], &[1], true, quiet, quiet)
            .unwrap();
        let mut out = Group::new();
        block.serialize(&mut out);
        assert_eq!(out.double("ActiveDemand").unwrap(), Some(vec![2.0, 3.0]));
        assert_eq!(out.var("ActiveDemand").unwrap().dims(), ["NumberNodes"]);
        assert_eq!(out.double("Kappa").unwrap(), Some(vec![0.5]));
    }

    #[test]
    fn test_scalar_demand_broadcasts_over_nodes() {
        let mut group = Group::new();
        group.set_dim("NumberNodes", 3);
        group.set_dim("NumberLines", 2);
        group.put_uint("StartLine", &["NumberLines"], vec![0, 1]);
        group.put_uint("EndLine", &["NumberLines"], vec![1, 2]);
        group.put_double("MinPowerFlow", &[], vec![-10.0]);
        group.put_double("MaxPowerFlow", &[], vec![10.0]);
        group.put_double("ActiveDemand", &[], vec![2.0]);
        let mut block = DcNetworkBlock::deserialize(&group).unwrap();
        assert_eq!(block.active_demand(0), Some(vec![2.0, 2.0, 2.0]));
        assert_eq!(block.active_demand(1), None);
        assert_eq!(block.kappa(2), None);
        block.generate_all().unwrap();
        let rhs: Vec<f64> = block.injection_balance().iter().map(|c| c.rhs).collect();
        assert_eq!(rhs, vec![-2.0, -2.0, -2.0]);
    }

    // AC chain whose distribution factors miss the last line
    #[derive(Debug)]
    struct ShortPtdf(DcNetworkData);

    impl NetworkDescriptor for ShortPtdf {
        fn classname(&self) -> &str {
            "ShortPtdf"
        }
        fn number_nodes(&self) -> usize {
            self.0.number_nodes()
        }
        fn number_lines(&self) -> usize {
            self.0.number_lines()
        }
        fn start_line(&self) -> &[usize] {
            self.0.start_line()
        }
        fn end_line(&self) -> &[usize] {
            self.0.end_line()
        }
        fn min_power_flow(&self) -> &[f64] {
            self.0.min_power_flow()
        }
        fn max_power_flow(&self) -> &[f64] {
            self.0.max_power_flow()
        }
        fn susceptance(&self) -> &[f64] {
            self.0.susceptance()
        }
        fn network_cost(&self) -> &[f64] {
            self.0.network_cost()
        }
        fn ptdf(&self) -> Option<&[f64]> {
            self.0.ptdf().map(|m| &m[..3])
        }
        fn node_names(&self) -> &[String] {
            &[]
        }
        fn line_names(&self) -> &[String] {
            &[]
        }
        fn serialize(&self, group: &mut Group) {
            self.0.serialize(group)
        }
    }

    #[test]
    fn test_extension_with_short_ptdf_is_rejected() {
        let data = three_node_data()
            .with_susceptance(vec![1.0, 1.0])
            .unwrap()
            .with_ptdf(chain_ptdf())
            .unwrap();
        let descriptor = NetworkData::Extension(Box::new(ShortPtdf(data)));
        let mut block = DcNetworkBlock::with_network_data(DataHandle::owned(descriptor));
        block.generate_variables().unwrap();
        assert!(matches!(
            block.generate_constraints(),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }
}
