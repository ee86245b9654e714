use std::ops::Range;
use std::rc::Rc;

use crate::block::Block;
use crate::config::BlockConfig;
use crate::constraint::{ConstraintRef, Family, RowConstraint};
use crate::error::{ModelError, ModelResult};
use crate::function::{LinearFunction, Objective};
use crate::group::{Group, Layouts};
use crate::log;
use crate::modification::{ModKind, ModParam, Notifier, Outcome, Selection};
use crate::network::{DcNetworkBlock, NetworkBlock};
use crate::state::{GenerationState, StepAction};
use crate::topology::{DataHandle, DcNetworkData, NetworkData, NetworkDataFactory};
use crate::unit::UnitBlock;
use crate::utils::broadcast;
use crate::variable::{BlockId, ColVariable, VarRef, VariableLookup};

/// Partition of the nodes into zones for one zonal requirement
/// (primary reserve, secondary reserve or inertia).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ZoneData {
    pub number_zones: usize,
    /// Zone of each node, empty means every node is in zone 0. A zone
    /// past `number_zones` leaves the node out.
    pub zones: Vec<usize>,
    /// `zones x horizon`, empty means zero
    pub demand: Vec<f64>,
}

impl ZoneData {
    pub fn new(number_zones: usize, zones: Vec<usize>, demand: Vec<f64>) -> Self {
        Self {
            number_zones,
            zones,
            demand,
        }
    }

    fn zone_of(&self, node: usize) -> Option<usize> {
        let zone = if self.zones.is_empty() {
            0
        } else {
            self.zones[node]
        };
        (zone < self.number_zones).then_some(zone)
    }

    fn demand_at(&self, zone: usize, t: usize, horizon: usize) -> f64 {
        if self.demand.is_empty() {
            0.0
        } else {
            self.demand[zone * horizon + t]
        }
    }

    fn validate(&self, nodes: usize, horizon: usize, prefix: &str) -> ModelResult<()> {
        if !self.zones.is_empty() && self.zones.len() != nodes {
            return Err(ModelError::shape(
                format!("{prefix}Zones"),
                nodes,
                self.zones.len(),
            ));
        }
        let expected = self.number_zones * horizon;
        if !self.demand.is_empty() && self.demand.len() != expected {
            return Err(ModelError::shape(
                format!("{prefix}Demand"),
                expected,
                self.demand.len(),
            ));
        }
        Ok(())
    }

    /// A demand without a zone count means a single zone. A single
    /// demand value holds for every zone and instant.
    fn deserialize(group: &Group, prefix: &str, horizon: usize) -> ModelResult<Self> {
        let name = format!("{prefix}Demand");
        let demand = group.double(&name)?.unwrap_or_default();
        let number_zones = group
            .dim(&format!("Number{prefix}Zones"))
            .unwrap_or(if demand.is_empty() { 0 } else { 1 });
        let demand = if demand.is_empty() {
            demand
        } else {
            broadcast(&demand, number_zones * horizon, &name)?
        };
        let zones = group.uint(&format!("{prefix}Zones"))?.unwrap_or_default();
        Ok(Self::new(number_zones, zones, demand))
    }

    fn serialize(&self, group: &mut Group, prefix: &str, layouts: &Layouts) {
        let dim = format!("Number{prefix}Zones");
        let implied = if self.demand.is_empty() { 0 } else { 1 };
        if self.number_zones != implied || layouts.has_dim(&dim) {
            group.set_dim(&dim, self.number_zones);
        }
        if !self.zones.is_empty() {
            let name = format!("{prefix}Zones");
            let dims = layouts.dims_or(&name, &["NumberNodes"]);
            group.put_uint(&name, &dims, self.zones.clone());
        }
        if !self.demand.is_empty() {
            let name = format!("{prefix}Demand");
            layouts.put_double(group, &name, &[&dim, "TimeHorizon"], &self.demand);
        }
    }
}

/// Emission budgets: every pollutant splits the nodes into its own zones
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollutantData {
    pub number_zones: Vec<usize>,
    pub zones: Vec<usize>,
    /// One budget per (pollutant, zone), pollutant-major
    pub budget: Vec<f64>,
    /// `horizon x pollutants x generators`
    pub rho: Vec<f64>,
}

impl PollutantData {
    pub fn number_pollutants(&self) -> usize {
        self.number_zones.len()
    }

    pub fn total_zones(&self) -> usize {
        self.number_zones.iter().sum()
    }

    fn offset(&self, pollutant: usize) -> usize {
        self.number_zones[..pollutant].iter().sum()
    }

    fn zone_of(&self, pollutant: usize, node: usize, nodes: usize) -> Option<usize> {
        let zone = if self.zones.is_empty() {
            0
        } else {
            self.zones[pollutant * nodes + node]
        };
        (zone < self.number_zones[pollutant]).then_some(zone)
    }

    fn rho_at(&self, t: usize, pollutant: usize, generator: usize, generators: usize) -> f64 {
        self.rho[(t * self.number_pollutants() + pollutant) * generators + generator]
    }

    fn validate(&self, nodes: usize, horizon: usize, generators: usize) -> ModelResult<()> {
        let pollutants = self.number_pollutants();
        if pollutants == 0 {
            return Ok(());
        }
        if !self.zones.is_empty() && self.zones.len() != pollutants * nodes {
            return Err(ModelError::shape(
                "PollutantZones",
                pollutants * nodes,
                self.zones.len(),
            ));
        }
        if self.budget.len() != self.total_zones() {
            return Err(ModelError::shape(
                "PollutantBudget",
                self.total_zones(),
                self.budget.len(),
            ));
        }
        let expected = horizon * pollutants * generators;
        if self.rho.len() != expected {
            return Err(ModelError::shape("PollutantRho", expected, self.rho.len()));
        }
        Ok(())
    }

    fn deserialize(group: &Group, horizon: usize, generators: usize) -> ModelResult<Self> {
        let pollutants = group.dim("NumberPollutants").unwrap_or(0);
        if pollutants == 0 {
            return Ok(Self::default());
        }
        let number_zones = group
            .uint("NumberPollutantZones")?
            .unwrap_or_else(|| vec![1; pollutants]);
        if number_zones.len() != pollutants {
            return Err(ModelError::shape(
                "NumberPollutantZones",
                pollutants,
                number_zones.len(),
            ));
        }
        let budget = group.require_double("PollutantBudget")?;
        let total = number_zones.iter().sum();
        Ok(Self {
            number_zones,
            zones: group.uint("PollutantZones")?.unwrap_or_default(),
            budget: broadcast(&budget, total, "PollutantBudget")?,
            rho: broadcast(
                &group.require_double("PollutantRho")?,
                horizon * pollutants * generators,
                "PollutantRho",
            )?,
        })
    }

    fn serialize(&self, group: &mut Group, layouts: &Layouts) {
        if self.number_pollutants() == 0 {
            if layouts.has_dim("NumberPollutants") {
                group.set_dim("NumberPollutants", 0);
            }
            return;
        }
        group.set_dim("NumberPollutants", self.number_pollutants());
        if self.number_zones.iter().any(|z| *z != 1) || layouts.has_array("NumberPollutantZones")
        {
            let dims = layouts.dims_or("NumberPollutantZones", &["NumberPollutants"]);
            group.put_uint("NumberPollutantZones", &dims, self.number_zones.clone());
        }
        if !self.zones.is_empty() {
            let dims = layouts.dims_or("PollutantZones", &["NumberPollutants", "NumberNodes"]);
            group.put_uint("PollutantZones", &dims, self.zones.clone());
        }
        layouts.put_double(
            group,
            "PollutantBudget",
            &["TotalNumberPollutantZones"],
            &self.budget,
        );
        layouts.put_double(
            group,
            "PollutantRho",
            &["TimeHorizon", "NumberPollutants", "NumberElectricalGenerators"],
            &self.rho,
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    NodeBalance,
    PrimaryDemand,
    SecondaryDemand,
    InertiaDemand,
    PollutantBudget,
}

impl LinkKind {
    const ALL: [LinkKind; 5] = [
        LinkKind::NodeBalance,
        LinkKind::PrimaryDemand,
        LinkKind::SecondaryDemand,
        LinkKind::InertiaDemand,
        LinkKind::PollutantBudget,
    ];

    pub fn family_name(&self) -> &'static str {
        match self {
            LinkKind::NodeBalance => "node_injection",
            LinkKind::PrimaryDemand => "primary_demand",
            LinkKind::SecondaryDemand => "secondary_demand",
            LinkKind::InertiaDemand => "inertia_demand",
            LinkKind::PollutantBudget => "pollutant_budget",
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Row {
    Node { t: usize, node: usize },
    Primary { t: usize, zone: usize },
    Secondary { t: usize, zone: usize },
    Inertia { t: usize, zone: usize },
    Pollutant { pollutant: usize, zone: usize },
}

fn time_rows(horizon: usize, keys: usize, make: fn(usize, usize) -> Row) -> Vec<Row> {
    (0..horizon)
        .flat_map(|t| (0..keys).map(move |k| make(t, k)))
        .collect()
}

/// A generated linking family and its term index: `index[unit][key]` is
/// the run of term positions the unit occupies in every row of that key.
#[derive(Debug)]
struct Linking {
    kind: LinkKind,
    rows: Family<RowConstraint>,
    index: Vec<Vec<Range<usize>>>,
}

/// Unit commitment block: a set of units, a network per time instant
/// and the constraints that tie them together.
///
/// With a single node there are no network children and the node
/// balance rows are the demand constraints. With more nodes every
/// time instant gets its own [`DcNetworkBlock`], all of them sharing the
/// same descriptor, and the balance rows equate node injection with the
/// generation attached to the node.
#[derive(Debug)]
pub struct UcBlock {
    id: BlockId,
    state: GenerationState,
    config: Option<BlockConfig>,
    notifier: Notifier,
    time_horizon: usize,
    number_nodes: usize,
    units: Vec<UnitBlock>,
    networks: Vec<DcNetworkBlock>,
    network_classname: String,
    /// Node of every electrical generator, unit-major. Empty means node 0.
    generator_node: Vec<usize>,
    /// `nodes x horizon`, empty means zero
    active_power_demand: Vec<f64>,
    primary: ZoneData,
    secondary: ZoneData,
    inertia: ZoneData,
    pollutants: PollutantData,
    network_constant_terms: Vec<f64>,
    linking: Vec<Linking>,
    objective: Option<Objective>,
    layouts: Layouts,
}

impl UcBlock {
    pub fn new(time_horizon: usize) -> Self {
        Self {
            id: BlockId::fresh(),
            state: GenerationState::Empty,
            config: None,
            notifier: Notifier::new(),
            time_horizon,
            number_nodes: 1,
            units: vec![],
            networks: vec![],
            network_classname: DcNetworkData::CLASSNAME.to_string(),
            generator_node: vec![],
            active_power_demand: vec![],
            primary: ZoneData::default(),
            secondary: ZoneData::default(),
            inertia: ZoneData::default(),
            pollutants: PollutantData::default(),
            network_constant_terms: vec![],
            linking: vec![],
            objective: None,
            layouts: Layouts::default(),
        }
    }

    fn check_not_generated(&self, what: &str) -> ModelResult<()> {
        if self.state.has_variables() {
            return Err(ModelError::TopologyFrozen(format!(
                "cannot change {what} of block {} once variables exist",
                self.id
            )));
        }
        Ok(())
    }

    pub fn add_unit(&mut self, mut unit: UnitBlock) -> ModelResult<usize> {
        self.check_not_generated("the units")?;
        if unit.time_horizon() != self.time_horizon {
            return Err(ModelError::shape(
                "unit time horizon",
                self.time_horizon,
                unit.time_horizon(),
            ));
        }
        unit.set_notifier(self.notifier.clone());
        self.units.push(unit);
        Ok(self.units.len() - 1)
    }

    /// Attaches the network. With more than one node a network child is
    /// created per time instant, all sharing `data`. `generator_node`
    /// gives the node of every generator, unit-major.
    pub fn set_network(&mut self, data: NetworkData, generator_node: Vec<usize>) -> ModelResult<()> {
        self.check_not_generated("the network")?;
        let nodes = data.descriptor().number_nodes();
        self.network_classname = data.descriptor().classname().to_string();
        self.number_nodes = nodes;
        self.generator_node = generator_node;
        self.active_power_demand.clear();
        self.networks.clear();
        if nodes > 1 {
            let shared = Rc::new(data);
            for _ in 0..self.time_horizon {
                let mut network =
                    DcNetworkBlock::with_network_data(DataHandle::Shared(Rc::clone(&shared)));
                network.set_notifier(self.notifier.clone());
                self.networks.push(network);
            }
        }
        Ok(())
    }

    pub fn set_primary_zones(&mut self, zones: ZoneData) -> ModelResult<()> {
        self.check_not_generated("the primary zones")?;
        self.primary = zones;
        Ok(())
    }

    pub fn set_secondary_zones(&mut self, zones: ZoneData) -> ModelResult<()> {
        self.check_not_generated("the secondary zones")?;
        self.secondary = zones;
        Ok(())
    }

    pub fn set_inertia_zones(&mut self, zones: ZoneData) -> ModelResult<()> {
        self.check_not_generated("the inertia zones")?;
        self.inertia = zones;
        Ok(())
    }

    pub fn set_pollutants(&mut self, pollutants: PollutantData) -> ModelResult<()> {
        self.check_not_generated("the pollutant budgets")?;
        self.pollutants = pollutants;
        Ok(())
    }

    /// Constant terms of the network objectives, one per network child.
    /// A bus takes any number of terms and adds them to its own objective.
    pub fn set_network_constant_terms(&mut self, terms: Vec<f64>) -> ModelResult<()> {
        if !self.is_bus() {
            if terms.len() != self.networks.len() {
                return Err(ModelError::shape(
                    "NetworkConstantTerms",
                    self.networks.len(),
                    terms.len(),
                ));
            }
            for (network, constant) in self.networks.iter_mut().zip(terms.iter()) {
                network.set_constant_term(*constant);
            }
        }
        self.network_constant_terms = terms;
        let own = self.own_constant();
        if let Some(objective) = self.objective.as_mut() {
            objective.function.set_constant(own);
        }
        Ok(())
    }

    fn own_constant(&self) -> f64 {
        if self.is_bus() {
            self.network_constant_terms.iter().sum()
        } else {
            0.0
        }
    }

    pub fn set_notifier(&mut self, notifier: Notifier) {
        for unit in self.units.iter_mut() {
            unit.set_notifier(notifier.clone());
        }
        for network in self.networks.iter_mut() {
            network.set_notifier(notifier.clone());
        }
        self.notifier = notifier;
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn set_config(&mut self, config: BlockConfig) {
        self.config = Some(config);
    }

    pub fn time_horizon(&self) -> usize {
        self.time_horizon
    }

    pub fn number_nodes(&self) -> usize {
        self.number_nodes
    }

    pub fn is_bus(&self) -> bool {
        self.networks.is_empty()
    }

    pub fn units(&self) -> &[UnitBlock] {
        &self.units
    }

    pub fn networks(&self) -> &[DcNetworkBlock] {
        &self.networks
    }

    pub fn number_generators(&self) -> usize {
        self.units.iter().map(|u| u.number_generators()).sum()
    }

    pub fn active_power_demand(&self, node: usize, t: usize) -> Option<f64> {
        if node >= self.number_nodes || t >= self.time_horizon {
            return None;
        }
        Some(self.demand_at(node, t))
    }

    fn demand_at(&self, node: usize, t: usize) -> f64 {
        self.active_power_demand
            .get(node * self.time_horizon + t)
            .copied()
            .unwrap_or(0.0)
    }

    pub fn linking(&self, kind: LinkKind) -> Option<&Family<RowConstraint>> {
        self.linking.iter().find(|l| l.kind == kind).map(|l| &l.rows)
    }

    /// Term positions of `unit` in the rows of `kind` keyed by `key` (a
    /// node, a zone, or a flattened pollutant zone).
    pub fn term_range(&self, kind: LinkKind, unit: usize, key: usize) -> Option<Range<usize>> {
        self.linking
            .iter()
            .find(|l| l.kind == kind)
            .and_then(|l| l.index.get(unit))
            .and_then(|keys| keys.get(key))
            .cloned()
    }

    pub fn objective(&self) -> Option<&Objective> {
        self.objective.as_ref()
    }

    fn generator_offset(&self, unit: usize) -> usize {
        self.units[..unit].iter().map(|u| u.number_generators()).sum()
    }

    fn node_of(&self, generator: usize) -> usize {
        if self.generator_node.is_empty() {
            0
        } else {
            self.generator_node[generator]
        }
    }

    fn validate(&self) -> ModelResult<()> {
        let generators = self.number_generators();
        let nodes = self.number_nodes;
        if !self.is_bus() || !self.generator_node.is_empty() {
            if self.generator_node.len() != generators {
                return Err(ModelError::shape(
                    "GeneratorNode",
                    generators,
                    self.generator_node.len(),
                ));
            }
            if let Some(node) = self.generator_node.iter().find(|n| **n >= nodes) {
                return Err(ModelError::OutOfRangeIndex {
                    what: "node",
                    index: *node,
                    extent: nodes,
                });
            }
        }
        if !self.is_bus() && self.networks.len() != self.time_horizon {
            return Err(ModelError::InvalidTopology(format!(
                "{} network blocks for a horizon of {}",
                self.networks.len(),
                self.time_horizon
            )));
        }
        self.primary.validate(nodes, self.time_horizon, "Primary")?;
        self.secondary.validate(nodes, self.time_horizon, "Secondary")?;
        self.inertia.validate(nodes, self.time_horizon, "Inertia")?;
        self.pollutants.validate(nodes, self.time_horizon, generators)
    }

    /// Node injection bounds of the network at `t` implied by the units
    fn injection_bounds(&self, t: usize) -> (Vec<f64>, Vec<f64>) {
        let mut min = vec![0.0; self.number_nodes];
        let mut max = vec![0.0; self.number_nodes];
        let mut offset = 0;
        for unit in self.units.iter() {
            let scale = unit.scale();
            for g in 0..unit.number_generators() {
                let node = self.node_of(offset + g);
                if !unit.has_commitment() {
                    min[node] += scale * unit.min_power(g, t);
                }
                max[node] += scale * unit.max_power(g, t);
            }
            offset += unit.number_generators();
        }
        (min, max)
    }

    fn refresh_network_bounds(&mut self, abstract_mode: ModParam) -> ModelResult<()> {
        for t in 0..self.networks.len() {
            let (min, max) = self.injection_bounds(t);
            self.networks[t].set_node_injection_bounds(
                &min,
                &max,
                ModParam::ApplyNoNotify,
                abstract_mode,
            )?;
        }
        Ok(())
    }

    fn link_rows(&self, kind: LinkKind) -> Vec<Row> {
        let horizon = self.time_horizon;
        match kind {
            LinkKind::NodeBalance => {
                time_rows(horizon, self.number_nodes, |t, node| Row::Node { t, node })
            }
            LinkKind::PrimaryDemand => {
                time_rows(horizon, self.primary.number_zones, |t, zone| Row::Primary { t, zone })
            }
            LinkKind::SecondaryDemand => time_rows(horizon, self.secondary.number_zones, |t, zone| {
                Row::Secondary { t, zone }
            }),
            LinkKind::InertiaDemand => {
                time_rows(horizon, self.inertia.number_zones, |t, zone| Row::Inertia { t, zone })
            }
            LinkKind::PollutantBudget => self
                .pollutants
                .number_zones
                .iter()
                .enumerate()
                .flat_map(|(pollutant, zones)| {
                    (0..*zones).map(move |zone| Row::Pollutant { pollutant, zone })
                })
                .collect(),
        }
    }

    fn link_shape(&self, kind: LinkKind) -> (usize, usize) {
        // (family columns, index keys)
        match kind {
            LinkKind::NodeBalance => (self.number_nodes, self.number_nodes),
            LinkKind::PrimaryDemand => (self.primary.number_zones, self.primary.number_zones),
            LinkKind::SecondaryDemand => {
                (self.secondary.number_zones, self.secondary.number_zones)
            }
            LinkKind::InertiaDemand => (self.inertia.number_zones, self.inertia.number_zones),
            LinkKind::PollutantBudget => (1, self.pollutants.total_zones()),
        }
    }

    fn key_rows(&self, kind: LinkKind, key: usize) -> Vec<Row> {
        let times = 0..self.time_horizon;
        match kind {
            LinkKind::NodeBalance => times.map(|t| Row::Node { t, node: key }).collect(),
            LinkKind::PrimaryDemand => times.map(|t| Row::Primary { t, zone: key }).collect(),
            LinkKind::SecondaryDemand => times.map(|t| Row::Secondary { t, zone: key }).collect(),
            LinkKind::InertiaDemand => times.map(|t| Row::Inertia { t, zone: key }).collect(),
            LinkKind::PollutantBudget => {
                let mut offset = 0;
                for (pollutant, zones) in self.pollutants.number_zones.iter().enumerate() {
                    if key < offset + zones {
                        return vec![Row::Pollutant {
                            pollutant,
                            zone: key - offset,
                        }];
                    }
                    offset += zones;
                }
                vec![]
            }
        }
    }

    fn row_position(&self, row: Row) -> (usize, usize) {
        match row {
            Row::Node { t, .. }
            | Row::Primary { t, .. }
            | Row::Secondary { t, .. }
            | Row::Inertia { t, .. } => (t, self.row_key(row)),
            Row::Pollutant { .. } => (self.row_key(row), 0),
        }
    }

    fn row_key(&self, row: Row) -> usize {
        match row {
            Row::Node { node, .. } => node,
            Row::Primary { zone, .. } | Row::Secondary { zone, .. } | Row::Inertia { zone, .. } => {
                zone
            }
            Row::Pollutant { pollutant, zone } => self.pollutants.offset(pollutant) + zone,
        }
    }

    // paid when the generator is off, so it sits on the right hand side
    fn unit_fixed_consumption(&self, unit: usize, t: usize, node: usize) -> f64 {
        let u = &self.units[unit];
        if !u.has_commitment() || !u.has_fixed_consumption() {
            return 0.0;
        }
        let offset = self.generator_offset(unit);
        (0..u.number_generators())
            .filter(|g| self.node_of(offset + g) == node)
            .map(|g| u.scale() * u.fixed_consumption(g, t))
            .sum()
    }

    fn node_rhs(&self, t: usize, node: usize) -> f64 {
        let demand = if self.is_bus() {
            self.demand_at(node, t)
        } else {
            0.0
        };
        let fixed: f64 = (0..self.units.len())
            .map(|i| self.unit_fixed_consumption(i, t, node))
            .sum();
        demand - fixed
    }

    fn row_bounds(&self, row: Row) -> (f64, f64) {
        let horizon = self.time_horizon;
        match row {
            Row::Node { t, node } => {
                let rhs = self.node_rhs(t, node);
                (rhs, rhs)
            }
            Row::Primary { t, zone } => (self.primary.demand_at(zone, t, horizon), f64::INFINITY),
            Row::Secondary { t, zone } => {
                (self.secondary.demand_at(zone, t, horizon), f64::INFINITY)
            }
            Row::Inertia { t, zone } => (self.inertia.demand_at(zone, t, horizon), f64::INFINITY),
            Row::Pollutant { pollutant, zone } => (
                f64::NEG_INFINITY,
                self.pollutants.budget[self.pollutants.offset(pollutant) + zone],
            ),
        }
    }

    fn row_head(&self, row: Row) -> ModelResult<Vec<(VarRef, f64)>> {
        match row {
            Row::Node { t, node } if !self.is_bus() => {
                let s = self.networks[t].node_injection(0, node).ok_or_else(|| {
                    ModelError::InvalidTopology(format!(
                        "network at instant {t} has no node injection variables"
                    ))
                })?;
                Ok(vec![(s, -1.0)])
            }
            _ => Ok(vec![]),
        }
    }

    /// The run of terms `unit` contributes to `row`. The same function
    /// builds the rows and recomputes coefficients for patches, so the
    /// term order is the same in both.
    fn unit_terms(&self, unit: usize, row: Row) -> Vec<(VarRef, f64)> {
        let u = &self.units[unit];
        let offset = self.generator_offset(unit);
        let scale = u.scale();
        let mut terms = vec![];
        match row {
            Row::Node { t, node } => {
                for g in 0..u.number_generators() {
                    if self.node_of(offset + g) != node {
                        continue;
                    }
                    if let Some(p) = u.active_power(g, t) {
                        terms.push((p, scale));
                    }
                    if u.has_fixed_consumption() {
                        if let Some(c) = u.commitment(g, t) {
                            terms.push((c, -scale * u.fixed_consumption(g, t)));
                        }
                    }
                }
            }
            Row::Primary { t, zone } => {
                for g in 0..u.number_generators() {
                    if self.primary.zone_of(self.node_of(offset + g)) != Some(zone) {
                        continue;
                    }
                    if let Some(r) = u.primary_reserve(g, t) {
                        terms.push((r, scale));
                    }
                }
            }
            Row::Secondary { t, zone } => {
                for g in 0..u.number_generators() {
                    if self.secondary.zone_of(self.node_of(offset + g)) != Some(zone) {
                        continue;
                    }
                    if let Some(r) = u.secondary_reserve(g, t) {
                        terms.push((r, scale));
                    }
                }
            }
            Row::Inertia { t, zone } => {
                for g in 0..u.number_generators() {
                    if self.inertia.zone_of(self.node_of(offset + g)) != Some(zone) {
                        continue;
                    }
                    if !u.data().inertia_commitment.is_empty() {
                        if let Some(c) = u.commitment(g, t) {
                            terms.push((c, scale * u.inertia_commitment(g, t)));
                        }
                    }
                    if !u.data().inertia_power.is_empty() {
                        if let Some(p) = u.active_power(g, t) {
                            terms.push((p, scale * u.inertia_power(g, t)));
                        }
                    }
                }
            }
            Row::Pollutant { pollutant, zone } => {
                let generators = self.number_generators();
                for t in 0..self.time_horizon {
                    for g in 0..u.number_generators() {
                        let node = self.node_of(offset + g);
                        if self.pollutants.zone_of(pollutant, node, self.number_nodes)
                            != Some(zone)
                        {
                            continue;
                        }
                        if let Some(p) = u.active_power(g, t) {
                            let rho = self.pollutants.rho_at(t, pollutant, offset + g, generators);
                            terms.push((p, scale * rho));
                        }
                    }
                }
            }
        }
        terms
    }

    fn build_linking(&self, kind: LinkKind) -> ModelResult<Linking> {
        let (cols, keys) = self.link_shape(kind);
        let mut rows = Family::new(kind.family_name(), cols);
        let mut index = vec![vec![0..0; keys]; self.units.len()];
        for row in self.link_rows(kind) {
            let key = self.row_key(row);
            let mut lf = LinearFunction::from_terms(self.row_head(row)?);
            for (i, runs) in index.iter_mut().enumerate() {
                let start = lf.num_terms();
                for (var, coefficient) in self.unit_terms(i, row) {
                    lf.add_variable(var, coefficient);
                }
                runs[key] = start..lf.num_terms();
            }
            let (lhs, rhs) = self.row_bounds(row);
            rows.push(RowConstraint::new(lf, lhs, rhs));
        }
        Ok(Linking { kind, rows, index })
    }

    /// Recomputes the coefficients of `unit` through the term index. Only
    /// rows where the unit has terms are visited, and only node balance
    /// bounds depend on its scale.
    fn patch_unit(&mut self, unit: usize) -> ModelResult<()> {
        let u = &self.units[unit];
        let moves_rhs = u.has_commitment() && u.has_fixed_consumption();
        let mut patches = vec![];
        for (k, link) in self.linking.iter().enumerate() {
            let mut updates = vec![];
            for (key, run) in link.index[unit].iter().enumerate() {
                if run.is_empty() {
                    continue;
                }
                for row in self.key_rows(link.kind, key) {
                    let values: Vec<f64> = self
                        .unit_terms(unit, row)
                        .into_iter()
                        .map(|(_, c)| c)
                        .collect();
                    let rhs = match row {
                        Row::Node { t, node } if moves_rhs => Some(self.node_rhs(t, node)),
                        _ => None,
                    };
                    updates.push((self.row_position(row), run.clone(), values, rhs));
                }
            }
            patches.push((k, updates));
        }
        for (k, updates) in patches {
            let link = &mut self.linking[k];
            let rows = updates.len();
            let extent = link.rows.rows();
            for ((r, c), run, values, rhs) in updates {
                let positions: Vec<usize> = run.collect();
                let constraint = link.rows.get_mut(r, c).ok_or(ModelError::OutOfRangeIndex {
                    what: "linking row",
                    index: r,
                    extent,
                })?;
                constraint.function.modify_coefficients(&values, &positions)?;
                if let Some(value) = rhs {
                    constraint.set_both(value);
                }
            }
            log::patch_summary(self.id, link.rows.name(), rows, false);
        }
        Ok(())
    }

    fn unit_mut(&mut self, unit: usize) -> ModelResult<&mut UnitBlock> {
        let extent = self.units.len();
        self.units.get_mut(unit).ok_or(ModelError::OutOfRangeIndex {
            what: "unit",
            index: unit,
            extent,
        })
    }

    pub fn scale_unit(
        &mut self,
        unit: usize,
        scale: f64,
        physical_mode: ModParam,
        abstract_mode: ModParam,
    ) -> ModelResult<Outcome> {
        let outcome = self
            .unit_mut(unit)?
            .set_scale(scale, physical_mode, abstract_mode)?;
        self.after_scale(unit, outcome, abstract_mode)
    }

    pub fn scale_unit_subset(
        &mut self,
        unit: usize,
        values: &[f64],
        subset: &[usize],
        sorted: bool,
        physical_mode: ModParam,
        abstract_mode: ModParam,
    ) -> ModelResult<Outcome> {
        let outcome = self.unit_mut(unit)?.set_scale_subset(
            values,
            subset,
            sorted,
            physical_mode,
            abstract_mode,
        )?;
        self.after_scale(unit, outcome, abstract_mode)
    }

    pub fn scale_unit_range(
        &mut self,
        unit: usize,
        values: &[f64],
        range: Range<usize>,
        physical_mode: ModParam,
        abstract_mode: ModParam,
    ) -> ModelResult<Outcome> {
        let outcome = self.unit_mut(unit)?.set_scale_range(
            values,
            range,
            physical_mode,
            abstract_mode,
        )?;
        self.after_scale(unit, outcome, abstract_mode)
    }

    fn after_scale(
        &mut self,
        unit: usize,
        outcome: Outcome,
        abstract_mode: ModParam,
    ) -> ModelResult<Outcome> {
        if outcome != Outcome::Applied || !self.state.has_constraints() {
            return Ok(outcome);
        }
        // network bounds are physical data derived from the units
        let internal = if abstract_mode.writes() {
            ModParam::ApplyNoNotify
        } else {
            ModParam::DryRun
        };
        self.refresh_network_bounds(internal)?;
        if abstract_mode.writes() {
            self.patch_unit(unit)?;
        }
        Ok(outcome)
    }

    /// Sets the demand of the flattened `(node, instant)` entries of
    /// `subset`, i.e. index `node * horizon + t`. On a bus the index is
    /// the time instant.
    pub fn set_active_power_demand_subset(
        &mut self,
        values: &[f64],
        subset: &[usize],
        sorted: bool,
        physical_mode: ModParam,
        abstract_mode: ModParam,
    ) -> ModelResult<Outcome> {
        let extent = self.number_nodes * self.time_horizon;
        match Selection::subset(subset, sorted, extent, values, "demand")? {
            Some(sel) => self.update_demand(sel, values, physical_mode, abstract_mode),
            None => Ok(Outcome::Unchanged),
        }
    }

    pub fn set_active_power_demand_range(
        &mut self,
        values: &[f64],
        range: Range<usize>,
        physical_mode: ModParam,
        abstract_mode: ModParam,
    ) -> ModelResult<Outcome> {
        let extent = self.number_nodes * self.time_horizon;
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
        if !sel.differs(&self.active_power_demand, 0.0, values) {
            log::unchanged_update(self.id, "active power demand");
            return Ok(Outcome::Unchanged);
        }
        if !physical_mode.writes() {
            return Ok(Outcome::DryRun);
        }
        let extent = self.number_nodes * self.time_horizon;
        sel.write(&mut self.active_power_demand, extent, 0.0, values);
        log::physical_update(self.id, "active power demand", sel.indices.len());
        if self.is_bus() {
            if abstract_mode.writes() && self.state.has_constraints() {
                self.patch_bus_balance(&sel.indices, abstract_mode);
            }
        } else {
            let internal = if abstract_mode.writes() {
                ModParam::ApplyNoNotify
            } else {
                ModParam::DryRun
            };
            self.forward_demand(&sel.indices, internal)?;
        }
        self.notifier.issue_if(physical_mode, || {
            sel.record(self.id, ModKind::ActivePowerDemand)
        });
        Ok(Outcome::Applied)
    }

    fn patch_bus_balance(&mut self, instants: &[usize], abstract_mode: ModParam) {
        let updates: Vec<(usize, f64)> =
            instants.iter().map(|t| (*t, self.node_rhs(*t, 0))).collect();
        if let Some(link) = self
            .linking
            .iter_mut()
            .find(|l| l.kind == LinkKind::NodeBalance)
        {
            for (t, rhs) in updates.iter() {
                if let Some(c) = link.rows.get_mut(*t, 0) {
                    c.set_both(*rhs);
                }
            }
            log::patch_summary(
                self.id,
                link.rows.name(),
                updates.len(),
                abstract_mode.channel().is_some(),
            );
        }
    }

    fn forward_demand(&mut self, entries: &[usize], abstract_mode: ModParam) -> ModelResult<()> {
        let horizon = self.time_horizon;
        for entry in entries {
            let (node, t) = (entry / horizon, entry % horizon);
            let value = self.active_power_demand[*entry];
            self.networks[t].set_active_demand_subset(
                &[value],
                &[node],
                true,
                ModParam::ApplyNoNotify,
                abstract_mode,
            )?;
        }
        Ok(())
    }

    pub fn deserialize(group: &Group) -> ModelResult<Self> {
        Self::deserialize_with(group, &NetworkDataFactory::new())
    }

    pub fn deserialize_with(group: &Group, factory: &NetworkDataFactory) -> ModelResult<Self> {
        let horizon = group.require_dim("TimeHorizon")?;
        let number_units = group.require_dim("NumberUnits")?;
        let nodes = group.dim("NumberNodes").unwrap_or(1);
        let mut block = Self::new(horizon);
        for i in 0..number_units {
            let unit = UnitBlock::deserialize(group.require_group(&format!("UnitBlock_{i}"))?)?;
            block.add_unit(unit)?;
        }
        let generator_node = group.uint("GeneratorNode")?;
        if nodes > 1 {
            let classname = group
                .text("NetworkDataClassname")?
                .and_then(|names| names.into_iter().next())
                .unwrap_or_else(|| DcNetworkData::CLASSNAME.to_string());
            let data = factory.build(&classname, group)?;
            let generator_node = generator_node
                .ok_or_else(|| ModelError::MissingMandatoryField("GeneratorNode".to_string()))?;
            block.set_network(data, generator_node)?;
        } else {
            block.generator_node = generator_node.unwrap_or_default();
        }
        if let Some(demand) = group.double("ActivePowerDemand")? {
            let extent = nodes * horizon;
            let demand = broadcast(&demand, extent, "ActivePowerDemand")?;
            block.set_active_power_demand_range(
                &demand,
                0..extent,
                ModParam::ApplyNoNotify,
                ModParam::ApplyNoNotify,
            )?;
        }
        block.primary = ZoneData::deserialize(group, "Primary", horizon)?;
        block.secondary = ZoneData::deserialize(group, "Secondary", horizon)?;
        block.inertia = ZoneData::deserialize(group, "Inertia", horizon)?;
        block.pollutants = PollutantData::deserialize(group, horizon, block.number_generators())?;
        if let Some(terms) = group.double("NetworkConstantTerms")? {
            let terms = if block.is_bus() {
                terms
            } else {
                broadcast(&terms, block.networks.len(), "NetworkConstantTerms")?
            };
            block.set_network_constant_terms(terms)?;
        }
        block.layouts = Layouts::of(group);
        Ok(block)
    }

    /// Writes the block back. Optional fields that were absent on read
    /// stay absent while they hold their defaults.
    pub fn serialize(&self, group: &mut Group) {
        let layouts = &self.layouts;
        group.set_dim("TimeHorizon", self.time_horizon);
        group.set_dim("NumberUnits", self.units.len());
        if let Some(data) = self.networks.first().and_then(|n| n.network_data()) {
            data.serialize(group);
            if self.network_classname != DcNetworkData::CLASSNAME
                || layouts.has_array("NetworkDataClassname")
            {
                group.put_text(
                    "NetworkDataClassname",
                    &[],
                    vec![self.network_classname.clone()],
                );
            }
        } else if layouts.has_dim("NumberNodes") {
            group.set_dim("NumberNodes", self.number_nodes);
        }
        if !self.generator_node.is_empty() {
            let dims = layouts.dims_or("GeneratorNode", &["NumberElectricalGenerators"]);
            group.put_uint("GeneratorNode", &dims, self.generator_node.clone());
        }
        if !self.active_power_demand.is_empty() || layouts.has_array("ActivePowerDemand") {
            let dims: &[&str] = if self.is_bus() {
                &["TimeHorizon"]
            } else {
                &["NumberNodes", "TimeHorizon"]
            };
            let mut demand = self.active_power_demand.clone();
            demand.resize(self.number_nodes * self.time_horizon, 0.0);
            layouts.put_double(group, "ActivePowerDemand", dims, &demand);
        }
        self.primary.serialize(group, "Primary", layouts);
        self.secondary.serialize(group, "Secondary", layouts);
        self.inertia.serialize(group, "Inertia", layouts);
        self.pollutants.serialize(group, layouts);
        if self.network_constant_terms.iter().any(|c| *c != 0.0)
            || layouts.has_array("NetworkConstantTerms")
        {
            layouts.put_double(
                group,
                "NetworkConstantTerms",
                &["NumberNetworks"],
                &self.network_constant_terms,
            );
        }
        for (i, unit) in self.units.iter().enumerate() {
            let mut sub = Group::new();
            unit.serialize(&mut sub);
            group.add_group(&format!("UnitBlock_{i}"), sub);
        }
    }
}

impl VariableLookup for UcBlock {
    fn lookup(&self, var: VarRef) -> Option<&ColVariable> {
        if let Some(unit) = self.units.iter().find(|u| u.id() == var.block) {
            return unit.lookup(var);
        }
        self.networks
            .iter()
            .find(|n| n.id() == var.block)
            .and_then(|n| n.lookup(var))
    }
}

impl Block for UcBlock {
    fn id(&self) -> BlockId {
        self.id
    }

    fn kind(&self) -> &'static str {
        "UCBlock"
    }

    fn generation_state(&self) -> GenerationState {
        self.state
    }

    fn generate_variables(&mut self) -> ModelResult<()> {
        if self.state.begin(GenerationState::VariablesGenerated)? == StepAction::Skip {
            return Ok(());
        }
        for unit in self.units.iter_mut() {
            unit.generate_variables()?;
        }
        for network in self.networks.iter_mut() {
            network.generate_variables()?;
        }
        self.state = GenerationState::VariablesGenerated;
        log::generation_summary(self.kind(), self.id, "variables", self.num_variables());
        Ok(())
    }

    fn generate_constraints(&mut self) -> ModelResult<()> {
        if self.state.begin(GenerationState::ConstraintsGenerated)? == StepAction::Skip {
            return Ok(());
        }
        self.validate()?;
        // networks need their injection bounds before building their rows
        self.refresh_network_bounds(ModParam::ApplyNoNotify)?;
        for unit in self.units.iter_mut() {
            unit.generate_constraints()?;
        }
        for network in self.networks.iter_mut() {
            network.generate_constraints()?;
        }
        let mut linking = vec![];
        for kind in LinkKind::ALL {
            let link = self.build_linking(kind)?;
            if !link.rows.is_empty() {
                linking.push(link);
            }
        }
        self.linking = linking;
        self.state = GenerationState::ConstraintsGenerated;
        log::generation_summary(self.kind(), self.id, "constraints", self.num_constraints());
        Ok(())
    }

    fn generate_objective(&mut self) -> ModelResult<()> {
        if self.state.begin(GenerationState::ObjectiveGenerated)? == StepAction::Skip {
            return Ok(());
        }
        for unit in self.units.iter_mut() {
            unit.generate_objective()?;
        }
        for network in self.networks.iter_mut() {
            network.generate_objective()?;
        }
        let mut lf = LinearFunction::new();
        lf.set_constant(self.own_constant());
        self.objective = Some(Objective::minimise(lf));
        self.state = GenerationState::ObjectiveGenerated;
        log::generation_summary(self.kind(), self.id, "objective", 0);
        Ok(())
    }

    fn as_lookup(&self) -> &dyn VariableLookup {
        self
    }

    fn for_each_variable(&self, f: &mut dyn FnMut(VarRef, &ColVariable)) {
        for unit in self.units.iter() {
            unit.for_each_variable(f);
        }
        for network in self.networks.iter() {
            network.for_each_variable(f);
        }
    }

    fn for_each_constraint(
        &self,
        f: &mut dyn FnMut(&'static str, usize, ConstraintRef<'_>),
    ) {
        for link in self.linking.iter() {
            link.rows.visit(f);
        }
        for unit in self.units.iter() {
            unit.for_each_constraint(f);
        }
        for network in self.networks.iter() {
            network.for_each_constraint(f);
        }
    }

    fn for_each_objective(&self, f: &mut dyn FnMut(&Objective)) {
        if let Some(objective) = self.objective.as_ref() {
            f(objective);
        }
        for unit in self.units.iter() {
            unit.for_each_objective(f);
        }
        for network in self.networks.iter() {
            network.for_each_objective(f);
        }
    }

    fn config(&self) -> Option<&BlockConfig> {
        self.config.as_ref()
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::config::FeasibilityConfig;
    use crate::modification::{Addressing, ChannelName, Modification};
    use crate::unit::UnitData;

    fn apply() -> ModParam {
        ModParam::Apply(ChannelName::default())
    }

    fn quiet() -> ModParam {
        ModParam::ApplyNoNotify
    }

    // A free unit and a committed one with fixed consumption
    fn bus_block() -> UcBlock {
        let mut block = UcBlock::new(2);
        let free = UnitData::new(1, 2, &[0.0], &[10.0])
            .unwrap()
            .with_linear_cost(&[1.0])
            .unwrap();
        let committed = UnitData::new(1, 2, &[2.0], &[8.0])
            .unwrap()
            .with_commitment()
            .with_fixed_consumption(&[0.5])
            .unwrap();
        block.add_unit(UnitBlock::new(free)).unwrap();
        block.add_unit(UnitBlock::new(committed)).unwrap();
        block
            .set_active_power_demand_range(&[4.0, 6.0], 0..2, quiet(), quiet())
            .unwrap();
        block
    }

    // Two nodes joined by one HVDC line. Unit 0 sits at node 0 and
    // holds primary reserve, unit 1 sits at node 1 with commitment,
    // fixed consumption and inertia.
    fn two_node_block() -> UcBlock {
        let mut block = UcBlock::new(2);
        let reserve = UnitData::new(1, 2, &[1.0], &[10.0])
            .unwrap()
            .with_linear_cost(&[2.0])
            .unwrap()
            .with_reserves(true, false);
        let committed = UnitData::new(1, 2, &[2.0], &[8.0])
            .unwrap()
            .with_commitment()
            .with_fixed_consumption(&[0.5])
            .unwrap()
            .with_inertia(&[2.0], &[3.0])
            .unwrap();
        block.add_unit(UnitBlock::new(reserve)).unwrap();
        block.add_unit(UnitBlock::new(committed)).unwrap();
        let data = DcNetworkData::new(2, vec![0], vec![1], vec![-5.0], vec![5.0]).unwrap();
        block.set_network(NetworkData::Dc(data), vec![0, 1]).unwrap();
        block
            .set_active_power_demand_range(&[3.0, 3.0, 2.0, 2.0], 0..4, quiet(), quiet())
            .unwrap();
        block
            .set_primary_zones(ZoneData::new(1, vec![], vec![1.0, 1.0]))
            .unwrap();
        block
            .set_inertia_zones(ZoneData::new(1, vec![], vec![0.5, 0.5]))
            .unwrap();
        block
            .set_pollutants(PollutantData {
                number_zones: vec![1],
                zones: vec![],
                budget: vec![100.0],
                rho: vec![1.0, 2.0, 1.0, 2.0],
            })
            .unwrap();
        block
    }

    type Snapshot = Vec<(&'static str, Vec<f64>, f64, f64)>;

    fn snapshot(block: &UcBlock) -> Snapshot {
        let mut rows = vec![];
        block.for_each_constraint(&mut |name, _, c| {
            let coefficients = match c {
                ConstraintRef::Row(r) => r.function.terms().iter().map(|(_, v)| *v).collect(),
                ConstraintRef::Box(_) => vec![],
            };
            let (lhs, rhs) = c.bounds();
            rows.push((name, coefficients, lhs, rhs));
        });
        rows
    }

    fn objective_coefficients(block: &UcBlock) -> Vec<f64> {
        let mut all = vec![];
        block.for_each_objective(&mut |o| {
            all.extend(o.function.terms().iter().map(|(_, v)| *v));
            all.push(o.function.constant());
        });
        all
    }

    #[test]
    fn test_bus_balance_rows() {
        let mut block = bus_block();
        block.generate_all().unwrap();
        assert!(block.is_bus());
        let balance = block.linking(LinkKind::NodeBalance).unwrap();
        assert_eq!(balance.len(), 2);
        let row = balance.get(1, 0).unwrap();
        // p0 + p1 - 0.5 u1 = 6 - 0.5
        assert_eq!(row.function.num_terms(), 3);
        assert_eq!((row.lhs, row.rhs), (5.5, 5.5));
        assert_eq!(block.term_range(LinkKind::NodeBalance, 0, 0), Some(0..1));
        assert_eq!(block.term_range(LinkKind::NodeBalance, 1, 0), Some(1..3));
        assert!(block.linking(LinkKind::PrimaryDemand).is_none());
    }

    #[test]
    fn test_bus_demand_patches_balance_and_notifies() {
        let mut block = bus_block();
        block.generate_all().unwrap();
        let rx = block.notifier().subscribe(ChannelName::default());
        assert_eq!(
            block
                .set_active_power_demand_subset(&[6.0], &[1], true, apply(), apply())
                .unwrap(),
            Outcome::Unchanged
        );
        assert_eq!(
            block
                .set_active_power_demand_subset(&[7.0], &[1], true, apply(), apply())
                .unwrap(),
            Outcome::Applied
        );
        let row = block.linking(LinkKind::NodeBalance).unwrap().get(1, 0).unwrap();
        assert_eq!((row.lhs, row.rhs), (6.5, 6.5));
        let records: Vec<Modification> = rx.try_iter().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ModKind::ActivePowerDemand);
        assert_eq!(records[0].addressing, Addressing::Subset(vec![1]));
    }

    #[test]
    fn test_two_node_generation() {
        let mut block = two_node_block();
        block.generate_all().unwrap();
        assert_eq!(block.networks().len(), 2);
        let balance = block.linking(LinkKind::NodeBalance).unwrap();
        assert_eq!(balance.len(), 4);
        // -s0 + p0 = 0
        let node0 = balance.get(0, 0).unwrap();
        assert_eq!(node0.function.num_terms(), 2);
        assert_eq!((node0.lhs, node0.rhs), (0.0, 0.0));
        // -s1 + p1 - 0.5 u1 = -0.5
        let node1 = balance.get(0, 1).unwrap();
        assert_eq!(node1.function.num_terms(), 3);
        assert_eq!(node1.rhs, -0.5);
        assert_eq!(block.term_range(LinkKind::NodeBalance, 1, 1), Some(1..3));
        assert_eq!(block.term_range(LinkKind::NodeBalance, 1, 0), Some(2..2));

        let (min, max) = block.networks()[1].node_injection_bounds();
        assert_eq!(min, &[1.0, 0.0]);
        assert_eq!(max, &[10.0, 8.0]);

        let primary = block.linking(LinkKind::PrimaryDemand).unwrap();
        assert_eq!(primary.len(), 2);
        assert_eq!(primary.get(0, 0).unwrap().function.num_terms(), 1);
        let inertia = block.linking(LinkKind::InertiaDemand).unwrap().get(0, 0).unwrap();
        let coefficients: Vec<f64> = inertia.function.terms().iter().map(|(_, c)| *c).collect();
        assert_eq!(coefficients, vec![3.0, 2.0]);
        assert_eq!(inertia.lhs, 0.5);

        let budget = block.linking(LinkKind::PollutantBudget).unwrap().get(0, 0).unwrap();
        let coefficients: Vec<f64> = budget.function.terms().iter().map(|(_, c)| *c).collect();
        assert_eq!(coefficients, vec![1.0, 1.0, 2.0, 2.0]);
        assert_eq!(budget.rhs, 100.0);
        assert_eq!(block.term_range(LinkKind::PollutantBudget, 1, 0), Some(2..4));
    }

    #[test]
    fn test_scale_unit_patches_and_notifies_once() {
        let mut block = two_node_block();
        block.generate_all().unwrap();
        let rx = block.notifier().subscribe(ChannelName::default());
        assert_eq!(block.scale_unit(0, 2.0, apply(), apply()).unwrap(), Outcome::Applied);
        let records: Vec<Modification> = rx.try_iter().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].kind, ModKind::Scale);
        assert_eq!(records[0].block, block.units()[0].id());

        let node0 = block.linking(LinkKind::NodeBalance).unwrap().get(1, 0).unwrap();
        assert_eq!(node0.function.coefficient_at(1), Some(2.0));
        let budget = block.linking(LinkKind::PollutantBudget).unwrap().get(0, 0).unwrap();
        assert_eq!(budget.function.coefficient_at(0), Some(2.0));
        assert_eq!(budget.function.coefficient_at(2), Some(2.0));
        let (min, max) = block.networks()[0].node_injection_bounds();
        assert_eq!(min, &[2.0, 0.0]);
        assert_eq!(max, &[20.0, 8.0]);
    }

    #[test]
    fn test_scale_patch_leaves_foreign_rows_alone() {
        let mut block = two_node_block();
        block.generate_all().unwrap();
        // unit 0 has no terms at node 1 and none in the inertia rows
        assert_eq!(block.term_range(LinkKind::NodeBalance, 0, 1), Some(1..1));
        assert_eq!(block.term_range(LinkKind::InertiaDemand, 0, 0), Some(0..0));
        for link in block.linking.iter_mut() {
            match link.kind {
                LinkKind::NodeBalance => link.rows.get_mut(0, 1).unwrap().set_both(99.0),
                LinkKind::InertiaDemand => link.rows.get_mut(1, 0).unwrap().lhs = 77.0,
                _ => {}
            }
        }
        block.scale_unit(0, 2.0, quiet(), quiet()).unwrap();

        let balance = block.linking(LinkKind::NodeBalance).unwrap();
        assert_eq!(balance.get(0, 1).unwrap().rhs, 99.0);
        assert_eq!(balance.get(0, 0).unwrap().function.coefficient_at(1), Some(2.0));
        let inertia = block.linking(LinkKind::InertiaDemand).unwrap();
        assert_eq!(inertia.get(1, 0).unwrap().lhs, 77.0);

        // unit 1 moves the node 1 right hand side through its fixed consumption
        block.scale_unit(1, 3.0, quiet(), quiet()).unwrap();
        let balance = block.linking(LinkKind::NodeBalance).unwrap();
        assert_eq!(balance.get(0, 1).unwrap().rhs, -1.5);
        assert_eq!(balance.get(1, 1).unwrap().rhs, -1.5);
        assert_eq!(balance.get(1, 0).unwrap().rhs, 0.0);
    }

    #[test]
    fn test_patched_rows_equal_regenerated_rows() {
        let mut patched = two_node_block();
        patched.generate_all().unwrap();
        patched.scale_unit(1, 3.0, apply(), apply()).unwrap();
        patched.scale_unit(0, 0.5, apply(), apply()).unwrap();

        let mut fresh = two_node_block();
        fresh.scale_unit(1, 3.0, quiet(), quiet()).unwrap();
        fresh.scale_unit(0, 0.5, quiet(), quiet()).unwrap();
        fresh.generate_all().unwrap();

        assert_eq!(snapshot(&patched), snapshot(&fresh));
        assert_eq!(objective_coefficients(&patched), objective_coefficients(&fresh));
    }

    #[test]
    fn test_abstract_dry_run_leaves_rows_stale() {
        let mut block = bus_block();
        block.generate_all().unwrap();
        let before = snapshot(&block);
        assert_eq!(
            block.scale_unit(1, 2.0, apply(), ModParam::DryRun).unwrap(),
            Outcome::Applied
        );
        assert_eq!(block.units()[1].scale(), 2.0);
        assert_eq!(snapshot(&block), before);
    }

    #[test]
    fn test_demand_is_forwarded_to_networks() {
        let mut block = two_node_block();
        block.generate_all().unwrap();
        // node 0, instant 1
        block
            .set_active_power_demand_range(&[4.0], 1..2, apply(), apply())
            .unwrap();
        assert_eq!(block.active_power_demand(0, 1), Some(4.0));
        assert_eq!(block.active_power_demand(2, 0), None);
        assert_eq!(block.networks()[1].active_demand(0), Some(vec![4.0, 2.0]));
        assert_eq!(block.networks()[0].active_demand(0), Some(vec![3.0, 2.0]));
        let balance = block.networks()[1].injection_balance().get(0, 0).unwrap();
        assert_eq!(balance.rhs, -4.0);
    }

    #[test]
    fn test_unknown_unit_and_late_changes_are_rejected() {
        let mut block = bus_block();
        let err = block.scale_unit(5, 2.0, apply(), apply()).unwrap_err();
        assert!(matches!(err, ModelError::OutOfRangeIndex { what: "unit", .. }));
        block.generate_all().unwrap();
        let unit = UnitBlock::new(UnitData::new(1, 2, &[0.0], &[1.0]).unwrap());
        assert!(matches!(block.add_unit(unit), Err(ModelError::TopologyFrozen(_))));
    }

    #[test]
    fn test_unit_horizon_must_match() {
        let mut block = UcBlock::new(3);
        let unit = UnitBlock::new(UnitData::new(1, 2, &[0.0], &[1.0]).unwrap());
        assert!(matches!(
            block.add_unit(unit),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_generator_nodes_are_checked() {
        let mut block = two_node_block();
        block.generator_node = vec![0, 2];
        block.generate_variables().unwrap();
        assert!(matches!(
            block.generate_constraints(),
            Err(ModelError::OutOfRangeIndex { what: "node", .. })
        ));
    }

    #[test]
    fn test_network_constant_terms() {
        let mut block = bus_block();
        block.set_network_constant_terms(vec![1.5, 2.5]).unwrap();
        block.generate_all().unwrap();
        assert_eq!(block.objective().unwrap().function.constant(), 4.0);

        let mut block = two_node_block();
        assert!(block.set_network_constant_terms(vec![1.0]).is_err());
        block.set_network_constant_terms(vec![1.0, 2.0]).unwrap();
        block.generate_all().unwrap();
        assert_eq!(block.objective().unwrap().function.constant(), 0.0);
        assert_eq!(block.networks()[1].constant_term(), 2.0);
    }

    #[test]
    fn test_objective_value_sums_children() {
        let mut block = bus_block();
        block.generate_all().unwrap();
        let slot = block.units()[0].active_power(0, 1).unwrap().slot;
        if let Some(v) = block.units[0].variable_store_mut().get_mut(slot) {
            v.value = 3.0;
        }
        assert_eq!(block.objective_value().unwrap(), 3.0);
    }

    #[test]
    fn test_codec_round_trip() {
        for block in [bus_block(), two_node_block()] {
            let mut group = Group::new();
            block.serialize(&mut group);
            let back = UcBlock::deserialize(&group).unwrap();
            assert_eq!(back.number_nodes(), block.number_nodes());
            assert_eq!(back.units().len(), 2);
            let mut again = Group::new();
            back.serialize(&mut again);
            assert_eq!(group, again);
        }
    }

    // A bus over two instants written the short way: scalar demands, no
    // zone counts and a scalar pollutant rho
    fn scalar_group() -> Group {
        let mut group = Group::new();
        group.set_dim("TimeHorizon", 2);
        group.set_dim("NumberUnits", 1);
        group.put_double("ActivePowerDemand", &[], vec![3.0]);
        group.put_double("PrimaryDemand", &[], vec![3.0]);
        group.set_dim("NumberPollutants", 1);
        group.put_double("PollutantBudget", &["TotalNumberPollutantZones"], vec![50.0]);
        group.put_double("PollutantRho", &[], vec![1.0]);
        let unit = UnitData::new(1, 2, &[0.0], &[10.0])
            .unwrap()
            .with_reserves(true, false);
        let mut sub = Group::new();
        UnitBlock::new(unit).serialize(&mut sub);
        group.add_group("UnitBlock_0", sub);
        group
    }

    #[test]
    fn test_round_trip_keeps_the_input_group() {
        let mut counted = scalar_group();
        counted.set_dim("NumberPrimaryZones", 1);
        let mut zero_demand = scalar_group();
        zero_demand.put_double("ActivePowerDemand", &["TimeHorizon"], vec![0.0, 0.0]);
        for group in [scalar_group(), counted, zero_demand] {
            let block = UcBlock::deserialize(&group).unwrap();
            let mut again = Group::new();
            block.serialize(&mut again);
            assert_eq!(again, group);
        }
    }

    #[test]
    fn test_scalar_fields_broadcast() {
        let mut block = UcBlock::deserialize(&scalar_group()).unwrap();
        assert_eq!(block.active_power_demand(0, 1), Some(3.0));
        block.generate_all().unwrap();
        let balance = block.linking(LinkKind::NodeBalance).unwrap().get(1, 0).unwrap();
        assert_eq!(balance.rhs, 3.0);
        let primary = block.linking(LinkKind::PrimaryDemand).unwrap().get(1, 0).unwrap();
        assert_eq!(primary.lhs, 3.0);
        let budget = block.linking(LinkKind::PollutantBudget).unwrap().get(0, 0).unwrap();
        let coefficients: Vec<f64> = budget.function.terms().iter().map(|(_, c)| *c).collect();
        assert_eq!(coefficients, vec![1.0, 1.0]);
        assert_eq!(budget.rhs, 50.0);
    }

    #[test]
    fn test_short_pollutant_budget_is_rejected() {
        let mut group = scalar_group();
        group.put_uint("NumberPollutantZones", &["NumberPollutants"], vec![2]);
        group.put_double("PollutantBudget", &[], vec![1.0, 2.0, 3.0]);
        assert!(matches!(
            UcBlock::deserialize(&group),
            Err(ModelError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_multi_node_needs_generator_nodes() {
        let mut group = Group::new();
        two_node_block().serialize(&mut group);
        let mut without = Group::new();
        for name in ["TimeHorizon", "NumberUnits", "NumberNodes", "NumberLines"] {
            if let Some(v) = group.dim(name) {
                without.set_dim(name, v);
            }
        }
        for name in ["StartLine", "EndLine"] {
            if let Some(v) = group.uint(name).unwrap() {
                without.put_uint(name, &["NumberLines"], v);
            }
        }
        for name in ["MinPowerFlow", "MaxPowerFlow"] {
            if let Some(v) = group.double(name).unwrap() {
                without.put_double(name, &["NumberLines"], v);
            }
        }
        for i in 0..2 {
            let name = format!("UnitBlock_{i}");
            without.add_group(&name, group.group(&name).unwrap().clone());
        }
        assert!(matches!(
            UcBlock::deserialize(&without),
            Err(ModelError::MissingMandatoryField(_))
        ));
    }

    #[test]
    fn test_unknown_network_classname() {
        let mut group = Group::new();
        two_node_block().serialize(&mut group);
        group.put_text("NetworkDataClassname", &[], vec!["Ring".to_string()]);
        assert!(matches!(
            UcBlock::deserialize(&group),
            Err(ModelError::UnknownClassname(_))
        ));
    }

    #[test]
    fn test_feasible_dispatch() {
        let mut block = bus_block();
        block.generate_all().unwrap();
        // with p0 = 4 and everything else at 0 the balance rows miss by
        // 0.5 and 5.5
        let slot = block.units()[0].active_power(0, 0).unwrap().slot;
        if let Some(v) = block.units[0].variable_store_mut().get_mut(slot) {
            v.value = 4.0;
        }
        let loose = FeasibilityConfig {
            tolerance: 6.0,
            relative: false,
        };
        assert!(block.is_feasible(Some(&loose)).unwrap());
        assert!(!block.is_feasible(None).unwrap());
    }
}
