use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use crate::error::{ModelError, ModelResult};
use crate::group::{Group, Layouts};
use crate::utils::broadcast;

/// Classification of the lines of a network, derived from the
/// susceptances. Drives which flow-limit family gets generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineType {
    /// No lines at all
    None,
    /// Every susceptance is exactly zero
    Hvdc,
    /// Every susceptance is nonzero
    Ac,
    Hybrid,
}

/// Helper function for classifying a set of lines by their susceptance.
/// An empty susceptance vector stands for all zeros.
pub fn classify(number_lines: usize, susceptance: &[f64]) -> LineType {
    if number_lines == 0 {
        return LineType::None;
    }
    if susceptance.is_empty() {
        return LineType::Hvdc;
    }
    let zeros = susceptance.iter().filter(|b| **b == 0.0).count();
    if zeros == susceptance.len() {
        LineType::Hvdc
    } else if zeros == 0 {
        LineType::Ac
    } else {
        LineType::Hybrid
    }
}

/// Read-only description of a network, as needed to generate the
/// abstract representation of a network block.
pub trait NetworkDescriptor: fmt::Debug {
    fn classname(&self) -> &str;
    fn number_nodes(&self) -> usize;
    fn number_lines(&self) -> usize;
    fn start_line(&self) -> &[usize];
    fn end_line(&self) -> &[usize];
    fn min_power_flow(&self) -> &[f64];
    fn max_power_flow(&self) -> &[f64];
    /// Empty means all zero
    fn susceptance(&self) -> &[f64];
    /// Empty means no cost
    fn network_cost(&self) -> &[f64];
    /// Row-major `lines x nodes`, if any
    fn ptdf(&self) -> Option<&[f64]>;
    fn node_names(&self) -> &[String];
    fn line_names(&self) -> &[String];
    fn serialize(&self, group: &mut Group);

    fn lines_type(&self) -> LineType {
        classify(self.number_lines(), self.susceptance())
    }

    fn is_hvdc_line(&self, line: usize) -> bool {
        self.susceptance().get(line).map_or(true, |b| *b == 0.0)
    }

    fn ptdf_entry(&self, line: usize, node: usize) -> f64 {
        self.ptdf()
            .and_then(|m| m.get(line * self.number_nodes() + node))
            .copied()
            .unwrap_or(0.0)
    }

    /// Checks that every per-line array matches the line count and that
    /// the line endpoints are nodes.
    fn check_shape(&self) -> ModelResult<()> {
        let (nodes, lines) = (self.number_nodes(), self.number_lines());
        for (what, len) in [
            ("StartLine", self.start_line().len()),
            ("EndLine", self.end_line().len()),
            ("MinPowerFlow", self.min_power_flow().len()),
            ("MaxPowerFlow", self.max_power_flow().len()),
        ] {
            if len != lines {
                return Err(ModelError::shape(what, lines, len));
            }
        }
        for (what, len) in [
            ("Susceptance", self.susceptance().len()),
            ("NetworkCost", self.network_cost().len()),
        ] {
            if len != 0 && len != lines {
                return Err(ModelError::shape(what, lines, len));
            }
        }
        if let Some(m) = self.ptdf() {
            if m.len() != lines * nodes {
                return Err(ModelError::shape("PTDF", lines * nodes, m.len()));
            }
        }
        match self
            .start_line()
            .iter()
            .chain(self.end_line())
            .find(|n| **n >= nodes)
        {
            Some(node) => Err(ModelError::OutOfRangeIndex {
                what: "node",
                index: *node,
                extent: nodes,
            }),
            None => Ok(()),
        }
    }
}

/// Topology of a DC network: nodes, lines with endpoints and flow
/// limits, and the optional susceptance, cost and distribution factors.
#[derive(Debug, Clone)]
pub struct DcNetworkData {
    number_nodes: usize,
    start_line: Vec<usize>,
    end_line: Vec<usize>,
    min_power_flow: Vec<f64>,
    max_power_flow: Vec<f64>,
    susceptance: Vec<f64>,
    network_cost: Vec<f64>,
    ptdf: Option<Vec<f64>>,
    node_names: Vec<String>,
    line_names: Vec<String>,
    layouts: Layouts,
}

// Equal topologies, however they were laid out on file
impl PartialEq for DcNetworkData {
    fn eq(&self, other: &Self) -> bool {
        self.number_nodes == other.number_nodes
            && self.start_line == other.start_line
            && self.end_line == other.end_line
            && self.min_power_flow == other.min_power_flow
            && self.max_power_flow == other.max_power_flow
            && self.susceptance == other.susceptance
            && self.network_cost == other.network_cost
            && self.ptdf == other.ptdf
            && self.node_names == other.node_names
            && self.line_names == other.line_names
    }
}

impl DcNetworkData {
    pub const CLASSNAME: &'static str = "DCNetworkData";

    /// A single node without lines.
    pub fn bus() -> Self {
        Self {
            number_nodes: 1,
            start_line: vec![],
            end_line: vec![],
            min_power_flow: vec![],
            max_power_flow: vec![],
            susceptance: vec![],
            network_cost: vec![],
            ptdf: None,
            node_names: vec![],
            line_names: vec![],
            layouts: Layouts::default(),
        }
    }

    pub fn new(
        number_nodes: usize,
        start_line: Vec<usize>,
        end_line: Vec<usize>,
        min_power_flow: Vec<f64>,
        max_power_flow: Vec<f64>,
    ) -> ModelResult<Self> {
        let data = Self {
            number_nodes,
            start_line,
            end_line,
            min_power_flow,
            max_power_flow,
            ..Self::bus()
        };
        data.validate()?;
        Ok(data)
    }

    pub fn with_susceptance(mut self, susceptance: Vec<f64>) -> ModelResult<Self> {
        self.set_susceptance(susceptance)?;
        Ok(self)
    }

    pub fn with_network_cost(mut self, cost: Vec<f64>) -> ModelResult<Self> {
        self.set_network_cost(cost)?;
        Ok(self)
    }

    pub fn with_ptdf(mut self, ptdf: Vec<f64>) -> ModelResult<Self> {
        self.set_ptdf(Some(ptdf))?;
        Ok(self)
    }

    pub fn with_node_names(mut self, names: Vec<String>) -> ModelResult<Self> {
        if !names.is_empty() && names.len() != self.number_nodes {
            return Err(ModelError::shape("NodeName", self.number_nodes, names.len()));
        }
        self.node_names = names;
        Ok(self)
    }

    pub fn with_line_names(mut self, names: Vec<String>) -> ModelResult<Self> {
        if !names.is_empty() && names.len() != self.number_lines() {
            return Err(ModelError::shape("LineName", self.number_lines(), names.len()));
        }
        self.line_names = names;
        Ok(self)
    }

    /// Checks every structural invariant of the descriptor.
    pub fn validate(&self) -> ModelResult<()> {
        if self.number_nodes == 0 {
            return Err(ModelError::InvalidTopology(
                "a network needs at least one node".to_string(),
            ));
        }
        let lines = self.start_line.len();
        if self.number_nodes == 1 && lines > 0 {
            return Err(ModelError::InvalidTopology(
                "a single-node network cannot have lines".to_string(),
            ));
        }
        if self.end_line.len() != lines {
            return Err(ModelError::shape("EndLine", lines, self.end_line.len()));
        }
        if self.min_power_flow.len() != lines {
            return Err(ModelError::shape("MinPowerFlow", lines, self.min_power_flow.len()));
        }
        if self.max_power_flow.len() != lines {
            return Err(ModelError::shape("MaxPowerFlow", lines, self.max_power_flow.len()));
        }
        for (line, (start, end)) in self.start_line.iter().zip(&self.end_line).enumerate() {
            for node in [start, end] {
                if *node >= self.number_nodes {
                    return Err(ModelError::OutOfRangeIndex {
                        what: "node",
                        index: *node,
                        extent: self.number_nodes,
                    });
                }
            }
            if start == end {
                return Err(ModelError::InvalidTopology(format!(
                    "line {line} is a self loop on node {start}"
                )));
            }
        }
        Ok(())
    }

    pub fn set_susceptance(&mut self, susceptance: Vec<f64>) -> ModelResult<()> {
        if !susceptance.is_empty() && susceptance.len() != self.number_lines() {
            return Err(ModelError::shape(
                "Susceptance",
                self.number_lines(),
                susceptance.len(),
            ));
        }
        self.susceptance = susceptance;
        Ok(())
    }

    pub fn set_network_cost(&mut self, cost: Vec<f64>) -> ModelResult<()> {
        if !cost.is_empty() && cost.len() != self.number_lines() {
            return Err(ModelError::shape("NetworkCost", self.number_lines(), cost.len()));
        }
        self.network_cost = cost;
        Ok(())
    }

    pub fn set_ptdf(&mut self, ptdf: Option<Vec<f64>>) -> ModelResult<()> {
        if let Some(m) = &ptdf {
            let expected = self.number_lines() * self.number_nodes;
            if m.len() != expected {
                return Err(ModelError::shape("PTDF", expected, m.len()));
            }
        }
        self.ptdf = ptdf;
        Ok(())
    }

    pub fn set_flow_limits(&mut self, min: Vec<f64>, max: Vec<f64>) -> ModelResult<()> {
        let lines = self.number_lines();
        let min = broadcast(&min, lines, "MinPowerFlow")?;
        let max = broadcast(&max, lines, "MaxPowerFlow")?;
        self.min_power_flow = min;
        self.max_power_flow = max;
        Ok(())
    }

    pub fn deserialize(group: &Group) -> ModelResult<Self> {
        let number_nodes = group.dim("NumberNodes").unwrap_or(1);
        let mut data = Self {
            number_nodes,
            ..Self::bus()
        };
        if number_nodes > 1 {
            let lines = group.require_dim("NumberLines")?;
            data.start_line = group.require_uint("StartLine")?;
            data.end_line = group.require_uint("EndLine")?;
            data.min_power_flow =
                broadcast(&group.require_double("MinPowerFlow")?, lines, "MinPowerFlow")?;
            data.max_power_flow =
                broadcast(&group.require_double("MaxPowerFlow")?, lines, "MaxPowerFlow")?;
            if data.start_line.len() != lines {
                return Err(ModelError::shape("StartLine", lines, data.start_line.len()));
            }
            if let Some(b) = group.double("Susceptance")? {
                data.susceptance = broadcast(&b, lines, "Susceptance")?;
            }
            if let Some(c) = group.double("NetworkCost")? {
                data.network_cost = broadcast(&c, lines, "NetworkCost")?;
            }
            data.ptdf = group.double("PTDF")?;
        }
        data.validate()?;
        let ptdf = data.ptdf.take();
        data.set_ptdf(ptdf)?;
        data.layouts = Layouts::of(group);
        data.with_node_names(group.text("NodeName")?.unwrap_or_default())?
            .with_line_names(group.text("LineName")?.unwrap_or_default())
    }
}

impl NetworkDescriptor for DcNetworkData {
    fn classname(&self) -> &str {
        Self::CLASSNAME
    }

    fn number_nodes(&self) -> usize {
        self.number_nodes
    }

    fn number_lines(&self) -> usize {
        self.start_line.len()
    }

    fn start_line(&self) -> &[usize] {
        &self.start_line
    }

    fn end_line(&self) -> &[usize] {
        &self.end_line
    }

    fn min_power_flow(&self) -> &[f64] {
        &self.min_power_flow
    }

    fn max_power_flow(&self) -> &[f64] {
        &self.max_power_flow
    }

    fn susceptance(&self) -> &[f64] {
        &self.susceptance
    }

    fn network_cost(&self) -> &[f64] {
        &self.network_cost
    }

    fn ptdf(&self) -> Option<&[f64]> {
        self.ptdf.as_deref()
    }

    fn node_names(&self) -> &[String] {
        &self.node_names
    }

    fn line_names(&self) -> &[String] {
        &self.line_names
    }

    fn serialize(&self, group: &mut Group) {
        let layouts = &self.layouts;
        if self.number_nodes != 1 || layouts.has_dim("NumberNodes") {
            group.set_dim("NumberNodes", self.number_nodes);
        }
        if !self.node_names.is_empty() {
            let dims = layouts.dims_or("NodeName", &["NumberNodes"]);
            group.put_text("NodeName", &dims, self.node_names.clone());
        }
        if self.number_nodes <= 1 {
            return;
        }
        let lines = &["NumberLines"];
        group.set_dim("NumberLines", self.number_lines());
        group.put_uint(
            "StartLine",
            &layouts.dims_or("StartLine", lines),
            self.start_line.clone(),
        );
        group.put_uint("EndLine", &layouts.dims_or("EndLine", lines), self.end_line.clone());
        layouts.put_double(group, "MinPowerFlow", lines, &self.min_power_flow);
        layouts.put_double(group, "MaxPowerFlow", lines, &self.max_power_flow);
        if !self.susceptance.is_empty() {
            layouts.put_double(group, "Susceptance", lines, &self.susceptance);
        }
        if !self.network_cost.is_empty() {
            layouts.put_double(group, "NetworkCost", lines, &self.network_cost);
        }
        if let Some(m) = &self.ptdf {
            layouts.put_double(group, "PTDF", &["NumberLines", "NumberNodes"], m);
        }
        if !self.line_names.is_empty() {
            let dims = layouts.dims_or("LineName", lines);
            group.put_text("LineName", &dims, self.line_names.clone());
        }
    }
}

/// Every known descriptor variant, plus out-of-tree ones
#[derive(Debug)]
pub enum NetworkData {
    Dc(DcNetworkData),
    Extension(Box<dyn NetworkDescriptor>),
}

impl NetworkData {
    pub fn descriptor(&self) -> &dyn NetworkDescriptor {
        match self {
            NetworkData::Dc(d) => d,
            NetworkData::Extension(d) => d.as_ref(),
        }
    }

    pub fn as_dc_mut(&mut self) -> Option<&mut DcNetworkData> {
        match self {
            NetworkData::Dc(d) => Some(d),
            NetworkData::Extension(_) => None,
        }
    }

    pub fn lines_type(&self) -> LineType {
        self.descriptor().lines_type()
    }

    pub fn serialize(&self, group: &mut Group) {
        self.descriptor().serialize(group);
    }
}

impl From<DcNetworkData> for NetworkData {
    fn from(data: DcNetworkData) -> Self {
        NetworkData::Dc(data)
    }
}

pub type DescriptorBuilder = fn(&Group) -> ModelResult<Box<dyn NetworkDescriptor>>;

/// Builds descriptors from their classname: the known variant first,
/// then the registered extensions.
#[derive(Default)]
pub struct NetworkDataFactory {
    extensions: HashMap<String, DescriptorBuilder>,
}

impl NetworkDataFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, classname: &str, builder: DescriptorBuilder) {
        self.extensions.insert(classname.to_string(), builder);
    }

    pub fn build(&self, classname: &str, group: &Group) -> ModelResult<NetworkData> {
        if classname == DcNetworkData::CLASSNAME {
            return Ok(NetworkData::Dc(DcNetworkData::deserialize(group)?));
        }
        match self.extensions.get(classname) {
            Some(builder) => Ok(NetworkData::Extension(builder(group)?)),
            None => Err(ModelError::UnknownClassname(classname.to_string())),
        }
    }
}

/// Who holds a value: the holder alone, or many holders at once
#[derive(Debug)]
pub enum DataHandle<T> {
    Owned(Box<T>),
    Shared(Rc<T>),
}

impl<T> DataHandle<T> {
    pub fn owned(value: T) -> Self {
        DataHandle::Owned(Box::new(value))
    }

    pub fn get(&self) -> &T {
        match self {
            DataHandle::Owned(v) => v,
            DataHandle::Shared(v) => v,
        }
    }

    /// Only an owned value can be changed.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        match self {
            DataHandle::Owned(v) => Some(v),
            DataHandle::Shared(_) => None,
        }
    }

    pub fn is_owned(&self) -> bool {
        matches!(self, DataHandle::Owned(_))
    }
}
