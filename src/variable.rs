use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(0);

/// Process-unique identity of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u64);

impl BlockId {
    pub fn fresh() -> Self {
        BlockId(NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a variable: the block that stores it and its slot there
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarRef {
    pub block: BlockId,
    pub slot: usize,
}

impl fmt::Display for VarRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.block, self.slot)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    Continuous,
    Binary,
}

/// A scalar decision variable
#[derive(Debug, Clone, PartialEq)]
pub struct ColVariable {
    pub var_type: VarType,
    pub lower: f64,
    pub upper: f64,
    pub value: f64,
}

impl ColVariable {
    pub fn continuous() -> Self {
        Self {
            var_type: VarType::Continuous,
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
            value: 0.0,
        }
    }

    pub fn non_negative() -> Self {
        Self {
            lower: 0.0,
            ..Self::continuous()
        }
    }

    pub fn binary() -> Self {
        Self {
            var_type: VarType::Binary,
            lower: 0.0,
            upper: 1.0,
            value: 0.0,
        }
    }

    /// Checks the current value against the bounds (and integrality for
    /// binaries) with an absolute tolerance.
    pub fn is_feasible(&self, tol: f64) -> bool {
        if self.value < self.lower - tol || self.value > self.upper + tol {
            return false;
        }
        match self.var_type {
            VarType::Continuous => true,
            VarType::Binary => {
                (self.value - self.value.round()).abs() <= tol
            }
        }
    }
}

/// A dense `rows x cols` block of consecutive slots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Grid {
    pub first: usize,
    pub rows: usize,
    pub cols: usize,
}

impl Grid {
    pub fn slot(&self, row: usize, col: usize) -> usize {
        debug_assert!(row < self.rows && col < self.cols);
        self.first + row * self.cols + col
    }

    pub fn len(&self) -> usize {
        self.rows * self.cols
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slots(&self) -> std::ops::Range<usize> {
        self.first..self.first + self.len()
    }
}

/// Resolves a variable identity into the variable itself
pub trait VariableLookup {
    fn lookup(&self, var: VarRef) -> Option<&ColVariable>;
}

/// Storage for every variable owned by one block
#[derive(Debug, Clone)]
pub struct VariableStore {
    block: BlockId,
    vars: Vec<ColVariable>,
}

impl VariableStore {
    pub fn new(block: BlockId) -> Self {
        Self { block, vars: vec![] }
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    /// Appends a `rows x cols` family of copies of `proto`.
    pub fn add_grid(
        &mut self,
        rows: usize,
        cols: usize,
        proto: ColVariable,
    ) -> Grid {
        let first = self.vars.len();
        self.vars.resize(first + rows * cols, proto);
        Grid { first, rows, cols }
    }

    pub fn var_ref(&self, slot: usize) -> VarRef {
        VarRef {
            block: self.block,
            slot,
        }
    }

    pub fn at(&self, grid: &Grid, row: usize, col: usize) -> VarRef {
        self.var_ref(grid.slot(row, col))
    }

    pub fn get(&self, slot: usize) -> Option<&ColVariable> {
        self.vars.get(slot)
    }

    pub fn get_mut(&mut self, slot: usize) -> Option<&mut ColVariable> {
        self.vars.get_mut(slot)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VarRef, &ColVariable)> {
        let block = self.block;
        self.vars
            .iter()
            .enumerate()
            .map(move |(slot, v)| (VarRef { block, slot }, v))
    }

    pub fn all_feasible(&self, tol: f64) -> bool {
        self.vars.iter().all(|v| v.is_feasible(tol))
    }
}

impl VariableLookup for VariableStore {
    fn lookup(&self, var: VarRef) -> Option<&ColVariable> {
        if var.block != self.block {
            return None;
        }
        self.vars.get(var.slot)
    }
}
