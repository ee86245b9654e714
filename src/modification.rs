use std::cell::RefCell;
use std::collections::HashMap;
use std::ops::Range;
use std::rc::Rc;
use std::sync::mpsc::{channel, Receiver, Sender};

use crate::error::ModelResult;
use crate::log;
use crate::utils::{validate_range, validate_subset, validate_values};
use crate::variable::BlockId;

/// Name of a notification channel. Channel 0 is the default one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ChannelName(pub u32);

/// How a setter treats one of the two representations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModParam {
    DryRun,
    ApplyNoNotify,
    Apply(ChannelName),
}

impl Default for ModParam {
    fn default() -> Self {
        ModParam::Apply(ChannelName::default())
    }
}

impl ModParam {
    pub fn writes(&self) -> bool {
        !matches!(self, ModParam::DryRun)
    }

    pub fn channel(&self) -> Option<ChannelName> {
        match self {
            ModParam::Apply(ch) => Some(*ch),
            _ => None,
        }
    }
}

/// The physical quantity a modification record talks about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModKind {
    ActiveDemand,
    Kappa,
    Scale,
    ActivePowerDemand,
    NodeInjectionBounds,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Addressing {
    Range(Range<usize>),
    Subset(Vec<usize>),
}

impl Addressing {
    pub fn len(&self) -> usize {
        match self {
            Addressing::Range(r) => r.len(),
            Addressing::Subset(s) => s.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Address-only change record. Carries no values: receivers read the
/// current data back from the block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    pub block: BlockId,
    pub kind: ModKind,
    pub addressing: Addressing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Unchanged,
    DryRun,
    Applied,
}

/// Shared table of observers, one per channel.
///
/// Clones share the same table, so a composite hands a clone to each of
/// its children and they all publish to the same observers.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    observers: Rc<RefCell<HashMap<ChannelName, Sender<Modification>>>>,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer on `channel`, replacing any previous one.
    pub fn subscribe(&self, channel_name: ChannelName) -> Receiver<Modification> {
        let (tx, rx) = channel();
        self.observers.borrow_mut().insert(channel_name, tx);
        rx
    }

    pub fn unsubscribe(&self, channel_name: ChannelName) {
        self.observers.borrow_mut().remove(&channel_name);
    }

    pub fn issue(&self, modification: Modification, channel_name: ChannelName) {
        let mut observers = self.observers.borrow_mut();
        let result = match observers.get(&channel_name) {
            Some(tx) => tx.send(modification).map_err(|err| (err.0, true)),
            None => Err((modification, false)),
        };
        if let Err((dropped, closed)) = result {
            if closed {
                observers.remove(&channel_name);
            }
            log::dropped_modification(&dropped, channel_name.0);
        }
    }

    pub fn issue_if(&self, mode: ModParam, make: impl FnOnce() -> Modification) {
        if let Some(ch) = mode.channel() {
            self.issue(make(), ch);
        }
    }
}

/// Validated addressing of one setter call: the indices in caller order
/// (paired with the values) and the record addressing.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Selection {
    pub indices: Vec<usize>,
    pub addressing: Addressing,
}

impl Selection {
    pub fn subset(
        subset: &[usize],
        sorted: bool,
        extent: usize,
        values: &[f64],
        what: &'static str,
    ) -> ModelResult<Option<Selection>> {
        if subset.is_empty() {
            return Ok(None);
        }
        validate_subset(subset, extent, what)?;
        validate_values(values, subset.len(), what)?;
        let mut record = subset.to_vec();
        if !sorted {
            record.sort_unstable();
        }
        Ok(Some(Selection {
            indices: subset.to_vec(),
            addressing: Addressing::Subset(record),
        }))
    }

    pub fn range(
        range: Range<usize>,
        extent: usize,
        values: &[f64],
        what: &'static str,
    ) -> ModelResult<Option<Selection>> {
        if range.is_empty() {
            return Ok(None);
        }
        validate_range(&range, extent, what)?;
        validate_values(values, range.len(), what)?;
        Ok(Some(Selection {
            indices: range.clone().collect(),
            addressing: Addressing::Range(range),
        }))
    }

    /// Whether writing `values` into `stored` would change anything. An
    /// empty `stored` stands for `default` everywhere.
    pub fn differs(&self, stored: &[f64], default: f64, values: &[f64]) -> bool {
        self.indices.iter().zip(values).any(|(i, v)| {
            let old = if stored.is_empty() { default } else { stored[*i] };
            old != *v
        })
    }

    /// Writes `values`, materialising an empty `stored` first.
    pub fn write(
        &self,
        stored: &mut Vec<f64>,
        extent: usize,
        default: f64,
        values: &[f64],
    ) {
        if stored.is_empty() {
            stored.resize(extent, default);
        }
        for (i, v) in self.indices.iter().zip(values) {
            stored[*i] = *v;
        }
    }

    pub fn record(&self, block: BlockId, kind: ModKind) -> Modification {
        Modification {
            block,
            kind,
            addressing: self.addressing.clone(),
        }
    }
}
