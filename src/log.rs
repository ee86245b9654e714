use tracing::{debug, info, warn};

use crate::modification::Modification;
use crate::variable::BlockId;

/// Helper for reporting the size of a freshly generated
/// abstract representation
pub fn generation_summary(
    kind: &'static str,
    block: BlockId,
    step: &'static str,
    count: usize,
) {
    info!(block = %block, kind, step, count, "abstract representation generated");
}

/// Helper for reporting an in-place patch of already generated rows
pub fn patch_summary(
    block: BlockId,
    family: &'static str,
    rows: usize,
    notify: bool,
) {
    debug!(block = %block, family, rows, notify, "patched constraint family");
}

pub fn physical_update(block: BlockId, quantity: &'static str, entries: usize) {
    debug!(block = %block, quantity, entries, "physical data updated");
}

pub fn unchanged_update(block: BlockId, quantity: &'static str) {
    debug!(block = %block, quantity, "update left data unchanged");
}

/// Helper for reporting a record that no observer received
pub fn dropped_modification(modification: &Modification, channel: u32) {
    warn!(
        block = %modification.block,
        channel,
        kind = ?modification.kind,
        "modification dropped: no live observer"
    );
}
