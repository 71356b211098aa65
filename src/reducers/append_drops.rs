use super::Reducer;
use crate::{channels::Channel, node::NodePartial, state::VersionedState};

/// Appends drop artifacts produced by a stage to the run's drop log.
///
/// Drops are immutable once written, so this reducer only ever extends the
/// channel; it never rewrites or removes an earlier entry.
#[derive(Debug, PartialEq, Clone, Hash, Eq)]
pub struct AppendDrops;

impl Reducer for AppendDrops {
    fn apply(&self, state: &mut VersionedState, update: &NodePartial) {
        if let Some(drops) = &update.drops
            && !drops.is_empty()
        {
            state.drops.get_mut().extend(drops.iter().cloned());
        }
    }
}
