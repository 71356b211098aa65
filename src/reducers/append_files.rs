use super::Reducer;
use crate::{channels::Channel, node::NodePartial, state::VersionedState};

/// Merges generated files produced by a stage into the run's file set.
///
/// Files are keyed by path: a later write to the same path replaces the
/// earlier one instead of producing a duplicate entry.
#[derive(Debug, PartialEq, Clone, Hash, Eq)]
pub struct AppendFiles;

impl Reducer for AppendFiles {
    fn apply(&self, state: &mut VersionedState, update: &NodePartial) {
        if let Some(files) = &update.files
            && !files.is_empty()
        {
            let existing = state.files.get_mut();
            for file in files {
                if let Some(slot) = existing.iter_mut().find(|f| f.path == file.path) {
                    *slot = file.clone();
                } else {
                    existing.push(file.clone());
                }
            }
        }
    }
}
