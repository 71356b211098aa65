//! Versioned state channels.
//!
//! A channel pairs a piece of state (a `Vec<T>` or a map) with a version
//! counter that the scheduler/barrier bump only when the channel's content
//! actually changes. Nodes never see or touch the version directly; they
//! return a [`crate::node::NodePartial`] and the registered
//! [`crate::reducers::Reducer`] decides whether and how to merge it, after
//! which [`crate::app::App::apply_barrier`] bumps the version.

pub mod errors;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channels::errors::ErrorEvent;
use crate::drops::Drop;
use crate::message::Message;
use crate::pipeline::result::GeneratedFile;

/// Common shape shared by every versioned channel.
///
/// `Item` is the channel's payload type (a `Vec<T>` for append-style
/// channels, a map for the free-form `extra` channel).
pub trait Channel {
    type Item;

    fn new(items: Self::Item, version: u32) -> Self;
    fn get_mut(&mut self) -> &mut Self::Item;
    fn snapshot(&self) -> Self::Item;
    fn version(&self) -> u32;
    fn set_version(&mut self, version: u32);
}

macro_rules! vec_channel {
    ($name:ident, $item:ty) => {
        #[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
        pub struct $name {
            version: u32,
            items: Vec<$item>,
        }

        impl $name {
            #[must_use]
            pub fn len(&self) -> usize {
                self.items.len()
            }

            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.items.is_empty()
            }

            #[must_use]
            pub fn as_slice(&self) -> &[$item] {
                &self.items
            }
        }

        impl Channel for $name {
            type Item = Vec<$item>;

            fn new(items: Self::Item, version: u32) -> Self {
                Self { version, items }
            }

            fn get_mut(&mut self) -> &mut Self::Item {
                &mut self.items
            }

            fn snapshot(&self) -> Self::Item {
                self.items.clone()
            }

            fn version(&self) -> u32 {
                self.version
            }

            fn set_version(&mut self, version: u32) {
                self.version = version;
            }
        }
    };
}

vec_channel!(MessagesChannel, Message);
vec_channel!(ErrorsChannel, ErrorEvent);
vec_channel!(DropsChannel, Drop);
vec_channel!(FilesChannel, GeneratedFile);

/// Free-form key/value channel used for intermediate stage results
/// (parsed requirements, scores, deployment coordinates, ...).
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ExtrasChannel {
    version: u32,
    map: FxHashMap<String, Value>,
}

impl ExtrasChannel {
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Channel for ExtrasChannel {
    type Item = FxHashMap<String, Value>;

    fn new(items: Self::Item, version: u32) -> Self {
        Self {
            version,
            map: items,
        }
    }

    fn get_mut(&mut self) -> &mut Self::Item {
        &mut self.map
    }

    fn snapshot(&self) -> Self::Item {
        self.map.clone()
    }

    fn version(&self) -> u32 {
        self.version
    }

    fn set_version(&mut self, version: u32) {
        self.version = version;
    }
}
