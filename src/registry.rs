// SPDX-License-Identifier: Apache-2.0

//! Process-local registry of attached queue handles.
//!
//! Attaching maps the whole segment, so threads that share a process
//! should share one handle per queue rather than stacking mappings.
//! The registry hands out `Arc<SharedQueue>` keyed by name and mode and
//! holds only weak references, so dropping every clone detaches as
//! usual.

use std::sync::{Arc, Weak};

use dashmap::DashMap;

use crate::error::ShqResult;
use crate::queue::SharedQueue;
use crate::types::Mode;

#[derive(Default)]
pub struct QueueRegistry {
    handles: DashMap<(String, Mode), Weak<SharedQueue>>,
}

impl QueueRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to an existing queue, reusing a live handle when one is
    /// already held by this process under the same name and mode.
    pub fn attach(&self, name: &str, mode: Mode) -> ShqResult<Arc<SharedQueue>> {
        self.get_or_insert(name, mode, || SharedQueue::open(name, mode))
    }

    /// Attach, creating the queue first if it does not exist yet.
    pub fn attach_or_create(
        &self,
        name: &str,
        max_depth: u64,
        mode: Mode,
    ) -> ShqResult<Arc<SharedQueue>> {
        self.get_or_insert(name, mode, || {
            SharedQueue::open_or_create(name, max_depth, mode)
        })
    }

    fn get_or_insert(
        &self,
        name: &str,
        mode: Mode,
        open: impl FnOnce() -> ShqResult<SharedQueue>,
    ) -> ShqResult<Arc<SharedQueue>> {
        let key = (name.to_string(), mode);
        if let Some(entry) = self.handles.get(&key) {
            if let Some(live) = entry.upgrade() {
                tracing::trace!(name, %mode, "reusing registered handle");
                return Ok(live);
            }
        }

        let handle = Arc::new(open()?);
        self.handles.insert(key, Arc::downgrade(&handle));
        Ok(handle)
    }

    /// Drop registry entries whose handles are gone.
    pub fn purge(&self) {
        self.handles.retain(|_, weak| weak.strong_count() > 0);
    }

    /// Number of live handles currently registered.
    pub fn active(&self) -> usize {
        self.handles
            .iter()
            .filter(|entry| entry.strong_count() > 0)
            .count()
    }
}
