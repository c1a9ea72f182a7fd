// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stanza filter chains.

use std::sync::Arc;

use stanza::Stanza;

use crate::XmlStream;

/// A stanza transform; returning `None` drops the stanza.
pub type FilterFn = Arc<dyn Fn(&XmlStream, Stanza) -> Option<Stanza> + Send + Sync>;

/// Which chain a filter belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDirection {
    /// Incoming stanzas, before handler matching.
    In,
    /// Outgoing stanzas, at the time they are queued for sending.
    Out,
    /// Outgoing stanzas, on the writer side right before serialisation.
    OutSync,
}

#[derive(Default)]
pub(crate) struct FilterChain {
    // Kept sorted by order; equal orders keep registration order.
    entries: Vec<(i32, FilterFn)>,
}

impl FilterChain {
    pub(crate) fn add(&mut self, filter: FilterFn, order: Option<i32>) {
        self.entries.push((order.unwrap_or(i32::MAX), filter));
        self.entries.sort_by_key(|(order, _)| *order);
    }

    pub(crate) fn remove(&mut self, filter: &FilterFn) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(_, f)| !Arc::ptr_eq(f, filter));
        self.entries.len() != before
    }

    /// Snapshot for running the chain without holding the registry lock
    /// while user filters execute.
    pub(crate) fn snapshot(&self) -> Vec<FilterFn> {
        self.entries.iter().map(|(_, f)| f.clone()).collect()
    }
}

#[derive(Default)]
pub(crate) struct Filters {
    pub(crate) incoming: FilterChain,
    pub(crate) outgoing: FilterChain,
    pub(crate) out_sync: FilterChain,
}

impl Filters {
    pub(crate) fn chain_mut(&mut self, direction: FilterDirection) -> &mut FilterChain {
        match direction {
            FilterDirection::In => &mut self.incoming,
            FilterDirection::Out => &mut self.outgoing,
            FilterDirection::OutSync => &mut self.out_sync,
        }
    }
}
