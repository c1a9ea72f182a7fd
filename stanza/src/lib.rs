// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
//! A small stanza tree for streaming XML protocols.
//!
//! The central type is [`Stanza`]: an owned XML element with a namespace, a
//! local name, attributes and ordered child nodes. What makes it more than a
//! DOM node is the [`StanzaClass`] attached to every element: a static
//! descriptor declaring the *interfaces* of the stanza type, i.e. the logical
//! fields an application reads and writes without caring whether they live in
//! an attribute, a sub-element's text or the mere presence of a marker child.
//!
//! Classes are registered once, process-wide, through
//! [`register_stanza_class`] and [`register_plugin`]; freshly parsed elements
//! are matched against the registry so that a `<message/>` parsed off the
//! wire carries the same accessors as one built programmatically. Elements
//! with no registered class fall back to [`GENERIC`], which exposes plain
//! attribute access and structural equality.
//!
//! Parsing is incremental: [`TreeBuilder`] consumes [`rxml::Event`]s one at a
//! time and yields a completed [`Stanza`] whenever the element that opened at
//! depth zero closes, which is exactly the shape needed for a stream whose
//! root element never closes.

pub mod builder;
pub mod class;
mod element;
mod iface;
mod path;
mod writer;

pub use builder::TreeBuilder;
pub use class::{
    classify, lookup_root, register_plugin, register_stanza_class, StanzaClass, GENERIC,
};
pub use element::{Node, Stanza};
pub use writer::escape;
