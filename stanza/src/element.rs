// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The owned element tree.

use std::collections::BTreeMap;

use crate::class::{self, StanzaClass, GENERIC};

/// A child node of a [`Stanza`]: either a nested element or character data.
#[derive(Debug, Clone)]
pub enum Node {
    /// A nested element.
    Element(Stanza),
    /// A run of character data.
    Text(String),
}

impl Node {
    /// Returns the contained element, if this node is one.
    pub fn as_element(&self) -> Option<&Stanza> {
        match self {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        }
    }

    fn as_element_mut(&mut self) -> Option<&mut Stanza> {
        match self {
            Node::Element(e) => Some(e),
            Node::Text(_) => None,
        }
    }
}

/// An XML element with an attached stanza class.
///
/// The XML representation is fully determined by the namespace, name,
/// attributes and children; the class only steers how interface accessors
/// resolve and never contributes bytes of its own to the serialisation.
///
/// Attribute keys are stored flattened: attributes without a namespace keep
/// their plain name, `xml:lang` and friends keep their well-known prefix, and
/// attributes in any other namespace use the `{uri}local` form.
#[derive(Debug, Clone)]
pub struct Stanza {
    pub(crate) namespace: String,
    pub(crate) name: String,
    pub(crate) attrs: BTreeMap<String, String>,
    pub(crate) nodes: Vec<Node>,
    pub(crate) class: &'static StanzaClass,
}

impl Stanza {
    /// Creates an empty element.
    ///
    /// The class is resolved against the registry, so constructing an element
    /// whose tag matches a registered root stanza class yields a fully typed
    /// stanza.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Stanza {
        let namespace = namespace.into();
        let name = name.into();
        let class = class::lookup_root(&namespace, &name);
        Stanza {
            namespace,
            name,
            attrs: BTreeMap::new(),
            nodes: Vec::new(),
            class,
        }
    }

    /// Creates an empty element from a class descriptor, using the tag the
    /// class declares.
    pub fn from_class(class: &'static StanzaClass) -> Stanza {
        Stanza {
            namespace: class.namespace.to_owned(),
            name: class.element.to_owned(),
            attrs: BTreeMap::new(),
            nodes: Vec::new(),
            class,
        }
    }

    /// Returns the namespace URI, or the empty string if the element has
    /// none.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Returns the local name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the tag in `{uri}local` notation.
    pub fn tag(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{{{}}}{}", self.namespace, self.name)
        }
    }

    /// Checks whether this element has the given namespace and local name.
    pub fn is(&self, namespace: &str, name: &str) -> bool {
        self.namespace == namespace && self.name == name
    }

    /// Returns the class descriptor attached to this element.
    pub fn class(&self) -> &'static StanzaClass {
        self.class
    }

    pub(crate) fn set_class(&mut self, class: &'static StanzaClass) {
        self.class = class;
    }

    /// Returns whether the attached class declares any interfaces at all.
    ///
    /// Untyped elements get structural equality instead of interface-based
    /// equality.
    pub(crate) fn is_untyped(&self) -> bool {
        self.class.interfaces.is_empty()
            && self.class.sub_interfaces.is_empty()
            && self.class.bool_interfaces.is_empty()
            && self.class.getters.is_empty()
    }

    /// Returns the value of an attribute.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// Sets an attribute. An empty value removes the attribute instead,
    /// matching how interface assignment treats empty values.
    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if value.is_empty() {
            self.attrs.remove(&name);
        } else {
            self.attrs.insert(name, value);
        }
    }

    /// Removes an attribute, returning its previous value.
    pub fn remove_attr(&mut self, name: &str) -> Option<String> {
        self.attrs.remove(name)
    }

    /// Iterates over all attributes in key order.
    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the `xml:lang` attribute of this element, if set.
    pub fn lang(&self) -> Option<&str> {
        self.attr("xml:lang")
    }

    /// Sets the `xml:lang` attribute.
    pub fn set_lang(&mut self, lang: impl Into<String>) {
        self.set_attr("xml:lang", lang);
    }

    /// Returns the concatenated character data directly below this element.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            if let Node::Text(t) = node {
                out.push_str(t);
            }
        }
        out
    }

    /// Replaces the character data directly below this element, leaving
    /// child elements in place. An empty string only removes the existing
    /// text nodes.
    pub fn set_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        self.nodes.retain(|n| matches!(n, Node::Element(_)));
        if !text.is_empty() {
            self.nodes.push(Node::Text(text));
        }
    }

    /// Returns all child nodes in document order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Iterates over the child elements in document order.
    pub fn children(&self) -> impl Iterator<Item = &Stanza> {
        self.nodes.iter().filter_map(Node::as_element)
    }

    /// Iterates mutably over the child elements in document order.
    pub fn children_mut(&mut self) -> impl Iterator<Item = &mut Stanza> {
        self.nodes.iter_mut().filter_map(Node::as_element_mut)
    }

    /// Appends a child element, returning a mutable reference to it.
    pub fn append(&mut self, child: Stanza) -> &mut Stanza {
        self.nodes.push(Node::Element(child));
        match self.nodes.last_mut() {
            Some(Node::Element(e)) => e,
            _ => unreachable!(),
        }
    }

    /// Appends character data.
    ///
    /// Adjacent runs merge into one text node, so parsers that split a run
    /// at entity references or buffer boundaries still produce the same
    /// tree as the equivalent unsplit input.
    pub fn append_text(&mut self, text: impl Into<String>) {
        let text = text.into();
        match self.nodes.last_mut() {
            Some(Node::Text(existing)) => existing.push_str(&text),
            _ => self.nodes.push(Node::Text(text)),
        }
    }

    /// Returns the first child element with the given namespace and name.
    pub fn child(&self, namespace: &str, name: &str) -> Option<&Stanza> {
        self.children().find(|c| c.is(namespace, name))
    }

    /// Returns the first child element with the given namespace and name,
    /// mutably.
    pub fn child_mut(&mut self, namespace: &str, name: &str) -> Option<&mut Stanza> {
        self.children_mut().find(|c| c.is(namespace, name))
    }

    /// Checks for the presence of a matching child element.
    pub fn has_child(&self, namespace: &str, name: &str) -> bool {
        self.child(namespace, name).is_some()
    }

    /// Removes the first matching child element and returns it.
    pub fn remove_child(&mut self, namespace: &str, name: &str) -> Option<Stanza> {
        let pos = self.nodes.iter().position(|n| match n {
            Node::Element(e) => e.is(namespace, name),
            Node::Text(_) => false,
        })?;
        match self.nodes.remove(pos) {
            Node::Element(e) => Some(e),
            _ => unreachable!(),
        }
    }

    /// Removes every matching child element.
    pub fn remove_children(&mut self, namespace: &str, name: &str) {
        self.nodes.retain(|n| match n {
            Node::Element(e) => !e.is(namespace, name),
            Node::Text(_) => true,
        });
    }

    /// Returns the first matching child, creating an empty one if absent.
    pub fn ensure_child(&mut self, namespace: &str, name: &str) -> &mut Stanza {
        // Two lookups keep the borrow checker happy.
        if self.child(namespace, name).is_none() {
            self.append(Stanza::new(namespace, name));
        }
        match self.child_mut(namespace, name) {
            Some(c) => c,
            None => unreachable!(),
        }
    }

    /// Returns the text of a matching child element, or the empty string.
    pub fn sub_text(&self, namespace: &str, name: &str) -> String {
        self.child(namespace, name)
            .map(|c| c.text())
            .unwrap_or_default()
    }

    /// Sets the text of a matching child element, creating it if necessary.
    pub fn set_sub_text(&mut self, namespace: &str, name: &str, text: impl Into<String>) {
        self.ensure_child(namespace, name).set_text(text);
    }
}

/// Equality per the stanza model: same tag, and for typed stanzas every
/// non-empty interface value of each side resolves identically on the other.
/// Untyped elements compare structurally instead, because they declare no
/// interfaces to compare through.
impl PartialEq for Stanza {
    fn eq(&self, other: &Stanza) -> bool {
        if self.namespace != other.namespace || self.name != other.name {
            return false;
        }
        if self.is_untyped() && other.is_untyped() {
            return structural_eq(self, other);
        }
        superset(self, other) && superset(other, self)
    }
}

impl Eq for Stanza {}

fn superset(a: &Stanza, b: &Stanza) -> bool {
    a.values()
        .into_iter()
        .filter(|(_, v)| !v.is_empty())
        .all(|(k, v)| b.get(&k) == v)
}

fn structural_eq(a: &Stanza, b: &Stanza) -> bool {
    if a.namespace != b.namespace || a.name != b.name || a.attrs != b.attrs {
        return false;
    }
    if a.nodes.len() != b.nodes.len() {
        return false;
    }
    a.nodes.iter().zip(b.nodes.iter()).all(|(x, y)| match (x, y) {
        (Node::Element(x), Node::Element(y)) => structural_eq(x, y),
        (Node::Text(x), Node::Text(y)) => x == y,
        _ => false,
    })
}

impl Default for Stanza {
    fn default() -> Stanza {
        Stanza {
            namespace: String::new(),
            name: String::new(),
            attrs: BTreeMap::new(),
            nodes: Vec::new(),
            class: &GENERIC,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_skips_nested_elements() {
        let mut st = Stanza::new("urn:test", "body");
        st.append_text("hello ");
        st.append(Stanza::new("urn:test", "br"));
        st.append_text("world");
        assert_eq!(st.text(), "hello world");
        assert_eq!(st.children().count(), 1);
    }

    #[test]
    fn adjacent_text_runs_coalesce() {
        let mut st = Stanza::new("urn:test", "body");
        st.append_text("one ");
        st.append_text("two");
        assert_eq!(st.nodes().len(), 1);
        assert_eq!(st.text(), "one two");
    }

    #[test]
    fn set_text_preserves_children() {
        let mut st = Stanza::new("urn:test", "body");
        st.append_text("old");
        st.append(Stanza::new("urn:test", "x"));
        st.set_text("new");
        assert_eq!(st.text(), "new");
        assert!(st.has_child("urn:test", "x"));
    }

    #[test]
    fn ensure_child_is_idempotent() {
        let mut st = Stanza::new("urn:test", "iq");
        st.ensure_child("urn:test", "query").set_attr("node", "a");
        st.ensure_child("urn:test", "query");
        assert_eq!(st.children().count(), 1);
        assert_eq!(st.child("urn:test", "query").unwrap().attr("node"), Some("a"));
    }

    #[test]
    fn structural_equality_on_untyped_elements() {
        let mut a = Stanza::new("urn:test", "iq");
        a.set_attr("id", "1");
        a.ensure_child("urn:test", "query").set_text("x");
        let mut b = Stanza::new("urn:test", "iq");
        b.set_attr("id", "1");
        b.ensure_child("urn:test", "query").set_text("x");
        assert_eq!(a, b);
        b.set_attr("id", "2");
        assert_ne!(a, b);
    }

    #[test]
    fn empty_attr_value_removes() {
        let mut st = Stanza::new("urn:test", "iq");
        st.set_attr("id", "1");
        st.set_attr("id", "");
        assert_eq!(st.attr("id"), None);
    }
}
