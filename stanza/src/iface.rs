// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Interface resolution: the `get`/`set`/`del` dispatchers and plugin
//! attachment.

use std::collections::BTreeMap;

use crate::class::{self, PluginEntry};
use crate::element::Stanza;

/// Values assigned to a boolean interface are normalised to presence or
/// absence of the marker element.
fn truthy(value: &str) -> bool {
    !matches!(value, "" | "0" | "false")
}

impl Stanza {
    /// Resolves an interface to its value.
    ///
    /// Resolution order: a custom getter, the text of a declared
    /// sub-element, the presence of a declared boolean sub-element (mapped
    /// to `"true"` or `""`), a plain attribute, delegation to an attached
    /// extension plugin of the same name, and finally the empty string.
    pub fn get(&self, iface: &str) -> String {
        if let Some((_, getter)) = self.class.getters.iter().find(|(n, _)| *n == iface) {
            return getter(self);
        }
        if self.class.sub_interfaces.contains(&iface) {
            return self.sub_text(&self.namespace, iface);
        }
        if self.class.bool_interfaces.contains(&iface) {
            return if self.has_child(&self.namespace, iface) {
                "true".to_owned()
            } else {
                String::new()
            };
        }
        if let Some(value) = self.attr(iface) {
            return value.to_owned();
        }
        if let Some(entry) = class::plugin_by_name(self.class, iface) {
            if entry.class.is_extension {
                if let Some(plugin) = self.child(entry.class.namespace, entry.class.element) {
                    return plugin.get(iface);
                }
            }
        }
        String::new()
    }

    /// Assigns an interface, following the same resolution order as
    /// [`Stanza::get`].
    ///
    /// An empty value deletes the underlying attribute or sub-element. A
    /// plain attribute is only written when the interface is declared on the
    /// class, or when the class declares no interfaces at all (the untyped
    /// case, where every interface is treated as an attribute).
    pub fn set(&mut self, iface: &str, value: &str) {
        if let Some((_, setter)) = self.class.setters.iter().find(|(n, _)| *n == iface) {
            setter(self, value);
            return;
        }
        let ns = self.namespace.clone();
        if self.class.sub_interfaces.contains(&iface) {
            if value.is_empty() {
                self.remove_children(&ns, iface);
            } else {
                self.set_sub_text(&ns, iface, value);
            }
            return;
        }
        if self.class.bool_interfaces.contains(&iface) {
            if truthy(value) {
                self.ensure_child(&ns, iface);
            } else {
                self.remove_children(&ns, iface);
            }
            return;
        }
        if self.class.interfaces.contains(&iface) || self.class.interfaces.is_empty() {
            self.set_attr(iface, value);
            return;
        }
        if let Some(entry) = class::plugin_by_name(self.class, iface) {
            if entry.class.is_extension {
                self.enable_entry(entry).set(iface, value);
            }
        }
    }

    /// Removes whatever an interface resolves to: the attribute, the
    /// sub-element, or the attached plugin.
    pub fn del(&mut self, iface: &str) {
        if let Some((_, deleter)) = self.class.deleters.iter().find(|(n, _)| *n == iface) {
            deleter(self);
            return;
        }
        let ns = self.namespace.clone();
        if self.class.sub_interfaces.contains(&iface) || self.class.bool_interfaces.contains(&iface)
        {
            self.remove_children(&ns, iface);
            return;
        }
        if self.remove_attr(iface).is_some() {
            return;
        }
        if class::plugin_by_name(self.class, iface).is_some() {
            self.disable(iface);
        }
    }

    /// Collects every declared interface with its current value.
    pub fn values(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        let names = self
            .class
            .interfaces
            .iter()
            .chain(self.class.sub_interfaces)
            .chain(self.class.bool_interfaces)
            .chain(self.class.getters.iter().map(|(n, _)| n));
        for name in names {
            out.insert((*name).to_owned(), self.get(name));
        }
        out
    }

    fn enable_entry(&mut self, entry: PluginEntry) -> &mut Stanza {
        let (ns, name) = (entry.class.namespace, entry.class.element);
        if self.child(ns, name).is_none() {
            self.append(Stanza::from_class(entry.class));
        }
        match self.child_mut(ns, name) {
            Some(c) => c,
            None => unreachable!(),
        }
    }

    /// Attaches the named plugin, creating its element lazily, and returns
    /// it mutably.
    ///
    /// Returns `None` when no plugin of that name is registered for this
    /// stanza's class.
    pub fn enable(&mut self, name: &str) -> Option<&mut Stanza> {
        let entry = class::plugin_by_name(self.class, name)?;
        Some(self.enable_entry(entry))
    }

    /// Returns the attached plugin of the given name, if present.
    pub fn plugin(&self, name: &str) -> Option<&Stanza> {
        let entry = class::plugin_by_name(self.class, name)?;
        self.child(entry.class.namespace, entry.class.element)
    }

    /// Returns the attached plugin of the given name, mutably, if present.
    ///
    /// Unlike [`Stanza::enable`] this never creates the element.
    pub fn plugin_mut(&mut self, name: &str) -> Option<&mut Stanza> {
        let entry = class::plugin_by_name(self.class, name)?;
        self.child_mut(entry.class.namespace, entry.class.element)
    }

    /// Returns the attached plugin instance carrying the given language tag.
    ///
    /// Falls back to an instance without an `xml:lang` of its own, which
    /// inherits the stream or stanza default.
    pub fn plugin_with_lang(&self, name: &str, lang: &str) -> Option<&Stanza> {
        let entry = class::plugin_by_name(self.class, name)?;
        let mut fallback = None;
        for child in self.children() {
            if !child.is(entry.class.namespace, entry.class.element) {
                continue;
            }
            match child.lang() {
                Some(l) if l == lang => return Some(child),
                None if fallback.is_none() => fallback = Some(child),
                _ => (),
            }
        }
        fallback
    }

    /// Detaches the named plugin, removing its element(s).
    pub fn disable(&mut self, name: &str) {
        if let Some(entry) = class::plugin_by_name(self.class, name) {
            self.remove_children(entry.class.namespace, entry.class.element);
        }
    }

    /// Returns the children belonging to iterable plugin classes, in
    /// document order.
    pub fn substanzas(&self) -> Vec<&Stanza> {
        let tags = class::iterable_tags(self.class);
        self.children()
            .filter(|c| tags.iter().any(|(ns, name)| c.is(ns, name)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::{register_plugin, register_stanza_class, StanzaClass};

    static MESSAGE: StanzaClass = StanzaClass {
        interfaces: &["to", "from", "id", "type"],
        sub_interfaces: &["body", "subject"],
        bool_interfaces: &["attention"],
        ..StanzaClass::new("message", "urn:test:iface", "message")
    };

    static PREVIEW: StanzaClass = StanzaClass {
        is_extension: true,
        getters: &[("preview", |s: &Stanza| s.text())],
        setters: &[("preview", |s: &mut Stanza, v: &str| s.set_text(v))],
        ..StanzaClass::new("preview", "urn:test:iface:preview", "preview")
    };

    static ITEM: StanzaClass = StanzaClass {
        interfaces: &["name"],
        ..StanzaClass::new("item", "urn:test:iface", "item")
    };

    fn setup() -> Stanza {
        register_stanza_class(&MESSAGE);
        register_plugin(&MESSAGE, &PREVIEW, false);
        register_plugin(&MESSAGE, &ITEM, true);
        Stanza::from_class(&MESSAGE)
    }

    #[test]
    fn attribute_interface_roundtrip() {
        let mut st = setup();
        st.set("to", "peer@example.com");
        assert_eq!(st.get("to"), "peer@example.com");
        st.set("to", "");
        assert_eq!(st.get("to"), "");
        assert_eq!(st.attr("to"), None);
    }

    #[test]
    fn sub_interface_roundtrip() {
        let mut st = setup();
        st.set("body", "hello");
        assert_eq!(st.get("body"), "hello");
        assert_eq!(st.sub_text("urn:test:iface", "body"), "hello");
        st.set("body", "");
        assert!(!st.has_child("urn:test:iface", "body"));
    }

    #[test]
    fn bool_interface_normalises_to_presence() {
        let mut st = setup();
        assert_eq!(st.get("attention"), "");
        st.set("attention", "yes please");
        assert_eq!(st.get("attention"), "true");
        assert!(st.has_child("urn:test:iface", "attention"));
        assert_eq!(st.child("urn:test:iface", "attention").unwrap().text(), "");
        st.set("attention", "false");
        assert_eq!(st.get("attention"), "");
    }

    #[test]
    fn del_removes_attribute_and_subelement() {
        let mut st = setup();
        st.set("id", "42");
        st.set("subject", "hi");
        st.del("id");
        st.del("subject");
        assert_eq!(st.get("id"), "");
        assert_eq!(st.get("subject"), "");
    }

    #[test]
    fn extension_plugin_flattens_one_level() {
        let mut st = setup();
        st.set("preview", "a teaser");
        assert_eq!(st.get("preview"), "a teaser");
        let plugin = st.plugin("preview").expect("plugin attached");
        assert_eq!(plugin.text(), "a teaser");
        st.del("preview");
        assert!(st.plugin("preview").is_none());
    }

    #[test]
    fn enable_is_lazy_and_idempotent() {
        let mut st = setup();
        assert!(st.plugin("preview").is_none());
        st.enable("preview").expect("registered");
        st.enable("preview").expect("registered");
        assert_eq!(st.children().count(), 1);
    }

    #[test]
    fn iterable_plugins_collect_as_substanzas() {
        let mut st = setup();
        st.enable("preview");
        for name in ["a", "b"] {
            let mut item = Stanza::from_class(&ITEM);
            item.set("name", name);
            st.append(item);
        }
        let subs = st.substanzas();
        assert_eq!(subs.len(), 2);
        assert_eq!(subs[0].get("name"), "a");
        assert_eq!(subs[1].get("name"), "b");
    }

    #[test]
    fn plugin_with_lang_prefers_exact_match() {
        let mut st = setup();
        let mut a = Stanza::from_class(&PREVIEW);
        a.set_text("default");
        st.append(a);
        let mut b = Stanza::from_class(&PREVIEW);
        b.set_lang("de");
        b.set_text("vorschau");
        st.append(b);
        assert_eq!(st.plugin_with_lang("preview", "de").unwrap().text(), "vorschau");
        assert_eq!(st.plugin_with_lang("preview", "fr").unwrap().text(), "default");
    }

    #[test]
    fn typed_equality_is_interface_based() {
        let mut a = setup();
        a.set("id", "1");
        a.set("body", "hi");
        let mut b = setup();
        b.set("body", "hi");
        b.set("id", "1");
        // Different child ordering below does not matter for typed stanzas.
        b.enable("preview");
        b.del("preview");
        assert_eq!(a, b);
        b.set("body", "bye");
        assert_ne!(a, b);
    }
}
