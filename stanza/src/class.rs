// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stanza class descriptors and the process-wide class registry.
//!
//! Class registration is global on purpose: which stanza types exist is a
//! property of the running program, not of any individual stream. Everything
//! with per-stream lifetime (handlers, filters, queues) lives elsewhere.

use std::sync::{OnceLock, RwLock};

use crate::element::Stanza;

/// A custom interface getter.
pub type Getter = fn(&Stanza) -> String;
/// A custom interface setter.
pub type Setter = fn(&mut Stanza, &str);
/// A custom interface deleter.
pub type Deleter = fn(&mut Stanza);

/// Static descriptor of a stanza type.
///
/// Instances are expected to be `static` items registered once at startup.
/// The descriptor declares the element tag this class matches and the
/// interfaces it exposes; the resolution order between the different
/// interface kinds is documented on [`Stanza::get`].
pub struct StanzaClass {
    /// Short name of the class, also used as the plugin attribute name when
    /// this class is registered as a plugin of another.
    pub name: &'static str,
    /// Namespace URI of the element this class describes.
    pub namespace: &'static str,
    /// Local name of the element this class describes.
    pub element: &'static str,
    /// Interfaces stored as plain attributes on the element.
    pub interfaces: &'static [&'static str],
    /// Interfaces stored as the text of an equally named sub-element.
    pub sub_interfaces: &'static [&'static str],
    /// Interfaces represented by the mere presence of an equally named,
    /// empty sub-element.
    pub bool_interfaces: &'static [&'static str],
    /// When registered as a plugin: expose this plugin's single interface
    /// directly through the parent under [`Self::name`], instead of as a
    /// nested object.
    pub is_extension: bool,
    /// Custom getters, consulted before any other resolution step.
    pub getters: &'static [(&'static str, Getter)],
    /// Custom setters.
    pub setters: &'static [(&'static str, Setter)],
    /// Custom deleters.
    pub deleters: &'static [(&'static str, Deleter)],
}

impl StanzaClass {
    /// Creates a descriptor with the given tag and no declared interfaces.
    pub const fn new(
        name: &'static str,
        namespace: &'static str,
        element: &'static str,
    ) -> StanzaClass {
        StanzaClass {
            name,
            namespace,
            element,
            interfaces: &[],
            sub_interfaces: &[],
            bool_interfaces: &[],
            is_extension: false,
            getters: &[],
            setters: &[],
            deleters: &[],
        }
    }
}

impl core::fmt::Debug for StanzaClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StanzaClass")
            .field("name", &self.name)
            .field("namespace", &self.namespace)
            .field("element", &self.element)
            .finish()
    }
}

/// The fallback class for elements with no registered type.
///
/// It declares no interfaces, which makes `get`/`set` fall through to plain
/// attribute access and makes equality structural.
pub static GENERIC: StanzaClass = StanzaClass::new("generic", "", "");

#[derive(Clone, Copy)]
pub(crate) struct PluginEntry {
    pub(crate) parent: &'static str,
    pub(crate) class: &'static StanzaClass,
    pub(crate) iterable: bool,
}

#[derive(Default)]
struct Registry {
    roots: Vec<&'static StanzaClass>,
    plugins: Vec<PluginEntry>,
}

fn registry() -> &'static RwLock<Registry> {
    static REGISTRY: OnceLock<RwLock<Registry>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(Registry::default()))
}

/// Registers a root stanza class.
///
/// Re-registering a class for an already claimed tag replaces the previous
/// registration.
pub fn register_stanza_class(class: &'static StanzaClass) {
    let mut reg = registry().write().unwrap();
    reg.roots
        .retain(|c| !(c.namespace == class.namespace && c.element == class.element));
    reg.roots.push(class);
}

/// Registers `class` as a plugin of `parent`.
///
/// Iterable plugins additionally show up in [`Stanza::substanzas`].
/// Re-registering under the same parent and tag replaces the previous
/// registration.
pub fn register_plugin(parent: &'static StanzaClass, class: &'static StanzaClass, iterable: bool) {
    let mut reg = registry().write().unwrap();
    reg.plugins.retain(|p| {
        !(p.parent == parent.name
            && p.class.namespace == class.namespace
            && p.class.element == class.element)
    });
    reg.plugins.push(PluginEntry {
        parent: parent.name,
        class,
        iterable,
    });
}

/// Resolves the most specific registered root class for a tag, falling back
/// to [`GENERIC`].
pub fn lookup_root(namespace: &str, element: &str) -> &'static StanzaClass {
    let reg = registry().read().unwrap();
    for class in reg.roots.iter().rev() {
        if class.namespace == namespace && class.element == element {
            return class;
        }
    }
    &GENERIC
}

pub(crate) fn plugin_by_name(parent: &StanzaClass, name: &str) -> Option<PluginEntry> {
    let reg = registry().read().unwrap();
    reg.plugins
        .iter()
        .find(|p| p.parent == parent.name && p.class.name == name)
        .copied()
}

pub(crate) fn plugin_by_tag(
    parent: &StanzaClass,
    namespace: &str,
    element: &str,
) -> Option<PluginEntry> {
    let reg = registry().read().unwrap();
    reg.plugins
        .iter()
        .find(|p| {
            p.parent == parent.name
                && p.class.namespace == namespace
                && p.class.element == element
        })
        .copied()
}

pub(crate) fn iterable_tags(parent: &StanzaClass) -> Vec<(&'static str, &'static str)> {
    let reg = registry().read().unwrap();
    reg.plugins
        .iter()
        .filter(|p| p.parent == parent.name && p.iterable)
        .map(|p| (p.class.namespace, p.class.element))
        .collect()
}

/// Assigns classes throughout a freshly parsed element tree.
///
/// The root is resolved against the registered root classes; descendants are
/// resolved against their parent's registered plugins and fall back to
/// [`GENERIC`].
pub fn classify(stanza: &mut Stanza) {
    let class = lookup_root(stanza.namespace(), stanza.name());
    assign(stanza, class);
}

fn assign(stanza: &mut Stanza, class: &'static StanzaClass) {
    stanza.set_class(class);
    // Plugin lookups per child clone small registry entries; fine for the
    // registration-time sized tables involved.
    let resolved: Vec<&'static StanzaClass> = stanza
        .children()
        .map(|c| {
            plugin_by_tag(class, c.namespace(), c.name())
                .map(|p| p.class)
                .unwrap_or(&GENERIC)
        })
        .collect();
    for (child, child_class) in stanza.children_mut().zip(resolved) {
        assign(child, child_class);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static PING: StanzaClass = StanzaClass::new("ping", "urn:test:ping", "ping");
    static PONG: StanzaClass = StanzaClass::new("pong", "urn:test:ping", "pong");

    #[test]
    fn lookup_falls_back_to_generic() {
        assert_eq!(lookup_root("urn:nowhere", "nothing").name, GENERIC.name);
    }

    #[test]
    fn reregistration_replaces() {
        static OLD: StanzaClass = StanzaClass::new("old", "urn:test:rereg", "x");
        static NEW: StanzaClass = StanzaClass::new("new", "urn:test:rereg", "x");
        register_stanza_class(&OLD);
        assert_eq!(lookup_root("urn:test:rereg", "x").name, "old");
        register_stanza_class(&NEW);
        assert_eq!(lookup_root("urn:test:rereg", "x").name, "new");
    }

    #[test]
    fn classify_assigns_plugin_classes() {
        register_stanza_class(&PING);
        register_plugin(&PING, &PONG, false);
        let mut st = Stanza::new("urn:test:ping", "ping");
        st.append(Stanza::new("urn:test:ping", "pong"));
        st.append(Stanza::new("urn:other", "stray"));
        classify(&mut st);
        assert_eq!(st.class().name, "ping");
        let mut children = st.children();
        assert_eq!(children.next().unwrap().class().name, "pong");
        assert_eq!(children.next().unwrap().class().name, GENERIC.name);
    }
}
