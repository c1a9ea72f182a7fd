// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Incremental construction of stanza trees from parser events.

use rxml::Namespace;

use crate::class;
use crate::element::Stanza;

/// Builds [`Stanza`] trees from a stream of [`rxml::Event`]s.
///
/// The builder tracks nesting depth itself, so a caller can feed it events
/// from the middle of a document (the usual case for a stream whose root
/// element stays open forever): each element that closes back at the
/// builder's starting depth is yielded as a completed, classified stanza.
#[derive(Default)]
pub struct TreeBuilder {
    stack: Vec<Stanza>,
}

/// Flattens a parsed attribute name into the key form used by
/// [`Stanza`]: plain names for no namespace, `xml:*` for the XML namespace,
/// `{uri}local` for anything else.
fn attr_key(ns: Namespace, local: &str) -> String {
    if ns == Namespace::NONE {
        local.to_owned()
    } else if &ns == Namespace::xml() {
        format!("xml:{}", local)
    } else {
        format!("{{{}}}{}", ns, local)
    }
}

/// Converts a start-element event into an empty [`Stanza`], flattening
/// attribute names. Useful for elements that never close during normal
/// operation, such as a stream header.
pub fn element_from_start(name: rxml::QName, attrs: rxml::AttrMap) -> Stanza {
    let (ns, local) = name;
    let namespace = if ns == Namespace::NONE {
        String::new()
    } else {
        ns.to_string()
    };
    let mut stanza = Stanza::new(namespace, local.to_string());
    for ((ans, alocal), value) in attrs {
        stanza.set_attr(attr_key(ans, &alocal), value.to_string());
    }
    stanza
}

impl TreeBuilder {
    /// Creates an empty builder.
    pub fn new() -> TreeBuilder {
        TreeBuilder::default()
    }

    /// Returns the current element nesting depth.
    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    /// Discards any partially built tree.
    pub fn reset(&mut self) {
        self.stack.clear();
    }

    /// Opens a new element.
    pub fn start(&mut self, name: rxml::QName, attrs: rxml::AttrMap) {
        self.stack.push(element_from_start(name, attrs));
    }

    /// Appends character data to the innermost open element. Text outside
    /// any open element is ignored; stream-level text is the caller's
    /// concern.
    pub fn text(&mut self, data: &str) {
        if let Some(top) = self.stack.last_mut() {
            top.append_text(data);
        }
    }

    /// Closes the innermost open element.
    ///
    /// Returns the completed, classified stanza when this closes the element
    /// that opened at the builder's starting depth; `None` while nested.
    pub fn end(&mut self) -> Option<Stanza> {
        let finished = self.stack.pop()?;
        match self.stack.last_mut() {
            Some(parent) => {
                parent.append(finished);
                None
            }
            None => {
                let mut finished = finished;
                class::classify(&mut finished);
                Some(finished)
            }
        }
    }

    /// Feeds a single parser event, combining [`TreeBuilder::start`],
    /// [`TreeBuilder::text`] and [`TreeBuilder::end`]. XML declarations are
    /// ignored.
    pub fn process(&mut self, event: rxml::Event) -> Option<Stanza> {
        match event {
            rxml::Event::XmlDeclaration(_, _) => None,
            rxml::Event::StartElement(_, name, attrs) => {
                self.start(name, attrs);
                None
            }
            rxml::Event::Text(_, data) => {
                self.text(&data);
                None
            }
            rxml::Event::EndElement(_) => self.end(),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use core::pin::Pin;

    use futures::future::poll_fn;

    use super::*;

    /// Parses a complete XML document into a classified stanza tree.
    pub(crate) async fn parse_str(input: &str) -> Stanza {
        let mut reader = rxml::AsyncReader::wrap(input.as_bytes(), rxml::Parser::default());
        let mut builder = TreeBuilder::new();
        loop {
            let event = poll_fn(|cx| Pin::new(&mut reader).poll_read(cx))
                .await
                .expect("well-formed input")
                .expect("document ended before the root element closed");
            if let Some(stanza) = builder.process(event) {
                return stanza;
            }
        }
    }

    #[tokio::test]
    async fn builds_nested_tree() {
        let st = parse_str(
            "<iq xmlns='jabber:client' type='get' id='1'>\
             <query xmlns='urn:test' node='info'>text</query></iq>",
        )
        .await;
        assert_eq!(st.namespace(), "jabber:client");
        assert_eq!(st.name(), "iq");
        assert_eq!(st.attr("type"), Some("get"));
        let query = st.child("urn:test", "query").expect("child parsed");
        assert_eq!(query.attr("node"), Some("info"));
        assert_eq!(query.text(), "text");
    }

    #[tokio::test]
    async fn entity_references_do_not_split_text() {
        // The parser reports a separate text event around each entity
        // reference; the tree must still hold one text node.
        let st = parse_str("<body xmlns='urn:test'>three &lt; two &amp; one</body>").await;
        assert_eq!(st.text(), "three < two & one");
        assert_eq!(st.nodes().len(), 1);
    }

    #[tokio::test]
    async fn flattens_xml_lang() {
        let st = parse_str("<message xmlns='jabber:client' xml:lang='en'/>").await;
        assert_eq!(st.lang(), Some("en"));
    }

    #[tokio::test]
    async fn depth_tracking_across_siblings() {
        let mut reader = rxml::AsyncReader::wrap(
            &b"<root xmlns='urn:test'><a/><b><c/></b></root>"[..],
            rxml::Parser::default(),
        );
        let mut builder = TreeBuilder::new();
        // Swallow the root open event, then collect the two children the way
        // a stream reader would.
        let mut saw_root = false;
        let mut collected = Vec::new();
        loop {
            let event = poll_fn(|cx| Pin::new(&mut reader).poll_read(cx))
                .await
                .expect("well-formed input");
            let Some(event) = event else { break };
            match event {
                rxml::Event::StartElement(_, _, _) if !saw_root => saw_root = true,
                rxml::Event::EndElement(_) if builder.depth() == 0 => break,
                other => {
                    if let Some(st) = builder.process(other) {
                        collected.push(st);
                    }
                }
            }
        }
        assert_eq!(collected.len(), 2);
        assert_eq!(collected[0].name(), "a");
        assert_eq!(collected[1].name(), "b");
        assert!(collected[1].has_child("urn:test", "c"));
    }
}
