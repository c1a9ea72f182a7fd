// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A simplified path matcher over stanza trees.
//!
//! The grammar is deliberately tiny: slash-separated segments, each a local
//! name (or `{uri}local`, or a registered plugin name, or `*`), optionally
//! followed by `[@attr=value]` predicates. `@xmlns` compares the element
//! namespace, every other attribute goes through the interface resolver so
//! that declared sub-element interfaces participate too.

use crate::element::Stanza;

struct Segment<'p> {
    name: &'p str,
    namespace: Option<&'p str>,
    predicates: Vec<(&'p str, Option<&'p str>)>,
}

impl<'p> Segment<'p> {
    fn parse(mut raw: &'p str) -> Segment<'p> {
        let mut predicates = Vec::new();
        while let Some(open) = raw.rfind('[') {
            let Some(inner) = raw[open..].strip_prefix('[').and_then(|s| s.strip_suffix(']'))
            else {
                break;
            };
            let inner = inner.strip_prefix('@').unwrap_or(inner);
            match inner.split_once('=') {
                Some((attr, value)) => predicates.push((attr, Some(value))),
                None => predicates.push((inner, None)),
            }
            raw = &raw[..open];
        }
        predicates.reverse();
        let (namespace, name) = match raw.strip_prefix('{') {
            Some(rest) => match rest.split_once('}') {
                Some((ns, local)) => (Some(ns), local),
                None => (None, raw),
            },
            None => (None, raw),
        };
        Segment {
            name,
            namespace,
            predicates,
        }
    }

    fn matches(&self, stanza: &Stanza) -> bool {
        let name_ok = self.name == "*"
            || self.name == stanza.name()
            || self.name == stanza.class().name;
        if !name_ok {
            return false;
        }
        if let Some(ns) = self.namespace {
            if ns != stanza.namespace() {
                return false;
            }
        }
        self.predicates.iter().all(|(attr, value)| {
            let actual = if *attr == "xmlns" {
                stanza.namespace().to_owned()
            } else {
                stanza.get(attr)
            };
            match value {
                Some(v) => actual == *v,
                None => !actual.is_empty(),
            }
        })
    }
}

impl Stanza {
    /// Tests this stanza against a path expression such as
    /// `iq[@type=get]/query[@xmlns=urn:test]`.
    ///
    /// The first segment must match this element; each following segment
    /// must match some child of the previously matched element. An empty
    /// path matches nothing.
    pub fn matches(&self, path: &str) -> bool {
        if path.is_empty() {
            return false;
        }
        let segments: Vec<Segment> = path.split('/').map(Segment::parse).collect();
        match_from(self, &segments)
    }
}

fn match_from(stanza: &Stanza, segments: &[Segment]) -> bool {
    let Some((first, rest)) = segments.split_first() else {
        return true;
    };
    if !first.matches(stanza) {
        return false;
    }
    if rest.is_empty() {
        return true;
    }
    stanza.children().any(|child| match_from(child, rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Stanza {
        let mut iq = Stanza::new("jabber:client", "iq");
        iq.set_attr("type", "get");
        iq.set_attr("id", "1");
        iq.ensure_child("urn:test", "query").set_attr("node", "info");
        iq
    }

    #[test]
    fn plain_name_chain() {
        let iq = sample();
        assert!(iq.matches("iq"));
        assert!(iq.matches("iq/query"));
        assert!(!iq.matches("iq/other"));
        assert!(!iq.matches("message"));
    }

    #[test]
    fn attribute_predicates() {
        let iq = sample();
        assert!(iq.matches("iq[@type=get]/query[@xmlns=urn:test]"));
        assert!(iq.matches("iq[@type=get][@id=1]"));
        assert!(!iq.matches("iq[@type=set]/query"));
        assert!(!iq.matches("iq/query[@xmlns=urn:other]"));
    }

    #[test]
    fn presence_predicate_and_wildcard() {
        let iq = sample();
        assert!(iq.matches("iq[@id]"));
        assert!(!iq.matches("iq[@foo]"));
        assert!(iq.matches("*/query[@node=info]"));
    }

    #[test]
    fn clark_notation_segment() {
        let iq = sample();
        assert!(iq.matches("{jabber:client}iq/{urn:test}query"));
        assert!(!iq.matches("{jabber:server}iq"));
    }

    #[test]
    fn empty_path_matches_nothing() {
        assert!(!sample().matches(""));
    }
}
