// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Serialisation of stanza trees back to XML text.

use core::fmt::{self, Write};

use crate::element::{Node, Stanza};

/// Escapes the five XML special characters in `input`.
///
/// Suitable for both text content and double-quoted attribute values.
pub fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn write_escaped(f: &mut fmt::Formatter<'_>, input: &str) -> fmt::Result {
    for ch in input.chars() {
        match ch {
            '&' => f.write_str("&amp;")?,
            '<' => f.write_str("&lt;")?,
            '>' => f.write_str("&gt;")?,
            '"' => f.write_str("&quot;")?,
            '\'' => f.write_str("&apos;")?,
            c => f.write_char(c)?,
        }
    }
    Ok(())
}

fn write_element(f: &mut fmt::Formatter<'_>, stanza: &Stanza, parent_ns: &str) -> fmt::Result {
    write!(f, "<{}", stanza.name())?;
    if !stanza.namespace().is_empty() && stanza.namespace() != parent_ns {
        f.write_str(" xmlns=\"")?;
        write_escaped(f, stanza.namespace())?;
        f.write_str("\"")?;
    }
    // Attributes in a foreign namespace were flattened to `{uri}local` keys
    // at parse time and get a generated prefix on the way out. `xml:*` needs
    // no declaration.
    let mut prefixes: Vec<&str> = Vec::new();
    for (key, value) in stanza.attrs() {
        let name = match key.strip_prefix('{').and_then(|rest| rest.split_once('}')) {
            Some((uri, local)) => {
                let idx = match prefixes.iter().position(|p| *p == uri) {
                    Some(idx) => idx,
                    None => {
                        prefixes.push(uri);
                        write!(f, " xmlns:ns{}=\"", prefixes.len() - 1)?;
                        write_escaped(f, uri)?;
                        f.write_str("\"")?;
                        prefixes.len() - 1
                    }
                };
                format!("ns{}:{}", idx, local)
            }
            None => key.to_owned(),
        };
        write!(f, " {}=\"", name)?;
        write_escaped(f, value)?;
        f.write_str("\"")?;
    }
    if stanza.nodes().is_empty() {
        return f.write_str("/>");
    }
    f.write_str(">")?;
    for node in stanza.nodes() {
        match node {
            Node::Text(text) => write_escaped(f, text)?,
            Node::Element(child) => write_element(f, child, stanza.namespace())?,
        }
    }
    write!(f, "</{}>", stanza.name())
}

impl fmt::Display for Stanza {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write_element(f, self, "")
    }
}

impl Stanza {
    /// Serialises this stanza as it would appear inside a stream whose
    /// default namespace is `parent_ns`: the `xmlns` declaration is elided
    /// when it matches.
    pub fn to_xml_string(&self, parent_ns: &str) -> String {
        struct InStream<'a>(&'a Stanza, &'a str);
        impl fmt::Display for InStream<'_> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write_element(f, self.0, self.1)
            }
        }
        InStream(self, parent_ns).to_string()
    }
}

#[cfg(test)]
mod tests {
    use crate::builder::tests::parse_str;
    use crate::Stanza;

    #[test]
    fn empty_element_self_closes() {
        let mut st = Stanza::new("urn:test", "ping");
        st.set_attr("id", "1");
        assert_eq!(st.to_string(), "<ping xmlns=\"urn:test\" id=\"1\"/>");
    }

    #[test]
    fn namespace_elided_inside_matching_stream() {
        let st = Stanza::new("jabber:client", "message");
        assert_eq!(st.to_xml_string("jabber:client"), "<message/>");
        assert_eq!(
            st.to_xml_string("jabber:server"),
            "<message xmlns=\"jabber:client\"/>"
        );
    }

    #[test]
    fn child_in_same_namespace_not_redeclared() {
        let mut st = Stanza::new("urn:test", "iq");
        st.ensure_child("urn:test", "query");
        st.ensure_child("urn:other", "x");
        assert_eq!(
            st.to_string(),
            "<iq xmlns=\"urn:test\"><query/><x xmlns=\"urn:other\"/></iq>"
        );
    }

    #[test]
    fn text_and_attributes_escaped() {
        let mut st = Stanza::new("urn:test", "body");
        st.set_attr("title", "a \"quote\" & more");
        st.append_text("1 < 2 > 0 & 'done'");
        assert_eq!(
            st.to_string(),
            "<body xmlns=\"urn:test\" title=\"a &quot;quote&quot; &amp; more\">\
             1 &lt; 2 &gt; 0 &amp; &apos;done&apos;</body>"
        );
    }

    #[test]
    fn xml_lang_written_with_prefix() {
        let mut st = Stanza::new("urn:test", "body");
        st.set_lang("en");
        assert_eq!(st.to_string(), "<body xmlns=\"urn:test\" xml:lang=\"en\"/>");
    }

    #[tokio::test]
    async fn serialise_then_reparse_is_equal() {
        let mut st = Stanza::new("jabber:client", "message");
        st.set_attr("id", "m1");
        st.set_attr("type", "chat");
        st.set_lang("en");
        let body = st.ensure_child("jabber:client", "body");
        body.set_text("three < two & one");
        st.ensure_child("urn:test:x", "x").set_attr("k", "v");
        let reparsed = parse_str(&st.to_string()).await;
        assert_eq!(st, reparsed);
    }

    #[tokio::test]
    async fn foreign_namespace_attribute_roundtrip() {
        let st = parse_str(
            "<message xmlns=\"jabber:client\" \
             xmlns:p=\"urn:test:pfx\" p:marker=\"yes\"/>",
        )
        .await;
        assert_eq!(st.attr("{urn:test:pfx}marker"), Some("yes"));
        let reparsed = parse_str(&st.to_string()).await;
        assert_eq!(reparsed.attr("{urn:test:pfx}marker"), Some("yes"));
    }
}
