// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Typed stream-level error conditions.
//!
//! A peer-sent `<stream:error>` is always fatal to the current stream. The
//! defined condition names are those of [RFC 6120, section 4.9.3]; anything
//! unrecognised maps to [`DefinedCondition::UndefinedCondition`] so that a
//! peer speaking a newer revision cannot produce an unrepresentable error.
//!
//!    [RFC 6120, section 4.9.3]: https://datatracker.ietf.org/doc/html/rfc6120#section-4.9.3

use core::fmt;

use stanza::Stanza;

/// Namespace of the stream error condition child elements.
pub const NS_STREAM_ERROR: &str = "urn:ietf:params:xml:ns:xmpp-streams";

/// Enumeration of all defined stream error conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DefinedCondition {
    /// The entity has sent XML that cannot be processed.
    BadFormat,
    /// Unsupported or missing namespace prefix.
    BadNamespacePrefix,
    /// The stream conflicts with another stream for the same entity.
    Conflict,
    /// The peer has not responded to data sent over the stream.
    ConnectionTimeout,
    /// The addressed host is no longer serviced by the receiving entity.
    HostGone,
    /// The addressed host is not serviced by the receiving entity.
    HostUnknown,
    /// A stanza between servers violates the addressing rules.
    ImproperAddressing,
    /// Internal misconfiguration or error on the peer.
    InternalServerError,
    /// The 'from' attribute does not match an authorized identity.
    InvalidFrom,
    /// The stream or content namespace is not supported.
    InvalidNamespace,
    /// Invalid XML was sent to a validating peer.
    InvalidXml,
    /// The entity attempted to send data before authenticating.
    NotAuthorized,
    /// The XML is not well-formed.
    NotWellFormed,
    /// A policy of the peer was violated.
    PolicyViolation,
    /// The peer could not connect to a remote entity needed to fulfil the
    /// stream.
    RemoteConnectionFailed,
    /// The stream is being reset; reconnecting is expected to succeed.
    Reset,
    /// The peer lacks the resources to service the stream.
    ResourceConstraint,
    /// The entity has sent restricted XML features such as comments or
    /// processing instructions.
    RestrictedXml,
    /// The entity should retry at a different host.
    SeeOtherHost(String),
    /// The peer is being shut down.
    SystemShutdown,
    /// A condition not covered by the other entries.
    UndefinedCondition,
    /// The encoding is not UTF-8.
    UnsupportedEncoding,
    /// A mandatory stream feature is not supported by the peer.
    UnsupportedFeature,
    /// A first-level child of the stream is not supported.
    UnsupportedStanzaType,
    /// The stream version is not supported.
    UnsupportedVersion,
}

impl DefinedCondition {
    fn parse(name: &str, text: String) -> Option<DefinedCondition> {
        use DefinedCondition::*;
        Some(match name {
            "bad-format" => BadFormat,
            "bad-namespace-prefix" => BadNamespacePrefix,
            "conflict" => Conflict,
            "connection-timeout" => ConnectionTimeout,
            "host-gone" => HostGone,
            "host-unknown" => HostUnknown,
            "improper-addressing" => ImproperAddressing,
            "internal-server-error" => InternalServerError,
            "invalid-from" => InvalidFrom,
            "invalid-namespace" => InvalidNamespace,
            "invalid-xml" => InvalidXml,
            "not-authorized" => NotAuthorized,
            "not-well-formed" => NotWellFormed,
            "policy-violation" => PolicyViolation,
            "remote-connection-failed" => RemoteConnectionFailed,
            "reset" => Reset,
            "resource-constraint" => ResourceConstraint,
            "restricted-xml" => RestrictedXml,
            "see-other-host" => SeeOtherHost(text),
            "system-shutdown" => SystemShutdown,
            "undefined-condition" => UndefinedCondition,
            "unsupported-encoding" => UnsupportedEncoding,
            "unsupported-feature" => UnsupportedFeature,
            "unsupported-stanza-type" => UnsupportedStanzaType,
            "unsupported-version" => UnsupportedVersion,
            _ => return None,
        })
    }

    fn name(&self) -> &'static str {
        use DefinedCondition::*;
        match self {
            BadFormat => "bad-format",
            BadNamespacePrefix => "bad-namespace-prefix",
            Conflict => "conflict",
            ConnectionTimeout => "connection-timeout",
            HostGone => "host-gone",
            HostUnknown => "host-unknown",
            ImproperAddressing => "improper-addressing",
            InternalServerError => "internal-server-error",
            InvalidFrom => "invalid-from",
            InvalidNamespace => "invalid-namespace",
            InvalidXml => "invalid-xml",
            NotAuthorized => "not-authorized",
            NotWellFormed => "not-well-formed",
            PolicyViolation => "policy-violation",
            RemoteConnectionFailed => "remote-connection-failed",
            Reset => "reset",
            ResourceConstraint => "resource-constraint",
            RestrictedXml => "restricted-xml",
            SeeOtherHost(_) => "see-other-host",
            SystemShutdown => "system-shutdown",
            UndefinedCondition => "undefined-condition",
            UnsupportedEncoding => "unsupported-encoding",
            UnsupportedFeature => "unsupported-feature",
            UnsupportedStanzaType => "unsupported-stanza-type",
            UnsupportedVersion => "unsupported-version",
        }
    }
}

impl fmt::Display for DefinedCondition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DefinedCondition::SeeOtherHost(host) => write!(f, "see-other-host: {}", host),
            other => f.write_str(other.name()),
        }
    }
}

/// A decoded `<stream:error>`.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamError {
    /// The defined condition.
    pub condition: DefinedCondition,
    /// Optional human-readable `<text/>` sent alongside the condition.
    pub text: Option<String>,
}

impl StreamError {
    /// Decodes a parsed `<stream:error>` element.
    ///
    /// A missing or unrecognised condition child yields
    /// [`DefinedCondition::UndefinedCondition`] rather than a decode
    /// failure.
    pub fn from_stanza(stanza: &Stanza) -> StreamError {
        let mut condition = None;
        let mut text = None;
        for child in stanza.children() {
            if child.namespace() != NS_STREAM_ERROR {
                continue;
            }
            if child.name() == "text" {
                let t = child.text();
                if !t.is_empty() {
                    text = Some(t);
                }
                continue;
            }
            if condition.is_none() {
                condition = DefinedCondition::parse(child.name(), child.text());
            }
        }
        StreamError {
            condition: condition.unwrap_or(DefinedCondition::UndefinedCondition),
            text,
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.text {
            Some(text) => write!(f, "{} ({})", self.condition, text),
            None => write!(f, "{}", self.condition),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error_stanza(condition: &str, text: Option<&str>) -> Stanza {
        let mut st = Stanza::new("http://etherx.jabber.org/streams", "error");
        st.append(Stanza::new(NS_STREAM_ERROR, condition));
        if let Some(text) = text {
            st.ensure_child(NS_STREAM_ERROR, "text").set_text(text);
        }
        st
    }

    #[test]
    fn decodes_condition_and_text() {
        let err = StreamError::from_stanza(&error_stanza("system-shutdown", Some("bye")));
        assert_eq!(err.condition, DefinedCondition::SystemShutdown);
        assert_eq!(err.text.as_deref(), Some("bye"));
    }

    #[test]
    fn see_other_host_keeps_target() {
        let mut st = Stanza::new("http://etherx.jabber.org/streams", "error");
        st.ensure_child(NS_STREAM_ERROR, "see-other-host")
            .set_text("alt.example.com:5222");
        let err = StreamError::from_stanza(&st);
        assert_eq!(
            err.condition,
            DefinedCondition::SeeOtherHost("alt.example.com:5222".to_owned())
        );
    }

    #[test]
    fn unknown_condition_maps_to_undefined() {
        let err = StreamError::from_stanza(&error_stanza("brand-new-condition", None));
        assert_eq!(err.condition, DefinedCondition::UndefinedCondition);
    }

    #[test]
    fn foreign_namespace_children_ignored() {
        let mut st = Stanza::new("http://etherx.jabber.org/streams", "error");
        st.append(Stanza::new("urn:other", "conflict"));
        let err = StreamError::from_stanza(&st);
        assert_eq!(err.condition, DefinedCondition::UndefinedCondition);
    }
}
