// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stanza handlers and their matchers.

use core::fmt;
use std::sync::Arc;

use stanza::Stanza;

use crate::error::Error;
use crate::XmlStream;

/// Callback invoked with a matched incoming stanza.
pub type StanzaCallback = Arc<dyn Fn(&XmlStream, Stanza) -> Result<(), Error> + Send + Sync>;

/// Predicate deciding whether a handler wants a stanza.
#[derive(Clone)]
pub enum Matcher {
    /// Match against a path expression, see [`Stanza::matches`].
    Path(String),
    /// Match a stanza whose `id` interface equals the given value; the
    /// usual matcher for request/response pairs.
    Id(String),
    /// An arbitrary predicate.
    Predicate(Arc<dyn Fn(&Stanza) -> bool + Send + Sync>),
}

impl Matcher {
    /// Tests a stanza against this matcher.
    pub fn matches(&self, stanza: &Stanza) -> bool {
        match self {
            Matcher::Path(path) => stanza.matches(path),
            Matcher::Id(id) => stanza.get("id") == *id,
            Matcher::Predicate(pred) => pred(stanza),
        }
    }
}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Path(path) => f.debug_tuple("Path").field(path).finish(),
            Matcher::Id(id) => f.debug_tuple("Id").field(id).finish(),
            Matcher::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// A named handler for incoming stanzas.
pub struct Handler {
    pub(crate) name: String,
    pub(crate) matcher: Matcher,
    pub(crate) callback: StanzaCallback,
    pub(crate) once: bool,
    pub(crate) instream: bool,
}

impl Handler {
    /// Creates a handler that runs `callback` on the dispatch workers for
    /// every matching stanza.
    pub fn new(
        name: impl Into<String>,
        matcher: Matcher,
        callback: impl Fn(&XmlStream, Stanza) -> Result<(), Error> + Send + Sync + 'static,
    ) -> Handler {
        Handler {
            name: name.into(),
            matcher,
            callback: Arc::new(callback),
            once: false,
            instream: false,
        }
    }

    /// Makes the handler disposable: it is removed when queued for its
    /// first match, not when it finishes running, so a burst of matching
    /// stanzas cannot fire it twice.
    pub fn once(mut self) -> Handler {
        self.once = true;
        self
    }

    /// Runs the callback synchronously inside the read loop instead of on
    /// the dispatch workers. Only for handlers that must act before the
    /// next stanza is parsed, e.g. negotiation steps.
    pub fn instream(mut self) -> Handler {
        self.instream = true;
        self
    }

    /// Returns the handler name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("name", &self.name)
            .field("matcher", &self.matcher)
            .field("once", &self.once)
            .field("instream", &self.instream)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn iq() -> Stanza {
        let mut iq = Stanza::new("jabber:client", "iq");
        iq.set_attr("type", "get");
        iq.set_attr("id", "42");
        iq.ensure_child("urn:test", "query");
        iq
    }

    #[test]
    fn path_matcher() {
        let m = Matcher::Path("iq[@type=get]/query[@xmlns=urn:test]".to_owned());
        assert!(m.matches(&iq()));
        let m = Matcher::Path("iq[@type=set]".to_owned());
        assert!(!m.matches(&iq()));
    }

    #[test]
    fn id_matcher() {
        assert!(Matcher::Id("42".to_owned()).matches(&iq()));
        assert!(!Matcher::Id("43".to_owned()).matches(&iq()));
    }

    #[test]
    fn predicate_matcher() {
        let m = Matcher::Predicate(Arc::new(|st: &Stanza| st.name() == "iq"));
        assert!(m.matches(&iq()));
    }
}
