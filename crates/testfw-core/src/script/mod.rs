//! Script model: the clients a script declares and the ordered actions they take.
//!
//! A script is written in a small line-oriented language:
//!
//! ```text
//! #~ Channel join
//! #~d Joining a channel sends JOIN, topic and names replies
//! ! c1 c2
//! c1 NICK alice
//! c1 USER a 0 * :Alice
//!   -> 001
//! c1 JOIN #test
//!   -> c2: join
//! ```
//!
//! See [`parse`] for the full grammar.

mod parser;

pub use parser::parse;

use std::borrow::Borrow;
use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

/// Characters a client ID may not start with
const DISALLOWED_LEADING: [char; 3] = ['!', '#', '-'];

/// A case-folded client identifier.
///
/// Folding happens exactly once, when the ID is declared. Every later
/// reference in the script has to use the folded form.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Fold and validate a declared client ID.
    pub fn new(raw: &str) -> Result<Self, String> {
        let id = caseless::default_case_fold_str(raw);

        if id.is_empty() {
            return Err("Client ID cannot be empty".to_string());
        }
        if id.starts_with(DISALLOWED_LEADING) {
            return Err(format!("Client ID [{}] starts with a disallowed character", id));
        }
        if id.contains(':') {
            return Err(format!("Client ID [{}] contains a disallowed character", id));
        }
        // folding can change the string, so check again after it
        if id.contains(char::is_whitespace) {
            return Err(format!("Client ID [{}] cannot contain whitespace", id));
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ClientId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ClientId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// One step of a script, performed by a single client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    /// Client this action applies to
    pub client: ClientId,
    /// Line the client sends, if any
    pub line_to_send: Option<String>,
    /// Lowercase verbs to wait for after sending
    pub wait_after_for: BTreeSet<String>,
}

impl Action {
    pub fn send(client: ClientId, line: impl Into<String>) -> Self {
        Self {
            client,
            line_to_send: Some(line.into()),
            wait_after_for: BTreeSet::new(),
        }
    }

    pub fn wait(client: ClientId, verbs: BTreeSet<String>) -> Self {
        Self {
            client,
            line_to_send: None,
            wait_after_for: verbs,
        }
    }

    /// Whether this action puts a line on the wire
    pub fn sends(&self) -> bool {
        self.line_to_send.is_some()
    }
}

/// A parsed script. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    pub name: String,
    pub short_description: String,
    pub clients: BTreeSet<ClientId>,
    pub actions: Vec<Action>,
}

impl Script {
    /// Parse script text. Shorthand for [`parse`].
    pub fn parse(text: &str) -> Result<Self, crate::ParseError> {
        parse(text)
    }
}

impl fmt::Display for Script {
    /// Canonical, order-stable rendering used by `testfw print`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.name.is_empty() {
            writeln!(f, "Name: {}", self.name)?;
        }
        if !self.short_description.is_empty() {
            writeln!(f, "Description: {}", self.short_description)?;
        }

        let ids: Vec<&str> = self.clients.iter().map(ClientId::as_str).collect();
        writeln!(f, "Clients: {}", ids.join(", "))?;

        for action in &self.actions {
            if let Some(line) = &action.line_to_send {
                writeln!(f, "{} will send: {}", action.client, line)?;
            }
            if !action.wait_after_for.is_empty() {
                let verbs: Vec<&str> = action.wait_after_for.iter().map(String::as_str).collect();
                writeln!(f, "  {} will wait for: {}", action.client, verbs.join(" "))?;
            }
        }

        Ok(())
    }
}
