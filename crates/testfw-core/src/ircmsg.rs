//! Minimal IRC message framing.
//!
//! Only what the engine needs: split a line into tags, prefix, command and
//! params, and serialise messages we originate (PING/PONG).

use std::collections::BTreeMap;
use std::fmt::Write;

use crate::error::{FrameworkError, FrameworkResult};

/// Keep-alive request verb
pub const PING: &str = "PING";
/// Keep-alive reply verb
pub const PONG: &str = "PONG";
/// Numeric that marks a client as registered
pub const RPL_WELCOME: &str = "001";

/// A parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub tags: BTreeMap<String, Option<String>>,
    pub prefix: Option<String>,
    pub command: String,
    pub params: Vec<String>,
}

impl Message {
    /// Build a message with no tags or prefix.
    pub fn new<I, S>(command: impl Into<String>, params: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: BTreeMap::new(),
            prefix: None,
            command: command.into(),
            params: params.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a single line. Surrounding `\r\n` is ignored.
    pub fn parse(line: &str) -> FrameworkResult<Self> {
        let original = line;
        let mut rest = line.trim_end_matches(['\r', '\n']).trim_start_matches(' ');

        if rest.is_empty() {
            return Err(FrameworkError::framing(original, "empty line"));
        }

        let mut msg = Message::default();

        if let Some(after_at) = rest.strip_prefix('@') {
            let (raw_tags, tail) = after_at
                .split_once(' ')
                .ok_or_else(|| FrameworkError::framing(original, "tags with no command"))?;
            msg.tags = parse_tags(raw_tags);
            rest = tail.trim_start_matches(' ');
        }

        if let Some(after_colon) = rest.strip_prefix(':') {
            let (prefix, tail) = after_colon
                .split_once(' ')
                .ok_or_else(|| FrameworkError::framing(original, "prefix with no command"))?;
            if prefix.is_empty() {
                return Err(FrameworkError::framing(original, "empty prefix"));
            }
            msg.prefix = Some(prefix.to_string());
            rest = tail.trim_start_matches(' ');
        }

        let (command, mut params) = match rest.split_once(' ') {
            Some((command, params)) => (command, params),
            None => (rest, ""),
        };
        if command.is_empty() {
            return Err(FrameworkError::framing(original, "no command"));
        }
        msg.command = command.to_string();

        loop {
            params = params.trim_start_matches(' ');
            if params.is_empty() {
                break;
            }
            if let Some(trailing) = params.strip_prefix(':') {
                msg.params.push(trailing.to_string());
                break;
            }
            match params.split_once(' ') {
                Some((param, tail)) => {
                    msg.params.push(param.to_string());
                    params = tail;
                }
                None => {
                    msg.params.push(params.to_string());
                    break;
                }
            }
        }

        Ok(msg)
    }

    /// Lowercase command, used to match script verbs.
    pub fn verb(&self) -> String {
        self.command.to_lowercase()
    }

    pub fn is_verb(&self, verb: &str) -> bool {
        self.command.eq_ignore_ascii_case(verb)
    }

    /// Serialise to a wire line without the terminator.
    pub fn to_line(&self) -> FrameworkResult<String> {
        if self.command.is_empty() || self.command.contains(' ') {
            return Err(FrameworkError::framing(&self.command, "invalid command"));
        }

        let mut line = String::new();

        if !self.tags.is_empty() {
            line.push('@');
            for (i, (key, value)) in self.tags.iter().enumerate() {
                if i > 0 {
                    line.push(';');
                }
                line.push_str(key);
                if let Some(value) = value {
                    line.push('=');
                    line.push_str(&escape_tag_value(value));
                }
            }
            line.push(' ');
        }

        if let Some(prefix) = &self.prefix {
            let _ = write!(line, ":{} ", prefix);
        }

        line.push_str(&self.command);

        let count = self.params.len();
        for (i, param) in self.params.iter().enumerate() {
            let needs_colon = param.is_empty() || param.contains(' ') || param.starts_with(':');
            line.push(' ');
            if i + 1 == count && needs_colon {
                line.push(':');
            } else if needs_colon {
                return Err(FrameworkError::framing(
                    param,
                    "only the last parameter may contain spaces or start with ':'",
                ));
            }
            line.push_str(param);
        }

        Ok(line)
    }
}

fn parse_tags(raw: &str) -> BTreeMap<String, Option<String>> {
    raw.split(';')
        .filter(|tag| !tag.is_empty())
        .map(|tag| match tag.split_once('=') {
            Some((key, value)) => (key.to_string(), Some(unescape_tag_value(value))),
            None => (tag.to_string(), None),
        })
        .collect()
}

fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some(other) => out.push(other),
            // trailing lone backslash is dropped
            None => {}
        }
    }
    out
}

fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}
