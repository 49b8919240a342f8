//! What a script run recorded: every line received and every action taken.

use std::collections::BTreeSet;

use serde::Serialize;

use crate::script::ClientId;

/// A single entry in a run's log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResultLine {
    /// A line received from the server
    Message { client: ClientId, line: String },
    /// The client was forcibly disconnected
    Disconnected { client: ClientId },
    /// An action was processed; `line` is what was sent, if anything
    ActionSync {
        client: ClientId,
        line: Option<String>,
    },
}

impl ResultLine {
    pub fn client(&self) -> &ClientId {
        match self {
            ResultLine::Message { client, .. } => client,
            ResultLine::Disconnected { client } => client,
            ResultLine::ActionSync { client, .. } => client,
        }
    }

    /// The raw line, if this entry carries one
    pub fn raw_line(&self) -> Option<&str> {
        match self {
            ResultLine::Message { line, .. } => Some(line),
            ResultLine::Disconnected { .. } => None,
            ResultLine::ActionSync { line, .. } => line.as_deref(),
        }
    }

    pub fn is_message(&self) -> bool {
        matches!(self, ResultLine::Message { .. })
    }
}

/// The output from running a script against one server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScriptResults {
    pub clients: BTreeSet<ClientId>,
    pub lines: Vec<ResultLine>,
}

impl ScriptResults {
    pub fn new(clients: BTreeSet<ClientId>) -> Self {
        Self {
            clients,
            lines: Vec::new(),
        }
    }

    /// Lines received by `client`, in arrival order
    pub fn messages_for<'a>(&'a self, client: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.lines.iter().filter_map(move |line| match line {
            ResultLine::Message { client: c, line } if c.as_str() == client => Some(line.as_str()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_is_tagged() {
        let client = ClientId::new("c").unwrap();
        let line = ResultLine::ActionSync {
            client: client.clone(),
            line: None,
        };
        let json = serde_json::to_string(&line).unwrap();
        assert_eq!(json, r#"{"type":"action_sync","client":"c","line":null}"#);

        let line = ResultLine::Message {
            client,
            line: ":srv 001 c :hi".into(),
        };
        let json = serde_json::to_string(&line).unwrap();
        assert!(json.contains(r#""type":"message""#));
    }

    #[test]
    fn test_messages_for() {
        let a = ClientId::new("a").unwrap();
        let b = ClientId::new("b").unwrap();
        let mut results = ScriptResults::new([a.clone(), b.clone()].into_iter().collect());
        results.lines.push(ResultLine::Message { client: a.clone(), line: "one".into() });
        results.lines.push(ResultLine::ActionSync { client: b.clone(), line: Some("x".into()) });
        results.lines.push(ResultLine::Message { client: b, line: "two".into() });
        results.lines.push(ResultLine::Message { client: a, line: "three".into() });

        let got: Vec<_> = results.messages_for("a").collect();
        assert_eq!(got, vec!["one", "three"]);
    }
}
