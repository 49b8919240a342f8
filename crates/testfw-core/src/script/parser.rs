//! Line-classification parser for the script language.

use std::collections::BTreeSet;

use super::{Action, ClientId, Script};
use crate::error::ParseError;

const NAME_PREFIX: &str = "#~ ";
const DESCRIPTION_PREFIX: &str = "#~d ";
const CLIENTS_PREFIX: &str = "! ";
const SYNC_PREFIX: &str = "-> ";

/// Parse script text into a [`Script`].
///
/// Lines are classified in priority order, after stripping leading spaces
/// and tabs:
///
/// 1. blank lines are skipped
/// 2. `#~ <name>` and `#~d <description>` set metadata
/// 3. any other `#` line is a comment
/// 4. `! <id> [<id>...]` declares clients
/// 5. `-> [<id>:] <verb> [<verb>...]` waits for verbs after the previous action
/// 6. `<id> <line>` sends a line as that client
///
/// Anything else is an error carrying the 1-based line number.
pub fn parse(text: &str) -> Result<Script, ParseError> {
    let mut script = Script::default();

    for (index, raw) in text.lines().enumerate() {
        let number = index + 1;

        // indentation is not meaningful
        let line = raw.trim_start_matches([' ', '\t']);

        if line.trim().is_empty() {
            continue;
        }

        if let Some(name) = line.strip_prefix(NAME_PREFIX) {
            script.name = name.trim().to_string();
            continue;
        }
        if let Some(description) = line.strip_prefix(DESCRIPTION_PREFIX) {
            script.short_description = description.trim().to_string();
            continue;
        }
        if line.starts_with('#') {
            continue;
        }

        if let Some(ids) = line.strip_prefix(CLIENTS_PREFIX) {
            declare_clients(&mut script, ids, number)?;
            continue;
        }
        if line.starts_with('!') {
            return Err(ParseError::at(
                number,
                format!(
                    "Malformed client definition line, must start with '! ' (including the space) [{}]",
                    line
                ),
            ));
        }

        if let Some(rest) = line.strip_prefix(SYNC_PREFIX) {
            let action = sync_action(&script, rest, line, number)?;
            script.actions.push(action);
            continue;
        }
        if line.starts_with('-') {
            return Err(ParseError::at(
                number,
                format!("Malformed sync line, must start with '-> ' [{}]", line),
            ));
        }

        let action = send_action(&script, line, number)?;
        script.actions.push(action);
    }

    if script.clients.is_empty() {
        return Err(ParseError::script("No clients defined in the script"));
    }

    Ok(script)
}

fn declare_clients(script: &mut Script, ids: &str, number: usize) -> Result<(), ParseError> {
    let tokens: Vec<&str> = ids.split_whitespace().collect();
    if tokens.is_empty() {
        return Err(ParseError::at(number, "No client IDs defined with [!]"));
    }

    for token in tokens {
        let id = ClientId::new(token).map_err(|msg| ParseError::at(number, msg))?;
        if script.clients.contains(&id) {
            return Err(ParseError::at(
                number,
                format!("Client ID [{}] is redefined", id),
            ));
        }
        tracing::trace!(client = %id, line = number, "Client declared");
        script.clients.insert(id);
    }

    Ok(())
}

fn sync_action(
    script: &Script,
    rest: &str,
    original: &str,
    number: usize,
) -> Result<Action, ParseError> {
    let Some(previous) = script.actions.last() else {
        return Err(ParseError::at(
            number,
            format!("Sync line has no actions to sync against [{}]", original),
        ));
    };

    let rest = rest.trim();

    let (client, verb_text) = match rest.split_once(':') {
        Some((_, after_colon)) => {
            let folded = caseless::default_case_fold_str(rest);
            let client = unique_match(script, number, original, |id| {
                folded
                    .strip_prefix(id.as_str())
                    .is_some_and(|tail| tail.starts_with(':'))
            })?;
            (client, after_colon)
        }
        // only a client that just sent something can be implicitly synced:
        //
        //   c1 JOIN #channel
        //     -> c2: 141
        //     -> 134      <- error
        None if previous.sends() => (Some(previous.client.clone()), rest),
        None => (None, rest),
    };

    let Some(client) = client else {
        return Err(ParseError::at(
            number,
            format!("Could not find matching client for sync line [{}]", original),
        ));
    };

    let verbs: BTreeSet<String> = verb_text
        .split_whitespace()
        .map(str::to_lowercase)
        .collect();

    Ok(Action::wait(client, verbs))
}

fn send_action(script: &Script, line: &str, number: usize) -> Result<Action, ParseError> {
    let matched = unique_match(script, number, line, |id| {
        line.strip_prefix(id.as_str())
            .is_some_and(|tail| tail.starts_with([' ', '\t']))
    })?;

    let Some(client) = matched else {
        return Err(ParseError::at(
            number,
            format!("Could not understand line [{}]", line),
        ));
    };

    // split on the first separator after the ID, space or tab
    let to_send = &line[client.as_str().len() + 1..];
    if to_send.trim().is_empty() {
        return Err(ParseError::at(
            number,
            format!("Action line for client [{}] has nothing to send", client),
        ));
    }

    Ok(Action::send(client, to_send))
}

/// Find the single declared client satisfying `matches`.
///
/// IDs hold neither whitespace nor `:`, so at most one can be followed by
/// either separator. More than one match is still rejected rather than
/// picking one.
fn unique_match(
    script: &Script,
    number: usize,
    line: &str,
    matches: impl Fn(&ClientId) -> bool,
) -> Result<Option<ClientId>, ParseError> {
    let mut found = script.clients.iter().filter(|id| matches(id));

    let first = found.next().cloned();
    if let Some(second) = found.next() {
        return Err(ParseError::at(
            number,
            format!(
                "Ambiguous client reference, both [{}] and [{}] match [{}]",
                first.as_ref().map(ClientId::as_str).unwrap_or_default(),
                second,
                line
            ),
        ));
    }

    Ok(first)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> ClientId {
        ClientId::new(s).unwrap()
    }

    fn verbs(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|v| v.to_string()).collect()
    }

    fn parse_err(text: &str) -> ParseError {
        parse(text).expect_err("script should not parse")
    }

    #[test]
    fn test_send_then_implicit_sync() {
        let script = parse("! alice bob\nalice PRIVMSG #chan :hi\n-> 401\n").unwrap();

        assert_eq!(script.actions.len(), 2);
        assert_eq!(script.actions[0], Action::send(id("alice"), "PRIVMSG #chan :hi"));
        assert_eq!(script.actions[1], Action::wait(id("alice"), verbs(&["401"])));
    }

    #[test]
    fn test_metadata_and_comments() {
        let script = parse(
            "#~ Channel joins\n#~d Tests JOIN handling\n# just a comment\n#~x also a comment\n! c\n",
        )
        .unwrap();

        assert_eq!(script.name, "Channel joins");
        assert_eq!(script.short_description, "Tests JOIN handling");
        assert!(script.actions.is_empty());
    }

    #[test]
    fn test_indentation_and_blank_lines_ignored() {
        let script = parse("\n  ! c\n\t\n    c NICK test\n\t  -> 001\n").unwrap();
        assert_eq!(script.actions.len(), 2);
        assert_eq!(script.actions[1].client, id("c"));
    }

    #[test]
    fn test_tab_separated_action() {
        let script = parse("! c\nc\tNICK tabby\n").unwrap();
        assert_eq!(script.actions[0].line_to_send.as_deref(), Some("NICK tabby"));
    }

    #[test]
    fn test_crlf_line_endings() {
        let script = parse("! c\r\nc NICK test\r\n-> 001\r\n").unwrap();
        assert_eq!(script.actions[0].line_to_send.as_deref(), Some("NICK test"));
        assert_eq!(script.actions[1].wait_after_for, verbs(&["001"]));
    }

    #[test]
    fn test_qualified_sync_line() {
        let script = parse("! c1 c2\nc1 JOIN #channel\n-> c2: JOIN Mode\n").unwrap();

        assert_eq!(script.actions[1], Action::wait(id("c2"), verbs(&["join", "mode"])));
    }

    #[test]
    fn test_qualified_sync_line_is_folded() {
        let script = parse("! Dan\ndan NICK dan\n-> DAN: 001\n").unwrap();
        assert_eq!(script.actions[1].client, id("dan"));
    }

    #[test]
    fn test_qualified_sync_after_pure_wait() {
        let script = parse("! c1 c2\nc1 JOIN #x\n-> c2: join\n-> c1: join\n").unwrap();
        assert_eq!(script.actions.len(), 3);
        assert_eq!(script.actions[2].client, id("c1"));
    }

    #[test]
    fn test_sync_line_with_no_verbs_is_a_barrier() {
        let script = parse("! c\nc PING x\n->  \n").unwrap();
        assert_eq!(script.actions[1], Action::wait(id("c"), BTreeSet::new()));
    }

    #[test]
    fn test_sync_lines_never_merge() {
        let script = parse("! c\nc NICK a\n-> 001\nc JOIN #a\n-> join\n-> c: 366\n").unwrap();
        assert_eq!(script.actions.len(), 5);
        assert!(script.actions.iter().filter(|a| a.sends()).count() == 2);
        assert_eq!(script.actions[4], Action::wait(id("c"), BTreeSet::from(["366".to_string()])));

        // an unqualified sync after a pure wait has no sender to attach to
        let err = parse_err("! c\nc JOIN #a\n-> join\n-> 366\n");
        assert_eq!(err.line, Some(4));
        assert!(err.message.contains("Could not find matching client"));
    }

    #[test]
    fn test_prefix_ids_resolve_to_exact_client() {
        let script = parse("! c c1\nc1 NICK one\nc NICK zero\n-> c1: 001\n").unwrap();

        assert_eq!(script.actions[0].client, id("c1"));
        assert_eq!(script.actions[1].client, id("c"));
        assert_eq!(script.actions[2].client, id("c1"));
    }

    #[test]
    fn test_action_must_use_folded_id() {
        let err = parse_err("! Alice\nAlice NICK a\n");
        assert_eq!(err.line, Some(2));
        assert!(err.message.contains("Could not understand line"));

        let script = parse("! Alice\nalice NICK a\n").unwrap();
        assert_eq!(script.actions[0].client, id("alice"));
    }

    #[test]
    fn test_no_clients() {
        let err = parse_err("# nothing here\n");
        assert_eq!(err.line, None);
        assert_eq!(err.message, "No clients defined in the script");
    }

    #[test]
    fn test_sync_without_actions() {
        let err = parse_err("! c\n-> 001\n");
        assert_eq!(err.line, Some(2));
        assert!(err.message.contains("no actions to sync against"));
    }

    #[test]
    fn test_implicit_sync_after_pure_wait_fails() {
        let err = parse_err("! c1 c2\nc1 JOIN #channel\n-> c2: 141\n-> 134\n");
        assert_eq!(err.line, Some(4));
        assert!(err.message.contains("Could not find matching client"));
    }

    #[test]
    fn test_qualified_sync_unknown_client() {
        let err = parse_err("! c1\nc1 NICK a\n-> c9: 001\n");
        assert_eq!(err.line, Some(3));
        assert!(err.message.contains("Could not find matching client"));
    }

    #[test]
    fn test_client_declaration_errors() {
        let cases = [
            ("! c c\n", "redefined"),
            ("! c\n! C\n", "redefined"),
            ("! #c\n", "starts with a disallowed character"),
            ("! -c\n", "starts with a disallowed character"),
            ("! !c\n", "starts with a disallowed character"),
            ("! c:1\n", "contains a disallowed character"),
            ("!   \n", "No client IDs defined"),
            ("!c\n", "Malformed client definition"),
        ];

        for (text, expected) in cases {
            let err = parse_err(text);
            assert!(
                err.message.contains(expected),
                "{:?} gave {:?}, expected {:?}",
                text,
                err.message,
                expected
            );
            assert!(err.line.is_some());
        }
    }

    #[test]
    fn test_malformed_sync_line() {
        let err = parse_err("! c\nc NICK a\n->001\n");
        assert_eq!(err.line, Some(3));
        assert!(err.message.contains("Malformed sync line"));

        let err = parse_err("! c\n- 001\n");
        assert!(err.message.contains("Malformed sync line"));
    }

    #[test]
    fn test_unknown_line() {
        let err = parse_err("! c\nd NICK a\n");
        assert_eq!(err.line, Some(2));
        assert_eq!(err.message, "Could not understand line [d NICK a]");
    }

    #[test]
    fn test_empty_send_line_rejected() {
        let err = parse_err("! c\nc \n");
        assert!(err.message.contains("nothing to send"));
    }
}
