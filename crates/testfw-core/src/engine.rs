//! Synchronization engine: replays a script's actions over live connections.
//!
//! Two waiting strategies keep the recorded output deterministic:
//!
//! - **Verb-Wait**: read lines until one of the action's verbs arrives. Used
//!   until a client is registered, and whenever the client being waited on is
//!   not the one that last sent something.
//! - **Ping-Barrier**: once a client is registered, every action ends with a
//!   uniquely tagged `PING`. The server answers it only after everything
//!   queued before it, so the matching `PONG` marks the end of the burst
//!   without knowing its shape. It also orders actions across clients.
//!
//! Keep-alive `PING`s from the server are answered automatically and never
//! recorded.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::{FrameworkError, FrameworkResult};
use crate::ircmsg::{Message, PING, PONG, RPL_WELCOME};
use crate::results::{ResultLine, ScriptResults};
use crate::script::{Action, ClientId, Script};
use crate::socket::Socket;

/// Connections for a run, one per declared client.
pub type Connections = BTreeMap<ClientId, Socket>;

/// Callback invoked with every result line as it is recorded.
pub type Observer<'a> = Box<dyn FnMut(&ResultLine) + Send + 'a>;

/// Knobs for bounding blocking reads. Both are off by default, in which
/// case a silent server blocks the run indefinitely.
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Fail a read that takes longer than this
    pub read_timeout: Option<Duration>,
    /// Abort any pending read once this token is cancelled
    pub cancel: Option<CancellationToken>,
}

impl EngineOptions {
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Per-run tracking that picks the waiting strategy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunState {
    registered: BTreeSet<ClientId>,
    last_sender: Option<ClientId>,
}

impl RunState {
    /// Whether `client` has seen `001`. One-way.
    pub fn is_registered(&self, client: &str) -> bool {
        self.registered.contains(client)
    }

    /// Client of the most recent action that sent a line
    pub fn last_sender(&self) -> Option<&ClientId> {
        self.last_sender.as_ref()
    }

    fn needs_verb_wait(&self, action: &Action) -> bool {
        !action.wait_after_for.is_empty()
            && (!self.is_registered(action.client.as_str())
                || self.last_sender.as_ref() != Some(&action.client))
    }
}

/// Runs one script against one set of connections.
///
/// The engine never opens or closes connections; the caller does.
pub struct Engine<'a> {
    script: &'a Script,
    options: EngineOptions,
    observer: Option<Observer<'a>>,
    state: RunState,
}

impl<'a> Engine<'a> {
    pub fn new(script: &'a Script, options: EngineOptions) -> Self {
        Self {
            script,
            options,
            observer: None,
            state: RunState::default(),
        }
    }

    /// Stream each result line to `observer` as it is recorded.
    pub fn with_observer(mut self, observer: impl FnMut(&ResultLine) + Send + 'a) -> Self {
        self.observer = Some(Box::new(observer));
        self
    }

    /// State left by the last run
    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Run every action in order.
    ///
    /// Any connection, framing, timeout or cancellation error aborts the run
    /// and the lines collected so far are dropped.
    pub async fn run(&mut self, connections: &mut Connections) -> FrameworkResult<ScriptResults> {
        let script = self.script;
        self.state = RunState::default();
        let mut results = ScriptResults::new(script.clients.clone());

        for (index, action) in script.actions.iter().enumerate() {
            let socket = connections.get_mut(&action.client).ok_or_else(|| {
                FrameworkError::Connection(format!("no connection for client {}", action.client))
            })?;

            self.run_action(index, action, socket, &mut results)
                .await
                .map_err(|source| FrameworkError::Action {
                    index,
                    client: action.client.to_string(),
                    source: Box::new(source),
                })?;
        }

        tracing::debug!(lines = results.lines.len(), "Script run complete");
        Ok(results)
    }

    async fn run_action(
        &mut self,
        index: usize,
        action: &Action,
        socket: &mut Socket,
        results: &mut ScriptResults,
    ) -> FrameworkResult<()> {
        let client = &action.client;

        match &action.line_to_send {
            Some(line) => {
                socket.write_line(line).await?;
                tracing::debug!(action = index, client = %client, line = %line, "Sent");
                self.record(
                    results,
                    ResultLine::ActionSync {
                        client: client.clone(),
                        line: Some(line.clone()),
                    },
                );
                self.state.last_sender = Some(client.clone());
            }
            None => self.record(
                results,
                ResultLine::ActionSync {
                    client: client.clone(),
                    line: None,
                },
            ),
        }

        if self.state.needs_verb_wait(action) {
            tracing::debug!(action = index, client = %client, verbs = ?action.wait_after_for, "Waiting for verbs");
            self.wait_for_verbs(action, socket, results).await?;
        }

        if self.state.is_registered(client.as_str()) {
            tracing::debug!(action = index, client = %client, "Waiting on ping barrier");
            self.ping_barrier(index, client, socket, results).await?;
        }

        Ok(())
    }

    async fn wait_for_verbs(
        &mut self,
        action: &Action,
        socket: &mut Socket,
        results: &mut ScriptResults,
    ) -> FrameworkResult<()> {
        let client = &action.client;

        loop {
            let (raw, msg) = self.next_message(client, socket).await?;

            if msg.is_verb(PING) {
                answer_ping(socket, &msg).await?;
                continue;
            }

            let verb = msg.verb();
            if verb == RPL_WELCOME && self.state.registered.insert(client.clone()) {
                tracing::debug!(client = %client, "Registered");
            }

            self.record(
                results,
                ResultLine::Message {
                    client: client.clone(),
                    line: raw,
                },
            );

            if action.wait_after_for.contains(&verb) {
                return Ok(());
            }
        }
    }

    async fn ping_barrier(
        &mut self,
        index: usize,
        client: &ClientId,
        socket: &mut Socket,
        results: &mut ScriptResults,
    ) -> FrameworkResult<()> {
        let token = barrier_token(index);
        socket.send(&Message::new(PING, [token.as_str()])).await?;

        loop {
            let (raw, msg) = self.next_message(client, socket).await?;

            if msg.is_verb(PONG) {
                if msg.params.last() == Some(&token) {
                    return Ok(());
                }
                tracing::warn!(client = %client, expected = %token, line = %raw, "Unexpected PONG during barrier");
            }

            if msg.is_verb(PING) {
                answer_ping(socket, &msg).await?;
                continue;
            }

            self.record(
                results,
                ResultLine::Message {
                    client: client.clone(),
                    line: raw,
                },
            );
        }
    }

    async fn next_message(
        &self,
        client: &ClientId,
        socket: &mut Socket,
    ) -> FrameworkResult<(String, Message)> {
        let raw = read_bounded(&self.options, client, socket).await?;
        let msg = Message::parse(&raw)?;
        tracing::debug!(client = %client, verb = %msg.verb(), line = %raw, "Received");
        Ok((raw, msg))
    }

    fn record(&mut self, results: &mut ScriptResults, line: ResultLine) {
        if let Some(observer) = self.observer.as_mut() {
            observer(&line);
        }
        results.lines.push(line);
    }
}

/// The PING token used to fence action `index`
pub fn barrier_token(index: usize) -> String {
    format!("sync{}", index)
}

async fn answer_ping(socket: &mut Socket, ping: &Message) -> FrameworkResult<()> {
    let token = ping.params.first().map(String::as_str).unwrap_or_default();
    socket.send(&Message::new(PONG, [token])).await
}

async fn read_bounded(
    options: &EngineOptions,
    client: &ClientId,
    socket: &mut Socket,
) -> FrameworkResult<String> {
    let read = async {
        match options.read_timeout {
            Some(limit) => tokio::time::timeout(limit, socket.read_line())
                .await
                .map_err(|_| FrameworkError::ReadTimeout {
                    client: client.to_string(),
                })?,
            None => socket.read_line().await,
        }
    };

    match &options.cancel {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(FrameworkError::Cancelled {
                client: client.to_string(),
            }),
            line = read => line,
        },
        None => read.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};

    /// Server end of a duplex pipe, driven line by line from the test.
    struct StubServer {
        lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl StubServer {
        async fn expect(&mut self, line: &str) {
            let got = self.lines.next_line().await.unwrap().expect("client closed");
            assert_eq!(got, line);
        }

        async fn say(&mut self, line: &str) {
            self.writer.write_all(format!("{}\r\n", line).as_bytes()).await.unwrap();
        }
    }

    fn pipe(id: &str) -> (ClientId, Socket, StubServer) {
        let (client, server) = tokio::io::duplex(8192);
        let (read, writer) = tokio::io::split(server);
        let stub = StubServer {
            lines: BufReader::new(read).lines(),
            writer,
        };
        (ClientId::new(id).unwrap(), Socket::from_stream(client), stub)
    }

    fn messages(results: &ScriptResults) -> Vec<(&str, &str)> {
        results
            .lines
            .iter()
            .filter_map(|l| match l {
                ResultLine::Message { client, line } => Some((client.as_str(), line.as_str())),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_registration_uses_verb_wait_only() {
        let script = Script::parse("! c\nc NICK test\n-> 001\n").unwrap();
        let (id, socket, mut server) = pipe("c");
        let mut conns: Connections = [(id, socket)].into_iter().collect();

        let server_task = tokio::spawn(async move {
            server.expect("NICK test").await;
            server.say(":srv 001 test :welcome").await;
            // pure-wait action after registration gets a barrier
            server.expect("PING sync1").await;
            server.say(":srv PONG srv :sync1").await;
            server
        });

        let mut engine = Engine::new(&script, EngineOptions::default());
        let results = engine.run(&mut conns).await.unwrap();
        server_task.await.unwrap();

        assert_eq!(messages(&results), vec![("c", ":srv 001 test :welcome")]);
        assert!(engine.state().is_registered("c"));
        assert_eq!(engine.state().last_sender().map(ClientId::as_str), Some("c"));
        assert_eq!(
            results.lines[0],
            ResultLine::ActionSync {
                client: ClientId::new("c").unwrap(),
                line: Some("NICK test".into())
            }
        );
        assert_eq!(
            results.lines[1],
            ResultLine::ActionSync {
                client: ClientId::new("c").unwrap(),
                line: None
            }
        );
    }

    #[tokio::test]
    async fn test_registered_last_sender_skips_verb_wait() {
        let script = Script::parse("! c\nc NICK test\n-> 001\nc JOIN #a\n-> 366\n").unwrap();
        let (id, socket, mut server) = pipe("c");
        let mut conns: Connections = [(id, socket)].into_iter().collect();

        // 366 never arrives; only the barrier pings are answered
        let server_task = tokio::spawn(async move {
            server.expect("NICK test").await;
            server.say(":srv 001 test :welcome").await;
            server.expect("PING sync1").await;
            server.say(":srv PONG srv :sync1").await;
            server.expect("JOIN #a").await;
            server.expect("PING sync2").await;
            server.say(":test!u@h JOIN #a").await;
            server.say(":srv PONG srv :sync2").await;
            server.expect("PING sync3").await;
            server.say(":srv PONG srv :sync3").await;
            server
        });

        let options = EngineOptions::default().with_read_timeout(Duration::from_secs(5));
        let mut engine = Engine::new(&script, options);
        let results = engine.run(&mut conns).await.unwrap();
        let _server = server_task.await.unwrap();

        assert_eq!(
            messages(&results),
            vec![("c", ":srv 001 test :welcome"), ("c", ":test!u@h JOIN #a")]
        );
        assert_eq!(results.lines.len(), 6);
    }

    #[tokio::test]
    async fn test_non_utf8_lines_are_recorded() {
        let script = Script::parse("! c\nc NICK test\n-> 001\n").unwrap();
        let (id, socket, mut server) = pipe("c");
        let mut conns: Connections = [(id, socket)].into_iter().collect();

        let server_task = tokio::spawn(async move {
            server.expect("NICK test").await;
            server
                .writer
                .write_all(b":srv NOTICE * :caf\xe9\r\n:srv 001 test :welcome\r\n")
                .await
                .unwrap();
            server.expect("PING sync1").await;
            server.say(":srv PONG srv :sync1").await;
            server
        });

        let mut engine = Engine::new(&script, EngineOptions::default());
        let results = engine.run(&mut conns).await.unwrap();
        let _server = server_task.await.unwrap();

        assert_eq!(
            messages(&results),
            vec![
                ("c", ":srv NOTICE * :caf\u{FFFD}"),
                ("c", ":srv 001 test :welcome"),
            ]
        );
    }

    #[tokio::test]
    async fn test_no_barrier_before_registration() {
        let script = Script::parse("! c\nc NICK test\nc USER u 0 * :real\n-> 001\n").unwrap();
        let (id, socket, mut server) = pipe("c");
        let mut conns: Connections = [(id, socket)].into_iter().collect();

        let server_task = tokio::spawn(async move {
            server.expect("NICK test").await;
            server.expect("USER u 0 * :real").await;
            server.say(":srv NOTICE * :looking up your hostname").await;
            server.say(":srv 001 test :welcome").await;
            server.expect("PING sync2").await;
            server.say(":srv 002 test :your host").await;
            server.say(":srv PONG srv :sync2").await;
        });

        let mut engine = Engine::new(&script, EngineOptions::default());
        let results = engine.run(&mut conns).await.unwrap();
        server_task.await.unwrap();

        assert_eq!(
            messages(&results),
            vec![
                ("c", ":srv NOTICE * :looking up your hostname"),
                ("c", ":srv 001 test :welcome"),
                ("c", ":srv 002 test :your host"),
            ]
        );
    }

    #[tokio::test]
    async fn test_barrier_after_every_registered_action() {
        let script = Script::parse("! c\nc NICK test\n-> 001\nc JOIN #x\nc PRIVMSG #x :hi\n").unwrap();
        let (id, socket, mut server) = pipe("c");
        let mut conns: Connections = [(id, socket)].into_iter().collect();

        let server_task = tokio::spawn(async move {
            server.expect("NICK test").await;
            server.say(":srv 001 test :welcome").await;
            server.expect("PING sync1").await;
            server.say(":srv PONG srv :sync1").await;

            server.expect("JOIN #x").await;
            server.expect("PING sync2").await;
            server.say(":test!u@h JOIN #x").await;
            server.say("PING :keepalive").await;
            server.expect("PONG keepalive").await;
            server.say(":srv 353 test = #x :test").await;
            // a stale pong for another token is just another line
            server.say(":srv PONG srv :sync0").await;
            server.say(":srv PONG srv :sync2").await;

            server.expect("PRIVMSG #x :hi").await;
            server.expect("PING sync3").await;
            server.say(":srv PONG srv :sync3").await;
        });

        let mut engine = Engine::new(&script, EngineOptions::default());
        let results = engine.run(&mut conns).await.unwrap();
        server_task.await.unwrap();

        assert_eq!(
            messages(&results),
            vec![
                ("c", ":srv 001 test :welcome"),
                ("c", ":test!u@h JOIN #x"),
                ("c", ":srv 353 test = #x :test"),
                ("c", ":srv PONG srv :sync0"),
            ]
        );
        let syncs = results
            .lines
            .iter()
            .filter(|l| matches!(l, ResultLine::ActionSync { .. }))
            .count();
        assert_eq!(syncs, 4);
    }

    #[tokio::test]
    async fn test_pings_during_verb_wait_are_answered_not_logged() {
        let script = Script::parse("! c\nc NICK test\n-> 001\n").unwrap();
        let (id, socket, mut server) = pipe("c");
        let mut conns: Connections = [(id, socket)].into_iter().collect();

        let server_task = tokio::spawn(async move {
            server.expect("NICK test").await;
            server.say("PING :abc").await;
            server.expect("PONG abc").await;
            server.say(":srv 001 test :welcome").await;
            server.expect("PING sync1").await;
            server.say(":srv PONG srv :sync1").await;
        });

        let mut engine = Engine::new(&script, EngineOptions::default());
        let results = engine.run(&mut conns).await.unwrap();
        server_task.await.unwrap();

        assert_eq!(messages(&results), vec![("c", ":srv 001 test :welcome")]);
    }

    #[tokio::test]
    async fn test_cross_client_wait_uses_verb_wait() {
        let script = Script::parse(
            "! a b\na NICK a\n-> 001\nb NICK b\n-> 001\na PRIVMSG b :hi\n-> b: privmsg\n",
        )
        .unwrap();
        let (ida, sa, mut server_a) = pipe("a");
        let (idb, sb, mut server_b) = pipe("b");
        let mut conns: Connections = [(ida, sa), (idb, sb)].into_iter().collect();

        let task_a = tokio::spawn(async move {
            server_a.expect("NICK a").await;
            server_a.say(":srv 001 a :welcome").await;
            server_a.expect("PING sync1").await;
            server_a.say(":srv PONG srv :sync1").await;
            server_a.expect("PRIVMSG b :hi").await;
            server_a.expect("PING sync4").await;
            server_a.say(":srv PONG srv :sync4").await;
        });
        let task_b = tokio::spawn(async move {
            server_b.expect("NICK b").await;
            server_b.say(":srv 001 b :welcome").await;
            server_b.expect("PING sync3").await;
            server_b.say(":srv PONG srv :sync3").await;
            // b did not send last, so it waits for the verb, then fences
            server_b.say(":a!a@h PRIVMSG b :hi").await;
            server_b.expect("PING sync5").await;
            server_b.say(":srv PONG srv :sync5").await;
        });

        let mut engine = Engine::new(&script, EngineOptions::default());
        let results = engine.run(&mut conns).await.unwrap();
        task_a.await.unwrap();
        task_b.await.unwrap();

        assert_eq!(
            messages(&results),
            vec![
                ("a", ":srv 001 a :welcome"),
                ("b", ":srv 001 b :welcome"),
                ("b", ":a!a@h PRIVMSG b :hi"),
            ]
        );
        assert_eq!(engine.state().last_sender().map(ClientId::as_str), Some("a"));
    }

    #[tokio::test]
    async fn test_observer_sees_every_line() {
        let script = Script::parse("! c\nc NICK test\n-> 001\n").unwrap();
        let (id, socket, mut server) = pipe("c");
        let mut conns: Connections = [(id, socket)].into_iter().collect();

        tokio::spawn(async move {
            server.expect("NICK test").await;
            server.say(":srv 001 test :welcome").await;
            server.expect("PING sync1").await;
            server.say(":srv PONG srv :sync1").await;
        });

        let mut seen = Vec::new();
        let results = {
            let mut engine = Engine::new(&script, EngineOptions::default())
                .with_observer(|line: &ResultLine| seen.push(line.clone()));
            engine.run(&mut conns).await.unwrap()
        };

        assert_eq!(seen, results.lines);
    }

    #[tokio::test]
    async fn test_malformed_line_aborts() {
        let script = Script::parse("! c\nc NICK test\n-> 001\n").unwrap();
        let (id, socket, mut server) = pipe("c");
        let mut conns: Connections = [(id, socket)].into_iter().collect();

        tokio::spawn(async move {
            server.expect("NICK test").await;
            server.say(":srv").await;
            server
        });

        let mut engine = Engine::new(&script, EngineOptions::default());
        let err = engine.run(&mut conns).await.unwrap_err();
        match err {
            FrameworkError::Action { index, client, source } => {
                assert_eq!(index, 1);
                assert_eq!(client, "c");
                assert!(matches!(*source, FrameworkError::Framing { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_server_hangup_aborts() {
        let script = Script::parse("! c\nc NICK test\n-> 001\n").unwrap();
        let (id, socket, mut server) = pipe("c");
        let mut conns: Connections = [(id, socket)].into_iter().collect();

        tokio::spawn(async move {
            server.expect("NICK test").await;
            drop(server);
        });

        let mut engine = Engine::new(&script, EngineOptions::default());
        let err = engine.run(&mut conns).await.unwrap_err();
        assert!(matches!(err.root(), FrameworkError::Disconnected));
    }

    #[tokio::test]
    async fn test_read_timeout_bounds_a_stalled_server() {
        let script = Script::parse("! c\nc NICK test\n-> 001\n").unwrap();
        let (id, socket, server) = pipe("c");
        let mut conns: Connections = [(id, socket)].into_iter().collect();

        let options = EngineOptions::default().with_read_timeout(Duration::from_millis(50));
        let mut engine = Engine::new(&script, options);
        let err = engine.run(&mut conns).await.unwrap_err();
        assert!(matches!(err.root(), FrameworkError::ReadTimeout { client } if client == "c"));
        drop(server);
    }

    #[tokio::test]
    async fn test_cancel_aborts_pending_read() {
        let script = Script::parse("! c\nc NICK test\n-> 001\n").unwrap();
        let (id, socket, server) = pipe("c");
        let mut conns: Connections = [(id, socket)].into_iter().collect();

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let mut engine = Engine::new(&script, EngineOptions::default().with_cancel(token));
        let err = engine.run(&mut conns).await.unwrap_err();
        assert!(matches!(err.root(), FrameworkError::Cancelled { .. }));
        drop(server);
    }

    #[tokio::test]
    async fn test_missing_connection() {
        let script = Script::parse("! c\nc NICK test\n").unwrap();
        let mut conns = Connections::new();

        let mut engine = Engine::new(&script, EngineOptions::default());
        let err = engine.run(&mut conns).await.unwrap_err();
        assert!(matches!(err, FrameworkError::Connection(_)));
    }
}
