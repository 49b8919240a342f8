//! Runs a script against several servers, one after another.

use std::collections::BTreeMap;

use crate::config::ServerConfig;
use crate::engine::{Connections, Engine, EngineOptions};
use crate::error::FrameworkResult;
use crate::results::ScriptResults;
use crate::script::Script;
use crate::socket::Socket;

/// Progress notifications for a multi-server run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress<'a> {
    /// About to connect to a server
    Started { id: &'a str, name: &'a str },
    /// The script finished and the clients disconnected
    Finished {
        id: &'a str,
        name: &'a str,
        lines: usize,
    },
}

/// Open one connection per declared client.
///
/// If any client fails to connect, those already connected are closed and
/// the error is returned.
pub async fn connect_clients(
    script: &Script,
    address: &str,
    use_tls: bool,
    tls_skip_verify: bool,
) -> FrameworkResult<Connections> {
    let mut connections = Connections::new();

    for id in &script.clients {
        match Socket::connect(address, use_tls, tls_skip_verify).await {
            Ok(socket) => {
                tracing::debug!(client = %id, address = %address, "Connected client");
                connections.insert(id.clone(), socket);
            }
            Err(e) => {
                disconnect_all(&mut connections).await;
                return Err(e);
            }
        }
    }

    Ok(connections)
}

/// Send `QUIT` on every connection and close it.
pub async fn disconnect_all(connections: &mut Connections) {
    for socket in connections.values_mut() {
        socket.quit().await;
    }
}

/// Replays a script against servers in ascending ID order.
pub struct Orchestrator<'a> {
    script: &'a Script,
    options: EngineOptions,
    progress: Option<Box<dyn FnMut(Progress<'_>) + Send + 'a>>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(script: &'a Script) -> Self {
        Self {
            script,
            options: EngineOptions::default(),
            progress: None,
        }
    }

    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    pub fn on_progress(mut self, progress: impl FnMut(Progress<'_>) + Send + 'a) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Run the script against one server with fresh connections and state.
    pub async fn run_server(&self, server: &ServerConfig) -> FrameworkResult<ScriptResults> {
        let mut connections = connect_clients(
            self.script,
            &server.address,
            server.use_tls,
            server.tls_skip_verify,
        )
        .await?;

        let mut engine = Engine::new(self.script, self.options.clone());
        let outcome = engine.run(&mut connections).await;

        disconnect_all(&mut connections).await;
        outcome
    }

    /// Run against every server. The first failure aborts the whole run.
    pub async fn run_all(
        &mut self,
        servers: &BTreeMap<String, ServerConfig>,
    ) -> FrameworkResult<BTreeMap<String, ScriptResults>> {
        let mut all = BTreeMap::new();

        for (id, server) in servers {
            self.notify(Progress::Started {
                id,
                name: &server.display_name,
            });
            tracing::info!(server = %id, address = %server.address, tls = server.use_tls, "Running script");

            let results = self.run_server(server).await.inspect_err(|e| {
                tracing::error!(server = %id, error = %e, "Server run failed");
            })?;

            self.notify(Progress::Finished {
                id,
                name: &server.display_name,
                lines: results.lines.len(),
            });
            all.insert(id.clone(), results);
        }

        Ok(all)
    }

    fn notify(&mut self, event: Progress<'_>) {
        if let Some(progress) = self.progress.as_mut() {
            progress(event);
        }
    }
}
