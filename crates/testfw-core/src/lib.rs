//! IRC Test Framework Core Library
//!
//! Replays human-written scripts against live IRC servers and records
//! exactly what each simulated client sent and received.
//!
//! ## Overview
//!
//! - [`script`]: the script language and its parser
//! - [`engine`]: drives a script's actions over live connections, syncing
//!   on expected verbs and on tagged PING/PONG barriers
//! - [`orchestrator`]: repeats a run across several servers
//! - [`report`]: renders the collected results as a static HTML page
//!
//! ## Quick Start
//!
//! ```ignore
//! use testfw_core::{orchestrator, Engine, EngineOptions, Script};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let script = Script::parse("! c\nc NICK test\nc USER u 0 * :Test\n-> 001\n")?;
//!
//!     let mut connections =
//!         orchestrator::connect_clients(&script, "localhost:6667", false, false).await?;
//!     let results = Engine::new(&script, EngineOptions::default())
//!         .run(&mut connections)
//!         .await;
//!     orchestrator::disconnect_all(&mut connections).await;
//!
//!     for line in results?.lines {
//!         println!("{:?}", line);
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod ircmsg;
pub mod orchestrator;
pub mod report;
pub mod results;
pub mod script;
pub mod socket;

// Re-exports
pub use config::{Config, ServerConfig};
pub use engine::{Connections, Engine, EngineOptions, RunState};
pub use error::{FrameworkError, FrameworkResult, ParseError};
pub use ircmsg::Message;
pub use orchestrator::{Orchestrator, Progress};
pub use results::{ResultLine, ScriptResults};
pub use script::{Action, ClientId, Script};
pub use socket::Socket;
