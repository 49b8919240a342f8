//! IRC Test Framework CLI
//!
//! Thin wrapper around testfw-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show what a script will do
//! testfw print scripts/join.txt
//!
//! # Run a script against one server, streaming the transcript
//! testfw run localhost:6667 scripts/join.txt
//! testfw run --tls --tls-noverify irc.example.org:6697 scripts/join.txt
//!
//! # Run a script against every server in a settings file and write a report
//! testfw run-multi servers.yaml scripts/join.txt
//! testfw run-multi --browser --output report.html servers.yaml scripts/join.txt
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::{Color, Colorize};
use tracing_subscriber::EnvFilter;

use testfw_core::orchestrator::{connect_clients, disconnect_all};
use testfw_core::{
    report, ClientId, Config, Engine, EngineOptions, Orchestrator, Progress, ResultLine, Script,
};

/// Client colours, cycled in sorted client order
const CLIENT_COLOURS: [Color; 6] = [
    Color::Red,
    Color::Cyan,
    Color::Green,
    Color::Magenta,
    Color::Blue,
    Color::Yellow,
];

/// IRC Test Framework - replay scripted sessions against IRC servers
#[derive(Parser)]
#[command(name = "testfw")]
#[command(version)]
#[command(about = "IRC Test Framework - replay scripted sessions against IRC servers")]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print a readable summary of a script
    Print {
        /// Script file
        script: PathBuf,
    },

    /// Run a script against a single server
    Run {
        /// Server address (host:port)
        address: String,
        /// Script file
        script: PathBuf,
        /// Connect using TLS
        #[arg(long)]
        tls: bool,
        /// Don't verify the server's TLS certificate
        #[arg(long)]
        tls_noverify: bool,
        /// Disable coloured output
        #[arg(long)]
        no_colours: bool,
        /// Give up on a server that sends nothing for this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },

    /// Run a script against every server in a settings file
    RunMulti {
        /// Settings file (YAML)
        settings: PathBuf,
        /// Script file
        script: PathBuf,
        /// Output extra debug lines
        #[arg(long)]
        debug: bool,
        /// Where to write the HTML report (default: a temp file)
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Open the HTML report in the browser
        #[arg(long)]
        browser: bool,
        /// Give up on a server that sends nothing for this many seconds
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let debug = matches!(cli.command, Commands::RunMulti { debug: true, .. });
    let level = match cli.verbose {
        0 if debug => "debug",
        0 if matches!(cli.command, Commands::Print { .. }) => "warn",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = if cli.verbose > 0 || debug {
        EnvFilter::new(level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Print { script } => {
            let script = load_script(&script)?;
            print!("{}", script);
        }

        Commands::Run {
            address,
            script,
            tls,
            tls_noverify,
            no_colours,
            timeout,
        } => {
            let script = load_script(&script)?;
            run_single(&script, &address, tls, tls_noverify, !no_colours, engine_options(timeout))
                .await?;
        }

        Commands::RunMulti {
            settings,
            script,
            debug: _,
            output,
            browser,
            timeout,
        } => {
            let script = load_script(&script)?;
            let config = Config::load_from_file(&settings).context("Could not read config")?;
            let report =
                run_multi(&script, &config, output.as_deref(), engine_options(timeout)).await?;
            if browser {
                open_report(&report);
            }
        }
    }

    Ok(())
}

fn load_script(path: &Path) -> Result<Script> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script file: {}", path.display()))?;
    Script::parse(&text).with_context(|| format!("Invalid script: {}", path.display()))
}

fn engine_options(timeout: Option<u64>) -> EngineOptions {
    match timeout {
        Some(secs) => EngineOptions::default().with_read_timeout(Duration::from_secs(secs)),
        None => EngineOptions::default(),
    }
}

async fn run_single(
    script: &Script,
    address: &str,
    tls: bool,
    tls_noverify: bool,
    use_colours: bool,
    options: EngineOptions,
) -> Result<()> {
    let colours: HashMap<ClientId, Color> = script
        .clients
        .iter()
        .cloned()
        .zip(CLIENT_COLOURS.iter().copied().cycle())
        .collect();

    let mut connections = connect_clients(script, address, tls, tls_noverify)
        .await
        .context("Could not connect client")?;

    let outcome = Engine::new(script, options)
        .with_observer(|line: &ResultLine| {
            if let Some(text) = transcript_line(line, colours.get(line.client()), use_colours) {
                println!("{}", text);
            }
        })
        .run(&mut connections)
        .await;

    disconnect_all(&mut connections).await;
    outcome.context("Script run failed")?;
    Ok(())
}

/// Console rendering of one result line; pure barrier markers print nothing.
fn transcript_line(line: &ResultLine, colour: Option<&Color>, use_colours: bool) -> Option<String> {
    let (text, sent) = match line {
        ResultLine::ActionSync {
            client,
            line: Some(sent),
        } => (format!("{}  -> {}", client, sent), true),
        ResultLine::Message { client, line } => (format!("{} <-  {}", client, line), false),
        ResultLine::Disconnected { client } => (format!("{} disconnected", client), false),
        ResultLine::ActionSync { line: None, .. } => return None,
    };

    match (use_colours, colour) {
        (true, Some(colour)) if sent => Some(text.color(*colour).bold().to_string()),
        (true, Some(colour)) => Some(text.color(*colour).to_string()),
        _ => Some(text),
    }
}

async fn run_multi(
    script: &Script,
    config: &Config,
    output: Option<&Path>,
    options: EngineOptions,
) -> Result<PathBuf> {
    let results = Orchestrator::new(script)
        .with_options(options)
        .on_progress(|event| match event {
            Progress::Started { name, .. } => {
                use std::io::Write;
                print!("- {} ...", name);
                let _ = std::io::stdout().flush();
            }
            Progress::Finished { .. } => println!("OK!"),
        })
        .run_all(&config.servers)
        .await
        .context("Multi-server run failed")?;

    let html = report::render_html(script, &config.servers, &results)?;
    let path = report::write_report(&html, output).context("Could not write report")?;

    println!("\nResults are in: {}", path.display());
    Ok(path)
}

/// Open the report with the system's default handler. Failures only warn.
fn open_report(path: &Path) {
    if let Err(e) = open::that(path) {
        tracing::warn!(path = %path.display(), error = %e, "Could not open report in browser");
    }
}
