/// Command Line Interface for wasmrt
use crate::container::{ContainerDefinition, DefinitionStore};
use crate::executor::ExecutionEngine;
use crate::io_handler::Stdio;
use crate::sandbox::Sandbox;
use crate::types::{Result, WasmrtError};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "wasmrt")]
#[command(version, about = "A minimal lifecycle manager for sandboxed WebAssembly modules", long_about = None)]
pub struct Cli {
    /// Directory holding container definitions
    #[arg(long, global = true, env = "WASMRT_STATE_DIR", default_value = ".state")]
    pub state_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Record a new container definition
    Create {
        /// Container identifier
        id: String,

        /// Path to the WebAssembly module
        module: PathBuf,

        /// Argument passed to the module (repeatable, order preserved)
        #[arg(long = "arg", value_name = "VALUE", allow_hyphen_values = true)]
        args: Vec<String>,

        /// Environment variable for the module (repeatable)
        #[arg(long = "env", value_name = "KEY=VAL", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,
    },

    /// Run a container's module to completion
    Start {
        /// Container identifier
        id: String,

        /// Wall clock deadline, e.g. 2s, 500ms, 1m30s (0 disables it)
        #[arg(long, value_name = "DURATION", value_parser = parse_duration)]
        timeout: Option<Duration>,

        /// Report the execution outcome as JSON on stderr
        #[arg(long)]
        json: bool,
    },

    /// Remove a container definition
    Delete {
        /// Container identifier
        id: String,
    },

    /// List recorded containers
    List,
}

/// Execute a parsed command against an explicit store and engine
///
/// Human-readable confirmations go to `out`. Any outcome other than success
/// comes back as `WasmrtError::Module`.
pub fn dispatch<S: Sandbox>(
    command: Commands,
    store: &dyn DefinitionStore,
    engine: &ExecutionEngine<S>,
    stdio: Stdio,
    out: &mut dyn Write,
) -> Result<()> {
    match command {
        Commands::Create { id, module, args, env } => {
            let mut definition = ContainerDefinition::new(id, module);
            definition.args = args;
            definition.env = env.into_iter().collect();
            store.create(&definition)?;

            writeln!(out, "created {:?} -> {}", definition.id, definition.module_path.display())?;
            Ok(())
        }
        Commands::Start { id, timeout, json } => {
            let definition = store.load(&id)?;
            definition.validate()?;

            log::info!(
                "Starting {} ({}) with deadline {:?}",
                definition.id,
                definition.module_path.display(),
                timeout
            );
            let outcome = engine.run(&definition, timeout, stdio);

            if json {
                let report = serde_json::json!({
                    "id": definition.id,
                    "status": serde_json::to_value(&outcome.status)?,
                    "exit_code": outcome.status.exit_code(),
                    "wall_time": outcome.wall_time,
                    "success": outcome.is_success(),
                });
                eprintln!("{}", serde_json::to_string_pretty(&report)?);
            }

            if !outcome.is_success() {
                return Err(WasmrtError::Module(outcome.status));
            }

            writeln!(out, "started {:?}", definition.id)?;
            Ok(())
        }
        Commands::Delete { id } => {
            store.delete(&id)?;
            writeln!(out, "deleted {:?}", id)?;
            Ok(())
        }
        Commands::List => {
            for id in store.list()? {
                writeln!(out, "{}", id)?;
            }
            Ok(())
        }
    }
}

/// Parse `KEY=VAL`, splitting at the first `=`
pub fn parse_env_pair(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, _)) if key.is_empty() => Err(format!("invalid --env {:?}, empty variable name", s)),
        Some((key, value)) => Ok((key.to_string(), value.to_string())),
        None => Err(format!("invalid --env {:?}, expected KEY=VAL", s)),
    }
}

/// Parse a duration such as `300ms`, `2s`, `1.5h` or `1m30s`
///
/// Units: ns, us (or µs), ms, s, m, h. A bare `0` is accepted.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let input = s.trim();
    if input.is_empty() {
        return Err("empty duration".to_string());
    }
    if input == "0" {
        return Ok(Duration::ZERO);
    }
    if input.starts_with('-') {
        return Err(format!("negative duration: {}", s));
    }

    let mut total_nanos: f64 = 0.0;
    let mut rest = input.strip_prefix('+').unwrap_or(input);

    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if number_len == 0 {
            return Err(format!("invalid duration: {}", s));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("invalid duration: {}", s))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let nanos_per_unit = match &rest[..unit_len] {
            "ns" => 1.0,
            "us" | "µs" | "μs" => 1e3,
            "ms" => 1e6,
            "s" => 1e9,
            "m" => 60.0 * 1e9,
            "h" => 3600.0 * 1e9,
            "" => return Err(format!("missing unit in duration: {}", s)),
            unit => return Err(format!("unknown unit {:?} in duration: {}", unit, s)),
        };
        rest = &rest[unit_len..];

        total_nanos += value * nanos_per_unit;
    }

    if !total_nanos.is_finite() || total_nanos > u64::MAX as f64 {
        return Err(format!("duration out of range: {}", s));
    }
    Ok(Duration::from_nanos(total_nanos.round() as u64))
}
