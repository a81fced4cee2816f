/// wasmrt: lifecycle manager for sandboxed WebAssembly modules
///
/// Container definitions (module path, argv, environment) are recorded in a
/// state directory and later executed under WASI, optionally bounded by a
/// wall clock deadline.
///
/// # Usage
/// ```bash
/// wasmrt create echo1 echo.wasm --arg hello --env GREETING=hi
/// wasmrt start echo1 --timeout 2s
/// wasmrt delete echo1
/// ```
use anyhow::Result;
use clap::Parser;
use wasmrt::cli::{self, Cli};
use wasmrt::container::FileStore;
use wasmrt::executor::ExecutionEngine;
use wasmrt::io_handler::Stdio;
use wasmrt::types::WasmrtError;
use wasmrt::wasm::WasmtimeSandbox;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    // Usage errors exit with 1 like every other failure; help and version exit 0
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    if let Err(e) = run(cli) {
        match e.downcast_ref::<WasmrtError>() {
            Some(WasmrtError::Module(status)) => eprintln!("module error: {}", status),
            _ => eprintln!("error: {:#}", e),
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    log::debug!("Using state directory {}", cli.state_dir.display());

    let store = FileStore::new(&cli.state_dir);
    let engine = ExecutionEngine::new(WasmtimeSandbox::new());
    let mut stdout = std::io::stdout();

    cli::dispatch(cli.command, &store, &engine, Stdio::inherit(), &mut stdout)?;
    Ok(())
}
