//! wasmrt: A minimal lifecycle manager for sandboxed WebAssembly modules
//! Records container definitions to disk and runs them under WASI with an optional deadline

pub mod cli;
pub mod container;
pub mod executor;
pub mod io_handler;
pub mod sandbox;
pub mod types;
pub mod wasm;
