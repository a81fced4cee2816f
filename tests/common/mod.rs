//! Shared fixtures: WAT modules for the wasmtime sandbox and a counting fake sandbox

#![allow(dead_code)]

use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use wasmrt::io_handler::{CaptureBuffer, Stdio};
use wasmrt::sandbox::{Capabilities, Fault, Interrupt, Invocation, Runtime, Sandbox};

/// Prints argv[0] to stdout from `_start`
pub const ECHO_ARG_WAT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "args_sizes_get" (func $args_sizes_get (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "args_get" (func $args_get (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (drop (call $args_sizes_get (i32.const 0) (i32.const 4)))
    (drop (call $args_get (i32.const 16) (i32.const 64)))
    (i32.store (i32.const 32) (i32.load (i32.const 16)))
    (i32.store (i32.const 36) (i32.sub (i32.load (i32.const 4)) (i32.const 1)))
    (drop (call $fd_write (i32.const 1) (i32.const 32) (i32.const 1) (i32.const 40)))))
"#;

/// Prints the first environment entry (`KEY=VAL`) to stdout
pub const ECHO_ENV_WAT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "environ_sizes_get" (func $environ_sizes_get (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "environ_get" (func $environ_get (param i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "fd_write" (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (drop (call $environ_sizes_get (i32.const 0) (i32.const 4)))
    (drop (call $environ_get (i32.const 16) (i32.const 64)))
    (i32.store (i32.const 32) (i32.load (i32.const 16)))
    (i32.store (i32.const 36) (i32.sub (i32.load (i32.const 4)) (i32.const 1)))
    (drop (call $fd_write (i32.const 1) (i32.const 32) (i32.const 1) (i32.const 40)))))
"#;

/// `_start` calls proc_exit with the given code
pub fn exit_wat(code: i32) -> String {
    format!(
        r#"
(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (call $proc_exit (i32.const {}))))
"#,
        code
    )
}

/// The start section calls proc_exit during instantiation; there is no `_start`
pub fn start_section_exit_wat(code: i32) -> String {
    format!(
        r#"
(module
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory (export "memory") 1)
  (func $main
    (call $proc_exit (i32.const {})))
  (start $main))
"#,
        code
    )
}

pub const UNREACHABLE_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "_start")
    unreachable))
"#;

/// Loads past the end of a single 64KiB page
pub const OUT_OF_BOUNDS_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "_start")
    (drop (i32.load (i32.const 70000)))))
"#;

pub const SPIN_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "_start")
    (loop $forever
      (br $forever))))
"#;

/// Sleeps one second through a monotonic clock subscription, then returns
pub const SLEEP_WAT: &str = r#"
(module
  (import "wasi_snapshot_preview1" "poll_oneoff" (func $poll_oneoff (param i32 i32 i32 i32) (result i32)))
  (memory (export "memory") 1)
  (func (export "_start")
    (i32.store (i32.const 16) (i32.const 1))
    (i64.store (i32.const 24) (i64.const 1000000000))
    (drop (call $poll_oneoff (i32.const 0) (i32.const 64) (i32.const 1) (i32.const 128)))))
"#;

/// The start section loops forever; there is no `_start`
pub const START_SPIN_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func $main
    (loop $forever
      (br $forever)))
  (start $main))
"#;

/// The start section traps during instantiation
pub const START_UNREACHABLE_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func $main
    unreachable)
  (start $main))
"#;

/// `_start` takes a parameter, so it cannot be the command entry point
pub const WRONG_ENTRY_SIGNATURE_WAT: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "_start") (param i32)))
"#;

/// Valid module with nothing to run
pub const NO_ENTRY_WAT: &str = r#"
(module
  (memory (export "memory") 1))
"#;

pub const UNKNOWN_IMPORT_WAT: &str = r#"
(module
  (import "env" "does_not_exist" (func $missing))
  (func (export "_start")
    (call $missing)))
"#;

/// Temporary directory holding module files for one test
pub struct ModuleDir {
    dir: TempDir,
}

impl ModuleDir {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("Failed to create temp directory"),
        }
    }

    pub fn write(&self, name: &str, contents: impl AsRef<[u8]>) -> PathBuf {
        let path = self.dir.path().join(name);
        let mut file = std::fs::File::create(&path).expect("Failed to create module file");
        file.write_all(contents.as_ref()).expect("Failed to write module file");
        path
    }

    pub fn path(&self) -> &std::path::Path {
        self.dir.path()
    }
}

/// Stdio with captured stdout/stderr
pub fn captured_stdio() -> (Stdio, CaptureBuffer, CaptureBuffer) {
    let stdout = CaptureBuffer::new();
    let stderr = CaptureBuffer::new();
    let stdio = Stdio::new(std::io::empty(), stdout.clone(), stderr.clone());
    (stdio, stdout, stderr)
}

/// Live resource counters shared between a fake sandbox and the test
#[derive(Clone, Default)]
pub struct Counters {
    pub live_runtimes: Arc<AtomicUsize>,
    pub live_modules: Arc<AtomicUsize>,
    pub prepared: Arc<AtomicUsize>,
}

impl Counters {
    pub fn live_runtimes(&self) -> usize {
        self.live_runtimes.load(Ordering::SeqCst)
    }

    pub fn live_modules(&self) -> usize {
        self.live_modules.load(Ordering::SeqCst)
    }

    pub fn prepared(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }
}

/// Sandbox whose "modules" are small scripts:
///
/// `ok`, `exit <n>`, `start-exit <n>`, `trap`, `spin`, `sleep <ms>`,
/// `block <ms>`, `echo`, `no-entry`. Anything else fails to compile.
///
/// `sleep` stops early when interrupted, `block` ignores interrupts.
#[derive(Clone, Default)]
pub struct FakeSandbox {
    pub counters: Counters,
}

impl FakeSandbox {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Clone, Debug)]
enum Script {
    Ok,
    Exit(i32),
    StartExit(i32),
    Trap,
    Spin,
    Sleep(Duration),
    Block(Duration),
    Echo,
    NoEntry,
}

pub struct FakeModule {
    script: Script,
}

pub struct FakeRuntime {
    capabilities: Capabilities,
    counters: Counters,
    interrupted: Arc<AtomicBool>,
    script: Option<Script>,
    closed: bool,
}

pub struct FakeInterrupter {
    interrupted: Arc<AtomicBool>,
}

impl Interrupt for FakeInterrupter {
    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }
}

impl Sandbox for FakeSandbox {
    type Runtime = FakeRuntime;

    fn prepare(&self, capabilities: Capabilities) -> Result<FakeRuntime, Fault> {
        self.counters.prepared.fetch_add(1, Ordering::SeqCst);
        self.counters.live_runtimes.fetch_add(1, Ordering::SeqCst);
        Ok(FakeRuntime {
            capabilities,
            counters: self.counters.clone(),
            interrupted: Arc::new(AtomicBool::new(false)),
            script: None,
            closed: false,
        })
    }
}

impl Runtime for FakeRuntime {
    type Module = FakeModule;
    type Interrupter = FakeInterrupter;

    fn interrupter(&self) -> FakeInterrupter {
        FakeInterrupter {
            interrupted: self.interrupted.clone(),
        }
    }

    fn compile(&mut self, bytes: &[u8]) -> Result<FakeModule, Fault> {
        let text = std::str::from_utf8(bytes).map_err(|e| Fault::Invalid(e.to_string()))?;
        let mut words = text.split_whitespace();
        let number = |word: Option<&str>| -> Result<i64, Fault> {
            word.and_then(|w| w.parse().ok())
                .ok_or_else(|| Fault::Invalid(format!("bad script: {}", text)))
        };

        let script = match words.next() {
            Some("ok") => Script::Ok,
            Some("exit") => Script::Exit(number(words.next())? as i32),
            Some("start-exit") => Script::StartExit(number(words.next())? as i32),
            Some("trap") => Script::Trap,
            Some("spin") => Script::Spin,
            Some("sleep") => Script::Sleep(Duration::from_millis(number(words.next())? as u64)),
            Some("block") => Script::Block(Duration::from_millis(number(words.next())? as u64)),
            Some("echo") => Script::Echo,
            Some("no-entry") => Script::NoEntry,
            _ => return Err(Fault::Invalid(format!("bad script: {}", text))),
        };

        self.counters.live_modules.fetch_add(1, Ordering::SeqCst);
        Ok(FakeModule { script })
    }

    fn instantiate(&mut self, module: &FakeModule) -> Result<(), Fault> {
        if self.closed {
            return Err(Fault::Invalid("runtime closed".to_string()));
        }
        if let Script::StartExit(code) = module.script {
            return Err(Fault::Exit(code));
        }
        self.script = Some(module.script.clone());
        Ok(())
    }

    fn invoke(&mut self, _export: &str) -> Result<Invocation, Fault> {
        let script = self
            .script
            .clone()
            .ok_or_else(|| Fault::Invalid("not instantiated".to_string()))?;

        match script {
            Script::Ok => Ok(Invocation::Completed),
            Script::Exit(code) => Err(Fault::Exit(code)),
            Script::StartExit(_) => Ok(Invocation::Completed),
            Script::Trap => Err(Fault::Trap("unreachable".to_string())),
            Script::Spin => loop {
                if self.interrupted.load(Ordering::SeqCst) {
                    let _ = self.capabilities.stdout.write_all(b"late output");
                    return Err(Fault::Interrupted);
                }
                thread::sleep(Duration::from_millis(1));
            },
            Script::Sleep(duration) => {
                let until = Instant::now() + duration;
                while Instant::now() < until {
                    if self.interrupted.load(Ordering::SeqCst) {
                        return Err(Fault::Interrupted);
                    }
                    thread::sleep(Duration::from_millis(1));
                }
                Ok(Invocation::Completed)
            }
            Script::Block(duration) => {
                thread::sleep(duration);
                Ok(Invocation::Completed)
            }
            Script::Echo => {
                let line = self.capabilities.args.join(" ");
                self.capabilities
                    .stdout
                    .write_all(line.as_bytes())
                    .map_err(|e| Fault::Trap(e.to_string()))?;
                Ok(Invocation::Completed)
            }
            Script::NoEntry => Ok(Invocation::NotExported),
        }
    }

    fn release_module(&mut self, module: FakeModule) {
        self.counters.live_modules.fetch_sub(1, Ordering::SeqCst);
        drop(module);
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.counters.live_runtimes.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
