//! WebAssembly sandbox backed by wasmtime and WASI preview1

use crate::sandbox::{Capabilities, Fault, Interrupt, Invocation, Runtime, Sandbox};
use async_trait::async_trait;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use wasi_common::pipe::{ReadPipe, WritePipe};
use wasi_common::sched::{Poll, WasiSched};
use wasi_common::{Error as WasiError, I32Exit, Table, WasiCtx};
use wasmtime::{Config, Engine, Instance, Linker, Module, Store, Trap};
use wasmtime_wasi::sync::sched::SyncSched;

struct HostState {
    wasi: WasiCtx,
}

/// Sandbox producing one wasmtime engine and store per run
#[derive(Clone, Debug, Default)]
pub struct WasmtimeSandbox;

impl WasmtimeSandbox {
    pub fn new() -> Self {
        Self
    }
}

impl Sandbox for WasmtimeSandbox {
    type Runtime = WasmtimeRuntime;

    fn prepare(&self, capabilities: Capabilities) -> Result<WasmtimeRuntime, Fault> {
        let mut config = Config::new();
        config.epoch_interruption(true);
        let engine = Engine::new(&config)
            .map_err(|e| Fault::Invalid(format!("failed to create engine: {}", e)))?;

        let cancellation = Arc::new(Cancellation::default());
        let wasi = build_wasi(capabilities, cancellation.clone())?;

        let mut linker = Linker::new(&engine);
        wasmtime_wasi::sync::add_to_linker(&mut linker, |state: &mut HostState| &mut state.wasi)
            .map_err(|e| Fault::Invalid(format!("failed to add WASI to linker: {}", e)))?;
        define_proc_exit(&mut linker)
            .map_err(|e| Fault::Invalid(format!("failed to define proc_exit: {}", e)))?;

        let mut store = Store::new(&engine, HostState { wasi });
        // The epoch only advances when the run is interrupted
        store.set_epoch_deadline(1);

        Ok(WasmtimeRuntime {
            engine,
            linker,
            store: Some(store),
            instance: None,
            cancellation,
        })
    }
}

/// WASI context granting exactly the argv, environment and streams in `capabilities`
fn build_wasi(capabilities: Capabilities, cancellation: Arc<Cancellation>) -> Result<WasiCtx, Fault> {
    let Capabilities {
        args,
        env,
        stdin,
        stdout,
        stderr,
    } = capabilities;

    let sched = InterruptibleSched {
        cancellation,
        fallback: SyncSched::new(),
    };
    let mut wasi = WasiCtx::new(
        wasmtime_wasi::sync::random_ctx(),
        wasmtime_wasi::sync::clocks_ctx(),
        Box::new(sched),
        Table::new(),
    );

    for arg in &args {
        wasi.push_arg(arg)
            .map_err(|e| Fault::Invalid(format!("failed to register args: {}", e)))?;
    }
    for (key, value) in &env {
        wasi.push_env(key, value)
            .map_err(|e| Fault::Invalid(format!("failed to register env {}: {}", key, e)))?;
    }
    wasi.set_stdin(Box::new(ReadPipe::new(stdin)));
    wasi.set_stdout(Box::new(WritePipe::new(stdout)));
    wasi.set_stderr(Box::new(WritePipe::new(stderr)));
    Ok(wasi)
}

/// Report every exit status as `I32Exit`, including 126 and above
fn define_proc_exit(linker: &mut Linker<HostState>) -> anyhow::Result<()> {
    linker.allow_shadowing(true);
    for namespace in ["wasi_snapshot_preview1", "wasi_unstable"] {
        linker.func_wrap(namespace, "proc_exit", |status: i32| -> anyhow::Result<()> {
            Err(anyhow::Error::new(I32Exit(status)))
        })?;
    }
    linker.allow_shadowing(false);
    Ok(())
}

/// Sticky cancellation flag that wakes host-side waits
#[derive(Default)]
struct Cancellation {
    cancelled: Mutex<bool>,
    wake: Condvar,
}

impl Cancellation {
    fn cancel(&self) {
        let mut cancelled = self.cancelled.lock().unwrap_or_else(|e| e.into_inner());
        *cancelled = true;
        self.wake.notify_all();
    }

    /// Block for `duration`; true if cancelled first
    fn wait_timeout(&self, duration: Duration) -> bool {
        let until = Instant::now() + duration;
        let mut cancelled = self.cancelled.lock().unwrap_or_else(|e| e.into_inner());
        while !*cancelled {
            let now = Instant::now();
            if now >= until {
                return false;
            }
            cancelled = match self.wake.wait_timeout(cancelled, until - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

/// WASI scheduler whose clock waits end as soon as the run is interrupted
///
/// Polls that include file descriptors go to the blocking scheduler.
struct InterruptibleSched {
    cancellation: Arc<Cancellation>,
    fallback: SyncSched,
}

#[async_trait]
impl WasiSched for InterruptibleSched {
    async fn poll_oneoff<'a>(&self, poll: &mut Poll<'a>) -> Result<(), WasiError> {
        if poll.rw_subscriptions().next().is_some() {
            return self.fallback.poll_oneoff(poll).await;
        }
        let wait = poll
            .earliest_clock_deadline()
            .map(|clock| clock.duration_until().unwrap_or(Duration::ZERO));
        match wait {
            Some(duration) => self.sleep(duration).await,
            None => Ok(()),
        }
    }

    async fn sched_yield(&self) -> Result<(), WasiError> {
        self.fallback.sched_yield().await
    }

    async fn sleep(&self, duration: Duration) -> Result<(), WasiError> {
        if self.cancellation.wait_timeout(duration) {
            return Err(WasiError::trap(anyhow::Error::new(Trap::Interrupt)));
        }
        Ok(())
    }
}

/// A single-use wasmtime store with WASI registered
pub struct WasmtimeRuntime {
    engine: Engine,
    linker: Linker<HostState>,
    store: Option<Store<HostState>>,
    instance: Option<Instance>,
    cancellation: Arc<Cancellation>,
}

/// Stops running wasm by bumping the engine epoch and wakes pending WASI sleeps
pub struct WasmtimeInterrupter {
    engine: Engine,
    cancellation: Arc<Cancellation>,
}

impl Interrupt for WasmtimeInterrupter {
    fn interrupt(&self) {
        self.engine.increment_epoch();
        self.cancellation.cancel();
    }
}

impl WasmtimeRuntime {
    fn store_mut(&mut self) -> Result<&mut Store<HostState>, Fault> {
        self.store
            .as_mut()
            .ok_or_else(|| Fault::Invalid("runtime already closed".to_string()))
    }
}

impl Runtime for WasmtimeRuntime {
    type Module = Module;
    type Interrupter = WasmtimeInterrupter;

    fn interrupter(&self) -> WasmtimeInterrupter {
        WasmtimeInterrupter {
            engine: self.engine.clone(),
            cancellation: self.cancellation.clone(),
        }
    }

    fn compile(&mut self, bytes: &[u8]) -> Result<Module, Fault> {
        Module::new(&self.engine, bytes).map_err(|e| Fault::Invalid(format!("compile: {:#}", e)))
    }

    fn instantiate(&mut self, module: &Module) -> Result<(), Fault> {
        let store = self
            .store
            .as_mut()
            .ok_or_else(|| Fault::Invalid("runtime already closed".to_string()))?;
        let instance = self
            .linker
            .instantiate(&mut *store, module)
            .map_err(|e| fault_from(e, |cause| Fault::Invalid(format!("instantiate: {}", cause))))?;
        self.instance = Some(instance);
        Ok(())
    }

    fn invoke(&mut self, export: &str) -> Result<Invocation, Fault> {
        let instance = self
            .instance
            .ok_or_else(|| Fault::Invalid("module not instantiated".to_string()))?;
        let store = self.store_mut()?;

        let func = match instance.get_func(&mut *store, export) {
            Some(func) => func,
            None => return Ok(Invocation::NotExported),
        };
        let entry = func
            .typed::<(), ()>(&*store)
            .map_err(|e| Fault::Invalid(format!("{}: {}", export, e)))?;

        entry
            .call(&mut *store, ())
            .map(|()| Invocation::Completed)
            .map_err(|e| fault_from(e, |cause| Fault::Trap(format!("{}: {}", export, cause))))
    }

    fn close(&mut self) {
        self.instance = None;
        self.store = None;
    }
}

/// Map a wasmtime error to a fault; `other` covers errors that are neither exits nor traps
fn fault_from(err: anyhow::Error, other: impl FnOnce(String) -> Fault) -> Fault {
    if let Some(exit) = err.downcast_ref::<I32Exit>() {
        return Fault::Exit(exit.0);
    }
    if let Some(trap) = err.downcast_ref::<Trap>() {
        if matches!(trap, Trap::Interrupt) {
            return Fault::Interrupted;
        }
        return Fault::Trap(trap.to_string());
    }
    other(format!("{:#}", err))
}
