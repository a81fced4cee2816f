/// Module execution with deadline enforcement and outcome classification
use crate::container::ContainerDefinition;
use crate::io_handler::{OutputGate, Stdio};
use crate::sandbox::{Capabilities, Fault, Interrupt, Invocation, Runtime, RuntimeGuard, Sandbox};
use crate::types::{EngineConfig, ExecutionOutcome, ExecutionStatus};
use crossbeam_channel::RecvTimeoutError;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

/// Drives one module invocation per call to a single terminal outcome
pub struct ExecutionEngine<S: Sandbox> {
    sandbox: S,
    config: EngineConfig,
}

impl<S: Sandbox> ExecutionEngine<S> {
    pub fn new(sandbox: S) -> Self {
        Self::with_config(sandbox, EngineConfig::default())
    }

    pub fn with_config(sandbox: S, config: EngineConfig) -> Self {
        Self { sandbox, config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn sandbox(&self) -> &S {
        &self.sandbox
    }

    /// Run a stored definition
    pub fn run(
        &self,
        definition: &ContainerDefinition,
        deadline: Option<Duration>,
        stdio: Stdio,
    ) -> ExecutionOutcome {
        self.run_module(
            &definition.module_path,
            &definition.args,
            &definition.env,
            deadline,
            stdio,
        )
    }

    /// Load, compile, instantiate and start a module. A zero deadline means no deadline.
    pub fn run_module(
        &self,
        module_path: &Path,
        args: &[String],
        env: &BTreeMap<String, String>,
        deadline: Option<Duration>,
        stdio: Stdio,
    ) -> ExecutionOutcome {
        let start_time = Instant::now();
        let deadline = deadline.filter(|limit| !limit.is_zero());

        let status = self.execute(module_path, args, env, deadline, stdio, start_time);

        log::debug!(
            "Run of {} finished in {:?}: {}",
            module_path.display(),
            start_time.elapsed(),
            status
        );
        ExecutionOutcome::new(status, start_time.elapsed())
    }

    fn execute(
        &self,
        module_path: &Path,
        args: &[String],
        env: &BTreeMap<String, String>,
        deadline: Option<Duration>,
        stdio: Stdio,
        start_time: Instant,
    ) -> ExecutionStatus {
        let bytes = match fs::read(module_path) {
            Ok(bytes) => bytes,
            Err(e) => {
                return ExecutionStatus::SetupFailed(format!(
                    "read module {}: {}",
                    module_path.display(),
                    e
                ));
            }
        };
        log::debug!("Loaded {} bytes from {}", bytes.len(), module_path.display());

        let gate = OutputGate::new();
        let capabilities = Capabilities {
            args: args.to_vec(),
            env: env.clone(),
            stdin: stdio.stdin,
            stdout: Box::new(gate.wrap(stdio.stdout)),
            stderr: Box::new(gate.wrap(stdio.stderr)),
        };

        let runtime = match self.sandbox.prepare(capabilities) {
            Ok(runtime) => RuntimeGuard::new(runtime),
            Err(fault) => return classify(Err(fault)),
        };

        match deadline {
            None => {
                let mut runtime = runtime;
                classify(drive(&mut *runtime, &bytes, &self.config.entry_point))
            }
            Some(limit) => self.race(runtime, bytes, limit, start_time, gate),
        }
    }

    /// Run the module on a worker thread and stop it once `limit` has elapsed
    ///
    /// Returns only after the worker has released the runtime. A sandbox that
    /// ignores the interrupt holds the caller until its current call returns,
    /// although its output is already cut off by the gate.
    fn race(
        &self,
        runtime: RuntimeGuard<S::Runtime>,
        bytes: Vec<u8>,
        limit: Duration,
        start_time: Instant,
        gate: OutputGate,
    ) -> ExecutionStatus {
        let interrupter = runtime.interrupter();
        let entry_point = self.config.entry_point.clone();
        let (sender, receiver) = crossbeam_channel::bounded(1);

        let spawned = thread::Builder::new()
            .name("wasmrt-module".to_string())
            .spawn(move || {
                let mut runtime = runtime;
                let result = drive(&mut *runtime, &bytes, &entry_point);
                // Release before reporting so a received result implies a closed runtime
                drop(runtime);
                let _ = sender.send(result);
            });

        let worker = match spawned {
            Ok(worker) => worker,
            Err(e) => return ExecutionStatus::SetupFailed(format!("failed to start worker: {}", e)),
        };

        let remaining = limit.saturating_sub(start_time.elapsed());
        match receiver.recv_timeout(remaining) {
            Ok(result) => {
                let _ = worker.join();
                classify(result)
            }
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("Deadline of {:?} elapsed, interrupting module", limit);
                gate.close();
                interrupter.interrupt();

                if receiver.recv_timeout(self.config.grace_period).is_err() {
                    log::warn!(
                        "Module did not stop within {:?} after interruption, waiting for release",
                        self.config.grace_period
                    );
                    let _ = receiver.recv();
                }
                let _ = worker.join();
                log::debug!("Interrupted module released its runtime");
                ExecutionStatus::TimedOut
            }
            Err(RecvTimeoutError::Disconnected) => {
                let cause = match worker.join() {
                    Err(panic) => panic_message(panic.as_ref()),
                    Ok(()) => "worker exited without reporting".to_string(),
                };
                ExecutionStatus::Trapped(format!("sandbox panicked: {}", cause))
            }
        }
    }
}

/// compile -> instantiate -> invoke, strictly in order
fn drive<R: Runtime>(runtime: &mut R, bytes: &[u8], entry_point: &str) -> Result<(), Fault> {
    let module = runtime.compile(bytes)?;
    log::debug!("Module compiled");

    let result = start(runtime, &module, entry_point);
    runtime.release_module(module);
    result
}

fn start<R: Runtime>(runtime: &mut R, module: &R::Module, entry_point: &str) -> Result<(), Fault> {
    match runtime.instantiate(module) {
        Ok(()) => {}
        // The start section ran the whole program and exited cleanly
        Err(Fault::Exit(0)) => {
            log::debug!("Module exited with code 0 during instantiation");
            return Ok(());
        }
        Err(fault) => return Err(fault),
    }
    log::debug!("Module instantiated");

    match runtime.invoke(entry_point)? {
        Invocation::Completed => {}
        Invocation::NotExported => log::debug!("Module has no {} export, nothing to invoke", entry_point),
    }
    Ok(())
}

fn classify(result: Result<(), Fault>) -> ExecutionStatus {
    match result {
        Ok(()) | Err(Fault::Exit(0)) => ExecutionStatus::Success,
        Err(Fault::Exit(code)) => ExecutionStatus::ExitCode(code),
        Err(Fault::Trap(cause)) => ExecutionStatus::Trapped(cause),
        Err(Fault::Interrupted) => ExecutionStatus::TimedOut,
        Err(Fault::Invalid(cause)) => ExecutionStatus::SetupFailed(cause),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
