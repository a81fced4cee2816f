/// Isolated runtime capability consumed by the execution engine
///
/// A `Sandbox` hands out single-use `Runtime`s. Each runtime owns one module
/// instance and the system interface granted to it, and is driven through
/// compile -> instantiate -> invoke by the engine. The production
/// implementation lives in `crate::wasm`; tests substitute their own.
use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};

/// Host resources granted to a module
pub struct Capabilities {
    /// argv as seen by the module
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub stdin: Box<dyn Read + Send + Sync>,
    pub stdout: Box<dyn Write + Send + Sync>,
    pub stderr: Box<dyn Write + Send + Sync>,
}

/// Why a sandbox step did not complete normally
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Controlled exit through the system interface
    Exit(i32),
    /// Execution fault raised by the sandbox
    Trap(String),
    /// Execution was stopped through an `Interrupt` handle
    Interrupted,
    /// The module or the runtime could not be set up
    Invalid(String),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Exit(code) => write!(f, "exit({})", code),
            Fault::Trap(cause) => write!(f, "trap: {}", cause),
            Fault::Interrupted => write!(f, "interrupted"),
            Fault::Invalid(cause) => write!(f, "invalid: {}", cause),
        }
    }
}

/// Result of invoking an export
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Invocation {
    Completed,
    /// The instance has no callable export with that name
    NotExported,
}

/// Stops a running module from another thread
pub trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

/// One single-use execution context
pub trait Runtime: Send {
    type Module: Send;
    type Interrupter: Interrupt + 'static;

    fn interrupter(&self) -> Self::Interrupter;

    /// Validate and compile module bytes
    fn compile(&mut self, bytes: &[u8]) -> Result<Self::Module, Fault>;

    /// Bind a compiled module; may run the module's start section
    fn instantiate(&mut self, module: &Self::Module) -> Result<(), Fault>;

    fn invoke(&mut self, export: &str) -> Result<Invocation, Fault>;

    fn release_module(&mut self, module: Self::Module) {
        drop(module);
    }

    /// Tear down the instance. Safe to call more than once.
    fn close(&mut self);
}

/// Factory for runtimes
pub trait Sandbox {
    type Runtime: Runtime + 'static;

    /// Build a fresh runtime with `capabilities` registered
    fn prepare(&self, capabilities: Capabilities) -> Result<Self::Runtime, Fault>;
}

/// Closes the wrapped runtime when dropped
pub struct RuntimeGuard<R: Runtime> {
    runtime: R,
}

impl<R: Runtime> RuntimeGuard<R> {
    pub fn new(runtime: R) -> Self {
        Self { runtime }
    }
}

impl<R: Runtime> std::ops::Deref for RuntimeGuard<R> {
    type Target = R;

    fn deref(&self) -> &R {
        &self.runtime
    }
}

impl<R: Runtime> std::ops::DerefMut for RuntimeGuard<R> {
    fn deref_mut(&mut self) -> &mut R {
        &mut self.runtime
    }
}

impl<R: Runtime> Drop for RuntimeGuard<R> {
    fn drop(&mut self) {
        self.runtime.close();
    }
}
