/// Standard stream handling for module execution
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Standard streams handed to a module for one run
///
/// The handles are owned by the run, but the streams behind them belong to
/// the caller: dropping `io::stdout()` never closes descriptor 1.
pub struct Stdio {
    pub stdin: Box<dyn Read + Send + Sync>,
    pub stdout: Box<dyn Write + Send + Sync>,
    pub stderr: Box<dyn Write + Send + Sync>,
}

impl Stdio {
    pub fn new(
        stdin: impl Read + Send + Sync + 'static,
        stdout: impl Write + Send + Sync + 'static,
        stderr: impl Write + Send + Sync + 'static,
    ) -> Self {
        Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: Box::new(stderr),
        }
    }

    /// The process's own standard streams
    pub fn inherit() -> Self {
        Self::new(io::stdin(), io::stdout(), io::stderr())
    }

    /// Empty input, discarded output
    pub fn null() -> Self {
        Self::new(io::empty(), io::sink(), io::sink())
    }
}

/// Switch shared by every writer of one run
///
/// Once closed, gated writers refuse all further output so nothing written
/// by a cancelled module reaches the caller's streams.
#[derive(Clone, Debug)]
pub struct OutputGate {
    open: Arc<AtomicBool>,
}

impl OutputGate {
    pub fn new() -> Self {
        Self {
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn wrap(&self, inner: Box<dyn Write + Send + Sync>) -> GatedWriter {
        GatedWriter {
            inner,
            open: self.open.clone(),
        }
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Default for OutputGate {
    fn default() -> Self {
        Self::new()
    }
}

pub struct GatedWriter {
    inner: Box<dyn Write + Send + Sync>,
    open: Arc<AtomicBool>,
}

impl GatedWriter {
    fn check_open(&self) -> io::Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "execution cancelled"))
        }
    }
}

impl Write for GatedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_open()?;
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check_open()?;
        self.inner.flush()
    }
}

/// In-memory output sink that stays readable after the run consumed its handle
#[derive(Clone, Debug, Default)]
pub struct CaptureBuffer {
    data: Arc<Mutex<Vec<u8>>>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        match self.data.lock() {
            Ok(data) => data.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).to_string()
    }
}

impl Write for CaptureBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "capture buffer poisoned"))?;
        data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
