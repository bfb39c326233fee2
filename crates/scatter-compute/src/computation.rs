//! Common contract for Partition-Compute-Accumulate computations.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;

/// Uninterpreted payload bytes with a computation-private encoding. In output
/// data, an empty value represents a partial computation error.
pub type BinaryData = Bytes;

/// A compute request rejected by [`Computation::partition`], typically for
/// invalid arguments.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct ArgumentError {
    message: String,
}

impl ArgumentError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Cloneable handle on the destination for final results.
///
/// Only `finalize` and the coordinator's fail-fast line write here; all
/// diagnostics go to the logging layer so the result text stays parseable.
#[derive(Clone)]
pub struct OutputSink {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl OutputSink {
    pub fn stdout() -> Self {
        Self::from_writer(io::stdout())
    }

    pub fn from_writer<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            writer: Arc::new(Mutex::new(Box::new(writer))),
        }
    }

    /// A sink backed by an in-memory buffer, for tests.
    pub fn buffer() -> (Self, SharedBuffer) {
        let buffer = SharedBuffer::default();
        (Self::from_writer(buffer.clone()), buffer)
    }
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "output sink poisoned"))?;
        writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "output sink poisoned"))?;
        writer.flush()
    }
}

/// Byte buffer shared between an [`OutputSink`] and the test inspecting it.
#[derive(Clone, Default)]
pub struct SharedBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    pub fn contents(&self) -> String {
        let bytes = match self.bytes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut bytes = match self.bytes.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        bytes.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Invocation of a named computation with ordered input arguments and a
/// destination for the final result.
#[derive(Clone)]
pub struct ComputeRequest {
    pub name: String,
    pub args: Vec<String>,
    pub output: OutputSink,
}

impl ComputeRequest {
    /// Request label for result and failure lines, e.g. `fac[5]`.
    pub fn display_name(&self) -> String {
        format!("{}[{}]", self.name, self.args.join(" "))
    }
}

/// The functions a coordinator and a worker call into to process one compute
/// request with the Partition-Compute-Accumulate pattern.
///
/// Input and output data is encoded as [`BinaryData`] in a
/// computation-specific encoding. Every partial-compute message MUST be an
/// independent, self-describing encoding: encoders and decoders may not be
/// reused across messages if the chosen format carries stream state, since a
/// late-joining peer only ever sees messages from the middle of a stream.
pub trait Computation: Send {
    /// Unique computation name. Carried as the action id of every partial.
    fn name(&self) -> &'static str;

    /// One-line description for CLI help.
    fn description(&self) -> &'static str;

    /// Partitioning logic, invoked once on a coordinator.
    ///
    /// Returns a channel from which successive partial inputs are pulled on
    /// demand; closing the channel signals that all input has been emitted.
    /// Rejects the request with an [`ArgumentError`] if its arguments are
    /// invalid. Producers typically run in a spawned task, so this must be
    /// called within a runtime.
    fn partition(
        &mut self,
        request: ComputeRequest,
    ) -> Result<mpsc::Receiver<BinaryData>, ArgumentError>;

    /// Computation logic, invoked on a worker per partial input.
    ///
    /// Returns `None` to decline: nothing is sent back and the
    /// coordinator's timeout eventually resubmits the input elsewhere.
    /// Returns empty output on a computational or encoding error, which makes
    /// the coordinator fail fast: no worker could complete this partial.
    fn partial_compute(&self, input: &BinaryData) -> Option<BinaryData>;

    /// Worst-case per-partial budget, inclusive of network round trips.
    /// The coordinator resubmits any partial still unanswered at this point.
    fn partial_compute_timeout(&self) -> Duration;

    /// Accumulation logic, invoked serially on the coordinator per partial
    /// output. Outputs arrive as an unordered multiset; accumulation must be
    /// order-agnostic.
    fn accumulate(&mut self, output: BinaryData);

    /// Render the final result to the request's output sink. Invoked once,
    /// only when every partial emitted by `partition` has been accumulated.
    fn finalize(&mut self, start: Instant);
}
