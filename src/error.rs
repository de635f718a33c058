// error.rs — error taxonomy for the consistency check pipeline.
//
// Every backend status is checked at the call site and mapped into one of
// these variants; public operations return `Result<_, Error>` rather than
// unwinding. Failures carry enough context (operand names, device name,
// build log) to diagnose them from the log alone.

use std::fmt;

use thiserror::Error;

/// Per-buffer outcome of a device buffer reallocation.
///
/// `GpuConsistencyCheck::resize` allocates the four working buffers one at a
/// time and stops at the first failure without rolling back the ones that
/// already succeeded. The report records exactly which allocations went
/// through, so callers can observe the partial state and a stricter
/// implementation could later add all-or-nothing semantics without changing
/// the error shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AllocationReport {
    pub left_in: bool,
    pub right_in: bool,
    pub left_out: bool,
    pub right_out: bool,
}

impl AllocationReport {
    /// Number of buffers that were successfully allocated (0..=4).
    pub fn succeeded(&self) -> usize {
        [self.left_in, self.right_in, self.left_out, self.right_out]
            .iter()
            .filter(|&&ok| ok)
            .count()
    }
}

impl fmt::Display for AllocationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mark = |ok: bool| if ok { "ok" } else { "failed" };
        write!(
            f,
            "left_in: {}, right_in: {}, left_out: {}, right_out: {}",
            mark(self.left_in),
            mark(self.right_in),
            mark(self.left_out),
            mark(self.right_out),
        )
    }
}

/// Errors from device selection, program building, and engine operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Kernel source file is missing, unreadable, or empty. Checked before
    /// any compilation is attempted.
    #[error("cannot read kernel source {path}: {reason}")]
    SourceUnreadable { path: String, reason: String },

    /// Device-side shader compilation failed. The log is the backend's
    /// diagnostic output, tagged with the device it came from. Not
    /// recoverable; the compilation attempt must be abandoned.
    #[error("error building kernel source for {device}; build log:\n{log}")]
    BuildFailure { device: String, log: String },

    /// The compiled module does not expose the requested entry point (or its
    /// interface does not match the argument layout).
    #[error(
        "error creating the kernel `{entry_point}`: {log}\n\
         Check that you have not misspelled the name of the entry point."
    )]
    KernelResolution { entry_point: String, log: String },

    /// Device enumeration for the requested class came back empty.
    #[error("there are no devices of class {class} available")]
    NoMatchingDevice { class: String },

    /// The selected adapter refused the device request.
    #[error("device request failed on {device}: {reason}")]
    DeviceRequest { device: String, reason: String },

    /// One of the four working buffers failed to allocate. Buffers that were
    /// allocated before the failure are kept; see [`AllocationReport`].
    #[error("buffer allocation failed on {device} ({report}): {log}")]
    Allocation {
        device: String,
        report: AllocationReport,
        log: String,
    },

    /// Binding the kernel arguments to the freshly allocated buffers failed.
    #[error("kernel argument binding failed: {log}")]
    ArgumentBind { log: String },

    /// Two of the four images disagree on geometry. Both operands are named;
    /// no device work is performed when this is raised.
    #[error(
        "dimension mismatch: {first} is {first_width}x{first_height} \
         but {second} is {second_width}x{second_height}"
    )]
    DimensionMismatch {
        first: &'static str,
        first_width: usize,
        first_height: usize,
        second: &'static str,
        second_width: usize,
        second_height: usize,
    },

    /// A host/device transfer failed. Operations enqueued before the failure
    /// are not rolled back.
    #[error("transfer of {operand} failed: {log}")]
    Transfer { operand: &'static str, log: String },

    /// Enqueueing or running the kernel launch failed.
    #[error("kernel dispatch failed: {log}")]
    Dispatch { log: String },

    /// `set_tolerance` was called on an engine built with compiled-in
    /// constants. The tolerance is baked into the program; changing it
    /// requires building a new engine.
    #[error(
        "tolerance is compiled into the kernel (currently {compiled}); \
         rebuild the engine to change it"
    )]
    ToleranceIsCompiled { compiled: u16 },
}
