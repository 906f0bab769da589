//! Kernel error taxonomy.
//!
//! The error model follows spec.md §7: resource exhaustion and contract
//! violations are recoverable at the call boundary (return a code, never
//! panic); hardware faults that are not demand-fillable and real-time
//! admission failures are reported through their own variants so callers
//! can distinguish "retry" from "this task will never run".

use core::fmt;

/// Top-level kernel error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// An allocator (buddy pool, page map, kmalloc) had no block of the
    /// requested order/size. Callers increment the subsystem's alloc-fail
    /// counter and return; this is never a panic.
    OutOfMemory { requested: usize, available: usize },
    /// Caller passed an address outside the valid range for the operation
    /// (e.g. `free` outside the pool, `do_small_mapping` into a reserved
    /// region).
    InvalidAddress { addr: usize },
    /// `free`/`release_pages` was asked to operate on a page/chunk that is
    /// already free (double-free) or whose magic word doesn't match
    /// (wild pointer). The operation is ignored, not retried.
    ContractViolation { addr: usize, reason: ContractError },
    /// SRMMU data-access exception that is not demand-fillable (spec.md
    /// §4.4): NULL dereference, reserved-region access, highmem access, or
    /// a fault type other than `invalid_addr`. Fatal by contract.
    HardwareFault {
        fault_addr: usize,
        status: FaultStatus,
    },
    /// A SpaceWire link or DMA error surfaced past its bounded retry.
    DriverError { device: &'static str, code: u32 },
    /// EDF admission test failed: no CPU satisfies the utilisation bound or
    /// the head/tail slack check.
    AdmissionFailed(AdmissionError),
    /// `sched_set_attr` requested a policy/attribute combination the
    /// scheduler rejects.
    InvalidSchedAttr,
    /// Generic not-found for registries (symbol tables, tracker op-codes,
    /// sysctl attributes).
    NotFound { resource: &'static str },
    /// Operation would block and the caller asked for non-blocking
    /// semantics.
    WouldBlock,
    /// Feature intentionally unimplemented (spec.md §1 Non-goals).
    NotSupported { operation: &'static str },
}

/// Reasons a caller-supplied pointer/address was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractError {
    Null,
    OutsideRange,
    DoubleFree,
    WildPointer,
    Misaligned,
}

/// SRMMU fault-status decode (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultStatus {
    NullDeref,
    ReservedRegion,
    HighmemAccess,
    /// `addr < ctx.sbrk`: resolvable by mapping a fresh page and resuming,
    /// not fatal.
    DemandFill,
    SystemBreakViolation,
    OtherFaultType,
}

impl FaultStatus {
    /// True for the one status the trap handler resolves by mapping a
    /// page and resuming; every other status is fatal by contract.
    pub fn is_demand_fillable(self) -> bool {
        matches!(self, FaultStatus::DemandFill)
    }
}

/// EDF admission failure reasons (spec.md §4.7a).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionError {
    WcetExceedsDeadline,
    UtilisationExceeded,
    SlackViolation,
    NoCpuQualifies,
}

pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory {
                requested,
                available,
            } => write!(
                f,
                "out of memory: requested {requested} bytes, {available} available"
            ),
            Self::InvalidAddress { addr } => write!(f, "invalid address 0x{addr:x}"),
            Self::ContractViolation { addr, reason } => {
                write!(f, "contract violation at 0x{addr:x}: {reason:?}")
            }
            Self::HardwareFault { fault_addr, status } => {
                write!(f, "hardware fault at 0x{fault_addr:x}: {status:?}")
            }
            Self::DriverError { device, code } => {
                write!(f, "driver error on {device}: 0x{code:x}")
            }
            Self::AdmissionFailed(e) => write!(f, "admission failed: {e:?}"),
            Self::InvalidSchedAttr => write!(f, "invalid scheduler attribute"),
            Self::NotFound { resource } => write!(f, "{resource} not found"),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::NotSupported { operation } => write!(f, "not supported: {operation}"),
        }
    }
}
