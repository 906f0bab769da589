//! Syscall dispatch table (spec.md §6 "Syscall table", L9): a fixed-size
//! table indexed by call number, delegating to a caller-supplied
//! [`SyscallContext`].
//!
//! Concrete file descriptors, process address spaces and a real GRSPW2
//! register block are board/BSP concerns (spec.md §1); this module only
//! owns the dispatch contract between a trap handler and those concerns,
//! the same "trait boundary instead of a global" shape as
//! [`crate::mm::heap::PageSource`] and [`crate::timer::ClockEventDevice`].

pub mod observer;

extern crate alloc;

use alloc::vec::Vec;

use crate::error::{KernelError, KernelResult};

/// Call numbers for the minimum syscall set (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum CallNo {
    Read = 0,
    Write = 1,
    Alloc = 2,
    Free = 3,
    GetTime = 4,
    NanoSleep = 5,
    Grspw2 = 6,
    ThreadCreate = 7,
    SchedYield = 8,
    Watchdog = 9,
    LoadProgramSegment = 10,
    Sysctl = 11,
}

pub const CALL_COUNT: usize = 12;

impl CallNo {
    fn from_raw(raw: u32) -> KernelResult<Self> {
        Ok(match raw {
            0 => Self::Read,
            1 => Self::Write,
            2 => Self::Alloc,
            3 => Self::Free,
            4 => Self::GetTime,
            5 => Self::NanoSleep,
            6 => Self::Grspw2,
            7 => Self::ThreadCreate,
            8 => Self::SchedYield,
            9 => Self::Watchdog,
            10 => Self::LoadProgramSegment,
            11 => Self::Sysctl,
            _ => {
                return Err(KernelError::NotFound {
                    resource: "syscall",
                })
            }
        })
    }
}

/// `nanosleep`'s deadline, absolute or relative to `gettime()` at call time
/// (spec.md §6).
#[derive(Debug, Clone, Copy)]
pub enum SleepDeadline {
    Absolute(u64),
    Relative(u64),
}

/// Watchdog mode requested through `SYS_WATCHDOG` (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogMode {
    Disabled,
    Feed,
    SetPeriodNs(u64),
}

/// A syscall's argument payload, one variant per [`CallNo`].
#[derive(Debug, Clone)]
pub enum Request {
    Read { fd: i32, len: usize },
    Write { fd: i32, buf: Vec<u8> },
    Alloc { context: u32, size: usize },
    Free { context: u32, addr: usize },
    GetTime,
    NanoSleep(SleepDeadline),
    Grspw2 { op: u16, payload: Vec<u8> },
    ThreadCreate { entry: usize, priority: u8 },
    SchedYield,
    Watchdog(WatchdogMode),
    LoadProgramSegment { image: Vec<u8> },
    SysctlShow { path: &'static str },
    SysctlStore { path: &'static str, value: u64 },
}

/// A syscall's successful return payload.
#[derive(Debug, Clone)]
pub enum Response {
    Read(Vec<u8>),
    Write { written: usize },
    Alloc { addr: usize },
    Free,
    GetTime { now_ns: u64 },
    NanoSleep,
    Grspw2 { payload: Vec<u8> },
    ThreadCreate { tid: u64 },
    SchedYield,
    Watchdog,
    LoadProgramSegment { entry: usize },
    SysctlShow { value: u64 },
    SysctlStore,
}

/// The context a [`Dispatcher`] delegates to: per-process I/O, the
/// per-context heap, the GRSPW2 core, the scheduler, the watchdog timer,
/// the ELF loader and the sysctl tree, each reached through its own
/// narrow method rather than this trait reaching into kernel globals.
pub trait SyscallContext {
    fn read(&mut self, fd: i32, len: usize) -> KernelResult<Vec<u8>>;
    fn write(&mut self, fd: i32, buf: &[u8]) -> KernelResult<usize>;
    fn heap_alloc(&mut self, context: u32, size: usize) -> KernelResult<usize>;
    fn heap_free(&mut self, context: u32, addr: usize) -> KernelResult<()>;
    fn now_ns(&self) -> u64;
    fn nanosleep(&mut self, deadline: SleepDeadline) -> KernelResult<()>;
    fn grspw2(&mut self, op: u16, payload: &[u8]) -> KernelResult<Vec<u8>>;
    fn thread_create(&mut self, entry: usize, priority: u8) -> KernelResult<u64>;
    fn sched_yield(&mut self) -> KernelResult<()>;
    fn watchdog(&mut self, mode: WatchdogMode) -> KernelResult<()>;
    fn load_program_segment(&mut self, image: &[u8]) -> KernelResult<usize>;
    fn sysctl_show(&self, path: &'static str) -> KernelResult<u64>;
    fn sysctl_store(&mut self, path: &'static str, value: u64) -> KernelResult<()>;
}

/// Dispatches a [`Request`] to the matching [`SyscallContext`] method,
/// rejecting a call number that doesn't match the request's variant
/// (a caller-assembly-level contract violation, not a recoverable error).
pub fn dispatch(
    ctx: &mut dyn SyscallContext,
    call: u32,
    request: Request,
) -> KernelResult<Response> {
    let call = CallNo::from_raw(call)?;
    match (call, request) {
        (CallNo::Read, Request::Read { fd, len }) => Ok(Response::Read(ctx.read(fd, len)?)),
        (CallNo::Write, Request::Write { fd, buf }) => {
            Ok(Response::Write {
                written: ctx.write(fd, &buf)?,
            })
        }
        (CallNo::Alloc, Request::Alloc { context, size }) => Ok(Response::Alloc {
            addr: ctx.heap_alloc(context, size)?,
        }),
        (CallNo::Free, Request::Free { context, addr }) => {
            ctx.heap_free(context, addr)?;
            Ok(Response::Free)
        }
        (CallNo::GetTime, Request::GetTime) => Ok(Response::GetTime {
            now_ns: ctx.now_ns(),
        }),
        (CallNo::NanoSleep, Request::NanoSleep(deadline)) => {
            ctx.nanosleep(deadline)?;
            Ok(Response::NanoSleep)
        }
        (CallNo::Grspw2, Request::Grspw2 { op, payload }) => Ok(Response::Grspw2 {
            payload: ctx.grspw2(op, &payload)?,
        }),
        (CallNo::ThreadCreate, Request::ThreadCreate { entry, priority }) => {
            Ok(Response::ThreadCreate {
                tid: ctx.thread_create(entry, priority)?,
            })
        }
        (CallNo::SchedYield, Request::SchedYield) => {
            ctx.sched_yield()?;
            Ok(Response::SchedYield)
        }
        (CallNo::Watchdog, Request::Watchdog(mode)) => {
            ctx.watchdog(mode)?;
            Ok(Response::Watchdog)
        }
        (CallNo::LoadProgramSegment, Request::LoadProgramSegment { image }) => {
            Ok(Response::LoadProgramSegment {
                entry: ctx.load_program_segment(&image)?,
            })
        }
        (CallNo::Sysctl, Request::SysctlShow { path }) => Ok(Response::SysctlShow {
            value: ctx.sysctl_show(path)?,
        }),
        (CallNo::Sysctl, Request::SysctlStore { path, value }) => {
            ctx.sysctl_store(path, value)?;
            Ok(Response::SysctlStore)
        }
        _ => Err(KernelError::ContractViolation {
            addr: 0,
            reason: crate::error::ContractError::WildPointer,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::collections::BTreeMap;

    #[derive(Default)]
    struct FakeContext {
        heap: BTreeMap<usize, usize>,
        next_addr: usize,
        now_ns: u64,
        sysctl: BTreeMap<&'static str, u64>,
    }

    impl SyscallContext for FakeContext {
        fn read(&mut self, _fd: i32, len: usize) -> KernelResult<Vec<u8>> {
            Ok(alloc::vec![0u8; len])
        }
        fn write(&mut self, _fd: i32, buf: &[u8]) -> KernelResult<usize> {
            Ok(buf.len())
        }
        fn heap_alloc(&mut self, _context: u32, size: usize) -> KernelResult<usize> {
            self.next_addr += 4096;
            self.heap.insert(self.next_addr, size);
            Ok(self.next_addr)
        }
        fn heap_free(&mut self, _context: u32, addr: usize) -> KernelResult<()> {
            self.heap
                .remove(&addr)
                .map(|_| ())
                .ok_or(KernelError::ContractViolation {
                    addr,
                    reason: crate::error::ContractError::DoubleFree,
                })
        }
        fn now_ns(&self) -> u64 {
            self.now_ns
        }
        fn nanosleep(&mut self, _deadline: SleepDeadline) -> KernelResult<()> {
            Ok(())
        }
        fn grspw2(&mut self, _op: u16, payload: &[u8]) -> KernelResult<Vec<u8>> {
            Ok(payload.to_vec())
        }
        fn thread_create(&mut self, _entry: usize, _priority: u8) -> KernelResult<u64> {
            Ok(1)
        }
        fn sched_yield(&mut self) -> KernelResult<()> {
            Ok(())
        }
        fn watchdog(&mut self, _mode: WatchdogMode) -> KernelResult<()> {
            Ok(())
        }
        fn load_program_segment(&mut self, _image: &[u8]) -> KernelResult<usize> {
            Ok(0x4000_0000)
        }
        fn sysctl_show(&self, path: &'static str) -> KernelResult<u64> {
            self.sysctl.get(path).copied().ok_or(KernelError::NotFound {
                resource: "sysctl attribute",
            })
        }
        fn sysctl_store(&mut self, path: &'static str, value: u64) -> KernelResult<()> {
            self.sysctl.insert(path, value);
            Ok(())
        }
    }

    #[test]
    fn alloc_then_free_round_trips() {
        let mut ctx = FakeContext::default();
        let Response::Alloc { addr } =
            dispatch(&mut ctx, CallNo::Alloc as u32, Request::Alloc { context: 0, size: 64 })
                .unwrap()
        else {
            panic!("wrong response variant");
        };
        dispatch(&mut ctx, CallNo::Free as u32, Request::Free { context: 0, addr }).unwrap();
        assert!(ctx.heap.is_empty());
    }

    #[test]
    fn unknown_call_number_is_rejected() {
        assert!(dispatch(&mut FakeContext::default(), 99, Request::GetTime).is_err());
    }

    #[test]
    fn mismatched_request_variant_is_a_contract_violation() {
        let mut ctx = FakeContext::default();
        let err = dispatch(&mut ctx, CallNo::GetTime as u32, Request::SchedYield).unwrap_err();
        assert!(matches!(err, KernelError::ContractViolation { .. }));
    }

    #[test]
    fn sysctl_store_then_show_round_trips() {
        let mut ctx = FakeContext::default();
        dispatch(
            &mut ctx,
            CallNo::Sysctl as u32,
            Request::SysctlStore {
                path: "cpu_load",
                value: 42,
            },
        )
        .unwrap();
        let Response::SysctlShow { value } = dispatch(
            &mut ctx,
            CallNo::Sysctl as u32,
            Request::SysctlShow { path: "cpu_load" },
        )
        .unwrap() else {
            panic!("wrong response variant");
        };
        assert_eq!(value, 42);
    }
}
