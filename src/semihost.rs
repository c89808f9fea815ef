//! Trap/semi-hosting dispatch: deciding what a `TRAP` instruction means
//! and, for the host-file-I/O traps, building the `F<call>,...` request
//! the client answers.

use crate::error::MeshResult;
use crate::mmio::DeviceDriver;
use crate::target::Target;
use crate::thread::Thread;

/// Trap numbers carried in the high bits of a `TRAP` instruction, per
/// the component design's semi-hosting table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    Write,
    Read,
    Open,
    Close,
    Exit,
    Pass,
    Fail,
    Syscall,
    Unknown(u8),
}

impl TrapKind {
    pub fn from_number(n: u8) -> Self {
        match n {
            0 => TrapKind::Write,
            1 => TrapKind::Read,
            2 => TrapKind::Open,
            3 => TrapKind::Exit,
            4 => TrapKind::Pass,
            5 => TrapKind::Fail,
            6 => TrapKind::Close,
            7 => TrapKind::Syscall,
            other => TrapKind::Unknown(other),
        }
    }

    /// Whether this trap needs a round-trip through the client (an `F`
    /// request/reply pair) before the thread can resume.
    pub fn needs_host_reply(self) -> bool {
        matches!(
            self,
            TrapKind::Write | TrapKind::Read | TrapKind::Open | TrapKind::Close | TrapKind::Syscall
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallNumber {
    Open,
    Close,
    Read,
    Write,
    Lseek,
    Unlink,
    Stat,
    Fstat,
    Unknown(u32),
}

impl SyscallNumber {
    pub fn from_r3(r3: u32) -> Self {
        match r3 {
            0 => SyscallNumber::Open,
            1 => SyscallNumber::Close,
            2 => SyscallNumber::Read,
            3 => SyscallNumber::Write,
            4 => SyscallNumber::Lseek,
            5 => SyscallNumber::Unlink,
            6 => SyscallNumber::Stat,
            7 => SyscallNumber::Fstat,
            other => SyscallNumber::Unknown(other),
        }
    }
}

/// Build the `F<call>,arg1,arg2,...` payload (without the leading `F`
/// already handled by the framer) for a WRITE/READ/OPEN/CLOSE trap,
/// marshalling R0/R1/R2 as GDB's File-I/O extension expects.
pub fn build_host_request<D: DeviceDriver>(
    target: &mut Target<D>,
    thread: &Thread,
    kind: TrapKind,
) -> MeshResult<Vec<u8>> {
    let r0 = thread.read_reg(target, 0)?;
    let r1 = thread.read_reg(target, 1)?;
    let r2 = thread.read_reg(target, 2)?;

    let body = match kind {
        TrapKind::Write => format!("write,{r0:x},{r1:x},{r2:x}"),
        TrapKind::Read => format!("read,{r0:x},{r1:x},{r2:x}"),
        TrapKind::Open => {
            let len = read_cstring(target, thread, r0)?.len();
            format!("open,{r0:x}/{len:x},{r1:x},{r2:x}")
        }
        TrapKind::Close => format!("close,{r0:x}"),
        _ => unreachable!("build_host_request called for a trap that does not need a host reply"),
    };
    Ok(body.into_bytes())
}

/// Build the `F<call>,...` request for a trap-7 `SYSCALL`, whose actual
/// operation is selected by `R3` (a `SyscallNumber`) rather than by the
/// trap opcode itself. Path arguments are resolved through target memory
/// the same way `OPEN` does above. An unrecognised syscall number has no
/// `F` analogue; the caller falls back to reporting `SIGSYS`.
pub fn build_syscall_request<D: DeviceDriver>(target: &mut Target<D>, thread: &Thread) -> MeshResult<Option<Vec<u8>>> {
    let r0 = thread.read_reg(target, 0)?;
    let r1 = thread.read_reg(target, 1)?;
    let r2 = thread.read_reg(target, 2)?;
    let r3 = thread.read_reg(target, 3)?;

    let body = match SyscallNumber::from_r3(r3) {
        SyscallNumber::Open => {
            let len = read_cstring(target, thread, r0)?.len();
            format!("open,{r0:x}/{len:x},{r1:x},{r2:x}")
        }
        SyscallNumber::Close => format!("close,{r0:x}"),
        SyscallNumber::Read => format!("read,{r0:x},{r1:x},{r2:x}"),
        SyscallNumber::Write => format!("write,{r0:x},{r1:x},{r2:x}"),
        SyscallNumber::Lseek => format!("lseek,{r0:x},{r1:x},{r2:x}"),
        SyscallNumber::Unlink => {
            let len = read_cstring(target, thread, r0)?.len();
            format!("unlink,{r0:x}/{len:x}")
        }
        SyscallNumber::Stat => {
            let len = read_cstring(target, thread, r0)?.len();
            format!("stat,{r0:x}/{len:x},{r1:x}")
        }
        SyscallNumber::Fstat => format!("fstat,{r0:x},{r1:x}"),
        SyscallNumber::Unknown(_) => return Ok(None),
    };
    Ok(Some(body.into_bytes()))
}

/// Deliver a client's `F<ret>,<errno>` reply to R0/R3 and resume the
/// thread that was waiting on it. A malformed reply is logged and the
/// thread is resumed anyway rather than stranded (per the error
/// handling design's semi-hosting policy).
pub fn deliver_reply<D: DeviceDriver>(
    target: &mut Target<D>,
    thread: &mut Thread,
    ret: i64,
    errno: i64,
) -> MeshResult<()> {
    thread.write_reg(target, 0, ret as u32)?;
    thread.write_reg(target, 3, errno as u32)?;
    thread.resume(target)?;
    Ok(())
}

/// Read a NUL-terminated string out of core memory, used to resolve
/// filename arguments for `OPEN`/`SYSCALL` traps.
pub fn read_cstring<D: DeviceDriver>(target: &mut Target<D>, thread: &Thread, addr: u32) -> MeshResult<Vec<u8>> {
    const MAX_LEN: u32 = 1024;
    let mut out = Vec::new();
    for i in 0..MAX_LEN {
        let byte = thread.read_mem8(target, addr + i)?;
        if byte == 0 {
            break;
        }
        out.push(byte);
    }
    Ok(out)
}
