//! Parser for the subset of GDB Remote Serial Protocol packets this
//! server dispatches, per the packet table in the component design.
//! Operates on already-unescaped payload bytes handed up by
//! [`crate::rsp::framing`].

pub(crate) mod query;
mod util;
pub(crate) mod v_packet;

use nom::{
    branch::alt,
    bytes::complete::{tag, take},
    character::complete::char,
    combinator::{opt, value},
    multi::many0,
    number::complete::hex_u32,
    sequence::preceded,
    IResult,
};

use anyhow::{anyhow, Result};
use query::{query_packet, set_packet};
use v_packet::v_packet;

pub use query::{Pid, QueryPacket, SetPacket, TransferOperation};
use util::hex_u32_le;
pub use v_packet::{ContAction, ResumeVerb, VPacket};

#[derive(Debug, PartialEq, Clone)]
pub enum Packet {
    /// `?`
    HaltReason,
    /// `g`
    ReadGeneralRegisters,
    /// `G`
    WriteGeneralRegisters { reg_values: Vec<u32> },
    /// `H c|g tid`
    SelectThread { for_continue: bool, tid: i64 },
    /// `T tid`
    ThreadAlive(i64),
    /// `m`
    ReadMemory { address: u32, length: u32 },
    /// `M`
    WriteMemory { address: u32, data: Vec<u8> },
    /// `X`
    WriteMemoryBinary { address: u32, data: Vec<u8> },
    /// `p`
    ReadRegister(u32),
    /// `P`
    WriteRegister { index: u32, value: u32 },
    /// `c[addr]`
    Continue(Option<u32>),
    /// `C sig[;addr]`
    ContinueSignal(u8, Option<u32>),
    /// `s[addr]`
    Step(Option<u32>),
    /// `S sig[;addr]`
    StepSignal(u8, Option<u32>),
    /// `D`
    Detach,
    /// `k`
    Kill,
    /// `R`
    Restart,
    /// `q...`
    Query(QueryPacket),
    /// `Q...`
    Set(SetPacket),
    /// `v...`
    V(VPacket),
    /// `z0 addr,len`
    RemoveBreakpoint { address: u32, len: u32 },
    /// `Z0 addr,len`
    InsertBreakpoint { address: u32, len: u32 },
    /// `F<ret>,<errno>` or `F<ret>,<errno>,C` (the `C` form means abort)
    FileIoReply { ret: i64, errno: i64 },
    /// Raw `0x03`
    Interrupt,
}

pub fn parse_packet(input: &[u8]) -> Result<Packet> {
    // nom's `alt` only implements tuples up to 21 long; split the
    // dispatch table into two groups to stay under that.
    let parse_result = alt((
        alt((
            halt_reason,
            read_general_registers,
            write_general_registers,
            select_thread,
            thread_alive,
            read_memory,
            write_memory,
            write_memory_binary,
            read_register,
            write_register,
            continue_packet,
        )),
        alt((
            step_packet,
            detach,
            kill,
            restart,
            query,
            set,
            v,
            insert_breakpoint,
            remove_breakpoint,
            file_io_reply,
            ctrl_c_interrupt,
        )),
    ))(input);

    match parse_result {
        Ok((_remaining, packet)) => Ok(packet),
        Err(e) => Err(anyhow!("{}", e)),
    }
}

fn halt_reason(input: &[u8]) -> IResult<&[u8], Packet> {
    value(Packet::HaltReason, char('?'))(input)
}

fn read_general_registers(input: &[u8]) -> IResult<&[u8], Packet> {
    value(Packet::ReadGeneralRegisters, char('g'))(input)
}

fn write_general_registers(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('G')(input)?;
    let (input, reg_values) = many0(hex_u32_le)(input)?;
    Ok((input, Packet::WriteGeneralRegisters { reg_values }))
}

fn select_thread(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('H')(input)?;
    let (input, op) = alt((char('c'), char('g')))(input)?;
    let (input, tid) = signed_hex_tid(input)?;
    Ok((
        input,
        Packet::SelectThread {
            for_continue: op == 'c',
            tid,
        },
    ))
}

fn thread_alive(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('T')(input)?;
    let (input, tid) = signed_hex_tid(input)?;
    Ok((input, Packet::ThreadAlive(tid)))
}

/// `H`/`T` tids may be `-1` (all threads); parse the optional sign
/// before the hex digits.
fn signed_hex_tid(input: &[u8]) -> IResult<&[u8], i64> {
    let (input, neg) = opt(char('-'))(input)?;
    let (input, v) = hex_u32(input)?;
    Ok((input, if neg.is_some() { -(v as i64) } else { v as i64 }))
}

fn read_register(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('p')(input)?;
    let (input, n) = hex_u32(input)?;
    Ok((input, Packet::ReadRegister(n)))
}

fn write_register(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('P')(input)?;
    let (input, index) = hex_u32(input)?;
    let (input, _) = char('=')(input)?;
    let (input, value) = hex_u32_le(input)?;
    Ok((input, Packet::WriteRegister { index, value }))
}

fn query(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('q')(input)?;
    let (input, packet) = query_packet(input)?;
    Ok((input, Packet::Query(packet)))
}

fn set(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('Q')(input)?;
    let (input, packet) = set_packet(input)?;
    Ok((input, Packet::Set(packet)))
}

fn v(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('v')(input)?;
    let (input, packet) = v_packet(input)?;
    Ok((input, Packet::V(packet)))
}

fn read_memory(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('m')(input)?;
    let (input, address) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, length) = hex_u32(input)?;
    Ok((input, Packet::ReadMemory { address, length }))
}

fn write_memory(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('M')(input)?;
    let (input, address) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, _length) = hex_u32(input)?;
    let (input, _) = char(':')(input)?;
    let (input, data) = util::hex_bytes(input)?;
    Ok((input, Packet::WriteMemory { address, data }))
}

fn write_memory_binary(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('X')(input)?;
    let (input, address) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, length) = hex_u32(input)?;
    let (input, _) = char(':')(input)?;
    let (input, data) = take(length)(input)?;
    Ok((
        input,
        Packet::WriteMemoryBinary {
            address,
            data: data.to_owned(),
        },
    ))
}

fn continue_packet(input: &[u8]) -> IResult<&[u8], Packet> {
    alt((
        |input| {
            let (input, _) = char('C')(input)?;
            let (input, sig) = util::hex_byte(input)?;
            let (input, addr) = opt(preceded(char(';'), hex_u32))(input)?;
            Ok((input, Packet::ContinueSignal(sig, addr)))
        },
        |input| {
            let (input, _) = char('c')(input)?;
            let (input, addr) = opt(hex_u32)(input)?;
            Ok((input, Packet::Continue(addr)))
        },
    ))(input)
}

fn step_packet(input: &[u8]) -> IResult<&[u8], Packet> {
    alt((
        |input| {
            let (input, _) = char('S')(input)?;
            let (input, sig) = util::hex_byte(input)?;
            let (input, addr) = opt(preceded(char(';'), hex_u32))(input)?;
            Ok((input, Packet::StepSignal(sig, addr)))
        },
        |input| {
            let (input, _) = char('s')(input)?;
            let (input, addr) = opt(hex_u32)(input)?;
            Ok((input, Packet::Step(addr)))
        },
    ))(input)
}

fn detach(input: &[u8]) -> IResult<&[u8], Packet> {
    value(Packet::Detach, char('D'))(input)
}

fn kill(input: &[u8]) -> IResult<&[u8], Packet> {
    value(Packet::Kill, char('k'))(input)
}

fn restart(input: &[u8]) -> IResult<&[u8], Packet> {
    value(Packet::Restart, char('R'))(input)
}

fn breakpoint_len(input: &[u8]) -> IResult<&[u8], (u32, u32)> {
    let (input, address) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, len) = hex_u32(input)?;
    Ok((input, (address, len)))
}

fn insert_breakpoint(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = tag("Z0,")(input)?;
    let (input, (address, len)) = breakpoint_len(input)?;
    Ok((input, Packet::InsertBreakpoint { address, len }))
}

fn remove_breakpoint(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = tag("z0,")(input)?;
    let (input, (address, len)) = breakpoint_len(input)?;
    Ok((input, Packet::RemoveBreakpoint { address, len }))
}

fn file_io_reply(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = char('F')(input)?;
    let (input, ret_neg) = opt(char('-'))(input)?;
    let (input, ret) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, errno) = hex_u32(input)?;
    let ret = if ret_neg.is_some() { -(ret as i64) } else { ret as i64 };
    Ok((
        input,
        Packet::FileIoReply {
            ret,
            errno: errno as i64,
        },
    ))
}

fn ctrl_c_interrupt(input: &[u8]) -> IResult<&[u8], Packet> {
    let (input, _) = tag([0x03])(input)?;
    Ok((input, Packet::Interrupt))
}

#[cfg(test)]
mod test {
    use super::*;

    const EMPTY: &[u8] = &[];

    #[test]
    fn parse_simple_packets() {
        let test_data = [
            ("?", Packet::HaltReason),
            ("g", Packet::ReadGeneralRegisters),
            ("D", Packet::Detach),
            ("k", Packet::Kill),
            ("R", Packet::Restart),
        ];
        for (input, expected) in test_data.iter() {
            assert_eq!(parse_packet(input.as_bytes()).unwrap(), *expected);
        }
    }

    #[test]
    fn parse_select_thread() {
        assert_eq!(
            parse_packet(b"Hc65").unwrap(),
            Packet::SelectThread {
                for_continue: true,
                tid: 0x65,
            }
        );
        assert_eq!(
            parse_packet(b"Hg-1").unwrap(),
            Packet::SelectThread {
                for_continue: false,
                tid: -1,
            }
        );
    }

    #[test]
    fn parse_thread_alive() {
        assert_eq!(parse_packet(b"T65").unwrap(), Packet::ThreadAlive(0x65));
    }

    #[test]
    fn parse_read_memory() {
        assert_eq!(
            parse_packet(b"m1000,4").unwrap(),
            Packet::ReadMemory {
                address: 0x1000,
                length: 4,
            }
        );
    }

    #[test]
    fn parse_write_memory_ascii() {
        assert_eq!(
            parse_packet(b"M7fffffff,4:deadbeef").unwrap(),
            Packet::WriteMemory {
                address: 0x7fff_ffff,
                data: vec![0xde, 0xad, 0xbe, 0xef],
            }
        );
    }

    #[test]
    fn parse_insert_and_remove_breakpoint() {
        assert_eq!(
            parse_packet(b"Z0,1000,2").unwrap(),
            Packet::InsertBreakpoint { address: 0x1000, len: 2 }
        );
        assert_eq!(
            parse_packet(b"z0,1000,2").unwrap(),
            Packet::RemoveBreakpoint { address: 0x1000, len: 2 }
        );
    }

    #[test]
    fn parse_read_register_hex() {
        assert_eq!(parse_packet(b"p0").unwrap(), Packet::ReadRegister(0));
    }

    #[test]
    fn parse_query_command() {
        assert_eq!(
            query(b"qRcmd,776f726b67726f75702030203020322032").unwrap(),
            (
                EMPTY,
                Packet::Query(QueryPacket::Command(b"workgroup 0 0 2 2".to_vec()))
            )
        );
    }

    #[test]
    fn parse_non_stop_set() {
        assert_eq!(
            parse_packet(b"QNonStop:1").unwrap(),
            Packet::Set(SetPacket::NonStop(true))
        );
    }

    #[test]
    fn parse_file_io_reply() {
        assert_eq!(
            parse_packet(b"F0,0").unwrap(),
            Packet::FileIoReply { ret: 0, errno: 0 }
        );
        assert_eq!(
            parse_packet(b"F-1,2").unwrap(),
            Packet::FileIoReply { ret: -1, errno: 2 }
        );
    }

    #[test]
    fn parse_interrupt() {
        assert_eq!(parse_packet(&[0x03]).unwrap(), Packet::Interrupt);
    }

    #[test]
    fn parse_v_cont_through_top_level() {
        assert_eq!(
            parse_packet(b"vCont;c:65").unwrap(),
            Packet::V(VPacket::Cont(vec![ContAction {
                verb: ResumeVerb::Continue,
                tid: Some(0x65),
            }]))
        );
    }
}
