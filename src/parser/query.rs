//! `q`/`Q` packet bodies relevant to the mesh dispatcher: capability
//! negotiation, the OS-info/thread-list annexes, monitor commands, and
//! the non-stop mode switch.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_until},
    character::complete::char,
    combinator::opt,
    number::complete::hex_u32,
    sequence::preceded,
    IResult,
};

use super::util::hex_bytes;

pub type Pid = u32;

#[derive(Debug, PartialEq, Clone)]
pub enum QueryPacket {
    /// `qC`
    CurrentThread,
    /// `qAttached[:pid]`
    Attached(Option<Pid>),
    /// `qRcmd,<hex command>`
    Command(Vec<u8>),
    /// `qSupported[:features]`
    Supported(Vec<Vec<u8>>),
    /// `qXfer:<object>:<op>`
    Transfer {
        object: Vec<u8>,
        operation: TransferOperation,
    },
}

#[derive(Debug, PartialEq, Clone)]
pub enum TransferOperation {
    Read { annex: Vec<u8>, offset: u32, length: u32 },
    Write { annex: Vec<u8>, offset: u32, data: Vec<u8> },
}

/// The `Q`-prefixed (as opposed to `q`-prefixed) set: currently only
/// the non-stop mode switch.
#[derive(Debug, PartialEq, Clone)]
pub enum SetPacket {
    NonStop(bool),
}

fn pid(input: &[u8]) -> IResult<&[u8], Pid> {
    hex_u32(input)
}

pub fn query_packet(input: &[u8]) -> IResult<&[u8], QueryPacket> {
    alt((
        query_current_thread,
        query_attached,
        query_command,
        query_supported,
        query_transfer,
    ))(input)
}

pub fn set_packet(input: &[u8]) -> IResult<&[u8], SetPacket> {
    non_stop(input)
}

fn non_stop(input: &[u8]) -> IResult<&[u8], SetPacket> {
    let (input, _) = tag("NonStop:")(input)?;
    let (input, flag) = alt((char('0'), char('1')))(input)?;
    Ok((input, SetPacket::NonStop(flag == '1')))
}

fn query_current_thread(input: &[u8]) -> IResult<&[u8], QueryPacket> {
    let (input, _) = char('C')(input)?;
    Ok((input, QueryPacket::CurrentThread))
}

fn query_command(input: &[u8]) -> IResult<&[u8], QueryPacket> {
    let (input, _) = tag("Rcmd,")(input)?;
    let (input, command) = hex_bytes(input)?;
    Ok((input, QueryPacket::Command(command)))
}

fn query_attached(input: &[u8]) -> IResult<&[u8], QueryPacket> {
    let (input, _) = tag("Attached")(input)?;
    let (input, pid) = opt(preceded(char(':'), pid))(input)?;
    Ok((input, QueryPacket::Attached(pid)))
}

fn query_supported(input: &[u8]) -> IResult<&[u8], QueryPacket> {
    let (input, _) = tag("Supported")(input)?;
    let (input, rest) = nom::combinator::rest(input)?;
    let features = if rest.first() == Some(&b':') {
        rest[1..]
            .split(|&b| b == b';')
            .map(|s| s.to_vec())
            .collect()
    } else {
        vec![]
    };
    Ok((input, QueryPacket::Supported(features)))
}

fn query_transfer(input: &[u8]) -> IResult<&[u8], QueryPacket> {
    let (input, _) = tag("Xfer")(input)?;
    let (input, _) = char(':')(input)?;
    let (input, object) = take_until(":")(input)?;
    let (input, _) = char(':')(input)?;
    let (input, operation) = alt((transfer_operation_read, transfer_operation_write))(input)?;
    Ok((
        input,
        QueryPacket::Transfer {
            object: object.to_owned(),
            operation,
        },
    ))
}

fn transfer_operation_read(input: &[u8]) -> IResult<&[u8], TransferOperation> {
    let (input, _) = tag("read")(input)?;
    let (input, _) = char(':')(input)?;
    let (input, annex) = take_until(":")(input)?;
    let (input, _) = char(':')(input)?;
    let (input, offset) = hex_u32(input)?;
    let (input, _) = char(',')(input)?;
    let (input, length) = hex_u32(input)?;
    Ok((
        input,
        TransferOperation::Read {
            annex: annex.to_owned(),
            offset,
            length,
        },
    ))
}

fn transfer_operation_write(input: &[u8]) -> IResult<&[u8], TransferOperation> {
    let (input, _) = tag("write")(input)?;
    let (input, annex) = take_until(":")(input)?;
    let (input, _) = char(':')(input)?;
    let (input, offset) = hex_u32(input)?;
    let (input, _) = char(':')(input)?;
    Ok((
        &[],
        TransferOperation::Write {
            annex: annex.to_owned(),
            offset,
            data: input.to_owned(),
        },
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    const EMPTY: &[u8] = &[];

    #[test]
    fn parse_current_thread() {
        assert_eq!(query_packet(b"C").unwrap(), (EMPTY, QueryPacket::CurrentThread));
    }

    #[test]
    fn parse_monitor_command() {
        assert_eq!(
            query_packet(b"Rcmd,776f726b67726f75702030203020322032").unwrap(),
            (EMPTY, QueryPacket::Command(b"workgroup 0 0 2 2".to_vec()))
        );
    }

    #[test]
    fn parse_attached_with_pid() {
        assert_eq!(
            query_packet(b"Attached:02").unwrap(),
            (EMPTY, QueryPacket::Attached(Some(2)))
        );
    }

    #[test]
    fn parse_xfer_threads_read() {
        assert_eq!(
            query_packet(b"Xfer:threads:read::0,1000").unwrap(),
            (
                EMPTY,
                QueryPacket::Transfer {
                    object: b"threads".to_vec(),
                    operation: TransferOperation::Read {
                        annex: vec![],
                        offset: 0,
                        length: 0x1000,
                    }
                }
            )
        );
    }

    #[test]
    fn parse_non_stop_switch() {
        assert_eq!(set_packet(b"NonStop:1").unwrap(), (EMPTY, SetPacket::NonStop(true)));
        assert_eq!(set_packet(b"NonStop:0").unwrap(), (EMPTY, SetPacket::NonStop(false)));
    }
}
