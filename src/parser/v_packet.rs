//! `v`-prefixed packets: multi-thread resume, attach, restart, and the
//! non-stop notification-drain handshake.

use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::char,
    combinator::{map, opt, value},
    multi::separated_list,
    number::complete::hex_u32,
    sequence::preceded,
    IResult,
};

#[derive(Debug, PartialEq, Clone)]
pub enum VPacket {
    Attach(u32),
    Cont(Vec<ContAction>),
    QueryContSupport,
    Run(Option<Vec<u8>>),
    Stopped,
    Unknown(Vec<u8>),
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum ResumeVerb {
    Continue,
    ContinueSignal(u8),
    Step,
    StepSignal(u8),
    Stop,
}

#[derive(Debug, PartialEq, Clone)]
pub struct ContAction {
    pub verb: ResumeVerb,
    /// `None` applies to every thread not otherwise addressed; matches
    /// the `vCont` convention of a trailing default action.
    pub tid: Option<i64>,
}

pub fn v_packet(input: &[u8]) -> IResult<&[u8], VPacket> {
    let parse_result = alt((v_cont_support, v_cont, v_attach, v_run, v_stopped))(input);

    match parse_result {
        Ok((input, packet)) => Ok((input, packet)),
        Err(nom::Err::Error(_)) => Ok((&[], VPacket::Unknown(input.to_owned()))),
        Err(other) => Err(other),
    }
}

fn v_cont_support(input: &[u8]) -> IResult<&[u8], VPacket> {
    let (input, _) = tag("Cont?")(input)?;
    Ok((input, VPacket::QueryContSupport))
}

fn v_cont(input: &[u8]) -> IResult<&[u8], VPacket> {
    let (input, _) = tag("Cont;")(input)?;
    let (input, actions) = separated_list(char(';'), cont_action)(input)?;
    Ok((input, VPacket::Cont(actions)))
}

fn cont_action(input: &[u8]) -> IResult<&[u8], ContAction> {
    let (input, verb) = resume_verb(input)?;
    let (input, tid) = opt(preceded(char(':'), tid))(input)?;
    Ok((input, ContAction { verb, tid }))
}

fn resume_verb(input: &[u8]) -> IResult<&[u8], ResumeVerb> {
    alt((
        map(preceded(char('C'), hex_byte), ResumeVerb::ContinueSignal),
        value(ResumeVerb::Continue, char('c')),
        map(preceded(char('S'), hex_byte), ResumeVerb::StepSignal),
        value(ResumeVerb::Step, char('s')),
        value(ResumeVerb::Stop, char('t')),
    ))(input)
}

fn hex_byte(input: &[u8]) -> IResult<&[u8], u8> {
    let (input, v) = hex_u32(input)?;
    Ok((input, v as u8))
}

fn tid(input: &[u8]) -> IResult<&[u8], i64> {
    let (input, v) = hex_u32(input)?;
    Ok((input, v as i64))
}

fn v_attach(input: &[u8]) -> IResult<&[u8], VPacket> {
    let (input, _) = tag("Attach;")(input)?;
    let (input, pid) = hex_u32(input)?;
    Ok((input, VPacket::Attach(pid)))
}

fn v_run(input: &[u8]) -> IResult<&[u8], VPacket> {
    let (input, _) = tag("Run;")(input)?;
    let filename = if input.is_empty() { None } else { Some(input.to_owned()) };
    Ok((&[], VPacket::Run(filename)))
}

fn v_stopped(input: &[u8]) -> IResult<&[u8], VPacket> {
    let (input, _) = tag("Stopped")(input)?;
    Ok((input, VPacket::Stopped))
}

#[cfg(test)]
mod test {
    use super::*;

    const EMPTY: &[u8] = &[];

    #[test]
    fn parse_v_cont_support() {
        assert_eq!(v_packet(b"Cont?").unwrap(), (EMPTY, VPacket::QueryContSupport));
    }

    #[test]
    fn parse_v_cont_single_action_with_tid() {
        assert_eq!(
            v_packet(b"Cont;c:65").unwrap(),
            (
                EMPTY,
                VPacket::Cont(vec![ContAction {
                    verb: ResumeVerb::Continue,
                    tid: Some(0x65),
                }])
            )
        );
    }

    #[test]
    fn parse_v_cont_multiple_actions() {
        assert_eq!(
            v_packet(b"Cont;s:65;c").unwrap(),
            (
                EMPTY,
                VPacket::Cont(vec![
                    ContAction {
                        verb: ResumeVerb::Step,
                        tid: Some(0x65),
                    },
                    ContAction {
                        verb: ResumeVerb::Continue,
                        tid: None,
                    },
                ])
            )
        );
    }

    #[test]
    fn parse_v_attach() {
        assert_eq!(v_packet(b"Attach;1").unwrap(), (EMPTY, VPacket::Attach(1)));
    }

    #[test]
    fn parse_v_stopped() {
        assert_eq!(v_packet(b"Stopped").unwrap(), (EMPTY, VPacket::Stopped));
    }

    #[test]
    fn unknown_v_packet_is_preserved() {
        assert_eq!(
            v_packet(b"MustReplyEmpty").unwrap(),
            (EMPTY, VPacket::Unknown(b"MustReplyEmpty".to_vec()))
        );
    }
}
