//! Driver wire protocol.
//!
//! Every message leads with a one-byte signature; the rest of the frame is
//! length-prefixed by construction of its type. All integers are
//! little-endian and the layout is packed — that is protocol, not an
//! accident of memory layout.
//!
//! ```text
//! DRV_INFO      ┌─────┬───────────────┬──────────────────────────────────┐
//!               │ 01  │ commands: u32 │ commands × (name, descr, arity)    │
//!               └─────┴───────────────┴──────────────────────────────────┘
//!               name/descr are fixed NUL-padded slots of MAX+1 bytes.
//!
//! DRV_COMMAND   ┌─────┬──────────────┬───────────┬──────────────────────┐
//!               │ 02  │ cmd_idx: u32 │ argc: u32 │ argc × (len u8, data) │
//!               └─────┴──────────────┴───────────┴──────────────────────┘
//!
//! DRV_RESPONSE  ┌─────┬──────────┬─────────────┐
//!               │ 03  │ len: u32 │ data[len]   │
//!               └─────┴──────────┴─────────────┘
//! ```

use thiserror::Error;

/// Signature byte of an unsolicited driver greeting.
pub const DRV_INFO: u8 = 0x01;
/// Signature byte of a shell-to-driver command.
pub const DRV_COMMAND: u8 = 0x02;
/// Signature byte of a driver's answer to a command.
pub const DRV_RESPONSE: u8 = 0x03;

/// Longest command name carried in a `DRV_INFO` slot.
pub const MAX_COMMAND_NAME_LEN: usize = 64;
/// Longest command description carried in a `DRV_INFO` slot.
pub const MAX_COMMAND_DESCRIPTION_LEN: usize = 256;
/// Argument lengths are a `u8` on the wire.
pub const MAX_ARGUMENT_LEN: usize = u8::MAX as usize;

/// Filename suffix of a driver socket (`<name>.<slot>.drv`).
pub const SOCKET_SUFFIX: &str = "drv";

pub const SIGNATURE_LEN: usize = 1;
/// Signature plus the command count.
pub const INFO_HEADER_LEN: usize = SIGNATURE_LEN + 4;
/// One fixed-size command descriptor slot inside `DRV_INFO`.
pub const COMMAND_INFO_LEN: usize =
    (MAX_COMMAND_NAME_LEN + 1) + (MAX_COMMAND_DESCRIPTION_LEN + 1) + 1;
/// Signature, command index and argument count.
pub const COMMAND_HEADER_LEN: usize = SIGNATURE_LEN + 4 + 4;
/// Signature plus the payload length.
pub const RESPONSE_HEADER_LEN: usize = SIGNATURE_LEN + 4;

/// One command a driver advertises: the vector index of the descriptor is
/// the command identifier used on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub name: String,
    pub descr: String,
    /// Maximum number of arguments the command accepts.
    pub arity: u8,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("command name too long: {0} bytes (max {MAX_COMMAND_NAME_LEN})")]
    NameTooLong(usize),

    #[error("command description too long: {0} bytes (max {MAX_COMMAND_DESCRIPTION_LEN})")]
    DescriptionTooLong(usize),

    #[error("argument too long: {0} bytes (max {MAX_ARGUMENT_LEN})")]
    ArgumentTooLong(usize),

    #[error("response payload too long: {0} bytes")]
    PayloadTooLong(usize),

    #[error("unexpected signature {0:#04x}")]
    UnexpectedSignature(u8),

    #[error("message truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32, ProtocolError> {
    let end = at + 4;
    if buf.len() < end {
        return Err(ProtocolError::Truncated {
            need: end,
            have: buf.len(),
        });
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..end]);
    Ok(u32::from_le_bytes(raw))
}

fn expect_signature(buf: &[u8], signature: u8) -> Result<(), ProtocolError> {
    match buf.first() {
        None => Err(ProtocolError::Truncated { need: 1, have: 0 }),
        Some(&s) if s == signature => Ok(()),
        Some(&s) => Err(ProtocolError::UnexpectedSignature(s)),
    }
}

/// Total `DRV_INFO` size implied by its command count.
pub fn info_required_len(commands_number: u32) -> usize {
    INFO_HEADER_LEN + commands_number as usize * COMMAND_INFO_LEN
}

/// Total `DRV_RESPONSE` size implied by its payload length.
pub fn response_required_len(payload_len: u32) -> usize {
    RESPONSE_HEADER_LEN + payload_len as usize
}

/// Builds the `DRV_INFO` greeting a driver sends right after accepting a
/// connection.
pub fn encode_info(commands: &[CommandDescriptor]) -> Result<Vec<u8>, ProtocolError> {
    let mut frame = Vec::with_capacity(info_required_len(commands.len() as u32));
    frame.push(DRV_INFO);
    frame.extend_from_slice(&(commands.len() as u32).to_le_bytes());

    for command in commands {
        if command.name.len() > MAX_COMMAND_NAME_LEN {
            return Err(ProtocolError::NameTooLong(command.name.len()));
        }
        if command.descr.len() > MAX_COMMAND_DESCRIPTION_LEN {
            return Err(ProtocolError::DescriptionTooLong(command.descr.len()));
        }

        let mut name = [0u8; MAX_COMMAND_NAME_LEN + 1];
        name[..command.name.len()].copy_from_slice(command.name.as_bytes());
        frame.extend_from_slice(&name);

        let mut descr = [0u8; MAX_COMMAND_DESCRIPTION_LEN + 1];
        descr[..command.descr.len()].copy_from_slice(command.descr.as_bytes());
        frame.extend_from_slice(&descr);

        frame.push(command.arity);
    }

    Ok(frame)
}

/// Command count from a buffer holding at least the `DRV_INFO` header.
pub fn decode_info_count(buf: &[u8]) -> Result<u32, ProtocolError> {
    expect_signature(buf, DRV_INFO)?;
    read_u32(buf, SIGNATURE_LEN)
}

/// Decodes a complete `DRV_INFO` message. The NUL-padded slots are trimmed
/// at the first NUL on receive.
pub fn decode_info(buf: &[u8]) -> Result<Vec<CommandDescriptor>, ProtocolError> {
    let count = decode_info_count(buf)?;
    let need = info_required_len(count);
    if buf.len() < need {
        return Err(ProtocolError::Truncated {
            need,
            have: buf.len(),
        });
    }

    let mut commands = Vec::with_capacity(count as usize);
    let mut at = INFO_HEADER_LEN;
    for _ in 0..count {
        let name = trim_slot(&buf[at..at + MAX_COMMAND_NAME_LEN + 1]);
        at += MAX_COMMAND_NAME_LEN + 1;
        let descr = trim_slot(&buf[at..at + MAX_COMMAND_DESCRIPTION_LEN + 1]);
        at += MAX_COMMAND_DESCRIPTION_LEN + 1;
        let arity = buf[at];
        at += 1;
        commands.push(CommandDescriptor { name, descr, arity });
    }

    Ok(commands)
}

fn trim_slot(slot: &[u8]) -> String {
    let end = slot.iter().position(|&b| b == 0).unwrap_or(slot.len());
    String::from_utf8_lossy(&slot[..end]).into_owned()
}

/// Builds a `DRV_COMMAND` frame. `cmd_idx` is the descriptor index from the
/// driver's `DRV_INFO`; each argument must fit an on-wire `u8` length.
pub fn encode_command(cmd_idx: u32, args: &[Vec<u8>]) -> Result<Vec<u8>, ProtocolError> {
    let mut frame =
        Vec::with_capacity(COMMAND_HEADER_LEN + args.iter().map(|a| 1 + a.len()).sum::<usize>());
    frame.push(DRV_COMMAND);
    frame.extend_from_slice(&cmd_idx.to_le_bytes());
    frame.extend_from_slice(&(args.len() as u32).to_le_bytes());

    for arg in args {
        if arg.len() > MAX_ARGUMENT_LEN {
            return Err(ProtocolError::ArgumentTooLong(arg.len()));
        }
        frame.push(arg.len() as u8);
        frame.extend_from_slice(arg);
    }

    Ok(frame)
}

/// `(cmd_idx, argc)` from a buffer holding at least the command header.
pub fn decode_command_header(buf: &[u8]) -> Result<(u32, u32), ProtocolError> {
    expect_signature(buf, DRV_COMMAND)?;
    let cmd_idx = read_u32(buf, SIGNATURE_LEN)?;
    let argc = read_u32(buf, SIGNATURE_LEN + 4)?;
    Ok((cmd_idx, argc))
}

/// Builds the `DRV_RESPONSE` a driver sends after executing a command.
pub fn encode_response(payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| ProtocolError::PayloadTooLong(payload.len()))?;
    let mut frame = Vec::with_capacity(response_required_len(len));
    frame.push(DRV_RESPONSE);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Payload length from a buffer holding at least the response header.
pub fn decode_response_len(buf: &[u8]) -> Result<u32, ProtocolError> {
    expect_signature(buf, DRV_RESPONSE)?;
    read_u32(buf, SIGNATURE_LEN)
}

/// Payload of a complete `DRV_RESPONSE` message.
pub fn decode_response(buf: &[u8]) -> Result<&[u8], ProtocolError> {
    let len = decode_response_len(buf)?;
    let need = response_required_len(len);
    if buf.len() < need {
        return Err(ProtocolError::Truncated {
            need,
            have: buf.len(),
        });
    }
    Ok(&buf[RESPONSE_HEADER_LEN..need])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_roundtrip() {
        let commands = vec![
            CommandDescriptor {
                name: "p".to_string(),
                descr: "print".to_string(),
                arity: 1,
            },
            CommandDescriptor {
                name: "reset".to_string(),
                descr: "reset the device".to_string(),
                arity: 0,
            },
        ];

        let frame = encode_info(&commands).unwrap();
        assert_eq!(frame.len(), info_required_len(2));
        assert_eq!(frame[0], DRV_INFO);
        assert_eq!(decode_info_count(&frame).unwrap(), 2);
        assert_eq!(decode_info(&frame).unwrap(), commands);
    }

    #[test]
    fn test_info_decode_reports_missing_tail() {
        let commands = vec![CommandDescriptor {
            name: "p".to_string(),
            descr: "print".to_string(),
            arity: 1,
        }];
        let frame = encode_info(&commands).unwrap();

        // Header alone is enough to learn the required size, not to decode.
        let header = &frame[..INFO_HEADER_LEN];
        assert_eq!(decode_info_count(header).unwrap(), 1);
        match decode_info(header) {
            Err(ProtocolError::Truncated { need, have }) => {
                assert_eq!(need, info_required_len(1));
                assert_eq!(have, INFO_HEADER_LEN);
            }
            other => panic!("expected Truncated, got {:?}", other),
        }
    }

    #[test]
    fn test_command_frame_layout() {
        let args = vec![b"hello".to_vec(), b"".to_vec()];
        let frame = encode_command(7, &args).unwrap();

        assert_eq!(frame[0], DRV_COMMAND);
        assert_eq!(decode_command_header(&frame).unwrap(), (7, 2));
        // First arg: len 5 + "hello"; second: len 0.
        assert_eq!(frame[COMMAND_HEADER_LEN], 5);
        assert_eq!(&frame[COMMAND_HEADER_LEN + 1..COMMAND_HEADER_LEN + 6], b"hello");
        assert_eq!(frame[COMMAND_HEADER_LEN + 6], 0);
        assert_eq!(frame.len(), COMMAND_HEADER_LEN + 7);
    }

    #[test]
    fn test_command_rejects_oversize_argument() {
        let args = vec![vec![b'a'; MAX_ARGUMENT_LEN + 1]];
        match encode_command(0, &args) {
            Err(ProtocolError::ArgumentTooLong(n)) => assert_eq!(n, MAX_ARGUMENT_LEN + 1),
            other => panic!("expected ArgumentTooLong, got {:?}", other),
        }
    }

    #[test]
    fn test_response_roundtrip() {
        let frame = encode_response(b"ok").unwrap();
        assert_eq!(frame.len(), RESPONSE_HEADER_LEN + 2);
        assert_eq!(decode_response_len(&frame).unwrap(), 2);
        assert_eq!(decode_response(&frame).unwrap(), b"ok");
    }

    #[test]
    fn test_wrong_signature_is_rejected() {
        let frame = encode_response(b"ok").unwrap();
        match decode_info_count(&frame) {
            Err(ProtocolError::UnexpectedSignature(s)) => assert_eq!(s, DRV_RESPONSE),
            other => panic!("expected UnexpectedSignature, got {:?}", other),
        }
    }

    #[test]
    fn test_info_rejects_oversize_name() {
        let commands = vec![CommandDescriptor {
            name: "x".repeat(MAX_COMMAND_NAME_LEN + 1),
            descr: String::new(),
            arity: 0,
        }];
        assert!(matches!(
            encode_info(&commands),
            Err(ProtocolError::NameTooLong(_))
        ));
    }
}
