//! Wire protocol of the FC1307 card family.
//!
//! All multi-byte fields on the wire are big-endian. Frames travel over UDP:
//! the host listens on [`HOST_PORT`], cards listen on [`CARD_PORT`].

use num_enum::TryFromPrimitive;
use std::net::Ipv4Addr;
use std::time::Duration;
use thiserror::Error;

/// Frame header magic, ASCII `FC1307`.
pub const MAGIC: [u8; 6] = *b"FC1307";

/// Local UDP port every response is addressed to.
pub const HOST_PORT: u16 = 24388;
/// UDP port a card listens on for probes and read requests.
pub const CARD_PORT: u16 = 24387;

/// Discovery probe payload.
pub const PROBE_PAYLOAD: &[u8] = b"KTC";
/// Default discovery broadcast address.
pub const DEFAULT_BROADCAST: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 255);
/// Interval between discovery probes.
pub const PROBE_INTERVAL: Duration = Duration::from_secs(10);

/// Size of one addressable block (LBA).
pub const BLOCK_SIZE: usize = 512;
/// Most blocks a single read request may ask for.
pub const MAX_TRANSFER_BLOCKS: u16 = 14;
/// First transfer ID a fresh card handle uses.
pub const INITIAL_TRANSFER_ID: u32 = 93;
/// Deadline for a block-read response.
pub const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub const DEFAULT_USERNAME: &str = "admin";
pub const DEFAULT_PASSWORD: &str = "admin";

/// Read requests are a fixed 52-byte frame.
pub const READ_REQUEST_LEN: usize = 52;
/// Header bytes preceding the payload of a read response.
pub const READ_RESPONSE_HEADER_LEN: usize = 24;
/// Shortest well-formed card-info frame (zero-length subversion).
pub const CARD_INFO_MIN_LEN: usize = 43;

const CREDENTIAL_LEN: usize = 16;
const VERSION_FIELD_LEN: usize = 11;

/// Direction byte at frame offset 6.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
pub enum Direction {
    ToCard = 1,
    FromCard = 2,
}

/// Command byte at frame offset 7.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive)]
pub enum Command {
    CardInfo = 1,
    ReadData = 4,
}

/// Card media type, ASCII `SD` or `CF` on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CardType {
    Sd,
    Cf,
}

impl std::fmt::Display for CardType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CardType::Sd => "SD",
            CardType::Cf => "CF",
        })
    }
}

/// Why an inbound datagram was rejected.
///
/// These are soft errors: dispatch code logs them and drops the datagram,
/// they never surface through [`crate::Error`].
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("datagram too short ({0} bytes)")]
    TooShort(usize),
    #[error("bad header magic")]
    BadMagic,
    #[error("unknown direction byte {0:#04x}")]
    BadDirection(u8),
    #[error("unknown command byte {0:#04x}")]
    BadCommand(u8),
    #[error("unknown card type {0:?}")]
    BadCardType([u8; 2]),
    /// Valid header, but not the frame the caller handles.
    #[error("unexpected frame: direction {direction:?}, command {command:?}")]
    UnexpectedFrame {
        direction: Direction,
        command: Command,
    },
}

/// Validates magic, direction and command of an inbound frame.
pub fn parse_header(buf: &[u8]) -> Result<(Direction, Command), PacketError> {
    if buf.len() < 8 {
        return Err(PacketError::TooShort(buf.len()));
    }
    if buf[..6] != MAGIC {
        return Err(PacketError::BadMagic);
    }
    let direction =
        Direction::try_from_primitive(buf[6]).map_err(|_| PacketError::BadDirection(buf[6]))?;
    let command =
        Command::try_from_primitive(buf[7]).map_err(|_| PacketError::BadCommand(buf[7]))?;
    Ok((direction, command))
}

fn expect_frame(
    buf: &[u8],
    direction: Direction,
    command: Command,
) -> Result<(), PacketError> {
    let (dir, cmd) = parse_header(buf)?;
    if dir != direction || cmd != command {
        return Err(PacketError::UnexpectedFrame {
            direction: dir,
            command: cmd,
        });
    }
    Ok(())
}

/// Command-1 response announcing a card's identity.
#[derive(Debug, Clone)]
pub struct CardInfoFrame {
    pub ip: Ipv4Addr,
    pub mac: [u8; 6],
    pub card_type: CardType,
    /// `X.Y.Z` extracted from the `Ver X.Y.Z` field, `"Unknown"` otherwise.
    pub version: String,
    /// Raw capacity in blocks. Wraps for cards of 2 TiB and larger.
    pub capacity_blocks: u32,
    pub ap_mode: bool,
    pub subver: String,
}

impl CardInfoFrame {
    pub fn parse(buf: &[u8]) -> Result<Self, PacketError> {
        expect_frame(buf, Direction::FromCard, Command::CardInfo)?;
        if buf.len() < CARD_INFO_MIN_LEN {
            return Err(PacketError::TooShort(buf.len()));
        }

        let subver_len = buf[42] as usize;
        let subver = buf
            .get(43..43 + subver_len)
            .ok_or(PacketError::TooShort(buf.len()))?;

        let card_type = match &buf[24..26] {
            b"SD" => CardType::Sd,
            b"CF" => CardType::Cf,
            other => return Err(PacketError::BadCardType([other[0], other[1]])),
        };

        Ok(CardInfoFrame {
            ip: Ipv4Addr::new(buf[14], buf[15], buf[16], buf[17]),
            mac: buf[18..24].try_into().unwrap(),
            card_type,
            version: parse_version(&buf[26..26 + VERSION_FIELD_LEN]),
            capacity_blocks: u32::from_be_bytes(buf[37..41].try_into().unwrap()),
            ap_mode: buf[41] == 1,
            subver: ascii_string(subver),
        })
    }
}

/// Command-4 block-read request.
#[derive(Debug, Clone)]
pub struct ReadRequest<'a> {
    pub lba: u32,
    pub count: u16,
    pub transfer_id: u32,
    pub username: &'a str,
    pub password: &'a str,
}

impl ReadRequest<'_> {
    pub fn encode(&self) -> [u8; READ_REQUEST_LEN] {
        let mut buf = [0u8; READ_REQUEST_LEN];
        buf[..6].copy_from_slice(&MAGIC);
        buf[6] = Direction::ToCard as u8;
        buf[7] = Command::ReadData as u8;
        buf[8..12].copy_from_slice(&self.lba.to_be_bytes());
        buf[12..14].copy_from_slice(&self.count.to_be_bytes());
        buf[14] = self.username.len().min(CREDENTIAL_LEN) as u8;
        buf[15] = self.password.len().min(CREDENTIAL_LEN) as u8;
        write_credential(&mut buf[16..32], self.username);
        write_credential(&mut buf[32..48], self.password);
        buf[48..52].copy_from_slice(&self.transfer_id.to_be_bytes());
        buf
    }
}

/// Command-4 block-read response. `data` borrows from the datagram.
#[derive(Debug)]
pub struct ReadResponse<'a> {
    pub lba: u32,
    pub lba_offset: u16,
    pub flags: u16,
    pub transfer_id: u32,
    pub data: &'a [u8],
}

impl<'a> ReadResponse<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, PacketError> {
        expect_frame(buf, Direction::FromCard, Command::ReadData)?;
        if buf.len() < READ_RESPONSE_HEADER_LEN {
            return Err(PacketError::TooShort(buf.len()));
        }
        let n_bytes = u16::from_be_bytes(buf[16..18].try_into().unwrap()) as usize;
        let data = buf
            .get(READ_RESPONSE_HEADER_LEN..READ_RESPONSE_HEADER_LEN + n_bytes)
            .ok_or(PacketError::TooShort(buf.len()))?;
        Ok(ReadResponse {
            lba: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            lba_offset: u16::from_be_bytes(buf[12..14].try_into().unwrap()),
            flags: u16::from_be_bytes(buf[14..16].try_into().unwrap()),
            transfer_id: u32::from_be_bytes(buf[18..22].try_into().unwrap()),
            data,
        })
    }
}

fn write_credential(dst: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(dst.len());
    dst[..len].copy_from_slice(&bytes[..len]);
}

fn ascii_string(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Extracts `X.Y.Z` out of a `Ver X.Y.Z` field, zero-padded on the wire.
fn parse_version(field: &[u8]) -> String {
    let text: String = field
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect();
    text.find("Ver ")
        .and_then(|idx| dotted_triplet(&text[idx + 4..]))
        .map(str::to_string)
        .unwrap_or_else(|| String::from("Unknown"))
}

/// Leading `digits.digits.digits` prefix of `s`, if present.
fn dotted_triplet(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    let mut len = 0;
    for part in 0..3 {
        if part > 0 {
            if bytes.get(len) != Some(&b'.') {
                return None;
            }
            len += 1;
        }
        let digits_start = len;
        while bytes.get(len).is_some_and(|b| b.is_ascii_digit()) {
            len += 1;
        }
        if len == digits_start {
            return None;
        }
    }
    Some(&s[..len])
}
