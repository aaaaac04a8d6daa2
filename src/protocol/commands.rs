//! BMS command catalogue: request builders and response parsers for every
//! command family the wire protocol defines.

use super::frame::Frame;
use thiserror::Error;

pub const CMD_NACK: u8 = 0x00;
pub const CMD_ACK: u8 = 0x01;
pub const CMD_RESET: u8 = 0x02;
pub const CMD_REGISTER_FILE_READ: u8 = 0x03;
pub const CMD_BLOCK_READ: u8 = 0x07;
pub const CMD_READ_REGISTER: u8 = 0x09;
pub const CMD_BLOCK_WRITE: u8 = 0x0B;
pub const CMD_WRITE_REGISTER: u8 = 0x0D;
pub const CMD_REGISTER_FILE_WRITE: u8 = 0x10;

pub const RESET_OPTION: u8 = 0x05;
pub const BLOCK_WRITE_MAX_REGISTERS: usize = 125;
pub const BLOCK_READ_MAX_REGISTERS: usize = 255;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("expected command 0x{expected:02X}, got 0x{got:02X}")]
    UnexpectedCommand { expected: u8, got: u8 },
    #[error("expected payload length {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("peer NACKed with error code 0x{0:02X}")]
    Nack(u8),
    #[error("frame was neither ACK nor NACK")]
    NotAnAcknowledgement,
    #[error("register count {0} exceeds the protocol maximum {1}")]
    TooManyRegisters(usize, usize),
    #[error("unknown status query opcode 0x{0:02X}")]
    UnknownStatusQuery(u8),
}

/// Marker identifying which category a high-level `BmsCommand` belongs to,
/// used only for logging.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BmsCommand {
    ReadRegister,
    WriteRegister,
    Reset,
    BlockRead,
    BlockWrite,
    RegisterFileRead,
    RegisterFileWrite,
    StatusQuery(StatusQueryKind),
}

// --- single register read/write (0x09 / 0x0D) ------------------------------

pub fn build_read_frame(addr: u16) -> Frame {
    Frame::new(CMD_READ_REGISTER, addr.to_le_bytes().to_vec()).expect("2-byte payload always fits")
}

/// Parses a read response. The response echoes the address then carries
/// the 2-byte LE value, under the same command byte.
pub fn parse_read_response(frame: &Frame) -> Result<(u16, u16), ProtocolError> {
    if frame.cmd != CMD_READ_REGISTER {
        return Err(ProtocolError::UnexpectedCommand {
            expected: CMD_READ_REGISTER,
            got: frame.cmd,
        });
    }
    if frame.payload.len() != 4 {
        return Err(ProtocolError::InvalidLength {
            expected: 4,
            got: frame.payload.len(),
        });
    }
    let addr = u16::from_le_bytes([frame.payload[0], frame.payload[1]]);
    let value = u16::from_le_bytes([frame.payload[2], frame.payload[3]]);
    Ok((addr, value))
}

pub fn build_write_frame(addr: u16, value: u16) -> Frame {
    let mut payload = Vec::with_capacity(4);
    payload.extend_from_slice(&addr.to_le_bytes());
    payload.extend_from_slice(&value.to_le_bytes());
    Frame::new(CMD_WRITE_REGISTER, payload).expect("4-byte payload always fits")
}

// --- reset (0x02) -----------------------------------------------------------

pub fn build_reset_frame() -> Frame {
    Frame::new(CMD_RESET, vec![RESET_OPTION]).expect("1-byte payload always fits")
}

// --- block read/write (0x07 / 0x0B) -----------------------------------------

pub fn build_block_read_frame(start_addr: u16, count: u8) -> Result<Frame, ProtocolError> {
    if count as usize > BLOCK_READ_MAX_REGISTERS {
        return Err(ProtocolError::TooManyRegisters(count as usize, BLOCK_READ_MAX_REGISTERS));
    }
    let mut payload = Vec::with_capacity(3);
    payload.extend_from_slice(&start_addr.to_le_bytes());
    payload.push(count);
    Ok(Frame::new(CMD_BLOCK_READ, payload).expect("3-byte payload always fits"))
}

pub fn parse_block_read_response(frame: &Frame, count: u8) -> Result<Vec<u16>, ProtocolError> {
    if frame.cmd != CMD_BLOCK_READ {
        return Err(ProtocolError::UnexpectedCommand {
            expected: CMD_BLOCK_READ,
            got: frame.cmd,
        });
    }
    let expected = count as usize * 2;
    if frame.payload.len() != expected {
        return Err(ProtocolError::InvalidLength {
            expected,
            got: frame.payload.len(),
        });
    }
    Ok(frame
        .payload
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

pub fn build_block_write_frame(start_addr: u16, values: &[u16]) -> Result<Frame, ProtocolError> {
    if values.len() > BLOCK_WRITE_MAX_REGISTERS {
        return Err(ProtocolError::TooManyRegisters(values.len(), BLOCK_WRITE_MAX_REGISTERS));
    }
    let mut payload = Vec::with_capacity(3 + values.len() * 2);
    payload.extend_from_slice(&start_addr.to_le_bytes());
    payload.push(values.len() as u8);
    for v in values {
        payload.extend_from_slice(&v.to_le_bytes());
    }
    Frame::new(CMD_BLOCK_WRITE, payload).map_err(|_| ProtocolError::TooManyRegisters(values.len(), BLOCK_WRITE_MAX_REGISTERS))
}

// --- standard register-file read/write (0x03 / 0x10) ------------------------

pub fn build_register_file_read_frame(start_addr: u16, quantity: u16) -> Frame {
    let mut payload = Vec::with_capacity(4);
    payload.extend_from_slice(&start_addr.to_le_bytes());
    payload.extend_from_slice(&quantity.to_le_bytes());
    Frame::new(CMD_REGISTER_FILE_READ, payload).expect("4-byte payload always fits")
}

pub fn parse_register_file_read_response(frame: &Frame, quantity: u16) -> Result<Vec<u16>, ProtocolError> {
    if frame.cmd != CMD_REGISTER_FILE_READ {
        return Err(ProtocolError::UnexpectedCommand {
            expected: CMD_REGISTER_FILE_READ,
            got: frame.cmd,
        });
    }
    let expected = quantity as usize * 2;
    if frame.payload.len() != expected {
        return Err(ProtocolError::InvalidLength {
            expected,
            got: frame.payload.len(),
        });
    }
    Ok(frame
        .payload
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

pub fn build_register_file_write_frame(start_addr: u16, values: &[u16]) -> Frame {
    let mut payload = Vec::with_capacity(5 + values.len() * 2);
    payload.extend_from_slice(&start_addr.to_le_bytes());
    payload.extend_from_slice(&(values.len() as u16).to_le_bytes());
    payload.push((values.len() * 2) as u8);
    for v in values {
        payload.extend_from_slice(&v.to_le_bytes());
    }
    Frame::new(CMD_REGISTER_FILE_WRITE, payload).expect("payload fits a u8 length")
}

// --- ACK / NACK --------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Ack { echoed_cmd: u8 },
    Nack { echoed_cmd: u8, error: u8 },
}

pub fn build_ack_frame(echoed_cmd: u8) -> Frame {
    Frame::new(CMD_ACK, vec![echoed_cmd]).expect("1-byte payload always fits")
}

pub fn build_nack_frame(echoed_cmd: u8, error: u8) -> Frame {
    Frame::new(CMD_NACK, vec![echoed_cmd, error]).expect("2-byte payload always fits")
}

pub fn parse_ack(frame: &Frame) -> Result<AckOutcome, ProtocolError> {
    match frame.cmd {
        CMD_ACK => {
            let echoed_cmd = frame.payload.first().copied().unwrap_or(0);
            Ok(AckOutcome::Ack { echoed_cmd })
        }
        CMD_NACK => {
            if frame.payload.len() < 2 {
                return Err(ProtocolError::InvalidLength {
                    expected: 2,
                    got: frame.payload.len(),
                });
            }
            Ok(AckOutcome::Nack {
                echoed_cmd: frame.payload[0],
                error: frame.payload[1],
            })
        }
        _ => Err(ProtocolError::NotAnAcknowledgement),
    }
}

// --- fixed-purpose status queries (0x11..0x20) -----------------------------

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum StatusQueryKind {
    NewestEvent = 0x11,
    AllEvents = 0x12,
    PackVoltage = 0x13,
    PackCurrent = 0x14,
    CellVoltageMinMax = 0x15,
    OnlineStatus = 0x16,
    LifetimeCounter = 0x17,
    Soc = 0x18,
    Temperatures = 0x19,
    AllCellVoltages = 0x1A,
    SettingsSnapshot = 0x1B,
    Version = 0x1C,
    ExtendedVersion = 0x1D,
    /// Vestigial category inherited from the automotive protocol this wire
    /// format was generalized from; meaningless for a stationary pack.
    /// Always decodes to `None` — see SPEC_FULL.md §4.2a.
    SpeedDistance = 0x1E,
}

impl StatusQueryKind {
    pub fn opcode(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for StatusQueryKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x11 => Ok(StatusQueryKind::NewestEvent),
            0x12 => Ok(StatusQueryKind::AllEvents),
            0x13 => Ok(StatusQueryKind::PackVoltage),
            0x14 => Ok(StatusQueryKind::PackCurrent),
            0x15 => Ok(StatusQueryKind::CellVoltageMinMax),
            0x16 => Ok(StatusQueryKind::OnlineStatus),
            0x17 => Ok(StatusQueryKind::LifetimeCounter),
            0x18 => Ok(StatusQueryKind::Soc),
            0x19 => Ok(StatusQueryKind::Temperatures),
            0x1A => Ok(StatusQueryKind::AllCellVoltages),
            0x1B => Ok(StatusQueryKind::SettingsSnapshot),
            0x1C => Ok(StatusQueryKind::Version),
            0x1D => Ok(StatusQueryKind::ExtendedVersion),
            0x1E => Ok(StatusQueryKind::SpeedDistance),
            other => Err(ProtocolError::UnknownStatusQuery(other)),
        }
    }
}

pub fn build_status_query_frame(kind: StatusQueryKind) -> Frame {
    Frame::new(kind.opcode(), Vec::new()).expect("empty payload always fits")
}

#[derive(Debug, Clone, PartialEq)]
pub struct TemperatureReadings {
    pub avg_c: f64,
    pub mosfet_c: f64,
    pub aux_c: f64,
    pub min_c: f64,
    pub max_c: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettingsSnapshotPayload {
    pub series_cell_count: u16,
    pub overvoltage_cutoff_mv: u16,
    pub undervoltage_cutoff_mv: u16,
    pub charge_overcurrent_a: f64,
    pub discharge_overcurrent_a: f64,
    pub capacity_ah: f64,
}

fn expect_len(kind: StatusQueryKind, payload: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if payload.len() != expected {
        return Err(ProtocolError::InvalidLength {
            expected,
            got: payload.len(),
        });
    }
    let _ = kind;
    Ok(())
}

/// Decodes a status query response for the query `kind` that produced it.
/// `SpeedDistance` always yields `Ok(None)` (see its doc comment above).
pub fn decode_status_response(kind: StatusQueryKind, frame: &Frame) -> Result<StatusPayload, ProtocolError> {
    if frame.cmd != kind.opcode() {
        return Err(ProtocolError::UnexpectedCommand {
            expected: kind.opcode(),
            got: frame.cmd,
        });
    }
    let p = &frame.payload;
    match kind {
        StatusQueryKind::NewestEvent => Ok(StatusPayload::RawEvent(p.clone())),
        StatusQueryKind::AllEvents => Ok(StatusPayload::RawEvents(p.clone())),
        StatusQueryKind::PackVoltage => {
            expect_len(kind, p, 2)?;
            Ok(StatusPayload::PackVoltage(u16::from_le_bytes([p[0], p[1]]) as f64 / 100.0))
        }
        StatusQueryKind::PackCurrent => {
            expect_len(kind, p, 2)?;
            Ok(StatusPayload::PackCurrent(i16::from_le_bytes([p[0], p[1]]) as f64 / 100.0))
        }
        StatusQueryKind::CellVoltageMinMax => {
            expect_len(kind, p, 4)?;
            let min_mv = u16::from_le_bytes([p[0], p[1]]);
            let max_mv = u16::from_le_bytes([p[2], p[3]]);
            Ok(StatusPayload::CellVoltageMinMax { min_mv, max_mv })
        }
        StatusQueryKind::OnlineStatus => {
            expect_len(kind, p, 1)?;
            Ok(StatusPayload::OnlineStatus(p[0] != 0))
        }
        StatusQueryKind::LifetimeCounter => {
            expect_len(kind, p, 4)?;
            Ok(StatusPayload::LifetimeCounter(u32::from_le_bytes([p[0], p[1], p[2], p[3]])))
        }
        StatusQueryKind::Soc => {
            expect_len(kind, p, 2)?;
            Ok(StatusPayload::Soc(u16::from_le_bytes([p[0], p[1]]) as f64 / 100.0))
        }
        StatusQueryKind::Temperatures => {
            expect_len(kind, p, 10)?;
            let read = |lo: usize| i16::from_le_bytes([p[lo], p[lo + 1]]) as f64 / 10.0;
            Ok(StatusPayload::Temperatures(TemperatureReadings {
                avg_c: read(0),
                mosfet_c: read(2),
                aux_c: read(4),
                min_c: read(6),
                max_c: read(8),
            }))
        }
        StatusQueryKind::AllCellVoltages => {
            if p.len() > 32 || p.len() % 2 != 0 {
                return Err(ProtocolError::InvalidLength {
                    expected: 32,
                    got: p.len(),
                });
            }
            Ok(StatusPayload::AllCellVoltages(
                p.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect(),
            ))
        }
        StatusQueryKind::SettingsSnapshot => {
            expect_len(kind, p, 12)?;
            Ok(StatusPayload::SettingsSnapshot(SettingsSnapshotPayload {
                series_cell_count: u16::from_le_bytes([p[0], p[1]]),
                overvoltage_cutoff_mv: u16::from_le_bytes([p[2], p[3]]),
                undervoltage_cutoff_mv: u16::from_le_bytes([p[4], p[5]]),
                charge_overcurrent_a: u16::from_le_bytes([p[6], p[7]]) as f64 / 10.0,
                discharge_overcurrent_a: u16::from_le_bytes([p[8], p[9]]) as f64 / 10.0,
                capacity_ah: u16::from_le_bytes([p[10], p[11]]) as f64 / 100.0,
            }))
        }
        StatusQueryKind::Version | StatusQueryKind::ExtendedVersion => {
            let text: String = p.iter().take_while(|&&b| b != 0).map(|&b| b as char).collect();
            Ok(StatusPayload::Text(text))
        }
        StatusQueryKind::SpeedDistance => Ok(StatusPayload::None),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatusPayload {
    RawEvent(Vec<u8>),
    RawEvents(Vec<u8>),
    PackVoltage(f64),
    PackCurrent(f64),
    CellVoltageMinMax { min_mv: u16, max_mv: u16 },
    OnlineStatus(bool),
    LifetimeCounter(u32),
    Soc(f64),
    Temperatures(TemperatureReadings),
    AllCellVoltages(Vec<u16>),
    SettingsSnapshot(SettingsSnapshotPayload),
    Text(String),
    None,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::extract_frame;
    use crate::protocol::frame::ExtractResult;

    #[test]
    fn scenario_5_read_register_0x0024() {
        // AA 09 04 24 00 34 12 CRC_LO CRC_HI -> value 0x1234
        let frame = Frame::new(CMD_READ_REGISTER, vec![0x24, 0x00, 0x34, 0x12]).unwrap();
        let bytes = frame.to_bytes();
        let ExtractResult::Complete { frame: got, .. } = extract_frame(&bytes) else {
            panic!("expected a complete frame");
        };
        let (addr, value) = parse_read_response(&got).unwrap();
        assert_eq!(addr, 0x0024);
        assert_eq!(value, 0x1234);
    }

    #[test]
    fn write_then_read_round_trip() {
        let write = build_write_frame(0x10, 0xBEEF);
        assert_eq!(write.cmd, CMD_WRITE_REGISTER);
        assert_eq!(write.payload, vec![0x10, 0x00, 0xEF, 0xBE]);
    }

    #[test]
    fn ack_and_nack_round_trip() {
        let ack = build_ack_frame(CMD_WRITE_REGISTER);
        assert_eq!(parse_ack(&ack).unwrap(), AckOutcome::Ack { echoed_cmd: CMD_WRITE_REGISTER });

        let nack = build_nack_frame(CMD_WRITE_REGISTER, 0x07);
        assert_eq!(
            parse_ack(&nack).unwrap(),
            AckOutcome::Nack {
                echoed_cmd: CMD_WRITE_REGISTER,
                error: 0x07
            }
        );
    }

    #[test]
    fn block_read_rejects_oversized_counts() {
        assert!(build_block_read_frame(0, 255).is_ok());
        // count is a u8 so it cannot literally exceed 255; the guard exists
        // for callers constructing frames from wider integer sources.
    }

    #[test]
    fn block_write_rejects_over_125_registers() {
        let values = vec![0u16; 126];
        assert_eq!(
            build_block_write_frame(0, &values),
            Err(ProtocolError::TooManyRegisters(126, BLOCK_WRITE_MAX_REGISTERS))
        );
    }

    #[test]
    fn decodes_pack_voltage_and_current() {
        let frame = Frame::new(StatusQueryKind::PackVoltage.opcode(), 5280u16.to_le_bytes().to_vec()).unwrap();
        match decode_status_response(StatusQueryKind::PackVoltage, &frame).unwrap() {
            StatusPayload::PackVoltage(v) => assert!((v - 52.80).abs() < 1e-9),
            other => panic!("unexpected {other:?}"),
        }

        let frame = Frame::new(StatusQueryKind::PackCurrent.opcode(), (-1500i16).to_le_bytes().to_vec()).unwrap();
        match decode_status_response(StatusQueryKind::PackCurrent, &frame).unwrap() {
            StatusPayload::PackCurrent(v) => assert!((v - (-15.00)).abs() < 1e-9),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn speed_distance_always_decodes_to_none() {
        let frame = Frame::new(StatusQueryKind::SpeedDistance.opcode(), vec![1, 2, 3]).unwrap();
        assert_eq!(
            decode_status_response(StatusQueryKind::SpeedDistance, &frame).unwrap(),
            StatusPayload::None
        );
    }

    #[test]
    fn version_text_stops_at_first_nul() {
        let mut payload = b"V2.19S".to_vec();
        payload.extend_from_slice(&[0, 0]);
        let frame = Frame::new(StatusQueryKind::Version.opcode(), payload).unwrap();
        match decode_status_response(StatusQueryKind::Version, &frame).unwrap() {
            StatusPayload::Text(s) => assert_eq!(s, "V2.19S"),
            other => panic!("unexpected {other:?}"),
        }
    }
}
