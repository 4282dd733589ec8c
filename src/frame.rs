//! In-memory CAN / CAN-FD frame representations shared by every transport.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::CanError;

/// Highest valid 11-bit (standard) arbitration ID.
pub const CAN_STD_ID_MASK: u32 = 0x7FF;
/// Highest valid 29-bit (extended) arbitration ID.
pub const CAN_EXT_ID_MASK: u32 = 0x1FFF_FFFF;
/// Maximum payload length of a classic CAN 2.0 frame.
pub const CLASSIC_MAX_DLEN: usize = 8;
/// Maximum payload length of a CAN-FD frame.
pub const FD_MAX_DLEN: usize = 64;

/// Arbitration ID width: 11-bit standard or 29-bit extended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdType {
    Standard,
    Extended,
}

impl IdType {
    pub fn max_id(self) -> u32 {
        match self {
            IdType::Standard => CAN_STD_ID_MASK,
            IdType::Extended => CAN_EXT_ID_MASK,
        }
    }
}

fn validate_id(id: u32, extended: bool) -> Result<(), CanError> {
    let limit = if extended {
        CAN_EXT_ID_MASK
    } else {
        CAN_STD_ID_MASK
    };
    if id > limit {
        return Err(CanError::IdTooLong);
    }
    Ok(())
}

/// Classic CAN 2.0 frame, at most eight data bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassicFrame {
    id: u32,
    extended: bool,
    remote: bool,
    error: bool,
    data: Vec<u8>,
    /// DLC as signalled on the wire; equals `data.len()` except for
    /// remote frames, which carry a length but no payload.
    dlc: u8,
}

impl ClassicFrame {
    pub fn id(&self) -> u32 {
        self.id
    }
    pub fn is_extended(&self) -> bool {
        self.extended
    }
    pub fn is_remote(&self) -> bool {
        self.remote
    }
    pub fn is_error(&self) -> bool {
        self.error
    }
    pub fn data(&self) -> &[u8] {
        &self.data
    }
    pub fn dlc(&self) -> u8 {
        self.dlc
    }
}

/// CAN-FD frame, up to 64 data bytes plus the FD-only flag bits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdFrame {
    id: u32,
    extended: bool,
    data: Vec<u8>,
    /// Bit-rate switch: data phase transmitted at the faster bit rate.
    brs: bool,
    /// Error state indicator of the transmitting node.
    esi: bool,
}

impl FdFrame {
    pub fn id(&self) -> u32 {
        self.id
    }
    pub fn is_extended(&self) -> bool {
        self.extended
    }
    pub fn data(&self) -> &[u8] {
        &self.data
    }
    pub fn dlc(&self) -> u8 {
        self.data.len() as u8
    }
    pub fn is_brs(&self) -> bool {
        self.brs
    }
    pub fn is_esi(&self) -> bool {
        self.esi
    }
}

/// A decoded CAN frame: classic 2.0 or FD. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CanFrame {
    Classic(ClassicFrame),
    Fd(FdFrame),
}

impl CanFrame {
    /// Build a classic data frame.
    pub fn new(id: u32, extended: bool, data: &[u8]) -> Result<Self, CanError> {
        validate_id(id, extended)?;
        if data.len() > CLASSIC_MAX_DLEN {
            return Err(CanError::DataTooLong);
        }
        Ok(CanFrame::Classic(ClassicFrame {
            id,
            extended,
            remote: false,
            error: false,
            data: data.to_vec(),
            dlc: data.len() as u8,
        }))
    }

    /// Build a classic remote-request frame (carries a DLC but no payload).
    pub fn new_remote(id: u32, extended: bool, dlc: u8) -> Result<Self, CanError> {
        validate_id(id, extended)?;
        if dlc as usize > CLASSIC_MAX_DLEN {
            return Err(CanError::DataTooLong);
        }
        Ok(CanFrame::Classic(ClassicFrame {
            id,
            extended,
            remote: true,
            error: false,
            data: Vec::new(),
            dlc,
        }))
    }

    /// Build an FD data frame.
    pub fn new_fd(id: u32, extended: bool, data: &[u8], brs: bool, esi: bool) -> Result<Self, CanError> {
        validate_id(id, extended)?;
        if data.len() > FD_MAX_DLEN {
            return Err(CanError::DataTooLong);
        }
        Ok(CanFrame::Fd(FdFrame {
            id,
            extended,
            data: data.to_vec(),
            brs,
            esi,
        }))
    }

    /// Build an error frame as reported by a transport. `raw_id` keeps the
    /// error-class bits exactly as the controller delivered them.
    pub fn new_error(raw_id: u32, data: &[u8]) -> Result<Self, CanError> {
        if data.len() > CLASSIC_MAX_DLEN {
            return Err(CanError::DataTooLong);
        }
        Ok(CanFrame::Classic(ClassicFrame {
            id: raw_id & CAN_EXT_ID_MASK,
            extended: false,
            remote: false,
            error: true,
            data: data.to_vec(),
            dlc: data.len() as u8,
        }))
    }

    /// Arbitration ID (error-class bits for error frames).
    pub fn id(&self) -> u32 {
        match self {
            CanFrame::Classic(f) => f.id,
            CanFrame::Fd(f) => f.id,
        }
    }

    pub fn is_extended(&self) -> bool {
        match self {
            CanFrame::Classic(f) => f.extended,
            CanFrame::Fd(f) => f.extended,
        }
    }

    pub fn id_type(&self) -> IdType {
        if self.is_extended() {
            IdType::Extended
        } else {
            IdType::Standard
        }
    }

    pub fn is_remote(&self) -> bool {
        match self {
            CanFrame::Classic(f) => f.remote,
            CanFrame::Fd(_) => false,
        }
    }

    pub fn is_error(&self) -> bool {
        match self {
            CanFrame::Classic(f) => f.error,
            CanFrame::Fd(_) => false,
        }
    }

    pub fn is_fd(&self) -> bool {
        matches!(self, CanFrame::Fd(_))
    }

    pub fn data(&self) -> &[u8] {
        match self {
            CanFrame::Classic(f) => &f.data,
            CanFrame::Fd(f) => &f.data,
        }
    }

    pub fn dlc(&self) -> u8 {
        match self {
            CanFrame::Classic(f) => f.dlc,
            CanFrame::Fd(f) => f.dlc(),
        }
    }
}

/// Direction a frame travelled relative to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Rx,
    Tx,
    Unknown,
}

/// One received frame together with its reception metadata. Produced once
/// per frame by the receive loop; each sink gets its own value copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanReceiveData {
    pub frame: CanFrame,
    /// Time since the Unix epoch, or zero when the transport provides none.
    pub timestamp: Duration,
    pub direction: Direction,
}

impl CanReceiveData {
    pub fn new(frame: CanFrame) -> Self {
        Self {
            frame,
            timestamp: Duration::ZERO,
            direction: Direction::Rx,
        }
    }

    pub fn with_timestamp(frame: CanFrame, timestamp: Duration) -> Self {
        Self {
            frame,
            timestamp,
            direction: Direction::Rx,
        }
    }
}
