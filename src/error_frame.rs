//! Decoding of CAN error frames into structured [`CanErrorInfo`] records.
//!
//! Layout follows the widespread Linux error-frame convention: the error
//! class is carried in the arbitration-ID field and the eight payload bytes
//! detail the lost-arbitration bit, controller state, protocol violation
//! type and location, transceiver state, and the error counters.

use bitflags::bitflags;
use std::time::Duration;

use crate::frame::{CanFrame, CanReceiveData, Direction};

bitflags! {
    /// Error classes a single error frame can report (several may be set).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameErrorType: u32 {
        const TX_TIMEOUT         = 0x0000_0001;
        const ARBITRATION_LOST   = 0x0000_0002;
        const CONTROLLER         = 0x0000_0004;
        const PROTOCOL_VIOLATION = 0x0000_0008;
        const TRANSCEIVER_ERROR  = 0x0000_0010;
        const ACK_ERROR          = 0x0000_0020;
        const BUS_OFF            = 0x0000_0040;
        const BUS_ERROR          = 0x0000_0080;
        const RESTARTED          = 0x0000_0100;
        /// Set when the raw mask carried no recognizable class bit.
        const UNKNOWN            = 0x8000_0000;
    }
}

bitflags! {
    /// Controller problem details (payload byte 1).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ControllerStatus: u8 {
        const RX_OVERFLOW = 0x01;
        const TX_OVERFLOW = 0x02;
        const RX_WARNING  = 0x04;
        const TX_WARNING  = 0x08;
        const RX_PASSIVE  = 0x10;
        const TX_PASSIVE  = 0x20;
        const ACTIVE      = 0x40;
    }
}

bitflags! {
    /// Protocol violation details (payload byte 2).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ProtocolViolationType: u8 {
        const SINGLE_BIT = 0x01;
        const FORMAT     = 0x02;
        const STUFF      = 0x04;
        const BIT0       = 0x08;
        const BIT1       = 0x10;
        const OVERLOAD   = 0x20;
        const ACTIVE     = 0x40;
        /// The violation happened while this node was transmitting.
        const TX         = 0x80;
    }
}

/// Structured view of one error frame. Constructed once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanErrorInfo {
    pub error_type: FrameErrorType,
    pub controller_status: ControllerStatus,
    pub protocol_violation: ProtocolViolationType,
    /// Raw location code within the frame (payload byte 3).
    pub error_location: u8,
    /// Raw transceiver status code (payload byte 4).
    pub transceiver_status: u8,
    pub timestamp: Duration,
    /// Error-class bits exactly as delivered in the arbitration-ID field.
    pub raw_error_mask: u32,
    pub direction: Direction,
    /// Bit position at which arbitration was lost, when reported.
    pub arbitration_lost_bit: Option<u8>,
    /// `(tx, rx)` error counters, when reported.
    pub error_counters: Option<(u8, u8)>,
}

impl CanErrorInfo {
    /// Decode a received error frame. The caller guarantees
    /// `received.frame.is_error()`.
    pub fn decode(received: &CanReceiveData) -> Self {
        Self::from_frame(&received.frame, received.timestamp)
    }

    pub fn from_frame(frame: &CanFrame, timestamp: Duration) -> Self {
        let mask = frame.id();
        let mut error_type = FrameErrorType::from_bits_truncate(mask);
        if error_type.is_empty() {
            error_type = FrameErrorType::UNKNOWN;
        }

        let data = frame.data();
        let byte = |idx: usize| data.get(idx).copied().unwrap_or(0);

        let arbitration_lost_bit = if error_type.contains(FrameErrorType::ARBITRATION_LOST) {
            Some(byte(0))
        } else {
            None
        };
        let controller_status = ControllerStatus::from_bits_truncate(byte(1));
        let protocol_violation = ProtocolViolationType::from_bits_truncate(byte(2));
        // Counters are only meaningful when the frame carries a full payload.
        let error_counters = if data.len() >= 8 {
            Some((byte(6), byte(7)))
        } else {
            None
        };

        let direction = if protocol_violation.contains(ProtocolViolationType::TX)
            || error_type
                .intersects(FrameErrorType::TX_TIMEOUT | FrameErrorType::ACK_ERROR | FrameErrorType::ARBITRATION_LOST)
        {
            Direction::Tx
        } else if error_type
            .intersects(FrameErrorType::CONTROLLER | FrameErrorType::PROTOCOL_VIOLATION | FrameErrorType::BUS_ERROR)
        {
            Direction::Rx
        } else {
            Direction::Unknown
        };

        Self {
            error_type,
            controller_status,
            protocol_violation,
            error_location: byte(3),
            transceiver_status: byte(4),
            timestamp,
            raw_error_mask: mask,
            direction,
            arbitration_lost_bit,
            error_counters,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_arbitration_loss_with_bit_position() {
        let frame = CanFrame::new_error(0x0000_0002, &[13, 0, 0, 0, 0, 0, 0, 0]).unwrap();
        let info = CanErrorInfo::from_frame(&frame, Duration::ZERO);
        assert_eq!(info.error_type, FrameErrorType::ARBITRATION_LOST);
        assert_eq!(info.arbitration_lost_bit, Some(13));
        assert_eq!(info.direction, Direction::Tx);
    }

    #[test]
    fn decodes_controller_problem_and_counters() {
        let frame = CanFrame::new_error(0x0000_0004, &[0, 0x10, 0, 0, 0, 0, 96, 130]).unwrap();
        let info = CanErrorInfo::from_frame(&frame, Duration::from_secs(1));
        assert!(info.error_type.contains(FrameErrorType::CONTROLLER));
        assert_eq!(info.controller_status, ControllerStatus::RX_PASSIVE);
        assert_eq!(info.error_counters, Some((96, 130)));
        assert_eq!(info.direction, Direction::Rx);
    }

    #[test]
    fn unknown_mask_maps_to_unknown_class() {
        let frame = CanFrame::new_error(0, &[]).unwrap();
        let info = CanErrorInfo::from_frame(&frame, Duration::ZERO);
        assert_eq!(info.error_type, FrameErrorType::UNKNOWN);
        assert_eq!(info.error_counters, None);
        assert_eq!(info.direction, Direction::Unknown);
    }

    #[test]
    fn protocol_violation_tx_flag_sets_direction() {
        let frame = CanFrame::new_error(0x0000_0008, &[0, 0, 0x84, 0x03, 0, 0, 0, 0]).unwrap();
        let info = CanErrorInfo::from_frame(&frame, Duration::ZERO);
        assert!(info.protocol_violation.contains(ProtocolViolationType::STUFF));
        assert_eq!(info.error_location, 0x03);
        assert_eq!(info.direction, Direction::Tx);
    }
}
