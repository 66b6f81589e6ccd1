//! 29-bit CAN identifier synthesis [1; 4.2.1]
//!
//! Only the transmission direction is implemented; identifier parsing belongs
//! to the receive pipeline, which lives elsewhere.
//!
//! # References
//!
//! * \[1\] Cyphal Specification v1.0
//!   <https://opencyphal.org/specification/Cyphal_Specification.pdf>

use crate::core::{NodeId, Priority, ServiceId, SubjectId};
use crate::frame::DataSpecifier;

const PRIORITY_OFFSET: u32 = 26;
const SOURCE_OFFSET: u32 = 0;
const MSG_SUBJECT_OFFSET: u32 = 8;
const SRV_DESTINATION_OFFSET: u32 = 7;
const SRV_SERVICE_OFFSET: u32 = 14;

const SERVICE_FLAG: u32 = 1 << 25;
const MSG_ANONYMOUS_FLAG: u32 = 1 << 24;
const SRV_REQUEST_FLAG: u32 = 1 << 24;

// Bits 21 and 22 of a message identifier are reserved and transmitted as
// ones; bit 23 is reserved and transmitted as zero.
const MSG_RESERVED_ONES: u32 = 0b11 << 21;

/// An extended-format CAN frame identifier. Opaque to the TX pipeline; the
/// driver passes it through to the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CanId(u32);

impl CanId {
    pub const fn into_u32(self) -> u32 {
        self.0
    }
}

impl From<CanId> for u32 {
    fn from(value: CanId) -> Self {
        value.into_u32()
    }
}

pub fn message(priority: Priority, subject: SubjectId, source: NodeId, anonymous: bool) -> CanId {
    let anonymous_flag = if anonymous { MSG_ANONYMOUS_FLAG } else { 0 };
    CanId(
        u32::from(u8::from(priority)) << PRIORITY_OFFSET
            | MSG_RESERVED_ONES
            | anonymous_flag
            | u32::from(u16::from(subject)) << MSG_SUBJECT_OFFSET
            | u32::from(u8::from(source)) << SOURCE_OFFSET,
    )
}

pub fn service(
    priority: Priority,
    service: ServiceId,
    request: bool,
    destination: NodeId,
    source: NodeId,
) -> CanId {
    let request_flag = if request { SRV_REQUEST_FLAG } else { 0 };
    CanId(
        u32::from(u8::from(priority)) << PRIORITY_OFFSET
            | SERVICE_FLAG
            | request_flag
            | u32::from(u16::from(service)) << SRV_SERVICE_OFFSET
            | u32::from(u8::from(destination)) << SRV_DESTINATION_OFFSET
            | u32::from(u8::from(source)) << SOURCE_OFFSET,
    )
}

/// Builds the identifier shared by every frame of one transfer.
///
/// `anonymous` is meaningful for messages only; the TX queue rejects
/// anonymous service transfers before getting here.
pub fn for_transfer(
    priority: Priority,
    data_spec: &DataSpecifier,
    source: NodeId,
    anonymous: bool,
) -> CanId {
    debug_assert!(!(anonymous && data_spec.is_service()));
    match *data_spec {
        DataSpecifier::Message {
            subject,
        } => message(priority, subject, source, anonymous),
        DataSpecifier::Request {
            service: id,
            destination,
        } => service(priority, id, true, destination, source),
        DataSpecifier::Response {
            service: id,
            destination,
        } => service(priority, id, false, destination, source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(value: u8) -> NodeId {
        NodeId::new(value).unwrap()
    }

    #[test]
    fn test_message_id_fields() {
        let id = message(
            Priority::Nominal,
            SubjectId::new(321).unwrap(),
            node(42),
            false,
        )
        .into_u32();

        assert_eq!(id >> PRIORITY_OFFSET, 4);
        assert_eq!(id & SERVICE_FLAG, 0);
        assert_eq!(id & MSG_ANONYMOUS_FLAG, 0);
        assert_eq!(id & MSG_RESERVED_ONES, MSG_RESERVED_ONES);
        assert_eq!(id & (1 << 23), 0);
        assert_eq!((id >> MSG_SUBJECT_OFFSET) & 0x1fff, 321);
        assert_eq!(id & 0x7f, 42);
        assert!(id < 1 << 29);
    }

    #[test]
    fn test_anonymous_message_flag() {
        let id = message(
            Priority::Nominal,
            SubjectId::new(321).unwrap(),
            node(5),
            true,
        )
        .into_u32();
        assert_ne!(id & MSG_ANONYMOUS_FLAG, 0);
    }

    #[test]
    fn test_service_id_fields() {
        let request = service(
            Priority::Low,
            ServiceId::new(511).unwrap(),
            true,
            node(42),
            node(1),
        )
        .into_u32();

        assert_eq!(request >> PRIORITY_OFFSET, 5);
        assert_ne!(request & SERVICE_FLAG, 0);
        assert_ne!(request & SRV_REQUEST_FLAG, 0);
        assert_eq!(request & (1 << 23), 0);
        assert_eq!((request >> SRV_SERVICE_OFFSET) & 0x1ff, 511);
        assert_eq!((request >> SRV_DESTINATION_OFFSET) & 0x7f, 42);
        assert_eq!(request & 0x7f, 1);
        assert!(request < 1 << 29);

        let response = service(
            Priority::Low,
            ServiceId::new(511).unwrap(),
            false,
            node(42),
            node(1),
        )
        .into_u32();
        assert_eq!(response & SRV_REQUEST_FLAG, 0);
        assert_eq!(response | SRV_REQUEST_FLAG, request);
    }

    #[test]
    fn test_for_transfer_dispatch() {
        let spec = DataSpecifier::Request {
            service: ServiceId::new(7).unwrap(),
            destination: node(3),
        };
        assert_eq!(
            for_transfer(Priority::High, &spec, node(9), false),
            service(Priority::High, ServiceId::new(7).unwrap(), true, node(3), node(9))
        );
    }
}
