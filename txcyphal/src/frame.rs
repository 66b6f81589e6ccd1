//! Transport frame objects and transfer metadata

use core::ptr::NonNull;

use crate::can_id::CanId;
use crate::core::{NodeId, Priority, ServiceId, SubjectId};
use crate::format::TailByte;

/// CAN-FD-compatible data length
///
/// The data length code (DLC) of CAN-FD frames supports a limited set of
/// lengths: 0..8 byte-wise, then 12, 16, 20, 24, 32, 48, 64. Classic CAN
/// frames use the 0..8 subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DataLength(u8);

impl DataLength {
    pub const MAX: usize = 64;

    pub const fn new(value: usize) -> Option<Self> {
        let floor = Self::new_floor(value);
        if floor.as_usize() == value {
            Some(floor)
        } else {
            None
        }
    }

    pub const fn new_floor(value: usize) -> Self {
        let floor = match value {
            0..8 => value,
            8..24 => value / 4 * 4,
            24..32 => value / 8 * 8,
            32..64 => value / 16 * 16,
            64.. => 64,
        };
        Self(floor as u8)
    }

    pub const fn new_ceil(value: usize) -> Option<Self> {
        if value <= Self::MAX {
            let ceil = match value {
                0..8 => value,
                8..24 => value.div_ceil(4) * 4,
                24..32 => value.div_ceil(8) * 8,
                32.. => value.div_ceil(16) * 16,
            };
            Some(Self(ceil as u8))
        } else {
            None
        }
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl From<DataLength> for usize {
    fn from(value: DataLength) -> Self {
        value.as_usize()
    }
}

/// Transport-layer maximum transmission unit
///
/// Any legal data length from 8 (Classic CAN) to 64 (CAN-FD) is accepted;
/// `new` floors intermediate values to the nearest legal length. An MTU
/// change on a live queue affects subsequent pushes only; frames already
/// segmented keep their lengths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Mtu(DataLength);

impl Mtu {
    pub const CLASSIC: Mtu = Mtu(DataLength::new_floor(8));
    pub const FD: Mtu = Mtu(DataLength::new_floor(64));

    pub const fn new(value: usize) -> Option<Self> {
        if value >= Self::CLASSIC.as_usize() && value <= DataLength::MAX {
            Some(Self(DataLength::new_floor(value)))
        } else {
            None
        }
    }

    pub const fn as_usize(&self) -> usize {
        self.0.as_usize()
    }
}

impl From<Mtu> for usize {
    fn from(value: Mtu) -> Self {
        value.as_usize()
    }
}

/// Encodes the semantic properties of the data carried by a transfer and its
/// kind. Messages are broadcast and carry no destination; requests and
/// responses always address a remote node.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DataSpecifier {
    Message {
        subject: SubjectId,
    },
    Request {
        service: ServiceId,
        destination: NodeId,
    },
    Response {
        service: ServiceId,
        destination: NodeId,
    },
}

impl DataSpecifier {
    pub const fn is_service(&self) -> bool {
        !matches!(self, DataSpecifier::Message { .. })
    }
}

/// Application-supplied description of one transfer.
///
/// `transfer_id` is the application's monotonic counter; the wire carries it
/// modulo 32 in every tail byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TransferMetadata {
    pub priority: Priority,
    pub data_spec: DataSpecifier,
    pub transfer_id: u64,
}

/// Frame payload storage obtained from a [`MemoryResource`].
///
/// `used` is what the driver must put on the bus (the tail byte included);
/// `allocated` is what the buffer owns and what must eventually go back to
/// the allocator. The two differ only after the payload has been detached.
///
/// [`MemoryResource`]: crate::memory::MemoryResource
#[derive(Debug)]
pub struct PayloadBuffer {
    data: Option<NonNull<u8>>,
    used: usize,
    allocated: usize,
}

impl PayloadBuffer {
    /// # Safety
    ///
    /// `data` must point to at least `allocated` initialized bytes with
    /// `used <= allocated`, and stay valid until the buffer is detached or
    /// released.
    pub(crate) unsafe fn from_raw(data: NonNull<u8>, used: usize, allocated: usize) -> Self {
        Self {
            data: Some(data),
            used,
            allocated,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match self.data {
            Some(data) => unsafe { core::slice::from_raw_parts(data.as_ptr(), self.used) },
            None => &[],
        }
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub(crate) fn detach(&mut self) -> Option<RawPayload> {
        let data = self.data.take()?;
        let allocated = self.allocated;
        self.used = 0;
        self.allocated = 0;
        Some(RawPayload {
            data,
            allocated,
        })
    }
}

/// A payload buffer detached from its frame. The holder owns the underlying
/// allocation and must return it via [`TxQueue::free_payload`].
///
/// [`TxQueue::free_payload`]: crate::queue::TxQueue::free_payload
#[derive(Debug)]
#[must_use = "detached payloads must be returned to the allocator"]
pub struct RawPayload {
    data: NonNull<u8>,
    allocated: usize,
}

impl RawPayload {
    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.data.as_ptr(), self.allocated) }
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub(crate) fn into_raw(self) -> (NonNull<u8>, usize) {
        (self.data, self.allocated)
    }
}

/// One CAN or CAN-FD frame ready for transmission.
#[derive(Debug)]
pub struct Frame {
    can_id: CanId,
    payload: PayloadBuffer,
}

impl Frame {
    pub(crate) fn new(can_id: CanId, payload: PayloadBuffer) -> Self {
        Self {
            can_id,
            payload,
        }
    }

    /// The 29-bit extended CAN identifier.
    pub fn can_id(&self) -> CanId {
        self.can_id
    }

    /// The bytes the driver must transmit, tail byte last.
    pub fn payload(&self) -> &[u8] {
        self.payload.as_slice()
    }

    pub fn payload_buffer(&self) -> &PayloadBuffer {
        &self.payload
    }

    /// The tail byte, `None` once the payload has been detached.
    pub fn tail(&self) -> Option<TailByte> {
        self.payload().last().map(|&byte| TailByte::from(byte))
    }

    pub(crate) fn detach_payload(&mut self) -> Option<RawPayload> {
        self.payload.detach()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID_CAN_LENGTH: [usize; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 12, 16, 20, 24, 32, 48, 64];

    #[test]
    fn test_data_length_buckets() {
        for len in 0usize..100 {
            let floor = VALID_CAN_LENGTH
                .iter()
                .copied()
                .filter(|&v| v <= len)
                .max()
                .unwrap();
            assert_eq!(DataLength::new_floor(len).as_usize(), floor);

            let ceil = VALID_CAN_LENGTH.iter().copied().find(|&v| v >= len);
            assert_eq!(DataLength::new_ceil(len).map(|v| v.as_usize()), ceil);

            assert_eq!(
                DataLength::new(len).map(|v| v.as_usize()),
                VALID_CAN_LENGTH.contains(&len).then_some(len)
            );
        }
    }

    #[test]
    fn test_mtu_flooring() {
        assert_eq!(Mtu::new(8), Some(Mtu::CLASSIC));
        assert_eq!(Mtu::new(64), Some(Mtu::FD));
        assert_eq!(Mtu::new(32).unwrap().as_usize(), 32);
        assert_eq!(Mtu::new(33).unwrap().as_usize(), 32);
        assert_eq!(Mtu::new(63).unwrap().as_usize(), 48);
        assert!(Mtu::new(7).is_none());
        assert!(Mtu::new(65).is_none());
    }
}
