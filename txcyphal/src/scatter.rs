use core::cmp::{max, min};

use crate::core::TransferId;
use crate::format::{PAD_VALUE, SOT_TOGGLE_BIT, TailByte, TransferCrc};
use crate::frame::{DataLength, Mtu};

/// Transfer segmentation engine
///
/// Walks a transfer payload and produces frame images one at a time:
/// `next_length` announces the legal data length of the next frame so the
/// caller can allocate its buffer, `fill` writes the frame into it. The
/// conceptual stream being consumed is `payload ‖ CRC` for multi-frame
/// transfers; single-frame transfers carry no CRC.
///
/// Layout rules:
/// * every non-terminal frame packs `MTU - 1` payload bytes plus the tail;
/// * the terminal frame takes the smallest legal data length that fits the
///   leftover payload, the CRC bytes that still belong in it, and the tail;
/// * zero padding goes before the CRC and is covered by it; padding can only
///   appear in the terminal frame (or in a single-frame transfer, before the
///   tail);
/// * when the terminal frame cannot hold both CRC bytes, the high byte spills
///   into the penultimate frame.
pub struct Scatter<'a> {
    transfer_id: TransferId,
    payload: &'a [u8],
    mtu: Mtu,
    toggle_bit: bool,
    offset: usize,
    crc: TransferCrc,
}

impl<'a> Scatter<'a> {
    const CRC_LENGTH: usize = TransferCrc::LENGTH;
    const TAIL_LENGTH: usize = 1;

    pub fn new(transfer_id: TransferId, payload: &'a [u8], mtu: Mtu) -> Self {
        let mut crc = TransferCrc::default();
        crc.add_bytes(payload);
        Self {
            transfer_id,
            payload,
            mtu,
            toggle_bit: SOT_TOGGLE_BIT,
            offset: 0,
            crc,
        }
    }

    /// Number of frames a payload of `payload_length` takes at the given MTU.
    pub fn frame_count(payload_length: usize, mtu: Mtu) -> usize {
        let max_segment = mtu.as_usize() - Self::TAIL_LENGTH;
        if payload_length <= max_segment {
            1
        } else {
            (payload_length + Self::CRC_LENGTH).div_ceil(max_segment)
        }
    }

    /// Data length of the next frame, `None` when the transfer is exhausted.
    pub fn next_length(&self) -> Option<DataLength> {
        let max_segment = self.mtu.as_usize() - Self::TAIL_LENGTH;
        if self.offset == 0 && self.payload.len() <= max_segment {
            return DataLength::new_ceil(self.payload.len() + Self::TAIL_LENGTH);
        }

        let residual = self.payload.len() + Self::CRC_LENGTH - self.offset;
        if residual == 0 {
            return None;
        }
        DataLength::new_ceil(min(residual, max_segment) + Self::TAIL_LENGTH)
    }

    /// Writes the next frame image into `data`, whose length must equal the
    /// last `next_length` answer.
    pub fn fill(&mut self, data: &mut [u8]) {
        debug_assert_eq!(self.next_length().map(usize::from), Some(data.len()));
        let (tail, body) = unwrap!(data.split_last_mut());
        let max_segment = self.mtu.as_usize() - Self::TAIL_LENGTH;

        if self.offset == 0 && self.payload.len() <= max_segment {
            let (body_data, body_pad) = body.split_at_mut(self.payload.len());
            body_data.copy_from_slice(self.payload);
            body_pad.fill(PAD_VALUE);
            *tail = TailByte::new(true, true, SOT_TOGGLE_BIT, self.transfer_id).into();
            // No CRC on a single-frame transfer; mark it consumed.
            self.offset = self.payload.len() + Self::CRC_LENGTH;
            return;
        }

        let sot = self.offset == 0;
        let residual = self.payload.len() + Self::CRC_LENGTH - self.offset;
        if residual >= body.len() {
            self.fill_packed(body);
        } else {
            self.fill_padded(body);
        }

        let eot = self.offset == self.payload.len() + Self::CRC_LENGTH;
        *tail = TailByte::new(sot, eot, self.toggle_bit, self.transfer_id).into();
        self.toggle_bit = !self.toggle_bit;
    }

    // Fills the body entirely from the residual payload and CRC stream.
    fn fill_packed(&mut self, body: &mut [u8]) {
        let residual_data = &self.payload[min(self.offset, self.payload.len())..];
        let (body_data, body_crc) = body.split_at_mut(min(residual_data.len(), body.len()));
        body_data.copy_from_slice(&residual_data[..body_data.len()]);

        let crc_offset = max(self.offset, self.payload.len()) - self.payload.len();
        let crc_bytes = self.crc.get().to_be_bytes();
        body_crc.copy_from_slice(&crc_bytes[crc_offset..crc_offset + body_crc.len()]);

        self.offset += body.len();
    }

    // Fills the terminal frame with the leftover payload, zero padding, and
    // a CRC extended over the padding.
    fn fill_padded(&mut self, body: &mut [u8]) {
        debug_assert!(
            self.offset <= self.payload.len(),
            "padding cannot be inserted once the CRC has started"
        );
        let residual_data = &self.payload[self.offset..];

        let (body_front, body_crc) = unwrap!(body.split_last_chunk_mut::<{ TransferCrc::LENGTH }>());
        let (body_data, body_pad) = body_front.split_at_mut(residual_data.len());
        body_data.copy_from_slice(residual_data);
        body_pad.fill(PAD_VALUE);

        let mut crc = self.crc;
        crc.add_bytes(body_pad);
        *body_crc = crc.get().to_be_bytes();

        self.offset += body_data.len() + Self::CRC_LENGTH;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapless::Vec;

    const TRANSFER_ID: TransferId = TransferId::from_truncating(27);

    fn frames(payload: &[u8], mtu: Mtu) -> Vec<Vec<u8, 64>, 8> {
        let mut scatter = Scatter::new(TRANSFER_ID, payload, mtu);
        let mut frames = Vec::new();
        while let Some(length) = scatter.next_length() {
            let mut data = Vec::new();
            data.resize(length.as_usize(), 0xff).unwrap();
            scatter.fill(&mut data);
            frames.push(data).unwrap();
        }
        assert_eq!(frames.len(), Scatter::frame_count(payload.len(), mtu));
        frames
    }

    #[test]
    fn test_empty_payload() {
        let produced = frames(&[], Mtu::CLASSIC);
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0][..], [0b1110_0000 + 27]);
    }

    #[test]
    fn test_non_full_single_frame() {
        let produced = frames(&[0, 1, 2, 3, 4, 5], Mtu::CLASSIC);
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0][..], [0, 1, 2, 3, 4, 5, 0b1110_0000 + 27]);
    }

    #[test]
    fn test_full_single_frame() {
        let produced = frames(&[0, 1, 2, 3, 4, 5, 6], Mtu::CLASSIC);
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0][..], [0, 1, 2, 3, 4, 5, 6, 0b1110_0000 + 27]);
    }

    #[test]
    fn test_minimum_double_frame() {
        let produced = frames(&[0, 1, 2, 3, 4, 5, 6, 7], Mtu::CLASSIC);
        assert_eq!(produced.len(), 2);
        assert_eq!(produced[0][..], [0, 1, 2, 3, 4, 5, 6, 0b1010_0000 + 27]);
        assert_eq!(produced[1][..], [7, 0x17, 0x8d, 0b0100_0000 + 27]);
    }

    #[test]
    fn test_non_full_double_frame() {
        let payload: [u8; 11] = core::array::from_fn(|i| i as u8);
        let produced = frames(&payload, Mtu::CLASSIC);
        assert_eq!(produced.len(), 2);
        assert_eq!(produced[0][..], [0, 1, 2, 3, 4, 5, 6, 0b1010_0000 + 27]);
        assert_eq!(produced[1][..], [7, 8, 9, 10, 0x19, 0x44, 0b0100_0000 + 27]);
    }

    #[test]
    fn test_full_double_frame() {
        let payload: [u8; 12] = core::array::from_fn(|i| i as u8);
        let produced = frames(&payload, Mtu::CLASSIC);
        assert_eq!(produced.len(), 2);
        assert_eq!(produced[0][..], [0, 1, 2, 3, 4, 5, 6, 0b1010_0000 + 27]);
        assert_eq!(produced[1][..], [7, 8, 9, 10, 11, 0x76, 0x73, 0b0100_0000 + 27]);
    }

    #[test]
    fn test_minimal_triple_frame() {
        let payload: [u8; 13] = core::array::from_fn(|i| i as u8);
        let produced = frames(&payload, Mtu::CLASSIC);
        assert_eq!(produced.len(), 3);
        assert_eq!(produced[0][..], [0, 1, 2, 3, 4, 5, 6, 0b1010_0000 + 27]);
        assert_eq!(produced[1][..], [7, 8, 9, 10, 11, 12, 0xac, 0b0000_0000 + 27]);
        assert_eq!(produced[2][..], [0xdd, 0b0110_0000 + 27]);
    }

    #[test]
    fn test_crc_only_terminal_frame() {
        let payload: [u8; 14] = core::array::from_fn(|i| i as u8);
        let produced = frames(&payload, Mtu::CLASSIC);
        assert_eq!(produced.len(), 3);
        assert_eq!(produced[1][..], [7, 8, 9, 10, 11, 12, 13, 0b0000_0000 + 27]);
        assert_eq!(produced[2][..], [0x78, 0xcb, 0b0110_0000 + 27]);
    }

    #[test]
    fn test_crc_split_over_frame_boundary() {
        let payload: [u8; 61] = core::array::from_fn(|i| i as u8);
        let produced = frames(&payload, Mtu::new(32).unwrap());
        assert_eq!(produced.len(), 3);
        assert_eq!(produced[0].len(), 32);
        assert_eq!(produced[0][..31], payload[..31]);
        assert_eq!(produced[0][31], 0b1010_0000 + 27);
        assert_eq!(produced[1].len(), 32);
        assert_eq!(produced[1][..30], payload[31..61]);
        assert_eq!(produced[1][30], 0x55); // CRC16(0..=60) == 0x554e, high byte
        assert_eq!(produced[1][31], 0b0000_0000 + 27);
        assert_eq!(produced[2][..], [0x4e, 0b0110_0000 + 27]);
    }

    #[test]
    fn test_padding_single_frame() {
        let produced = frames(&[0, 1, 2, 3, 4, 5, 6, 7], Mtu::FD);
        assert_eq!(produced.len(), 1);
        assert_eq!(produced[0][..], [0, 1, 2, 3, 4, 5, 6, 7, 0, 0, 0, 0b1110_0000 + 27]);
    }

    #[test]
    fn test_padding_multi_frame() {
        let payload: [u8; 69] = core::array::from_fn(|i| i as u8);
        let produced = frames(&payload, Mtu::FD);
        assert_eq!(produced.len(), 2);

        let mut first: Vec<u8, 64> = Vec::from_slice(&payload[..63]).unwrap();
        first.push(0b1010_0000 + 27).unwrap();
        assert_eq!(produced[0], first);

        // Three bytes of padding folded into the CRC before its placement.
        assert_eq!(
            produced[1],
            [63, 64, 65, 66, 67, 68, 0, 0, 0, 0xd6, 0x2c, 0b0100_0000 + 27]
        );
    }

    #[test]
    fn test_frame_count_plan() {
        assert_eq!(Scatter::frame_count(0, Mtu::CLASSIC), 1);
        assert_eq!(Scatter::frame_count(7, Mtu::CLASSIC), 1);
        assert_eq!(Scatter::frame_count(8, Mtu::CLASSIC), 2);
        assert_eq!(Scatter::frame_count(61, Mtu::new(32).unwrap()), 3);
        assert_eq!(Scatter::frame_count(62, Mtu::new(32).unwrap()), 3);
        assert_eq!(Scatter::frame_count(112, Mtu::FD), 2);
        assert_eq!(Scatter::frame_count(63, Mtu::FD), 1);
        assert_eq!(Scatter::frame_count(64, Mtu::FD), 2);
    }
}
