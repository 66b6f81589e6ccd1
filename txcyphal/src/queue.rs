//! Prioritized transmission queue
//!
//! [`TxQueue`] multiplexes concurrent transfers over one CAN interface. A
//! `push` segments a transfer into frames and stages the whole batch before
//! the queue is touched, so capacity or allocator exhaustion leaves no trace.
//! Queued frames are ordered by (priority, enqueue sequence, intra-transfer
//! index); equal priorities drain in insertion order and frames of one
//! transfer never reorder.
//!
//! Frames whose deadline has passed are dropped lazily: `push` sweeps the
//! queue when it needs room, `poll` checks the head. Dropping any frame of a
//! multi-frame transfer drops the rest of that transfer as well; a receiver
//! cannot use a partial transfer.

use core::mem::size_of;
use core::ptr::NonNull;

use intrusive_collections::{LinkedList, LinkedListLink, UnsafeRef, intrusive_adapter};

use crate::can_id::{self, CanId};
use crate::core::{Microsecond, NodeId, Priority, TransferId};
use crate::format::TransferCrc;
use crate::frame::{DataLength, Frame, Mtu, PayloadBuffer, RawPayload, TransferMetadata};
use crate::memory::MemoryResource;
use crate::scatter::Scatter;

/// Errors reported by [`TxQueue::push`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TxError {
    /// The caller contract was violated: a service transfer or a multi-frame
    /// message was pushed without a local node-ID.
    InvalidArgument,
    /// The memory resource is exhausted or the queue capacity would be
    /// exceeded even after expired frames were dropped. The queue is
    /// unchanged.
    OutOfMemory,
}

/// Per-call drop counters, incremented by [`TxQueue::push`] and
/// [`TxQueue::poll`]. The caller resets them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TxStats {
    /// Frames dropped because their deadline passed before transmission.
    pub frames_expired: u64,
    /// Frames dropped because the media reported a failure.
    pub frames_failed: u64,
}

/// What the driver callback reports back to [`TxQueue::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MediaStatus {
    /// The frame was handed to the media; the queue releases it.
    Accepted,
    /// The media cannot take a frame right now; the frame stays at the head.
    Busy,
}

/// Outcome of a successful [`TxQueue::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PollStatus {
    /// The head frame went out and was released.
    Transmitted,
    /// Nothing was transmitted: the queue is empty or the media is busy.
    Busy,
}

/// One pending frame together with its queue bookkeeping.
pub struct TxItem {
    link: LinkedListLink,
    deadline: Microsecond,
    priority: Priority,
    sequence: u64,
    index: usize,
    // Non-owning forward link to the next frame of the same transfer, used
    // only to drop the remainder of a transfer in one go.
    next_in_transfer: Option<NonNull<TxItem>>,
    frame: Frame,
}

impl TxItem {
    pub fn deadline(&self) -> Microsecond {
        self.deadline
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    fn sort_key(&self) -> (Priority, u64, usize) {
        (self.priority, self.sequence, self.index)
    }
}

intrusive_adapter!(TxItemAdapter = UnsafeRef<TxItem>: TxItem { link: LinkedListLink });

/// An item removed from the queue by [`TxQueue::pop`]. The holder owns the
/// descriptor and its payload buffer until both go back through
/// [`TxQueue::free_item`].
#[must_use = "popped items own allocator memory; return them via TxQueue::free_item"]
pub struct DetachedItem {
    item: NonNull<TxItem>,
}

impl DetachedItem {
    pub fn deadline(&self) -> Microsecond {
        unsafe { self.item.as_ref() }.deadline
    }

    pub fn frame(&self) -> &Frame {
        unsafe { &self.item.as_ref().frame }
    }

    /// Takes ownership of the payload buffer away from the item, leaving it
    /// detached. [`TxQueue::free_item`] will then release the descriptor
    /// only; the buffer must go back via [`TxQueue::free_payload`].
    pub fn detach_payload(&mut self) -> Option<RawPayload> {
        unsafe { self.item.as_mut() }.frame.detach_payload()
    }
}

/// Prioritized, deadline-aware frame queue for one CAN interface.
///
/// All storage comes from the [`MemoryResource`] handles supplied at
/// construction: one for item descriptors, one for frame payload buffers
/// (possibly the same resource). The queue performs no synchronization;
/// calls must be externally serialized.
pub struct TxQueue<IM: MemoryResource, PM: MemoryResource = IM> {
    list: LinkedList<TxItemAdapter>,
    size: usize,
    capacity: usize,
    mtu: Mtu,
    sequence: u64,
    item_memory: IM,
    payload_memory: PM,
}

// Safety: the queue exclusively owns every allocation reachable through its
// items, so sending it moves that ownership wholesale.
unsafe impl<IM: MemoryResource + Send, PM: MemoryResource + Send> Send for TxQueue<IM, PM> {}

impl<M: MemoryResource + Clone> TxQueue<M> {
    /// Creates a queue drawing descriptors and payload buffers from one
    /// resource.
    pub fn new(capacity: usize, mtu: Mtu, memory: M) -> Self {
        Self::with_split_memory(capacity, mtu, memory.clone(), memory)
    }
}

impl<IM: MemoryResource, PM: MemoryResource> TxQueue<IM, PM> {
    /// Creates a queue with separate resources for item descriptors and
    /// frame payload buffers.
    pub fn with_split_memory(
        capacity: usize,
        mtu: Mtu,
        item_memory: IM,
        payload_memory: PM,
    ) -> Self {
        Self {
            list: LinkedList::new(TxItemAdapter::new()),
            size: 0,
            capacity,
            mtu,
            sequence: 0,
            item_memory,
            payload_memory,
        }
    }

    /// Frames currently queued.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn mtu(&self) -> Mtu {
        self.mtu
    }

    /// Changes the MTU for subsequent pushes. Frames already queued keep the
    /// lengths they were segmented with.
    pub fn set_mtu(&mut self, mtu: Mtu) {
        self.mtu = mtu;
    }

    /// Walks the queued items in transmission order.
    pub fn iter(&self) -> impl Iterator<Item = &TxItem> {
        self.list.iter()
    }

    /// Segments a transfer and enqueues all of its frames, or none.
    ///
    /// `source` is the local node-ID; `None` pushes an anonymous transfer,
    /// which must be a single-frame message. Every frame inherits `deadline`;
    /// frames not transmitted by then are dropped by a later `push` or
    /// `poll`, counted in `stats.frames_expired`. When the queue is too full,
    /// frames whose deadline precedes `now` are dropped first to make room.
    ///
    /// Returns the number of frames enqueued.
    pub fn push(
        &mut self,
        source: Option<NodeId>,
        deadline: Microsecond,
        metadata: &TransferMetadata,
        payload: &[u8],
        now: Microsecond,
        stats: &mut TxStats,
    ) -> Result<usize, TxError> {
        let frame_count = Scatter::frame_count(payload.len(), self.mtu);
        let can_id = make_can_id(source, metadata, payload, frame_count)?;

        if self.size + frame_count > self.capacity {
            self.drop_expired(now, stats);
            if self.size + frame_count > self.capacity {
                return Err(TxError::OutOfMemory);
            }
        }

        let transfer_id = TransferId::from_u64_truncating(metadata.transfer_id);
        let mut scatter = Scatter::new(transfer_id, payload, self.mtu);
        let sequence = self.sequence;

        // Stage the whole batch before the queue is touched, chaining the
        // frames as they are built; an allocation failure must leave no
        // trace (all-or-nothing).
        let mut head: Option<NonNull<TxItem>> = None;
        let mut tail: Option<NonNull<TxItem>> = None;
        let mut index = 0;
        while let Some(length) = scatter.next_length() {
            match self.stage_item(can_id, deadline, metadata.priority, sequence, index, length, &mut scatter) {
                Some(item) => {
                    match tail {
                        Some(mut prev) => unsafe { prev.as_mut().next_in_transfer = Some(item) },
                        None => head = Some(item),
                    }
                    tail = Some(item);
                }
                None => {
                    let mut staged = head;
                    while let Some(item) = staged {
                        staged = unsafe { item.as_ref() }.next_in_transfer;
                        unsafe { self.release_item(item) };
                    }
                    return Err(TxError::OutOfMemory);
                }
            }
            index += 1;
        }
        debug_assert_eq!(index, frame_count);

        self.sequence = self.sequence.wrapping_add(1);
        let mut staged = head;
        while let Some(item) = staged {
            staged = unsafe { item.as_ref() }.next_in_transfer;
            self.insert(item);
        }
        trace!("queued {} frame(s) at sequence {}", frame_count, sequence);
        Ok(frame_count)
    }

    /// The frame to transmit next. Idempotent until a `pop`, `push` or
    /// `poll` changes the queue.
    pub fn peek(&self) -> Option<&TxItem> {
        self.list.front().get()
    }

    /// Removes the head item without releasing its memory; the caller must
    /// return it via [`Self::free_item`].
    pub fn pop(&mut self) -> Option<DetachedItem> {
        let item = self.list.front_mut().remove()?;
        self.size -= 1;
        let item = UnsafeRef::into_raw(item) as *mut TxItem;
        Some(DetachedItem {
            item: unwrap!(NonNull::new(item)),
        })
    }

    /// Releases a popped item: its payload buffer, unless detached, and then
    /// its descriptor.
    pub fn free_item(&self, item: DetachedItem) {
        unsafe { self.release_item(item.item) };
    }

    /// Returns a detached payload buffer to the payload memory resource.
    pub fn free_payload(&self, payload: RawPayload) {
        let (data, allocated) = payload.into_raw();
        unsafe { self.payload_memory.deallocate(data, allocated) };
    }

    /// Drives transmission: expires stale head frames, then offers the head
    /// to `handler`.
    ///
    /// The frame reference passed to `handler` is valid only for the call;
    /// drivers transmit synchronously or copy. A media failure drops the
    /// head frame and the rest of its transfer (counted in
    /// `stats.frames_failed`) and propagates the error.
    pub fn poll<E, F>(&mut self, now: Microsecond, handler: F, stats: &mut TxStats) -> Result<PollStatus, E>
    where
        F: FnOnce(Microsecond, &Frame) -> Result<MediaStatus, E>,
    {
        let head = loop {
            let Some(head) = self.list.front().get() else {
                return Ok(PollStatus::Busy);
            };
            if head.deadline < now {
                let expired = NonNull::from(head);
                stats.frames_expired += self.drop_transfer(expired) as u64;
                continue;
            }
            break NonNull::from(head);
        };

        let deadline = unsafe { head.as_ref() }.deadline;
        match handler(deadline, unsafe { &head.as_ref().frame }) {
            Ok(MediaStatus::Accepted) => {
                let item = unwrap!(self.pop());
                self.free_item(item);
                Ok(PollStatus::Transmitted)
            }
            Ok(MediaStatus::Busy) => Ok(PollStatus::Busy),
            Err(error) => {
                let failed = self.drop_transfer(head);
                stats.frames_failed += failed as u64;
                warn!("media failure, dropped {} frame(s)", failed);
                Err(error)
            }
        }
    }

    // Allocates and fills one frame: descriptor first, then the payload
    // buffer; failure of either rolls both back.
    #[allow(clippy::too_many_arguments)]
    fn stage_item(
        &mut self,
        can_id: CanId,
        deadline: Microsecond,
        priority: Priority,
        sequence: u64,
        index: usize,
        length: DataLength,
        scatter: &mut Scatter<'_>,
    ) -> Option<NonNull<TxItem>> {
        let item = self.item_memory.allocate(size_of::<TxItem>())?.cast::<TxItem>();
        debug_assert_eq!(item.as_ptr() as usize % core::mem::align_of::<TxItem>(), 0);

        let Some(data) = self.payload_memory.allocate(length.as_usize()) else {
            unsafe { self.item_memory.deallocate(item.cast(), size_of::<TxItem>()) };
            return None;
        };

        let bytes = unsafe { core::slice::from_raw_parts_mut(data.as_ptr(), length.as_usize()) };
        scatter.fill(bytes);

        unsafe {
            item.as_ptr().write(TxItem {
                link: LinkedListLink::new(),
                deadline,
                priority,
                sequence,
                index,
                next_in_transfer: None,
                frame: Frame::new(
                    can_id,
                    PayloadBuffer::from_raw(data, length.as_usize(), length.as_usize()),
                ),
            });
        }
        Some(item)
    }

    // Sorted insertion, scanning from the back: pushes typically append.
    fn insert(&mut self, item: NonNull<TxItem>) {
        let key = unsafe { item.as_ref() }.sort_key();
        let mut cursor = self.list.back_mut();
        while let Some(queued) = cursor.get() {
            if queued.sort_key() <= key {
                break;
            }
            cursor.move_prev();
        }
        cursor.insert_after(unsafe { UnsafeRef::from_raw(item.as_ptr()) });
        self.size += 1;
    }

    // Drops every expired transfer. Restarting the scan after each removal
    // keeps the cursor simple; the queue is bounded by `capacity`.
    fn drop_expired(&mut self, now: Microsecond, stats: &mut TxStats) {
        loop {
            let expired = self
                .list
                .iter()
                .find(|item| item.deadline < now)
                .map(NonNull::from);
            match expired {
                Some(item) => stats.frames_expired += self.drop_transfer(item) as u64,
                None => break,
            }
        }
    }

    // Unlinks and releases `first` and every later frame of its transfer.
    fn drop_transfer(&mut self, first: NonNull<TxItem>) -> usize {
        let mut dropped = 0;
        let mut next = Some(first);
        while let Some(item) = next {
            next = unsafe { item.as_ref() }.next_in_transfer;
            let mut position = unsafe { self.list.cursor_mut_from_ptr(item.as_ptr()) };
            unwrap!(position.remove());
            self.size -= 1;
            unsafe { self.release_item(item) };
            dropped += 1;
        }
        dropped
    }

    // Safety: `item` must be staged or already unlinked from the list, and
    // must not be used afterwards.
    unsafe fn release_item(&self, mut item: NonNull<TxItem>) {
        if let Some(payload) = unsafe { item.as_mut() }.frame.detach_payload() {
            let (data, allocated) = payload.into_raw();
            unsafe { self.payload_memory.deallocate(data, allocated) };
        }
        unsafe { self.item_memory.deallocate(item.cast(), size_of::<TxItem>()) };
    }
}

impl<IM: MemoryResource, PM: MemoryResource> Drop for TxQueue<IM, PM> {
    fn drop(&mut self) {
        while let Some(item) = self.pop() {
            self.free_item(item);
        }
    }
}

fn make_can_id(
    source: Option<NodeId>,
    metadata: &TransferMetadata,
    payload: &[u8],
    frame_count: usize,
) -> Result<CanId, TxError> {
    match source {
        Some(source) => Ok(can_id::for_transfer(
            metadata.priority,
            &metadata.data_spec,
            source,
            false,
        )),
        None if metadata.data_spec.is_service() => Err(TxError::InvalidArgument),
        None if frame_count > 1 => Err(TxError::InvalidArgument),
        None => {
            // Anonymous single-frame message: a payload-derived pseudo
            // node-ID spreads concurrent anonymous publishers apart.
            let mut crc = TransferCrc::default();
            crc.add_bytes(payload);
            let pseudo_source = NodeId::from_truncating(crc.get() as u8);
            Ok(can_id::for_transfer(
                metadata.priority,
                &metadata.data_spec,
                pseudo_source,
                true,
            ))
        }
    }
}
