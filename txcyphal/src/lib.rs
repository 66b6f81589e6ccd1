//! # Txcyphal
//!
//! This library implements the transmission side of the Cyphal/CAN transport
//! \[1\] for no_std environments. It turns application transfers (a payload
//! plus priority, kind, port, and transfer-ID) into an ordered stream of
//! CAN/CAN-FD frames for a driver to put on the bus, under a strict memory
//! ceiling supplied entirely by the integrator.
//!
//! ## Architecture
//!
//! ```text
//!  application                    driver
//!      │ push(transfer, deadline)     ▲ poll(now, handler)
//!      ▼                             │
//! ┌───────────┐  frames  ┌───────────┴──┐
//! │  Scatter  ├─────────►│   TxQueue    │
//! └───────────┘          └──────┬───────┘
//!                               │ allocate / deallocate
//!                        ┌──────▼───────┐
//!                        │MemoryResource│
//!                        └──────────────┘
//! ```
//!
//! Components:
//! * _Scatter_ segments one transfer into frames: tail byte with
//!   start/end/toggle bits, transfer CRC across frame boundaries, zero
//!   padding up to the next legal CAN-FD length.
//! * _TxQueue_ holds pending frames ordered by (priority, enqueue order,
//!   intra-transfer index), enqueues a transfer all-or-nothing, drops frames
//!   whose deadline has passed, and hands the head frame to the driver
//!   callback.
//! * _MemoryResource_ is the caller's allocator; item descriptors and frame
//!   payload buffers may come from two separate resources.
//!
//! The CAN identifier layout is a pure helper ([`can_id`]); the receive
//! pipeline, node identity management, and the driver's bus I/O live outside
//! this crate.
//!
//! ## Concurrency model
//!
//! Single-threaded cooperative. No call blocks or suspends; every operation
//! is bounded by the number of frames it touches. All access to a queue and
//! its memory resources must be externally serialized; the driver callback
//! must not re-enter the queue (the borrow checker enforces this for safe
//! code).
//!
//! # References:
//!
//! * \[1\] Cyphal Specification v1.0
//!   <https://opencyphal.org/specification/Cyphal_Specification.pdf>
#![no_std]

pub use txcyphal_core as core;

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod can_id;
mod format;
pub mod frame;
pub mod memory;
pub mod queue;
mod scatter;

pub use format::{PAD_VALUE, SOT_TOGGLE_BIT, TailByte, TransferCrc};
pub use queue::{DetachedItem, MediaStatus, PollStatus, TxError, TxItem, TxQueue, TxStats};
