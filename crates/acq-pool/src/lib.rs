//! Reusable slot storage for the frame pipeline.
//!
//! Hardware layers publish captured frames into a [`RingBuffer`] without ever
//! blocking; consumers read them on their own threads. A full buffer is never
//! an error: depending on the keep-fresh policy the oldest unread slot is
//! recycled (a counted missed read) or the write is rejected (a counted failed
//! write).
//!
//! ```
//! use acq_pool::{CancelToken, RingBuffer};
//!
//! let ring = RingBuffer::new(2, || vec![0u8; 16]).unwrap();
//! if let Some(mut slot) = ring.acquire_for_write() {
//!     slot[0] = 7;
//!     slot.publish();
//! }
//! let first = ring.blocking_read(|buf| buf[0], &CancelToken::new());
//! assert_eq!(first, Some(7));
//! ```

pub mod cancel;
pub mod ring_buffer;

pub use cancel::CancelToken;
pub use ring_buffer::{
    try_copy_in, RingBuffer, RingBufferError, RingBufferWrite, WriteSlot, READ_POLL_INTERVAL,
};
