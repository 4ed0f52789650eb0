// SPDX-License-Identifier: Apache-2.0

//! Shared memory substrate.
//!
//! Segment allocation, the in-segment layout (header, descriptor ring,
//! payload arena), the crash-recoverable cross-process lock, and the
//! futex-based blocking primitives.

pub(crate) mod layout;
pub(crate) mod lock;
mod region;
pub(crate) mod wait;

pub use region::SegmentRegion;
pub use wait::WaitOutcome;
