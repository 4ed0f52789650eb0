// SPDX-License-Identifier: Apache-2.0

//! In-segment layout: queue header, descriptor ring, and payload arena.
//!
//! # Memory layout
//!
//! ```text
//! +------------------------------------------------------------+
//! | QueueHeader (atomics: lock, futex words, depth, settings)  |
//! +------------------------------------------------------------+
//! | ItemDesc[0] .. ItemDesc[slot_cap - 1]   (descriptor ring)  |
//! +------------------------------------------------------------+
//! | Arena: fixed 256-byte blocks chained by next-offset words  |
//! +------------------------------------------------------------+
//! ```
//!
//! Every reference inside the segment is a byte offset from the segment
//! base; each process maps the segment at a different address. Ring and
//! arena state is mutated only inside the cross-process critical section;
//! header counters read by the non-blocking queries are atomics.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{ShqError, ShqResult};
use crate::shm::region::SegmentRegion;

/// Identifies an initialized shq segment.
pub const MAGIC: u64 = 0x7368_715f_7165_7565; // "shq_queue"

/// Bumped on any incompatible change to the structures below.
pub const LAYOUT_VERSION: u32 = 3;

/// Arena block granule, including the chain word.
pub const BLOCK_SIZE: usize = 256;

/// Payload bytes per block.
pub const BLOCK_PAYLOAD: usize = BLOCK_SIZE - 8;

/// Null offset sentinel. Offset 0 is the header, never a block.
pub const NIL: u64 = 0;

/// Depth used when a creator passes 0 ("system maximum").
pub const SYSTEM_MAX_DEPTH: u64 = 1 << 16;

/// Arena blocks provisioned per slot of logical depth.
const BLOCKS_PER_SLOT: u64 = 4;

/// Header flag bits.
pub mod flags {
    /// Expired items are silently dropped instead of delivered.
    pub const DISCARD: u32 = 1 << 0;
    /// Adaptive LIFO insertion at the depth limit.
    pub const LIFO: u32 = 1 << 1;
    /// Segment has been destroyed; all handles must refuse operations.
    pub const DESTROYED: u32 = 1 << 2;
    /// The very first add has happened (INIT already fired).
    pub const INIT_FIRED: u32 = 1 << 3;
    /// Sustained sojourn above the target delay (CoDel backpressure).
    pub const DELAY_EXCEEDED: u32 = 1 << 4;
}

/// Cross-process lock state, resident in the header.
#[repr(C)]
pub struct LockWord {
    /// 0 when free, otherwise the holder's pid. Doubles as a futex word.
    pub owner: AtomicU32,
    /// Bumped on every acquisition, including recovery steals, so a guard
    /// from a dead holder can never release a re-acquired lock.
    pub generation: AtomicU32,
}

/// One notification registration: a process and the signal it asked for.
#[repr(C)]
pub struct SignalTarget {
    pub pid: AtomicU32,
    pub signo: AtomicU32,
}

/// The single shared header at the base of every segment.
#[repr(C)]
pub struct QueueHeader {
    /// `MAGIC`, stored last with Release ordering by the creator.
    pub magic: AtomicU64,
    pub version: AtomicU32,
    _pad0: u32,

    /// Logical depth limit.
    pub max_depth: AtomicU64,
    /// Physical ring capacity, power of two, >= 2 * max_depth.
    pub slot_cap: AtomicU64,
    /// Byte offset of the arena from the segment base.
    pub arena_off: AtomicU64,
    /// Number of arena blocks.
    pub arena_blocks: AtomicU64,

    /// Cross-process critical-section guard.
    pub lock: LockWord,
    /// Futex word bumped on every add (and on `prod`); wakes removers.
    pub item_seq: AtomicU32,
    /// Futex word bumped on every remove/clean (and `prod`); wakes adders.
    pub space_seq: AtomicU32,

    /// Current item count. Mutated under the lock, read lock-free.
    pub depth: AtomicU64,
    /// Ring cursor of the next item to remove (wrapping counter).
    pub head: AtomicU64,
    /// Ring cursor of the next tail insertion (wrapping counter).
    pub tail: AtomicU64,
    /// Head of the arena free list (block offset or `NIL`).
    pub free_head: AtomicU64,
    /// Free blocks remaining.
    pub free_blocks: AtomicU64,
    /// Payload bytes currently resident.
    pub used_bytes: AtomicU64,

    /// Depth-level event threshold; 0 disables LEVEL events.
    pub level: AtomicU64,
    /// Per-item time limit in nanoseconds; 0 disables expiration.
    pub time_limit_ns: AtomicU64,
    /// CoDel target delay in nanoseconds; 0 disables delay monitoring.
    pub target_delay_ns: AtomicU64,
    /// See `flags`.
    pub flags: AtomicU32,
    /// Subscribed-event bitmask (see `Event::mask`).
    pub subscriptions: AtomicU32,
    /// Pending-event bitset consumed by `active_event`.
    pub pending_events: AtomicU32,
    /// Removers currently blocked in a wait.
    pub call_count: AtomicU32,
    /// Bumped by `prod`; a blocked remover that sees it move returns.
    pub prod_count: AtomicU32,
    _pad1: u32,

    /// Timestamp (ns since epoch) of the last empty -> non-empty transition.
    pub last_nonempty_ns: AtomicU64,
    /// When the head sojourn first exceeded the target delay; 0 when below.
    pub delay_exceed_since_ns: AtomicU64,

    /// Monitor process: notified of subscribed events.
    pub monitor: SignalTarget,
    /// Listener process: notified of item arrival.
    pub listener: SignalTarget,
    /// Caller process: notified when blocked removers should re-check.
    pub caller: SignalTarget,
}

/// One descriptor in the slot ring. Accessed only under the lock.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ItemDesc {
    /// `TypeTag` of the item (`Vector` for vector items).
    pub tag: u32,
    /// Sub-item count: 1 for scalars, n for vectors.
    pub vec_count: u32,
    /// Encoded payload length in bytes.
    pub total_len: u64,
    /// CRC32 of the encoded payload.
    pub checksum: u32,
    _pad: u32,
    /// First arena block of the payload chain, or `NIL` when empty.
    pub first_block: u64,
    /// Enqueue timestamp, nanoseconds since the epoch.
    pub enqueue_ns: u64,
}

impl ItemDesc {
    pub fn new(tag: u32, vec_count: u32, total_len: u64, checksum: u32) -> Self {
        Self {
            tag,
            vec_count,
            total_len,
            checksum,
            _pad: 0,
            first_block: NIL,
            enqueue_ns: 0,
        }
    }
}

const HEADER_SIZE: usize = std::mem::size_of::<QueueHeader>();
const DESC_SIZE: usize = std::mem::size_of::<ItemDesc>();

/// Round `value` up to a multiple of `align` (power of two).
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Geometry of a segment, derived from the requested depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub max_depth: u64,
    pub slot_cap: u64,
    pub arena_off: usize,
    pub arena_blocks: u64,
    pub segment_size: usize,
}

impl Geometry {
    /// Compute the geometry for a requested logical depth.
    ///
    /// The physical ring holds twice the logical limit so adaptive LIFO
    /// can overshoot without reclaiming occupied slots.
    pub fn for_depth(requested: u64) -> ShqResult<Self> {
        let max_depth = if requested == 0 {
            SYSTEM_MAX_DEPTH
        } else {
            requested
        };
        if max_depth > SYSTEM_MAX_DEPTH {
            return Err(ShqError::InvalidArgument {
                reason: format!("max depth {} exceeds system maximum {}", max_depth, SYSTEM_MAX_DEPTH),
            });
        }

        let slot_cap = (max_depth * 2).next_power_of_two();
        let arena_blocks = (max_depth * BLOCKS_PER_SLOT).max(64);
        let arena_off = align_up(HEADER_SIZE + slot_cap as usize * DESC_SIZE, 64);
        let segment_size = align_up(
            arena_off + arena_blocks as usize * BLOCK_SIZE,
            SegmentRegion::MIN_SIZE,
        );

        Ok(Self {
            max_depth,
            slot_cap,
            arena_off,
            arena_blocks,
            segment_size,
        })
    }
}

/// Typed view over a mapped segment.
///
/// Owns the `SegmentRegion` and exposes the header, ring, and arena. All
/// ring/arena accessors require the caller to hold the queue lock; the
/// header atomics are safe to read at any time.
pub struct SegmentLayout {
    region: SegmentRegion,
}

impl SegmentLayout {
    /// Initialize a freshly created (zeroed) segment. Creator only.
    pub fn init(region: SegmentRegion, geo: Geometry) -> Self {
        let layout = Self { region };
        let hdr = layout.header();

        hdr.version.store(LAYOUT_VERSION, Ordering::Relaxed);
        hdr.max_depth.store(geo.max_depth, Ordering::Relaxed);
        hdr.slot_cap.store(geo.slot_cap, Ordering::Relaxed);
        hdr.arena_off.store(geo.arena_off as u64, Ordering::Relaxed);
        hdr.arena_blocks.store(geo.arena_blocks, Ordering::Relaxed);

        // Chain every block into the free list.
        let mut prev = NIL;
        for i in (0..geo.arena_blocks).rev() {
            let off = geo.arena_off as u64 + i * BLOCK_SIZE as u64;
            // SAFETY: off is inside the arena of a segment we just created
            unsafe { layout.write_next(off, prev) };
            prev = off;
        }
        hdr.free_head.store(prev, Ordering::Relaxed);
        hdr.free_blocks.store(geo.arena_blocks, Ordering::Relaxed);

        // Publish: openers spin on magic before touching anything else.
        hdr.magic.store(MAGIC, Ordering::Release);

        layout
    }

    /// Attach to an existing segment, verifying magic and version.
    ///
    /// A racing creator may not have published the header yet, so the
    /// magic check retries briefly before giving up.
    pub fn attach(region: SegmentRegion) -> ShqResult<Self> {
        let layout = Self { region };
        let hdr = layout.header();

        let mut spins = 0;
        while hdr.magic.load(Ordering::Acquire) != MAGIC {
            spins += 1;
            if spins > 200 {
                return Err(ShqError::InvalidState {
                    reason: format!(
                        "segment '{}' is not an initialized queue",
                        layout.region.name()
                    ),
                });
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        let version = hdr.version.load(Ordering::Relaxed);
        if version != LAYOUT_VERSION {
            return Err(ShqError::Unsupported {
                reason: format!(
                    "segment layout version {} (this build speaks {})",
                    version, LAYOUT_VERSION
                ),
            });
        }

        let expected = hdr.arena_off.load(Ordering::Relaxed) as usize
            + hdr.arena_blocks.load(Ordering::Relaxed) as usize * BLOCK_SIZE;
        if layout.region.size() < expected {
            return Err(ShqError::InvalidState {
                reason: format!(
                    "segment '{}' smaller than its declared layout",
                    layout.region.name()
                ),
            });
        }

        Ok(layout)
    }

    /// The shared header.
    pub fn header(&self) -> &QueueHeader {
        // SAFETY: the segment is at least MIN_SIZE, the header lives at the
        // base, and QueueHeader is composed of atomics valid for shared access
        unsafe { &*(self.region.as_ptr() as *const QueueHeader) }
    }

    pub fn region(&self) -> &SegmentRegion {
        &self.region
    }

    fn desc_ptr(&self, cursor: u64) -> *mut ItemDesc {
        let slot_cap = self.header().slot_cap.load(Ordering::Relaxed);
        let idx = (cursor & (slot_cap - 1)) as usize;
        // SAFETY: idx < slot_cap and the ring follows the header by layout
        unsafe { (self.region.as_ptr().add(HEADER_SIZE) as *mut ItemDesc).add(idx) }
    }

    /// Read the descriptor at a ring cursor. Caller must hold the lock.
    pub unsafe fn desc(&self, cursor: u64) -> ItemDesc {
        unsafe { std::ptr::read(self.desc_ptr(cursor)) }
    }

    /// Write the descriptor at a ring cursor. Caller must hold the lock.
    pub unsafe fn set_desc(&self, cursor: u64, desc: ItemDesc) {
        unsafe { std::ptr::write(self.desc_ptr(cursor), desc) }
    }

    // ---- arena -------------------------------------------------------

    /// Blocks needed to hold `len` payload bytes.
    pub fn blocks_for(len: usize) -> u64 {
        len.div_ceil(BLOCK_PAYLOAD) as u64
    }

    unsafe fn block_ptr(&self, off: u64) -> *mut u8 {
        debug_assert_ne!(off, NIL);
        unsafe { self.region.as_ptr().add(off as usize) }
    }

    unsafe fn read_next(&self, off: u64) -> u64 {
        unsafe { std::ptr::read(self.block_ptr(off) as *const u64) }
    }

    unsafe fn write_next(&self, off: u64, next: u64) {
        unsafe { std::ptr::write(self.block_ptr(off) as *mut u64, next) }
    }

    /// Allocate a chain of blocks for `len` bytes and copy the payload in.
    ///
    /// Returns the first block offset, or `NIL` for an empty payload.
    /// Fails with `OutOfMemory` without mutating the free list when the
    /// arena cannot hold the payload. Caller must hold the lock.
    pub unsafe fn store_payload(&self, bytes: &[u8]) -> ShqResult<u64> {
        if bytes.is_empty() {
            return Ok(NIL);
        }
        let hdr = self.header();
        let needed = Self::blocks_for(bytes.len());
        if hdr.free_blocks.load(Ordering::Relaxed) < needed {
            return Err(ShqError::OutOfMemory {
                reason: format!(
                    "payload of {} bytes needs {} arena blocks, {} free",
                    bytes.len(),
                    needed,
                    hdr.free_blocks.load(Ordering::Relaxed)
                ),
            });
        }

        let first = hdr.free_head.load(Ordering::Relaxed);
        let mut off = first;
        let mut last = first;
        for chunk in bytes.chunks(BLOCK_PAYLOAD) {
            debug_assert_ne!(off, NIL);
            // SAFETY: off is a live free-list block inside the arena
            unsafe {
                std::ptr::copy_nonoverlapping(
                    chunk.as_ptr(),
                    self.block_ptr(off).add(8),
                    chunk.len(),
                );
            }
            last = off;
            off = unsafe { self.read_next(off) };
        }

        // Detach the chain from the free list.
        hdr.free_head.store(off, Ordering::Relaxed);
        hdr.free_blocks.fetch_sub(needed, Ordering::Relaxed);
        unsafe { self.write_next(last, NIL) };

        Ok(first)
    }

    /// Copy a stored payload back out. Caller must hold the lock.
    pub unsafe fn load_payload(&self, first: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let mut off = first;
        let mut copied = 0;
        while copied < len {
            debug_assert_ne!(off, NIL);
            let take = (len - copied).min(BLOCK_PAYLOAD);
            // SAFETY: the chain was produced by store_payload for this length
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.block_ptr(off).add(8),
                    out.as_mut_ptr().add(copied),
                    take,
                );
                off = self.read_next(off);
            }
            copied += take;
        }
        out
    }

    /// Return a payload chain to the free list. Caller must hold the lock.
    pub unsafe fn free_payload(&self, first: u64) {
        if first == NIL {
            return;
        }
        let hdr = self.header();
        let mut tail = first;
        let mut count = 1;
        // SAFETY: the chain is NIL-terminated by store_payload
        unsafe {
            while self.read_next(tail) != NIL {
                tail = self.read_next(tail);
                count += 1;
            }
            self.write_next(tail, hdr.free_head.load(Ordering::Relaxed));
        }
        hdr.free_head.store(first, Ordering::Relaxed);
        hdr.free_blocks.fetch_add(count, Ordering::Relaxed);
    }
}
