// SPDX-License-Identifier: Apache-2.0

//! The shared queue facade.
//!
//! A `SharedQueue` is one process's handle onto a named segment. All
//! mutation of the ring happens in short critical sections under the
//! crash-recoverable lock; the blocking add/remove variants sleep on
//! in-segment futex words between attempts. Ordering is FIFO, except
//! that adaptive LIFO (when enabled, at the depth limit) inserts at the
//! next-removed position.

mod codec;
mod congestion;
mod events;
mod expire;

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::{ShqError, ShqResult};
use crate::shm::layout::{flags, Geometry, ItemDesc, QueueHeader, SegmentLayout};
use crate::shm::lock;
use crate::shm::wait::{advance, wait_until, WaitOutcome};
use crate::shm::SegmentRegion;
use crate::types::{Event, Mode, QueueName, TypeTag};

pub use codec::{Item, SubItem, MAX_PAYLOAD_SIZE};

/// Nanoseconds since the epoch, CLOCK_REALTIME.
pub(crate) fn now_ns() -> u64 {
    match nix::time::clock_gettime(nix::time::ClockId::CLOCK_REALTIME) {
        Ok(ts) => ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64,
        Err(e) => {
            tracing::error!(error = %e, "clock_gettime failed");
            0
        }
    }
}

fn system_time_ns(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_nanos() as u64
}

/// Blocking behavior of an add/remove variant.
#[derive(Clone, Copy)]
enum Wait {
    No,
    Forever,
    Timed(Duration),
}

impl Wait {
    fn deadline(self) -> Option<Instant> {
        match self {
            Wait::Timed(d) => Some(Instant::now() + d),
            _ => None,
        }
    }
}

/// Decrements the blocked-remover count on scope exit.
struct CallCountGuard<'a>(&'a QueueHeader);

impl<'a> CallCountGuard<'a> {
    fn enter(header: &'a QueueHeader) -> Self {
        header.call_count.fetch_add(1, Ordering::AcqRel);
        Self(header)
    }
}

impl Drop for CallCountGuard<'_> {
    fn drop(&mut self) {
        self.0.call_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A handle onto a named, crash-resilient, multi-process shared queue.
///
/// Handles are cheap process-local state; the queue itself lives in the
/// segment and survives every attached process. Items round-trip with
/// their exact bytes, length, and type tag. Dropping a handle detaches
/// without destroying shared content; `destroy` unlinks the queue for
/// everyone.
pub struct SharedQueue {
    layout: SegmentLayout,
    mode: Mode,
}

impl SharedQueue {
    // ---- lifecycle ---------------------------------------------------

    /// Create a new queue. Fails with `AlreadyExists` if the name is
    /// taken. A `max_depth` of 0 selects the system maximum.
    pub fn create(name: &str, max_depth: u64, mode: Mode) -> ShqResult<Self> {
        let name = QueueName::new(name)?;
        let geo = Geometry::for_depth(max_depth)?;
        let region = SegmentRegion::create(&name, geo.segment_size)?;
        let layout = SegmentLayout::init(region, geo);
        layout
            .header()
            .last_nonempty_ns
            .store(now_ns(), Ordering::Relaxed);

        tracing::debug!(name = %name, max_depth = geo.max_depth, %mode, "created queue");
        Ok(Self { layout, mode })
    }

    /// Open an existing queue. Fails with `NotFound` if absent.
    pub fn open(name: &str, mode: Mode) -> ShqResult<Self> {
        let name = QueueName::new(name)?;
        let region = SegmentRegion::open(&name)?;
        let layout = SegmentLayout::attach(region)?;
        if layout.header().flags.load(Ordering::Acquire) & flags::DESTROYED != 0 {
            return Err(ShqError::InvalidState {
                reason: format!("queue '{}' has been destroyed", name),
            });
        }

        tracing::debug!(name = %name, %mode, "opened queue");
        Ok(Self { layout, mode })
    }

    /// Open the queue if it exists, otherwise create it. Racing creators
    /// are resolved by the segment allocator: exactly one wins creation
    /// and the losers transparently fall back to opening.
    pub fn open_or_create(name: &str, max_depth: u64, mode: Mode) -> ShqResult<Self> {
        match Self::open(name, mode) {
            Err(ShqError::NotFound { .. }) => {}
            other => return other,
        }
        match Self::create(name, max_depth, mode) {
            Err(ShqError::AlreadyExists { .. }) => Self::open(name, mode),
            other => other,
        }
    }

    /// Non-blocking existence probe for a queue name.
    pub fn is_valid(name: &str) -> bool {
        match QueueName::new(name) {
            Ok(name) => SegmentRegion::exists(&name),
            Err(_) => false,
        }
    }

    /// Detach from the queue, preserving shared content.
    pub fn close(self) {
        drop(self);
    }

    /// Destroy the queue: mark it dead for every attached handle, wake
    /// all waiters, and unlink the segment name.
    pub fn destroy(self) -> ShqResult<()> {
        let header = self.header();
        header.flags.fetch_or(flags::DESTROYED, Ordering::AcqRel);
        advance(&header.item_seq);
        advance(&header.space_seq);
        events::notify(&header.caller, "caller");

        let name = self.layout.region().name().clone();
        match SegmentRegion::unlink(&name) {
            // Another handle already unlinked it; the flag is what counts.
            Err(ShqError::NotFound { .. }) | Ok(()) => {}
            Err(e) => return Err(e),
        }
        tracing::debug!(name = %name, "destroyed queue");
        Ok(())
    }

    // ---- insertion ---------------------------------------------------

    /// Add an opaque byte stream. Fails with `DepthLimitReached` at the
    /// depth limit unless adaptive LIFO is enabled.
    pub fn add(&self, bytes: &[u8]) -> ShqResult<()> {
        self.enqueue(codec::encode_scalar(TypeTag::Stream, bytes)?, Wait::No)
    }

    /// Add a typed scalar; the byte length is validated against the tag.
    pub fn add_typed(&self, tag: TypeTag, bytes: &[u8]) -> ShqResult<()> {
        self.enqueue(codec::encode_scalar(tag, bytes)?, Wait::No)
    }

    /// Add a byte stream, blocking while the queue is at its limit.
    pub fn add_wait(&self, bytes: &[u8]) -> ShqResult<()> {
        self.enqueue(codec::encode_scalar(TypeTag::Stream, bytes)?, Wait::Forever)
    }

    /// Add a byte stream, blocking up to `timeout` while at the limit.
    /// Expiry surfaces `DepthLimitReached`.
    pub fn add_timedwait(&self, bytes: &[u8], timeout: Duration) -> ShqResult<()> {
        self.enqueue(
            codec::encode_scalar(TypeTag::Stream, bytes)?,
            Wait::Timed(timeout),
        )
    }

    /// Add a vector of typed sub-items as one atomic item. Every pair is
    /// validated before any shared state changes: all-or-nothing.
    pub fn addv(&self, items: &[(TypeTag, &[u8])]) -> ShqResult<()> {
        self.enqueue(codec::encode_vector(items)?, Wait::No)
    }

    /// Vector add, blocking while the queue is at its limit.
    pub fn addv_wait(&self, items: &[(TypeTag, &[u8])]) -> ShqResult<()> {
        self.enqueue(codec::encode_vector(items)?, Wait::Forever)
    }

    /// Vector add with a bounded block.
    pub fn addv_timedwait(&self, items: &[(TypeTag, &[u8])], timeout: Duration) -> ShqResult<()> {
        self.enqueue(codec::encode_vector(items)?, Wait::Timed(timeout))
    }

    // ---- removal -----------------------------------------------------

    /// Remove the next item without blocking. `Ok(None)` means empty.
    pub fn remove(&self) -> ShqResult<Option<Item>> {
        self.dequeue(Wait::No)
    }

    /// Remove the next item, blocking until one arrives. A `prod` from
    /// any handle ends the wait with `Ok(None)`.
    pub fn remove_wait(&self) -> ShqResult<Option<Item>> {
        self.dequeue(Wait::Forever)
    }

    /// Remove the next item, blocking up to `timeout`. Expiry or a
    /// `prod` returns `Ok(None)`, never an error.
    pub fn remove_timedwait(&self, timeout: Duration) -> ShqResult<Option<Item>> {
        self.dequeue(Wait::Timed(timeout))
    }

    // ---- notification registration ------------------------------------

    /// Register the calling process to be signaled on subscribed events.
    pub fn monitor(&self, signo: i32) -> ShqResult<()> {
        self.ensure_live()?;
        events::register(&self.header().monitor, signo)
    }

    /// Register the calling process to be signaled on item arrival.
    pub fn listen(&self, signo: i32) -> ShqResult<()> {
        self.ensure_live()?;
        events::register(&self.header().listener, signo)
    }

    /// Register the calling process to be signaled when blocked removers
    /// should re-check state.
    pub fn register_caller(&self, signo: i32) -> ShqResult<()> {
        self.ensure_live()?;
        events::register(&self.header().caller, signo)
    }

    // ---- queries (lock-free) -----------------------------------------

    /// Current item count.
    pub fn count(&self) -> u64 {
        self.header().depth.load(Ordering::Acquire)
    }

    /// Payload bytes currently resident in the queue.
    pub fn buffer_size(&self) -> u64 {
        self.header().used_bytes.load(Ordering::Acquire)
    }

    /// Number of removers currently blocked in a wait.
    pub fn call_count(&self) -> u32 {
        self.header().call_count.load(Ordering::Acquire)
    }

    /// Consume and return the highest-priority pending subscribed event.
    pub fn active_event(&self) -> Event {
        events::take_active(self.header())
    }

    /// Timestamp of the last empty to non-empty transition (creation
    /// time if it never happened).
    pub fn last_empty_timestamp(&self) -> SystemTime {
        let ns = self.header().last_nonempty_ns.load(Ordering::Acquire);
        UNIX_EPOCH + Duration::from_nanos(ns)
    }

    /// True when the queue has not gone from empty to non-empty within
    /// `idle`: the producers appear stalled.
    pub fn exceeds_idle_time(&self, idle: Duration) -> bool {
        let last = self.header().last_nonempty_ns.load(Ordering::Acquire);
        now_ns().saturating_sub(last) > idle.as_nanos() as u64
    }

    /// Whether expired items are silently dropped.
    pub fn will_discard(&self) -> bool {
        self.header().flags.load(Ordering::Acquire) & flags::DISCARD != 0
    }

    /// Whether adaptive LIFO is enabled.
    pub fn will_lifo(&self) -> bool {
        self.header().flags.load(Ordering::Acquire) & flags::LIFO != 0
    }

    /// Whether the queue currently exceeds its target-delay budget.
    pub fn delay_exceeded(&self) -> bool {
        congestion::delay_exceeded(self.header())
    }

    /// Whether `event` is in the subscription set.
    pub fn is_subscribed(&self, event: Event) -> bool {
        events::is_subscribed(self.header(), event)
    }

    /// Logical depth limit of the queue.
    pub fn max_depth(&self) -> u64 {
        self.header().max_depth.load(Ordering::Relaxed)
    }

    /// Queue name.
    pub fn name(&self) -> &str {
        self.layout.region().name().as_str()
    }

    /// Access mode of this handle.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    // ---- configuration -----------------------------------------------

    /// Set the depth threshold for LEVEL events. 0 disables.
    pub fn set_level(&self, depth: u64) -> ShqResult<()> {
        self.configure(|header| header.level.store(depth, Ordering::Relaxed))
    }

    /// Set the per-item time limit driving expiration. Zero disables.
    pub fn set_time_limit(&self, limit: Duration) -> ShqResult<()> {
        self.configure(|header| {
            header
                .time_limit_ns
                .store(limit.as_nanos() as u64, Ordering::Relaxed)
        })
    }

    /// Set the CoDel target delay and activate sojourn monitoring.
    /// Zero disables.
    pub fn set_target_delay(&self, target: Duration) -> ShqResult<()> {
        self.configure(|header| {
            header
                .target_delay_ns
                .store(target.as_nanos() as u64, Ordering::Relaxed);
            header.delay_exceed_since_ns.store(0, Ordering::Relaxed);
            header
                .flags
                .fetch_and(!flags::DELAY_EXCEEDED, Ordering::AcqRel);
        })
    }

    /// Control whether expired items are silently dropped.
    pub fn set_discard(&self, discard: bool) -> ShqResult<()> {
        self.configure(|header| {
            if discard {
                header.flags.fetch_or(flags::DISCARD, Ordering::AcqRel);
            } else {
                header.flags.fetch_and(!flags::DISCARD, Ordering::AcqRel);
            }
        })
    }

    /// Control adaptive LIFO insertion at the depth limit.
    pub fn set_adaptive_lifo(&self, lifo: bool) -> ShqResult<()> {
        self.configure(|header| {
            if lifo {
                header.flags.fetch_or(flags::LIFO, Ordering::AcqRel);
            } else {
                header.flags.fetch_and(!flags::LIFO, Ordering::AcqRel);
            }
        })?;
        if lifo {
            // Adds blocked at the limit can now take the LIFO path.
            advance(&self.header().space_seq);
        }
        Ok(())
    }

    /// Subscribe to `event` (shared across all attached handles).
    pub fn subscribe(&self, event: Event) -> ShqResult<()> {
        self.ensure_live()?;
        events::subscribe(self.header(), event);
        Ok(())
    }

    /// Remove `event` from the subscription set.
    pub fn unsubscribe(&self, event: Event) -> ShqResult<()> {
        self.ensure_live()?;
        events::unsubscribe(self.header(), event);
        Ok(())
    }

    /// Remove expired items from the front of the queue as of `as_of`.
    ///
    /// With discard enabled every expired item is dropped (firing a TIME
    /// event each and waking blocked producers); with discard disabled
    /// the items stay for inspection and a single TIME event is raised.
    pub fn clean(&self, as_of: SystemTime) -> ShqResult<()> {
        self.ensure_write()?;
        self.ensure_live()?;
        let header = self.header();
        let now = system_time_ns(as_of);

        let dropped = {
            let _guard = lock::acquire(header)?;
            self.ensure_live()?;
            if self.will_discard() {
                expire::sweep_expired(self, now)?
            } else {
                if expire::head_expired(self, now) {
                    events::record(header, Event::Time);
                }
                0
            }
        };

        if dropped > 0 {
            tracing::debug!(name = %self.name(), dropped, "cleaned expired items");
            advance(&header.space_seq);
        }
        Ok(())
    }

    /// Wake blocked removers without any data change. A prodded remover
    /// re-checks the queue and, finding nothing, returns `Ok(None)`
    /// instead of sleeping out its deadline. Used for coordinated
    /// shutdown or retry.
    pub fn prod(&self) -> ShqResult<()> {
        self.ensure_live()?;
        let header = self.header();
        header.prod_count.fetch_add(1, Ordering::AcqRel);
        advance(&header.item_seq);
        advance(&header.space_seq);
        events::notify(&header.caller, "caller");
        Ok(())
    }

    // ---- internals ---------------------------------------------------

    fn header(&self) -> &QueueHeader {
        self.layout.header()
    }

    fn ensure_live(&self) -> ShqResult<()> {
        if self.header().flags.load(Ordering::Acquire) & flags::DESTROYED != 0 {
            return Err(ShqError::InvalidState {
                reason: format!("queue '{}' has been destroyed", self.name()),
            });
        }
        Ok(())
    }

    fn ensure_write(&self) -> ShqResult<()> {
        if !self.mode.can_write() {
            return Err(ShqError::AccessDenied {
                name: self.name().to_string(),
                reason: format!("handle mode {} cannot write", self.mode),
            });
        }
        Ok(())
    }

    fn ensure_read(&self) -> ShqResult<()> {
        if !self.mode.can_read() {
            return Err(ShqError::AccessDenied {
                name: self.name().to_string(),
                reason: format!("handle mode {} cannot read", self.mode),
            });
        }
        Ok(())
    }

    fn configure<F: FnOnce(&QueueHeader)>(&self, apply: F) -> ShqResult<()> {
        self.ensure_write()?;
        self.ensure_live()?;
        let _guard = lock::acquire(self.header())?;
        self.ensure_live()?;
        apply(self.header());
        Ok(())
    }

    /// Physical slots still free in the descriptor ring.
    fn physical_room(&self) -> bool {
        let header = self.header();
        let used = header
            .tail
            .load(Ordering::Relaxed)
            .wrapping_sub(header.head.load(Ordering::Relaxed));
        used < header.slot_cap.load(Ordering::Relaxed)
    }

    fn enqueue(&self, encoded: codec::EncodedItem, wait: Wait) -> ShqResult<()> {
        self.ensure_write()?;
        self.ensure_live()?;
        let header = self.header();
        let deadline = wait.deadline();

        loop {
            {
                let _guard = lock::acquire(header)?;
                self.ensure_live()?;

                let depth = header.depth.load(Ordering::Relaxed);
                let max_depth = header.max_depth.load(Ordering::Relaxed);

                if depth < max_depth {
                    self.commit_insert(&encoded, false)?;
                    break;
                }
                if congestion::lifo_insert(header) && self.physical_room() {
                    self.commit_insert(&encoded, true)?;
                    break;
                }
            }

            let timeout = match (wait, deadline) {
                (Wait::No, _) => {
                    return Err(ShqError::DepthLimitReached {
                        max_depth: self.max_depth(),
                    })
                }
                (Wait::Forever, _) => None,
                (_, Some(at)) => {
                    let now = Instant::now();
                    if now >= at {
                        return Err(ShqError::DepthLimitReached {
                            max_depth: self.max_depth(),
                        });
                    }
                    Some(at - now)
                }
                (Wait::Timed(d), None) => Some(d),
            };

            let outcome = wait_until(&header.space_seq, timeout, || {
                header.flags.load(Ordering::Acquire) & flags::DESTROYED != 0
                    || header.depth.load(Ordering::Acquire)
                        < header.max_depth.load(Ordering::Relaxed)
                    || (congestion::lifo_insert(header) && self.physical_room())
            });
            self.ensure_live()?;
            if outcome == WaitOutcome::TimedOut {
                return Err(ShqError::DepthLimitReached {
                    max_depth: self.max_depth(),
                });
            }
        }

        // Outside the critical section: wake removers and deliver the
        // arrival notifications.
        advance(&header.item_seq);
        events::notify(&header.listener, "listener");
        if header.call_count.load(Ordering::Acquire) > 0 {
            events::notify(&header.caller, "caller");
        }
        Ok(())
    }

    /// Commit one encoded item into the ring. Caller holds the lock.
    fn commit_insert(&self, encoded: &codec::EncodedItem, front: bool) -> ShqResult<()> {
        let header = self.header();
        if !self.physical_room() {
            return Err(ShqError::OutOfMemory {
                reason: "descriptor ring is full".to_string(),
            });
        }

        let now = now_ns();
        // SAFETY: we hold the queue lock
        let first_block = unsafe { self.layout.store_payload(&encoded.bytes)? };

        let mut desc = ItemDesc::new(
            encoded.tag,
            encoded.vec_count,
            encoded.bytes.len() as u64,
            encoded.checksum,
        );
        desc.first_block = first_block;
        desc.enqueue_ns = now;

        if front {
            let head = header.head.load(Ordering::Relaxed).wrapping_sub(1);
            // SAFETY: we hold the queue lock and head slot is free
            unsafe { self.layout.set_desc(head, desc) };
            header.head.store(head, Ordering::Relaxed);
        } else {
            let tail = header.tail.load(Ordering::Relaxed);
            // SAFETY: we hold the queue lock and tail slot is free
            unsafe { self.layout.set_desc(tail, desc) };
            header.tail.store(tail.wrapping_add(1), Ordering::Relaxed);
        }

        let depth = header.depth.fetch_add(1, Ordering::AcqRel) + 1;
        header
            .used_bytes
            .fetch_add(encoded.bytes.len() as u64, Ordering::AcqRel);

        if depth == 1 {
            header.last_nonempty_ns.store(now, Ordering::Release);
            if header.flags.fetch_or(flags::INIT_FIRED, Ordering::AcqRel) & flags::INIT_FIRED == 0
            {
                events::record(header, Event::Init);
            }
            events::record(header, Event::Nonempty);
        }
        if depth == header.max_depth.load(Ordering::Relaxed) {
            events::record(header, Event::Limit);
        }
        let level = header.level.load(Ordering::Relaxed);
        if level > 0 && depth == level {
            events::record(header, Event::Level);
        }

        // A front insert makes the head the freshest item; sample the
        // displaced head so sustained overload keeps registering instead
        // of reading a near-zero sojourn.
        let observe_cursor = if front {
            header.head.load(Ordering::Relaxed).wrapping_add(1)
        } else {
            header.head.load(Ordering::Relaxed)
        };
        // SAFETY: we hold the queue lock; depth > 0 so the sampled slot
        // is live (front inserts imply a displaced head exists)
        let head_enqueue = unsafe { self.layout.desc(observe_cursor) }.enqueue_ns;
        if congestion::observe(header, Some(head_enqueue), now) {
            events::record(header, Event::Time);
        }

        Ok(())
    }

    /// Pop the head descriptor and its payload. Caller holds the lock.
    /// Returns `None` when the queue is empty.
    fn take_head(&self) -> Option<(ItemDesc, Vec<u8>)> {
        let header = self.header();
        if header.depth.load(Ordering::Relaxed) == 0 {
            return None;
        }

        let head = header.head.load(Ordering::Relaxed);
        // SAFETY: we hold the queue lock and depth > 0
        let desc = unsafe { self.layout.desc(head) };
        let payload = unsafe {
            self.layout
                .load_payload(desc.first_block, desc.total_len as usize)
        };
        unsafe { self.layout.free_payload(desc.first_block) };

        header.head.store(head.wrapping_add(1), Ordering::Relaxed);
        let depth = header.depth.fetch_sub(1, Ordering::AcqRel) - 1;
        header
            .used_bytes
            .fetch_sub(desc.total_len, Ordering::AcqRel);

        if depth == 0 {
            events::record(header, Event::Empty);
        }

        Some((desc, payload))
    }

    fn dequeue(&self, wait: Wait) -> ShqResult<Option<Item>> {
        self.ensure_read()?;
        self.ensure_live()?;
        let header = self.header();
        let deadline = wait.deadline();

        loop {
            let taken = {
                let _guard = lock::acquire(header)?;
                self.ensure_live()?;

                let now = now_ns();
                let swept = if self.will_discard() {
                    expire::sweep_expired(self, now)?
                } else {
                    0
                };
                if swept > 0 {
                    advance(&header.space_seq);
                }

                let head_enqueue = if header.depth.load(Ordering::Relaxed) > 0 {
                    // SAFETY: we hold the queue lock and depth > 0
                    Some(unsafe { self.layout.desc(header.head.load(Ordering::Relaxed)) }.enqueue_ns)
                } else {
                    None
                };
                if congestion::observe(header, head_enqueue, now) {
                    events::record(header, Event::Time);
                }

                self.take_head()
            };

            if let Some((desc, payload)) = taken {
                advance(&header.space_seq);
                return codec::decode(&desc, payload).map(Some);
            }

            let timeout = match (wait, deadline) {
                (Wait::No, _) => return Ok(None),
                (Wait::Forever, _) => None,
                (_, Some(at)) => {
                    let now = Instant::now();
                    if now >= at {
                        return Ok(None);
                    }
                    Some(at - now)
                }
                (Wait::Timed(d), None) => Some(d),
            };

            let prods = header.prod_count.load(Ordering::Acquire);
            let outcome = {
                let _blocked = CallCountGuard::enter(header);
                wait_until(&header.item_seq, timeout, || {
                    header.flags.load(Ordering::Acquire) & flags::DESTROYED != 0
                        || header.depth.load(Ordering::Acquire) > 0
                        || header.prod_count.load(Ordering::Acquire) != prods
                })
            };
            self.ensure_live()?;
            if outcome == WaitOutcome::TimedOut {
                return Ok(None);
            }
            // A prod with nothing to remove ends the wait empty-handed.
            if header.prod_count.load(Ordering::Acquire) != prods
                && header.depth.load(Ordering::Acquire) == 0
            {
                return Ok(None);
            }
        }
    }
}
