// SPDX-License-Identifier: Apache-2.0

//! Item expiration against the per-queue time limit.
//!
//! Expiration is evaluated at the head only: FIFO order means the head
//! is always the oldest item, so a non-expired head proves nothing
//! behind it is expired either. Adaptive LIFO inserts fresher items at
//! the head, which can shadow older ones; the sweep catches those on
//! subsequent passes as they surface.

use std::sync::atomic::Ordering;

use crate::error::ShqResult;
use crate::types::Event;

use super::{events, SharedQueue};

/// Whether the current head item has outlived the time limit. Call with
/// the queue lock held. Always false with the limit disabled or the
/// queue empty.
pub(super) fn head_expired(queue: &SharedQueue, now_ns: u64) -> bool {
    let header = queue.header();
    let limit = header.time_limit_ns.load(Ordering::Relaxed);
    if limit == 0 || header.depth.load(Ordering::Relaxed) == 0 {
        return false;
    }
    let head = header.head.load(Ordering::Relaxed);
    // SAFETY: caller holds the queue lock and depth > 0
    let enqueued = unsafe { queue.layout.desc(head) }.enqueue_ns;
    now_ns.saturating_sub(enqueued) > limit
}

/// Drop every expired item from the head, firing a TIME event for each.
/// Call with the queue lock held and discard enabled. Returns the number
/// of items dropped; the caller wakes space waiters when nonzero.
pub(super) fn sweep_expired(queue: &SharedQueue, now_ns: u64) -> ShqResult<u64> {
    let header = queue.header();
    let mut dropped = 0u64;
    while head_expired(queue, now_ns) {
        if queue.take_head().is_none() {
            break;
        }
        events::record(header, Event::Time);
        dropped += 1;
    }
    if dropped > 0 {
        tracing::trace!(name = %queue.name(), dropped, "discarded expired items");
    }
    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Mode;
    use std::time::Duration;

    fn make_queue(tag: &str) -> (String, SharedQueue) {
        let name = format!("shq-expire-{}-{}", tag, std::process::id());
        let q = SharedQueue::create(&name, 8, Mode::ReadWrite).unwrap();
        (name, q)
    }

    fn destroy(q: SharedQueue) {
        q.destroy().unwrap();
    }

    #[test]
    fn test_no_limit_never_expires() {
        let (_name, q) = make_queue("nolimit");
        q.add(b"x").unwrap();
        let far_future = super::super::now_ns() + 60_000_000_000;
        assert!(!head_expired(&q, far_future));
        destroy(q);
    }

    #[test]
    fn test_discard_drops_expired_on_remove() {
        let (_name, q) = make_queue("discard");
        q.set_time_limit(Duration::from_millis(20)).unwrap();
        q.set_discard(true).unwrap();
        q.subscribe(Event::Time).unwrap();

        q.add(b"stale").unwrap();
        std::thread::sleep(Duration::from_millis(40));
        q.add(b"fresh").unwrap();

        // The expired head is silently dropped; the fresh item comes back.
        let item = q.remove().unwrap().unwrap();
        assert_eq!(item.bytes(), b"fresh");
        assert_eq!(q.count(), 0);
        assert_eq!(q.active_event(), Event::Time);
        destroy(q);
    }

    #[test]
    fn test_without_discard_expired_items_remain() {
        let (_name, q) = make_queue("keep");
        q.set_time_limit(Duration::from_millis(10)).unwrap();

        q.add(b"old").unwrap();
        std::thread::sleep(Duration::from_millis(30));

        // Discard is off: the expired item is still handed out.
        let item = q.remove().unwrap().unwrap();
        assert_eq!(item.bytes(), b"old");
        destroy(q);
    }

    #[test]
    fn test_clean_with_discard_empties_expired() {
        let (_name, q) = make_queue("clean");
        q.set_time_limit(Duration::from_millis(10)).unwrap();
        q.set_discard(true).unwrap();
        q.subscribe(Event::Time).unwrap();

        q.add(b"a").unwrap();
        q.add(b"b").unwrap();
        std::thread::sleep(Duration::from_millis(30));

        q.clean(std::time::SystemTime::now()).unwrap();
        assert_eq!(q.count(), 0);
        assert_eq!(q.active_event(), Event::Time);
        destroy(q);
    }

    #[test]
    fn test_clean_without_discard_raises_time_only() {
        let (_name, q) = make_queue("clean-keep");
        q.set_time_limit(Duration::from_millis(10)).unwrap();
        q.subscribe(Event::Time).unwrap();

        q.add(b"a").unwrap();
        std::thread::sleep(Duration::from_millis(30));

        q.clean(std::time::SystemTime::now()).unwrap();
        assert_eq!(q.count(), 1);
        assert_eq!(q.active_event(), Event::Time);
        destroy(q);
    }
}
