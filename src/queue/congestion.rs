// SPDX-License-Identifier: Apache-2.0

//! Congestion control: adaptive LIFO and CoDel-style delay monitoring.
//!
//! Both mechanisms layer on the shared depth counter and are off by
//! default. Adaptive LIFO flips insertion to the next-removed position
//! once the depth limit is hit, trading fairness for freshness under
//! sustained overload. Target-delay control watches the head item's
//! sojourn time and raises backpressure when it stays above the target
//! for a full target interval - a signal, not a drop; hard expiration
//! is the separate, user-declared limit in `expire`.
//!
//! The two interact: a LIFO front insert puts a fresh item at the head,
//! so insertion-side observations sample the displaced head rather than
//! the freshly inserted one, keeping the delay controller armed while
//! the aged backlog sits behind the overflow items.

use std::sync::atomic::Ordering;

use crate::shm::layout::{flags, QueueHeader};

/// Whether the next insert should go to the next-removed position.
///
/// True only while adaptive LIFO is enabled and depth sits at or above
/// the limit; below the limit the policy reverts to FIFO.
pub(crate) fn lifo_insert(header: &QueueHeader) -> bool {
    header.flags.load(Ordering::Acquire) & flags::LIFO != 0
        && header.depth.load(Ordering::Acquire) >= header.max_depth.load(Ordering::Relaxed)
}

/// Feed one sojourn observation to the delay controller.
///
/// `head_enqueue_ns` is the enqueue timestamp of the current head item,
/// or `None` when the queue is empty. Returns true when a TIME event
/// should be raised. Call with the queue lock held.
pub(crate) fn observe(header: &QueueHeader, head_enqueue_ns: Option<u64>, now_ns: u64) -> bool {
    let target = header.target_delay_ns.load(Ordering::Relaxed);
    if target == 0 {
        return false;
    }

    let sojourn = match head_enqueue_ns {
        Some(ts) => now_ns.saturating_sub(ts),
        None => 0,
    };

    if sojourn <= target {
        // Back under budget: disarm and clear the backpressure flag.
        header.delay_exceed_since_ns.store(0, Ordering::Relaxed);
        header
            .flags
            .fetch_and(!flags::DELAY_EXCEEDED, Ordering::AcqRel);
        return false;
    }

    let since = header.delay_exceed_since_ns.load(Ordering::Relaxed);
    if since == 0 {
        // First observation above target starts the interval.
        header.delay_exceed_since_ns.store(now_ns, Ordering::Relaxed);
        return false;
    }

    if now_ns.saturating_sub(since) >= target {
        header.flags.fetch_or(flags::DELAY_EXCEEDED, Ordering::AcqRel);
        // Re-arm so the event fires at most once per interval.
        header.delay_exceed_since_ns.store(now_ns, Ordering::Relaxed);
        return true;
    }

    false
}

/// Whether the queue currently exceeds its delay budget.
pub(crate) fn delay_exceeded(header: &QueueHeader) -> bool {
    header.flags.load(Ordering::Acquire) & flags::DELAY_EXCEEDED != 0
}
