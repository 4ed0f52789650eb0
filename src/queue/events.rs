// SPDX-License-Identifier: Apache-2.0

//! Event recording, subscriptions, and process-level notification.
//!
//! Events are recorded in a shared pending bitset only while subscribed,
//! and consumed by `active_event`. Three roles can register for
//! asynchronous delivery: a monitor (subscribed events), a listener
//! (item arrival), and a caller (blocked removers should re-check).
//! Delivery is a bare signal - it carries no payload and is inherently
//! racy against direct polling, so receivers must always re-read
//! authoritative queue state after being signaled.

use std::sync::atomic::Ordering;

use crate::error::{ShqError, ShqResult};
use crate::shm::layout::{QueueHeader, SignalTarget};
use crate::types::Event;

/// Add `event` to the shared subscription set. Idempotent.
pub(crate) fn subscribe(header: &QueueHeader, event: Event) {
    header
        .subscriptions
        .fetch_or(event.mask(), Ordering::AcqRel);
}

/// Remove `event` from the shared subscription set. Idempotent.
pub(crate) fn unsubscribe(header: &QueueHeader, event: Event) {
    header
        .subscriptions
        .fetch_and(!event.mask(), Ordering::AcqRel);
}

/// Whether every bit of `event` is currently subscribed.
pub(crate) fn is_subscribed(header: &QueueHeader, event: Event) -> bool {
    let mask = event.mask();
    mask != 0 && header.subscriptions.load(Ordering::Acquire) & mask == mask
}

/// Record `event` if subscribed and signal the monitor. Call with the
/// queue lock held so the record stays consistent with the transition
/// that caused it.
pub(crate) fn record(header: &QueueHeader, event: Event) {
    if !is_subscribed(header, event) {
        return;
    }
    header.pending_events.fetch_or(event.mask(), Ordering::AcqRel);
    notify(&header.monitor, "monitor");
}

/// Consume and return the highest-priority pending event.
pub(crate) fn take_active(header: &QueueHeader) -> Event {
    for event in Event::PRIORITY {
        let mask = event.mask();
        if header.pending_events.fetch_and(!mask, Ordering::AcqRel) & mask != 0 {
            return event;
        }
    }
    Event::None
}

/// Register the calling process for a notification role.
pub(crate) fn register(target: &SignalTarget, signo: i32) -> ShqResult<()> {
    if !(1..=libc::SIGRTMAX()).contains(&signo) {
        return Err(ShqError::InvalidArgument {
            reason: format!("invalid signal number: {}", signo),
        });
    }
    target.signo.store(signo as u32, Ordering::Relaxed);
    target.pid.store(std::process::id(), Ordering::Release);
    Ok(())
}

/// Best-effort signal delivery to a registered role.
///
/// A vanished registrant is deregistered and logged; delivery problems
/// are never surfaced as operation errors.
pub(crate) fn notify(target: &SignalTarget, role: &'static str) {
    let pid = target.pid.load(Ordering::Acquire);
    if pid == 0 {
        return;
    }
    let signo = target.signo.load(Ordering::Relaxed) as i32;

    // SAFETY: plain kill(2); pid/signo are validated by register
    let rc = unsafe { libc::kill(pid as libc::pid_t, signo) };
    if rc < 0 {
        let errno = std::io::Error::last_os_error();
        if errno.raw_os_error() == Some(libc::ESRCH) {
            target.pid.store(0, Ordering::Release);
            tracing::warn!(role, pid, "deregistered vanished notification target");
        } else {
            tracing::warn!(role, pid, error = %errno, "signal delivery failed");
        }
    }
}
