// SPDX-License-Identifier: Apache-2.0

//! Crash-recoverable cross-process lock.
//!
//! The guard word lives inside the segment and carries the holder's pid,
//! so ownership survives as data even when the owning process does not.
//! Waiters that find the recorded holder dead steal the lock with a CAS
//! from the dead pid and bump the generation counter, which prevents any
//! stale guard from ever releasing a re-acquired lock. This is an
//! arena-resident atomic state machine, not a language-level mutex:
//! critical sections must stay short and free of blocking syscalls.

use std::io;
use std::sync::atomic::Ordering;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::error::{ShqError, ShqResult};
use crate::shm::layout::QueueHeader;
use crate::shm::wait::{futex_wait, futex_wake};

/// How long a waiter sleeps before re-probing holder liveness.
const STALE_CHECK_INTERVAL: Duration = Duration::from_millis(10);

/// Bound on acquisition attempts before surfacing an error. Contention is
/// retried internally; callers never see a "retry" status.
const MAX_ATTEMPTS: u32 = 1000;

/// Probe whether a pid refers to a live process.
///
/// EPERM means the process exists but is not ours, which still counts as
/// alive for ownership purposes.
fn process_alive(pid: u32) -> bool {
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// RAII guard for the queue critical section.
///
/// Releases on drop with a CAS back to free and a wake for one waiter.
pub struct LockGuard<'a> {
    header: &'a QueueHeader,
    pid: u32,
    generation: u32,
}

/// Enter the queue critical section.
///
/// Blocks on the in-segment futex under contention; steals ownership from
/// a holder whose process no longer exists.
pub fn acquire(header: &QueueHeader) -> ShqResult<LockGuard<'_>> {
    let me = std::process::id();
    let owner = &header.lock.owner;

    for _ in 0..MAX_ATTEMPTS {
        if owner
            .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            let generation = header.lock.generation.fetch_add(1, Ordering::Relaxed) + 1;
            return Ok(LockGuard {
                header,
                pid: me,
                generation,
            });
        }

        let holder = owner.load(Ordering::Relaxed);
        if holder != 0 && holder != me && !process_alive(holder) {
            // The recorded holder died mid-section. Take over and make
            // its outstanding guard unable to release.
            if owner
                .compare_exchange(holder, me, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                let generation = header.lock.generation.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    dead_pid = holder,
                    new_pid = me,
                    "recovered queue lock from dead holder"
                );
                return Ok(LockGuard {
                    header,
                    pid: me,
                    generation,
                });
            }
            continue;
        }

        // Sleep until release, bounded so a newly dead holder is noticed.
        futex_wait(owner, holder, Some(STALE_CHECK_INTERVAL));
    }

    Err(ShqError::System {
        op: "lock acquire",
        source: io::Error::new(
            io::ErrorKind::TimedOut,
            "queue lock acquisition exhausted its retry bound",
        ),
    })
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        // If the generation moved on, the lock was recovered from us
        // (only possible if our pid was wrongly judged dead); releasing
        // would corrupt the new holder's critical section.
        if self.header.lock.generation.load(Ordering::Relaxed) != self.generation {
            tracing::warn!(pid = self.pid, "queue lock was recovered while held; not releasing");
            return;
        }
        if self
            .header
            .lock
            .owner
            .compare_exchange(self.pid, 0, Ordering::Release, Ordering::Relaxed)
            .is_ok()
        {
            futex_wake(&self.header.lock.owner, 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::layout::{Geometry, SegmentLayout};
    use crate::shm::region::SegmentRegion;
    use crate::types::QueueName;
    use std::sync::Arc;
    use std::thread;

    fn make_layout(tag: &str) -> (QueueName, Arc<SegmentLayout>) {
        let name =
            QueueName::new(format!("shq-lock-{}-{}", tag, std::process::id())).unwrap();
        let geo = Geometry::for_depth(4).unwrap();
        let region = SegmentRegion::create(&name, geo.segment_size).unwrap();
        (name, Arc::new(SegmentLayout::init(region, geo)))
    }

    #[test]
    fn test_acquire_release() {
        let (name, layout) = make_layout("basic");
        {
            let _guard = acquire(layout.header()).unwrap();
            assert_eq!(
                layout.header().lock.owner.load(Ordering::Relaxed),
                std::process::id()
            );
        }
        assert_eq!(layout.header().lock.owner.load(Ordering::Relaxed), 0);
        SegmentRegion::unlink(&name).unwrap();
    }

    #[test]
    fn test_mutual_exclusion_between_threads() {
        let (name, layout) = make_layout("mutex");
        let counter = Arc::new(std::sync::atomic::AtomicU64::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let layout = Arc::clone(&layout);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..200 {
                        let _guard = acquire(layout.header()).unwrap();
                        // Non-atomic read-modify-write protected by the lock.
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::Relaxed), 8 * 200);
        SegmentRegion::unlink(&name).unwrap();
    }

    #[test]
    fn test_steal_from_dead_holder() {
        let (name, layout) = make_layout("steal");

        // Plant a holder pid that cannot exist. Pids are bounded well below
        // u32::MAX / 2 on Linux.
        let dead_pid = u32::MAX / 2;
        layout
            .header()
            .lock
            .owner
            .store(dead_pid, Ordering::Relaxed);

        let guard = acquire(layout.header()).unwrap();
        assert_eq!(
            layout.header().lock.owner.load(Ordering::Relaxed),
            std::process::id()
        );
        drop(guard);
        assert_eq!(layout.header().lock.owner.load(Ordering::Relaxed), 0);
        SegmentRegion::unlink(&name).unwrap();
    }
}
