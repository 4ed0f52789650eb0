//! Blocking wait primitives for the queue.
//!
//! Uses the futex syscall on in-segment words so that independent
//! processes can sleep and wake each other without a coordinator.
//! Waits follow the double-check discipline: poll the predicate, snapshot
//! the sequence word, re-poll, then sleep - so a wake between poll and
//! sleep is never lost. Wake-ups are advisory; callers always re-check
//! authoritative queue state after waking.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The predicate became true.
    Ready,
    /// The deadline expired first. Not an error.
    TimedOut,
}

/// Sleep until `word` changes from `expected`, or the timeout elapses.
///
/// Spurious wake-ups are expected and harmless.
pub(crate) fn futex_wait(word: &AtomicU32, expected: u32, timeout: Option<Duration>) {
    let ts = timeout.map(|t| libc::timespec {
        tv_sec: t.as_secs() as libc::time_t,
        tv_nsec: t.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |t| t as *const libc::timespec);

    // SAFETY: word points into a live MAP_SHARED mapping; FUTEX_WAIT
    // (without PRIVATE, this word is shared between processes) compares
    // against `expected` and sleeps atomically
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<libc::c_void>(),
            0u32,
        );
    }
}

/// Wake up to `count` waiters sleeping on `word`.
pub(crate) fn futex_wake(word: &AtomicU32, count: i32) {
    // SAFETY: word points into a live MAP_SHARED mapping
    unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAKE,
            count,
            std::ptr::null::<libc::timespec>(),
            std::ptr::null::<libc::c_void>(),
            0u32,
        );
    }
}

/// Bump a sequence word and wake everyone sleeping on it.
pub(crate) fn advance(word: &AtomicU32) {
    word.fetch_add(1, Ordering::Release);
    futex_wake(word, i32::MAX);
}

/// Block until `pred` is true, re-armed by changes to `seq`.
///
/// `timeout` of `None` blocks indefinitely; a zero duration is a
/// non-blocking probe. Expiry returns `TimedOut`, never an error.
pub(crate) fn wait_until<F>(seq: &AtomicU32, timeout: Option<Duration>, pred: F) -> WaitOutcome
where
    F: Fn() -> bool,
{
    if pred() {
        return WaitOutcome::Ready;
    }
    if timeout == Some(Duration::ZERO) {
        return WaitOutcome::TimedOut;
    }

    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        let snapshot = seq.load(Ordering::Acquire);

        // Re-poll after the snapshot so a wake in between is not lost.
        if pred() {
            return WaitOutcome::Ready;
        }

        let remaining = match deadline {
            Some(d) => {
                let now = Instant::now();
                if now >= d {
                    return WaitOutcome::TimedOut;
                }
                Some(d - now)
            }
            None => None,
        };

        futex_wait(seq, snapshot, remaining);

        if pred() {
            return WaitOutcome::Ready;
        }
        if let Some(d) = deadline {
            if Instant::now() >= d {
                return WaitOutcome::TimedOut;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_ready_immediately() {
        let seq = AtomicU32::new(0);
        let out = wait_until(&seq, Some(Duration::from_millis(10)), || true);
        assert_eq!(out, WaitOutcome::Ready);
    }

    #[test]
    fn test_zero_timeout_is_probe() {
        let seq = AtomicU32::new(0);
        let start = Instant::now();
        let out = wait_until(&seq, Some(Duration::ZERO), || false);
        assert_eq!(out, WaitOutcome::TimedOut);
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_times_out_without_wake() {
        let seq = AtomicU32::new(0);
        let start = Instant::now();
        let out = wait_until(&seq, Some(Duration::from_millis(60)), || false);
        assert_eq!(out, WaitOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_advance_wakes_waiter() {
        let seq = Arc::new(AtomicU32::new(0));
        let flag = Arc::new(AtomicBool::new(false));

        let waiter = {
            let seq = Arc::clone(&seq);
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                wait_until(&seq, Some(Duration::from_secs(5)), || {
                    flag.load(Ordering::Acquire)
                })
            })
        };

        thread::sleep(Duration::from_millis(50));
        flag.store(true, Ordering::Release);
        advance(&seq);

        assert_eq!(waiter.join().unwrap(), WaitOutcome::Ready);
    }
}
