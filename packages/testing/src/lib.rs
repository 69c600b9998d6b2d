#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for tests of the paged pool packages.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// How long a test may run before the watchdog fails it.
const WATCHDOG_TIMEOUT: Duration = Duration::from_secs(10);

/// Miri is dramatically slower at thread synchronization.
const WATCHDOG_TIMEOUT_MIRI: Duration = Duration::from_secs(60);

/// Runs a test on a separate thread and fails it if it does not finish in time.
///
/// Tests of blocking code hang instead of failing when a wakeup is lost. The watchdog turns
/// such a hang into a panic so that the test run finishes and names the culprit.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the test runs directly on
/// the calling thread without a timeout, so that mutation testing can detect hanging mutants
/// with its own timeout.
///
/// # Panics
///
/// Panics if the test exceeds the timeout. Panics from the test itself are propagated.
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// let answer = with_watchdog(|| 6 * 7);
/// assert_eq!(answer, 42);
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let timeout = if cfg!(miri) {
        WATCHDOG_TIMEOUT_MIRI
    } else {
        WATCHDOG_TIMEOUT
    };

    let (tx, rx) = mpsc::channel();

    let test_thread = thread::spawn(move || {
        // If this fails, the watchdog has already given up on us.
        drop(tx.send(test_fn()));
    });

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_thread.join().expect("test thread finished sending its result");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test did not finish within {timeout:?}, it is probably hanging");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_thread.join() {
            Ok(()) => panic!("test thread exited without producing a result"),
            Err(payload) => std::panic::resume_unwind(payload),
        },
    }
}

/// Polls `condition` until it returns `true` or `timeout` elapses.
///
/// Used to wait until another thread has reached a state that cannot be signaled directly,
/// such as being blocked inside a call under test.
///
/// Returns whether the condition was observed to hold.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
///
/// use testing::wait_until;
///
/// assert!(wait_until(Duration::from_secs(1), || true));
/// ```
#[must_use]
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;

    loop {
        if condition() {
            return true;
        }

        if Instant::now() >= deadline {
            return false;
        }

        thread::sleep(Duration::from_millis(1));
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn watchdog_returns_result() {
        assert_eq!(with_watchdog(|| 42), 42);
    }

    #[test]
    #[should_panic(expected = "from inside")]
    fn watchdog_propagates_panics() {
        with_watchdog(|| panic!("from inside"));
    }

    #[test]
    fn wait_until_sees_condition_from_other_thread() {
        let counter = Arc::new(AtomicUsize::new(0));

        let worker = thread::spawn({
            let counter = Arc::clone(&counter);
            move || {
                thread::sleep(Duration::from_millis(10));
                counter.store(1, Ordering::Release);
            }
        });

        assert!(wait_until(Duration::from_secs(5), || {
            counter.load(Ordering::Acquire) == 1
        }));

        worker.join().unwrap();
    }

    #[test]
    fn wait_until_gives_up() {
        assert!(!wait_until(Duration::from_millis(5), || false));
    }
}
