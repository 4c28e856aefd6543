#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

//! Private helpers for tests, benchmarks and examples in this workspace.

use std::ptr::NonNull;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Runs a test with a timeout to prevent infinite hangs.
///
/// Tests that involve locks shared between threads can deadlock when something is broken.
/// If the test takes longer than the timeout to complete, the test fails instead of hanging
/// the test run.
///
/// The timeout is 10 seconds under normal conditions and 60 seconds under Miri, where thread
/// synchronization primitives are significantly slower.
///
/// When the `MUTATION_TESTING` environment variable is set to "1", the watchdog is disabled and
/// the test function is executed directly. This allows mutation testing to properly detect
/// hanging mutations.
///
/// # Panics
///
/// Panics if the test exceeds the timeout (when not in mutation testing mode).
///
/// # Example
///
/// ```rust
/// use testing::with_watchdog;
///
/// with_watchdog(|| {
///     assert_eq!(2 + 2, 4);
/// });
/// ```
pub fn with_watchdog<F, R>(test_fn: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    if std::env::var("MUTATION_TESTING").as_deref() == Ok("1") {
        return test_fn();
    }

    let (tx, rx) = mpsc::channel();

    let test_handle = thread::spawn(move || {
        let result = test_fn();
        // If this fails, the receiver has timed out.
        drop(tx.send(result));
    });

    let timeout = if cfg!(miri) {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(10)
    };

    match rx.recv_timeout(timeout) {
        Ok(result) => {
            test_handle.join().expect("Test thread should not panic");
            result
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("Test exceeded {} second timeout", timeout.as_secs());
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => match test_handle.join() {
            Ok(()) => panic!("Test thread disconnected unexpectedly"),
            Err(e) => std::panic::resume_unwind(e),
        },
    }
}

/// Fills `len` bytes at `block` with a pattern derived from `seed`.
///
/// Different seeds give different patterns, so a block filled by one test cannot pass for a
/// block filled by another.
///
/// # Safety
///
/// `block` must be valid for writes of `len` bytes.
pub unsafe fn write_pattern(block: NonNull<u8>, len: usize, seed: u8) {
    for offset in 0..len {
        // SAFETY: The caller guarantees the range is writable.
        unsafe {
            block.add(offset).write(pattern_byte(offset, seed));
        }
    }
}

/// Whether the first `len` bytes at `block` hold the pattern written by [`write_pattern()`]
/// with the same `seed`.
///
/// # Safety
///
/// `block` must be valid for reads of `len` initialized bytes.
#[must_use]
pub unsafe fn has_pattern(block: NonNull<u8>, len: usize, seed: u8) -> bool {
    (0..len).all(|offset| {
        // SAFETY: The caller guarantees the range is readable.
        let actual = unsafe { block.add(offset).read() };
        actual == pattern_byte(offset, seed)
    })
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "only the low byte of the offset is wanted"
)]
fn pattern_byte(offset: usize, seed: u8) -> u8 {
    (offset as u8).wrapping_mul(31).wrapping_add(seed)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn watchdog_returns_correct_value() {
        let result = with_watchdog(|| "hello world");
        assert_eq!(result, "hello world");
    }

    #[test]
    fn pattern_is_recognized() {
        let mut buffer = [0_u8; 300];
        let block = NonNull::from(&mut buffer).cast::<u8>();

        // SAFETY: The buffer holds 300 bytes.
        unsafe {
            write_pattern(block, 300, 7);
            assert!(has_pattern(block, 300, 7));
            assert!(!has_pattern(block, 300, 8));
        }
    }
}
