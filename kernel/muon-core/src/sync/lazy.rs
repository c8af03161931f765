//! Lazy initialization primitive for `no_std`.
//!
//! Provides [`LazyLock`], a `no_std` equivalent of `std::sync::LazyLock`
//! that initializes a value on first access using a spin-based state
//! machine.

use core::cell::UnsafeCell;
use core::mem::MaybeUninit;
use core::ops::Deref;
use core::sync::atomic::{AtomicU8, Ordering};

const UNINIT: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;
/// Poisoned state: the init closure panicked during initialization. Only
/// observable in unwind environments (host tests); the kernel target aborts
/// on panic.
const POISONED: u8 = 3;

/// A value that is initialized on first access.
///
/// Thread-safe via an atomic state machine. If multiple threads race to
/// initialize, one wins and the others spin until the value is ready.
pub struct LazyLock<T, F = fn() -> T> {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<T>>,
    init: UnsafeCell<Option<F>>,
}

// SAFETY: The atomic state machine ensures that the value is fully
// initialized before any thread can read it, and that the init closure is
// consumed exactly once.
unsafe impl<T: Send + Sync, F: Send> Send for LazyLock<T, F> {}
unsafe impl<T: Send + Sync, F: Send> Sync for LazyLock<T, F> {}

impl<T, F: FnOnce() -> T> LazyLock<T, F> {
    /// Creates a new `LazyLock` with the given initializer.
    pub const fn new(init: F) -> Self {
        Self {
            state: AtomicU8::new(UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
            init: UnsafeCell::new(Some(init)),
        }
    }

    fn force(&self) -> &T {
        match self.state.load(Ordering::Acquire) {
            READY => {
                // SAFETY: State is READY, so the value is fully initialized.
                return unsafe { (*self.value.get()).assume_init_ref() };
            }
            POISONED => panic!("LazyLock poisoned: init closure panicked"),
            UNINIT => {
                if self
                    .state
                    .compare_exchange(UNINIT, INITIALIZING, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    // We won the race. Poison on unwind so waiters do not
                    // spin forever in unwind environments.
                    struct Guard<'a>(&'a AtomicU8);
                    impl Drop for Guard<'_> {
                        fn drop(&mut self) {
                            self.0.store(POISONED, Ordering::Release);
                        }
                    }
                    let guard = Guard(&self.state);

                    // SAFETY: We are the only thread in INITIALIZING state.
                    let init = unsafe { (*self.init.get()).take().unwrap() };
                    let value = init();
                    // SAFETY: Sole initializer; value slot is unobserved
                    // until the READY store below.
                    unsafe {
                        (*self.value.get()).write(value);
                    }
                    self.state.store(READY, Ordering::Release);
                    core::mem::forget(guard);
                    // SAFETY: We just wrote the value.
                    return unsafe { (*self.value.get()).assume_init_ref() };
                }
                // Another thread is initializing; fall through to spin.
            }
            _ => {}
        }

        loop {
            match self.state.load(Ordering::Acquire) {
                READY => break,
                POISONED => panic!("LazyLock poisoned: init closure panicked"),
                _ => core::hint::spin_loop(),
            }
        }
        // SAFETY: State is READY.
        unsafe { (*self.value.get()).assume_init_ref() }
    }
}

impl<T, F: FnOnce() -> T> Deref for LazyLock<T, F> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        self.force()
    }
}
