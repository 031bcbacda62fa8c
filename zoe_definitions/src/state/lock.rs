use std::sync::{Arc, Condvar, Mutex};

/// Binary lock guarding an execution against concurrent placement and teardown
///
/// The scheduler try-acquires it before attempting placement; termination
/// workers block on it. Acquire and release are explicit because the holder
/// changes threads over the lifetime of a scheduling round.
#[derive(Clone, Debug, Default)]
pub struct TerminationLock {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl TerminationLock {
    pub fn new() -> TerminationLock {
        TerminationLock::default()
    }

    /// Non-blocking acquire, true on success
    pub fn try_acquire(&self) -> bool {
        let mut held = self.inner.0.lock().unwrap();
        if *held {
            false
        } else {
            *held = true;
            true
        }
    }

    /// Block until the lock is free, then take it
    pub fn acquire(&self) {
        let mut held = self.inner.0.lock().unwrap();
        while *held {
            held = self.inner.1.wait(held).unwrap();
        }
        *held = true;
    }

    pub fn release(&self) {
        let mut held = self.inner.0.lock().unwrap();
        *held = false;
        self.inner.1.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn try_acquire_fails_while_held() {
        let lock = TerminationLock::new();
        assert!(lock.try_acquire());
        assert!(!lock.try_acquire());
        lock.release();
        assert!(lock.try_acquire());
    }

    #[test]
    fn acquire_blocks_until_release() {
        let lock = TerminationLock::new();
        assert!(lock.try_acquire());
        let waiter = {
            let lock = lock.clone();
            thread::spawn(move || {
                lock.acquire();
                lock.release();
            })
        };
        lock.release();
        waiter.join().unwrap();
    }
}
