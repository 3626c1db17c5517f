use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// A wake-up, not a queue: workers park here between ticks and get nudged by a
/// producer after state changes, exactly like the flush worker's and stats
/// worker's condition variables. Spurious wakeups are harmless because every
/// caller re-checks its own state after `wait_for` returns.
#[derive(Default)]
pub struct Notify {
    woken: Mutex<bool>,
    condvar: Condvar,
}

impl Notify {
    pub fn new() -> Self {
        Notify {
            woken: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    /// Wakes one waiter (or pre-arms the next `wait_for` if nobody is waiting yet).
    pub fn notify(&self) {
        let mut woken = self.woken.lock();
        *woken = true;
        self.condvar.notify_all();
    }

    /// Blocks up to `timeout`, returning early the moment `notify` is called.
    /// Returns `true` if woken by a notification, `false` on timeout.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut woken = self.woken.lock();
        if *woken {
            *woken = false;
            return true;
        }
        let result = self.condvar.wait_for(&mut woken, timeout);
        let was_woken = *woken;
        *woken = false;
        !result.timed_out() || was_woken
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wakes_before_timeout() {
        let notify = Arc::new(Notify::new());
        let clone = notify.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            clone.notify();
        });
        let woken = notify.wait_for(Duration::from_secs(2));
        handle.join().unwrap();
        assert!(woken);
    }

    #[test]
    fn times_out_without_notify() {
        let notify = Notify::new();
        let woken = notify.wait_for(Duration::from_millis(20));
        assert!(!woken);
    }
}
