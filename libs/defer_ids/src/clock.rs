use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

/// Monotonic-enough "now" for scheduling. Real code uses [`SystemClock`]; tests
/// use [`TestClock`] so that retry-interval assertions don't depend on wall
/// time actually elapsing.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only advances when told to. Shared via `Arc` so a test can
/// hold a handle to advance it while the engine holds a handle to read it.
#[derive(Clone)]
pub struct TestClock {
    inner: Arc<Mutex<DateTime<Utc>>>,
}

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.inner.lock().expect("test clock mutex poisoned");
        *guard += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.inner.lock().expect("test clock mutex poisoned") = at;
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.lock().expect("test clock mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_only_when_told() {
        let start = Utc::now();
        let clock = TestClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::seconds(30));
        assert_eq!(clock.now(), start + Duration::seconds(30));
    }
}
