//! Trailing-edge debounce buffer.
//!
//! Holds the most recent value pushed into it and releases it once no newer
//! value has arrived for the configured window. The value can also be taken
//! immediately with `flush()`.

#[derive(Debug)]
pub struct Debouncer<T> {
    window_ms: u64,
    pending: Option<T>,
    deadline: Option<u64>,
}

impl<T> Debouncer<T> {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            pending: None,
            deadline: None,
        }
    }

    /// Replace the buffered value and restart the window.
    pub fn push(&mut self, value: T, now: u64) {
        self.pending = Some(value);
        self.deadline = Some(now.saturating_add(self.window_ms));
    }

    /// Take the buffered value if its window has elapsed at `now`.
    pub fn take_due(&mut self, now: u64) -> Option<T> {
        match self.deadline {
            Some(deadline) if now >= deadline => self.flush(),
            _ => None,
        }
    }

    /// Take the buffered value regardless of the window.
    pub fn flush(&mut self) -> Option<T> {
        self.deadline = None;
        self.pending.take()
    }

    pub fn clear(&mut self) {
        self.pending = None;
        self.deadline = None;
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }
}
