use std::collections::VecDeque;
use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(60);

/// Which limit an inbound message ran into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Throttle {
    /// Too many messages in the last minute.
    Messages,
    /// Too many bytes in the last minute.
    Bytes,
}

impl Throttle {
    /// Short label used for metrics and logs.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            Self::Messages => "msg_rate",
            Self::Bytes => "bw_rate",
        }
    }
}

/// Sliding one-minute window over a connection's inbound messages.
///
/// Rejected messages are not recorded, so a client that backs off regains
/// its allowance as old entries age out.
#[derive(Debug)]
pub struct RateLimiter {
    max_messages: usize,
    max_bytes: u64,
    window: VecDeque<(Instant, u64)>,
    bytes: u64,
}

impl RateLimiter {
    /// Limit to `max_messages` messages and `max_bytes` bytes per minute.
    #[must_use]
    pub fn new(max_messages: u32, max_bytes: u64) -> Self {
        Self {
            max_messages: max_messages as usize,
            max_bytes,
            window: VecDeque::new(),
            bytes: 0,
        }
    }

    /// Admit a message of `len` bytes arriving now.
    ///
    /// # Errors
    ///
    /// Returns the [`Throttle`] that would be exceeded.
    pub fn admit(&mut self, len: usize) -> Result<(), Throttle> {
        self.admit_at(len, Instant::now())
    }

    fn admit_at(&mut self, len: usize, now: Instant) -> Result<(), Throttle> {
        while let Some(&(at, size)) = self.window.front() {
            if now.duration_since(at) < WINDOW {
                break;
            }
            self.bytes -= size;
            self.window.pop_front();
        }

        let len = len as u64;
        if self.window.len() >= self.max_messages {
            return Err(Throttle::Messages);
        }
        if self.bytes.saturating_add(len) > self.max_bytes {
            return Err(Throttle::Bytes);
        }
        self.window.push_back((now, len));
        self.bytes += len;
        Ok(())
    }
}
