// Token-bucket rate limiter gating downstream enqueues.
//
// Producers that fail to consume wait on a condition variable until the
// refill makes the request satisfiable. The indexer throttles the fill
// rate when the writer queue is under pressure.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

struct BucketState {
    tokens: f64,
    fill_rate: f64,
    last_update: Instant,
}

pub struct TokenBucket {
    capacity: f64,
    state: Mutex<BucketState>,
    refilled: Condvar,
}

impl TokenBucket {
    pub fn new(capacity: f64, fill_rate: f64) -> Self {
        Self {
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                fill_rate,
                last_update: Instant::now(),
            }),
            refilled: Condvar::new(),
        }
    }

    fn refill(state: &mut BucketState, capacity: f64) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_update).as_secs_f64();
        state.tokens = (state.tokens + elapsed * state.fill_rate).min(capacity);
        state.last_update = now;
    }

    /// Non-blocking consume.
    pub fn consume(&self, amount: f64) -> bool {
        let mut state = self.state.lock().unwrap();
        Self::refill(&mut state, self.capacity);
        if state.tokens >= amount {
            state.tokens -= amount;
            true
        } else {
            false
        }
    }

    /// Blocking consume with a deadline. Returns false on timeout.
    pub fn consume_wait(&self, amount: f64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            Self::refill(&mut state, self.capacity);
            if state.tokens >= amount {
                state.tokens -= amount;
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            // Wait for either an explicit refill nudge or the estimated
            // time for the deficit to fill.
            let deficit = amount - state.tokens;
            let eta = if state.fill_rate > 0.0 {
                Duration::from_secs_f64(deficit / state.fill_rate)
            } else {
                deadline - now
            };
            let wait = eta.min(deadline - now).max(Duration::from_millis(1));
            let (guard, _) = self.refilled.wait_timeout(state, wait).unwrap();
            state = guard;
        }
    }

    /// Scale the fill rate (back-pressure coupling); factor 1.0 restores
    /// the configured rate.
    pub fn set_fill_rate(&self, rate: f64) {
        let mut state = self.state.lock().unwrap();
        Self::refill(&mut state, self.capacity);
        state.fill_rate = rate.max(0.0);
        self.refilled.notify_all();
    }

    pub fn fill_rate(&self) -> f64 {
        self.state.lock().unwrap().fill_rate
    }
}
