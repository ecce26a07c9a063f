// Adaptive debouncer.
//
// Batches bursts of filesystem events into one callback. The window grows
// 1.5x when events arrive faster than `min_delay` apart and shrinks 0.8x
// on calm stretches, clamped to `[min_delay, max_delay]`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

struct DebounceState {
    deadline: Option<Instant>,
    current_delay: Duration,
    last_event: Option<Instant>,
    shutdown: bool,
}

pub struct AdaptiveDebouncer {
    state: Arc<(Mutex<DebounceState>, Condvar)>,
    handle: Option<JoinHandle<()>>,
    min_delay: Duration,
    max_delay: Duration,
    fired: Arc<AtomicBool>,
}

impl AdaptiveDebouncer {
    pub fn new<F>(min_delay: Duration, max_delay: Duration, callback: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let state = Arc::new((
            Mutex::new(DebounceState {
                deadline: None,
                current_delay: min_delay,
                last_event: None,
                shutdown: false,
            }),
            Condvar::new(),
        ));
        let fired = Arc::new(AtomicBool::new(false));

        let worker_state = state.clone();
        let worker_fired = fired.clone();
        let handle = std::thread::Builder::new()
            .name("deckard-debounce".to_string())
            .spawn(move || {
                let (lock, cvar) = &*worker_state;
                let mut guard = lock.lock().unwrap();
                loop {
                    if guard.shutdown {
                        return;
                    }
                    match guard.deadline {
                        None => {
                            guard = cvar.wait(guard).unwrap();
                        }
                        Some(deadline) => {
                            let now = Instant::now();
                            if now >= deadline {
                                guard.deadline = None;
                                drop(guard);
                                worker_fired.store(true, Ordering::Release);
                                callback();
                                guard = lock.lock().unwrap();
                            } else {
                                let (g, _) = cvar.wait_timeout(guard, deadline - now).unwrap();
                                guard = g;
                            }
                        }
                    }
                }
            })
            .expect("spawning debounce thread");

        Self {
            state,
            handle: Some(handle),
            min_delay,
            max_delay,
            fired,
        }
    }

    /// Register an event: adapt the window and (re)arm the timer.
    pub fn handle_event(&self) {
        let (lock, cvar) = &*self.state;
        let mut guard = lock.lock().unwrap();
        let now = Instant::now();
        if let Some(last) = guard.last_event {
            let elapsed = now - last;
            if elapsed < self.min_delay {
                guard.current_delay =
                    (guard.current_delay.mul_f64(1.5)).min(self.max_delay);
            } else {
                guard.current_delay =
                    (guard.current_delay.mul_f64(0.8)).max(self.min_delay);
            }
        }
        guard.last_event = Some(now);
        guard.deadline = Some(now + guard.current_delay);
        cvar.notify_one();
    }

    pub fn current_delay(&self) -> Duration {
        self.state.0.lock().unwrap().current_delay
    }

    #[cfg(test)]
    fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

impl Drop for AdaptiveDebouncer {
    fn drop(&mut self) {
        {
            let (lock, cvar) = &*self.state;
            lock.lock().unwrap().shutdown = true;
            cvar.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_grows_on_bursts_and_shrinks_on_calm() {
        let debouncer = AdaptiveDebouncer::new(
            Duration::from_millis(50),
            Duration::from_millis(400),
            || {},
        );
        // Burst: three events back to back.
        debouncer.handle_event();
        debouncer.handle_event();
        debouncer.handle_event();
        assert!(debouncer.current_delay() > Duration::from_millis(50));

        let grown = debouncer.current_delay();
        std::thread::sleep(Duration::from_millis(80));
        debouncer.handle_event();
        assert!(debouncer.current_delay() < grown);
        assert!(debouncer.current_delay() >= Duration::from_millis(50));
    }

    #[test]
    fn window_is_clamped_to_max() {
        let debouncer = AdaptiveDebouncer::new(
            Duration::from_millis(20),
            Duration::from_millis(60),
            || {},
        );
        for _ in 0..20 {
            debouncer.handle_event();
        }
        assert!(debouncer.current_delay() <= Duration::from_millis(60));
    }

    #[test]
    fn callback_fires_after_quiet_period() {
        let debouncer = AdaptiveDebouncer::new(
            Duration::from_millis(20),
            Duration::from_millis(100),
            || {},
        );
        debouncer.handle_event();
        std::thread::sleep(Duration::from_millis(120));
        assert!(debouncer.has_fired());
    }
}
