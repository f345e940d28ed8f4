//! Time-windowed call coalescing.
//!
//! [`DebounceState`] and [`ThrottleState`] are the scheduling rules with the
//! clock passed in. [`debounce`] and [`throttle`] wrap them in a driver task
//! on the tokio runtime that owns the timer and invokes the callback.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};

/// Trailing-edge debounce: fires with the latest value once `window` has
/// passed without a new call.
#[derive(Debug)]
pub struct DebounceState<T> {
    window: Duration,
    pending: Option<T>,
    deadline: Option<Instant>,
}

impl<T> DebounceState<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
            deadline: None,
        }
    }

    /// Record `value` as the latest arguments and restart the window.
    pub fn call(&mut self, value: T, now: Instant) {
        self.pending = Some(value);
        self.deadline = Some(now + self.window);
    }

    /// When the pending value becomes due.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Take the pending value if its window has elapsed.
    pub fn due(&mut self, now: Instant) -> Option<T> {
        match self.deadline {
            Some(deadline) if deadline <= now => self.flush(),
            _ => None,
        }
    }

    /// Take the pending value now and cancel the timer.
    pub fn flush(&mut self) -> Option<T> {
        self.deadline = None;
        self.pending.take()
    }
}

/// Leading-edge throttle with a single trailing call.
///
/// A call more than `window` after the last invocation fires immediately.
/// Calls inside the window replace one trailing value that fires at the
/// window boundary, so the final state is never dropped.
#[derive(Debug)]
pub struct ThrottleState<T> {
    window: Duration,
    last_fired: Option<Instant>,
    trailing: Option<T>,
}

impl<T> ThrottleState<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_fired: None,
            trailing: None,
        }
    }

    /// Returns the value to invoke with immediately, if the window allows it.
    pub fn call(&mut self, value: T, now: Instant) -> Option<T> {
        let open = match self.last_fired {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.window,
        };
        if open {
            // newer than any trailing value still waiting
            self.trailing = None;
            self.last_fired = Some(now);
            Some(value)
        } else {
            self.trailing = Some(value);
            None
        }
    }

    /// When the trailing value becomes due.
    pub fn deadline(&self) -> Option<Instant> {
        match (&self.trailing, self.last_fired) {
            (Some(_), Some(last)) => Some(last + self.window),
            _ => None,
        }
    }

    /// Take the trailing value if the window boundary has been reached.
    pub fn due(&mut self, now: Instant) -> Option<T> {
        match self.deadline() {
            Some(deadline) if deadline <= now => {
                self.last_fired = Some(now);
                self.trailing.take()
            }
            _ => None,
        }
    }
}

enum Command<T> {
    Call(T),
    Flush(oneshot::Sender<bool>),
    Cancel,
}

/// Handle to a debounced callback. Dropping it stops the driver and discards
/// anything pending; call [`Debounced::flush`] first to keep it.
pub struct Debounced<T> {
    tx: mpsc::UnboundedSender<Command<T>>,
    driver: JoinHandle<()>,
}

/// Debounce `f` over `window`. Must be called within a tokio runtime.
pub fn debounce<T, F>(mut f: F, window: Duration) -> Debounced<T>
where
    T: Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Command<T>>();
    let driver = tokio::spawn(async move {
        let mut state = DebounceState::new(window);
        loop {
            let deadline = state.deadline();
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    None => break,
                    Some(Command::Call(value)) => state.call(value, Instant::now()),
                    Some(Command::Flush(ack)) => {
                        let fired = match state.flush() {
                            Some(value) => {
                                f(value);
                                true
                            }
                            None => false,
                        };
                        let _ = ack.send(fired);
                    }
                    Some(Command::Cancel) => {
                        state.flush();
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(value) = state.due(Instant::now()) {
                        f(value);
                    }
                }
            }
        }
    });
    Debounced { tx, driver }
}

impl<T> Debounced<T> {
    /// Record the latest arguments and restart the window.
    pub fn call(&self, value: T) {
        if self.tx.send(Command::Call(value)).is_err() {
            tracing::warn!("debounce driver stopped, dropping call");
        }
    }

    /// Invoke the callback now with pending arguments, if any.
    ///
    /// Returns whether the callback ran.
    pub async fn flush(&self) -> bool {
        let (ack, done) = oneshot::channel();
        if self.tx.send(Command::Flush(ack)).is_err() {
            return false;
        }
        done.await.unwrap_or(false)
    }

    /// Drop pending arguments without invoking the callback.
    pub fn cancel(&self) {
        let _ = self.tx.send(Command::Cancel);
    }
}

impl<T> Drop for Debounced<T> {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Handle to a throttled callback.
pub struct Throttled<T> {
    tx: mpsc::UnboundedSender<T>,
    driver: JoinHandle<()>,
}

/// Throttle `f` to one invocation per `window`. Must be called within a
/// tokio runtime.
pub fn throttle<T, F>(mut f: F, window: Duration) -> Throttled<T>
where
    T: Send + 'static,
    F: FnMut(T) + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<T>();
    let driver = tokio::spawn(async move {
        let mut state = ThrottleState::new(window);
        loop {
            let deadline = state.deadline();
            tokio::select! {
                value = rx.recv() => match value {
                    None => break,
                    Some(value) => {
                        if let Some(value) = state.call(value, Instant::now()) {
                            f(value);
                        }
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if let Some(value) = state.due(Instant::now()) {
                        f(value);
                    }
                }
            }
        }
    });
    Throttled { tx, driver }
}

impl<T> Throttled<T> {
    pub fn call(&self, value: T) {
        if self.tx.send(value).is_err() {
            tracing::warn!("throttle driver stopped, dropping call");
        }
    }
}

impl<T> Drop for Throttled<T> {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn recorder<T: Send + 'static>() -> (Arc<Mutex<Vec<(T, Instant)>>>, impl FnMut(T) + Send) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        (calls, move |value| {
            sink.lock().unwrap().push((value, Instant::now()))
        })
    }

    #[test]
    fn test_debounce_state_restarts_window() {
        let t0 = Instant::now();
        let mut state = DebounceState::new(ms(300));

        state.call("a", t0);
        state.call("b", t0 + ms(200));
        assert_eq!(state.due(t0 + ms(400)), None);
        assert_eq!(state.deadline(), Some(t0 + ms(500)));
        assert_eq!(state.due(t0 + ms(500)), Some("b"));
        assert_eq!(state.due(t0 + ms(900)), None);
        assert!(!state.is_pending());
    }

    #[test]
    fn test_debounce_state_flush() {
        let t0 = Instant::now();
        let mut state = DebounceState::new(ms(300));
        assert_eq!(state.flush(), None::<u8>);

        state.call(1, t0);
        assert_eq!(state.flush(), Some(1));
        assert_eq!(state.deadline(), None);
        assert_eq!(state.due(t0 + ms(1000)), None);
    }

    #[test]
    fn test_throttle_state_leading_and_trailing() {
        let t0 = Instant::now();
        let mut state = ThrottleState::new(ms(100));

        assert_eq!(state.call(1, t0), Some(1));
        assert_eq!(state.call(2, t0 + ms(10)), None);
        assert_eq!(state.call(3, t0 + ms(20)), None);
        assert_eq!(state.deadline(), Some(t0 + ms(100)));
        assert_eq!(state.due(t0 + ms(99)), None);
        assert_eq!(state.due(t0 + ms(100)), Some(3));
        assert_eq!(state.deadline(), None);
        // the trailing call opened a new window
        assert_eq!(state.call(4, t0 + ms(150)), None);
        assert_eq!(state.due(t0 + ms(200)), Some(4));
    }

    #[test]
    fn test_throttle_state_late_call_supersedes_trailing() {
        let t0 = Instant::now();
        let mut state = ThrottleState::new(ms(100));

        assert_eq!(state.call(1, t0), Some(1));
        assert_eq!(state.call(2, t0 + ms(50)), None);
        // boundary passed without the trailing value being collected
        assert_eq!(state.call(3, t0 + ms(180)), Some(3));
        assert_eq!(state.due(t0 + ms(400)), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_coalesces_burst() {
        let (calls, f) = recorder();
        let debounced = debounce(f, ms(300));
        let start = Instant::now();

        for (i, at) in [0u64, 50, 100, 150].into_iter().enumerate() {
            tokio::time::sleep_until(start + ms(at)).await;
            debounced.call(i);
        }
        tokio::time::sleep(ms(1000)).await;

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, 3);
        assert_eq!(calls[0].1 - start, ms(450));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_separate_bursts_fire_separately() {
        let (calls, f) = recorder();
        let debounced = debounce(f, ms(100));

        debounced.call("first");
        tokio::time::sleep(ms(250)).await;
        debounced.call("second");
        tokio::time::sleep(ms(250)).await;

        let values: Vec<_> = calls.lock().unwrap().iter().map(|(v, _)| *v).collect();
        assert_eq!(values, vec!["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_flush_fires_once() {
        let (calls, f) = recorder();
        let debounced = debounce(f, ms(300));

        assert!(!debounced.flush().await);
        debounced.call(7);
        assert!(debounced.flush().await);
        assert!(!debounced.flush().await);
        tokio::time::sleep(ms(1000)).await;

        let values: Vec<_> = calls.lock().unwrap().iter().map(|(v, _)| *v).collect();
        assert_eq!(values, vec![7]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_cancel_discards_pending() {
        let (calls, f) = recorder::<u8>();
        let debounced = debounce(f, ms(100));

        debounced.call(1);
        debounced.cancel();
        tokio::time::sleep(ms(500)).await;
        assert!(!debounced.flush().await);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_limits_rate_and_keeps_last() {
        let (calls, f) = recorder();
        let throttled = throttle(f, ms(100));
        let start = Instant::now();

        for i in 0..10u64 {
            tokio::time::sleep_until(start + ms(i * 30)).await;
            throttled.call(i);
        }
        tokio::time::sleep(ms(500)).await;

        let calls = calls.lock().unwrap();
        let values: Vec<_> = calls.iter().map(|(v, _)| *v).collect();
        // leading at 0, then one trailing call per window boundary
        assert_eq!(values, vec![0, 3, 6, 9]);
        for pair in calls.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= ms(100));
        }
    }
}
