use std::thread;
use std::time::Duration;

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Refused, reset or timed-out connections.
    Connection,
    Other,
}

/// Something that can wait. Production code sleeps the thread.
pub trait Pause: Send + Sync {
    fn pause(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadPause;

impl Pause for ThreadPause {
    fn pause(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Exponential backoff with two tracks: connection failures start from
/// `connection_base_delay`, everything else from `base_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub connection_base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            connection_base_delay: Duration::from_secs(5),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after the `attempt`-th failure (0-based).
    pub fn delay_for(&self, attempt: u32, class: FailureClass) -> Duration {
        let base = match class {
            FailureClass::Connection => self.connection_base_delay,
            FailureClass::Other => self.base_delay,
        };
        let factor = self.multiplier.max(1.0).powi(attempt.min(63) as i32);
        let millis = (base.as_millis() as f64 * factor).min(self.max_delay.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Runs `op` until it succeeds, `classify` returns `None`, or attempts run out.
    /// The last error is returned unchanged.
    pub fn run<T, E, F, C>(&self, pause: &dyn Pause, mut op: F, classify: C) -> Result<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        C: Fn(&E) -> Option<FailureClass>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let Some(class) = classify(&err) else {
                        return Err(err);
                    };
                    if attempt + 1 >= attempts {
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt, class);
                    debug!(attempt, ?class, delay_ms = delay.as_millis() as u64, "retrying");
                    pause.pause(delay);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingPause {
        pauses: Mutex<Vec<Duration>>,
    }

    impl RecordingPause {
        fn recorded(&self) -> Vec<Duration> {
            self.pauses.lock().unwrap().clone()
        }
    }

    impl Pause for RecordingPause {
        fn pause(&self, duration: Duration) {
            self.pauses.lock().unwrap().push(duration);
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            connection_base_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_millis(3000),
        }
    }

    #[test]
    fn delay_doubles_up_to_cap() {
        let policy = policy();
        assert_eq!(
            policy.delay_for(0, FailureClass::Other),
            Duration::from_millis(100)
        );
        assert_eq!(
            policy.delay_for(2, FailureClass::Other),
            Duration::from_millis(400)
        );
        assert_eq!(
            policy.delay_for(1, FailureClass::Connection),
            Duration::from_millis(2000)
        );
        assert_eq!(
            policy.delay_for(5, FailureClass::Connection),
            Duration::from_millis(3000)
        );
    }

    #[test]
    fn gives_up_after_max_attempts() {
        let pause = RecordingPause::default();
        let mut calls = 0;
        let result: Result<(), &str> = policy().run(
            &pause,
            |_| {
                calls += 1;
                Err("boom")
            },
            |_| Some(FailureClass::Other),
        );
        assert_eq!(result, Err("boom"));
        assert_eq!(calls, 4);
        assert_eq!(pause.recorded().len(), 3);
    }

    #[test]
    fn unclassified_errors_are_not_retried() {
        let pause = RecordingPause::default();
        let result: Result<(), &str> = policy().run(&pause, |_| Err("fatal"), |_| None);
        assert_eq!(result, Err("fatal"));
        assert!(pause.recorded().is_empty());
    }
}
