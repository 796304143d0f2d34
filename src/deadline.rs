use std::time::{Duration, Instant};

/// A caller-imposed point in time after which work must be abandoned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// No deadline; only configured timeouts apply.
    pub fn none() -> Self {
        Deadline(None)
    }

    pub fn at(instant: Instant) -> Self {
        Deadline(Some(instant))
    }

    /// A timeout too large to represent as an instant means no deadline.
    pub fn after(timeout: Duration) -> Self {
        Deadline(Instant::now().checked_add(timeout))
    }

    pub fn instant(&self) -> Option<Instant> {
        self.0
    }

    /// Time left, or `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.0
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// The earlier of two deadlines.
    pub fn min(self, other: Deadline) -> Deadline {
        match (self.0, other.0) {
            (Some(a), Some(b)) => Deadline(Some(a.min(b))),
            (Some(a), None) | (None, Some(a)) => Deadline(Some(a)),
            (None, None) => Deadline(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_prefers_earlier_bound() {
        let soon = Deadline::after(Duration::from_millis(10));
        let later = Deadline::after(Duration::from_secs(10));
        assert_eq!(soon.min(later), soon);
        assert_eq!(Deadline::none().min(later), later);
        assert_eq!(Deadline::none().min(Deadline::none()), Deadline::none());
    }

    #[test]
    fn test_expiry() {
        assert!(!Deadline::none().is_expired());
        assert!(Deadline::at(Instant::now()).is_expired());
        assert!(Deadline::after(Duration::from_secs(60)).remaining().unwrap() > Duration::from_secs(59));
    }

    #[test]
    fn test_unrepresentable_timeout_is_unbounded() {
        let deadline = Deadline::after(Duration::MAX);
        assert_eq!(deadline, Deadline::none());
        assert!(!deadline.is_expired());
        assert_eq!(deadline.remaining(), None);
    }
}
