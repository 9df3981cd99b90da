//! A circuit breaker guarding watch-driven controllers from event storms.
//!
//! Closed admits everything while the event rate stays under a windowed
//! threshold and downstream failures stay isolated. Tripping opens the
//! breaker for a cool-down, after which a half-open phase lets a few probes
//! through; probe successes close it again, any probe failure reopens it.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Tuning for a [`CircuitBreaker`].
#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    /// Events admitted per window while closed before tripping.
    pub max_events: u32,
    /// Width of the rate window.
    pub window: Duration,
    /// Consecutive downstream failures tolerated while closed.
    pub max_failures: u32,
    /// How long the breaker stays open before probing.
    pub open_for: Duration,
    /// Probes admitted while half-open.
    pub probe_events: u32,
    /// Probe successes needed to close again.
    pub probe_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_events: 50,
            window: Duration::from_secs(1),
            max_failures: 5,
            open_for: Duration::from_secs(30),
            probe_events: 5,
            probe_successes: 3,
        }
    }
}

/// What the breaker decided about one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The event passes; the breaker is closed.
    Allowed,
    /// The event is dropped.
    Dropped,
    /// The event passes as a probe; the breaker is half-open.
    HalfOpenAllowed,
}

impl Outcome {
    /// The metric label for this outcome.
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Allowed => "allowed",
            Outcome::Dropped => "dropped",
            Outcome::HalfOpenAllowed => "halfopen_allowed",
        }
    }
}

/// A state change, reported so callers can count transitions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Transition {
    /// The state left.
    pub from: &'static str,
    /// The state entered.
    pub to: &'static str,
}

const CLOSED: &str = "closed";
const OPEN: &str = "open";
const HALF_OPEN: &str = "half-open";

#[derive(Debug)]
enum State {
    Closed {
        window_start: Instant,
        events: u32,
        failures: u32,
    },
    Open {
        until: Instant,
    },
    HalfOpen {
        probes: u32,
        successes: u32,
    },
}

/// The breaker itself. One instance per watch.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<State>,
}

impl CircuitBreaker {
    /// A closed breaker with the given tuning.
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::Closed {
                window_start: Instant::now(),
                events: 0,
                failures: 0,
            }),
        }
    }

    /// Decide whether an event arriving at `now` passes.
    pub fn admit(&self, now: Instant) -> (Outcome, Option<Transition>) {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed {
                window_start,
                events,
                ..
            } => {
                if now.duration_since(*window_start) > self.config.window {
                    *window_start = now;
                    *events = 0;
                }
                *events += 1;
                if *events > self.config.max_events {
                    *state = State::Open {
                        until: now + self.config.open_for,
                    };
                    return (
                        Outcome::Dropped,
                        Some(Transition {
                            from: CLOSED,
                            to: OPEN,
                        }),
                    );
                }
                (Outcome::Allowed, None)
            }
            State::Open { until } => {
                if now < *until {
                    return (Outcome::Dropped, None);
                }
                *state = State::HalfOpen {
                    probes: 1,
                    successes: 0,
                };
                (
                    Outcome::HalfOpenAllowed,
                    Some(Transition {
                        from: OPEN,
                        to: HALF_OPEN,
                    }),
                )
            }
            State::HalfOpen { probes, .. } => {
                if *probes < self.config.probe_events {
                    *probes += 1;
                    (Outcome::HalfOpenAllowed, None)
                } else {
                    (Outcome::Dropped, None)
                }
            }
        }
    }

    /// Record that handling an admitted event succeeded.
    pub fn record_success(&self, now: Instant) -> Option<Transition> {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed { failures, .. } => {
                *failures = 0;
                None
            }
            State::Open { .. } => None,
            State::HalfOpen { successes, .. } => {
                *successes += 1;
                if *successes >= self.config.probe_successes {
                    *state = State::Closed {
                        window_start: now,
                        events: 0,
                        failures: 0,
                    };
                    return Some(Transition {
                        from: HALF_OPEN,
                        to: CLOSED,
                    });
                }
                None
            }
        }
    }

    /// Record that handling an admitted event failed downstream.
    pub fn record_failure(&self, now: Instant) -> Option<Transition> {
        let mut state = self.state.lock();
        match &mut *state {
            State::Closed { failures, .. } => {
                *failures += 1;
                if *failures >= self.config.max_failures {
                    *state = State::Open {
                        until: now + self.config.open_for,
                    };
                    return Some(Transition {
                        from: CLOSED,
                        to: OPEN,
                    });
                }
                None
            }
            State::Open { .. } => None,
            State::HalfOpen { .. } => {
                *state = State::Open {
                    until: now + self.config.open_for,
                };
                Some(Transition {
                    from: HALF_OPEN,
                    to: OPEN,
                })
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig {
            max_events: 3,
            window: Duration::from_secs(1),
            max_failures: 2,
            open_for: Duration::from_secs(10),
            probe_events: 2,
            probe_successes: 2,
        }
    }

    #[test]
    fn event_pressure_trips_the_breaker() {
        let breaker = CircuitBreaker::new(config());
        let t0 = Instant::now();
        for _ in 0..3 {
            assert_eq!(breaker.admit(t0).0, Outcome::Allowed);
        }
        let (outcome, transition) = breaker.admit(t0);
        assert_eq!(outcome, Outcome::Dropped);
        assert_eq!(
            transition,
            Some(Transition {
                from: "closed",
                to: "open"
            })
        );
        assert_eq!(breaker.admit(t0).0, Outcome::Dropped);
    }

    #[test]
    fn a_quiet_window_resets_the_rate() {
        let breaker = CircuitBreaker::new(config());
        let t0 = Instant::now();
        for _ in 0..3 {
            assert_eq!(breaker.admit(t0).0, Outcome::Allowed);
        }
        let later = t0 + Duration::from_secs(2);
        for _ in 0..3 {
            assert_eq!(breaker.admit(later).0, Outcome::Allowed);
        }
    }

    #[test]
    fn cool_down_leads_to_probes_then_close() {
        let breaker = CircuitBreaker::new(config());
        let t0 = Instant::now();
        for _ in 0..4 {
            breaker.admit(t0);
        }
        // Still cooling down.
        assert_eq!(breaker.admit(t0 + Duration::from_secs(5)).0, Outcome::Dropped);

        let probing = t0 + Duration::from_secs(11);
        let (outcome, transition) = breaker.admit(probing);
        assert_eq!(outcome, Outcome::HalfOpenAllowed);
        assert_eq!(
            transition,
            Some(Transition {
                from: "open",
                to: "half-open"
            })
        );
        assert_eq!(breaker.admit(probing).0, Outcome::HalfOpenAllowed);
        // Probe budget exhausted.
        assert_eq!(breaker.admit(probing).0, Outcome::Dropped);

        assert_eq!(breaker.record_success(probing), None);
        assert_eq!(
            breaker.record_success(probing),
            Some(Transition {
                from: "half-open",
                to: "closed"
            })
        );
        assert_eq!(breaker.admit(probing).0, Outcome::Allowed);
    }

    #[test]
    fn a_failed_probe_reopens() {
        let breaker = CircuitBreaker::new(config());
        let t0 = Instant::now();
        for _ in 0..4 {
            breaker.admit(t0);
        }
        let probing = t0 + Duration::from_secs(11);
        assert_eq!(breaker.admit(probing).0, Outcome::HalfOpenAllowed);
        assert_eq!(
            breaker.record_failure(probing),
            Some(Transition {
                from: "half-open",
                to: "open"
            })
        );
        assert_eq!(breaker.admit(probing).0, Outcome::Dropped);
    }

    #[test]
    fn consecutive_downstream_failures_trip_the_breaker() {
        let breaker = CircuitBreaker::new(config());
        let t0 = Instant::now();
        assert_eq!(breaker.admit(t0).0, Outcome::Allowed);
        assert_eq!(breaker.record_failure(t0), None);
        // A success in between resets the count.
        assert_eq!(breaker.record_success(t0), None);
        assert_eq!(breaker.record_failure(t0), None);
        assert_eq!(
            breaker.record_failure(t0),
            Some(Transition {
                from: "closed",
                to: "open"
            })
        );
    }
}
