//! Runtime identity types: session identifiers and step numbers.
//!
//! These are thin newtypes over the `String`/`u64` that
//! [`crate::runtimes::runner::AppRunner`] already passes around, for call
//! sites that want a typed handle instead of a bare primitive (e.g. when
//! generating a fresh session id, or walking a step counter without risking
//! an accidental wraparound).

use std::fmt;

use serde::{Deserialize, Serialize};

/// A workflow session identifier.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// A fresh, randomly generated session id.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A superstep counter, matching the `step: u64` field
/// [`crate::runtimes::runner::SessionState`] already tracks.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepNumber(u64);

impl StepNumber {
    #[must_use]
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn zero() -> Self {
        Self(0)
    }

    #[must_use]
    pub fn value(&self) -> u64 {
        self.0
    }

    #[must_use]
    pub fn is_initial(&self) -> bool {
        self.0 == 0
    }

    /// The next step, saturating at `u64::MAX` rather than wrapping.
    #[must_use]
    pub fn next(&self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for StepNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for StepNumber {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_round_trips_through_display() {
        let id = SessionId::new("abc");
        assert_eq!(id.as_str(), "abc");
        assert_eq!(id.to_string(), "abc");
    }

    #[test]
    fn session_id_generate_is_unique() {
        assert_ne!(SessionId::generate(), SessionId::generate());
    }

    #[test]
    fn step_number_advances_and_saturates() {
        let step = StepNumber::new(5);
        assert_eq!(step.next().value(), 6);
        assert_eq!(StepNumber::new(u64::MAX).next().value(), u64::MAX);
        assert!(StepNumber::zero().is_initial());
    }
}
