//! Time abstraction, so that verification can be tested against arbitrary clocks.

use chrono::{DateTime, Utc};

/// Generates a value of `T`, in practice the current time.
pub trait Generator<T> {
    fn generate(&self) -> T;
}

/// The wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeGenerator;

impl Generator<DateTime<Utc>> for TimeGenerator {
    fn generate(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A fixed clock, for verifying against a reference time.
#[derive(Debug, Clone, Copy)]
pub struct FixedTimeGenerator(pub DateTime<Utc>);

impl Generator<DateTime<Utc>> for FixedTimeGenerator {
    fn generate(&self) -> DateTime<Utc> {
        self.0
    }
}
