use chrono::{DateTime, NaiveDate, Utc};

/// Abstraction over "current time" so day-boundary behavior is
/// deterministic in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone)]
pub struct FixedClock {
    now: DateTime<Utc>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self { now }
    }

    /// Fixed clock at midnight UTC of the given date.
    pub fn on_date(date: NaiveDate) -> Self {
        Self {
            now: date.and_hms_opt(0, 0, 0).expect("valid midnight").and_utc(),
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.now
    }
}
