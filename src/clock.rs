use chrono::NaiveDateTime;

/// Wall-clock source for partitioning and naming.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

/// The system clock, read either in the local time zone or in UTC.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock {
    pub utc: bool,
}

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        if self.utc {
            chrono::Utc::now().naive_utc()
        } else {
            chrono::Local::now().naive_local()
        }
    }
}

/// Always returns the same instant.
#[cfg(test)]
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

#[cfg(test)]
impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}
