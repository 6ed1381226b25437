use core::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

/// How often a kind of backup should run.
#[derive(Hash, Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum Cadence {
    /// A backup should run every hour.
    Hourly,

    /// A backup should run every day.
    Daily,

    /// A backup should run every week,
    Weekly,

    /// A backup should run every month.
    Monthly,
}

impl Cadence {
    /// The time that must pass between two runs.
    pub fn interval(&self) -> Duration {
        match self {
            Self::Hourly => Duration::from_secs(60 * 60),
            Self::Daily => Duration::from_secs(60 * 60 * 24),
            Self::Weekly => Duration::from_secs(60 * 60 * 24 * 7),
            Self::Monthly => Duration::from_secs(60 * 60 * 24 * 30),
        }
    }

    /// If a run last attempted `elapsed` ago is due again.
    pub fn is_due(&self, elapsed: Duration) -> bool {
        elapsed >= self.interval()
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hourly => write!(f, "hourly"),
            Self::Daily => write!(f, "daily"),
            Self::Weekly => write!(f, "weekly"),
            Self::Monthly => write!(f, "monthly"),
        }
    }
}

impl FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Hourly" | "hourly" => Ok(Self::Hourly),
            "Daily" | "daily" => Ok(Self::Daily),
            "Weekly" | "weekly" => Ok(Self::Weekly),
            "Monthly" | "monthly" => Ok(Self::Monthly),
            _ => Err(format!("invalid cadence '{s}'")),
        }
    }
}
