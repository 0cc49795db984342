use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

const NANOS_PER_SECOND: i32 = 1_000_000_000;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: i32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: i32) -> Self {
        let extra_seconds = nanos.div_euclid(NANOS_PER_SECOND);
        Self {
            seconds: seconds + extra_seconds as i64,
            nanos: nanos.rem_euclid(NANOS_PER_SECOND),
        }
    }

    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_else(|_| Duration::from_secs(0));
        Self {
            seconds: duration.as_secs() as i64,
            nanos: duration.subsec_nanos() as i32,
        }
    }

    pub fn from_micros(micros: i64) -> Self {
        Self::new(micros.div_euclid(1_000_000), (micros.rem_euclid(1_000_000) * 1_000) as i32)
    }

    pub fn to_micros(&self) -> i64 {
        self.seconds * 1_000_000 + (self.nanos / 1_000) as i64
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        self.seconds
            .cmp(&other.seconds)
            .then(self.nanos.cmp(&other.nanos))
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Timestamp(seconds={}, nanos={})", self.seconds, self.nanos)
    }
}
