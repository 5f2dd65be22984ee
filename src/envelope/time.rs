//! Envelope timestamps
//!
//! Rendered as `<seconds>.<microseconds>` with six fractional digits; this
//! string form is what the envelope id hashes.

use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::Error;

/// Wall-clock time with microsecond resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp {
    secs: u64,
    micros: u32,
}

impl Timestamp {
    pub fn new(secs: u64, micros: u32) -> Self {
        Self {
            secs: secs + u64::from(micros / 1_000_000),
            micros: micros % 1_000_000,
        }
    }

    pub fn now() -> Self {
        let since = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO);
        Self::new(since.as_secs(), since.subsec_micros())
    }

    pub fn secs(&self) -> u64 {
        self.secs
    }

    pub fn micros(&self) -> u32 {
        self.micros
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.secs, self.micros)
    }
}

impl FromStr for Timestamp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::MalformedHeader(format!("invalid timestamp '{}'", s));
        let (secs, frac) = s.trim().split_once('.').unwrap_or((s.trim(), ""));
        let secs = secs.parse::<u64>().map_err(|_| invalid())?;

        if frac.is_empty() {
            return Ok(Self::new(secs, 0));
        }
        if frac.len() > 6 || !frac.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        // Right-pad so ".5" means 500000 microseconds
        let micros = format!("{:0<6}", frac).parse::<u32>().map_err(|_| invalid())?;
        Ok(Self::new(secs, micros))
    }
}
