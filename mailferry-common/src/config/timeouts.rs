use std::time::Duration;

use serde::Deserialize;

/// Per-line deadlines applied on the downstream leg.
///
/// A value of zero disables the corresponding deadline. The read deadline
/// also bounds the DATA body phase as a whole.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct Timeouts {
    /// Deadline for reading one line from the downstream client.
    ///
    /// Default: 300 seconds (5 minutes, per RFC 5321)
    #[serde(default = "default_read_secs")]
    pub read_secs: u64,

    /// Deadline for emitting one reply line to the downstream client.
    ///
    /// Default: 30 seconds
    #[serde(default = "default_write_secs")]
    pub write_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            read_secs: default_read_secs(),
            write_secs: default_write_secs(),
        }
    }
}

impl Timeouts {
    #[must_use]
    pub const fn read_timeout(&self) -> Option<Duration> {
        if self.read_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.read_secs))
        }
    }

    #[must_use]
    pub const fn write_timeout(&self) -> Option<Duration> {
        if self.write_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.write_secs))
        }
    }
}

const fn default_read_secs() -> u64 {
    300 // 5 minutes per RFC 5321
}

const fn default_write_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let timeouts = Timeouts::default();
        assert_eq!(timeouts.read_secs, 300);
        assert_eq!(timeouts.write_secs, 30);
        assert_eq!(timeouts.read_timeout(), Some(Duration::from_secs(300)));
    }

    #[test]
    fn zero_disables() {
        let timeouts = Timeouts {
            read_secs: 0,
            write_secs: 0,
        };
        assert_eq!(timeouts.read_timeout(), None);
        assert_eq!(timeouts.write_timeout(), None);
    }
}
