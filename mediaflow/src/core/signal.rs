//! Signals that terminate stage processes.

use serde::{Deserialize, Serialize};
use std::fmt;

const SIGKILL: i32 = 9;
const SIGSEGV: i32 = 11;

/// A terminating signal, with the two resource-fault signals singled out.
///
/// The kernel OOM killer delivers `SIGKILL`, so a kill is read as an
/// out-of-memory termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "i32", into = "i32")]
pub enum CrashSignal {
    /// `SIGKILL`, normally the OOM killer.
    OutOfMemory,
    /// `SIGSEGV`, typically a driver or native-extension fault.
    Segfault,
    /// Any other signal.
    Other(i32),
}

impl CrashSignal {
    /// The raw signal number.
    #[must_use]
    pub fn number(&self) -> i32 {
        match self {
            Self::OutOfMemory => SIGKILL,
            Self::Segfault => SIGSEGV,
            Self::Other(n) => *n,
        }
    }

    /// Returns true for signals consistent with a resource or driver fault.
    #[must_use]
    pub fn is_resource_fault(&self) -> bool {
        matches!(self, Self::OutOfMemory | Self::Segfault)
    }
}

impl From<i32> for CrashSignal {
    fn from(n: i32) -> Self {
        match n {
            SIGKILL => Self::OutOfMemory,
            SIGSEGV => Self::Segfault,
            other => Self::Other(other),
        }
    }
}

impl From<CrashSignal> for i32 {
    fn from(signal: CrashSignal) -> Self {
        signal.number()
    }
}

impl fmt::Display for CrashSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "signal 9 (out of memory)"),
            Self::Segfault => write!(f, "signal 11 (segmentation fault)"),
            Self::Other(n) => write!(f, "signal {n}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_number() {
        assert_eq!(CrashSignal::from(9), CrashSignal::OutOfMemory);
        assert_eq!(CrashSignal::from(11), CrashSignal::Segfault);
        assert_eq!(CrashSignal::from(6), CrashSignal::Other(6));
        assert_eq!(CrashSignal::Other(15).number(), 15);
    }

    #[test]
    fn test_serializes_as_number() {
        let json = serde_json::to_string(&CrashSignal::Segfault).unwrap();
        assert_eq!(json, "11");
        let back: CrashSignal = serde_json::from_str("9").unwrap();
        assert_eq!(back, CrashSignal::OutOfMemory);
    }
}
