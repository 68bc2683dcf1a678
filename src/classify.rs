use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Link quality verdict, best first. Derived ordering follows declaration
/// order, so `Good < Acceptable < Poor < Unavailable` sorts best-to-worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Classification {
    Good,
    Acceptable,
    Poor,
    Unavailable,
}

impl Classification {
    /// Scheduler fetch priority. Lower values are polled first; `4` is also
    /// used for devices that have never been probed.
    pub fn priority(self) -> u8 {
        match self {
            Classification::Good => 1,
            Classification::Acceptable => 2,
            Classification::Poor => 3,
            Classification::Unavailable => 4,
        }
    }
}

impl Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Classification::Good => "Good",
            Classification::Acceptable => "Acceptable",
            Classification::Poor => "Poor",
            Classification::Unavailable => "Unavailable",
        };
        write!(f, "{name}")
    }
}

/// Classify a link from mean latency (ms), packet loss (percent) and
/// throughput (kbps). Both the probe engine and the flow reconstructor call
/// this with the same unit conventions.
///
/// The unavailability check runs before the threshold ladder: a link with no
/// surviving echoes, total loss or zero throughput is dead regardless of how
/// the other figures look.
pub fn classify(latency_ms: Option<f64>, loss_pct: f64, throughput_kbps: f64) -> Classification {
    let Some(latency) = latency_ms else {
        return Classification::Unavailable;
    };

    if loss_pct == 100.0 || throughput_kbps == 0.0 {
        return Classification::Unavailable;
    }

    if latency < 200.0 && loss_pct == 0.0 && throughput_kbps >= 500.0 {
        Classification::Good
    } else if latency <= 350.0 && loss_pct <= 20.0 && throughput_kbps >= 100.0 {
        Classification::Acceptable
    } else {
        Classification::Poor
    }
}
