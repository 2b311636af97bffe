use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

/// Coarse system pressure (thermal state, battery saver, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PressureLevel {
    Nominal,
    Fair,
    Serious,
    Critical,
}

impl PressureLevel {
    /// How many base backoff intervals the worker waits between chunks.
    pub fn backoff_multiplier(&self) -> u32 {
        match self {
            PressureLevel::Nominal => 1,
            PressureLevel::Fair => 3,
            PressureLevel::Serious => 10,
            PressureLevel::Critical => 30,
        }
    }

    pub fn backoff(&self, base: Duration) -> Duration {
        base * self.backoff_multiplier()
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => PressureLevel::Fair,
            2 => PressureLevel::Serious,
            3 => PressureLevel::Critical,
            _ => PressureLevel::Nominal,
        }
    }
}

/// Reports the current pressure level. Polled at worker chunk boundaries.
pub trait PressureSignal: Send + Sync {
    fn level(&self) -> PressureLevel;
}

/// Pressure level set by the host application.
#[derive(Debug, Default)]
pub struct ManualPressure {
    level: AtomicU8,
}

impl ManualPressure {
    pub fn new(level: PressureLevel) -> Self {
        Self {
            level: AtomicU8::new(level as u8),
        }
    }

    pub fn set(&self, level: PressureLevel) {
        self.level.store(level as u8, Ordering::Relaxed);
    }
}

impl PressureSignal for ManualPressure {
    fn level(&self) -> PressureLevel {
        PressureLevel::from_u8(self.level.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_with_pressure() {
        let base = Duration::from_millis(10);
        let levels = [
            PressureLevel::Nominal,
            PressureLevel::Fair,
            PressureLevel::Serious,
            PressureLevel::Critical,
        ];
        for pair in levels.windows(2) {
            assert!(pair[0].backoff(base) < pair[1].backoff(base));
        }
    }

    #[test]
    fn test_manual_pressure_roundtrip() {
        let pressure = ManualPressure::default();
        assert_eq!(pressure.level(), PressureLevel::Nominal);
        pressure.set(PressureLevel::Serious);
        assert_eq!(pressure.level(), PressureLevel::Serious);
    }
}
