use std::sync::{Arc, RwLock};
use std::time::SystemTime;

use async_trait::async_trait;
use tracing::debug;

/// The latest state of charge reported by the peripheral.
#[derive(Debug, Clone, PartialEq)]
pub struct SocReading {
    /// The raw level as the peripheral reported it, 0-255. `None` when the
    /// only value seen so far was already calibrated upstream.
    pub source_value: Option<u8>,
    /// The remaining capacity in %
    pub calibrated_percentage: f64,
    pub observed_at: SystemTime,
}

/// Turns a raw reported level into a corrected percentage.
///
/// Any `Fn(u8) -> f64` closure is a calibration; implement the trait directly
/// when the correction has to await something.
#[async_trait]
pub trait Calibration: Send + Sync {
    async fn calibrate(&self, source_value: u8) -> f64;
}

#[async_trait]
impl<F> Calibration for F
where
    F: Fn(u8) -> f64 + Send + Sync,
{
    async fn calibrate(&self, source_value: u8) -> f64 {
        self(source_value)
    }
}

#[derive(Default)]
pub struct SocCalibrator {
    calibration: RwLock<Option<Arc<dyn Calibration>>>,
    reading: RwLock<Option<SocReading>>,
}

impl std::fmt::Debug for SocCalibrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocCalibrator")
            .field("calibrated", &self.calibration_installed())
            .field("reading", &self.latest())
            .finish()
    }
}

impl SocCalibrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_calibration(calibration: Arc<dyn Calibration>) -> Self {
        let calibrator = Self::new();
        calibrator.set_calibration(calibration);
        calibrator
    }

    /// Install a calibration, used from the next `record_source` on.
    pub fn set_calibration(&self, calibration: Arc<dyn Calibration>) {
        *self.calibration.write().unwrap_or_else(|e| e.into_inner()) = Some(calibration);
    }

    pub fn clear_calibration(&self) {
        *self.calibration.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn calibration_installed(&self) -> bool {
        self.calibration.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    pub fn latest(&self) -> Option<SocReading> {
        self.reading.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Record a raw level straight from the peripheral.
    ///
    /// The calibration is awaited without holding any lock, so a concurrent
    /// `record_*` call may land first; whichever finishes last wins.
    pub async fn record_source(&self, source_value: u8) -> SocReading {
        let calibration = self.calibration.read().unwrap_or_else(|e| e.into_inner()).clone();
        let calibrated_percentage = match calibration {
            Some(calibration) => calibration.calibrate(source_value).await,
            None => f64::from(source_value),
        };
        debug!("SOC: source {source_value} -> {calibrated_percentage}%");

        let reading = SocReading {
            source_value: Some(source_value),
            calibrated_percentage,
            observed_at: SystemTime::now(),
        };
        self.replace(reading.clone());
        reading
    }

    /// Record a percentage that was already calibrated elsewhere. The last
    /// raw value is kept.
    pub fn record_calibrated(&self, percentage: f64) -> SocReading {
        let mut slot = self.reading.write().unwrap_or_else(|e| e.into_inner());
        let reading = SocReading {
            source_value: slot.as_ref().and_then(|r| r.source_value),
            calibrated_percentage: percentage,
            observed_at: SystemTime::now(),
        };
        *slot = Some(reading.clone());
        reading
    }

    fn replace(&self, reading: SocReading) {
        *self.reading.write().unwrap_or_else(|e| e.into_inner()) = Some(reading);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_source_without_calibration() {
        let calibrator = SocCalibrator::new();
        let reading = calibrator.record_source(230).await;
        assert_eq!(reading.source_value, Some(230));
        assert_eq!(reading.calibrated_percentage, 230.0);
        assert_eq!(calibrator.latest(), Some(reading));
    }

    #[tokio::test]
    async fn test_record_source_with_calibration() {
        let calibrator = SocCalibrator::with_calibration(Arc::new(|x: u8| f64::from(x) / 2.0));
        let reading = calibrator.record_source(230).await;
        assert_eq!(reading.source_value, Some(230));
        assert_eq!(reading.calibrated_percentage, 115.0);
    }

    #[tokio::test]
    async fn test_calibration_swap_applies_to_next_reading() {
        let calibrator = SocCalibrator::new();
        assert_eq!(calibrator.record_source(80).await.calibrated_percentage, 80.0);

        calibrator.set_calibration(Arc::new(|x: u8| f64::from(x) + 1.0));
        assert_eq!(calibrator.record_source(80).await.calibrated_percentage, 81.0);

        calibrator.clear_calibration();
        assert_eq!(calibrator.record_source(80).await.calibrated_percentage, 80.0);
    }

    #[tokio::test]
    async fn test_record_calibrated_keeps_source_value() {
        let calibrator = SocCalibrator::new();
        let reading = calibrator.record_calibrated(42.5);
        assert_eq!(reading.source_value, None);

        calibrator.record_source(200).await;
        let reading = calibrator.record_calibrated(77.0);
        assert_eq!(reading.source_value, Some(200));
        assert_eq!(reading.calibrated_percentage, 77.0);
    }

    struct Lookup;

    #[async_trait]
    impl Calibration for Lookup {
        async fn calibrate(&self, source_value: u8) -> f64 {
            tokio::task::yield_now().await;
            f64::from(source_value.min(100))
        }
    }

    #[tokio::test]
    async fn test_async_calibration() {
        let calibrator = SocCalibrator::with_calibration(Arc::new(Lookup));
        assert_eq!(calibrator.record_source(255).await.calibrated_percentage, 100.0);
    }
}
