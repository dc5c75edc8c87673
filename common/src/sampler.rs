use log::{info, warn};

use crate::{config::SENSOR_DISCONNECTED_C, types::Reading};

pub type ProbeError = Box<dyn std::error::Error + Send + Sync>;

/// A single temperature sensor on the bus.
pub trait TemperatureProbe {
    /// Starts a conversion on the bus.
    fn request_conversion(&mut self) -> Result<(), ProbeError>;

    /// Reads back the converted value, or [`SENSOR_DISCONNECTED_C`] when the sensor
    /// did not answer.
    fn read_celsius(&mut self) -> f32;
}

/// Decides when the next reading is due and takes it.
#[derive(Debug, Clone)]
pub struct Sampler {
    interval_ms: u64,
    last_sample_ms: u64,
    samples_taken: u64,
}

impl Sampler {
    /// The first sample is due one full interval after `now_ms`.
    pub fn new(interval_ms: u64, now_ms: u64) -> Self {
        Self {
            interval_ms,
            last_sample_ms: now_ms,
            samples_taken: 0,
        }
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }

    pub fn samples_taken(&self) -> u64 {
        self.samples_taken
    }

    pub fn is_due(&self, now_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_sample_ms) > self.interval_ms
    }

    /// Takes one reading. A failed conversion request yields the sentinel value.
    pub fn sample<P: TemperatureProbe>(
        &mut self,
        probe: &mut P,
        timestamp: String,
        now_ms: u64,
    ) -> Reading {
        self.last_sample_ms = now_ms;
        self.samples_taken = self.samples_taken.saturating_add(1);

        let celsius = match probe.request_conversion() {
            Ok(()) => probe.read_celsius(),
            Err(err) => {
                warn!("failed to request temperature conversion: {err}");
                SENSOR_DISCONNECTED_C
            }
        };

        let reading = Reading::new(timestamp, celsius);
        if reading.is_valid() {
            info!(
                "temperature {} : {:.2}°C",
                reading.timestamp, reading.celsius
            );
        } else {
            warn!("failed to read from DS18B20 sensor");
        }
        reading
    }
}
