//! Simulated signal chain shared by the stub backends.
//!
//! One [`SimBus`] is created per registry and handed to every simulated
//! device. The simulated DAC / signal generator publish the last driven
//! source voltage onto the bus; the simulated multimeter reads it back
//! through a configurable chain model (gain, offset, quadratic distortion,
//! optional uniform noise). With `noise` at zero the whole chain is
//! deterministic, which is what the integration tests rely on.
//!
//! The bus also keeps a call log so tests can assert on the exact hardware
//! traffic a run produced.

use rand::Rng;
use std::sync::Mutex;

use crate::config::SimSettings;

/// Shared state of the simulated bench.
pub struct SimBus {
    settings: SimSettings,
    state: Mutex<SimState>,
}

#[derive(Default)]
struct SimState {
    source_volts: f64,
    calls: Vec<String>,
}

impl SimBus {
    pub fn new(settings: SimSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(SimState::default()),
        }
    }

    /// Appends one entry to the call log.
    pub fn record(&self, call: impl Into<String>) {
        if let Ok(mut state) = self.state.lock() {
            state.calls.push(call.into());
        }
    }

    /// Snapshot of the call log.
    pub fn calls(&self) -> Vec<String> {
        self.state
            .lock()
            .map(|state| state.calls.clone())
            .unwrap_or_default()
    }

    /// Number of logged calls starting with `prefix`.
    pub fn count_calls(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .map(|state| {
                state
                    .calls
                    .iter()
                    .filter(|c| c.starts_with(prefix))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Publishes the voltage currently driven into the chain input.
    pub fn set_source_volts(&self, volts: f64) {
        if let Ok(mut state) = self.state.lock() {
            state.source_volts = volts;
        }
    }

    pub fn source_volts(&self) -> f64 {
        self.state.lock().map(|s| s.source_volts).unwrap_or(0.0)
    }

    /// Chain output seen by the simulated multimeter.
    pub fn measure_voltage(&self) -> f64 {
        let v = self.source_volts();
        let s = &self.settings;
        let mut out = s.gain * v + s.offset + s.distortion * v * v;
        if s.noise > 0.0 {
            out += rand::thread_rng().gen_range(-s.noise..=s.noise);
        }
        out
    }

    /// Rail current seen by the simulated supply readback.
    pub fn measure_current(&self, channel: u8) -> f64 {
        let s = &self.settings;
        if s.noise > 0.0 {
            // Plausible randomized readback, as the original stub produced.
            rand::thread_rng().gen_range(0.1..0.8)
        } else {
            // Deterministic per-channel value near the configured baseline.
            s.base_current + 0.01 * f64::from(channel)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deterministic_bus() -> SimBus {
        SimBus::new(SimSettings {
            gain: 2.0,
            offset: 1.0,
            distortion: 0.0,
            noise: 0.0,
            base_current: 0.4,
        })
    }

    #[test]
    fn test_chain_model_is_deterministic() {
        let bus = deterministic_bus();
        bus.set_source_volts(0.5);
        assert_eq!(bus.measure_voltage(), 2.0);
        assert_eq!(bus.measure_voltage(), 2.0);
    }

    #[test]
    fn test_distortion_term() {
        let bus = SimBus::new(SimSettings {
            gain: 1.0,
            offset: 0.0,
            distortion: 2.0,
            noise: 0.0,
            base_current: 0.4,
        });
        bus.set_source_volts(0.5);
        // 1.0 * 0.5 + 2.0 * 0.25
        assert_eq!(bus.measure_voltage(), 1.0);
    }

    #[test]
    fn test_call_log() {
        let bus = deterministic_bus();
        bus.record("output_on DP1 ch1");
        bus.record("output_off DP1 ch1");
        bus.record("output_off DP1 ch2");
        assert_eq!(bus.calls().len(), 3);
        assert_eq!(bus.count_calls("output_off"), 2);
    }

    #[test]
    fn test_deterministic_current_varies_by_channel() {
        let bus = deterministic_bus();
        assert!(bus.measure_current(2) > bus.measure_current(1));
    }
}
