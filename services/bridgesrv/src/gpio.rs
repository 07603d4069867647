//! Local output pins.
//!
//! Scripts may drive outputs on the bridge host itself, independent of
//! the PLC. The default implementation is an in-memory simulation;
//! real Raspberry Pi pins are available behind the `gpio` feature.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tracing::debug;

use crate::error::{BridgeError, Result};

/// Digital output pins on the bridge host.
pub trait OutputPins: Send + Sync {
    fn set_pin(&self, pin: u8, state: bool) -> Result<()>;

    /// Last commanded state of every pin touched so far.
    fn pin_states(&self) -> BTreeMap<u8, bool>;
}

/// In-memory pin bank for hosts without GPIO hardware.
#[derive(Default)]
pub struct SimulatedPins {
    states: Mutex<BTreeMap<u8, bool>>,
}

impl SimulatedPins {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OutputPins for SimulatedPins {
    fn set_pin(&self, pin: u8, state: bool) -> Result<()> {
        let mut states = self
            .states
            .lock()
            .map_err(|_| BridgeError::Transport("Pin state lock poisoned".into()))?;
        debug!("Simulated pin {} -> {}", pin, state);
        states.insert(pin, state);
        Ok(())
    }

    fn pin_states(&self) -> BTreeMap<u8, bool> {
        self.states
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

#[cfg(feature = "gpio")]
pub use hardware::GpioPins;

#[cfg(feature = "gpio")]
mod hardware {
    use super::*;
    use rppal::gpio::{Gpio, OutputPin};
    use std::collections::HashMap;

    /// Raspberry Pi GPIO-backed pin bank.
    pub struct GpioPins {
        gpio: Gpio,
        pins: Mutex<HashMap<u8, OutputPin>>,
        states: Mutex<BTreeMap<u8, bool>>,
    }

    impl GpioPins {
        pub fn new() -> Result<Self> {
            let gpio = Gpio::new()
                .map_err(|e| BridgeError::Transport(format!("GPIO init failed: {e}")))?;
            Ok(Self {
                gpio,
                pins: Mutex::new(HashMap::new()),
                states: Mutex::new(BTreeMap::new()),
            })
        }
    }

    impl OutputPins for GpioPins {
        fn set_pin(&self, pin: u8, state: bool) -> Result<()> {
            let mut pins = self
                .pins
                .lock()
                .map_err(|_| BridgeError::Transport("GPIO lock poisoned".into()))?;

            if !pins.contains_key(&pin) {
                let output = self
                    .gpio
                    .get(pin)
                    .map_err(|e| {
                        BridgeError::Transport(format!("GPIO pin {pin} unavailable: {e}"))
                    })?
                    .into_output();
                pins.insert(pin, output);
            }

            if let Some(output) = pins.get_mut(&pin) {
                if state {
                    output.set_high();
                } else {
                    output.set_low();
                }
            }

            if let Ok(mut states) = self.states.lock() {
                states.insert(pin, state);
            }
            Ok(())
        }

        fn pin_states(&self) -> BTreeMap<u8, bool> {
            self.states
                .lock()
                .map(|s| s.clone())
                .unwrap_or_default()
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn simulated_pins_track_last_command() {
        let pins = SimulatedPins::new();
        pins.set_pin(0, true).unwrap();
        pins.set_pin(5, false).unwrap();
        pins.set_pin(0, false).unwrap();

        let states = pins.pin_states();
        assert_eq!(states.get(&0), Some(&false));
        assert_eq!(states.get(&5), Some(&false));
        assert_eq!(states.get(&1), None);
    }
}
