// Copyright (C) 2020  Braiins Systems s.r.o.
//
// This file is part of Braiins Open-Source Initiative (BOSI).
//
// BOSI is free software: you can redistribute it and/or modify
// it under the terms of the GNU Common Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Common Public License for more details.
//
// You should have received a copy of the GNU Common Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.
//
// Please, keep in mind that we may also license BOSI or any part thereof
// under a proprietary license. For more information on the terms and conditions
// of such proprietary license or if you have any other questions, please
// contact us at opensource@braiins.com.

//! Single-pin relay driver with switch bookkeeping
//!
//! Most relay boards are active-low: driving the line LOW energizes the
//! coil. The driver tracks the logical state and keeps statistics that the
//! UI and the regulator consume (switch count, accumulated on-time, last
//! switch). Hardware failures are logged and reported as `false` returns;
//! the regulator treats them as transient and retries on the next tick.

use ii_logging::macros::*;

use crate::error;

use embedded_hal::digital::v2::OutputPin;
use sysfs_gpio;

use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

/// BCM pin of the upper (cooling circuit) valve relay
pub const DEFAULT_UPPER_PIN: u64 = 17;
/// BCM pin of the lower (heating/return) valve relay
pub const DEFAULT_LOWER_PIN: u64 = 22;

/// Helper struct for altering output pins which implements OutputPin trait
#[derive(Clone)]
pub struct PinOut(sysfs_gpio::Pin);

impl PinOut {
    /// Export the pin in sysfs and switch it to output mode
    pub fn export(pin_num: u64) -> error::Result<Self> {
        let pin = sysfs_gpio::Pin::new(pin_num);
        pin.export()?;
        pin.set_direction(sysfs_gpio::Direction::Out)?;
        Ok(Self(pin))
    }
}

impl OutputPin for PinOut {
    type Error = sysfs_gpio::Error;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.set_value(0)
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0.set_value(1)
    }
}

/// The line abstraction behind a relay, so that the driver logic can be
/// exercised without hardware
pub trait RelayPin: Send {
    /// Drive the physical line high or low
    fn set_level(&mut self, high: bool) -> error::Result<()>;

    /// Release the line back to the system
    fn release(&mut self) -> error::Result<()> {
        Ok(())
    }
}

impl RelayPin for PinOut {
    fn set_level(&mut self, high: bool) -> error::Result<()> {
        if high {
            self.set_high()?;
        } else {
            self.set_low()?;
        }
        Ok(())
    }

    fn release(&mut self) -> error::Result<()> {
        self.0.unexport()?;
        Ok(())
    }
}

/// Stand-in used when GPIO is unavailable (development host)
pub struct NullPin;

impl RelayPin for NullPin {
    fn set_level(&mut self, _high: bool) -> error::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Statistics {
    pub is_on: bool,
    pub switch_count: u64,
    pub total_on_time: Duration,
    pub uptime: Duration,
    pub on_time_percentage: f64,
    pub last_switch_time: Option<Instant>,
}

struct Inner {
    pin: Box<dyn RelayPin>,
    initialized: bool,
    is_on: bool,
    last_switch_time: Option<Instant>,
    switch_count: u64,
    total_on_time: Duration,
    on_since: Option<Instant>,
    started: Instant,
}

pub struct Relay {
    label: String,
    active_low: bool,
    inner: Mutex<Inner>,
}

impl Relay {
    /// Open a relay on a sysfs GPIO pin, driving it to the off level
    pub fn new(label: &str, pin_num: u64, active_low: bool) -> error::Result<Self> {
        let pin = PinOut::export(pin_num)?;
        let relay = Self::with_pin(label, Box::new(pin), active_low);
        // Known-safe initial level
        if !relay.turn_off() {
            Err(error::ErrorKind::Gpio(format!(
                "relay {}: cannot drive pin {} to off level",
                label, pin_num
            )))?;
        }
        info!("relay {}: initialized on pin {}", label, pin_num);
        Ok(relay)
    }

    /// Build the driver around an already opened line
    pub fn with_pin(label: &str, pin: Box<dyn RelayPin>, active_low: bool) -> Self {
        Self {
            label: label.to_string(),
            active_low,
            inner: Mutex::new(Inner {
                pin,
                initialized: true,
                is_on: false,
                last_switch_time: None,
                switch_count: 0,
                total_on_time: Duration::from_secs(0),
                on_since: None,
                started: Instant::now(),
            }),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn level_for(&self, on: bool) -> bool {
        // Level is inverted for active-low boards
        on != self.active_low
    }

    /// Energize the relay. Idempotent with respect to the logical state.
    pub fn turn_on(&self) -> bool {
        self.set_state(true)
    }

    /// De-energize the relay. Idempotent with respect to the logical state.
    pub fn turn_off(&self) -> bool {
        self.set_state(false)
    }

    pub fn toggle(&self) -> bool {
        if self.is_on() {
            self.turn_off()
        } else {
            self.turn_on()
        }
    }

    fn set_state(&self, on: bool) -> bool {
        let level = self.level_for(on);
        let mut inner = self.inner.lock().expect("BUG: relay lock poisoned");
        if !inner.initialized {
            error!("relay {}: not initialized", self.label);
            return false;
        }

        // The line is (re)driven even when the logical state matches, which
        // heals a pin someone flipped behind our back
        if let Err(e) = inner.pin.set_level(level) {
            error!("relay {}: GPIO write failed: {}", self.label, e);
            return false;
        }

        if inner.is_on != on {
            let now = Instant::now();
            inner.is_on = on;
            inner.last_switch_time = Some(now);
            inner.switch_count += 1;
            if on {
                inner.on_since = Some(now);
                info!("relay {}: on", self.label);
            } else {
                if let Some(on_since) = inner.on_since.take() {
                    inner.total_on_time += now.duration_since(on_since);
                }
                info!("relay {}: off", self.label);
            }
        }
        true
    }

    pub fn is_on(&self) -> bool {
        self.inner.lock().expect("BUG: relay lock poisoned").is_on
    }

    pub fn last_switch_time(&self) -> Option<Instant> {
        self.inner
            .lock()
            .expect("BUG: relay lock poisoned")
            .last_switch_time
    }

    pub fn statistics(&self) -> Statistics {
        let inner = self.inner.lock().expect("BUG: relay lock poisoned");
        let now = Instant::now();
        let mut total_on_time = inner.total_on_time;
        if let Some(on_since) = inner.on_since {
            total_on_time += now.duration_since(on_since);
        }
        let uptime = now.duration_since(inner.started);
        let on_time_percentage = if uptime.as_secs_f64() > 0.0 {
            total_on_time.as_secs_f64() / uptime.as_secs_f64() * 100.0
        } else {
            0.0
        };
        Statistics {
            is_on: inner.is_on,
            switch_count: inner.switch_count,
            total_on_time,
            uptime,
            on_time_percentage,
            last_switch_time: inner.last_switch_time,
        }
    }

    /// Energize for `duration`, then restore the previous state. Used by
    /// the commissioning self-test; the regulator must be stopped.
    pub fn test_pulse(&self, duration: Duration) -> bool {
        let was_on = self.is_on();
        if !self.turn_on() {
            return false;
        }
        thread::sleep(duration);
        if was_on {
            self.turn_on()
        } else {
            self.turn_off()
        }
    }

    /// Drive the line to off and release the GPIO. Later calls are no-ops.
    pub fn cleanup(&self) {
        let mut inner = self.inner.lock().expect("BUG: relay lock poisoned");
        if !inner.initialized {
            return;
        }
        let off_level = self.level_for(false);
        if let Err(e) = inner.pin.set_level(off_level) {
            error!("relay {}: cleanup write failed: {}", self.label, e);
        }
        if let Err(e) = inner.pin.release() {
            error!("relay {}: release failed: {}", self.label, e);
        }
        if inner.is_on {
            if let Some(on_since) = inner.on_since.take() {
                inner.total_on_time += on_since.elapsed();
            }
            inner.is_on = false;
        }
        inner.initialized = false;
        info!("relay {}: cleaned up", self.label);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Records every level written to the line
    struct RecordingPin {
        level_high: Arc<AtomicBool>,
        writes: Arc<AtomicUsize>,
    }

    impl RelayPin for RecordingPin {
        fn set_level(&mut self, high: bool) -> error::Result<()> {
            self.level_high.store(high, Ordering::SeqCst);
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct BrokenPin;

    impl RelayPin for BrokenPin {
        fn set_level(&mut self, _high: bool) -> error::Result<()> {
            Err(error::ErrorKind::Gpio("simulated failure".to_string()).into())
        }
    }

    fn recording_relay(active_low: bool) -> (Relay, Arc<AtomicBool>, Arc<AtomicUsize>) {
        let level = Arc::new(AtomicBool::new(false));
        let writes = Arc::new(AtomicUsize::new(0));
        let pin = RecordingPin {
            level_high: level.clone(),
            writes: writes.clone(),
        };
        (
            Relay::with_pin("upper", Box::new(pin), active_low),
            level,
            writes,
        )
    }

    #[test]
    fn test_active_low_levels() {
        let (relay, level, _) = recording_relay(true);
        assert!(relay.turn_on());
        assert!(!level.load(Ordering::SeqCst), "on must drive LOW");
        assert!(relay.turn_off());
        assert!(level.load(Ordering::SeqCst), "off must drive HIGH");
    }

    #[test]
    fn test_active_high_levels() {
        let (relay, level, _) = recording_relay(false);
        assert!(relay.turn_on());
        assert!(level.load(Ordering::SeqCst));
        assert!(relay.turn_off());
        assert!(!level.load(Ordering::SeqCst));
    }

    #[test]
    fn test_switch_count_ignores_idempotent_calls() {
        let (relay, _, _) = recording_relay(true);
        assert_eq!(relay.statistics().switch_count, 0);

        relay.turn_on();
        relay.turn_on();
        relay.turn_on();
        assert_eq!(relay.statistics().switch_count, 1);

        relay.turn_off();
        relay.turn_off();
        assert_eq!(relay.statistics().switch_count, 2);
        assert!(relay.last_switch_time().is_some());
    }

    #[test]
    fn test_toggle() {
        let (relay, _, _) = recording_relay(true);
        assert!(!relay.is_on());
        relay.toggle();
        assert!(relay.is_on());
        relay.toggle();
        assert!(!relay.is_on());
    }

    #[test]
    fn test_on_time_accumulates() {
        let (relay, _, _) = recording_relay(true);
        relay.turn_on();
        thread::sleep(Duration::from_millis(30));
        relay.turn_off();

        let stats = relay.statistics();
        assert!(stats.total_on_time >= Duration::from_millis(30));
        assert!(stats.on_time_percentage > 0.0);
        assert!(stats.on_time_percentage <= 100.0);
    }

    #[test]
    fn test_broken_pin_reports_false() {
        let relay = Relay::with_pin("upper", Box::new(BrokenPin), true);
        assert!(!relay.turn_on());
        // The failed transition must not be recorded
        assert!(!relay.is_on());
        assert_eq!(relay.statistics().switch_count, 0);
    }

    #[test]
    fn test_cleanup_is_terminal() {
        let (relay, level, writes) = recording_relay(true);
        relay.turn_on();
        relay.cleanup();
        assert!(level.load(Ordering::SeqCst), "cleanup must drive off level");
        assert!(!relay.is_on());

        let writes_after_cleanup = writes.load(Ordering::SeqCst);
        assert!(!relay.turn_on(), "a released relay must refuse to switch");
        assert_eq!(writes.load(Ordering::SeqCst), writes_after_cleanup);

        // Second cleanup is a no-op
        relay.cleanup();
        assert_eq!(writes.load(Ordering::SeqCst), writes_after_cleanup);
    }

    #[test]
    fn test_test_pulse_restores_state() {
        let (relay, _, _) = recording_relay(true);
        assert!(relay.test_pulse(Duration::from_millis(10)));
        assert!(!relay.is_on());

        relay.turn_on();
        assert!(relay.test_pulse(Duration::from_millis(10)));
        assert!(relay.is_on());
    }
}
