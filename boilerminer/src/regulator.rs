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

//! Hysteretic two-valve temperature regulator
//!
//! The upper channel actuates the cooling-circuit valve, the lower channel
//! the heating/return valve. Two rules hold unconditionally, whatever the
//! regulation mode:
//!
//! - the channels are mutually exclusive: both valves energized at once is
//!   a fault, handled by forcing both off
//! - per channel, two switches must be at least `min_cycle_time` apart;
//!   blocked transitions are retried on the next tick
//!
//! The decision logic is factored into pure functions taking `now`
//! explicitly, which keeps the algorithm testable without a live clock.

use ii_logging::macros::*;

use crate::halt;
use crate::relay::Relay;
use crate::store::{DataKey, DataStore, Value};

use boilerminer_config::{Mode, TemperatureSettings};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::time::sleep;

/// How often the control loop evaluates
pub const DEFAULT_CONTROL_INTERVAL: Duration = Duration::from_secs(1);

/// Minimum spacing of two switches of the same channel
pub const DEFAULT_MIN_CYCLE_TIME: Duration = Duration::from_secs(1);

/// Switching hysteresis around each setpoint. This is deliberately narrow;
/// the wide band between the setpoints themselves does the real
/// anti-chatter work.
pub const DEFAULT_SWITCH_HYSTERESIS: f32 = 0.1;

/// A temperature older than this no longer drives transitions
pub const STALE_TEMPERATURE_AFTER: Duration = Duration::from_secs(10);

/// How much history the slope estimator retains
const SLOPE_BUFFER_SPAN: Duration = Duration::from_secs(600);

/// Tunables of the predictive (slope look-ahead) algorithm
#[derive(Debug, Clone)]
pub struct PredictiveTunables {
    /// Window the slope is estimated over
    pub slope_window: Duration,
    /// Minimum sample span before a slope estimate is trusted
    pub min_slope_span: Duration,
    /// Seconds of extrapolation
    pub look_ahead: f32,
    /// °C/s below which the slope is treated as flat
    pub min_rate: f32,
    /// Pre-actuate when the forecast comes this close to the setpoint
    pub pre_on_margin: f32,
    /// Keep the valve until the reading is this close to the setpoint
    pub pre_off_margin: f32,
    /// °C/s of reversal that counts as "the process turned around"
    pub reverse_rate: f32,
    /// Excursion the reading must retrace before an early off
    pub reverse_margin: f32,
}

impl Default for PredictiveTunables {
    fn default() -> Self {
        Self {
            slope_window: Duration::from_secs(5),
            min_slope_span: Duration::from_secs(3),
            look_ahead: 5.0,
            min_rate: 0.05,
            pre_on_margin: 0.5,
            pre_off_margin: 0.5,
            reverse_rate: 0.02,
            reverse_margin: 0.10,
        }
    }
}

/// Regulator timing/threshold configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub control_interval: Duration,
    pub min_cycle_time: Duration,
    pub switch_hysteresis: f32,
    pub tunables: PredictiveTunables,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control_interval: DEFAULT_CONTROL_INTERVAL,
            min_cycle_time: DEFAULT_MIN_CYCLE_TIME,
            switch_hysteresis: DEFAULT_SWITCH_HYSTERESIS,
            tunables: PredictiveTunables::default(),
        }
    }
}

/// Time series of `(instant, temperature)` for slope estimation
pub struct SlopeWindow {
    samples: VecDeque<(Instant, f32)>,
    span: Duration,
}

impl SlopeWindow {
    pub fn new(span: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            span,
        }
    }

    pub fn push(&mut self, now: Instant, temperature: f32) {
        self.samples.push_back((now, temperature));
        while let Some((instant, _)) = self.samples.front() {
            if now.saturating_duration_since(*instant) > self.span {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Windowed slope in °C/s over the last `window`, or `None` while the
    /// retained span is shorter than `min_span` (a two-point estimate over
    /// a second of data is noise, not a trend)
    pub fn slope(&self, now: Instant, window: Duration, min_span: Duration) -> Option<f32> {
        let cutoff = now.checked_sub(window)?;
        let mut iter = self
            .samples
            .iter()
            .filter(|(instant, _)| *instant >= cutoff);
        let first = iter.next()?;
        let last = iter.last().unwrap_or(first);

        let dt = last.0.saturating_duration_since(first.0);
        if dt < min_span {
            return None;
        }
        Some((last.1 - first.1) / dt.as_secs_f32())
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }
}

/// What a single channel should do this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    TurnOn,
    TurnOff,
    Hold,
}

#[derive(Debug, Clone, Copy)]
pub struct DecisionExplained {
    pub decision: Decision,
    pub reason: &'static str,
}

impl Decision {
    fn hold(reason: &'static str) -> DecisionExplained {
        DecisionExplained {
            decision: Decision::Hold,
            reason,
        }
    }

    /// Cooling valve under plain hysteresis
    fn decide_upper_hysteresis(
        upper_on: bool,
        temperature: f32,
        settings: &TemperatureSettings,
        hysteresis: f32,
    ) -> DecisionExplained {
        if !upper_on && temperature >= settings.max_c {
            return DecisionExplained {
                decision: Decision::TurnOn,
                reason: "temperature at or above max",
            };
        }
        if upper_on && temperature < settings.max_c - hysteresis {
            return DecisionExplained {
                decision: Decision::TurnOff,
                reason: "temperature back below max",
            };
        }
        Self::hold("upper stable")
    }

    /// Heating/return valve under plain hysteresis
    fn decide_lower_hysteresis(
        lower_on: bool,
        temperature: f32,
        settings: &TemperatureSettings,
        hysteresis: f32,
    ) -> DecisionExplained {
        if !lower_on && temperature < settings.min_c {
            return DecisionExplained {
                decision: Decision::TurnOn,
                reason: "temperature below min",
            };
        }
        if lower_on && temperature > settings.min_c + hysteresis {
            return DecisionExplained {
                decision: Decision::TurnOff,
                reason: "temperature back above min",
            };
        }
        Self::hold("lower stable")
    }

    /// Cooling valve with slope look-ahead. The hysteresis rules still
    /// apply; the slope only adds earlier transitions on top.
    fn decide_upper_predictive(
        upper_on: bool,
        temperature: f32,
        slope: Option<f32>,
        min_since_on: Option<f32>,
        settings: &TemperatureSettings,
        hysteresis: f32,
        tunables: &PredictiveTunables,
    ) -> DecisionExplained {
        let base = Self::decide_upper_hysteresis(upper_on, temperature, settings, hysteresis);
        if base.decision != Decision::Hold {
            return base;
        }
        let slope = match slope {
            Some(slope) => slope,
            None => return Self::hold("upper stable (no slope)"),
        };

        if !upper_on {
            let forecast = temperature + slope * tunables.look_ahead;
            if slope > tunables.min_rate && forecast >= settings.max_c - tunables.pre_on_margin {
                return DecisionExplained {
                    decision: Decision::TurnOn,
                    reason: "rising, forecast reaches max",
                };
            }
        } else if let Some(min_since_on) = min_since_on {
            // The process has turned around and retraced enough of the
            // excursion, so the cooling loop can be closed early
            if slope >= tunables.reverse_rate
                && temperature >= min_since_on + tunables.reverse_margin
                && temperature <= settings.max_c - tunables.pre_off_margin
            {
                return DecisionExplained {
                    decision: Decision::TurnOff,
                    reason: "reversal after excursion",
                };
            }
        }
        Self::hold("upper stable")
    }

    /// Heating/return valve with slope look-ahead, mirror image of the
    /// upper rules with the slope negated
    fn decide_lower_predictive(
        lower_on: bool,
        temperature: f32,
        slope: Option<f32>,
        max_since_on: Option<f32>,
        settings: &TemperatureSettings,
        hysteresis: f32,
        tunables: &PredictiveTunables,
    ) -> DecisionExplained {
        let base = Self::decide_lower_hysteresis(lower_on, temperature, settings, hysteresis);
        if base.decision != Decision::Hold {
            return base;
        }
        let slope = match slope {
            Some(slope) => slope,
            None => return Self::hold("lower stable (no slope)"),
        };

        if !lower_on {
            let forecast = temperature + slope * tunables.look_ahead;
            if slope < -tunables.min_rate && forecast <= settings.min_c + tunables.pre_on_margin {
                return DecisionExplained {
                    decision: Decision::TurnOn,
                    reason: "falling, forecast reaches min",
                };
            }
        } else if let Some(max_since_on) = max_since_on {
            if slope <= -tunables.reverse_rate
                && temperature <= max_since_on - tunables.reverse_margin
                && temperature >= settings.min_c + tunables.pre_off_margin
            {
                return DecisionExplained {
                    decision: Decision::TurnOff,
                    reason: "reversal after excursion",
                };
            }
        }
        Self::hold("lower stable")
    }

    /// Manual mode: the channel simply follows the desired state
    fn desired(channel_on: bool, want_on: bool) -> DecisionExplained {
        if want_on && !channel_on {
            DecisionExplained {
                decision: Decision::TurnOn,
                reason: "operator request",
            }
        } else if !want_on && channel_on {
            DecisionExplained {
                decision: Decision::TurnOff,
                reason: "operator request",
            }
        } else {
            Self::hold("as requested")
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegulatorState {
    Stopped,
    Running,
    /// Observational: a tick hit an internal fault, the loop keeps going
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Upper,
    Lower,
}

impl Channel {
    fn as_str(&self) -> &'static str {
        match self {
            Channel::Upper => "upper",
            Channel::Lower => "lower",
        }
    }
}

/// Status of the regulator for others to observe
#[derive(Debug, Clone)]
pub struct Status {
    pub state: RegulatorState,
    pub mode: Mode,
    pub settings: TemperatureSettings,
    pub upper_on: bool,
    pub lower_on: bool,
    pub upper_cycles: u64,
    pub lower_cycles: u64,
    pub manual_cooling: bool,
    pub last_temperature: Option<f32>,
    pub last_slope: Option<f32>,
}

struct Inner {
    state: RegulatorState,
    mode: Mode,
    manual_cooling: bool,
    settings: TemperatureSettings,
    window: SlopeWindow,
    last_slope: Option<f32>,
    last_temperature: Option<f32>,
    upper_min_since_on: Option<f32>,
    lower_max_since_on: Option<f32>,
    upper_cycles: u64,
    lower_cycles: u64,
    last_upper_switch: Option<Instant>,
    last_lower_switch: Option<Instant>,
    published_valves: Option<(bool, bool)>,
}

pub struct Regulator {
    store: Arc<DataStore>,
    upper: Arc<Relay>,
    lower: Arc<Relay>,
    config: Config,
    inner: Mutex<Inner>,
    status_sender: watch::Sender<Option<Status>>,
    status_receiver: watch::Receiver<Option<Status>>,
}

impl Regulator {
    pub fn new(
        store: Arc<DataStore>,
        upper: Arc<Relay>,
        lower: Arc<Relay>,
        settings: TemperatureSettings,
        mode: Mode,
        config: Config,
    ) -> Arc<Self> {
        let (status_sender, status_receiver) = watch::channel(None);

        Arc::new(Self {
            store,
            upper,
            lower,
            config,
            inner: Mutex::new(Inner {
                state: RegulatorState::Stopped,
                mode,
                manual_cooling: false,
                settings,
                window: SlopeWindow::new(SLOPE_BUFFER_SPAN),
                last_slope: None,
                last_temperature: None,
                upper_min_since_on: None,
                lower_max_since_on: None,
                upper_cycles: 0,
                lower_cycles: 0,
                last_upper_switch: None,
                last_lower_switch: None,
                published_valves: None,
            }),
            status_sender,
            status_receiver,
        })
    }

    pub async fn start(regulator: Arc<Self>, halt_receiver: &halt::Receiver) {
        regulator.activate();

        halt_receiver
            .register_client("regulator termination")
            .spawn_halt_handler(Self::termination_handler(regulator.clone()));

        halt_receiver
            .register_client("regulator")
            .spawn(Self::tick_task(regulator.clone()));
    }

    /// Switch `Stopped -> Running`. Factored out of `start` so the control
    /// algorithm can be driven tick-by-tick.
    pub fn activate(&self) {
        let mut inner = self.lock_inner();
        if inner.state == RegulatorState::Stopped {
            inner.state = RegulatorState::Running;
            info!(
                "regulator: running, setpoints {:.1}-{:.1} °C, mode {}",
                inner.settings.min_c, inner.settings.max_c, inner.mode
            );
        }
    }

    pub fn state(&self) -> RegulatorState {
        self.lock_inner().state
    }

    pub fn mode(&self) -> Mode {
        self.lock_inner().mode
    }

    pub fn valve_state(&self) -> (bool, bool) {
        (self.upper.is_on(), self.lower.is_on())
    }

    pub fn status_receiver(&self) -> watch::Receiver<Option<Status>> {
        self.status_receiver.clone()
    }

    /// Change the regulation algorithm. Entering `Manual` discards any
    /// cooling request that predates the switch and schedules the lower
    /// valve off; the upper valve is then owned by the operator.
    pub fn set_mode(&self, mode: Mode) {
        let mut inner = self.lock_inner();
        if inner.mode == mode {
            return;
        }
        info!("regulator: mode {} -> {}", inner.mode, mode);
        inner.mode = mode;
        inner.manual_cooling = false;
        inner.upper_min_since_on = None;
        inner.lower_max_since_on = None;
    }

    /// Operator's cooling switch; meaningful in `Manual` only
    pub fn set_manual_cooling(&self, cooling_on: bool) {
        let mut inner = self.lock_inner();
        if inner.mode != Mode::Manual {
            debug!("regulator: cooling request ignored outside manual mode");
            return;
        }
        if inner.manual_cooling != cooling_on {
            info!(
                "regulator: manual cooling {}",
                if cooling_on { "on" } else { "off" }
            );
            inner.manual_cooling = cooling_on;
        }
    }

    /// Drive both valves off, bypassing the minimum cycle time. Used on
    /// shutdown and when the mutual-exclusion invariant is violated.
    pub fn force_all_off(&self, reason: &str) {
        info!("regulator: forcing both valves off ({})", reason);
        let now = Instant::now();
        let mut inner = self.lock_inner();
        if self.upper.turn_off() {
            inner.last_upper_switch = Some(now);
        }
        if self.lower.turn_off() {
            inner.last_lower_switch = Some(now);
        }
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("BUG: regulator lock poisoned")
    }

    /// The latest liquid temperature, provided it is usable and not stale
    fn current_temperature(&self, now: Instant) -> Option<f32> {
        let entry = self.store.get(DataKey::Temperature)?;
        if entry.age(now) > STALE_TEMPERATURE_AFTER {
            return None;
        }
        let reading = entry.value.as_temperature()?;
        if !reading.is_usable() {
            return None;
        }
        reading.liquid_c
    }

    /// One control evaluation. `now` is passed explicitly to facilitate
    /// testing; the tick task feeds it the live clock.
    pub fn tick(&self, now: Instant) {
        let mut inner = self.lock_inner();
        if inner.state == RegulatorState::Stopped {
            return;
        }

        // Setpoint changes land in the data plane; pick them up every tick
        if let Some(settings) = self
            .store
            .get_value(DataKey::TemperatureSettings)
            .and_then(|value| value.as_settings())
        {
            if settings != inner.settings {
                info!(
                    "regulator: setpoints {:.1}-{:.1} -> {:.1}-{:.1} °C",
                    inner.settings.min_c, inner.settings.max_c, settings.min_c, settings.max_c
                );
                inner.settings = settings;
            }
        }

        let temperature = self.current_temperature(now);
        if let Some(t) = temperature {
            inner.last_temperature = Some(t);
        }

        match inner.mode {
            Mode::Manual => {
                // Temperature plays no role; the valves follow the operator
                let want_upper = inner.manual_cooling;
                let upper_decision = Decision::desired(self.upper.is_on(), want_upper);
                let lower_decision = Decision::desired(self.lower.is_on(), false);
                self.apply(&mut inner, Channel::Upper, upper_decision, now);
                self.apply(&mut inner, Channel::Lower, lower_decision, now);
            }
            mode => match temperature {
                None => {
                    // Stale, absent or errored reading: relays hold state
                    debug!("regulator: no usable temperature, holding valves");
                }
                Some(t) => {
                    inner.window.push(now, t);
                    let slope = inner.window.slope(
                        now,
                        self.config.tunables.slope_window,
                        self.config.tunables.min_slope_span,
                    );
                    inner.last_slope = slope;

                    if self.upper.is_on() {
                        inner.upper_min_since_on =
                            Some(inner.upper_min_since_on.map_or(t, |m| m.min(t)));
                    }
                    if self.lower.is_on() {
                        inner.lower_max_since_on =
                            Some(inner.lower_max_since_on.map_or(t, |m| m.max(t)));
                    }

                    let settings = inner.settings;
                    let (upper_decision, lower_decision) = if mode == Mode::Predictive {
                        // The embedded hysteresis envelope spans the whole
                        // band here; the slope logic owns the early
                        // transitions within it
                        let hysteresis = settings.hysteresis_c;
                        (
                            Decision::decide_upper_predictive(
                                self.upper.is_on(),
                                t,
                                slope,
                                inner.upper_min_since_on,
                                &settings,
                                hysteresis,
                                &self.config.tunables,
                            ),
                            Decision::decide_lower_predictive(
                                self.lower.is_on(),
                                t,
                                slope,
                                inner.lower_max_since_on,
                                &settings,
                                hysteresis,
                                &self.config.tunables,
                            ),
                        )
                    } else {
                        let hysteresis = self.config.switch_hysteresis;
                        (
                            Decision::decide_upper_hysteresis(
                                self.upper.is_on(),
                                t,
                                &settings,
                                hysteresis,
                            ),
                            Decision::decide_lower_hysteresis(
                                self.lower.is_on(),
                                t,
                                &settings,
                                hysteresis,
                            ),
                        )
                    };

                    // Upper channel is evaluated and applied first
                    self.apply(&mut inner, Channel::Upper, upper_decision, now);
                    self.apply(&mut inner, Channel::Lower, lower_decision, now);
                }
            },
        }

        // Mutual exclusion is an invariant, not a hope
        if self.upper.is_on() && self.lower.is_on() {
            error!("regulator: both valves energized, forcing both off");
            if self.upper.turn_off() {
                inner.last_upper_switch = Some(now);
            }
            if self.lower.turn_off() {
                inner.last_lower_switch = Some(now);
            }
            inner.state = RegulatorState::Error;
        }

        let status = Status {
            state: inner.state,
            mode: inner.mode,
            settings: inner.settings,
            upper_on: self.upper.is_on(),
            lower_on: self.lower.is_on(),
            upper_cycles: inner.upper_cycles,
            lower_cycles: inner.lower_cycles,
            manual_cooling: inner.manual_cooling,
            last_temperature: inner.last_temperature,
            last_slope: inner.last_slope,
        };
        let valves = (status.upper_on, status.lower_on);
        let publish_valves = inner.published_valves != Some(valves);
        inner.published_valves = Some(valves);
        drop(inner);

        // Publishing happens outside the regulator lock: subscribers may
        // re-enter the regulator
        if publish_valves {
            self.store.set_at(
                DataKey::ValveStateUpper,
                Value::Bool(valves.0),
                "regulator",
                HashMap::new(),
                now,
            );
            self.store.set_at(
                DataKey::ValveStateLower,
                Value::Bool(valves.1),
                "regulator",
                HashMap::new(),
                now,
            );
        }
        self.status_sender
            .send(Some(status))
            .expect("BUG: status broadcast failed");
    }

    /// Commit a decision under the shared guardrails
    fn apply(&self, inner: &mut Inner, channel: Channel, decision: DecisionExplained, now: Instant) {
        match decision.decision {
            Decision::Hold => (),
            Decision::TurnOn => {
                // The other valve must be off before this one energizes
                let other = self.other_channel(channel);
                if self.relay(other).is_on() {
                    if !self.try_switch(inner, other, false, now) {
                        info!(
                            "regulator: {} on deferred, {} still energized ({})",
                            channel.as_str(),
                            other.as_str(),
                            decision.reason
                        );
                        return;
                    }
                }
                if self.try_switch(inner, channel, true, now) {
                    debug!("regulator: {} on ({})", channel.as_str(), decision.reason);
                }
            }
            Decision::TurnOff => {
                if self.try_switch(inner, channel, false, now) {
                    debug!("regulator: {} off ({})", channel.as_str(), decision.reason);
                }
            }
        }
    }

    fn relay(&self, channel: Channel) -> &Relay {
        match channel {
            Channel::Upper => &self.upper,
            Channel::Lower => &self.lower,
        }
    }

    fn other_channel(&self, channel: Channel) -> Channel {
        match channel {
            Channel::Upper => Channel::Lower,
            Channel::Lower => Channel::Upper,
        }
    }

    /// Switch one channel, honoring the minimum cycle time. Returns true
    /// when the channel ends up in the wanted state.
    fn try_switch(&self, inner: &mut Inner, channel: Channel, on: bool, now: Instant) -> bool {
        let relay = self.relay(channel);
        if relay.is_on() == on {
            return true;
        }

        let last_switch = match channel {
            Channel::Upper => inner.last_upper_switch,
            Channel::Lower => inner.last_lower_switch,
        };
        if let Some(last_switch) = last_switch {
            if now.saturating_duration_since(last_switch) < self.config.min_cycle_time {
                debug!(
                    "regulator: {} switch blocked by min cycle time",
                    channel.as_str()
                );
                return false;
            }
        }

        let committed = if on { relay.turn_on() } else { relay.turn_off() };
        if !committed {
            // GPIO hiccup: transient, the next tick retries
            warn!(
                "regulator: {} GPIO write failed, will retry",
                channel.as_str()
            );
            return false;
        }

        match channel {
            Channel::Upper => {
                inner.last_upper_switch = Some(now);
                if on {
                    inner.upper_cycles += 1;
                    inner.upper_min_since_on = inner.last_temperature;
                }
            }
            Channel::Lower => {
                inner.last_lower_switch = Some(now);
                if on {
                    inner.lower_cycles += 1;
                    inner.lower_max_since_on = inner.last_temperature;
                }
            }
        }
        true
    }

    async fn termination_handler(regulator: Arc<Self>) {
        regulator.force_all_off("shutdown");
        regulator.lock_inner().state = RegulatorState::Stopped;
    }

    /// Task performing the periodic control evaluation
    async fn tick_task(regulator: Arc<Self>) {
        loop {
            regulator.tick(Instant::now());
            sleep(regulator.config.control_interval).await;
        }
    }
}
