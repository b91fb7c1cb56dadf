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

//! This module handles controller configuration: environment variables
//! with built-in defaults, optionally overridden from the command line.
//! The persisted settings file overrides the temperature band and the
//! miner address at boot; env only seeds the very first run.

use crate::error::{self, ErrorKind};
use crate::regulator;
use crate::relay;

use std::env;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Default miner address, the factory subnet of the reference installation
pub const DEFAULT_ASIC_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 127);

pub const DEFAULT_CONFIG_DIR: &str = "config";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpioMode {
    /// Broadcom channel numbers (native for sysfs)
    Bcm,
    /// Physical header positions, translated to BCM
    Board,
}

/// Physical header position to Broadcom channel, 40-pin header
fn board_to_bcm(pin: u64) -> Option<u64> {
    match pin {
        3 => Some(2),
        5 => Some(3),
        7 => Some(4),
        8 => Some(14),
        10 => Some(15),
        11 => Some(17),
        12 => Some(18),
        13 => Some(27),
        15 => Some(22),
        16 => Some(23),
        18 => Some(24),
        19 => Some(10),
        21 => Some(9),
        22 => Some(25),
        23 => Some(11),
        24 => Some(8),
        26 => Some(7),
        29 => Some(5),
        31 => Some(6),
        32 => Some(12),
        33 => Some(13),
        35 => Some(19),
        36 => Some(16),
        37 => Some(26),
        38 => Some(20),
        40 => Some(21),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// BCM pin of the cooling-circuit valve relay
    pub upper_pin: u64,
    /// BCM pin of the heating/return valve relay
    pub lower_pin: u64,
    pub asic_ip: Ipv4Addr,
    pub asic_port: u16,
    pub min_temp: f32,
    pub max_temp: f32,
    pub switch_hysteresis: f32,
    pub control_interval: Duration,
    pub update_interval: Duration,
    pub min_cycle_time: Duration,
    pub config_dir: PathBuf,
    pub rolling_log_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upper_pin: relay::DEFAULT_UPPER_PIN,
            lower_pin: relay::DEFAULT_LOWER_PIN,
            asic_ip: DEFAULT_ASIC_IP,
            asic_port: ii_whatsminer_api::DEFAULT_PORT,
            min_temp: boilerminer_config::DEFAULT_MIN_TEMP,
            max_temp: boilerminer_config::DEFAULT_MAX_TEMP,
            switch_hysteresis: regulator::DEFAULT_SWITCH_HYSTERESIS,
            control_interval: regulator::DEFAULT_CONTROL_INTERVAL,
            update_interval: crate::poller::DEFAULT_UPDATE_INTERVAL,
            min_cycle_time: regulator::DEFAULT_MIN_CYCLE_TIME,
            config_dir: PathBuf::from(DEFAULT_CONFIG_DIR),
            rolling_log_path: PathBuf::from(crate::rolling_log::DEFAULT_LOG_PATH),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> error::Result<T> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|_| {
            ErrorKind::Config(format!("cannot parse {}={:?}", name, raw)).into()
        }),
    }
}

fn env_seconds(name: &str, default: Duration) -> error::Result<Duration> {
    let seconds = env_parse::<f64>(name, default.as_secs_f64())?;
    if !(seconds > 0.0) {
        Err(ErrorKind::Config(format!("{} must be positive", name)))?;
    }
    Ok(Duration::from_secs_f64(seconds))
}

impl Config {
    /// Resolve the configuration from the environment (§ env variables:
    /// `RELAY_PIN`, `RELAY_PIN_LOW`, `GPIO_MODE`, `ASIC_IP`, `MAX_TEMP`,
    /// `MIN_TEMP`, `TEMP_HYSTERESIS`, `CONTROL_INTERVAL`,
    /// `UPDATE_INTERVAL`, `MIN_CYCLE_TIME`)
    pub fn from_env() -> error::Result<Self> {
        let defaults = Self::default();

        let gpio_mode = match env::var("GPIO_MODE") {
            Err(_) => GpioMode::Bcm,
            Ok(raw) => match raw.to_uppercase().as_str() {
                "BCM" => GpioMode::Bcm,
                "BOARD" => GpioMode::Board,
                _ => Err(ErrorKind::Config(format!("unknown GPIO_MODE {:?}", raw)))?,
            },
        };
        let resolve_pin = |name: &str, default: u64| -> error::Result<u64> {
            let pin = env_parse(name, default)?;
            match gpio_mode {
                GpioMode::Bcm => Ok(pin),
                GpioMode::Board => board_to_bcm(pin).ok_or_else(|| {
                    ErrorKind::Config(format!("{}={} is not a GPIO header position", name, pin))
                        .into()
                }),
            }
        };

        let upper_pin = resolve_pin("RELAY_PIN", defaults.upper_pin)?;
        let lower_pin = resolve_pin("RELAY_PIN_LOW", defaults.lower_pin)?;
        if upper_pin == lower_pin {
            Err(ErrorKind::Config(format!(
                "upper and lower valve share pin {}",
                upper_pin
            )))?;
        }

        let min_temp = env_parse("MIN_TEMP", defaults.min_temp)?;
        let max_temp = env_parse("MAX_TEMP", defaults.max_temp)?;
        boilerminer_config::validate_band(min_temp, max_temp).map_err(ErrorKind::Config)?;

        let switch_hysteresis = env_parse("TEMP_HYSTERESIS", defaults.switch_hysteresis)?;
        if !(switch_hysteresis > 0.0) {
            Err(ErrorKind::Config(
                "TEMP_HYSTERESIS must be positive".to_string(),
            ))?;
        }

        Ok(Self {
            upper_pin,
            lower_pin,
            asic_ip: env_parse("ASIC_IP", defaults.asic_ip)?,
            asic_port: defaults.asic_port,
            min_temp,
            max_temp,
            switch_hysteresis,
            control_interval: env_seconds("CONTROL_INTERVAL", defaults.control_interval)?,
            update_interval: env_seconds("UPDATE_INTERVAL", defaults.update_interval)?,
            min_cycle_time: env_seconds("MIN_CYCLE_TIME", defaults.min_cycle_time)?,
            config_dir: defaults.config_dir,
            rolling_log_path: defaults.rolling_log_path,
        })
    }

    pub fn regulator_config(&self) -> regulator::Config {
        regulator::Config {
            control_interval: self.control_interval,
            min_cycle_time: self.min_cycle_time,
            switch_hysteresis: self.switch_hysteresis,
            tunables: regulator::PredictiveTunables::default(),
        }
    }
}
