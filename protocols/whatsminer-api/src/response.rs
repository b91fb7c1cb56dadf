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

//! Whatsminer API response model
//!
//! Responses carry many firmware-dependent fields; only the ones the client
//! consumes are modeled, the rest is kept as raw JSON.

use crate::error::{ErrorKind, Result};

use serde::Deserialize;
use serde_json as json;

/// Top-level response envelope. A non-zero `code` means the command failed.
#[derive(Deserialize, Clone, Debug)]
pub struct Envelope {
    pub code: i32,
    #[serde(default)]
    pub msg: json::Value,
}

impl Envelope {
    pub fn from_value(value: json::Value) -> Result<Self> {
        Ok(json::from_value(value)?)
    }

    /// Turn a non-zero status code into an error
    pub fn check(self) -> Result<Self> {
        if self.code != 0 {
            Err(ErrorKind::Api(self.code))?;
        }
        Ok(self)
    }
}

/// Power-section telemetry of the `get.device.info` response
#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Power {
    #[serde(rename = "liquid-temperature")]
    pub liquid_temperature: Option<f32>,
    /// PSU temperature
    #[serde(rename = "temp0")]
    pub psu_temperature: Option<f32>,
    #[serde(rename = "fanspeed")]
    pub fan_speed: Option<u32>,
}

/// The subset of `get.device.info` the controller consumes
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeviceInfo {
    /// Session salt for encrypting follow-up commands
    pub salt: Option<String>,
    pub power: Power,
}

impl DeviceInfo {
    /// Extract the interesting fields from the `msg` object of a checked
    /// envelope. Missing sections yield `None`s rather than an error; the
    /// power block is simply absent on air-cooled models.
    pub fn from_msg(msg: &json::Value) -> Self {
        let salt = msg
            .get("salt")
            .and_then(json::Value::as_str)
            .map(str::to_string);
        let power = msg
            .get("power")
            .cloned()
            .and_then(|v| json::from_value(v).ok())
            .unwrap_or_default();
        Self { salt, power }
    }
}
