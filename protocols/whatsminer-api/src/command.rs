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

//! Whatsminer API command model
//!
//! Outbound commands are compact JSON objects of the shape
//! `{"cmd":"<command>","param":<param|null>}` with no whitespace.

use crate::error::Result;

use serde::Serialize;
use serde_json as json;

/// Command that returns device information including power telemetry
pub const GET_DEVICE_INFO: &str = "get.device.info";

#[derive(Serialize, Clone, Debug)]
pub struct Command {
    pub cmd: String,
    pub param: Option<json::Value>,
}

impl Command {
    pub fn new(cmd: &str) -> Self {
        Self {
            cmd: cmd.to_string(),
            param: None,
        }
    }

    pub fn with_param(cmd: &str, param: json::Value) -> Self {
        Self {
            cmd: cmd.to_string(),
            param: Some(param),
        }
    }

    /// Serialize into the exact wire form (compact separators)
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(json::to_vec(self)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// The first exchange of a session is sent verbatim, so the byte-exact
    /// form matters to the miner.
    #[test]
    fn test_command_wire_form() {
        let payload = Command::new(GET_DEVICE_INFO).to_payload().unwrap();
        assert_eq!(
            payload.as_slice(),
            br#"{"cmd":"get.device.info","param":null}"#
        );
    }

    #[test]
    fn test_command_with_param() {
        let payload = Command::with_param("set.led", json::json!({"color": "red"}))
            .to_payload()
            .unwrap();
        assert_eq!(
            payload.as_slice(),
            br#"{"cmd":"set.led","param":{"color":"red"}}"#
        );
    }
}
