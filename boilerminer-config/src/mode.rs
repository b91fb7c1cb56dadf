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

//! Regulation mode and its persisted string forms
//!
//! The touchscreen historically stored localized labels, so parsing is
//! case-insensitive and accepts the Russian aliases alongside the canonical
//! `auto`/`manual`/`predictive` values. Normalization happens here, at the
//! persistence boundary, and nowhere else.

use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Hysteresis regulation
    Auto,
    /// Hysteresis with slope-based look-ahead
    Predictive,
    /// Relays follow the operator's cooling switch only
    Manual,
}

impl Mode {
    /// Canonical persisted form
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Auto => "auto",
            Mode::Predictive => "predictive",
            Mode::Manual => "manual",
        }
    }

    /// Parse any accepted spelling. Returns `None` for unknown values so
    /// that callers can refuse the write.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "auto" | "automatic" | "авто" | "автоматический" => Some(Mode::Auto),
            "predictive" | "predict" | "авто (предиктивный)" | "предиктивный" => {
                Some(Mode::Predictive)
            }
            "manual" | "ручной" => Some(Mode::Manual),
            _ => None,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mode::parse(s).ok_or_else(|| format!("unknown mode: {}", s))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mode_canonical_values() {
        assert_eq!(Mode::parse("auto"), Some(Mode::Auto));
        assert_eq!(Mode::parse("manual"), Some(Mode::Manual));
        assert_eq!(Mode::parse("predictive"), Some(Mode::Predictive));
    }

    #[test]
    fn test_mode_localized_aliases() {
        assert_eq!(Mode::parse("Авто"), Some(Mode::Auto));
        assert_eq!(Mode::parse("Автоматический"), Some(Mode::Auto));
        assert_eq!(Mode::parse("Ручной"), Some(Mode::Manual));
        assert_eq!(Mode::parse("Авто (предиктивный)"), Some(Mode::Predictive));
        assert_eq!(Mode::parse("Предиктивный"), Some(Mode::Predictive));
    }

    #[test]
    fn test_mode_case_and_whitespace() {
        assert_eq!(Mode::parse("  AUTO "), Some(Mode::Auto));
        assert_eq!(Mode::parse("Automatic"), Some(Mode::Auto));
        assert_eq!(Mode::parse("MANUAL"), Some(Mode::Manual));
    }

    #[test]
    fn test_mode_unknown_rejected() {
        assert_eq!(Mode::parse(""), None);
        assert_eq!(Mode::parse("turbo"), None);
        assert_eq!(Mode::parse("auto2"), None);
    }

    #[test]
    fn test_mode_round_trip() {
        for mode in [Mode::Auto, Mode::Predictive, Mode::Manual].iter() {
            assert_eq!(Mode::parse(mode.as_str()), Some(*mode));
        }
    }
}
