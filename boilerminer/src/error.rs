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

//! The boiler controller errors

use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Debug, Display};

use std::io;
use sysfs_gpio;

pub struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum ErrorKind {
    /// General error used for more specific input/output error.
    #[fail(display = "{}", _0)]
    General(String),

    /// Standard input/output error.
    #[fail(display = "IO: {}", _0)]
    Io(String),

    /// Invalid operator input: setpoints, IP address, mode.
    #[fail(display = "Config: {}", _0)]
    Config(String),

    /// The settings file is missing or corrupt. Fatal at boot, the file is
    /// canonical truth.
    #[fail(display = "Persistence: {}", _0)]
    Persistence(String),

    /// GPIO errors. Transient from the regulator's point of view.
    #[fail(display = "GPIO: {}", _0)]
    Gpio(String),

    /// Miner unreachable or the protocol misbehaved. Transient.
    #[fail(display = "Network: {}", _0)]
    Network(String),

    /// An internal invariant was violated.
    #[fail(display = "Logic: {}", _0)]
    Logic(String),
}

/// Implement Fail trait instead of use Derive to get more control over custom type.
/// The main advantage is customization of Context type which allows conversion of
/// any error types to this custom error with general error kind by calling context
/// method on any result type.
impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.inner, f)
    }
}

impl Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&self.inner, f)
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.inner.get_context().clone()
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Self {
        Self { inner }
    }
}

impl From<Context<String>> for Error {
    fn from(context: Context<String>) -> Self {
        Self {
            inner: context.map(|info| ErrorKind::General(info)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let msg = e.to_string();
        Self {
            inner: e.context(ErrorKind::Io(msg)),
        }
    }
}

impl From<sysfs_gpio::Error> for Error {
    fn from(gpio_error: sysfs_gpio::Error) -> Self {
        let msg = gpio_error.to_string();
        Self {
            inner: gpio_error.context(ErrorKind::Gpio(msg)),
        }
    }
}

impl From<boilerminer_config::Error> for Error {
    fn from(e: boilerminer_config::Error) -> Self {
        let kind = match e.kind() {
            boilerminer_config::ErrorKind::Config(msg) => ErrorKind::Config(msg),
            boilerminer_config::ErrorKind::Persistence(msg) => ErrorKind::Persistence(msg),
            boilerminer_config::ErrorKind::Io(msg) => ErrorKind::Persistence(msg),
        };
        Self {
            inner: e.context(kind),
        }
    }
}

impl From<ii_whatsminer_api::Error> for Error {
    fn from(e: ii_whatsminer_api::Error) -> Self {
        let msg = e.to_string();
        Self {
            inner: e.context(ErrorKind::Network(msg)),
        }
    }
}

/// A specialized `Result` type bound to [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
