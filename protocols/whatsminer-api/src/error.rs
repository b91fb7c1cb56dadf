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

//! The Whatsminer API client errors

use failure::{Backtrace, Context, Fail};
use std::fmt::{self, Debug, Display};

use std::io;

pub struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Clone, Eq, PartialEq, Debug, Fail)]
pub enum ErrorKind {
    /// Establishing the TCP session failed.
    #[fail(display = "Connect: {}", _0)]
    Connect(String),

    /// A connect/read/write exceeded its deadline.
    #[fail(display = "Timeout: {}", _0)]
    Timeout(String),

    /// The peer closed the stream before a complete frame arrived.
    #[fail(display = "Short read: {}", _0)]
    ShortRead(String),

    /// The length prefix exceeds the maximum frame size.
    #[fail(display = "Absurd frame length: {} bytes", _0)]
    LengthAbsurd(u32),

    /// The payload could not be interpreted as JSON, even after decryption.
    #[fail(display = "Decode: {}", _0)]
    Decode(String),

    /// Session key derivation or AES decryption failed.
    #[fail(display = "Crypto: {}", _0)]
    Crypto(String),

    /// The miner answered with a non-zero status code.
    #[fail(display = "API error code {}", _0)]
    Api(i32),

    /// Standard input/output error.
    #[fail(display = "IO: {}", _0)]
    Io(String),
}

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

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::UnexpectedEof => ErrorKind::ShortRead(e.to_string()),
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                ErrorKind::Timeout(e.to_string())
            }
            _ => ErrorKind::Io(e.to_string()),
        };
        let msg = kind.clone();
        Self {
            inner: e.context(msg),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        let msg = e.to_string();
        Self {
            inner: e.context(ErrorKind::Decode(msg)),
        }
    }
}

/// A specialized `Result` type bound to [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
