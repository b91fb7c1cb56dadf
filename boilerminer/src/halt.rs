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

//! This module provides a way to
//!   * spawn tasks in "termination context"
//!   * terminate that context
//!   * wait for "termination" in normal context
//!
//! Termination context means that task is run `select`-ed on termination condition, and when
//! that condition is signaled, select returns and the task is dropped.
//! In case you want to do some cleanup, register a halt handler: it runs after the halt has
//! been broadcast, within the shutdown grace period.

use ii_logging::macros::*;

use std::sync::Arc;
use std::time::Duration;

use futures::future::{select, FutureExt};
use std::future::Future;
use tokio::sync::watch;
use tokio::time::sleep;

/// How long `send_halt` waits for registered halt handlers to do their
/// cleanup before the caller proceeds with the hard teardown
pub const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// Sender of the halt condition
#[derive(Clone)]
pub struct Sender {
    inner: Arc<watch::Sender<bool>>,
}

impl Sender {
    /// Broadcast the halt condition and give handlers a grace period
    pub async fn send_halt(&self) {
        if self.inner.send(true).is_err() {
            warn!("halt: no tasks left to stop");
            return;
        }
        sleep(SHUTDOWN_GRACE_PERIOD).await;
    }
}

/// Receiver of the halt condition
#[derive(Clone)]
pub struct Receiver {
    inner: watch::Receiver<bool>,
}

impl Receiver {
    /// Wait for the halt condition to be broadcast
    pub async fn wait_for_halt(&mut self) {
        if *self.inner.borrow() {
            return;
        }
        while self.inner.changed().await.is_ok() {
            if *self.inner.borrow() {
                return;
            }
        }
        error!("halt: sender dropped, no one to stop us now, shutting down task");
    }

    /// Register a named client about to enter the termination context
    pub fn register_client(&self, name: &str) -> Client {
        Client {
            name: name.to_string(),
            receiver: self.clone(),
        }
    }
}

/// A named client of the halt context
pub struct Client {
    name: String,
    receiver: Receiver,
}

impl Client {
    /// Spawn a task that is dropped when the halt condition arrives
    pub fn spawn<F>(self, f: F)
    where
        F: Future<Output = ()> + 'static + Send,
    {
        let mut receiver = self.receiver;
        let name = self.name;
        tokio::spawn(async move {
            select(f.boxed(), receiver.wait_for_halt().boxed()).await;
            debug!("halt: client \"{}\" terminated", name);
        });
    }

    /// Spawn a cleanup handler that runs once the halt condition arrives
    pub fn spawn_halt_handler<F>(self, f: F)
    where
        F: Future<Output = ()> + 'static + Send,
    {
        let mut receiver = self.receiver;
        let name = self.name;
        tokio::spawn(async move {
            receiver.wait_for_halt().await;
            f.await;
            debug!("halt: handler \"{}\" finished", name);
        });
    }
}

pub fn make_pair() -> (Sender, Receiver) {
    let (tx, rx) = watch::channel(false);
    (
        Sender {
            inner: Arc::new(tx),
        },
        Receiver { inner: rx },
    )
}
