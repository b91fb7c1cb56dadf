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

//! Mode/cooling listener
//!
//! Bridges the data plane to the regulator: whatever lands under the
//! `Mode` and `CoolingState` keys (from the touchscreen via the settings
//! store, or from boot-time publication) is translated into regulator
//! calls. The callbacks only flip flags under a short lock, so they are
//! safe to run on the writer's thread.

use ii_logging::macros::*;

use crate::regulator::Regulator;
use crate::store::{DataKey, DataStore, SubscriptionId};

use boilerminer_config::Mode;

use std::sync::Arc;

pub struct ModeListener {
    store: Arc<DataStore>,
    subscriptions: Vec<SubscriptionId>,
}

impl ModeListener {
    /// Subscribe and immediately apply the currently published mode and
    /// cooling state, so the regulator starts out consistent with the
    /// data plane before its first tick.
    pub fn start(store: Arc<DataStore>, regulator: Arc<Regulator>) -> Self {
        let mode_regulator = regulator.clone();
        let mode_subscription = store.subscribe(DataKey::Mode, move |entry| {
            match entry.value.as_mode() {
                Some(mode) => mode_regulator.set_mode(mode),
                None => warn!("mode listener: non-mode value under the mode key"),
            }
        });

        let cooling_regulator = regulator.clone();
        let cooling_subscription = store.subscribe(DataKey::CoolingState, move |entry| {
            match entry.value.as_bool() {
                Some(cooling_on) => cooling_regulator.set_manual_cooling(cooling_on),
                None => warn!("mode listener: non-bool value under the cooling key"),
            }
        });

        let listener = Self {
            store,
            subscriptions: vec![mode_subscription, cooling_subscription],
        };
        listener.apply_current(&regulator);
        listener
    }

    fn apply_current(&self, regulator: &Regulator) {
        if let Some(mode) = self
            .store
            .get_value(DataKey::Mode)
            .and_then(|value| value.as_mode())
        {
            regulator.set_mode(mode);
        }
        // Cooling applies after the mode so that a persisted manual
        // cooling request survives the mode application above
        if let Some(cooling_on) = self
            .store
            .get_value(DataKey::CoolingState)
            .and_then(|value| value.as_bool())
        {
            regulator.set_manual_cooling(cooling_on);
        }
        debug!("mode listener: initial state applied");
    }

    /// Detach from the data plane
    pub fn stop(&mut self) {
        for subscription in self.subscriptions.drain(..) {
            self.store.unsubscribe(subscription);
        }
    }
}

impl Drop for ModeListener {
    fn drop(&mut self) {
        self.stop();
    }
}
