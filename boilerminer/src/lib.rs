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

//! Closed-loop temperature controller for a liquid-cooled miner
//!
//! The miner doubles as a boiler: its coolant loop feeds a heating
//! circuit, and two valve relays keep the coolant within the operator's
//! temperature band. The poller reads the coolant temperature off the
//! miner's TCP API, the regulator drives the valves, and the supervisor
//! wires both to the persisted settings and the touchscreen.

pub mod config;
pub mod error;
pub mod halt;
pub mod mode;
pub mod poller;
pub mod regulator;
pub mod relay;
pub mod rolling_log;
pub mod store;
pub mod supervisor;

use ii_logging::macros::*;

/// Run the controller until interrupted
pub async fn run(config: config::Config) -> error::Result<()> {
    let core = supervisor::Core::new(config)?;
    supervisor::Core::start(core.clone()).await;

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");

    core.stop().await;
    Ok(())
}
