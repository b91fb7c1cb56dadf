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

use boilerminer::config;
use boilerminer::supervisor;

use ii_logging::macros::*;

use std::path::PathBuf;
use std::process;
use std::time::Duration;

#[tokio::main]
async fn main() {
    ii_logging::setup_for_app();

    let app = clap::App::new("boilerminer")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(
            clap::Arg::with_name("config-dir")
                .long("config-dir")
                .help("Directory with gui_settings.json and backups")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("asic-ip")
                .long("asic-ip")
                .value_name("ADDRESS")
                .help("Fallback miner address when none is persisted")
                .required(false)
                .takes_value(true),
        )
        .arg(
            clap::Arg::with_name("self-test")
                .long("self-test")
                .help("Pulse both valve relays for two seconds and exit")
                .required(false),
        );

    let matches = app.get_matches();

    let mut config = match config::Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("boilerminer: {}", e);
            process::exit(1);
        }
    };
    if let Some(dir) = matches.value_of("config-dir") {
        config.config_dir = PathBuf::from(dir);
    }
    if let Some(raw) = matches.value_of("asic-ip") {
        config.asic_ip = raw.parse().expect("not an IPv4 address");
    }

    if matches.is_present("self-test") {
        let core = match supervisor::Core::new(config) {
            Ok(core) => core,
            Err(e) => {
                error!("boilerminer: {}", e);
                process::exit(1);
            }
        };
        let passed = core.relay_self_test(Duration::from_secs(2));
        core.stop().await;
        process::exit(if passed { 0 } else { 1 });
    }

    if let Err(e) = boilerminer::run(config).await {
        // Boot-time persistence faults land here; the settings file is
        // canonical and the operator has to fix it
        error!("boilerminer: {}", e);
        process::exit(1);
    }
}
