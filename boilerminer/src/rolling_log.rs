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

//! Rolling post-mortem log
//!
//! Once a second, one line with the setpoints, the current temperature and
//! both valve states goes into a ring of the last 120 entries, and the
//! whole ring is rewritten atomically to `logs/rolling.log`. After an
//! incident the file shows the final two minutes of control decisions.

use ii_logging::macros::*;

use crate::halt;
use crate::store::{DataKey, DataStore};

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::time::sleep;

/// How many one-second snapshots the ring retains
pub const CAPACITY: usize = 120;

/// Snapshot period
pub const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(1);

pub const DEFAULT_LOG_PATH: &str = "logs/rolling.log";

pub struct RollingLog {
    store: Arc<DataStore>,
    path: PathBuf,
    lines: Mutex<VecDeque<String>>,
}

impl RollingLog {
    pub fn new<P: AsRef<Path>>(store: Arc<DataStore>, path: P) -> Arc<Self> {
        Arc::new(Self {
            store,
            path: path.as_ref().to_path_buf(),
            lines: Mutex::new(VecDeque::with_capacity(CAPACITY)),
        })
    }

    pub async fn start(log: Arc<Self>, halt_receiver: &halt::Receiver) {
        halt_receiver
            .register_client("rolling log")
            .spawn(Self::snapshot_task(log));
    }

    /// Format one snapshot line. Missing values render as `N/A`.
    pub fn render_line(&self, now: DateTime<Local>) -> String {
        let setpoint = self
            .store
            .get_value(DataKey::TemperatureSettings)
            .and_then(|value| value.as_settings())
            .map(|settings| format!("{:.1}-{:.1}", settings.min_c, settings.max_c))
            .unwrap_or_else(|| "N/A".to_string());

        let temperature = self
            .store
            .get_value(DataKey::Temperature)
            .and_then(|value| {
                value
                    .as_temperature()
                    .and_then(|reading| reading.liquid_c)
            })
            .map(|t| format!("{:.1}", t))
            .unwrap_or_else(|| "N/A".to_string());

        let valve = |key: DataKey| -> &'static str {
            match self.store.get_value(key).and_then(|value| value.as_bool()) {
                Some(true) => "ON",
                Some(false) => "OFF",
                None => "N/A",
            }
        };

        format!(
            "{}, setpoint {}, current_temp {}, cooling {}, heating {}",
            now.format("%H:%M:%S"),
            setpoint,
            temperature,
            valve(DataKey::ValveStateUpper),
            valve(DataKey::ValveStateLower),
        )
    }

    /// Append one line and rewrite the whole file via tmp + rename
    pub fn snapshot(&self, now: DateTime<Local>) -> io::Result<()> {
        let rendered = self.render_line(now);
        let contents = {
            let mut lines = self.lines.lock().expect("BUG: rolling log lock poisoned");
            lines.push_back(rendered);
            while lines.len() > CAPACITY {
                lines.pop_front();
            }
            let mut contents = String::with_capacity(lines.len() * 64);
            for line in lines.iter() {
                contents.push_str(line);
                contents.push('\n');
            }
            contents
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.path.with_extension("log.tmp");
        fs::write(&tmp_path, contents.as_bytes())?;
        fs::rename(&tmp_path, &self.path)
    }

    async fn snapshot_task(log: Arc<Self>) {
        info!("rolling log: started, writing {}", log.path.display());
        loop {
            if let Err(e) = log.snapshot(Local::now()) {
                warn!("rolling log: write failed: {}", e);
            }
            sleep(SNAPSHOT_INTERVAL).await;
        }
    }
}
