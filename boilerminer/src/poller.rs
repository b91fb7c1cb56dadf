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

//! Periodic temperature acquisition
//!
//! Every cycle the poller re-resolves the miner address from the data
//! plane (operators change it from the touchscreen), performs one
//! request/response session against the miner and publishes the outcome,
//! successful or not, under `DataKey::Temperature`.

use ii_logging::macros::*;

use crate::error;
use crate::halt;
use crate::store::{DataKey, DataStore, Value};

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::sleep;

/// How often the miner is polled
pub const DEFAULT_UPDATE_INTERVAL: Duration = Duration::from_secs(1);

/// Source tag of poller-produced entries
pub const SOURCE: &str = "miner";

/// Liquid temperature below this is business as usual
pub const WARNING_TEMP: f32 = 55.0;
/// Liquid temperature at or above this is critical
pub const CRITICAL_TEMP: f32 = 60.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TempStatus {
    Normal,
    Warning,
    Critical,
    Unknown,
    Error,
}

impl TempStatus {
    /// Grade a liquid temperature reading
    pub fn from_liquid(liquid_c: Option<f32>) -> Self {
        match liquid_c {
            None => TempStatus::Unknown,
            Some(t) if t < WARNING_TEMP => TempStatus::Normal,
            Some(t) if t < CRITICAL_TEMP => TempStatus::Warning,
            Some(_) => TempStatus::Critical,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadingSource {
    Miner,
    External,
}

/// One acquisition outcome. `status == Error` implies a message and no
/// liquid temperature; the constructors keep that invariant.
#[derive(Debug, Clone)]
pub struct TemperatureReading {
    pub liquid_c: Option<f32>,
    pub psu_c: Option<f32>,
    pub fan_rpm: Option<u32>,
    pub source: ReadingSource,
    pub captured_at: DateTime<Utc>,
    pub status: TempStatus,
    pub error: Option<String>,
}

impl TemperatureReading {
    pub fn ok(liquid_c: Option<f32>, psu_c: Option<f32>, fan_rpm: Option<u32>) -> Self {
        Self {
            liquid_c,
            psu_c,
            fan_rpm,
            source: ReadingSource::Miner,
            captured_at: Utc::now(),
            status: TempStatus::from_liquid(liquid_c),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            liquid_c: None,
            psu_c: None,
            fan_rpm: None,
            source: ReadingSource::Miner,
            captured_at: Utc::now(),
            status: TempStatus::Error,
            error: Some(message),
        }
    }

    pub fn is_usable(&self) -> bool {
        self.status != TempStatus::Error && self.liquid_c.is_some()
    }
}

/// Seam between the poller and the concrete miner protocol
#[async_trait]
pub trait TemperatureSource: Send + Sync {
    async fn fetch(&self, ip: Ipv4Addr) -> error::Result<TemperatureReading>;
}

/// Whatsminer-backed source; one fresh session per fetch
pub struct AsicSource {
    port: u16,
    account: String,
    password: String,
}

impl AsicSource {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            account: ii_whatsminer_api::DEFAULT_ACCOUNT.to_string(),
            password: ii_whatsminer_api::DEFAULT_PASSWORD.to_string(),
        }
    }
}

#[async_trait]
impl TemperatureSource for AsicSource {
    async fn fetch(&self, ip: Ipv4Addr) -> error::Result<TemperatureReading> {
        let mut client =
            ii_whatsminer_api::Client::with_credentials(ip, self.port, &self.account, &self.password);
        let info = client.fetch_device_info().await?;
        Ok(TemperatureReading::ok(
            info.power.liquid_temperature,
            info.power.psu_temperature,
            info.power.fan_speed,
        ))
    }
}

#[derive(Debug, Clone, Default)]
pub struct Counters {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub last_error: Option<String>,
}

impl Counters {
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 100.0;
        }
        self.successful_requests as f64 / self.total_requests as f64 * 100.0
    }
}

pub struct Poller {
    store: Arc<DataStore>,
    source: Box<dyn TemperatureSource>,
    fallback_ip: Ipv4Addr,
    interval: Duration,
    counters: Mutex<Counters>,
}

impl Poller {
    pub fn new(
        store: Arc<DataStore>,
        source: Box<dyn TemperatureSource>,
        fallback_ip: Ipv4Addr,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            source,
            fallback_ip,
            interval,
            counters: Mutex::new(Counters::default()),
        })
    }

    pub async fn start(poller: Arc<Self>, halt_receiver: &halt::Receiver) {
        halt_receiver
            .register_client("temperature poller")
            .spawn(Self::poll_task(poller));
    }

    pub fn statistics(&self) -> Counters {
        self.counters
            .lock()
            .expect("BUG: poller counters lock poisoned")
            .clone()
    }

    /// The current miner address: data plane first, boot fallback second
    fn resolve_ip(&self) -> Ipv4Addr {
        self.store
            .get_value(DataKey::IpAddressAsic)
            .and_then(|value| value.as_text().and_then(|text| text.parse().ok()))
            .unwrap_or(self.fallback_ip)
    }

    /// One acquisition cycle, factored out of the task loop for testing
    pub async fn poll_once(&self) {
        let ip = self.resolve_ip();
        let reading = match self.source.fetch(ip).await {
            Ok(reading) => {
                let mut counters = self
                    .counters
                    .lock()
                    .expect("BUG: poller counters lock poisoned");
                counters.total_requests += 1;
                counters.successful_requests += 1;
                reading
            }
            Err(e) => {
                let message = e.to_string();
                warn!("poller: {} unreachable: {}", ip, message);
                let mut counters = self
                    .counters
                    .lock()
                    .expect("BUG: poller counters lock poisoned");
                counters.total_requests += 1;
                counters.failed_requests += 1;
                counters.last_error = Some(message.clone());
                drop(counters);
                self.store.set(
                    DataKey::Error,
                    Value::Text(message.clone()),
                    SOURCE,
                    HashMap::new(),
                );
                TemperatureReading::error(message)
            }
        };

        let mut metadata = HashMap::new();
        metadata.insert("asic_ip".to_string(), ip.to_string());
        self.store.set(
            DataKey::Temperature,
            Value::Temperature(reading),
            SOURCE,
            metadata,
        );
    }

    async fn poll_task(poller: Arc<Self>) {
        info!(
            "poller: started, interval {:?}, fallback address {}",
            poller.interval, poller.fallback_ip
        );
        loop {
            poller.poll_once().await;
            sleep(poller.interval).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::error::ErrorKind;

    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedSource {
        temps: Vec<Option<f32>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn new(temps: Vec<Option<f32>>) -> Self {
            Self {
                temps,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TemperatureSource for ScriptedSource {
        async fn fetch(&self, _ip: Ipv4Addr) -> error::Result<TemperatureReading> {
            let index = self.calls.fetch_add(1, Ordering::SeqCst);
            match self.temps.get(index).copied().flatten() {
                Some(t) => Ok(TemperatureReading::ok(Some(t), None, None)),
                None => Err(ErrorKind::Network("scripted failure".to_string()).into()),
            }
        }
    }

    #[test]
    fn test_status_thresholds() {
        assert_eq!(TempStatus::from_liquid(Some(54.9)), TempStatus::Normal);
        assert_eq!(TempStatus::from_liquid(Some(55.0)), TempStatus::Warning);
        assert_eq!(TempStatus::from_liquid(Some(59.9)), TempStatus::Warning);
        assert_eq!(TempStatus::from_liquid(Some(60.0)), TempStatus::Critical);
        assert_eq!(TempStatus::from_liquid(None), TempStatus::Unknown);
    }

    #[test]
    fn test_error_reading_invariant() {
        let reading = TemperatureReading::error("no route to host".to_string());
        assert_eq!(reading.status, TempStatus::Error);
        assert!(reading.liquid_c.is_none());
        assert!(reading.error.is_some());
        assert!(!reading.is_usable());
    }

    #[tokio::test]
    async fn test_poll_publishes_reading() {
        let store = DataStore::new();
        let poller = Poller::new(
            store.clone(),
            Box::new(ScriptedSource::new(vec![Some(48.5)])),
            Ipv4Addr::new(192, 168, 0, 127),
            DEFAULT_UPDATE_INTERVAL,
        );

        poller.poll_once().await;

        let entry = store.get(DataKey::Temperature).unwrap();
        assert_eq!(entry.source, SOURCE);
        let reading = entry.value.as_temperature().unwrap();
        assert_eq!(reading.liquid_c, Some(48.5));
        assert_eq!(reading.status, TempStatus::Normal);

        let counters = poller.statistics();
        assert_eq!(counters.total_requests, 1);
        assert_eq!(counters.successful_requests, 1);
    }

    #[tokio::test]
    async fn test_poll_failure_publishes_error_reading() {
        let store = DataStore::new();
        let poller = Poller::new(
            store.clone(),
            Box::new(ScriptedSource::new(vec![None])),
            Ipv4Addr::new(192, 168, 0, 127),
            DEFAULT_UPDATE_INTERVAL,
        );

        poller.poll_once().await;

        let reading = store
            .get_value(DataKey::Temperature)
            .unwrap()
            .as_temperature()
            .cloned()
            .unwrap();
        assert_eq!(reading.status, TempStatus::Error);
        assert!(!reading.is_usable());

        // The error text is mirrored under the error key
        assert!(store.get(DataKey::Error).is_some());

        let counters = poller.statistics();
        assert_eq!(counters.failed_requests, 1);
        assert!(counters.last_error.is_some());
        assert_eq!(counters.success_rate(), 0.0);
    }

    #[tokio::test]
    async fn test_ip_is_resolved_from_store() {
        let store = DataStore::new();
        let source = Box::new(ScriptedSource::new(vec![Some(50.0), Some(50.0)]));
        let fallback = Ipv4Addr::new(192, 168, 0, 127);
        let poller = Poller::new(store.clone(), source, fallback, DEFAULT_UPDATE_INTERVAL);

        // No address published yet: fallback applies
        poller.poll_once().await;
        // The operator rewires the address at runtime
        store.set(
            DataKey::IpAddressAsic,
            Value::Text("10.20.30.40".to_string()),
            "ui",
            HashMap::new(),
        );
        poller.poll_once().await;

        let entry = store.get(DataKey::Temperature).unwrap();
        assert_eq!(entry.metadata["asic_ip"], "10.20.30.40");
    }
}
