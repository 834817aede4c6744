// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::hash::HashKind;
use crate::sim::SimTime;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Number of priority classes per interface.
pub const NUM_CLASSES: usize = 8;

/// Parameters of a PFC device.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct DeviceConfiguration {
    /// Generate and honour PAUSE frames.
    pub qbb_enabled: bool,
    pub num_classes: usize,
    /// Bytes in a class queue above which a PAUSE is sent upstream.
    pub threshold: u64,
    /// Pause duration in microseconds carried in generated PAUSE frames.
    pub pause_time_us: u32,
    /// Queue occupancy (bytes) at which ECN capable packets are marked CE.
    pub ecn_threshold: Option<u64>,
}

impl Default for DeviceConfiguration {
    fn default() -> Self {
        Self {
            qbb_enabled: true,
            num_classes: NUM_CLASSES,
            threshold: 1_000_000,
            pause_time_us: 100,
            ecn_threshold: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RoutingConfiguration {
    pub hash: HashKind,
    /// Lifetime of flow routes and congestion records.
    pub lifetime_us: u64,
    /// Congestion signals to see before a reroute is triggered.
    pub reroute_threshold: u32,
    /// React to congestion notifications at edge switches.
    pub reroute_on_congestion: bool,
    /// Record which switches reported congestion for a flow.
    pub intelligent_reroute: bool,
    pub seed: u64,
}

impl RoutingConfiguration {
    pub fn lifetime(&self) -> SimTime {
        SimTime::from_micros(self.lifetime_us)
    }
}

impl Default for RoutingConfiguration {
    fn default() -> Self {
        Self {
            hash: HashKind::Hsieh,
            lifetime_us: 100_000,
            reroute_threshold: 2,
            reroute_on_congestion: false,
            intelligent_reroute: false,
            seed: 0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LinkConfiguration {
    pub rate_bps: u64,
    pub delay_ns: u64,
}

impl LinkConfiguration {
    pub fn new(rate_bps: u64, delay_ns: u64) -> Self {
        Self { rate_bps, delay_ns }
    }

    /// Time to serialise `bytes` onto the link.
    pub fn tx_time(&self, bytes: u32) -> SimTime {
        let bits = u128::from(bytes) * 8;
        let rate = u128::from(self.rate_bps.max(1));
        let ns = (bits * 1_000_000_000 + rate - 1) / rate;
        SimTime::from_nanos(ns as u64)
    }

    pub fn delay(&self) -> SimTime {
        SimTime::from_nanos(self.delay_ns)
    }
}

impl Default for LinkConfiguration {
    fn default() -> Self {
        Self {
            rate_bps: 100_000_000,
            delay_ns: 500,
        }
    }
}

/// Shape of a fat tree and the links of each tier.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FatTreeConfiguration {
    /// Number of ports of a switch facing each direction. There are 2N
    /// subtrees, N^2 core switches and 2N^3 hosts.
    pub size: usize,
    pub host_edge: LinkConfiguration,
    pub edge_aggr: LinkConfiguration,
    pub aggr_core: LinkConfiguration,
    /// Route every packet independently over a random uplink.
    pub packet_spray: bool,
}

impl Default for FatTreeConfiguration {
    fn default() -> Self {
        Self {
            size: 2,
            host_edge: LinkConfiguration::default(),
            edge_aggr: LinkConfiguration::default(),
            aggr_core: LinkConfiguration::default(),
            packet_spray: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfiguration,
    pub routing: RoutingConfiguration,
    pub fat_tree: FatTreeConfiguration,
}

impl Config {
    pub fn from_file(file_name: &str) -> anyhow::Result<Self> {
        let file = File::open(Path::new(file_name))
            .with_context(|| format!("config file {} not found", file_name))?;
        let reader = BufReader::new(file);
        serde_yaml::from_reader(reader).with_context(|| format!("parsing {}", file_name))
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(config: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(config)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_yaml_config() {
        let conf_str = "---
device:
  qbb_enabled: true
  num_classes: 4
  threshold: 30000
  pause_time_us: 50
  ecn_threshold: 20000
routing:
  hash: Random
  lifetime_us: 2000
  reroute_threshold: 3
  reroute_on_congestion: true
  seed: 7
fat_tree:
  size: 4
  host_edge:
    rate_bps: 1000000000
    delay_ns: 100
  packet_spray: true
";
        let config = Config::from_str(conf_str).unwrap();
        assert_eq!(config.device.num_classes, 4);
        assert_eq!(config.device.threshold, 30_000);
        assert_eq!(config.device.pause_time_us, 50);
        assert_eq!(config.device.ecn_threshold, Some(20_000));
        assert_eq!(config.routing.hash, HashKind::Random);
        assert_eq!(config.routing.lifetime(), SimTime::from_millis(2));
        assert_eq!(config.routing.reroute_threshold, 3);
        assert!(config.routing.reroute_on_congestion);
        assert!(!config.routing.intelligent_reroute);
        assert_eq!(config.routing.seed, 7);
        assert_eq!(config.fat_tree.size, 4);
        assert_eq!(config.fat_tree.host_edge.rate_bps, 1_000_000_000);
        assert_eq!(config.fat_tree.host_edge.delay_ns, 100);
        // Unspecified links keep their defaults.
        assert_eq!(config.fat_tree.edge_aggr, LinkConfiguration::default());
        assert!(config.fat_tree.packet_spray);
    }

    #[test]
    fn defaults() {
        let config = Config::from_str("{}").unwrap();
        assert_eq!(config, Config::default());
        assert!(config.device.qbb_enabled);
        assert_eq!(config.device.num_classes, 8);
        assert_eq!(config.device.threshold, 1_000_000);
        assert_eq!(config.device.pause_time_us, 100);
        assert_eq!(config.routing.lifetime(), SimTime::from_millis(100));
        assert_eq!(config.routing.reroute_threshold, 2);
        assert!(!config.routing.reroute_on_congestion);
    }

    #[test]
    fn bad_yaml() {
        assert!(Config::from_str("device: [1, 2]").is_err());
        assert!(Config::from_file("/nonexistent/dcn.yaml").is_err());
    }

    #[test]
    fn tx_time() {
        let link = LinkConfiguration::new(100_000_000, 500);
        // 1000 bytes at 100 Mb/s is 80 us.
        assert_eq!(link.tx_time(1000), SimTime::from_micros(80));
        assert_eq!(link.delay(), SimTime::from_nanos(500));
        // Rounded up to the next nanosecond.
        assert_eq!(LinkConfiguration::new(3_000_000_000, 0).tx_time(1), SimTime::from_nanos(3));
    }
}
