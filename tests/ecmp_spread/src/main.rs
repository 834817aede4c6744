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

//! Spreading of flows over the uplinks of a fat tree.
//!
//! Hosts of the first subtree open flows with random ports towards hosts in
//! the other subtrees. With a deterministic hash every flow sticks to one
//! path and the flows spread over all edge uplinks; with packet spraying
//! the packets of a flow take different paths. A flow can also be moved to
//! another uplink by congestion notifications sent back to its source.
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;

use anyhow::{bail, Context};
use dcn::{
    BulkSender, Config, DeviceId, FatTree, FlowKey, Network, Packet, Scheduler, PROTO_UDP,
};
use itertools::Itertools;
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256StarStar;
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "ecmp-spread", about = "Multipath spreading on a fat tree")]
struct Arguments {
    /// YAML configuration, defaults are used for anything not set
    #[structopt(short, long)]
    config: Option<String>,
    #[structopt(short, long, default_value = "64")]
    flows: usize,
    #[structopt(short, long, default_value = "4")]
    packets: u64,
    /// route every packet over a random uplink
    #[structopt(long)]
    spray: bool,
    /// also move one flow with congestion notifications
    #[structopt(long)]
    reroute: bool,
}

#[derive(Clone, Debug, Default)]
struct SpreadReport {
    expected: u64,
    delivered: u64,
    /// Flows leaving through each edge uplink of the first subtree.
    uplink_flows: BTreeMap<DeviceId, usize>,
    /// Flows whose packets took more than one path.
    split_flows: usize,
}

// The edge uplink a packet left its first switch through.
fn first_uplink(net: &Network, uid: u64) -> Option<DeviceId> {
    net.path(uid).and_then(|p| p.get(1)).copied()
}

fn random_flows(tree: &FatTree, flows: usize, seed: u64) -> Vec<(usize, FlowKey)> {
    let mut rng = Xoshiro256StarStar::seed_from_u64(seed);
    let local = tree.addressing.size() * tree.addressing.size();
    (0..flows)
        .map(|_| {
            let src = rng.gen_range(0..local);
            let dst = rng.gen_range(local..tree.hosts.len());
            let flow = FlowKey::new(
                tree.host_address(src),
                tree.host_address(dst),
                PROTO_UDP,
                rng.gen_range(1024..u16::MAX),
                rng.gen_range(1024..u16::MAX),
            );
            (src, flow)
        })
        .collect()
}

fn simulate_spread(
    config: &Config,
    flows: usize,
    packets: u64,
) -> anyhow::Result<(Network, SpreadReport)> {
    let (mut net, tree) = dcn::fat_tree(config)?;
    if tree.addressing.num_subtrees() < 2 {
        bail!("need at least two subtrees");
    }
    net.enable_path_tracing();
    let mut sched = Scheduler::new();

    let senders: Vec<BulkSender> = random_flows(&tree, flows, config.routing.seed)
        .into_iter()
        .map(|(src, flow)| BulkSender::new(tree.hosts[src], flow, packets, 500))
        .collect();
    for sender in &senders {
        sender.start(&mut net, &mut sched);
    }
    sched.run(&mut net);

    let mut report = SpreadReport {
        expected: senders.iter().map(|s| s.sent()).sum(),
        ..Default::default()
    };
    let mut paths: HashMap<FlowKey, HashSet<Vec<DeviceId>>> = HashMap::new();
    let mut uplinks: HashMap<FlowKey, DeviceId> = HashMap::new();
    for delivery in net.deliveries() {
        report.delivered += 1;
        let path = net
            .path(delivery.uid)
            .with_context(|| format!("no path for packet {}", delivery.uid))?;
        paths
            .entry(delivery.flow)
            .or_default()
            .insert(path.to_vec());
        if let Some(uplink) = first_uplink(&net, delivery.uid) {
            uplinks.entry(delivery.flow).or_insert(uplink);
        }
    }
    report.split_flows = paths.values().filter(|p| p.len() > 1).count();
    for edge in tree.edges.iter().take(tree.addressing.size()) {
        for iface in tree.addressing.size() + 1..=2 * tree.addressing.size() {
            report.uplink_flows.insert(DeviceId::new(*edge, iface), 0);
        }
    }
    for uplink in uplinks.values() {
        *report.uplink_flows.entry(*uplink).or_insert(0) += 1;
    }
    Ok((net, report))
}

/// Send a burst of `flow`, then `signals` congestion notifications for it
/// from its destination, then another burst. Returns the edge uplinks of
/// the two bursts.
fn simulate_reroute(
    config: &Config,
    flow: FlowKey,
    signals: usize,
) -> anyhow::Result<(DeviceId, DeviceId)> {
    let (mut net, tree) = dcn::fat_tree(config)?;
    net.enable_path_tracing();
    let mut sched = Scheduler::new();
    let host = |addr: Ipv4Addr| {
        (0..tree.hosts.len())
            .find(|&h| tree.host_address(h) == addr)
            .map(|h| tree.hosts[h])
            .with_context(|| format!("no host with address {}", addr))
    };
    let (src, dst) = (host(flow.src)?, host(flow.dst)?);

    let burst = |net: &mut Network, sched: &mut Scheduler<Network>| -> anyhow::Result<DeviceId> {
        let first = net.deliveries().len();
        BulkSender::new(src, flow, 10, 500).start(net, sched);
        sched.run(net);
        let uplinks: HashSet<DeviceId> = net.deliveries()[first..]
            .iter()
            .filter_map(|d| first_uplink(net, d.uid))
            .collect();
        if uplinks.len() != 1 {
            bail!("flow {} used uplinks {:?}", flow, uplinks);
        }
        uplinks.into_iter().next().context("empty burst")
    };

    let before = burst(&mut net, &mut sched)?;
    for _ in 0..signals {
        let cn = Packet::congestion_notification(flow.dst, flow.src, flow);
        net.send_from(&mut sched, dst, cn)?;
    }
    sched.run(&mut net);
    let after = burst(&mut net, &mut sched)?;
    log::info!("{} moved from {} to {}", flow, before, after);
    Ok((before, after))
}

#[cfg(test)]
mod tests {
    use crate::{random_flows, simulate_reroute, simulate_spread};
    use dcn::{Config, FlowKey, HashKind, RoutingConfiguration, PROTO_UDP};

    #[test]
    fn validate() {
        let _ = env_logger::try_init();
        let (_, report) = simulate_spread(&Config::default(), 64, 4).unwrap();
        assert_eq!(report.expected, 256);
        assert_eq!(report.delivered, report.expected);
        // Flow affinity: one path per flow.
        assert_eq!(report.split_flows, 0);
        // Two edges with two uplinks each, all of them in use.
        assert_eq!(report.uplink_flows.len(), 4);
        assert!(report.uplink_flows.values().all(|&n| n > 0));
        assert_eq!(report.uplink_flows.values().sum::<usize>(), 64);
    }

    #[test]
    fn deterministic() {
        let (_, a) = simulate_spread(&Config::default(), 32, 2).unwrap();
        let (_, b) = simulate_spread(&Config::default(), 32, 2).unwrap();
        assert_eq!(a.uplink_flows, b.uplink_flows);
    }

    #[test]
    fn packet_spray() {
        let mut config = Config::default();
        config.fat_tree.packet_spray = true;
        let (_, report) = simulate_spread(&config, 64, 4).unwrap();
        assert_eq!(report.delivered, 256);
        assert!(report.split_flows > 32);
    }

    fn reroute_config(reroute_on_congestion: bool) -> Config {
        Config {
            routing: RoutingConfiguration {
                hash: HashKind::Hsieh,
                reroute_on_congestion,
                reroute_threshold: 2,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn far_flow() -> FlowKey {
        let (_, tree) = dcn::fat_tree(&Config::default()).unwrap();
        FlowKey::new(
            tree.host_address(0),
            tree.host_address(tree.hosts.len() - 1),
            PROTO_UDP,
            4000,
            5000,
        )
    }

    #[test]
    fn reroute_on_congestion() {
        let _ = env_logger::try_init();
        let (before, after) = simulate_reroute(&reroute_config(true), far_flow(), 2).unwrap();
        assert_eq!(before.node, after.node);
        assert_ne!(before.iface, after.iface);
        assert!(after.iface == 3 || after.iface == 4);
    }

    #[test]
    fn below_threshold_or_disabled() {
        let (before, after) = simulate_reroute(&reroute_config(true), far_flow(), 1).unwrap();
        assert_eq!(before, after);
        let (before, after) = simulate_reroute(&reroute_config(false), far_flow(), 2).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn flows_leave_the_subtree() {
        let (_, tree) = dcn::fat_tree(&Config::default()).unwrap();
        for (src, flow) in random_flows(&tree, 100, 3) {
            assert!(src < 4);
            assert_ne!(
                dcn::FatTreeAddressing::subtree_of(flow.src),
                dcn::FatTreeAddressing::subtree_of(flow.dst)
            );
        }
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Arguments::from_args();

    let mut config = match &args.config {
        Some(file) => Config::from_file(file)?,
        None => Config::default(),
    };
    config.fat_tree.packet_spray |= args.spray;
    let (_, report) = simulate_spread(&config, args.flows, args.packets)?;
    println!(
        "delivered {}/{} packets, {} flows split over several paths",
        report.delivered, report.expected, report.split_flows
    );
    println!(
        "flows per uplink: {}",
        report
            .uplink_flows
            .iter()
            .map(|(uplink, flows)| format!("{}: {}", uplink, flows))
            .format(", ")
    );

    if args.reroute {
        config.routing.reroute_on_congestion = true;
        let (_, tree) = dcn::fat_tree(&config)?;
        let flow = FlowKey::new(
            tree.host_address(0),
            tree.host_address(tree.hosts.len() - 1),
            PROTO_UDP,
            4000,
            5000,
        );
        let signals = config.routing.reroute_threshold as usize;
        let (before, after) = simulate_reroute(&config, flow, signals)?;
        println!("{} moved from {} to {}", flow, before, after);
    }
    Ok(())
}
