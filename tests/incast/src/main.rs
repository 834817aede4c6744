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

//! Incast on a fat tree: many hosts send to one aggregator at once.
//!
//! The switch queue towards the aggregator crosses the PAUSE threshold, and
//! the backpressure spreads upstream to the senders. Nothing is lost and
//! every flow arrives in order.
use std::collections::HashMap;

use anyhow::bail;
use dcn::{BulkSender, Config, FlowKey, Network, Scheduler, SimTime, PROTO_UDP};
use structopt::StructOpt;

#[derive(StructOpt)]
#[structopt(name = "incast", about = "PFC incast on a fat tree")]
struct Arguments {
    /// YAML configuration, defaults are used for anything not set
    #[structopt(short, long)]
    config: Option<String>,
    /// overrides the fat tree size of the configuration
    #[structopt(short = "n", long)]
    size: Option<usize>,
    #[structopt(short, long, default_value = "8")]
    senders: usize,
    #[structopt(short, long, default_value = "200")]
    packets: u64,
    /// UDP payload bytes per packet
    #[structopt(long, default_value = "972")]
    payload: u32,
    /// print the network in graphviz format
    #[structopt(long)]
    graphviz: bool,
}

#[derive(Clone, Debug, Default)]
struct IncastReport {
    expected: u64,
    delivered: u64,
    out_of_order: u64,
    pauses_sent: u64,
    routing_failures: u64,
    finish: SimTime,
}

fn simulate_incast(
    config: &Config,
    senders: usize,
    packets: u64,
    payload: u32,
) -> anyhow::Result<(Network, IncastReport)> {
    let (mut net, tree) = dcn::fat_tree(config)?;
    if senders == 0 || senders >= tree.hosts.len() {
        bail!(
            "{} senders do not fit on a fat tree with {} hosts",
            senders,
            tree.hosts.len()
        );
    }
    let mut sched = Scheduler::new();

    // The aggregator is the first host, senders are taken from the far end
    // of the tree so that flows cross the core.
    let aggregator = tree.host_address(0);
    let first = tree.hosts.len() - senders;
    let flows: Vec<BulkSender> = (first..tree.hosts.len())
        .map(|h| {
            let flow = FlowKey::new(
                tree.host_address(h),
                aggregator,
                PROTO_UDP,
                10_000 + h as u16,
                5_000,
            );
            BulkSender::new(tree.hosts[h], flow, packets, payload)
        })
        .collect();
    for sender in &flows {
        sender.start(&mut net, &mut sched);
    }
    sched.run(&mut net);

    let mut report = IncastReport {
        expected: senders as u64 * packets,
        pauses_sent: net.total_pauses_sent(),
        finish: sched.now(),
        ..Default::default()
    };
    let mut last_uid: HashMap<FlowKey, u64> = HashMap::new();
    for delivery in net.deliveries() {
        report.delivered += 1;
        let last = last_uid.entry(delivery.flow).or_insert(0);
        if delivery.uid < *last {
            report.out_of_order += 1;
        }
        *last = delivery.uid;
    }
    report.routing_failures = net
        .nodes()
        .filter_map(|n| net.node(n).ok())
        .map(|n| n.stats.routing_failures)
        .sum();
    for sender in flows.iter().filter(|s| !s.is_done() || s.failed()) {
        log::warn!("{} sent only {} packets", sender.flow(), sender.sent());
    }
    Ok((net, report))
}

#[cfg(test)]
mod tests {
    use crate::simulate_incast;
    use dcn::{Config, DeviceConfiguration};

    fn config(qbb_enabled: bool) -> Config {
        Config {
            device: DeviceConfiguration {
                qbb_enabled,
                threshold: 20_000,
                pause_time_us: 100,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn validate() {
        let _ = env_logger::try_init();
        let (net, report) = simulate_incast(&config(true), 8, 200, 972).unwrap();
        assert_eq!(report.delivered, report.expected);
        assert_eq!(report.delivered, 1600);
        assert_eq!(report.out_of_order, 0);
        assert_eq!(report.routing_failures, 0);
        assert!(report.pauses_sent > 0);

        // The bottleneck is the last hop: 1.6 MB at 100 Mb/s.
        assert!(report.finish >= dcn::SimTime::from_millis(128));

        // Every PAUSE frame reached its neighbour.
        let mut received = 0;
        for n in net.nodes() {
            for dev in net.node(n).unwrap().devices() {
                received += dev.stats().pauses_received;
            }
        }
        assert_eq!(received, report.pauses_sent);
    }

    #[test]
    fn without_qbb() {
        let (_, report) = simulate_incast(&config(false), 8, 50, 972).unwrap();
        assert_eq!(report.delivered, 400);
        assert_eq!(report.pauses_sent, 0);
        assert_eq!(report.out_of_order, 0);
    }

    #[test]
    fn too_many_senders() {
        assert!(simulate_incast(&config(true), 16, 10, 100).is_err());
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Arguments::from_args();

    let mut config = match &args.config {
        Some(file) => Config::from_file(file)?,
        None => Config::default(),
    };
    if let Some(size) = args.size {
        config.fat_tree.size = size;
    }
    let (net, report) = simulate_incast(&config, args.senders, args.packets, args.payload)?;
    if args.graphviz {
        println!("{}", net.to_graphviz());
    }
    log::info!("{:?}", report);
    println!(
        "delivered {}/{} packets in {}, {} PAUSE frames, {} out of order",
        report.delivered, report.expected, report.finish, report.pauses_sent, report.out_of_order
    );
    if report.delivered != report.expected {
        bail!("lost {} packets", report.expected - report.delivered);
    }
    Ok(())
}
