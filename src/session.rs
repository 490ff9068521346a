// Part of canopen-commission. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! The complete run: reset, discovery, configuration, control and teardown.

use crate::{
    config::{CommissionBuilder, CommissionConfig, Pacing},
    configure::{ConfiguredSlave, ServiceConfigurator},
    control::{ControlLoop, LoopOutcome},
    cycle::{Clock, MonotonicClock, PollingInterval, TimerChannel},
    diag::{Diagnostics, LogDiagnostics},
    discovery::{self, SlaveNode},
    drive::DriveStateMachine,
    image::ProcessImage,
    master::Master,
    teardown::Teardown,
    transport::{Bus, NetConfig, Network},
    types::*,
};
use std::sync::Arc;

/// What a successful run did.
#[derive(Debug, Clone)]
pub struct Report {
    pub nodes: Vec<SlaveNode>,
    pub configured: Vec<ConfiguredSlave>,
    pub outcome: LoopOutcome,
}

/// Commission the network on `bus` as described by `cfg`, run the control
/// loop and release the slaves again.
pub fn commission<B, C>(
    bus: &mut B,
    cfg: &CommissionConfig,
    clock: C,
    diag: &mut dyn Diagnostics,
) -> Result<Report>
where
    B: Bus,
    C: Clock,
{
    let image = Arc::new(ProcessImage::new());
    let net_cfg = NetConfig {
        canif: cfg.canif.clone(),
        node: cfg.node,
        bitrate: cfg.bitrate,
        dictionary: cfg.dictionary(image.clone()),
    };
    let net = bus.init(&net_cfg).map_err(|source| Error::NetworkInit {
        canif: cfg.canif.clone(),
        source,
    })?;
    let mut master = Master::new(net, cfg.retry);
    master
        .network_mut()
        .client_init()
        .map_err(Error::ClientInit)?;

    master.nmt(NmtCommand::ResetCommunication, None)?;
    clock.pause(cfg.settle_delay);

    let nodes = discovery::discover(&mut master, diag)?;
    master.nmt(NmtCommand::PreOperational, None)?;

    let configured = configure_all(&mut master, cfg, &net_cfg, &nodes)?;
    master.nmt(NmtCommand::Operational, None)?;
    for slave in &configured {
        if !master.node_check(slave.node) {
            log::warn!("Node {} is not sending heartbeats", slave.node);
        }
    }

    let machine = DriveStateMachine::new(cfg.drive);
    let budget = cfg.cycle.budget;
    let outcome = match cfg.cycle.pacing {
        Pacing::Polling => {
            let schedule = PollingInterval::new(&clock, cfg.cycle.period, cfg.cycle.idle);
            ControlLoop::new(schedule, &image, machine, budget).run(diag)
        }
        Pacing::Timer => {
            let schedule = TimerChannel::new(cfg.cycle.period);
            ControlLoop::new(schedule, &image, machine, budget).run(diag)
        }
    };

    let released = Teardown::new(cfg.sync).run(&mut master, &configured);
    match outcome {
        LoopOutcome::Faulted {
            cycles,
            status_word,
            ..
        } => Err(Error::DriveFault {
            status: status_word,
            cycle: cycles,
        }),
        LoopOutcome::Completed { cycles, counter } => {
            released?;
            log::info!("Finished after {} cycles, counter {}", cycles, counter);
            Ok(Report {
                nodes,
                configured,
                outcome,
            })
        }
    }
}

/// Configure every slave in turn. A slave whose configuration fails is
/// left out; the run only fails if none could be configured.
fn configure_all<N: Network>(
    master: &mut Master<N>,
    cfg: &CommissionConfig,
    net_cfg: &NetConfig,
    nodes: &[SlaveNode],
) -> Result<Vec<ConfiguredSlave>> {
    let ids: Vec<NodeId> = nodes.iter().map(|n| n.id).collect();
    let mut configurator = ServiceConfigurator::new(cfg.sync, &net_cfg.dictionary);
    let mut configured = vec![];
    let mut first = None;
    for (slot, slave) in cfg.slaves_for(&ids).iter().enumerate() {
        match configurator.configure(master, slot, slave) {
            Ok(done) => configured.push(done),
            Err(e) => {
                log::error!("Node {} left unconfigured: {}", slave.node, e);
                first.get_or_insert(e);
            }
        }
    }
    if configured.is_empty() {
        return Err(first.unwrap_or(Error::NoNodes));
    }
    Ok(configured)
}

/// Run with the default setup on interface `canif`, printing identities and
/// cycle records through the log.
pub fn slaveinfo<B: Bus>(bus: &mut B, canif: &str, node: u8, bitrate: u32) -> Result<Report> {
    let cfg = CommissionBuilder::new(canif)
        .node(node)
        .bitrate(bitrate)
        .build()?;
    commission(bus, &cfg, MonotonicClock::new(), &mut LogDiagnostics)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CycleConfig, RetryPolicy, SlaveDescriptor};
    use crate::cycle::Tick;
    use crate::diag::Recorder;
    use crate::sim::{SimBus, SimEvent, SimNode};
    use std::time::Duration;

    fn config() -> CommissionConfig {
        CommissionBuilder::new("sim0")
            .retry(RetryPolicy::none())
            .build()
            .unwrap()
    }

    fn downloads_to(bus: &SimBus, index: u16) -> Vec<(u8, Vec<u8>)> {
        bus.events()
            .into_iter()
            .filter_map(|e| match e {
                SimEvent::Download { node, addr, data } if addr.index == index => {
                    Some((node, data))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn single_drive_end_to_end() {
        let mut bus =
            SimBus::new().with_node(SimNode::drive(1).with_identity("Drive", "1.0", "2.3"));
        let clock = bus.clock();
        let mut rec = Recorder::default();
        let report = commission(&mut bus, &config(), clock, &mut rec).unwrap();

        assert_eq!(report.nodes.len(), 1);
        assert_eq!(report.configured.len(), 1);
        match report.outcome {
            LoopOutcome::Completed { cycles, counter } => {
                assert_eq!(cycles, 2500);
                assert!(counter > 2000);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(rec.identities.len(), 3);
        assert_eq!(rec.cycles.len(), 2500);
        assert!(rec.cycles.iter().any(|r| r.status_word == 0x0237));
        let last = rec.cycles[2499];
        assert_eq!(last.control_word, 0);
        assert_eq!(last.status_word, 0x0240);

        // 5 per enabled cycle, the last one past the cap included
        let moved = rec.cycles.iter().map(|r| r.actual_position).max().unwrap();
        assert_eq!(moved, 5 * 2001);

        // released at the end
        assert_eq!(downloads_to(&bus, 0x1017).last(), Some(&(1, vec![0, 0])));
        assert_eq!(downloads_to(&bus, 0x1005).last(), Some(&(1, vec![0x80, 0, 0, 0])));
    }

    #[test]
    fn timer_paced_run_against_realtime_bus() {
        let mut bus = SimBus::new()
            .with_node(SimNode::drive(1))
            .realtime(Duration::from_millis(2));
        let cfg = CommissionBuilder::new("sim0")
            .settle_delay(Duration::from_millis(0))
            .cycle(CycleConfig {
                budget: 30,
                pacing: Pacing::Timer,
                ..CycleConfig::default()
            })
            .build()
            .unwrap();
        let mut rec = Recorder::default();
        let report = commission(&mut bus, &cfg, MonotonicClock::new(), &mut rec).unwrap();
        assert!(matches!(report.outcome, LoopOutcome::Completed { cycles: 30, .. }));
        assert_eq!(rec.cycles.len(), 30);
    }

    #[test]
    fn network_states_in_order() {
        let mut bus = SimBus::new().with_node(SimNode::drive(3));
        let clock = bus.clock();
        let mut cfg = config();
        cfg.cycle.budget = 10;
        commission(&mut bus, &cfg, clock, &mut Recorder::default()).unwrap();
        let nmt: Vec<NmtCommand> = bus
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SimEvent::Nmt { cmd, node: None } => Some(cmd),
                _ => None,
            })
            .collect();
        assert_eq!(
            nmt,
            vec![
                NmtCommand::ResetCommunication,
                NmtCommand::PreOperational,
                NmtCommand::Operational
            ]
        );
    }

    #[test]
    fn discovery_waits_for_the_settle_delay() {
        let mut bus = SimBus::new().with_node(SimNode::drive(1));
        let clock = bus.clock();
        let mut cfg = config();
        cfg.cycle.budget = 1;
        commission(&mut bus, &cfg, clock, &mut Recorder::default()).unwrap();
        let events = bus.events();
        assert!(matches!(
            events[0],
            SimEvent::Nmt {
                cmd: NmtCommand::ResetCommunication,
                ..
            }
        ));
        match events[1] {
            SimEvent::Probe { from: 1, at } => assert!(at.since(Tick(0)) >= 500_000),
            ref other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn failing_slave_is_skipped() {
        let mut bus = SimBus::new()
            .with_node(SimNode::drive(1))
            .with_node(SimNode::drive(2));
        bus.inject_fault(
            2,
            ObjectAddress::new(0x1A00, 1),
            SdoFault::Rejected(SdoFault::ABORT_NO_OBJECT),
            1,
        );
        let clock = bus.clock();
        let mut cfg = config();
        cfg.cycle.budget = 20;
        let report = commission(&mut bus, &cfg, clock, &mut Recorder::default()).unwrap();
        let nodes: Vec<u8> = report.configured.iter().map(|s| s.node.get()).collect();
        assert_eq!(nodes, vec![1]);
        // only the configured slave is released
        assert_eq!(downloads_to(&bus, 0x1017).last(), Some(&(1, vec![0, 0])));
    }

    #[test]
    fn one_slave_produces_sync() {
        let mut bus = SimBus::new()
            .with_node(SimNode::drive(1))
            .with_node(SimNode::drive(2));
        let clock = bus.clock();
        let mut cfg = config();
        cfg.cycle.budget = 5;
        let report = commission(&mut bus, &cfg, clock, &mut Recorder::default()).unwrap();
        assert_eq!(report.configured.len(), 2);
        assert_eq!(
            downloads_to(&bus, 0x1005),
            vec![(1, vec![0x80, 0, 0, 0x40]), (1, vec![0x80, 0, 0, 0])]
        );
        assert_eq!(downloads_to(&bus, 0x1006), vec![(1, 2000u32.to_le_bytes().to_vec())]);
        let producers: Vec<bool> = report.configured.iter().map(|s| s.sync_producer).collect();
        assert_eq!(producers, vec![true, false]);
    }

    #[test]
    fn sync_moves_to_the_next_slave_when_the_producer_fails() {
        let mut bus = SimBus::new()
            .with_node(SimNode::drive(1))
            .with_node(SimNode::drive(2));
        bus.inject_fault(
            1,
            ObjectAddress::new(0x1A00, 1),
            SdoFault::Rejected(SdoFault::ABORT_NO_OBJECT),
            1,
        );
        let clock = bus.clock();
        let mut cfg = config();
        cfg.cycle.budget = 5;
        let report = commission(&mut bus, &cfg, clock, &mut Recorder::default()).unwrap();
        let nodes: Vec<u8> = report.configured.iter().map(|s| s.node.get()).collect();
        assert_eq!(nodes, vec![2]);
        assert_eq!(
            downloads_to(&bus, 0x1005),
            vec![
                (1, vec![0x80, 0, 0, 0x40]),
                (1, vec![0x80, 0, 0, 0]),
                (2, vec![0x80, 0, 0, 0x40]),
                (2, vec![0x80, 0, 0, 0]),
            ]
        );
    }

    #[test]
    fn nothing_configured_is_an_error() {
        let mut bus = SimBus::new().with_node(SimNode::drive(1));
        bus.inject_fault(1, ObjectAddress::new(0x1017, 0), SdoFault::Timeout, 1);
        let clock = bus.clock();
        let err = commission(&mut bus, &config(), clock, &mut Recorder::default()).unwrap_err();
        assert!(matches!(
            err,
            Error::Sdo {
                fault: SdoFault::Timeout,
                ..
            }
        ));
        assert!(!bus
            .events()
            .iter()
            .any(|e| matches!(e, SimEvent::Nmt { cmd: NmtCommand::Operational, .. })));
    }

    #[test]
    fn drive_fault_is_reported_after_teardown() {
        let mut bus = SimBus::new().with_node(SimNode::drive(1).with_fault_after(10));
        let clock = bus.clock();
        let err = commission(&mut bus, &config(), clock, &mut Recorder::default()).unwrap_err();
        assert!(matches!(err, Error::DriveFault { status: 0x0218, .. }));
        assert_eq!(downloads_to(&bus, 0x1017).last(), Some(&(1, vec![0, 0])));
    }

    #[test]
    fn configured_slaves_not_found_are_skipped() {
        let mut bus = SimBus::new().with_node(SimNode::drive(2));
        let clock = bus.clock();
        let mut cfg = CommissionBuilder::new("sim0")
            .slave(SlaveDescriptor::drive(NodeId::try_from(5).unwrap()))
            .slave(SlaveDescriptor::drive(NodeId::try_from(2).unwrap()))
            .build()
            .unwrap();
        cfg.cycle.budget = 5;
        let report = commission(&mut bus, &cfg, clock, &mut Recorder::default()).unwrap();
        assert_eq!(report.configured.len(), 1);
        assert_eq!(report.configured[0].node.get(), 2);
    }

    #[test]
    fn run_heartbeat_reaches_listed_slaves() {
        let mut bus = SimBus::new().with_node(SimNode::drive(2));
        let clock = bus.clock();
        let mut cfg = CommissionBuilder::new("sim0")
            .heartbeat(HeartbeatConfig {
                producer_ms: 50,
                consumer_ms: 200,
            })
            .slave(SlaveDescriptor::drive(NodeId::try_from(2).unwrap()))
            .build()
            .unwrap();
        cfg.cycle.budget = 5;
        commission(&mut bus, &cfg, clock, &mut Recorder::default()).unwrap();
        assert_eq!(downloads_to(&bus, 0x1017)[0], (2, vec![50, 0]));
        assert_eq!(bus.local(ObjectAddress::new(0x1016, 1)), Some(0x0002_00C8));
    }

    #[test]
    fn fatal_startup_failures() {
        let cfg = config();
        let mut bus = SimBus::new().with_node(SimNode::drive(1)).failing_init();
        let clock = bus.clock();
        assert!(matches!(
            commission(&mut bus, &cfg, clock, &mut Recorder::default()),
            Err(Error::NetworkInit { .. })
        ));

        let mut bus = SimBus::new().with_node(SimNode::drive(1)).failing_client();
        let clock = bus.clock();
        assert!(matches!(
            commission(&mut bus, &cfg, clock, &mut Recorder::default()),
            Err(Error::ClientInit(_))
        ));

        let mut bus = SimBus::new();
        let clock = bus.clock();
        assert!(matches!(
            commission(&mut bus, &cfg, clock, &mut Recorder::default()),
            Err(Error::NoNodes)
        ));
    }
}
