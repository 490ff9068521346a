// Part of canopen-commission. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Declarative description of a commissioning run.

use crate::{
    drive::DriveProfile,
    image::{LocalDictionary, ProcessImage},
    types::*,
};
use std::{sync::Arc, time::Duration};

/// Bounded retry of transfers failing with a transient fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of tries, including the first one.
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    pub const fn none() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::from_millis(0),
        }
    }
}

/// Entries of one PDO, seen from both ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdoDescriptor {
    /// Mapping of the master's mirror channel.
    pub local: Vec<PdoMappingEntry>,
    /// Mapping written to the slave.
    pub remote: Vec<PdoMappingEntry>,
}

fn entries(words: &[u32]) -> Vec<PdoMappingEntry> {
    words.iter().copied().map(PdoMappingEntry::from_raw).collect()
}

impl PdoDescriptor {
    pub fn new(local: &[u32], remote: &[u32]) -> Self {
        Self {
            local: entries(local),
            remote: entries(remote),
        }
    }

    /// Status word, actual position and actual torque of a CiA 402 drive.
    pub fn drive_feedback() -> Self {
        Self::new(
            &[0x7000_0010, 0x7100_0020, 0x7200_0010],
            &[0x6041_0010, 0x6064_0020, 0x6077_0010],
        )
    }

    /// Control word and target position of a CiA 402 drive.
    pub fn drive_command() -> Self {
        Self::new(&[0x8000_0010, 0x8100_0020], &[0x6040_0010, 0x607A_0020])
    }
}

/// Everything the configurator needs to know about one slave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveDescriptor {
    pub node: NodeId,
    /// Slave TPDO 1 received by the master.
    pub feedback: PdoDescriptor,
    /// Master TPDO received on slave RPDO 1.
    pub command: PdoDescriptor,
    /// `None` takes the heartbeat setup of the whole run.
    pub heartbeat: Option<HeartbeatConfig>,
}

impl SlaveDescriptor {
    pub fn drive(node: NodeId) -> Self {
        Self {
            node,
            feedback: PdoDescriptor::drive_feedback(),
            command: PdoDescriptor::drive_command(),
            heartbeat: None,
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }
}

/// How the control loop waits for its deadlines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pacing {
    /// Check the run's clock, pausing `idle` in between. Missed deadlines
    /// are caught up.
    Polling,
    /// Block on a wall clock timer. Missed deadlines are dropped.
    Timer,
}

/// Timing of the control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleConfig {
    pub period: Duration,
    /// Pause between deadline checks.
    pub idle: Duration,
    /// Number of elapsed deadlines before the loop ends.
    pub budget: u32,
    pub pacing: Pacing,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(2),
            idle: Duration::from_micros(100),
            budget: 2500,
            pacing: Pacing::Polling,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CommissionConfig {
    pub canif: String,
    pub node: NodeId,
    pub bitrate: u32,
    /// Wait after the communication reset before the bus is scanned.
    pub settle_delay: Duration,
    pub sync: SyncConfig,
    pub heartbeat: HeartbeatConfig,
    pub retry: RetryPolicy,
    pub cycle: CycleConfig,
    pub drive: DriveProfile,
    /// Slaves to configure. Empty means every discovered node is treated as
    /// a drive with the default mapping.
    pub slaves: Vec<SlaveDescriptor>,
}

impl CommissionConfig {
    /// Descriptors for the discovered `nodes`, in configuration order. Every
    /// returned descriptor carries a heartbeat setup.
    pub fn slaves_for(&self, nodes: &[NodeId]) -> Vec<SlaveDescriptor> {
        let slaves = if self.slaves.is_empty() {
            nodes.iter().map(|&node| SlaveDescriptor::drive(node)).collect()
        } else {
            self.slaves
                .iter()
                .filter(|s| {
                    let found = nodes.contains(&s.node);
                    if !found {
                        log::warn!("Configured node {} did not answer, skipping", s.node);
                    }
                    found
                })
                .cloned()
                .collect::<Vec<_>>()
        };
        slaves
            .into_iter()
            .map(|s| SlaveDescriptor {
                heartbeat: Some(s.heartbeat.unwrap_or(self.heartbeat)),
                ..s
            })
            .collect()
    }

    pub fn dictionary(&self, image: Arc<ProcessImage>) -> LocalDictionary {
        LocalDictionary::standard(image)
    }
}

#[derive(Default)]
pub struct CommissionBuilder {
    canif: String,
    node: Option<u8>,
    bitrate: Option<u32>,
    settle_delay: Option<Duration>,
    sync: Option<SyncConfig>,
    heartbeat: Option<HeartbeatConfig>,
    retry: Option<RetryPolicy>,
    cycle: Option<CycleConfig>,
    drive: Option<DriveProfile>,
    slaves: Vec<SlaveDescriptor>,
}

impl CommissionBuilder {
    pub fn new(canif: impl Into<String>) -> Self {
        Self {
            canif: canif.into(),
            ..Self::default()
        }
    }

    pub fn node(mut self, node: u8) -> Self {
        self.node = Some(node);
        self
    }

    pub fn bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = Some(bitrate);
        self
    }

    pub fn settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = Some(delay);
        self
    }

    pub fn sync(mut self, sync: SyncConfig) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn sync_mode(mut self, mode: SyncMode) -> Self {
        self.sync = Some(SyncConfig {
            mode,
            ..self.sync.unwrap_or_default()
        });
        self
    }

    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = Some(heartbeat);
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn cycle(mut self, cycle: CycleConfig) -> Self {
        self.cycle = Some(cycle);
        self
    }

    pub fn drive(mut self, drive: DriveProfile) -> Self {
        self.drive = Some(drive);
        self
    }

    pub fn slave(mut self, slave: SlaveDescriptor) -> Self {
        self.slaves.push(slave);
        self
    }

    pub fn build(self) -> Result<CommissionConfig> {
        let node = NodeId::try_from(self.node.unwrap_or(1))?;
        if self.slaves.len() > usize::from(PdoChannel::COUNT) {
            return Err(Error::LocalChannel(self.slaves.len() - 1));
        }
        Ok(CommissionConfig {
            canif: self.canif,
            node,
            bitrate: self.bitrate.unwrap_or(1_000_000),
            settle_delay: self.settle_delay.unwrap_or(Duration::from_millis(500)),
            sync: self.sync.unwrap_or_default(),
            heartbeat: self.heartbeat.unwrap_or_default(),
            retry: self.retry.unwrap_or_default(),
            cycle: self.cycle.unwrap_or_default(),
            drive: self.drive.unwrap_or_default(),
            slaves: self.slaves,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> NodeId {
        NodeId::try_from(n).unwrap()
    }

    #[test]
    fn defaults_follow_the_reference_setup() {
        let cfg = CommissionBuilder::new("can0").build().unwrap();
        assert_eq!(cfg.node, id(1));
        assert_eq!(cfg.settle_delay, Duration::from_millis(500));
        assert_eq!(cfg.sync.mode, SyncMode::SlaveGenerated);
        assert_eq!(cfg.sync.period_us, 2000);
        assert_eq!(cfg.cycle.budget, 2500);
        assert_eq!(cfg.cycle.period, Duration::from_millis(2));
        assert_eq!(cfg.heartbeat.producer_ms, 5);
    }

    #[test]
    fn invalid_local_node_is_rejected() {
        assert!(matches!(
            CommissionBuilder::new("can0").node(0).build(),
            Err(Error::InvalidNode(0))
        ));
    }

    #[test]
    fn too_many_slaves_for_the_local_channels() {
        let mut builder = CommissionBuilder::new("can0");
        for n in 1..=5 {
            builder = builder.slave(SlaveDescriptor::drive(id(n)));
        }
        assert!(matches!(builder.build(), Err(Error::LocalChannel(4))));
    }

    #[test]
    fn slaves_follow_discovery() {
        let cfg = CommissionBuilder::new("can0").build().unwrap();
        let slaves = cfg.slaves_for(&[id(1), id(4)]);
        assert_eq!(slaves.len(), 2);
        assert_eq!(slaves[1].node, id(4));
        assert_eq!(slaves[0].feedback.remote[0].raw(), 0x6041_0010);

        let cfg = CommissionBuilder::new("can0")
            .slave(SlaveDescriptor::drive(id(3)))
            .slave(SlaveDescriptor::drive(id(4)))
            .build()
            .unwrap();
        let slaves = cfg.slaves_for(&[id(1), id(4)]);
        assert_eq!(slaves.len(), 1);
        assert_eq!(slaves[0].node, id(4));
    }

    #[test]
    fn run_heartbeat_fills_in_for_every_slave() {
        let run = HeartbeatConfig {
            producer_ms: 50,
            consumer_ms: 200,
        };
        let own = HeartbeatConfig {
            producer_ms: 10,
            consumer_ms: 40,
        };
        let cfg = CommissionBuilder::new("can0")
            .heartbeat(run)
            .slave(SlaveDescriptor::drive(id(2)))
            .slave(SlaveDescriptor::drive(id(3)).with_heartbeat(own))
            .build()
            .unwrap();
        let slaves = cfg.slaves_for(&[id(2), id(3)]);
        assert_eq!(slaves[0].heartbeat, Some(run));
        assert_eq!(slaves[1].heartbeat, Some(own));

        let cfg = CommissionBuilder::new("can0").heartbeat(run).build().unwrap();
        assert_eq!(cfg.slaves_for(&[id(7)])[0].heartbeat, Some(run));
    }
}
