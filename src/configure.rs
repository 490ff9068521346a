// Part of canopen-commission. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Heartbeat, SYNC and PDO setup of the slaves and of the master's mirror
//! objects.

use crate::{
    config::{PdoDescriptor, SlaveDescriptor},
    image::{self, LocalDictionary},
    master::Master,
    transport::Network,
    types::*,
};

const HEARTBEAT_CONSUMER: u16 = 0x1016;
const HEARTBEAT_PRODUCER: u16 = 0x1017;
pub(crate) const SYNC_COB_ID: u16 = 0x1005;
pub(crate) const SYNC_PERIOD: u16 = 0x1006;

const PDO_TRANSMISSION_TYPE: u8 = 2;
const PDO_INHIBIT_TIME: u8 = 3;
const PDO_EVENT_TIMER: u8 = 5;

/// What teardown needs to know about a configured slave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfiguredSlave {
    pub node: NodeId,
    /// Slave channel sending feedback to the master.
    pub feedback: PdoChannel,
    /// Slave channel receiving commands from the master.
    pub command: PdoChannel,
    /// The slave generates SYNC for the whole network.
    pub sync_producer: bool,
}

/// Configures slaves one after the other. With slave-generated SYNC, the
/// first slave configured successfully becomes the only SYNC producer.
pub struct ServiceConfigurator<'a> {
    sync: SyncConfig,
    dictionary: &'a LocalDictionary,
    producer: Option<NodeId>,
}

impl<'a> ServiceConfigurator<'a> {
    pub fn new(sync: SyncConfig, dictionary: &'a LocalDictionary) -> Self {
        Self {
            sync,
            dictionary,
            producer: None,
        }
    }

    /// The slave chosen as SYNC producer so far.
    pub fn sync_producer(&self) -> Option<NodeId> {
        self.producer
    }

    /// Configure one slave, using the master's mirror channels `slot`.
    pub fn configure<N: Network>(
        &mut self,
        master: &mut Master<N>,
        slot: usize,
        slave: &SlaveDescriptor,
    ) -> Result<ConfiguredSlave> {
        let node = slave.node;
        let slot = u8::try_from(slot)
            .ok()
            .filter(|&s| s < PdoChannel::COUNT)
            .ok_or(Error::LocalChannel(slot))?;
        self.validate(slave)?;
        log::info!("Configuring node {} on local channel {}", node, slot + 1);

        self.configure_heartbeat(master, slot, slave)?;
        let sync_producer = self.configure_sync(master, node)?;
        let feedback = PdoChannel::new(PdoKind::Tx, 0);
        let command = PdoChannel::new(PdoKind::Rx, 0);
        if let Err(e) = self.configure_pdos(master, slot, slave, feedback, command) {
            if sync_producer {
                self.producer = None;
                let cob_id = self.sync.cob_id.raw() & !CobId::GENERATE;
                if let Err(undo) =
                    master.sdo_download(node, ObjectAddress::new(SYNC_COB_ID, 0), &cob_id)
                {
                    log::warn!("Node {} may still produce SYNC: {}", node, undo);
                }
            }
            return Err(e);
        }

        Ok(ConfiguredSlave {
            node,
            feedback,
            command,
            sync_producer,
        })
    }

    fn configure_pdos<N: Network>(
        &self,
        master: &mut Master<N>,
        slot: u8,
        slave: &SlaveDescriptor,
        feedback: PdoChannel,
        command: PdoChannel,
    ) -> Result<()> {
        let node = slave.node;
        let transmission = Transmission::for_sync(self.sync.mode);

        // slave -> master
        configure_local_pdo(
            master,
            PdoChannel::new(PdoKind::Rx, slot),
            &slave.feedback.local,
            None,
            feedback.cob_id(node),
        )?;
        configure_remote_pdo(
            master,
            node,
            feedback,
            &slave.feedback.remote,
            Some(transmission),
        )?;
        suppress_unused(master, node, PdoKind::Tx)?;

        // master -> slave
        configure_local_pdo(
            master,
            PdoChannel::new(PdoKind::Tx, slot),
            &slave.command.local,
            Some(transmission),
            command.cob_id(node),
        )?;
        configure_remote_pdo(master, node, command, &slave.command.remote, None)?;
        suppress_unused(master, node, PdoKind::Rx)
    }

    /// Check both mappings before anything is written.
    fn validate(&self, slave: &SlaveDescriptor) -> Result<()> {
        let check = |pdo: &PdoDescriptor| -> Result<(), image::MappingError> {
            self.dictionary.resolve(&pdo.local)?;
            image::check_pairing(&pdo.local, &pdo.remote)
        };
        check(&slave.feedback)
            .and_then(|_| check(&slave.command))
            .map_err(|source| Error::Mapping {
                node: slave.node,
                source,
            })
    }

    fn configure_heartbeat<N: Network>(
        &self,
        master: &mut Master<N>,
        slot: u8,
        slave: &SlaveDescriptor,
    ) -> Result<()> {
        let heartbeat = slave.heartbeat.unwrap_or_default();
        let consumer = u32::from(slave.node.get()) << 16 | u32::from(heartbeat.consumer_ms);
        master.local_write(ObjectAddress::new(HEARTBEAT_CONSUMER, slot + 1), consumer)?;
        master.sdo_download(
            slave.node,
            ObjectAddress::new(HEARTBEAT_PRODUCER, 0),
            &heartbeat.producer_ms,
        )
    }

    /// Returns whether `node` was made the SYNC producer.
    fn configure_sync<N: Network>(&mut self, master: &mut Master<N>, node: NodeId) -> Result<bool> {
        let cob_id = self.sync.cob_id.generating().raw();
        let period = self.sync.period_us;
        match self.sync.mode {
            SyncMode::MasterGenerated => {
                master.local_write(ObjectAddress::new(SYNC_COB_ID, 0), cob_id)?;
                master.local_write(ObjectAddress::new(SYNC_PERIOD, 0), period)?;
                Ok(false)
            }
            SyncMode::SlaveGenerated if self.producer.is_none() => {
                master.sdo_download(node, ObjectAddress::new(SYNC_COB_ID, 0), &cob_id)?;
                master.sdo_download(node, ObjectAddress::new(SYNC_PERIOD, 0), &period)?;
                log::info!("Node {} produces SYNC every {} us", node, period);
                self.producer = Some(node);
                Ok(true)
            }
            SyncMode::SlaveGenerated | SyncMode::None => Ok(false),
        }
    }
}

/// Set up one mirror channel of the master: restore defaults, map, then
/// enable with the slave's identifier.
pub fn configure_local_pdo<N: Network>(
    master: &mut Master<N>,
    channel: PdoChannel,
    entries: &[PdoMappingEntry],
    transmission: Option<Transmission>,
    cob_id: CobId,
) -> Result<()> {
    let comm = channel.comm_index();
    let mapping = channel.mapping_index();
    master.local_restore(comm)?;
    master.local_write(ObjectAddress::new(mapping, 0), 0)?;
    for (sub, entry) in (1..).zip(entries) {
        master.local_write(ObjectAddress::new(mapping, sub), entry.raw())?;
    }
    master.local_write(ObjectAddress::new(mapping, 0), entries.len() as u32)?;
    if let Some(t) = transmission {
        master.local_write(ObjectAddress::new(comm, PDO_TRANSMISSION_TYPE), u32::from(t.kind))?;
        if let Some(inhibit) = t.inhibit_time {
            master.local_write(ObjectAddress::new(comm, PDO_INHIBIT_TIME), u32::from(inhibit))?;
        }
        if let Some(event) = t.event_timer {
            master.local_write(ObjectAddress::new(comm, PDO_EVENT_TIMER), u32::from(event))?;
        }
    }
    master.local_write(channel.cob_addr(), cob_id.enabled().raw())
}

/// Remap a PDO of a slave. The channel is invalidated before its mapping is
/// touched and only validated again once the new entry count is committed.
pub fn configure_remote_pdo<N: Network>(
    master: &mut Master<N>,
    node: NodeId,
    channel: PdoChannel,
    entries: &[PdoMappingEntry],
    transmission: Option<Transmission>,
) -> Result<()> {
    let cob_id = channel.cob_id(node);
    let comm = channel.comm_index();
    let mapping = channel.mapping_index();

    master.sdo_download(node, channel.cob_addr(), &cob_id.disabled().raw())?;
    master.sdo_download(node, ObjectAddress::new(mapping, 0), &0u8)?;
    for (sub, entry) in (1..).zip(entries) {
        master.sdo_download(node, ObjectAddress::new(mapping, sub), &entry.raw())?;
    }
    master.sdo_download(node, ObjectAddress::new(mapping, 0), &(entries.len() as u8))?;
    if let Some(t) = transmission {
        master.sdo_download(node, ObjectAddress::new(comm, PDO_TRANSMISSION_TYPE), &t.kind)?;
        if let Some(inhibit) = t.inhibit_time {
            master.sdo_download(node, ObjectAddress::new(comm, PDO_INHIBIT_TIME), &inhibit)?;
        }
        if let Some(event) = t.event_timer {
            master.sdo_download(node, ObjectAddress::new(comm, PDO_EVENT_TIMER), &event)?;
        }
    }
    master.sdo_download(node, channel.cob_addr(), &cob_id.enabled().raw())
}

/// Invalidate channels 2 to 4 of one direction.
pub fn suppress_unused<N: Network>(
    master: &mut Master<N>,
    node: NodeId,
    kind: PdoKind,
) -> Result<()> {
    for num in 1..PdoChannel::COUNT {
        let channel = PdoChannel::new(kind, num);
        master.sdo_download(node, channel.cob_addr(), &channel.cob_id(node).disabled().raw())?;
    }
    Ok(())
}
