// Part of canopen-commission. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! A simulated bus with scripted slaves, for tests and dry runs.
//!
//! Each [`SimNode`] has an object dictionary and a CiA 402 drive model. The
//! slaves enforce the PDO remapping protocol: mapping entries can only be
//! written while the channel is invalid and its entry count is zero.
//!
//! PDOs are exchanged once per SYNC period between operational slaves and
//! the master's mirror channels, using the mappings written during
//! configuration. Time moves either with a [`SimClock`] (deterministic) or
//! with an exchange thread started by [`SimBus::realtime`].

use crate::{
    cycle::{Clock, Tick},
    drive::{control_word, DriveState},
    image::{LocalDictionary, ProcessImage},
    transport::{Bus, NetConfig, Network},
    types::*,
};
use byteorder::{ByteOrder, LittleEndian as LE};
use crossbeam_channel::{bounded, select, Sender};
use std::{
    collections::BTreeMap,
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread,
    time::Duration,
};

/// Abort code for mapping writes while the channel is valid.
pub const ABORT_PARAM_INCOMPATIBLE: u32 = 0x0604_0043;

const STATUS_SWITCH_ON_DISABLED: u16 = 0x0240;
const STATUS_READY: u16 = 0x0221;
const STATUS_SWITCHED_ON: u16 = 0x0233;
const STATUS_OPERATION_ENABLED: u16 = 0x0237;
const STATUS_FAULT: u16 = 0x0218;

/// One observable action on the bus, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    Nmt { cmd: NmtCommand, node: Option<u8> },
    Probe { from: u8, at: Tick },
    Upload { node: u8, addr: ObjectAddress },
    Download { node: u8, addr: ObjectAddress, data: Vec<u8> },
    LocalWrite { addr: ObjectAddress, value: u32 },
    LocalRestore { index: u16 },
}

#[derive(Debug, Clone)]
struct DriveModel {
    status: u16,
    control: u16,
    position: i32,
    target: i32,
    torque: i16,
    enabled_cycles: u32,
    fault_after: Option<u32>,
}

impl DriveModel {
    fn new() -> Self {
        Self {
            status: STATUS_SWITCH_ON_DISABLED,
            control: control_word::DISABLE_VOLTAGE,
            position: 0,
            target: 0,
            torque: 0,
            enabled_cycles: 0,
            fault_after: None,
        }
    }

    fn update(&mut self) {
        let state = DriveState::from_status(self.status);
        if state.is_fault() {
            return;
        }
        self.status = match (state, self.control) {
            (_, control_word::DISABLE_VOLTAGE) => STATUS_SWITCH_ON_DISABLED,
            (DriveState::SwitchOnDisabled, control_word::SHUTDOWN) => STATUS_READY,
            (DriveState::ReadyToSwitchOn, control_word::SWITCH_ON) => STATUS_SWITCHED_ON,
            (DriveState::SwitchedOn, control_word::ENABLE_OPERATION) => STATUS_OPERATION_ENABLED,
            _ => self.status,
        };
        if self.status != STATUS_OPERATION_ENABLED {
            self.torque = 0;
            return;
        }
        let delta = self.target.wrapping_sub(self.position);
        self.torque = delta.clamp(i16::MIN.into(), i16::MAX.into()) as i16;
        self.position = self.target;
        self.enabled_cycles += 1;
        if self.fault_after == Some(self.enabled_cycles) {
            self.status = STATUS_FAULT;
        }
    }

    fn read(&self, addr: ObjectAddress) -> Option<u32> {
        match addr.index {
            0x6041 => Some(self.status.into()),
            0x6064 => Some(self.position as u32),
            0x6077 => Some(self.torque as u16 as u32),
            _ => None,
        }
    }

    fn write(&mut self, addr: ObjectAddress, raw: u32) {
        match addr.index {
            0x6040 => self.control = raw as u16,
            0x607A => self.target = raw as i32,
            _ => (),
        }
    }
}

/// A scripted slave.
#[derive(Debug, Clone)]
pub struct SimNode {
    id: u8,
    objects: BTreeMap<ObjectAddress, Vec<u8>>,
    drive: DriveModel,
    operational: bool,
}

impl SimNode {
    /// A CiA 402 drive in switch-on-disabled state.
    pub fn drive(id: u8) -> Self {
        Self {
            id,
            objects: BTreeMap::new(),
            drive: DriveModel::new(),
            operational: false,
        }
    }

    /// Device name, hardware and software version. An empty string makes
    /// the object read back with zero bytes.
    pub fn with_identity(mut self, name: &str, hardware: &str, software: &str) -> Self {
        for (index, text) in [(0x1008, name), (0x1009, hardware), (0x100A, software)] {
            self.objects
                .insert(ObjectAddress::new(index, 0), text.as_bytes().to_vec());
        }
        self
    }

    /// Report a fault after `cycles` exchanges in operation enabled.
    pub fn with_fault_after(mut self, cycles: u32) -> Self {
        self.drive.fault_after = Some(cycles);
        self
    }

    pub fn with_position(mut self, position: i32) -> Self {
        self.drive.position = position;
        self.drive.target = position;
        self
    }

    fn object_u32(&self, addr: ObjectAddress) -> Option<u32> {
        self.objects.get(&addr).map(|data| {
            let mut word = [0u8; 4];
            let n = data.len().min(4);
            word[..n].copy_from_slice(&data[..n]);
            LE::read_u32(&word)
        })
    }

    /// The valid COB-ID of a PDO communication object.
    fn valid_cob_id(&self, comm: u16) -> Option<CobId> {
        self.object_u32(ObjectAddress::new(comm, 1))
            .map(CobId::from_raw)
            .filter(|c| !c.is_disabled())
    }

    fn mapping(&self, index: u16) -> Vec<PdoMappingEntry> {
        let count = self.object_u32(ObjectAddress::new(index, 0)).unwrap_or(0);
        (1..=count.min(64) as u8)
            .filter_map(|sub| self.object_u32(ObjectAddress::new(index, sub)))
            .map(PdoMappingEntry::from_raw)
            .collect()
    }

    fn check_mapping_write(&self, addr: ObjectAddress) -> Result<(), SdoFault> {
        let is_mapping = matches!(addr.index, 0x1600..=0x17FF | 0x1A00..=0x1BFF);
        if !is_mapping {
            return Ok(());
        }
        let comm_valid = self.valid_cob_id(addr.index - 0x200).is_some();
        let count = self.object_u32(ObjectAddress::new(addr.index, 0)).unwrap_or(0);
        if comm_valid || (addr.sub != 0 && count != 0) {
            return Err(SdoFault::Rejected(ABORT_PARAM_INCOMPATIBLE));
        }
        Ok(())
    }

    fn download(&mut self, addr: ObjectAddress, data: &[u8]) -> Result<usize, SdoFault> {
        if (0x1008..=0x100A).contains(&addr.index) {
            return Err(SdoFault::AccessDenied(SdoFault::ABORT_READ_ONLY));
        }
        self.check_mapping_write(addr)?;
        self.objects.insert(addr, data.to_vec());
        Ok(data.len())
    }

    /// Apply a received RPDO payload through the slave's RPDO 1 mapping.
    fn receive(&mut self, payload: &[u8]) {
        let mut offset = 0;
        for entry in self.mapping(0x1600) {
            let len = usize::from(entry.bit_len / 8);
            let Some(bytes) = payload.get(offset..offset + len) else {
                break;
            };
            let raw = match len {
                2 => u32::from(LE::read_u16(bytes)),
                4 => LE::read_u32(bytes),
                _ => 0,
            };
            self.drive.write(entry.addr, raw);
            offset += len;
        }
    }

    /// Build the TPDO 1 payload from the drive model.
    fn transmit(&self) -> Vec<u8> {
        let mut payload = vec![];
        for entry in self.mapping(0x1A00) {
            let raw = self.drive.read(entry.addr).unwrap_or(0);
            let mut bytes = [0u8; 4];
            LE::write_u32(&mut bytes, raw);
            payload.extend_from_slice(&bytes[..usize::from(entry.bit_len / 8).min(4)]);
        }
        payload
    }

    fn heartbeat_running(&self) -> bool {
        self.object_u32(ObjectAddress::new(0x1017, 0))
            .map_or(false, |ms| ms != 0)
    }
}

#[derive(Debug)]
struct SimState {
    nodes: BTreeMap<u8, SimNode>,
    local: BTreeMap<ObjectAddress, u32>,
    faults: BTreeMap<(u8, ObjectAddress), (SdoFault, u32)>,
    events: Vec<SimEvent>,
    dictionary: Option<LocalDictionary>,
    now_us: u64,
    next_exchange_us: u64,
    sync_period_us: u64,
}

impl SimState {
    fn now(&self) -> Tick {
        Tick(self.now_us as u32)
    }

    fn take_fault(&mut self, node: u8, addr: ObjectAddress) -> Option<SdoFault> {
        let (fault, left) = self.faults.get_mut(&(node, addr))?;
        let fault = *fault;
        *left -= 1;
        if *left == 0 {
            self.faults.remove(&(node, addr));
        }
        Some(fault)
    }

    fn local_mapping(&self, index: u16) -> Vec<PdoMappingEntry> {
        let count = self.local.get(&ObjectAddress::new(index, 0)).copied().unwrap_or(0);
        (1..=count.min(64) as u8)
            .filter_map(|sub| self.local.get(&ObjectAddress::new(index, sub)))
            .map(|&raw| PdoMappingEntry::from_raw(raw))
            .collect()
    }

    /// The local mirror channel of `kind` listening on or sending `cob_id`.
    fn local_channel(&self, kind: PdoKind, cob_id: CobId) -> Option<PdoChannel> {
        (0..PdoChannel::COUNT)
            .map(|num| PdoChannel::new(kind, num))
            .find(|ch| {
                self.local
                    .get(&ch.cob_addr())
                    .map(|&raw| CobId::from_raw(raw))
                    .map_or(false, |c| !c.is_disabled() && c.can_id() == cob_id.can_id())
            })
    }

    /// One SYNC period: commands go out, the drives move, feedback comes in.
    fn exchange(&mut self) {
        let Some(dict) = &self.dictionary else {
            return;
        };
        let image: &ProcessImage = dict.image();
        let ids: Vec<u8> = self.nodes.keys().copied().collect();
        for id in ids {
            let Some(node) = self.nodes.get(&id) else {
                continue;
            };
            if !node.operational {
                continue;
            }

            let command = node
                .valid_cob_id(0x1400)
                .and_then(|cob| self.local_channel(PdoKind::Tx, cob))
                .and_then(|ch| match dict.resolve(&self.local_mapping(ch.mapping_index())) {
                    Ok(layout) => {
                        let mut buf = [0u8; 8];
                        let len = layout.encode(image, &mut buf);
                        Some(buf[..len].to_vec())
                    }
                    Err(e) => {
                        log::warn!("Sim: local TPDO {} not sent: {}", ch.num + 1, e);
                        None
                    }
                });

            let Some(node) = self.nodes.get_mut(&id) else {
                continue;
            };
            if let Some(payload) = command {
                node.receive(&payload);
            }
            node.drive.update();

            let node = &self.nodes[&id];
            let Some(channel) = node
                .valid_cob_id(0x1800)
                .and_then(|cob| self.local_channel(PdoKind::Rx, cob))
            else {
                continue;
            };
            let payload = node.transmit();
            let decoded = dict
                .resolve(&self.local_mapping(channel.mapping_index()))
                .and_then(|layout| layout.decode(&payload, image));
            if let Err(e) = decoded {
                log::warn!("Sim: TPDO of node {} dropped: {}", id, e);
            }
        }
    }

    /// Let time pass, exchanging PDOs on every SYNC boundary crossed.
    fn advance(&mut self, d: Duration) {
        let end = self.now_us + d.as_micros() as u64;
        while self.next_exchange_us <= end {
            self.now_us = self.next_exchange_us;
            self.exchange();
            self.next_exchange_us += self.sync_period_us;
        }
        self.now_us = end;
    }
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SimBus {
    state: Arc<Mutex<SimState>>,
    realtime: Option<Duration>,
    fail_init: bool,
    fail_client: bool,
}

impl Default for SimBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SimBus {
    pub fn new() -> Self {
        let period = u64::from(SyncConfig::default().period_us);
        Self {
            state: Arc::new(Mutex::new(SimState {
                nodes: BTreeMap::new(),
                local: BTreeMap::new(),
                faults: BTreeMap::new(),
                events: vec![],
                dictionary: None,
                now_us: 0,
                next_exchange_us: period,
                sync_period_us: period,
            })),
            realtime: None,
            fail_init: false,
            fail_client: false,
        }
    }

    pub fn with_node(self, node: SimNode) -> Self {
        lock(&self.state).nodes.insert(node.id, node);
        self
    }

    /// Exchange PDOs from a thread every `period` once the network is
    /// operational, instead of following a [`SimClock`].
    pub fn realtime(mut self, period: Duration) -> Self {
        self.realtime = Some(period);
        self
    }

    /// Make network init fail, as if the interface did not exist.
    pub fn failing_init(mut self) -> Self {
        self.fail_init = true;
        self
    }

    pub fn failing_client(mut self) -> Self {
        self.fail_client = true;
        self
    }

    /// Fail the next `times` transfers to `addr` of `node` with `fault`.
    pub fn inject_fault(&self, node: u8, addr: ObjectAddress, fault: SdoFault, times: u32) {
        if times > 0 {
            lock(&self.state).faults.insert((node, addr), (fault, times));
        }
    }

    pub fn events(&self) -> Vec<SimEvent> {
        lock(&self.state).events.clone()
    }

    /// Current value of an entry of the master's dictionary.
    pub fn local(&self, addr: ObjectAddress) -> Option<u32> {
        lock(&self.state).local.get(&addr).copied()
    }

    /// Last value written to an object of `node`.
    pub fn object(&self, node: u8, addr: ObjectAddress) -> Option<Vec<u8>> {
        lock(&self.state)
            .nodes
            .get(&node)
            .and_then(|n| n.objects.get(&addr).cloned())
    }

    pub fn status_word(&self, node: u8) -> Option<u16> {
        lock(&self.state).nodes.get(&node).map(|n| n.drive.status)
    }

    /// A network configuration with the standard dictionary over a fresh
    /// process image.
    pub fn net_config(&self) -> NetConfig {
        NetConfig {
            canif: "sim0".into(),
            node: NodeId::default(),
            bitrate: 1_000_000,
            dictionary: LocalDictionary::standard(Arc::new(ProcessImage::new())),
        }
    }

    /// A clock driving this bus' PDO exchange.
    pub fn clock(&self) -> SimClock {
        SimClock {
            state: self.state.clone(),
        }
    }
}

impl Bus for SimBus {
    type Network = SimNetwork;

    fn init(&mut self, cfg: &NetConfig) -> io::Result<SimNetwork> {
        if self.fail_init {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no such interface: {}", cfg.canif),
            ));
        }
        lock(&self.state).dictionary = Some(cfg.dictionary.clone());
        Ok(SimNetwork {
            state: self.state.clone(),
            realtime: self.realtime,
            fail_client: self.fail_client,
            stop: None,
        })
    }
}

pub struct SimNetwork {
    state: Arc<Mutex<SimState>>,
    realtime: Option<Duration>,
    fail_client: bool,
    // dropping the sender stops the exchange thread
    stop: Option<Sender<()>>,
}

impl SimNetwork {
    fn start_exchange(&mut self) {
        let Some(period) = self.realtime else {
            return;
        };
        if self.stop.is_some() {
            return;
        }
        let (stop, stopped) = bounded::<()>(0);
        let ticks = crossbeam_channel::tick(period);
        let state = self.state.clone();
        thread::spawn(move || loop {
            let done = select! {
                recv(ticks) -> _ => false,
                recv(stopped) -> _ => true,
            };
            if done {
                break;
            }
            let mut state = lock(&state);
            let now = state.now_us + period.as_micros() as u64;
            state.now_us = now;
            state.exchange();
        });
        self.stop = Some(stop);
    }
}

impl Network for SimNetwork {
    fn client_init(&mut self) -> io::Result<()> {
        if self.fail_client {
            return Err(io::Error::new(io::ErrorKind::Other, "SDO client unavailable"));
        }
        Ok(())
    }

    fn nmt(&mut self, cmd: NmtCommand, node: Option<NodeId>) -> Result<(), SdoFault> {
        {
            let mut state = lock(&self.state);
            state.events.push(SimEvent::Nmt {
                cmd,
                node: node.map(u8::from),
            });
            for n in state.nodes.values_mut() {
                if node.map_or(true, |id| id.get() == n.id) {
                    n.operational = cmd == NmtCommand::Operational;
                }
            }
        }
        if cmd == NmtCommand::Operational {
            self.start_exchange();
        }
        Ok(())
    }

    fn node_next(&mut self, from: u8) -> Option<NodeId> {
        let mut state = lock(&self.state);
        let at = state.now();
        state.events.push(SimEvent::Probe { from, at });
        state
            .nodes
            .range(from..)
            .next()
            .and_then(|(&id, _)| NodeId::try_from(id).ok())
    }

    fn node_count(&self) -> usize {
        lock(&self.state).nodes.len()
    }

    fn node_check(&mut self, node: NodeId) -> bool {
        lock(&self.state)
            .nodes
            .get(&node.get())
            .map_or(false, SimNode::heartbeat_running)
    }

    fn sdo_upload(
        &mut self,
        node: NodeId,
        addr: ObjectAddress,
        buf: &mut [u8],
    ) -> Result<usize, SdoFault> {
        let mut state = lock(&self.state);
        let id = node.get();
        state.events.push(SimEvent::Upload { node: id, addr });
        if let Some(fault) = state.take_fault(id, addr) {
            return Err(fault);
        }
        let slave = state.nodes.get(&id).ok_or(SdoFault::Unreachable)?;
        let data = slave
            .objects
            .get(&addr)
            .ok_or(SdoFault::Rejected(SdoFault::ABORT_NO_OBJECT))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(n)
    }

    fn sdo_download(
        &mut self,
        node: NodeId,
        addr: ObjectAddress,
        data: &[u8],
    ) -> Result<usize, SdoFault> {
        let mut state = lock(&self.state);
        let id = node.get();
        state.events.push(SimEvent::Download {
            node: id,
            addr,
            data: data.to_vec(),
        });
        if let Some(fault) = state.take_fault(id, addr) {
            return Err(fault);
        }
        state
            .nodes
            .get_mut(&id)
            .ok_or(SdoFault::Unreachable)?
            .download(addr, data)
    }

    fn local_write(&mut self, addr: ObjectAddress, value: u32) -> Result<(), SdoFault> {
        let mut state = lock(&self.state);
        state.events.push(SimEvent::LocalWrite { addr, value });
        state.local.insert(addr, value);
        Ok(())
    }

    fn local_restore(&mut self, index: u16) -> Result<(), SdoFault> {
        let mut state = lock(&self.state);
        state.events.push(SimEvent::LocalRestore { index });
        let known = state
            .dictionary
            .as_ref()
            .map_or(false, |d| d.templates().contains(&index));
        if !known {
            return Err(SdoFault::Rejected(SdoFault::ABORT_NO_OBJECT));
        }
        state.local.retain(|addr, _| addr.index != index);
        Ok(())
    }
}

/// Simulated time. Pausing runs the PDO exchange for every SYNC period that
/// elapses.
#[derive(Clone)]
pub struct SimClock {
    state: Arc<Mutex<SimState>>,
}

impl Clock for SimClock {
    fn now(&self) -> Tick {
        lock(&self.state).now()
    }

    fn pause(&self, d: Duration) {
        lock(&self.state).advance(d);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::configure::ServiceConfigurator;
    use crate::config::SlaveDescriptor;
    use crate::master::Master;

    fn id(n: u8) -> NodeId {
        NodeId::try_from(n).unwrap()
    }

    #[test]
    fn drive_model_follows_the_power_sequence() {
        let mut drive = DriveModel::new();
        for (cw, status) in [
            (6, STATUS_READY),
            (7, STATUS_SWITCHED_ON),
            (15, STATUS_OPERATION_ENABLED),
            (0, STATUS_SWITCH_ON_DISABLED),
        ] {
            drive.control = cw;
            drive.update();
            assert_eq!(drive.status, status);
        }
        // no skipping states
        drive.control = 15;
        drive.update();
        assert_eq!(drive.status, STATUS_SWITCH_ON_DISABLED);
    }

    #[test]
    fn mapping_needs_an_invalid_channel() {
        let mut node = SimNode::drive(1);
        let entry = ObjectAddress::new(0x1A00, 1);
        node.download(ObjectAddress::new(0x1800, 1), &0x181u32.to_le_bytes())
            .unwrap();
        assert_eq!(
            node.download(entry, &0x6041_0010u32.to_le_bytes()),
            Err(SdoFault::Rejected(ABORT_PARAM_INCOMPATIBLE))
        );
        node.download(ObjectAddress::new(0x1800, 1), &0x8000_0181u32.to_le_bytes())
            .unwrap();
        node.download(ObjectAddress::new(0x1A00, 0), &[1]).unwrap();
        assert!(node.download(entry, &0x6041_0010u32.to_le_bytes()).is_err());
        node.download(ObjectAddress::new(0x1A00, 0), &[0]).unwrap();
        assert_eq!(node.download(entry, &0x6041_0010u32.to_le_bytes()), Ok(4));
    }

    #[test]
    fn identity_is_read_only() {
        let mut node = SimNode::drive(1).with_identity("a", "b", "c");
        assert!(matches!(
            node.download(ObjectAddress::new(0x1008, 0), b"x"),
            Err(SdoFault::AccessDenied(_))
        ));
    }

    #[test]
    fn configured_pdos_are_exchanged() {
        let mut bus = SimBus::new().with_node(SimNode::drive(2).with_position(1000));
        let cfg = bus.net_config();
        let image = cfg.dictionary.image().clone();
        let mut m = Master::new(bus.init(&cfg).unwrap(), RetryPolicy::none());
        ServiceConfigurator::new(SyncConfig::default(), &cfg.dictionary)
            .configure(&mut m, 0, &SlaveDescriptor::drive(id(2)))
            .unwrap();
        let clock = bus.clock();

        // nothing moves before the network is operational
        clock.pause(Duration::from_millis(10));
        assert_eq!(image.snapshot().status_word, 0);

        m.nmt(NmtCommand::Operational, None).unwrap();
        clock.pause(Duration::from_millis(2));
        let snap = image.snapshot();
        assert_eq!(snap.status_word, STATUS_SWITCH_ON_DISABLED);
        assert_eq!(snap.actual_position, 1000);

        image.command(control_word::SHUTDOWN, 1000);
        clock.pause(Duration::from_millis(2));
        assert_eq!(image.snapshot().status_word, STATUS_READY);
        assert_eq!(bus.status_word(2), Some(STATUS_READY));
    }

    #[test]
    fn faults_are_consumed() {
        let bus = SimBus::new().with_node(SimNode::drive(1));
        let addr = ObjectAddress::new(0x1017, 0);
        bus.inject_fault(1, addr, SdoFault::Timeout, 2);
        let mut state = lock(&bus.state);
        assert_eq!(state.take_fault(1, addr), Some(SdoFault::Timeout));
        assert_eq!(state.take_fault(1, addr), Some(SdoFault::Timeout));
        assert_eq!(state.take_fault(1, addr), None);
    }
}
