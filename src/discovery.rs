// Part of canopen-commission. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Finding the slaves on the bus and reading their identity strings.

use crate::{
    convert::visible_string, diag::Diagnostics, master::Master, transport::Network, types::*,
};

/// Size of the buffer identity strings are read into.
pub const IDENTITY_BUF_LEN: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityField {
    DeviceName,
    HardwareVersion,
    SoftwareVersion,
}

impl IdentityField {
    pub const ALL: [IdentityField; 3] = [
        IdentityField::DeviceName,
        IdentityField::HardwareVersion,
        IdentityField::SoftwareVersion,
    ];

    pub const fn index(self) -> u16 {
        match self {
            IdentityField::DeviceName => 0x1008,
            IdentityField::HardwareVersion => 0x1009,
            IdentityField::SoftwareVersion => 0x100A,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SlaveIdentity {
    pub device_name: Option<String>,
    pub hardware_version: Option<String>,
    pub software_version: Option<String>,
}

impl SlaveIdentity {
    pub fn get(&self, field: IdentityField) -> Option<&str> {
        match field {
            IdentityField::DeviceName => self.device_name.as_deref(),
            IdentityField::HardwareVersion => self.hardware_version.as_deref(),
            IdentityField::SoftwareVersion => self.software_version.as_deref(),
        }
    }

    fn set(&mut self, field: IdentityField, text: String) {
        let slot = match field {
            IdentityField::DeviceName => &mut self.device_name,
            IdentityField::HardwareVersion => &mut self.hardware_version,
            IdentityField::SoftwareVersion => &mut self.software_version,
        };
        *slot = Some(text);
    }
}

/// A node which answered the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlaveNode {
    pub id: NodeId,
    pub identity: SlaveIdentity,
}

/// Cursor over responding node ids, strictly increasing from 1.
#[derive(Debug, Clone)]
pub struct NodeScan {
    from: u8,
    done: bool,
}

impl Default for NodeScan {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeScan {
    pub fn new() -> Self {
        Self {
            from: NodeId::MIN,
            done: false,
        }
    }

    /// Probe for the next responding node.
    pub fn advance<N: Network>(&mut self, master: &mut Master<N>) -> Option<NodeId> {
        if self.done {
            return None;
        }
        match master.node_next(self.from) {
            Some(id) if id.get() >= self.from => {
                if id.get() == NodeId::MAX {
                    self.done = true;
                } else {
                    self.from = id.get() + 1;
                }
                Some(id)
            }
            _ => {
                self.done = true;
                None
            }
        }
    }
}

/// Lazily enumerate responding nodes.
pub fn scan_nodes<N: Network>(master: &mut Master<N>) -> impl Iterator<Item = NodeId> + '_ {
    let mut scan = NodeScan::new();
    std::iter::from_fn(move || scan.advance(master))
}

/// Read the three identity strings of `node`. Reads that fail or return
/// nothing are left out.
pub fn fetch_identity<N: Network>(
    master: &mut Master<N>,
    node: NodeId,
    diag: &mut dyn Diagnostics,
) -> SlaveIdentity {
    let mut identity = SlaveIdentity::default();
    let mut buf = [0u8; IDENTITY_BUF_LEN];
    for field in IdentityField::ALL {
        let addr = ObjectAddress::new(field.index(), 0);
        match master.sdo_upload(node, addr, &mut buf) {
            Ok(data) if !data.is_empty() => {
                let text = visible_string(data);
                diag.identity(node, field, &text);
                identity.set(field, text);
            }
            Ok(_) => log::debug!("Node {}: {} is empty", node, addr),
            Err(e) => log::debug!("Node {}: {}", node, e),
        }
    }
    identity
}

/// Scan the bus and read the identity of every node found.
pub fn discover<N: Network>(
    master: &mut Master<N>,
    diag: &mut dyn Diagnostics,
) -> Result<Vec<SlaveNode>> {
    let mut scan = NodeScan::new();
    let first = scan.advance(master).ok_or(Error::NoNodes)?;
    log::info!("{} nodes found", master.node_count());

    let mut nodes = vec![];
    let mut next = Some(first);
    while let Some(id) = next {
        log::info!("{} found", id);
        let identity = fetch_identity(master, id, diag);
        nodes.push(SlaveNode { id, identity });
        next = scan.advance(master);
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::diag::Recorder;
    use crate::sim::{SimBus, SimEvent, SimNode};
    use crate::transport::Bus;

    fn master(bus: &mut SimBus) -> Master<crate::sim::SimNetwork> {
        let cfg = bus.net_config();
        Master::new(bus.init(&cfg).unwrap(), RetryPolicy::none())
    }

    #[test]
    fn scan_is_strictly_increasing() {
        let mut bus = SimBus::new()
            .with_node(SimNode::drive(3))
            .with_node(SimNode::drive(1))
            .with_node(SimNode::drive(127))
            .with_node(SimNode::drive(64));
        let mut m = master(&mut bus);
        let ids: Vec<u8> = scan_nodes(&mut m).map(u8::from).collect();
        assert_eq!(ids, vec![1, 3, 64, 127]);

        let probes: Vec<u8> = bus
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SimEvent::Probe { from, .. } => Some(from),
                _ => None,
            })
            .collect();
        // the scan ends after node 127 without another probe
        assert_eq!(probes, vec![1, 2, 4, 65]);
    }

    #[test]
    fn empty_bus_is_fatal() {
        let mut bus = SimBus::new();
        let mut m = master(&mut bus);
        assert_eq!(scan_nodes(&mut m).count(), 0);
        let mut rec = Recorder::default();
        assert!(matches!(discover(&mut m, &mut rec), Err(Error::NoNodes)));
    }

    #[test]
    fn identity_takes_three_uploads_per_node() {
        let mut bus = SimBus::new()
            .with_node(SimNode::drive(1).with_identity("IclA D065", "RS 1.1", "V1.106"))
            .with_node(SimNode::drive(5).with_identity("Servo", "", "V2"));
        let mut m = master(&mut bus);
        let mut rec = Recorder::default();
        let nodes = discover(&mut m, &mut rec).unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].identity.get(IdentityField::DeviceName), Some("IclA D065"));
        assert_eq!(nodes[1].identity.hardware_version, None);

        for node in [1, 5] {
            let uploads = bus
                .events()
                .into_iter()
                .filter(|e| matches!(e, SimEvent::Upload { node: n, .. } if *n == node))
                .count();
            assert_eq!(uploads, 3);
        }
        // the empty hardware version of node 5 prints no line
        assert_eq!(rec.identities.len(), 5);
        assert_eq!(rec.identities[2].2, "V1.106");
    }

    #[test]
    fn failed_identity_reads_are_skipped() {
        let mut bus = SimBus::new().with_node(SimNode::drive(2).with_identity("Drive", "A", "B"));
        bus.inject_fault(2, ObjectAddress::new(0x1009, 0), SdoFault::Timeout, 1);
        let mut m = master(&mut bus);
        let mut rec = Recorder::default();
        let node = NodeId::try_from(2).unwrap();
        let identity = fetch_identity(&mut m, node, &mut rec);
        assert_eq!(identity.hardware_version, None);
        assert_eq!(identity.software_version.as_deref(), Some("B"));
        assert_eq!(rec.identities.len(), 2);
    }
}
