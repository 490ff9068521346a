// Part of canopen-commission. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! The contract of the CANopen master stack this crate drives. SDO/PDO wire
//! mechanics, NMT framing and object storage all live behind these traits.

use crate::{image::LocalDictionary, types::*};
use std::io;

/// Parameters for bringing up a network.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Bus interface name, e.g. `can0`.
    pub canif: String,
    /// Node id of the master itself.
    pub node: NodeId,
    pub bitrate: u32,
    pub dictionary: LocalDictionary,
}

/// Opens networks on a bus.
pub trait Bus {
    type Network: Network;

    /// Bind a network to the interface. The transport decodes received PDOs
    /// into `cfg.dictionary` from now on.
    fn init(&mut self, cfg: &NetConfig) -> io::Result<Self::Network>;
}

/// A running master node.
///
/// All transfers block until the transport's own timeout elapses.
pub trait Network {
    /// Attach the SDO client to this network.
    fn client_init(&mut self) -> io::Result<()>;

    /// Request a state change of `node`, or of all nodes for `None`.
    fn nmt(&mut self, cmd: NmtCommand, node: Option<NodeId>) -> Result<(), SdoFault>;

    /// The first responding node with an id of at least `from`.
    fn node_next(&mut self, from: u8) -> Option<NodeId>;

    /// Number of nodes that answered since the last reset.
    fn node_count(&self) -> usize;

    /// Whether `node`'s heartbeat is still being received.
    fn node_check(&mut self, node: NodeId) -> bool;

    /// Read an object of `node` into `buf`, returns the number of bytes
    /// transferred.
    fn sdo_upload(
        &mut self,
        node: NodeId,
        addr: ObjectAddress,
        buf: &mut [u8],
    ) -> Result<usize, SdoFault>;

    /// Write an object of `node`, returns the number of bytes transferred.
    fn sdo_download(
        &mut self,
        node: NodeId,
        addr: ObjectAddress,
        data: &[u8],
    ) -> Result<usize, SdoFault>;

    /// Write an entry of the master's own object dictionary.
    fn local_write(&mut self, addr: ObjectAddress, value: u32) -> Result<(), SdoFault>;

    /// Restore an object of the master's own dictionary to its defaults.
    fn local_restore(&mut self, index: u16) -> Result<(), SdoFault>;
}
