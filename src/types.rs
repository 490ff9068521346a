// Part of canopen-commission. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

use crate::image::MappingError;
use derive_new::new;
use std::{fmt, io};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Network init failed on {canif}: {source}")]
    NetworkInit {
        canif: String,
        #[source]
        source: io::Error,
    },
    #[error("Client init failed: {0}")]
    ClientInit(#[source] io::Error),
    #[error("No nodes found")]
    NoNodes,
    #[error("Invalid node id {0}")]
    InvalidNode(u8),
    #[error("Node {node}: SDO {addr} failed: {fault}")]
    Sdo {
        node: NodeId,
        addr: ObjectAddress,
        fault: SdoFault,
    },
    #[error("Local object {addr} failed: {fault}")]
    Local { addr: ObjectAddress, fault: SdoFault },
    #[error("NMT {cmd:?} failed: {fault}")]
    Nmt { cmd: NmtCommand, fault: SdoFault },
    #[error("Node {node}: invalid PDO mapping: {source}")]
    Mapping {
        node: NodeId,
        #[source]
        source: MappingError,
    },
    #[error("Local PDO channel {0} is out of range")]
    LocalChannel(usize),
    #[error("Drive fault in cycle {cycle}: status word 0x{status:04X}")]
    DriveFault { status: u16, cycle: u32 },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        io::Error::new(io::ErrorKind::Other, e)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classified failure of a single confirmed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SdoFault {
    #[error("node unreachable")]
    Unreachable,
    #[error("timed out")]
    Timeout,
    #[error("object rejected (abort code 0x{0:08X})")]
    Rejected(u32),
    #[error("access denied (abort code 0x{0:08X})")]
    AccessDenied(u32),
}

impl SdoFault {
    pub const ABORT_TIMEOUT: u32 = 0x0504_0000;
    pub const ABORT_NO_OBJECT: u32 = 0x0602_0000;
    pub const ABORT_READ_ONLY: u32 = 0x0601_0002;

    /// Classify an SDO abort code.
    pub const fn from_abort(code: u32) -> Self {
        match code {
            Self::ABORT_TIMEOUT => SdoFault::Timeout,
            c if c & 0xFFFF_0000 == 0x0601_0000 => SdoFault::AccessDenied(c),
            c => SdoFault::Rejected(c),
        }
    }

    /// Whether repeating the transfer may succeed.
    pub const fn is_transient(self) -> bool {
        matches!(self, SdoFault::Unreachable | SdoFault::Timeout)
    }
}

/// A CANopen node id, always in `1..=127`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u8);

impl NodeId {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 127;

    pub const fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for NodeId {
    type Error = Error;

    fn try_from(id: u8) -> Result<Self> {
        if (Self::MIN..=Self::MAX).contains(&id) {
            Ok(NodeId(id))
        } else {
            Err(Error::InvalidNode(id))
        }
    }
}

impl Default for NodeId {
    fn default() -> Self {
        NodeId(Self::MIN)
    }
}

impl From<NodeId> for u8 {
    fn from(id: NodeId) -> u8 {
        id.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Object dictionary address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, new)]
pub struct ObjectAddress {
    pub index: u16,
    pub sub: u8,
}

impl fmt::Display for ObjectAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:04X}:{:02X}", self.index, self.sub)
    }
}

/// 32 bit communication object identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CobId(u32);

impl CobId {
    /// Bit 31: object is not valid.
    pub const DISABLE: u32 = 1 << 31;
    /// Bit 30: this node produces the object (SYNC, TIME).
    pub const GENERATE: u32 = 1 << 30;
    const CAN_ID_MASK: u32 = 0x1FFF_FFFF;

    pub const fn new(can_id: u32) -> Self {
        CobId(can_id & Self::CAN_ID_MASK)
    }

    pub const fn from_raw(raw: u32) -> Self {
        CobId(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn can_id(self) -> u32 {
        self.0 & Self::CAN_ID_MASK
    }

    pub const fn disabled(self) -> Self {
        CobId(self.0 | Self::DISABLE)
    }

    pub const fn enabled(self) -> Self {
        CobId(self.0 & !Self::DISABLE)
    }

    pub const fn generating(self) -> Self {
        CobId(self.0 | Self::GENERATE)
    }

    pub const fn is_disabled(self) -> bool {
        self.0 & Self::DISABLE != 0
    }
}

/// One mapped object inside a PDO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, new)]
pub struct PdoMappingEntry {
    pub addr: ObjectAddress,
    pub bit_len: u8,
}

impl PdoMappingEntry {
    pub const fn raw(self) -> u32 {
        (self.addr.index as u32) << 16 | (self.addr.sub as u32) << 8 | self.bit_len as u32
    }

    pub const fn from_raw(raw: u32) -> Self {
        PdoMappingEntry {
            addr: ObjectAddress {
                index: (raw >> 16) as u16,
                sub: (raw >> 8) as u8,
            },
            bit_len: raw as u8,
        }
    }
}

/// Direction of a PDO as seen by the device owning the parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PdoKind {
    /// Receive PDO, communication at 0x1400, mapping at 0x1600.
    Rx,
    /// Transmit PDO, communication at 0x1800, mapping at 0x1A00.
    Tx,
}

/// One of the four predefined PDO channels of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, new)]
pub struct PdoChannel {
    pub kind: PdoKind,
    /// Zero based channel number, `0..4`.
    pub num: u8,
}

impl PdoChannel {
    pub const COUNT: u8 = 4;

    pub const fn comm_index(self) -> u16 {
        match self.kind {
            PdoKind::Rx => 0x1400 + self.num as u16,
            PdoKind::Tx => 0x1800 + self.num as u16,
        }
    }

    pub const fn mapping_index(self) -> u16 {
        self.comm_index() + 0x200
    }

    /// Predefined connection set identifier for this channel of `node`.
    pub fn cob_id(self, node: NodeId) -> CobId {
        let base = match self.kind {
            PdoKind::Rx => 0x200,
            PdoKind::Tx => 0x180,
        };
        CobId::new(base + 0x100 * u32::from(self.num) + u32::from(node.get()))
    }

    pub fn cob_addr(self) -> ObjectAddress {
        ObjectAddress::new(self.comm_index(), 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NmtCommand {
    Operational = 0x01,
    Stop = 0x02,
    PreOperational = 0x80,
    ResetNode = 0x81,
    ResetCommunication = 0x82,
}

/// Who produces the SYNC object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    MasterGenerated,
    SlaveGenerated,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncConfig {
    pub mode: SyncMode,
    pub cob_id: CobId,
    pub period_us: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::SlaveGenerated,
            cob_id: CobId::new(0x80),
            period_us: 2000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Producer time written to the slave, in ms.
    pub producer_ms: u16,
    /// Consumer time mirrored on the master, in ms.
    pub consumer_ms: u16,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            producer_ms: 5,
            consumer_ms: 20,
        }
    }
}

/// Transmission type and timers of a PDO communication object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transmission {
    pub kind: u8,
    pub inhibit_time: Option<u16>,
    pub event_timer: Option<u16>,
}

impl Transmission {
    pub const fn synchronous() -> Self {
        Self {
            kind: 0x01,
            inhibit_time: None,
            event_timer: None,
        }
    }

    pub const fn event_driven(inhibit_time: u16, event_timer: u16) -> Self {
        Self {
            kind: 0xFF,
            inhibit_time: Some(inhibit_time),
            event_timer: Some(event_timer),
        }
    }

    pub const fn for_sync(mode: SyncMode) -> Self {
        match mode {
            SyncMode::None => Self::event_driven(20, 2),
            _ => Self::synchronous(),
        }
    }
}

/// Values which can be sent with an SDO download, little endian on the wire.
pub trait SdoData {
    fn to_wire(&self) -> Vec<u8>;
}

macro_rules! sdo_data {
    ($($t:ty),*) => { $(
        impl SdoData for $t {
            fn to_wire(&self) -> Vec<u8> {
                self.to_le_bytes().to_vec()
            }
        }
    )* }
}

sdo_data!(u8, u16, u32, u64, i8, i16, i32, i64);

impl SdoData for &'_ [u8] {
    fn to_wire(&self) -> Vec<u8> {
        self.to_vec()
    }
}

#[test]
fn test_mapping_entry_word() {
    let entry = PdoMappingEntry::new(ObjectAddress::new(0x6064, 0), 32);
    assert_eq!(entry.raw(), 0x6064_0020);
    assert_eq!(PdoMappingEntry::from_raw(0x7100_0020).addr, ObjectAddress::new(0x7100, 0));
    assert_eq!(PdoMappingEntry::from_raw(0x6041_0110).bit_len, 16);
    assert_eq!(PdoMappingEntry::from_raw(0x6041_0110).addr.sub, 1);
}

#[test]
fn test_cob_id_flags() {
    let node = NodeId::try_from(5).unwrap();
    let tpdo = PdoChannel::new(PdoKind::Tx, 0).cob_id(node);
    assert_eq!(tpdo.raw(), 0x185);
    assert_eq!(tpdo.disabled().raw(), 0x8000_0185);
    assert!(tpdo.disabled().is_disabled());
    assert_eq!(tpdo.disabled().enabled(), tpdo);
    assert_eq!(tpdo.disabled().can_id(), 0x185);
    assert_eq!(CobId::new(0x80).generating().raw(), 0x4000_0080);

    let rpdo4 = PdoChannel::new(PdoKind::Rx, 3);
    assert_eq!(rpdo4.cob_id(node).raw(), 0x505);
    assert_eq!(rpdo4.comm_index(), 0x1403);
    assert_eq!(rpdo4.mapping_index(), 0x1603);
    assert_eq!(PdoChannel::new(PdoKind::Tx, 1).mapping_index(), 0x1A01);
}

#[test]
fn test_node_id_range() {
    assert!(NodeId::try_from(0).is_err());
    assert!(NodeId::try_from(128).is_err());
    assert_eq!(NodeId::try_from(127).map(u8::from).ok(), Some(127));
}

#[test]
fn test_fault_classification() {
    assert_eq!(SdoFault::from_abort(0x0504_0000), SdoFault::Timeout);
    assert_eq!(SdoFault::from_abort(0x0601_0002), SdoFault::AccessDenied(0x0601_0002));
    assert_eq!(SdoFault::from_abort(0x0602_0000), SdoFault::Rejected(0x0602_0000));
    assert!(SdoFault::Timeout.is_transient());
    assert!(SdoFault::Unreachable.is_transient());
    assert!(!SdoFault::Rejected(0).is_transient());
}

#[test]
fn test_sdo_wire_encoding() {
    assert_eq!(0x8000_0185u32.to_wire(), vec![0x85, 0x01, 0x00, 0x80]);
    assert_eq!(5u16.to_wire(), vec![5, 0]);
    assert_eq!(3u8.to_wire(), vec![3]);
}
