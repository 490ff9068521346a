// Part of canopen-commission. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! The process image shared between the transport's receive path and the
//! control loop, and the registry resolving PDO mapping entries onto it.
//!
//! Every field lives in its own atomic and has exactly one writer: the
//! transport stores the feedback fields decoded from received PDOs, the
//! control loop stores the command fields. Mapped values are copied through
//! [`PdoLayout`], never by overlaying the received bytes onto the record.

use crate::types::*;
use byteorder::{ByteOrder, LittleEndian as LE};
use derive_new::new;
use std::sync::{
    atomic::{AtomicI16, AtomicI32, AtomicU16, Ordering},
    Arc,
};
use thiserror::Error;

/// Largest payload of a classic CAN frame.
pub const PDO_MAX_BITS: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("object {0} is not a process variable")]
    UnknownObject(ObjectAddress),
    #[error("object {addr} has {expected} bits, mapping says {found}")]
    LengthMismatch {
        addr: ObjectAddress,
        expected: u8,
        found: u8,
    },
    #[error("mapping needs {0} bits, a PDO carries at most 64")]
    TooLong(u32),
    #[error("local entry {local} ({local_bits} bits) does not match remote entry {remote} ({remote_bits} bits)")]
    Pairing {
        local: ObjectAddress,
        local_bits: u8,
        remote: ObjectAddress,
        remote_bits: u8,
    },
    #[error("local mapping has {local} entries, remote mapping has {remote}")]
    EntryCount { local: usize, remote: usize },
    #[error("payload has {found} bytes, layout needs {expected}")]
    ShortPayload { expected: usize, found: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Unsigned16,
    Integer16,
    Integer32,
}

impl DataType {
    pub const fn bit_len(self) -> u8 {
        match self {
            DataType::Unsigned16 | DataType::Integer16 => 16,
            DataType::Integer32 => 32,
        }
    }

    pub const fn byte_len(self) -> usize {
        self.bit_len() as usize / 8
    }
}

/// A variable of the process image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    StatusWord,
    ActualPosition,
    ActualTorque,
    ControlWord,
    TargetPosition,
}

impl Field {
    pub const fn data_type(self) -> DataType {
        match self {
            Field::StatusWord | Field::ControlWord => DataType::Unsigned16,
            Field::ActualTorque => DataType::Integer16,
            Field::ActualPosition | Field::TargetPosition => DataType::Integer32,
        }
    }

    /// Written by the receive path.
    pub const fn is_feedback(self) -> bool {
        matches!(
            self,
            Field::StatusWord | Field::ActualPosition | Field::ActualTorque
        )
    }
}

#[derive(Debug, Default)]
pub struct ProcessImage {
    status_word: AtomicU16,
    actual_position: AtomicI32,
    actual_torque: AtomicI16,
    control_word: AtomicU16,
    target_position: AtomicI32,
}

/// A copy of all variables taken at the start of a control cycle.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub status_word: u16,
    pub actual_position: i32,
    pub actual_torque: i16,
    pub control_word: u16,
    pub target_position: i32,
}

impl ProcessImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            status_word: self.status_word.load(Ordering::Acquire),
            actual_position: self.actual_position.load(Ordering::Acquire),
            actual_torque: self.actual_torque.load(Ordering::Acquire),
            control_word: self.control_word.load(Ordering::Acquire),
            target_position: self.target_position.load(Ordering::Acquire),
        }
    }

    /// Store the outputs of a control cycle.
    pub fn command(&self, control_word: u16, target_position: i32) {
        self.control_word.store(control_word, Ordering::Release);
        self.target_position.store(target_position, Ordering::Release);
    }

    /// Store received feedback values.
    pub fn feedback(&self, status_word: u16, actual_position: i32, actual_torque: i16) {
        self.status_word.store(status_word, Ordering::Release);
        self.actual_position.store(actual_position, Ordering::Release);
        self.actual_torque.store(actual_torque, Ordering::Release);
    }

    /// Raw little endian bit pattern of `field`, widened to 32 bits.
    pub fn load_raw(&self, field: Field) -> u32 {
        match field {
            Field::StatusWord => u32::from(self.status_word.load(Ordering::Acquire)),
            Field::ActualPosition => self.actual_position.load(Ordering::Acquire) as u32,
            Field::ActualTorque => self.actual_torque.load(Ordering::Acquire) as u16 as u32,
            Field::ControlWord => u32::from(self.control_word.load(Ordering::Acquire)),
            Field::TargetPosition => self.target_position.load(Ordering::Acquire) as u32,
        }
    }

    pub fn store_raw(&self, field: Field, raw: u32) {
        match field {
            Field::StatusWord => self.status_word.store(raw as u16, Ordering::Release),
            Field::ActualPosition => self.actual_position.store(raw as i32, Ordering::Release),
            Field::ActualTorque => self.actual_torque.store(raw as u16 as i16, Ordering::Release),
            Field::ControlWord => self.control_word.store(raw as u16, Ordering::Release),
            Field::TargetPosition => self.target_position.store(raw as i32, Ordering::Release),
        }
    }
}

/// Binds a local object dictionary entry to a process image field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, new)]
pub struct ProcessVariable {
    pub addr: ObjectAddress,
    pub field: Field,
}

/// Descriptor of the master's own object dictionary, handed to the transport
/// at network init.
#[derive(Debug, Clone)]
pub struct LocalDictionary {
    templates: Vec<u16>,
    variables: Vec<ProcessVariable>,
    image: Arc<ProcessImage>,
}

impl LocalDictionary {
    pub fn new(image: Arc<ProcessImage>) -> Self {
        Self {
            templates: vec![],
            variables: vec![],
            image,
        }
    }

    /// SYNC parameters and the PDO communication objects of all four
    /// channels in both directions, plus the five drive variables in the
    /// manufacturer area.
    pub fn standard(image: Arc<ProcessImage>) -> Self {
        let mut dict = Self::new(image).with_template(0x1005).with_template(0x1006);
        for num in 0..PdoChannel::COUNT {
            dict = dict
                .with_template(PdoChannel::new(PdoKind::Rx, num).comm_index())
                .with_template(PdoChannel::new(PdoKind::Tx, num).comm_index());
        }
        dict.with_variable(ObjectAddress::new(0x7000, 0), Field::StatusWord)
            .with_variable(ObjectAddress::new(0x7100, 0), Field::ActualPosition)
            .with_variable(ObjectAddress::new(0x7200, 0), Field::ActualTorque)
            .with_variable(ObjectAddress::new(0x8000, 0), Field::ControlWord)
            .with_variable(ObjectAddress::new(0x8100, 0), Field::TargetPosition)
    }

    /// Register an empty communication object restored to defaults before use.
    pub fn with_template(mut self, index: u16) -> Self {
        self.templates.push(index);
        self
    }

    pub fn with_variable(mut self, addr: ObjectAddress, field: Field) -> Self {
        self.variables.push(ProcessVariable::new(addr, field));
        self
    }

    pub fn templates(&self) -> &[u16] {
        &self.templates
    }

    pub fn variables(&self) -> &[ProcessVariable] {
        &self.variables
    }

    pub fn image(&self) -> &Arc<ProcessImage> {
        &self.image
    }

    pub fn lookup(&self, addr: ObjectAddress) -> Option<Field> {
        self.variables
            .iter()
            .find(|v| v.addr == addr)
            .map(|v| v.field)
    }

    /// Resolve mapping entries into byte slots of a PDO payload.
    pub fn resolve(&self, entries: &[PdoMappingEntry]) -> Result<PdoLayout, MappingError> {
        check_length(entries)?;
        let mut slots = Vec::with_capacity(entries.len());
        let mut offset = 0;
        for entry in entries {
            let field = self
                .lookup(entry.addr)
                .ok_or(MappingError::UnknownObject(entry.addr))?;
            let ty = field.data_type();
            if ty.bit_len() != entry.bit_len {
                return Err(MappingError::LengthMismatch {
                    addr: entry.addr,
                    expected: ty.bit_len(),
                    found: entry.bit_len,
                });
            }
            slots.push(Slot { field, offset });
            offset += ty.byte_len();
        }
        Ok(PdoLayout { slots, size: offset })
    }
}

/// Total length check of a single PDO mapping.
pub fn check_length(entries: &[PdoMappingEntry]) -> Result<(), MappingError> {
    let bits: u32 = entries.iter().map(|e| u32::from(e.bit_len)).sum();
    if bits > PDO_MAX_BITS {
        return Err(MappingError::TooLong(bits));
    }
    Ok(())
}

/// Both ends of a PDO must agree entry by entry on the bit lengths.
pub fn check_pairing(
    local: &[PdoMappingEntry],
    remote: &[PdoMappingEntry],
) -> Result<(), MappingError> {
    check_length(remote)?;
    if local.len() != remote.len() {
        return Err(MappingError::EntryCount {
            local: local.len(),
            remote: remote.len(),
        });
    }
    for (l, r) in local.iter().zip(remote) {
        if l.bit_len != r.bit_len {
            return Err(MappingError::Pairing {
                local: l.addr,
                local_bits: l.bit_len,
                remote: r.addr,
                remote_bits: r.bit_len,
            });
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Slot {
    field: Field,
    offset: usize,
}

/// Validated placement of process variables inside one PDO payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PdoLayout {
    slots: Vec<Slot>,
    size: usize,
}

impl PdoLayout {
    /// Payload size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn fields(&self) -> impl Iterator<Item = (Field, usize)> + '_ {
        self.slots.iter().map(|s| (s.field, s.offset))
    }

    /// Copy a received payload into the image.
    pub fn decode(&self, payload: &[u8], image: &ProcessImage) -> Result<(), MappingError> {
        if payload.len() < self.size {
            return Err(MappingError::ShortPayload {
                expected: self.size,
                found: payload.len(),
            });
        }
        for slot in &self.slots {
            let bytes = &payload[slot.offset..];
            let raw = match slot.field.data_type() {
                DataType::Unsigned16 | DataType::Integer16 => u32::from(LE::read_u16(bytes)),
                DataType::Integer32 => LE::read_u32(bytes),
            };
            image.store_raw(slot.field, raw);
        }
        Ok(())
    }

    /// Fill `buf` from the image, returns the payload length.
    pub fn encode(&self, image: &ProcessImage, buf: &mut [u8; 8]) -> usize {
        for slot in &self.slots {
            let raw = image.load_raw(slot.field);
            let bytes = &mut buf[slot.offset..];
            match slot.field.data_type() {
                DataType::Unsigned16 | DataType::Integer16 => LE::write_u16(bytes, raw as u16),
                DataType::Integer32 => LE::write_u32(bytes, raw),
            }
        }
        self.size
    }
}

#[cfg(test)]
fn entry(index: u16, bits: u8) -> PdoMappingEntry {
    PdoMappingEntry::new(ObjectAddress::new(index, 0), bits)
}

#[test]
fn test_resolve_feedback_layout() {
    let dict = LocalDictionary::standard(Arc::new(ProcessImage::new()));
    let layout = dict
        .resolve(&[entry(0x7000, 16), entry(0x7100, 32), entry(0x7200, 16)])
        .unwrap();
    assert_eq!(layout.size(), 8);
    let fields: Vec<_> = layout.fields().collect();
    assert_eq!(
        fields,
        vec![
            (Field::StatusWord, 0),
            (Field::ActualPosition, 2),
            (Field::ActualTorque, 6)
        ]
    );
}

#[test]
fn test_resolve_rejects_bad_mappings() {
    let dict = LocalDictionary::standard(Arc::new(ProcessImage::new()));
    assert_eq!(
        dict.resolve(&[entry(0x7000, 32)]),
        Err(MappingError::LengthMismatch {
            addr: ObjectAddress::new(0x7000, 0),
            expected: 16,
            found: 32
        })
    );
    assert_eq!(
        dict.resolve(&[entry(0x6000, 16)]),
        Err(MappingError::UnknownObject(ObjectAddress::new(0x6000, 0)))
    );
    assert_eq!(
        dict.resolve(&[entry(0x7100, 32), entry(0x8100, 32), entry(0x7000, 16)]),
        Err(MappingError::TooLong(80))
    );
}

#[test]
fn test_decode_and_encode_through_layout() {
    let image = ProcessImage::new();
    let dict = LocalDictionary::standard(Arc::new(ProcessImage::new()));
    let feedback = dict
        .resolve(&[entry(0x7000, 16), entry(0x7100, 32), entry(0x7200, 16)])
        .unwrap();
    let payload = [0x37, 0x02, 0xFE, 0xFF, 0xFF, 0xFF, 0x10, 0x80];
    feedback.decode(&payload, &image).unwrap();
    let snap = image.snapshot();
    assert_eq!(snap.status_word, 0x0237);
    assert_eq!(snap.actual_position, -2);
    assert_eq!(snap.actual_torque, -32752);

    assert_eq!(
        feedback.decode(&payload[..4], &image),
        Err(MappingError::ShortPayload {
            expected: 8,
            found: 4
        })
    );

    let command = dict
        .resolve(&[entry(0x8000, 16), entry(0x8100, 32)])
        .unwrap();
    image.command(0x000F, -5);
    let mut buf = [0u8; 8];
    assert_eq!(command.encode(&image, &mut buf), 6);
    assert_eq!(&buf[..6], &[0x0F, 0x00, 0xFB, 0xFF, 0xFF, 0xFF]);
}

#[test]
fn test_pairing_checks() {
    let local = [entry(0x7000, 16), entry(0x7100, 32)];
    let remote = [entry(0x6041, 16), entry(0x6064, 32)];
    assert!(check_pairing(&local, &remote).is_ok());
    assert!(matches!(
        check_pairing(&local, &remote[..1]),
        Err(MappingError::EntryCount { local: 2, remote: 1 })
    ));
    assert!(matches!(
        check_pairing(&local, &[entry(0x6041, 16), entry(0x6077, 16)]),
        Err(MappingError::Pairing { .. })
    ));
}
