// Part of canopen-commission. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Textual diagnostics of a run: identity lines and one record per cycle.

use crate::{cycle::Tick, discovery::IdentityField, types::NodeId};
use std::fmt;

/// State of the process image after one evaluated cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleRecord {
    pub at: Tick,
    pub status_word: u16,
    pub actual_position: i32,
    pub actual_torque: i16,
    pub control_word: u16,
    pub target_position: i32,
    pub counter: u32,
}

impl fmt::Display for CycleRecord {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}: {:04x}, {}, {} | {:04x}, {} | {}",
            self.at,
            self.status_word,
            self.actual_position,
            self.actual_torque,
            self.control_word,
            self.target_position,
            self.counter
        )
    }
}

pub trait Diagnostics {
    fn identity(&mut self, node: NodeId, field: IdentityField, text: &str);
    fn cycle(&mut self, record: &CycleRecord);
}

/// Writes diagnostics through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogDiagnostics;

impl Diagnostics for LogDiagnostics {
    fn identity(&mut self, node: NodeId, _field: IdentityField, text: &str) {
        log::info!("({}) {}", node, text);
    }

    fn cycle(&mut self, record: &CycleRecord) {
        log::info!("{}", record);
    }
}

/// Keeps everything for later inspection.
#[derive(Debug, Default, Clone)]
pub struct Recorder {
    pub identities: Vec<(NodeId, IdentityField, String)>,
    pub cycles: Vec<CycleRecord>,
}

impl Diagnostics for Recorder {
    fn identity(&mut self, node: NodeId, field: IdentityField, text: &str) {
        self.identities.push((node, field, text.to_owned()));
    }

    fn cycle(&mut self, record: &CycleRecord) {
        self.cycles.push(*record);
    }
}

#[test]
fn test_cycle_record_line() {
    let record = CycleRecord {
        at: Tick(3_002_000),
        status_word: 0x0237,
        actual_position: -12,
        actual_torque: 40,
        control_word: 0x000f,
        target_position: -7,
        counter: 9,
    };
    assert_eq!(record.to_string(), "3.002000: 0237, -12, 40 | 000f, -7 | 9");
}
