// Part of canopen-commission. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Commissioning and cyclic control of CANopen drives from the master side.
//!
//! A run resets the network, scans it for slaves and reads their identity,
//! sets up heartbeat, SYNC and the PDOs carrying a CiA 402 drive's command
//! and feedback, and mirrors that setup in the master's own object
//! dictionary. The network is then switched to operational and a fixed
//! cadence loop powers the drive up and jogs it. Finally the slaves are
//! released again.
//!
//! The CANopen stack itself is consumed through the [`Bus`] and [`Network`]
//! traits; [`sim`] provides a simulated bus. The entry points are
//! [`commission`] and [`slaveinfo`].

mod config;
mod configure;
mod control;
mod convert;
mod cycle;
mod diag;
mod discovery;
mod drive;
mod image;
mod master;
mod session;
pub mod sim;
mod teardown;
mod transport;
mod types;

pub use self::{
    config::{
        CommissionBuilder, CommissionConfig, CycleConfig, Pacing, PdoDescriptor, RetryPolicy,
        SlaveDescriptor,
    },
    configure::{
        configure_local_pdo, configure_remote_pdo, suppress_unused, ConfiguredSlave,
        ServiceConfigurator,
    },
    control::{ControlLoop, LoopOutcome},
    cycle::{
        Clock, Deadline, ManualClock, MonotonicClock, PollingInterval, Schedule, Tick,
        TimerChannel,
    },
    diag::{CycleRecord, Diagnostics, LogDiagnostics, Recorder},
    discovery::{
        discover, fetch_identity, scan_nodes, IdentityField, NodeScan, SlaveIdentity, SlaveNode,
        IDENTITY_BUF_LEN,
    },
    drive::{control_word, Command, DriveProfile, DriveState, DriveStateMachine, Step},
    image::{
        check_length, check_pairing, DataType, Field, LocalDictionary, MappingError, PdoLayout,
        ProcessImage, ProcessVariable, Snapshot, PDO_MAX_BITS,
    },
    master::Master,
    session::{commission, slaveinfo, Report},
    teardown::Teardown,
    transport::{Bus, NetConfig, Network},
    types::*,
};
