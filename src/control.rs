// Part of canopen-commission. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

use crate::{
    cycle::Schedule,
    diag::{CycleRecord, Diagnostics},
    drive::{DriveState, DriveStateMachine, Step},
    image::ProcessImage,
};

/// How the control loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// The iteration budget was used up.
    Completed { cycles: u32, counter: u32 },
    /// The drive reported a fault in cycle `cycles`.
    Faulted {
        cycles: u32,
        status_word: u16,
        state: DriveState,
    },
}

/// Runs the drive state machine once per elapsed deadline.
pub struct ControlLoop<'a, S> {
    schedule: S,
    image: &'a ProcessImage,
    machine: DriveStateMachine,
    budget: u32,
}

impl<'a, S: Schedule> ControlLoop<'a, S> {
    /// The machine continues from the outputs already in the image.
    pub fn new(
        schedule: S,
        image: &'a ProcessImage,
        machine: DriveStateMachine,
        budget: u32,
    ) -> Self {
        let snap = image.snapshot();
        Self {
            schedule,
            image,
            machine: machine.with_outputs(snap.control_word, snap.target_position),
            budget,
        }
    }

    pub fn machine(&self) -> &DriveStateMachine {
        &self.machine
    }

    pub fn run(&mut self, diag: &mut dyn Diagnostics) -> LoopOutcome {
        log::info!("Control loop started, {} cycles", self.budget);
        for cycle in 1..=self.budget {
            let at = self.schedule.wait();
            let snap = self.image.snapshot();
            let step = self.machine.step(snap.status_word, snap.actual_position);
            let cmd = step.command();
            self.image.command(cmd.control_word, cmd.target_position);
            diag.cycle(&CycleRecord {
                at,
                status_word: snap.status_word,
                actual_position: snap.actual_position,
                actual_torque: snap.actual_torque,
                control_word: cmd.control_word,
                target_position: cmd.target_position,
                counter: self.machine.counter(),
            });
            if let Step::Fault(_, state) = step {
                log::error!(
                    "Drive fault in cycle {}: status word 0x{:04X} ({:?})",
                    cycle,
                    snap.status_word,
                    state
                );
                return LoopOutcome::Faulted {
                    cycles: cycle,
                    status_word: snap.status_word,
                    state,
                };
            }
        }
        LoopOutcome::Completed {
            cycles: self.budget,
            counter: self.machine.counter(),
        }
    }
}
