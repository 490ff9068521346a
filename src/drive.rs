// Part of canopen-commission. Copyright 2024-2026 by the authors.
// This work is dual-licensed under Apache 2.0 and MIT terms.

//! Power state machine and jog motion of a CiA 402 drive.

/// Control word commands.
pub mod control_word {
    pub const DISABLE_VOLTAGE: u16 = 0x0000;
    pub const SHUTDOWN: u16 = 0x0006;
    pub const SWITCH_ON: u16 = 0x0007;
    pub const ENABLE_OPERATION: u16 = 0x000F;
}

/// Drive state decoded from the status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveState {
    NotReadyToSwitchOn,
    SwitchOnDisabled,
    ReadyToSwitchOn,
    SwitchedOn,
    OperationEnabled,
    QuickStopActive,
    FaultReactionActive,
    Fault,
    Unknown,
}

impl DriveState {
    pub fn from_status(status_word: u16) -> Self {
        match (status_word & 0x4F, status_word & 0x6F) {
            (0x00, _) => DriveState::NotReadyToSwitchOn,
            (0x40, _) => DriveState::SwitchOnDisabled,
            (0x0F, _) => DriveState::FaultReactionActive,
            (0x08, _) => DriveState::Fault,
            (_, 0x21) => DriveState::ReadyToSwitchOn,
            (_, 0x23) => DriveState::SwitchedOn,
            (_, 0x27) => DriveState::OperationEnabled,
            (_, 0x07) => DriveState::QuickStopActive,
            _ => DriveState::Unknown,
        }
    }

    pub const fn is_fault(self) -> bool {
        matches!(self, DriveState::Fault | DriveState::FaultReactionActive)
    }
}

/// Status word patterns and the command requested when they match, first
/// match wins.
const TRANSITIONS: [(u16, u16, u16); 3] = [
    (0x4F, 0x40, control_word::SHUTDOWN),
    (0x6F, 0x21, control_word::SWITCH_ON),
    (0x6F, 0x23, control_word::ENABLE_OPERATION),
];

const OPERATION_ENABLED: (u16, u16) = (0x6F, 0x27);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriveProfile {
    /// Target increment per enabled cycle.
    pub jog_step: i32,
    /// Counter value after which the drive is disabled.
    pub motion_cap: u32,
}

impl Default for DriveProfile {
    fn default() -> Self {
        Self {
            jog_step: 5,
            motion_cap: 2000,
        }
    }
}

/// Outputs of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub control_word: u16,
    pub target_position: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Run(Command),
    /// The drive reports a fault; the command disables it.
    Fault(Command, DriveState),
}

impl Step {
    pub const fn command(&self) -> Command {
        match *self {
            Step::Run(c) | Step::Fault(c, _) => c,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DriveStateMachine {
    profile: DriveProfile,
    control_word: u16,
    target_position: i32,
    counter: u32,
}

impl DriveStateMachine {
    pub fn new(profile: DriveProfile) -> Self {
        Self {
            profile,
            control_word: control_word::DISABLE_VOLTAGE,
            target_position: 0,
            counter: 0,
        }
    }

    /// Resume from the outputs currently in the process image.
    pub fn with_outputs(mut self, control_word: u16, target_position: i32) -> Self {
        self.control_word = control_word;
        self.target_position = target_position;
        self
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    pub fn control_word(&self) -> u16 {
        self.control_word
    }

    pub fn target_position(&self) -> i32 {
        self.target_position
    }

    /// Evaluate one elapsed cycle. Exactly one control word is produced;
    /// rules that request no transition keep the previous one.
    pub fn step(&mut self, status_word: u16, actual_position: i32) -> Step {
        let state = DriveState::from_status(status_word);
        if state.is_fault() {
            self.control_word = control_word::DISABLE_VOLTAGE;
            self.target_position = actual_position;
            return Step::Fault(self.command(), state);
        }

        let (control_word, target_position) = if self.counter > self.profile.motion_cap {
            self.counter += 1;
            (control_word::DISABLE_VOLTAGE, actual_position)
        } else if let Some(&(_, _, cw)) = TRANSITIONS
            .iter()
            .find(|(mask, value, _)| status_word & mask == *value)
        {
            (cw, actual_position)
        } else if status_word & OPERATION_ENABLED.0 == OPERATION_ENABLED.1 {
            self.counter += 1;
            (
                self.control_word,
                self.target_position.wrapping_add(self.profile.jog_step),
            )
        } else {
            (self.control_word, actual_position)
        };

        self.control_word = control_word;
        self.target_position = target_position;
        Step::Run(self.command())
    }

    fn command(&self) -> Command {
        Command {
            control_word: self.control_word,
            target_position: self.target_position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> DriveStateMachine {
        DriveStateMachine::new(DriveProfile::default())
    }

    #[test]
    fn decodes_states_with_irrelevant_bits_set() {
        assert_eq!(DriveState::from_status(0x0250), DriveState::SwitchOnDisabled);
        assert_eq!(DriveState::from_status(0x0231), DriveState::ReadyToSwitchOn);
        assert_eq!(DriveState::from_status(0x0233), DriveState::SwitchedOn);
        assert_eq!(DriveState::from_status(0x1637), DriveState::OperationEnabled);
        assert_eq!(DriveState::from_status(0x0217), DriveState::QuickStopActive);
        assert_eq!(DriveState::from_status(0x0218), DriveState::Fault);
        assert_eq!(DriveState::from_status(0x021F), DriveState::FaultReactionActive);
        assert_eq!(DriveState::from_status(0x0000), DriveState::NotReadyToSwitchOn);
    }

    #[test]
    fn power_up_sequence() {
        let mut m = machine();
        assert_eq!(m.step(0x0240, 100).command().control_word, 6);
        assert_eq!(m.step(0x0221, 100).command().control_word, 7);
        assert_eq!(m.step(0x0223, 100).command().control_word, 15);
        let cmd = m.step(0x0227, 100).command();
        assert_eq!(cmd.control_word, 15);
        assert_eq!(cmd.target_position, 105);
        assert_eq!(m.counter(), 1);
    }

    #[test]
    fn enabled_cycles_advance_target_and_counter() {
        let mut m = machine().with_outputs(15, -40);
        for k in 1..=2000 {
            let cmd = m.step(0x0237, 12345).command();
            assert_eq!(cmd.target_position, -40 + 5 * k as i32);
            assert_eq!(cmd.control_word, 15);
            assert_eq!(m.counter(), k);
        }
    }

    #[test]
    fn target_tracks_actual_until_enabled() {
        let mut m = machine();
        let positions = [0, 17, -3, 99_999, -2_000_000, 4];
        for (i, &pos) in positions.iter().cycle().take(60).enumerate() {
            let status = [0x0000, 0x0240, 0x0221, 0x0223, 0x0217][i % 5];
            assert_eq!(m.step(status, pos).command().target_position, pos);
        }
        assert_eq!(m.counter(), 0);
    }

    #[test]
    fn counter_past_cap_disables_the_drive() {
        let mut m = machine();
        for _ in 0..2001 {
            m.step(0x0237, 0);
        }
        assert_eq!(m.counter(), 2001);
        assert_eq!(m.control_word(), 0);
        for n in 1..=10 {
            let cmd = m.step(0x0237, 777).command();
            assert_eq!(cmd.control_word, 0);
            assert_eq!(cmd.target_position, 777);
            assert_eq!(m.counter(), 2001 + n);
        }
        // no re-enable once disabled
        assert_eq!(m.step(0x0240, 0).command().control_word, 0);
    }

    #[test]
    fn fault_is_terminal_step() {
        let mut m = machine().with_outputs(15, 50);
        match m.step(0x0218, 42) {
            Step::Fault(cmd, state) => {
                assert_eq!(state, DriveState::Fault);
                assert_eq!(cmd.control_word, 0);
                assert_eq!(cmd.target_position, 42);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
