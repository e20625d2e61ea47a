//! Component lifecycle states and the fixed transition table.
//!
//! The table is data, not dispatch: each lifecycle command names the states
//! it may be issued from and the state it leads to. The internal fault
//! signal is not a command and is always allowed; it is handled by the
//! state machine itself, not by this table.

use serde::{Deserialize, Serialize};

/// The externally visible lifecycle state of a component.
///
/// Wire values match the summaryState event enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum SummaryState {
    Disabled = 1,
    Enabled = 2,
    Fault = 3,
    Offline = 4,
    Standby = 5,
}

impl SummaryState {
    pub fn wire(&self) -> i32 {
        *self as i32
    }

    pub fn from_wire(value: i32) -> Option<SummaryState> {
        match value {
            1 => Some(SummaryState::Disabled),
            2 => Some(SummaryState::Enabled),
            3 => Some(SummaryState::Fault),
            4 => Some(SummaryState::Offline),
            5 => Some(SummaryState::Standby),
            _ => None,
        }
    }
}

impl std::fmt::Display for SummaryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SummaryState::Disabled => "DISABLED",
            SummaryState::Enabled => "ENABLED",
            SummaryState::Fault => "FAULT",
            SummaryState::Offline => "OFFLINE",
            SummaryState::Standby => "STANDBY",
        };
        f.write_str(name)
    }
}

/// The lifecycle transition commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateCommand {
    EnterControl,
    Start,
    Enable,
    Disable,
    Standby,
    ExitControl,
}

impl StateCommand {
    /// The command topic name.
    pub fn name(&self) -> &'static str {
        match self {
            StateCommand::EnterControl => "enterControl",
            StateCommand::Start => "start",
            StateCommand::Enable => "enable",
            StateCommand::Disable => "disable",
            StateCommand::Standby => "standby",
            StateCommand::ExitControl => "exitControl",
        }
    }

    pub const ALL: [StateCommand; 6] = [
        StateCommand::EnterControl,
        StateCommand::Start,
        StateCommand::Enable,
        StateCommand::Disable,
        StateCommand::Standby,
        StateCommand::ExitControl,
    ];
}

impl std::fmt::Display for StateCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One row of the transition table.
#[derive(Debug, Clone, Copy)]
pub struct Transition {
    /// States the command may be issued from.
    pub allowed: &'static [SummaryState],
    /// State the component settles in when the transition succeeds.
    pub to: SummaryState,
}

impl Transition {
    pub fn permits(&self, current: SummaryState) -> bool {
        self.allowed.contains(&current)
    }
}

/// Look up the transition for a lifecycle command.
pub fn transition(command: StateCommand) -> Transition {
    match command {
        StateCommand::EnterControl => Transition {
            allowed: &[SummaryState::Offline],
            to: SummaryState::Standby,
        },
        StateCommand::Start => Transition {
            allowed: &[SummaryState::Standby],
            to: SummaryState::Disabled,
        },
        StateCommand::Enable => Transition {
            allowed: &[SummaryState::Disabled],
            to: SummaryState::Enabled,
        },
        StateCommand::Disable => Transition {
            allowed: &[SummaryState::Enabled],
            to: SummaryState::Disabled,
        },
        StateCommand::Standby => Transition {
            allowed: &[SummaryState::Disabled, SummaryState::Fault],
            to: SummaryState::Standby,
        },
        StateCommand::ExitControl => Transition {
            allowed: &[SummaryState::Standby],
            to: SummaryState::Offline,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_matches_lifecycle() {
        assert!(transition(StateCommand::Start).permits(SummaryState::Standby));
        assert_eq!(transition(StateCommand::Start).to, SummaryState::Disabled);

        assert!(transition(StateCommand::Enable).permits(SummaryState::Disabled));
        assert_eq!(transition(StateCommand::Enable).to, SummaryState::Enabled);

        assert!(transition(StateCommand::Disable).permits(SummaryState::Enabled));
        assert_eq!(transition(StateCommand::Disable).to, SummaryState::Disabled);

        assert!(transition(StateCommand::Standby).permits(SummaryState::Disabled));
        assert!(transition(StateCommand::Standby).permits(SummaryState::Fault));
        assert_eq!(transition(StateCommand::Standby).to, SummaryState::Standby);

        assert!(transition(StateCommand::EnterControl).permits(SummaryState::Offline));
        assert!(transition(StateCommand::ExitControl).permits(SummaryState::Standby));
    }

    #[test]
    fn wrong_current_state_is_rejected() {
        // "start" while ENABLED must not be permitted (scenario B).
        assert!(!transition(StateCommand::Start).permits(SummaryState::Enabled));
        assert!(!transition(StateCommand::Enable).permits(SummaryState::Enabled));
        assert!(!transition(StateCommand::Standby).permits(SummaryState::Enabled));
    }

    #[test]
    fn wire_values_round_trip() {
        for state in [
            SummaryState::Disabled,
            SummaryState::Enabled,
            SummaryState::Fault,
            SummaryState::Offline,
            SummaryState::Standby,
        ] {
            assert_eq!(SummaryState::from_wire(state.wire()), Some(state));
        }
        assert_eq!(SummaryState::from_wire(0), None);
    }
}
