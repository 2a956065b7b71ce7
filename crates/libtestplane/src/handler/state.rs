//! Pure protocol state machine for the test host side.
//!
//! [`plan`] turns a decoded message into a [`Command`]; [`transition`] gives
//! the next [`HandlerState`]. Neither touches I/O, so the handler's
//! side effects live in one place and these rules are testable on their own.

use testplane_protocol::{
    AttachDebuggerAck, CodecError, DiscoveryCriteria, LaunchDebuggeeAck, Message, MessageType,
    TestRunCriteriaWithSources, TestRunCriteriaWithTests, deserialize_payload, negotiate_version,
};

use crate::engine::TestRun;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerState {
    Idle,
    Connecting,
    AwaitingVersionCheck,
    Negotiated,
    Processing,
    Paused,
    SessionEnded,
    /// Connecting failed. Terminal.
    Faulted,
}

impl HandlerState {
    pub fn is_terminal(self) -> bool {
        matches!(self, HandlerState::SessionEnded | HandlerState::Faulted)
    }
}

/// Inputs to version negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiationPolicy {
    pub highest_supported: u32,
    pub downgrade_disabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Negotiate { proposed: u32, version: u32 },
    InitializeDiscovery(Vec<String>),
    InitializeExecution(Vec<String>),
    StartDiscovery(DiscoveryCriteria),
    StartRun(TestRun),
    Cancel,
    Abort,
    LaunchCallback(LaunchDebuggeeAck),
    AttachCallback(AttachDebuggerAck),
    EndSession,
    Ignore { tag: String },
}

impl Command {
    /// Commands whose failure is handled as an abort of the run.
    pub fn aborts_on_failure(&self) -> bool {
        matches!(
            self,
            Command::Negotiate { .. }
                | Command::InitializeDiscovery(_)
                | Command::InitializeExecution(_)
                | Command::StartDiscovery(_)
                | Command::StartRun(_)
        )
    }
}

/// Connection-level and command-level events that move the state machine.
#[derive(Debug, Clone, Copy)]
pub enum Event<'a> {
    ConnectStarted,
    Connected,
    ConnectFailed,
    Command(&'a Command),
    ConnectionClosed,
}

pub fn transition(state: HandlerState, event: Event<'_>) -> HandlerState {
    if state.is_terminal() {
        return state;
    }

    match event {
        Event::ConnectStarted => HandlerState::Connecting,
        Event::Connected => HandlerState::AwaitingVersionCheck,
        Event::ConnectFailed => HandlerState::Faulted,
        Event::ConnectionClosed => HandlerState::SessionEnded,
        Event::Command(command) => match command {
            Command::Negotiate { .. } if state == HandlerState::AwaitingVersionCheck => {
                HandlerState::Negotiated
            }
            Command::StartDiscovery(_) | Command::StartRun(_) => HandlerState::Processing,
            Command::Cancel | Command::Abort => HandlerState::Paused,
            Command::EndSession => HandlerState::SessionEnded,
            Command::Negotiate { .. }
            | Command::InitializeDiscovery(_)
            | Command::InitializeExecution(_)
            | Command::LaunchCallback(_)
            | Command::AttachCallback(_)
            | Command::Ignore { .. } => state,
        },
    }
}

/// Decode a message into the command the handler should carry out.
///
/// Unknown tags and messages that only ever flow from host to controller are
/// ignored rather than rejected, so newer peers can add message types.
pub fn plan(message: &Message, policy: &NegotiationPolicy) -> Result<Command, CodecError> {
    let Some(kind) = message.kind() else {
        return Ok(Command::Ignore {
            tag: message.message_type.clone(),
        });
    };

    let command = match kind {
        MessageType::VersionCheck => {
            let proposed: u32 = deserialize_payload(message)?;
            let version = negotiate_version(
                proposed,
                policy.highest_supported,
                policy.downgrade_disabled,
            )?;
            Command::Negotiate { proposed, version }
        }
        MessageType::DiscoveryInitialize => {
            let paths: Option<Vec<String>> = deserialize_payload(message)?;
            Command::InitializeDiscovery(paths.unwrap_or_default())
        }
        MessageType::ExecutionInitialize => {
            let paths: Option<Vec<String>> = deserialize_payload(message)?;
            Command::InitializeExecution(paths.unwrap_or_default())
        }
        MessageType::StartDiscovery => Command::StartDiscovery(deserialize_payload(message)?),
        MessageType::StartTestExecutionWithSources => {
            let criteria: TestRunCriteriaWithSources = deserialize_payload(message)?;
            Command::StartRun(criteria.into())
        }
        MessageType::StartTestExecutionWithTests => {
            let criteria: TestRunCriteriaWithTests = deserialize_payload(message)?;
            Command::StartRun(criteria.into())
        }
        MessageType::CancelTestRun => Command::Cancel,
        MessageType::AbortTestRun => Command::Abort,
        MessageType::LaunchAdapterProcessWithDebuggerAttachedCallback => {
            Command::LaunchCallback(deserialize_payload(message)?)
        }
        MessageType::AttachDebuggerCallback => {
            Command::AttachCallback(deserialize_payload(message)?)
        }
        MessageType::SessionEnd => Command::EndSession,
        // Reserved.
        MessageType::SessionAbort
        | MessageType::TestCasesFound
        | MessageType::DiscoveryComplete
        | MessageType::TestRunStatsChange
        | MessageType::ExecutionComplete
        | MessageType::TestMessage
        | MessageType::LaunchAdapterProcessWithDebuggerAttached
        | MessageType::AttachDebugger => Command::Ignore {
            tag: message.message_type.clone(),
        },
    };
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const POLICY: NegotiationPolicy = NegotiationPolicy {
        highest_supported: 5,
        downgrade_disabled: false,
    };

    fn message(kind: MessageType, payload: serde_json::Value) -> Message {
        Message {
            message_type: kind.as_str().to_string(),
            version: 4,
            payload,
        }
    }

    #[test]
    fn connection_lifecycle() {
        let mut state = HandlerState::Idle;
        state = transition(state, Event::ConnectStarted);
        assert_eq!(state, HandlerState::Connecting);
        state = transition(state, Event::Connected);
        assert_eq!(state, HandlerState::AwaitingVersionCheck);
        state = transition(
            state,
            Event::Command(&Command::Negotiate {
                proposed: 5,
                version: 5,
            }),
        );
        assert_eq!(state, HandlerState::Negotiated);
        state = transition(state, Event::Command(&Command::InitializeExecution(vec![])));
        assert_eq!(state, HandlerState::Negotiated);
        state = transition(
            state,
            Event::Command(&Command::StartDiscovery(DiscoveryCriteria::default())),
        );
        assert_eq!(state, HandlerState::Processing);
        state = transition(state, Event::Command(&Command::Cancel));
        assert_eq!(state, HandlerState::Paused);
        state = transition(
            state,
            Event::Command(&Command::StartDiscovery(DiscoveryCriteria::default())),
        );
        assert_eq!(state, HandlerState::Processing);
        state = transition(state, Event::Command(&Command::EndSession));
        assert_eq!(state, HandlerState::SessionEnded);
    }

    #[test]
    fn only_the_first_version_check_negotiates() {
        let negotiate = Command::Negotiate {
            proposed: 1,
            version: 1,
        };
        assert_eq!(
            transition(HandlerState::Processing, Event::Command(&negotiate)),
            HandlerState::Processing
        );
        assert_eq!(
            transition(HandlerState::Negotiated, Event::Command(&negotiate)),
            HandlerState::Negotiated
        );
    }

    #[test]
    fn terminal_states_absorb_everything() {
        let faulted = transition(HandlerState::Connecting, Event::ConnectFailed);
        assert_eq!(faulted, HandlerState::Faulted);
        assert_eq!(
            transition(faulted, Event::Connected),
            HandlerState::Faulted
        );
        assert_eq!(
            transition(HandlerState::SessionEnded, Event::Command(&Command::Abort)),
            HandlerState::SessionEnded
        );
    }

    #[test]
    fn version_check_negotiates() {
        let command = plan(&message(MessageType::VersionCheck, json!(3)), &POLICY).unwrap();
        assert_eq!(
            command,
            Command::Negotiate {
                proposed: 3,
                version: 2
            }
        );
    }

    #[test]
    fn bad_version_payload_is_an_error() {
        assert!(plan(&message(MessageType::VersionCheck, json!("x")), &POLICY).is_err());
        assert!(plan(&message(MessageType::VersionCheck, json!(0)), &POLICY).is_err());
    }

    #[test]
    fn initialize_accepts_missing_paths() {
        let command = plan(&message(MessageType::DiscoveryInitialize, json!(null)), &POLICY)
            .unwrap();
        assert_eq!(command, Command::InitializeDiscovery(vec![]));

        let command = plan(
            &message(MessageType::ExecutionInitialize, json!(["a.so", "b.so"])),
            &POLICY,
        )
        .unwrap();
        assert_eq!(
            command,
            Command::InitializeExecution(vec!["a.so".to_string(), "b.so".to_string()])
        );
    }

    #[test]
    fn start_messages_become_runs() {
        let command = plan(
            &message(
                MessageType::StartTestExecutionWithTests,
                json!({"tests": [], "run_settings": "{}"}),
            ),
            &POLICY,
        )
        .unwrap();
        assert!(matches!(command, Command::StartRun(ref run) if run.run_settings == "{}"));
        assert!(command.aborts_on_failure());

        let err = plan(
            &message(MessageType::StartTestExecutionWithSources, json!([1, 2])),
            &POLICY,
        )
        .unwrap_err();
        assert!(err.to_string().contains("TestExecution.StartWithSources"));
    }

    #[test]
    fn unknown_and_outbound_messages_are_ignored() {
        let unknown = Message {
            message_type: "TestSession.FromTheFuture".to_string(),
            version: 9,
            payload: json!({}),
        };
        assert!(matches!(plan(&unknown, &POLICY).unwrap(), Command::Ignore { .. }));
        assert!(matches!(
            plan(&message(MessageType::SessionAbort, json!(null)), &POLICY).unwrap(),
            Command::Ignore { .. }
        ));
        assert!(matches!(
            plan(&message(MessageType::ExecutionComplete, json!({})), &POLICY).unwrap(),
            Command::Ignore { .. }
        ));
    }

    #[test]
    fn only_setup_commands_abort_on_failure() {
        assert!(!Command::Cancel.aborts_on_failure());
        assert!(!Command::Abort.aborts_on_failure());
        assert!(!Command::EndSession.aborts_on_failure());
        assert!(Command::InitializeDiscovery(vec![]).aborts_on_failure());
    }
}
