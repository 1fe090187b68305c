//! Session protocol state machine
//!
//! One tagged state per protocol phase, one transition function, every
//! invalid (state, event) pair rejected. Terminal states are never left:
//! once `Completed` or `Failed`, the session only awaits teardown.
//!
//! Jobs are strictly serialized: `Run` is only legal from `Started`, so a
//! second run arriving before the active job's terminal event is an
//! invalid transition, which the connection layer reports as a protocol
//! violation. That rejection is the per-session ordering guarantee.

use thiserror::Error;

/// Protocol phase of one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connection open, no start received
    Idle,
    /// Start acknowledged, replica assigned, no job in flight
    Started,
    /// A synthesis job is streaming
    RunningJob,
    /// Stop received mid-job; honored at the job's terminal event
    Stopping,
    /// Stop acknowledged, session torn down cleanly
    Completed,
    /// Terminal failure; resources released, nothing more accepted
    Failed,
}

/// Events that drive the machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Valid `StartSynthesis` accepted
    Start,
    /// Valid `RunSynthesis` accepted
    Run,
    /// `StopSynthesis` received
    Stop,
    /// Active job delivered all chunks
    JobCompleted,
    /// Active job failed, replica still usable
    JobFailedRecoverable,
    /// Active job failed and took the replica with it
    JobFailedFatal,
    /// Client went away or the idle sweep evicted the session
    Disconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{event:?} is not valid in state {state:?}")]
pub struct InvalidTransition {
    pub state: SessionState,
    pub event: SessionEvent,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Apply one event, returning the next state or rejecting the pair.
    pub fn apply(self, event: SessionEvent) -> Result<SessionState, InvalidTransition> {
        use SessionEvent::*;
        use SessionState::*;

        let next = match (self, event) {
            (Idle, Start) => Started,
            (Started, Run) => RunningJob,
            (Started, Stop) => Completed,
            (RunningJob, Stop) => Stopping,
            (RunningJob, JobCompleted) => Started,
            (RunningJob, JobFailedRecoverable) => Started,
            (RunningJob, JobFailedFatal) => Failed,
            // The stop was already latched; the job's terminal event now
            // resolves it.
            (Stopping, JobCompleted) => Completed,
            (Stopping, JobFailedRecoverable) => Completed,
            (Stopping, JobFailedFatal) => Failed,
            // Implicit stop from any live state.
            (Idle | Started | RunningJob | Stopping, Disconnect) => Completed,
            (state, event) => return Err(InvalidTransition { state, event }),
        };

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionEvent::*;
    use SessionState::*;

    const STATES: [SessionState; 6] = [Idle, Started, RunningJob, Stopping, Completed, Failed];
    const EVENTS: [SessionEvent; 7] = [
        Start,
        Run,
        Stop,
        JobCompleted,
        JobFailedRecoverable,
        JobFailedFatal,
        Disconnect,
    ];

    /// The complete transition table; everything absent is invalid.
    fn expected(state: SessionState, event: SessionEvent) -> Option<SessionState> {
        match (state, event) {
            (Idle, Start) => Some(Started),
            (Started, Run) => Some(RunningJob),
            (Started, Stop) => Some(Completed),
            (RunningJob, Stop) => Some(Stopping),
            (RunningJob, JobCompleted) => Some(Started),
            (RunningJob, JobFailedRecoverable) => Some(Started),
            (RunningJob, JobFailedFatal) => Some(Failed),
            (Stopping, JobCompleted) => Some(Completed),
            (Stopping, JobFailedRecoverable) => Some(Completed),
            (Stopping, JobFailedFatal) => Some(Failed),
            (Idle | Started | RunningJob | Stopping, Disconnect) => Some(Completed),
            _ => None,
        }
    }

    #[test]
    fn test_every_state_event_pair() {
        for state in STATES {
            for event in EVENTS {
                match expected(state, event) {
                    Some(next) => assert_eq!(
                        state.apply(event),
                        Ok(next),
                        "{:?} + {:?} should reach {:?}",
                        state,
                        event,
                        next
                    ),
                    None => assert!(
                        state.apply(event).is_err(),
                        "{:?} + {:?} should be rejected",
                        state,
                        event
                    ),
                }
            }
        }
    }

    #[test]
    fn test_terminal_states_accept_nothing() {
        for state in [Completed, Failed] {
            assert!(state.is_terminal());
            for event in EVENTS {
                assert!(state.apply(event).is_err());
            }
        }
    }

    #[test]
    fn test_run_while_running_is_rejected() {
        let state = Started.apply(Run).unwrap();
        assert_eq!(state, RunningJob);
        let err = state.apply(Run).unwrap_err();
        assert_eq!(err.state, RunningJob);
        assert_eq!(err.event, Run);
    }

    #[test]
    fn test_stop_mid_job_latches_until_terminal_event() {
        let state = Started.apply(Run).unwrap().apply(Stop).unwrap();
        assert_eq!(state, Stopping);
        // No new job may start while stopping.
        assert!(state.apply(Run).is_err());
        assert_eq!(state.apply(JobCompleted), Ok(Completed));
    }

    #[test]
    fn test_full_happy_path() {
        let mut state = Idle;
        for event in [Start, Run, JobCompleted, Run, JobCompleted, Stop] {
            state = state.apply(event).unwrap();
        }
        assert_eq!(state, Completed);
    }

    #[test]
    fn test_fatal_job_failure_ends_the_session() {
        let state = Started.apply(Run).unwrap();
        assert_eq!(state.apply(JobFailedFatal), Ok(Failed));
        // Recoverable failure keeps the session alive instead.
        assert_eq!(state.apply(JobFailedRecoverable), Ok(Started));
    }
}
