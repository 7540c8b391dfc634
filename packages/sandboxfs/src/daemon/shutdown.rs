//! The shutdown/handover controller (C3, spec.md §4.3), modeled as a pure
//! reducer over events so it is testable without a real mount, timer, or
//! signal handler.

/// States of the daemon at rest (spec.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Jobs present, or the global (marker) reference counter is non-zero.
    Running,
    /// No jobs, no clients; the exit timer is armed for `linger_timeout`.
    IdleArmed,
    /// A child has been forked to attempt the platform unmount; `n` is the
    /// attempt number, starting at 1.
    UnmountTry(u32),
    /// Unmount succeeded but stale inherited descriptors keep the mount
    /// alive; the daemon has released its own lock so a successor may
    /// start.
    Linger,
    /// `MAX` unmount attempts failed; the daemon exits non-zero.
    Failed,
}

/// Events the reducer responds to. Timer and signal plumbing is kept
/// entirely outside this module (spec.md §9): callers translate whatever
/// timer/signal primitive they use into one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The last job was erased and the global counter became zero.
    WentIdle,
    /// A new client connected (bumped a reference counter) while idle.
    ClientConnected,
    /// The linger timer fired.
    LingerTimerFired,
    /// The unmount retry timer fired.
    RetryTimerFired,
    /// The forked unmount attempt reported the mount point is gone, but
    /// descriptors opened by the daemon are still in use.
    UnmountSucceededButBusy,
    /// The forked unmount attempt reported the mount point still exists.
    UnmountStillMounted,
    /// The forked unmount attempt reported full success (mount point gone
    /// and nothing keeps the daemon alive as a zombie).
    UnmountSucceeded,
}

/// Maximum number of unmount retry attempts before giving up (spec.md
/// §4.3).
pub const MAX_UNMOUNT_ATTEMPTS: u32 = 8;

/// Apply `event` to `state`, returning the next state. Returns `None` for
/// events that are impossible in a given state (a reducer bug upstream, not
/// a recoverable condition) rather than silently ignoring them.
pub fn transition(state: State, event: Event) -> Option<State> {
    use Event::*;
    use State::*;

    match (state, event) {
        (Running, WentIdle) => Some(IdleArmed),
        // A cancellation of the exit is permitted only while no unmount
        // attempt has yet been made (spec.md §4.3).
        (IdleArmed, ClientConnected) => Some(Running),
        (IdleArmed, LingerTimerFired) => Some(UnmountTry(1)),

        // Once an unmount has been attempted, exit is inevitable: new
        // clients during this window must observe the daemon as gone and
        // start a successor, not promote this daemon back to `Running`.
        (UnmountTry(_), ClientConnected) => None,
        (UnmountTry(n), UnmountStillMounted) if n < MAX_UNMOUNT_ATTEMPTS => {
            Some(UnmountTry(n + 1))
        }
        (UnmountTry(n), UnmountStillMounted) => {
            debug_assert_eq!(n, MAX_UNMOUNT_ATTEMPTS);
            Some(Failed)
        }
        (UnmountTry(_), UnmountSucceededButBusy) => Some(Linger),
        (UnmountTry(_), UnmountSucceeded) => Some(Linger),
        (UnmountTry(_), RetryTimerFired) => Some(state),

        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Event::*;
    use State::*;

    #[test]
    fn idle_arms_from_running() {
        assert_eq!(transition(Running, WentIdle), Some(IdleArmed));
    }

    #[test]
    fn client_connect_cancels_idle_timer_before_any_unmount_attempt() {
        assert_eq!(transition(IdleArmed, ClientConnected), Some(Running));
    }

    #[test]
    fn linger_timer_starts_first_unmount_attempt() {
        assert_eq!(transition(IdleArmed, LingerTimerFired), Some(UnmountTry(1)));
    }

    #[test]
    fn client_connect_during_unmount_attempt_cannot_cancel_exit() {
        // spec.md: "UNMOUNT_TRY_n -> RUNNING is impossible"
        assert_eq!(transition(UnmountTry(3), ClientConnected), None);
    }

    #[test]
    fn still_mounted_retries_up_to_max_attempts() {
        assert_eq!(
            transition(UnmountTry(1), UnmountStillMounted),
            Some(UnmountTry(2))
        );
        assert_eq!(
            transition(UnmountTry(MAX_UNMOUNT_ATTEMPTS - 1), UnmountStillMounted),
            Some(UnmountTry(MAX_UNMOUNT_ATTEMPTS))
        );
    }

    #[test]
    fn exhausting_retries_fails() {
        assert_eq!(
            transition(UnmountTry(MAX_UNMOUNT_ATTEMPTS), UnmountStillMounted),
            Some(Failed)
        );
    }

    #[test]
    fn successful_unmount_with_busy_descriptors_lingers() {
        assert_eq!(
            transition(UnmountTry(2), UnmountSucceededButBusy),
            Some(Linger)
        );
    }

    #[test]
    fn successful_unmount_lingers() {
        assert_eq!(transition(UnmountTry(1), UnmountSucceeded), Some(Linger));
    }

    #[test]
    fn full_unmount_retry_sequence_reaches_linger() {
        let mut state = Running;
        state = transition(state, WentIdle).unwrap();
        state = transition(state, LingerTimerFired).unwrap();
        state = transition(state, UnmountStillMounted).unwrap();
        state = transition(state, UnmountStillMounted).unwrap();
        state = transition(state, UnmountSucceeded).unwrap();
        assert_eq!(state, Linger);
    }
}
