/// Result of running one action, as seen by the enclosing screen loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionOutcome {
    /// Success; think time applies before the next action
    Continue,
    /// Nothing to do; the next action follows without think time
    NoOpContinue,
    /// Recoverable error, already logged
    HandledError,
    /// Leave the current screen and let the parent pick another
    LeaveScreen,
    /// Hand control to the named action of the enclosing hub
    JumpToScreen(&'static str),
    /// End this iteration and pause
    Suspend,
    /// Stop this VU for the rest of the test
    FatalAbort,
    /// Ramp-down ended the loop
    Finished,
}

impl ActionOutcome {
    /// Outcomes that end the current screen's loop.
    pub fn leaves_screen(self) -> bool {
        matches!(
            self,
            Self::LeaveScreen
                | Self::JumpToScreen(_)
                | Self::Suspend
                | Self::FatalAbort
                | Self::Finished
        )
    }

    /// Outcomes that end the VU's current iteration.
    pub fn exits_iteration(self) -> bool {
        matches!(self, Self::Suspend | Self::FatalAbort | Self::Finished)
    }

    pub fn skips_think_time(self) -> bool {
        self == Self::NoOpContinue
    }
}
