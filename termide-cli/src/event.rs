use crossterm::event::Event as TermEvent;
use termide_core::{Assistant, ReviewRequest, StreamEvent, TurnOutcome};

/// Returned by the spawned turn so the main loop can reclaim the assistant.
pub struct TurnResult {
    pub assistant: Assistant,
    pub outcome: TurnOutcome,
}

/// Unified event type for the main loop.
pub enum AppEvent {
    Terminal(TermEvent),
    /// Streaming output of the turn in flight.
    Stream(StreamEvent),
    /// A proposed change waiting for y/n.
    Review(ReviewRequest),
    /// Sent after the last `Stream` event of the turn.
    TurnDone(Box<TurnResult>),
    Tick,
    Quit,
}
