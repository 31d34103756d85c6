//! The matcher converts an unordered stream of per-object upload events
//! into one match message per complete, self-consistent submission. State
//! is durable, so re-uploads and restarts are handled without replaying
//! the output exchange.

mod matcher;
mod state;

pub use matcher::{Action, MatchError, Matcher, RecordIndex};
pub use state::{StateError, StateStore, Submission};
