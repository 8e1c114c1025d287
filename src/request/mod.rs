//! Request model: typed lifecycle phases, transitions, and the persisted
//! document form.

pub mod record;
pub mod transitions;
pub mod types;

pub use record::RequestRecord;
pub use transitions::FailOutcome;
pub use types::*;
