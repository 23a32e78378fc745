pub mod grid;
pub mod session;
pub mod status;

pub use grid::GridSpec;
pub use session::{ReviewSession, SessionEffect};
pub use status::{MediaSource, MediaStatus};
