//! Length-delimited framed transport over a split async stream, plus a
//! typed overlay that turns decoded [`ControlMessage`]s into posted
//! [`ControlEvent`]s consumed by a single coordinator task.

mod messenger;
mod overlay;

pub use messenger::{Messenger, MessengerError};
pub use overlay::{ControlEvent, ControlOverlay};
