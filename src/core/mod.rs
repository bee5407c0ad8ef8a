pub mod events;
pub mod ids;

pub use events::*;
