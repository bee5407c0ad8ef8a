pub mod alerts;

pub use alerts::{Alert, AlertKind, AlertLevel, AlertSink};
