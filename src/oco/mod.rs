pub mod monitor;
pub mod supervisor;

pub use monitor::PositionMonitor;
pub use supervisor::{
    ClosedPosition, ExitKind, OcoSupervisor, OverExit, SupervisorHandle, SupervisorState,
};
