// # Orchestration
//
// The composition root: constructs every component in dependency order,
// enforces startup/shutdown ordering, supervises reconnects, and exposes
// the small operation surface the external UI/CLI composes.

pub mod orchestrator;
pub mod supervisor;

pub use orchestrator::{CoreConfig, Orchestrator};
pub use supervisor::ReconnectSupervisor;
