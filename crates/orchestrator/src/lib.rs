//! Domain Stream Orchestrator: the single entry point that turns a
//! validated `StreamRequest` for one panelist into a chunk stream with tool
//! calls resolved inline, still with no bundling and no persistence — those
//! are the Edge Session's job.

pub mod orchestrator;
pub mod registry;

pub use orchestrator::Orchestrator;
pub use registry::OrchestratorRegistry;
