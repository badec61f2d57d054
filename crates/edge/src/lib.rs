//! Edge Session, Token Bundler, and Fair Merger — the three stages that sit
//! between the Domain Stream Orchestrator(s) and the outside world.

pub mod bundler;
pub mod merger;
pub mod session;
pub mod sse;

pub use bundler::TokenBundler;
pub use merger::FairMerger;
pub use session::{EdgeSession, SessionHandle};

use std::pin::Pin;

use futures::Stream;
use panelstream_core::DomainChunk;

/// The common stream alias passed between every stage in this crate.
pub type ChunkStream = Pin<Box<dyn Stream<Item = DomainChunk> + Send>>;
