//! Built-in conversion tiers, in priority order: engine, canvas, remote,
//! markup.

pub mod canvas;
pub mod engine;
pub mod markup;
pub mod remote;

pub use canvas::CanvasBackend;
pub use engine::EngineBackend;
pub use markup::MarkupBackend;
pub use remote::RemoteBackend;
