// interlinq: agent-to-agent messaging substrate.
//
// Facade crate: re-exports the workspace members under short module names
// and hosts the end-to-end integration suites in tests/integration/.

pub use il_crypto as crypto;
pub use il_middleware as middleware;
pub use il_pipeline as pipeline;
pub use il_protocol as protocol;
pub use il_session as session;
pub use il_transport as transport;
