// il-pipeline: Message processing pipeline and peer connection management.
//
// The handler owns the per-session priority queues, the pending-reply table,
// and the agent routing table; the connection manager owns the per-peer
// connection state.  Both talk to the transport through the `Transport`
// trait object, wired together at construction time — no component holds a
// back-reference to another.

pub mod connection;
pub mod handler;

pub use connection::{
    ConnectionConfig, ConnectionError, ConnectionInfo, ConnectionManager, ConnectionStatus,
};
pub use handler::{
    CommandHandler, HandlerStats, MessageHandler, PipelineConfig, PipelineError, command_fn,
};

use std::sync::Arc;

/// Wire the transport's inbound upcall into a message handler and,
/// optionally, a connection manager's liveness tracking.
///
/// Every received payload goes through `MessageHandler::receive_message`
/// with the given encryption expectation; each successfully decoded message
/// additionally bumps `last_seen` for its sender.
pub fn wire_inbound(
    handler: &Arc<MessageHandler>,
    connections: Option<&Arc<ConnectionManager>>,
    encrypted: bool,
) {
    if let Some(connections) = connections {
        let connections = Arc::clone(connections);
        handler.set_activity_observer(Arc::new(move |agent_id: &str| {
            connections.update_last_seen(agent_id);
        }));
    }
    let pipeline = Arc::clone(handler);
    handler
        .transport()
        .set_message_handler(il_transport::handler_fn(move |message, _sender| {
            let pipeline = Arc::clone(&pipeline);
            async move {
                pipeline.receive_message(&message, encrypted).await;
            }
        }));
}
