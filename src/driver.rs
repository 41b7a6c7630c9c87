use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::comm::entropy::MeshEntropy;
use crate::comm::secure::wrap_stream;
use crate::node::{Node, NodeEvent};


/// The node's single-threaded driver: a periodic tick interleaved with I/O
///  events from the listener and dial tasks. All node state is mutated here,
///  one callback at a time.
pub async fn run_node<E>(node: Arc<Mutex<Node<E>>>, mut events: mpsc::Receiver<NodeEvent>)
where
    E: MeshEntropy + Send + 'static,
{
    let tick_interval = node.lock().await.config().tick_interval;
    let mut tick = tokio::time::interval(tick_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = tick.tick() => {
                node.lock().await.on_tick(Instant::now());
            }
            event = events.recv() => match event {
                Some(event) => node.lock().await.on_event(event, Instant::now()),
                None => {
                    info!("event channel closed, shutting down");
                    return;
                }
            }
        }
    }
}

/// Accepts inbound peers and hands them to the node as [NodeEvent]s.
pub async fn run_listener(
    listen_addr: String,
    secret: Option<Vec<u8>>,
    events: mpsc::Sender<NodeEvent>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("listening on {}", listen_addr);

    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "inbound connection");
        let _ = stream.set_nodelay(true);

        let stream = wrap_stream(stream, secret.as_deref());
        if events.send(NodeEvent::Accepted { stream }).await.is_err() {
            return Ok(()); // node is gone
        }
    }
}
