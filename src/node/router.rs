use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::messaging::chat_message::ChatMessage;
use crate::messaging::envelope::Envelope;
use crate::node::directories::NodeState;
use crate::node::peer_sender::PeerSender;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RouteOutcome {
    /// the message id was seen before, nothing was done
    Duplicate,
    Delivered,
    /// the receiver is attached locally, but writing to its connection failed. The receiver's
    ///  entry was removed.
    DeliveryFailed,
    /// the receiver is not attached locally, the message was sent to this many other nodes
    Forwarded(usize),
}

/// Delivers chat messages to locally attached users, or floods them to all other known nodes.
///  This is a single-hop broadcast rather than routing: every node that does not know the
///  receiver floods again, and the message id is what stops the flood.
pub struct MessageRouter {
    self_port: u16,
    state: Arc<NodeState>,
    peer_sender: Arc<dyn PeerSender>,
}

impl MessageRouter {
    pub fn new(self_port: u16, state: Arc<NodeState>, peer_sender: Arc<dyn PeerSender>) -> MessageRouter {
        MessageRouter {
            self_port,
            state,
            peer_sender,
        }
    }

    pub async fn route(&self, msg: ChatMessage) -> RouteOutcome {
        if !self.state.seen_messages.first_sighting(&msg.message_id).await {
            debug!("duplicate message {} - ignoring", msg.message_id);
            return RouteOutcome::Duplicate;
        }

        trace!(id=%msg.message_id, from=%msg.sender, to=%msg.receiver, "routing message");

        match self.state.clients.get(&msg.receiver).await {
            Some(handle) => {
                match handle.write_raw(msg.delivery_text().as_bytes()).await {
                    Ok(()) => {
                        debug!("delivered message {} to local client {}", msg.message_id, msg.receiver);
                        RouteOutcome::Delivered
                    }
                    Err(e) => {
                        warn!("delivering message {} to {} failed, removing the client: {}", msg.message_id, msg.receiver, e);
                        self.state.clients.remove_if_same(&msg.receiver, &handle).await;
                        RouteOutcome::DeliveryFailed
                    }
                }
            }
            None => RouteOutcome::Forwarded(self.forward(&msg).await),
        }
    }

    async fn forward(&self, msg: &ChatMessage) -> usize {
        let envelope = Envelope::chat(msg);
        let peers = self.state.servers.addrs().await
            .into_iter()
            .filter(|addr| addr.port() != self.self_port)
            .collect::<Vec<_>>();

        let mut num_sent = 0;
        for peer in peers {
            match self.peer_sender.send(peer, vec![envelope.clone()]).await {
                Ok(()) => {
                    debug!("forwarded message {} to {}", msg.message_id, peer);
                    num_sent += 1;
                }
                Err(e) => info!("forwarding message {} to {} failed - skipping: {}", msg.message_id, peer, e),
            }
        }
        num_sent
    }
}
