use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::messaging::envelope::Envelope;
use crate::node::directories::NodeState;
use crate::node::peer_sender::PeerSender;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum AnnounceJob {
    /// tell a candidate node about this node's own port
    AnnounceSelf { to: SocketAddr },
    /// tell a newly discovered node about every other node this node knows
    IntroduceKnownPeers { new_peer: SocketAddr },
}

/// Mesh discovery is driven through a bounded work queue: discovering a peer enqueues a job
///  instead of announcing recursively, and a single worker drains the queue.
#[derive(Clone)]
pub struct MeshAnnouncer {
    jobs: mpsc::Sender<AnnounceJob>,
}
impl MeshAnnouncer {
    pub fn new(capacity: usize) -> (MeshAnnouncer, mpsc::Receiver<AnnounceJob>) {
        let (jobs, receiver) = mpsc::channel(capacity);
        (MeshAnnouncer { jobs }, receiver)
    }

    pub async fn submit(&self, job: AnnounceJob) {
        debug!(?job, "queueing announce job");
        if self.jobs.send(job).await.is_err() {
            warn!("announce worker is gone - dropping {:?}", job);
        }
    }
}

pub struct AnnounceWorker {
    self_port: u16,
    state: Arc<NodeState>,
    peer_sender: Arc<dyn PeerSender>,
    jobs: mpsc::Receiver<AnnounceJob>,
}

impl AnnounceWorker {
    pub fn new(self_port: u16, state: Arc<NodeState>, peer_sender: Arc<dyn PeerSender>, jobs: mpsc::Receiver<AnnounceJob>) -> AnnounceWorker {
        AnnounceWorker {
            self_port,
            state,
            peer_sender,
            jobs,
        }
    }

    /// runs until every [MeshAnnouncer] for this worker is dropped
    pub async fn run(mut self) {
        while let Some(job) = self.jobs.recv().await {
            self.execute(job).await;
        }
        debug!("announce queue closed");
    }

    /// returns the number of announce messages that were sent
    pub async fn execute(&self, job: AnnounceJob) -> usize {
        let (to, envelopes) = match job {
            AnnounceJob::AnnounceSelf { to } => {
                (to, vec![Envelope::announce(self.self_port)])
            }
            AnnounceJob::IntroduceKnownPeers { new_peer } => {
                let envelopes = self.state.servers.entries().await
                    .into_iter()
                    .filter(|&(port, _)| port != new_peer.port())
                    .map(|(port, _)| Envelope::announce(port))
                    .collect::<Vec<_>>();
                (new_peer, envelopes)
            }
        };

        if envelopes.is_empty() {
            return 0;
        }

        let num_envelopes = envelopes.len();
        match self.peer_sender.send(to, envelopes).await {
            Ok(()) => {
                debug!("sent {} announce message(s) to {}", num_envelopes, to);
                num_envelopes
            }
            Err(e) => {
                info!("announcing to {} failed - skipping: {}", to, e);
                0
            }
        }
    }
}
