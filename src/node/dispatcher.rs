use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::AsyncRead;
use tracing::{debug, info, trace, warn};

use crate::messaging::chat_message::ChatMessage;
use crate::messaging::envelope::{Envelope, MessageType, SUBTYPE_ANNOUNCE, SUBTYPE_SERVERS, SUBTYPE_USER, SUBTYPE_USERS};
use crate::messaging::server_list::format_server_list;
use crate::node::announcer::{AnnounceJob, MeshAnnouncer};
use crate::node::directories::{ConnectionHandle, NodeState};
use crate::node::router::MessageRouter;
use crate::util::buf::try_get_string;

/// Handles one accepted connection: reads envelopes until the peer goes away, and dispatches
///  each by message type.
///
/// Nodes never send requests on connections they accepted, so a type 1 message arriving here is
///  always an announce and never a reply.
pub struct ConnectionDispatcher {
    peer_addr: SocketAddr,
    handle: ConnectionHandle,
    state: Arc<NodeState>,
    router: Arc<MessageRouter>,
    announcer: MeshAnnouncer,
}

impl ConnectionDispatcher {
    pub fn new(handle: ConnectionHandle, state: Arc<NodeState>, router: Arc<MessageRouter>, announcer: MeshAnnouncer) -> ConnectionDispatcher {
        ConnectionDispatcher {
            peer_addr: handle.peer_addr(),
            handle,
            state,
            router,
            announcer,
        }
    }

    /// Returns `Ok` when the peer closes the connection cleanly. Framing errors and failed
    ///  replies end the loop with an error; malformed messages are skipped.
    pub async fn run(&self, mut reader: impl AsyncRead + Unpin) -> anyhow::Result<()> {
        loop {
            let envelope = match Envelope::read_from(&mut reader).await? {
                Some(envelope) => envelope,
                None => {
                    debug!("peer closed the connection");
                    return Ok(());
                }
            };
            trace!(?envelope, "received");
            self.dispatch(envelope).await?;
        }
    }

    pub async fn dispatch(&self, envelope: Envelope) -> anyhow::Result<()> {
        match envelope.kind() {
            Some(MessageType::DirectoryRequest) => self.on_directory_request(envelope.subtype).await,
            Some(MessageType::DirectoryResponse) if envelope.subtype == SUBTYPE_ANNOUNCE => {
                self.on_announce(&envelope.payload).await;
                Ok(())
            }
            Some(MessageType::Identify) if envelope.subtype == SUBTYPE_USER => {
                self.on_identify(&envelope.payload).await;
                Ok(())
            }
            Some(MessageType::Chat) => {
                self.on_chat(&envelope.payload).await;
                Ok(())
            }
            Some(MessageType::Echo) => self.handle.write_envelope(&Envelope::echo()).await,
            Some(MessageType::Disconnect) => {
                self.on_disconnect(&envelope.payload).await;
                Ok(())
            }
            _ => {
                debug!("ignoring unsupported message {:?}", envelope);
                Ok(())
            }
        }
    }

    async fn on_directory_request(&self, subtype: u8) -> anyhow::Result<()> {
        let entries = match subtype {
            SUBTYPE_SERVERS => format_server_list(self.state.servers.entries().await),
            SUBTYPE_USERS => self.state.clients.usernames().await,
            _ => Vec::new(),
        };
        self.handle.write_envelope(&Envelope::directory_response(subtype, entries)).await
    }

    async fn on_announce(&self, payload: &[u8]) {
        let port = match try_get_string(payload).and_then(|s| Ok(s.trim().parse::<u16>()?)) {
            Ok(port) => port,
            Err(e) => {
                warn!("malformed announce {:?} - ignoring: {}", String::from_utf8_lossy(payload), e);
                return;
            }
        };

        let ip = self.peer_addr.ip();
        if self.state.servers.insert_if_absent(port, ip).await {
            info!("discovered node {}:{}", ip, port);
            self.announcer.submit(AnnounceJob::IntroduceKnownPeers { new_peer: SocketAddr::new(ip, port) }).await;
        }
        else {
            trace!("node on port {} is already known", port);
        }
    }

    async fn on_identify(&self, payload: &[u8]) {
        match try_get_string(payload) {
            Ok(username) => {
                if self.state.clients.register(&username, self.handle.clone()).await.is_some() {
                    debug!("user {} re-identified, replacing the previous connection", username);
                }
                info!("user {} attached", username);
            }
            Err(e) => warn!("malformed username - ignoring: {}", e),
        }
    }

    async fn on_chat(&self, payload: &[u8]) {
        match ChatMessage::parse(payload) {
            Ok(msg) => {
                let outcome = self.router.route(msg).await;
                trace!(?outcome, "routed message");
            }
            Err(e) => warn!("message format error - dropping message: {}", e),
        }
    }

    async fn on_disconnect(&self, payload: &[u8]) {
        match try_get_string(payload) {
            Ok(username) => {
                if self.state.clients.remove(&username).await.is_some() {
                    info!("user {} disconnected", username);
                }
                else {
                    debug!("disconnect for unknown user {}", username);
                }
            }
            Err(e) => warn!("malformed username - ignoring: {}", e),
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;

    use bytes::Bytes;
    use rstest::rstest;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    use super::*;
    use crate::node::peer_sender::MockPeerSender;

    const PEER: &str = "10.0.0.7:40000";

    struct Fixture {
        client: DuplexStream,
        state: Arc<NodeState>,
        jobs: mpsc::Receiver<AnnounceJob>,
        dispatcher: JoinHandle<anyhow::Result<()>>,
    }

    async fn fixture(peer_sender: MockPeerSender) -> Fixture {
        let state = Arc::new(NodeState::default());
        state.servers.register(5001, Ipv4Addr::LOCALHOST.into()).await;

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(server);

        let router = Arc::new(MessageRouter::new(5001, state.clone(), Arc::new(peer_sender)));
        let (announcer, jobs) = MeshAnnouncer::new(16);
        let handle = ConnectionHandle::new(PEER.parse().unwrap(), writer, None);
        let dispatcher = ConnectionDispatcher::new(handle, state.clone(), router, announcer);
        let dispatcher = tokio::spawn(async move { dispatcher.run(reader).await });

        Fixture { client, state, jobs, dispatcher }
    }

    impl Fixture {
        async fn send(&mut self, envelope: Envelope) {
            envelope.write_to(&mut self.client).await.unwrap();
        }

        async fn receive(&mut self) -> Envelope {
            Envelope::read_from(&mut self.client).await.unwrap().unwrap()
        }

        /// sends an echo and waits for the reply, so everything sent before has been dispatched
        async fn sync(&mut self) {
            self.send(Envelope::echo()).await;
            assert_eq!(self.receive().await, Envelope::echo());
        }
    }

    #[tokio::test]
    async fn test_echo() {
        let mut f = fixture(MockPeerSender::new()).await;
        f.send(Envelope::echo()).await;
        let reply = f.receive().await;
        assert_eq!(reply.kind(), Some(MessageType::Echo));
        assert_eq!(reply.subtype, 0);
        assert!(reply.payload.is_empty());
    }

    #[tokio::test]
    async fn test_server_directory_request() {
        let mut f = fixture(MockPeerSender::new()).await;
        f.state.servers.register(5002, Ipv4Addr::new(10, 0, 0, 2).into()).await;

        f.send(Envelope::directory_request(SUBTYPE_SERVERS)).await;
        assert_eq!(f.receive().await, Envelope::directory_response(SUBTYPE_SERVERS, ["127.0.0.1:5001", "10.0.0.2:5002"]));
    }

    #[tokio::test]
    async fn test_user_directory_request() {
        let mut f = fixture(MockPeerSender::new()).await;
        f.send(Envelope::identify("bob")).await;
        f.send(Envelope::identify("alice")).await;

        f.send(Envelope::directory_request(SUBTYPE_USERS)).await;
        assert_eq!(f.receive().await, Envelope::directory_response(SUBTYPE_USERS, ["alice", "bob"]));
    }

    #[rstest]
    #[case(2)]
    #[case(17)]
    #[tokio::test]
    async fn test_unknown_directory_request(#[case] subtype: u8) {
        let mut f = fixture(MockPeerSender::new()).await;
        f.send(Envelope::directory_request(subtype)).await;
        let reply = f.receive().await;
        assert_eq!(reply.kind(), Some(MessageType::DirectoryResponse));
        assert_eq!(reply.subtype, subtype);
        assert!(reply.payload.is_empty());
    }

    #[tokio::test]
    async fn test_announce_of_new_node() {
        let mut f = fixture(MockPeerSender::new()).await;
        f.send(Envelope::announce(5002)).await;
        f.sync().await;

        assert_eq!(f.state.servers.get(5002).await, Some(Ipv4Addr::new(10, 0, 0, 7).into()));
        assert_eq!(f.jobs.recv().await, Some(AnnounceJob::IntroduceKnownPeers { new_peer: "10.0.0.7:5002".parse().unwrap() }));
    }

    #[tokio::test]
    async fn test_announce_of_known_node() {
        let mut f = fixture(MockPeerSender::new()).await;
        f.send(Envelope::announce(5001)).await;
        f.sync().await;

        assert_eq!(f.state.servers.get(5001).await, Some(Ipv4Addr::LOCALHOST.into()));
        assert!(f.jobs.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_malformed_announce_keeps_connection() {
        let mut f = fixture(MockPeerSender::new()).await;
        f.send(Envelope::new(MessageType::DirectoryResponse, SUBTYPE_ANNOUNCE, "port")).await;
        f.sync().await;
        assert_eq!(f.state.servers.len().await, 1);
    }

    #[tokio::test]
    async fn test_identify_and_disconnect() {
        let mut f = fixture(MockPeerSender::new()).await;
        f.send(Envelope::identify("alice")).await;
        f.sync().await;
        assert_eq!(f.state.clients.get("alice").await.unwrap().peer_addr(), PEER.parse().unwrap());

        f.send(Envelope::disconnect("alice")).await;
        f.sync().await;
        assert!(f.state.clients.get("alice").await.is_none());
    }

    #[tokio::test]
    async fn test_identify_with_other_subtype_is_ignored() {
        let mut f = fixture(MockPeerSender::new()).await;
        f.send(Envelope::new(MessageType::Identify, 0, "alice")).await;
        f.sync().await;
        assert!(f.state.clients.get("alice").await.is_none());
    }

    #[tokio::test]
    async fn test_disconnect_of_unknown_user() {
        let mut f = fixture(MockPeerSender::new()).await;
        f.send(Envelope::disconnect("nobody")).await;
        f.sync().await;
        assert_eq!(f.state.clients.len().await, 0);
    }

    #[tokio::test]
    async fn test_chat_to_local_user() {
        let mut f = fixture(MockPeerSender::new()).await;
        f.send(Envelope::identify("alice")).await;
        f.sync().await;

        let msg = ChatMessage::new("bob", "alice", "hi");
        f.send(Envelope::chat(&msg)).await;

        let mut buf = [0u8; 7];
        f.client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"bob: hi");
    }

    #[tokio::test]
    async fn test_chat_to_remote_user_is_forwarded_once() {
        let mut peer_sender = MockPeerSender::new();
        peer_sender.expect_send()
            .withf(|to, _| to.port() == 5002)
            .times(1)
            .returning(|_, _| Ok(()));

        let mut f = fixture(peer_sender).await;
        f.state.servers.register(5002, Ipv4Addr::LOCALHOST.into()).await;

        let msg = ChatMessage::new("bob", "alice", "hi");
        f.send(Envelope::chat(&msg)).await;
        f.send(Envelope::chat(&msg)).await;
        f.sync().await;
        assert_eq!(f.state.seen_messages.len().await, 1);

        drop(f.client);
        f.dispatcher.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_malformed_chat_keeps_connection() {
        let mut f = fixture(MockPeerSender::new()).await;
        f.send(Envelope::new(MessageType::Chat, 0, "id\0bob\0alice")).await;
        f.sync().await;
        assert_eq!(f.state.seen_messages.len().await, 0);
    }

    #[tokio::test]
    async fn test_unknown_type_is_ignored() {
        let mut f = fixture(MockPeerSender::new()).await;
        f.send(Envelope { message_type: 42, subtype: 0, reserved: 0, payload: Bytes::from_static(b"xyz") }).await;
        f.sync().await;
    }

    #[tokio::test]
    async fn test_clean_close() {
        let f = fixture(MockPeerSender::new()).await;
        drop(f.client);
        assert!(f.dispatcher.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_truncated_envelope_closes_connection() {
        let mut f = fixture(MockPeerSender::new()).await;
        f.client.write_all(b"\x02\x01\0\x05\0\0al").await.unwrap();
        drop(f.client);
        assert!(f.dispatcher.await.unwrap().is_err());
    }
}
