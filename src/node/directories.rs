use std::collections::BTreeMap;
use std::fmt::{Debug, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};

use crate::messaging::envelope::Envelope;
use crate::util::timeout::with_timeout;

/// Known mesh nodes, keyed by listening port. Entries are never removed.
#[derive(Default)]
pub struct ServerDirectory {
    servers: RwLock<BTreeMap<u16, IpAddr>>,
}
impl ServerDirectory {
    pub async fn register(&self, port: u16, ip: IpAddr) {
        self.servers.write().await
            .insert(port, ip);
    }

    /// returns `true` if the port was previously unknown
    pub async fn insert_if_absent(&self, port: u16, ip: IpAddr) -> bool {
        let mut servers = self.servers.write().await;
        if servers.contains_key(&port) {
            return false;
        }
        servers.insert(port, ip);
        true
    }

    pub async fn contains(&self, port: u16) -> bool {
        self.servers.read().await
            .contains_key(&port)
    }

    pub async fn get(&self, port: u16) -> Option<IpAddr> {
        self.servers.read().await
            .get(&port)
            .cloned()
    }

    /// snapshot ordered by port
    pub async fn entries(&self) -> Vec<(u16, IpAddr)> {
        self.servers.read().await
            .iter()
            .map(|(&port, &ip)| (port, ip))
            .collect()
    }

    pub async fn addrs(&self) -> Vec<SocketAddr> {
        self.entries().await
            .into_iter()
            .map(|(port, ip)| SocketAddr::new(ip, port))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.servers.read().await.len()
    }
}


/// The writing side of one accepted connection. Clones share the underlying writer, and writes
///  through any clone are serialized.
#[derive(Clone)]
pub struct ConnectionHandle {
    peer_addr: SocketAddr,
    writer: Arc<Mutex<Box<dyn AsyncWrite + Send + Unpin>>>,
    io_timeout: Option<Duration>,
}

impl Debug for ConnectionHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConnectionHandle{{{}}}", self.peer_addr)
    }
}

impl ConnectionHandle {
    pub fn new(peer_addr: SocketAddr, writer: impl AsyncWrite + Send + Unpin + 'static, io_timeout: Option<Duration>) -> ConnectionHandle {
        ConnectionHandle {
            peer_addr,
            writer: Arc::new(Mutex::new(Box::new(writer))),
            io_timeout,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_same(&self, other: &ConnectionHandle) -> bool {
        Arc::ptr_eq(&self.writer, &other.writer)
    }

    pub async fn write_envelope(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let buf = envelope.to_bytes()?;
        self.write_raw(&buf).await
    }

    /// writes bytes without any framing
    pub async fn write_raw(&self, data: &[u8]) -> anyhow::Result<()> {
        with_timeout(self.io_timeout, "write to connection", async {
            let mut writer = self.writer.lock().await;
            writer.write_all(data).await?;
            writer.flush().await?;
            Ok::<_, anyhow::Error>(())
        }).await
    }
}


/// Users attached to this node, keyed by username
#[derive(Default)]
pub struct ClientDirectory {
    clients: RwLock<FxHashMap<String, ConnectionHandle>>,
}
impl ClientDirectory {
    /// Last writer wins: re-identifying replaces the previous connection, which is returned
    pub async fn register(&self, username: &str, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.clients.write().await
            .insert(username.to_string(), handle)
    }

    pub async fn get(&self, username: &str) -> Option<ConnectionHandle> {
        self.clients.read().await
            .get(username)
            .cloned()
    }

    pub async fn remove(&self, username: &str) -> Option<ConnectionHandle> {
        self.clients.write().await
            .remove(username)
    }

    /// Removes the entry only if it still refers to `handle` - if the user re-identified on a
    ///  different connection in the meantime, the new entry stays.
    pub async fn remove_if_same(&self, username: &str, handle: &ConnectionHandle) -> bool {
        let mut clients = self.clients.write().await;
        match clients.get(username) {
            Some(h) if h.is_same(handle) => {
                clients.remove(username);
                true
            }
            _ => false,
        }
    }

    pub async fn usernames(&self) -> Vec<String> {
        let mut result = self.clients.read().await
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }
}


/// Message ids this node has already processed. Grows without bound.
#[derive(Default)]
pub struct DedupSet {
    seen: RwLock<FxHashSet<String>>,
}
impl DedupSet {
    /// Records the id and returns `true` if it was not seen before. Check and insert happen
    ///  under the same lock, so concurrent callers with the same id get exactly one `true`.
    pub async fn first_sighting(&self, message_id: &str) -> bool {
        let mut seen = self.seen.write().await;
        if seen.contains(message_id) {
            return false;
        }
        seen.insert(message_id.to_string())
    }

    pub async fn len(&self) -> usize {
        self.seen.read().await.len()
    }
}


/// All mutable state of one node. Each directory carries its own lock.
#[derive(Default)]
pub struct NodeState {
    pub servers: ServerDirectory,
    pub clients: ClientDirectory,
    pub seen_messages: DedupSet,
}

#[cfg(test)]
mod test {
    use std::net::Ipv4Addr;
    use tokio::io::AsyncReadExt;

    use super::*;

    fn ip(last: u8) -> IpAddr {
        Ipv4Addr::new(127, 0, 0, last).into()
    }

    fn test_handle() -> (ConnectionHandle, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(1024);
        (ConnectionHandle::new("127.0.0.1:40000".parse().unwrap(), ours, None), theirs)
    }

    #[tokio::test]
    async fn test_server_directory() {
        let servers = ServerDirectory::default();
        servers.register(5002, ip(1)).await;
        assert!(servers.insert_if_absent(5001, ip(2)).await);
        assert!(!servers.insert_if_absent(5001, ip(3)).await);

        assert_eq!(servers.get(5001).await, Some(ip(2)));
        assert!(servers.contains(5002).await);
        assert!(!servers.contains(5003).await);
        assert_eq!(servers.entries().await, vec![(5001, ip(2)), (5002, ip(1))]);
        assert_eq!(servers.len().await, 2);
    }

    #[tokio::test]
    async fn test_client_directory_last_writer_wins() {
        let clients = ClientDirectory::default();
        let (first, _first_peer) = test_handle();
        let (second, _second_peer) = test_handle();

        assert!(clients.register("alice", first.clone()).await.is_none());
        let replaced = clients.register("alice", second.clone()).await.unwrap();
        assert!(replaced.is_same(&first));
        assert!(clients.get("alice").await.unwrap().is_same(&second));
        assert_eq!(clients.len().await, 1);
    }

    #[tokio::test]
    async fn test_client_directory_remove_if_same() {
        let clients = ClientDirectory::default();
        let (stale, _stale_peer) = test_handle();
        let (current, _current_peer) = test_handle();

        clients.register("alice", current.clone()).await;
        assert!(!clients.remove_if_same("alice", &stale).await);
        assert!(clients.get("alice").await.is_some());

        assert!(clients.remove_if_same("alice", &current).await);
        assert!(clients.get("alice").await.is_none());
    }

    #[tokio::test]
    async fn test_client_directory_remove_unknown() {
        let clients = ClientDirectory::default();
        assert!(clients.remove("nobody").await.is_none());
        assert!(clients.usernames().await.is_empty());
    }

    #[tokio::test]
    async fn test_client_directory_usernames_sorted() {
        let clients = ClientDirectory::default();
        let (h, _peer) = test_handle();
        clients.register("carol", h.clone()).await;
        clients.register("alice", h.clone()).await;
        clients.register("bob", h).await;
        assert_eq!(clients.usernames().await, vec!["alice", "bob", "carol"]);
    }

    #[tokio::test]
    async fn test_dedup_set() {
        let seen = DedupSet::default();
        assert!(seen.first_sighting("a").await);
        assert!(!seen.first_sighting("a").await);
        assert!(seen.first_sighting("b").await);
        assert_eq!(seen.len().await, 2);
    }

    #[tokio::test]
    async fn test_handle_writes_are_visible_to_peer() {
        let (handle, mut peer) = test_handle();
        handle.clone().write_raw(b"bob: hi").await.unwrap();

        let mut buf = [0u8; 7];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"bob: hi");
    }

    #[tokio::test]
    async fn test_handle_write_to_closed_peer_fails() {
        let (handle, peer) = test_handle();
        drop(peer);
        assert!(handle.write_raw(b"bob: hi").await.is_err());
    }
}
