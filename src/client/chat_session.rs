use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::client::client_config::ClientConfig;
use crate::client::rtt_prober::{probe_all, select_fastest};
use crate::messaging::chat_message::ChatMessage;
use crate::messaging::envelope::{Envelope, MessageType, SUBTYPE_SERVERS};
use crate::messaging::server_list::parse_server_list;
use crate::util::timeout::with_timeout;

/// Splits an input line into receiver (the first whitespace delimited token) and content (the
///  rest after a single delimiter). Lines without content are rejected.
pub fn parse_input_line(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_start();
    let (receiver, content) = line.split_once(char::is_whitespace)?;
    Some((receiver, content))
}

struct ActiveConnection {
    node: SocketAddr,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

/// A user's session with the mesh. Connecting goes through a bootstrap node to find all nodes,
///  and then moves the session to the node with the lowest round trip time.
pub struct ChatSession {
    config: Arc<ClientConfig>,
    connection: ActiveConnection,
}

impl ChatSession {
    /// Returns the session together with the text arriving for this user
    pub async fn connect(config: ClientConfig) -> anyhow::Result<(ChatSession, mpsc::UnboundedReceiver<String>)> {
        config.validate()?;
        let config = Arc::new(config);
        let (inbound, inbound_receiver) = mpsc::unbounded_channel();

        let (mut bootstrap, candidates) = Self::attach(config.bootstrap, &config, inbound.clone(), true).await?;
        info!("server list received: {:?}", candidates);

        let measurements = probe_all(&candidates, config.probe_timeout).await;
        let best = select_fastest(&measurements)
            .ok_or_else(|| anyhow!("node {} returned an empty server list", config.bootstrap))?;
        info!("best node is {}", best);

        Envelope::disconnect(&config.username).write_to(&mut bootstrap.writer).await?;
        if let Err(e) = bootstrap.writer.shutdown().await {
            debug!("closing the connection to the bootstrap node failed: {}", e);
        }
        // The node closes its side only after processing the disconnect. Waiting for that keeps a
        //  late disconnect from removing the new registration if the best node is the bootstrap node.
        let closed = with_timeout(config.connect_timeout, "closing the bootstrap connection", async {
            let _ = bootstrap.reader.await;
            Ok::<_, anyhow::Error>(())
        }).await;
        if let Err(e) = closed {
            debug!("{}", e);
        }

        let (connection, _) = Self::attach(best, &config, inbound, false).await?;
        Ok((ChatSession { config, connection }, inbound_receiver))
    }

    /// Connects and identifies. When `request_servers` is set, the server list is requested
    ///  and read first, so that no delivered text can interleave with the reply.
    async fn attach(node: SocketAddr, config: &ClientConfig, inbound: mpsc::UnboundedSender<String>, request_servers: bool) -> anyhow::Result<(ActiveConnection, Vec<SocketAddr>)> {
        let mut stream = with_timeout(config.connect_timeout, "connect", async {
            Ok::<_, anyhow::Error>(TcpStream::connect(node).await?)
        }).await?;
        info!("connected to node {}", node);

        // before identifying on purpose: until then the node has no text to deliver ahead of the reply
        let candidates = if request_servers {
            Envelope::directory_request(SUBTYPE_SERVERS).write_to(&mut stream).await?;
            await_server_list(&mut stream).await?
        }
        else {
            Vec::new()
        };

        Envelope::identify(&config.username).write_to(&mut stream).await?;
        debug!("identified as {}", config.username);

        let (reader, writer) = stream.into_split();
        let reader = spawn_inbound_reader(node, reader, inbound, config.read_buffer_size);
        Ok((ActiveConnection { node, writer, reader }, candidates))
    }

    pub fn current_node(&self) -> SocketAddr {
        self.connection.node
    }

    pub fn username(&self) -> &str {
        &self.config.username
    }

    /// `false` once the current node closed the connection
    pub fn is_connected(&self) -> bool {
        !self.connection.reader.is_finished()
    }

    pub async fn send_message(&mut self, receiver: &str, content: &str) -> anyhow::Result<ChatMessage> {
        let msg = ChatMessage::new(&self.config.username, receiver, content);
        Envelope::chat(&msg).write_to(&mut self.connection.writer).await?;
        debug!("sent message {} to {}", msg.message_id, receiver);
        Ok(msg)
    }

    /// Malformed lines are reported and skipped, they do not end the session
    pub async fn send_line(&mut self, line: &str) -> anyhow::Result<Option<ChatMessage>> {
        if line.trim().is_empty() {
            return Ok(None);
        }
        match parse_input_line(line) {
            Some((receiver, content)) => Ok(Some(self.send_message(receiver, content).await?)),
            None => {
                warn!("expected '<receiver> <message>', got {:?}", line);
                Ok(None)
            }
        }
    }

    /// Sends every input line as a message until the input ends or the node goes away
    pub async fn run_send_loop(&mut self, input: impl AsyncBufRead + Unpin) -> anyhow::Result<()> {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            if !self.is_connected() {
                warn!("node {} closed the connection, dropping {:?}", self.connection.node, line);
                break;
            }
            self.send_line(&line).await?;
        }
        Ok(())
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        self.connection.reader.abort();
    }
}

async fn await_server_list(stream: &mut TcpStream) -> anyhow::Result<Vec<SocketAddr>> {
    match Envelope::read_from(stream).await? {
        Some(reply) if reply.kind() == Some(MessageType::DirectoryResponse) && reply.subtype == SUBTYPE_SERVERS => {
            Ok(parse_server_list(&reply.payload))
        }
        Some(reply) => bail!("expected a server list, received {:?}", reply),
        None => bail!("connection closed before the server list was received"),
    }
}

/// Forwards everything the node writes to this user as text, until the connection closes
fn spawn_inbound_reader(node: SocketAddr, mut reader: impl AsyncRead + Send + Unpin + 'static, inbound: mpsc::UnboundedSender<String>, buffer_size: usize) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; buffer_size];
        let mut pending = Vec::new();
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => {
                    debug!("node {} closed the connection", node);
                    if !pending.is_empty() {
                        let _ = inbound.send(String::from_utf8_lossy(&pending).into_owned());
                    }
                    break;
                }
                Ok(n) => {
                    pending.extend_from_slice(&buf[..n]);
                    let text = take_complete_text(&mut pending);
                    if !text.is_empty() && inbound.send(text).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!("error receiving from {}: {}", node, e);
                    break;
                }
            }
        }
    })
}

/// Removes and returns the decodable text at the start of `pending`. A multi-byte character
///  cut off at the end stays in `pending` until the rest of it arrives, invalid sequences
///  become U+FFFD.
fn take_complete_text(pending: &mut Vec<u8>) -> String {
    let mut text = String::new();
    let mut consumed = 0;
    while consumed < pending.len() {
        match std::str::from_utf8(&pending[consumed..]) {
            Ok(s) => {
                text.push_str(s);
                consumed = pending.len();
            }
            Err(e) => {
                let valid_end = consumed + e.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&pending[consumed..valid_end]));
                match e.error_len() {
                    Some(len) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        consumed = valid_end + len;
                    }
                    None => {
                        consumed = valid_end;
                        break;
                    }
                }
            }
        }
    }
    pending.drain(..consumed);
    text
}
