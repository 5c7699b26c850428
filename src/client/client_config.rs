use std::net::SocketAddr;
use std::time::Duration;

use anyhow::bail;

use crate::messaging::envelope::MAX_PAYLOAD_LEN;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub bootstrap: SocketAddr,
    pub username: String,

    /// `None` waits for as long as the OS lets a connection attempt take
    pub connect_timeout: Option<Duration>,
    /// Bounds connect, echo and reply for a single latency probe. `None` lets a stalled node
    ///  block the probe indefinitely.
    pub probe_timeout: Option<Duration>,

    /// upper bound for a single chunk of inbound text
    pub read_buffer_size: usize,
}

impl ClientConfig {
    pub fn new(bootstrap: SocketAddr, username: &str) -> ClientConfig {
        ClientConfig {
            bootstrap,
            username: username.to_string(),
            connect_timeout: None,
            probe_timeout: None,
            read_buffer_size: 1024,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.username.is_empty() {
            bail!("username must not be empty");
        }
        if self.username.contains('\0') {
            bail!("username must not contain NUL characters");
        }
        if self.username.len() > MAX_PAYLOAD_LEN {
            bail!("username is too long");
        }
        if self.read_buffer_size == 0 {
            bail!("read buffer size must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::valid("alice", true)]
    #[case::empty("", false)]
    #[case::nul("al\0ice", false)]
    fn test_validate(#[case] username: &str, #[case] valid: bool) {
        let config = ClientConfig::new("127.0.0.1:5001".parse().unwrap(), username);
        assert_eq!(config.validate().is_ok(), valid);
    }
}
