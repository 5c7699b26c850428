pub mod announcer;
pub mod directories;
pub mod dispatcher;
pub mod node;
pub mod node_config;
pub mod peer_sender;
pub mod router;
