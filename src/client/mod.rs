pub mod chat_session;
pub mod client_config;
pub mod rtt_prober;
