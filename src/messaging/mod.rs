pub mod chat_message;
pub mod envelope;
pub mod server_list;
