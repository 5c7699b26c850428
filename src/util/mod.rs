pub mod buf;
pub mod timeout;
