pub mod payload;
pub mod poll;
pub mod reply;
pub mod reply_store;
pub mod service;
pub mod transport;
