//! Provider specific [`ClientWrapper`](crate::focusgroup::client_wrapper::ClientWrapper)
//! implementations.

pub mod common;

pub mod openai;
