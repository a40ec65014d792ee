// Shared by every scenario; each one uses a different subset.
#![allow(dead_code)]

pub mod backends;
pub mod helpers;
pub mod websocket_client;
