//! LAN file sharing. Every device serves its shared folders over a
//! small HTTP API, announces itself via mDNS, and can copy or move
//! files and folders to any discovered peer.

pub mod api;
pub mod discovery;
pub mod server;
pub mod storage;
pub mod transfer;
