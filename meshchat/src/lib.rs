//! `MeshChat`: delivery lifecycle, view reconciliation, and client session
//! for a peer-to-peer chat client.

pub mod clock;
pub mod config;
pub mod delivery;
pub mod ids;
pub mod reconcile;
pub mod session;
pub mod store;
