//! Shared data model for `MeshChat`: identifiers, timestamps, and the
//! profile, contact, conversation, and message records.

pub mod contact;
pub mod conversation;
pub mod ids;
pub mod message;
