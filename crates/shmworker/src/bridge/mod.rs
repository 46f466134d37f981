//! Wire format shared by both sides of the channel.
//!
//! - **protocol**: message types (WorkCommand, WorkResult)
//! - **codec**: JSON encoding of mailbox payloads

pub mod codec;
pub mod protocol;
