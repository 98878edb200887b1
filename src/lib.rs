//! Watches IMAP mailboxes and sends a push notification for every new
//! unseen message.

pub mod client;
pub mod config;
pub mod dedup;
pub mod extract;
pub mod message;
pub mod notify;
pub mod supervisor;
pub mod watcher;

#[cfg(test)]
mod testing;
