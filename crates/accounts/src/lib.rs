//! Keeps one XMPP session per configured account and republishes what
//! those sessions report on the event bus.

mod error;
mod forward;
mod manager;

pub use error::AccountError;
pub use manager::AccountManager;
