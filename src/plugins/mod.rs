//! Connection plugins.
//!
//! A plugin is data with two transform functions: one for each
//! direction of the event stream. Returning `None` consumes the event.

mod encryption;
mod pingpong;
mod promise;
mod statistics;

pub use encryption::EncryptionPlugin;
pub use pingpong::{start_keepalive, PingPongPlugin};
pub use promise::PromisePlugin;
pub use statistics::{Statistics, StatisticsPlugin};

use crate::connection::Event;

pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Transforms an event arriving from the wire.
    fn incoming(&self, event: Event) -> Option<Event>;

    /// Transforms an event on its way to the wire.
    fn outgoing(&self, event: Event) -> Option<Event>;
}
