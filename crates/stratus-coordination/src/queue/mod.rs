//! At-least-once message queue
//!
//! Popped messages are hidden for a visibility window instead of removed.
//! A consumer deletes a message once it is done with it; otherwise the
//! message reappears for another consumer when the window lapses.

mod guard;
mod message;
mod remote;
mod renewer;

pub use guard::{MessageGuard, OnError};
pub use message::{PopOptions, QueueMessage, WaitTime};
pub use remote::RemoteQueue;
