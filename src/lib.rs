//! Synchronization engine of the `huddle` terminal chat client.
//!
//! [`engine::Engine`] keeps a local mirror of a team-chat workspace (users,
//! rooms, private groups and one-to-one conversations) current from a live
//! event stream, backfills unread history, batches read markers and renders
//! everything through an [`output::Output`] implementation.

pub mod api;
pub mod cache;
pub mod config;
mod dispatch;
pub mod engine;
pub mod entity;
pub mod error;
pub mod events;
pub mod fuzzy;
mod history;
pub mod normalize;
pub mod output;
pub mod read_state;
pub mod realtime;
pub mod remote;
pub mod wire;

#[cfg(test)]
mod test_support;
