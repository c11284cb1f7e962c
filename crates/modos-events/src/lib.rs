//! In-process event bus for the modos server core.
//!
//! - [`EventBus`] — exact and wildcard subscriptions, sync and spawned
//!   listeners, correlated `emit_and_wait`, active-handler draining
//! - [`StreamSubscription`] — chunk stream over `stream.<request_id>`
//! - [`pattern`] — dot-segment wildcard matching

mod bus;
pub mod pattern;
mod pending;
mod stream;

pub use bus::{BusEvent, EventBus, ListenerId};
pub use pending::{ReplyHandle, RequestIdClaim};
pub use stream::StreamSubscription;
