//! Client-side optimistic appointment store.
//!
//! `reduce` is the whole state machine: a pure function from a snapshot and an
//! action to the next snapshot. `AppointmentStore` wraps it with the async
//! round trips, the per-id mutation guard and the subscriber channel.

mod action;
pub mod cache;
mod client;
mod push;
mod reducer;
mod state;

pub use action::Action;
pub use client::{AppointmentStore, BookingApi, LocalBookingApi, StoreConfig};
pub use push::spawn_push_listener;
pub use reducer::reduce;
pub use state::{
    DEFAULT_STALE_WINDOW_MS, ErrorKey, LoadStatus, LoadedRange, MarkerKind, OptimisticMarker, RequestId,
    StoreState,
};
