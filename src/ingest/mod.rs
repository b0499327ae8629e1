//! Job event ingestion
//!
//! Events reach metrics through the [`Dispatcher`]'s per-metric lanes; the
//! [`TickScheduler`] keeps windowed aggregators rotating between events.

pub mod dispatcher;
pub mod ticker;

pub use dispatcher::{
    Dispatcher, DispatcherStats, LaneMessage, DEFAULT_CONCURRENCY, DEFAULT_LANE_CAPACITY,
};
pub use ticker::{tick_interval, TickScheduler};
