//! Talk activity aggregation
//!
//! Voice-chat talk events from every connected server are folded into one
//! decision: should other applications be ducked right now. The decision
//! drives anything implementing [`DuckingControl`].

mod aggregator;

pub use aggregator::TalkAggregator;

/// Something that can be told to start or pause ducking
///
/// Both calls must be idempotent; the aggregator only issues them on a change
/// of its decision, but implementations may be shared with other callers.
///
/// The method names differ from `Monitor::start`/`Monitor::pause` so the
/// inherent methods (which report the new state) are never shadowed through
/// the `Arc` impl below.
pub trait DuckingControl: Send + Sync {
    fn start_ducking(&self);
    fn pause_ducking(&self);
}

impl<T: DuckingControl + ?Sized> DuckingControl for std::sync::Arc<T> {
    fn start_ducking(&self) {
        (**self).start_ducking();
    }

    fn pause_ducking(&self) {
        (**self).pause_ducking();
    }
}
