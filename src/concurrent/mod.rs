//! Executor, futures and listeners shared by every request manager.

mod events;
mod executor;
mod future;

pub use events::{DhtFutureListener, EventChannel};
pub(crate) use events::OnComplete;
pub use executor::Executor;
pub(crate) use executor::panic_message;
pub use future::{DhtFuture, Outcome};
