//! Pack processing: per-pack completion bookkeeping, submit and retry
//! strategies, and dispatch of polled messages to business handlers.

mod callback;
mod context;
mod processor;
mod strategy;
mod submit;

pub use callback::{MsgCallback, PackCallback};
pub use context::{PackProcessingContext, PackResult};
pub use processor::{DispatchPool, Dispatched, MsgHandler, PackOutcome, PackProcessor};
pub use strategy::{ProcessingDecision, ProcessingStrategy};
pub use submit::{Lane, SubmitStrategy, Wave};
