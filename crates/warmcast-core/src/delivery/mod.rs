//! Batched fan-out of one payload to many recipients.

mod dispatcher;
mod log;
mod worker;

pub use dispatcher::{BatchDispatcher, RunStatistics};
pub use log::{DeliveryLog, DeliveryRecord, DeliveryResult};
pub use worker::{DeliveryOutcome, DeliveryWorker};

#[cfg(test)]
pub(crate) use worker::tests::ScriptedTransport;
