//! Change data capture
//!
//! Every applied command yields a [`Cdc`] record, persisted in the reserved
//! `cdc` collection and published on the [`ChangeStream`] once the
//! transaction commits.

mod event;
mod stream;

pub use event::{cdc_schema, Cdc, CDC_COLLECTION};
pub use stream::{
    ChangeStream, ChangeStreamTask, ChangeSubscription, OverflowPolicy, PublishResult,
    ALL_COLLECTIONS,
};
