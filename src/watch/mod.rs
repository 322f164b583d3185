//! Watches: live, shared subscriptions to sets of records.
//!
//! Applications ask a [`WatchService`] for [`Watch`]es. Every watch made by a
//! service shares one [`BatchSubject`] over one [`ApiSubject`], which in turn
//! holds at most one network subscription obtained through [`WatchApis`].

mod api_subject;
mod apis;
mod batch_subject;
mod handle;
mod service;
mod subject;

pub use api_subject::*;
pub use apis::*;
pub use batch_subject::*;
pub use handle::*;
pub use service::*;
pub use subject::*;
