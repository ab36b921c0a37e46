//! armada-state — persistent workflow repository.
//!
//! Backed by [redb](https://docs.rs/redb). Workflows are JSON-serialized
//! into `&[u8]` value columns keyed by workflow id; each status change is
//! appended to a transition log keyed `{workflow_id}:{seq:08}` so a prefix
//! scan returns one workflow's history in order.
//!
//! The `WorkflowStore` is `Clone` + `Send` + `Sync` (backed by
//! `Arc<Database>`) and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StateError, StateResult};
pub use store::{TransitionRecord, WorkflowFilter, WorkflowStore};
