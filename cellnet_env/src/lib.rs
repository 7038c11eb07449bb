//! Cellular Simulator Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" seams that let the simulation engine run
//! against a real clock (tokio) or a virtual one (the simulation harness):
//! - Time (`now()`, `sleep()`) and task spawning via [`CellContext`]
//! - Per-entity mailboxes with send-only [`Address`] handles
//! - The ordered output boundary via [`RecordSink`]
//!
//! Entities never share state. Everything they know about each other arrives
//! as a message through a [`Mailbox`], and the only thing one entity holds of
//! another is an [`Address`] it can send to.
//!
//! # Example
//!
//! ```ignore
//! use cellnet_env::{bounded_mailbox, EntityId, MailboxConfig, OverflowPolicy};
//!
//! let config = MailboxConfig::new(16, OverflowPolicy::Block);
//! let (address, mut inbox) = bounded_mailbox::<u64>(EntityId::from("caller-1"), config);
//! address.send(7).await?;
//! assert_eq!(inbox.recv().await, Some(7));
//! ```

mod context;
mod error;
mod mailbox;
mod sink;
mod tokio_impl;
mod types;

pub use context::CellContext;
pub use error::EnvError;
pub use mailbox::{bounded_mailbox, mailbox, Address, Mailbox, MailboxConfig, OverflowPolicy, WeakAddress};
pub use sink::RecordSink;
pub use tokio_impl::TokioContext;
pub use types::{EntityId, SinkRecord};
