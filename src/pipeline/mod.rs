//! Data source tree and the orchestrator that runs it.
//!
//! A pipeline starts from a root data source. Each data source carries an
//! ordered chain of operators; an operator may own a child data source,
//! which starts a new branch with its own chain.
//!
//! # Architecture
//!
//! ```text
//! [Root] ── op ── op ══Staging══► [Output] ── op ══Staging══► [Output]
//!            └══Explicit══► [Child] ── op ══Staging══► [Output]
//! ```
//!
//! # Design
//!
//! - **Flat arenas**: data sources and operators live in `Vec<Option<_>>`
//!   indexed by newtype ids.
//! - **Tagged child edges**: [`ChildEdge::Staging`] follows the tail of its
//!   chain, [`ChildEdge::Explicit`] belongs to the operator that made it.
//! - **One request in flight**: the [`Pipeline`] owns one executor and
//!   supersedes whatever it is running when asked to run again.
//! - **Channels out**: observers drain [`PipelineNotification`]s.

pub mod data_source;
pub mod future;
pub mod id;
pub mod notification;
pub mod orchestrator;

pub use data_source::{ChildEdge, DataKind, DataSource, DataSourceTree, OperatorNode, Persistence};
pub use future::ImageFuture;
pub use id::{DataSourceId, OperatorId, RequestId};
pub use notification::{drain, ErrorReport, PipelineNotification};
pub use orchestrator::{CancelCallback, Execution, Pipeline};
