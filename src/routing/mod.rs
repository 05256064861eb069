// Routing layer
//
// An immutable snapshot of the cluster routing table, a reconciler that
// keeps it aligned with the coordination directory, and the outgoing
// dispatcher that resolves destinations from it.

pub mod dispatcher;
pub mod reconciler;
pub mod snapshot;
pub mod strategy;

pub use dispatcher::{FeedbackLoop, OutgoingDispatcher};
pub use reconciler::RoutingReconciler;
pub use snapshot::{RoutingSnapshot, SnapshotCell};
pub use strategy::{KeyHashStrategy, Router, RoutingStrategyManager};
