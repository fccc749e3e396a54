//! Ingestion pipeline.
//!
//! Inbound mail flows through:
//! 1. `MailRelay::accept()`: recipient check and relay id assignment
//! 2. `IngestionRouter::route()`: the matching rule's action chain
//! 3. `StoreAction`: raw MIME persisted under `raw-emails/<id>`
//! 4. `InvokeAction`: concurrency-limited processor dispatch
//!
//! The store always completes before the invoke starts. A failed store halts
//! the chain; a failed invoke leaves the stored artifact in place.

pub mod actions;
pub mod relay;
pub mod router;
pub mod types;

pub use actions::{Action, ActionContext, InvokeAction, StoreAction};
pub use relay::{InboundMail, MailRelay};
pub use router::{IngestionRouter, RoutingRule};
pub use types::{ActionOutput, ActionResult, ActionStatus, Envelope, RouteOutcome};
