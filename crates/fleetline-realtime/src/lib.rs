//! In-process publish/subscribe channel transport.
//!
//! Two primitives, both scoped by a named topic:
//!
//! - **Presence tracking**: each connected client publishes a small JSON
//!   payload under a caller-chosen key (the user id, so multiple devices
//!   of one user collapse into a single entry) and receives
//!   join/leave/update events for every other publisher on the topic.
//!   Entries live only as long as the owning [`Connection`].
//! - **Row-change fan-out**: table-scoped INSERT/UPDATE/DELETE
//!   notifications with optional column-equality filters.
//!
//! The [`Broker`] is the in-process rendezvous point: every client
//! "device" connects to the same broker the way it would connect to the
//! same hosted channel service. Consumers only hold [`Connection`],
//! [`PresenceTopic`] and [`ChangeSubscription`] handles, so a networked
//! transport can replace the broker without touching them.

pub mod broker;
pub mod changes;
pub mod error;
pub mod presence;

pub use broker::{Broker, Connection};
pub use changes::{ChangeFilter, ChangeOp, ChangeSubscription, RowChange};
pub use error::{RealtimeError, Result};
pub use presence::{PresenceEvent, PresenceTopic};
