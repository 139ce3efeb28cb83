//! Campus Relay - message relay core for school administration
//!
//! Routes point-to-point messages, role-wide broadcasts and per-user
//! notifications between students, teachers, administrators and parents over
//! a message broker. Persistence, authentication and presentation live
//! elsewhere; this crate only resolves destinations, holds one shared broker
//! connection, caches producers and consumers per destination, and fans
//! inbound messages out to registered listeners.
//!
//! Embedding processes install logging with [`utils::bootstrap::init_tracing`]
//! (filtered by `CAMPUS_RELAY_LOG`) before building a [`RelayService`].

pub mod address;
pub mod config;
pub mod error;
pub mod model;
pub mod relay;
pub mod transport;
pub mod utils;

pub use address::{AddressResolver, Destination, DestinationKind, NamingScheme};
pub use config::RelayConfig;
pub use error::{RelayError, Result};
pub use model::{Envelope, Notification, NotificationKind, Payload};
pub use relay::{
    listener_async, listener_fn, ConnectionState, Diagnostics, Listener, ListenerError,
    MessageListener, RelayEvent, RelayService,
};
