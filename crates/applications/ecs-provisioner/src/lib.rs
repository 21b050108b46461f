//! # ECS Provisioner
//!
//! Compute-instance provisioning for a cluster autoscaler's ECS adapter.
//!
//! ## Architecture
//!
//! ```text
//! caller (autoscaler)
//!     │ create / get / list / delete / create_tags
//!     ▼
//! InstanceProvider ──── LaunchRateLimiter   (token bucket, fair wait)
//!     │          ├───── instance read cache (15s TTL)
//!     │          └───── UnavailableOfferings (3m TTL, swept every 10s)
//!     ▼
//! ComputeApi / NetworkResolver / ImageResolver / BootstrapRenderer
//! ```
//!
//! A launch filters and ranks candidate shapes, resolves an image and a
//! network per shape, and submits one provisioning group that lets the cloud
//! pick the cheapest viable shape and zone. Stock-outs reported by the cloud
//! are negative-cached so later requests avoid them.
//!
//! See [`instance`] for the operations and [`selection`] for the filtering
//! and zone-selection rules.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod instance;
pub mod limiter;
pub mod options;
pub mod selection;
pub mod telemetry;
pub mod unavailable;

pub use cache::{
    INSTANCE_CACHE_TTL, TtlCache, UNAVAILABLE_OFFERINGS_CLEANUP_INTERVAL, UNAVAILABLE_OFFERINGS_TTL,
};
pub use instance::{Collaborators, InstanceProvider};
pub use limiter::LaunchRateLimiter;
pub use options::{Options, OptionsError};
pub use selection::{INSTANCE_TYPE_FLEXIBILITY_THRESHOLD, MAX_INSTANCE_SHAPES};
pub use unavailable::{OfferingKey, UnavailabilityEntry, UnavailableOfferings};
