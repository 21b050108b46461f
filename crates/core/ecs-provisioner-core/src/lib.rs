//! ECS Provisioner Core - Shared types and traits
//!
//! This crate defines the abstractions the provisioning engine is built on:
//! - Instance shapes, offerings and launched-instance records
//! - Node requests and the requirement algebra used to filter them
//! - The node template consumed read-only at launch time
//! - Collaborator traits (compute API, network/image resolution, bootstrap rendering)
//! - The cloud compute API wire model
//! - Error types
//!
//! Nothing here talks to the network. The engine in `ecs-provisioner`
//! drives these contracts.

pub mod api;
pub mod error;
pub mod labels;
pub mod requirements;
pub mod template;
pub mod traits;
pub mod types;

pub use api::*;
pub use error::*;
pub use requirements::*;
pub use template::*;
pub use traits::*;
pub use types::*;
