//! Latchkey client services
//!
//! Account and contact identity management on top of [`latchkey_core`]
//! storage and [`latchkey_crypto`] key material.
//!
//! # Architecture
//!
//! Services are plain structs generic over their collaborators: a
//! [`RecordStore`] for persistence, an [`Environment`] for time and
//! randomness, and an [`AccountApi`] for the server. Nothing is global; the
//! caller builds the services once and shares them by cloning.
//!
//! Operations that rewrite shared identity state are serialized: the
//! registration coordinator owns an account queue, the contact resolver owns a
//! merge queue. Both publish what happened on broadcast channels.
//!
//! # Components
//!
//! - [`ContactResolver`]: canonical contact per account, split contact
//!   merging, duplicate sweeps
//! - [`KeyLifecycleManager`]: prekey generation, signed prekey rotation and
//!   pruning
//! - [`RegistrationCoordinator`]: single device registration, device linking
//!   and key maintenance
//! - [`AccountApi`], [`ProvisioningChannel`], [`DeviceLinkPrompt`]: the seams
//!   to the server and the user

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod api;
pub mod contacts;
mod error;
pub mod keys;
pub mod provisioning;
pub mod registration;

pub use api::{AccountApi, ApiError, VerificationTransport};
pub use contacts::{ContactResolver, ResolverEvent, SweepReport, Trust};
pub use error::{KeyError, RegistrationError, ResolverError};
pub use keys::{GeneratedKeys, KeyLifecycleManager, KeyPolicy, KeySummary, PruneReport, RotationOutcome};
pub use latchkey_core::{Environment, RecordStore};
pub use provisioning::{DeviceLinkPrompt, ProvisionMessage, ProvisioningChannel, ProvisioningRequest};
pub use registration::{
    AccountConfig, AccountEvent, RefreshOutcome, RegistrationCoordinator, RegistrationState,
};
