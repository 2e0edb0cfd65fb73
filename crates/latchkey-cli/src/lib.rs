//! Latchkey maintenance commands.
//!
//! Offline upkeep for a local record store, run while no client holds it
//! open:
//!
//! - `check-conflicts`: sweep contacts for duplicate stable ids and phone
//!   numbers and merge them
//! - `clean-keys`: prune superseded signed prekeys
//! - `status`: summarize the account, contacts and key material
//!
//! The binary wires these to a [`latchkey_core::RedbStore`]; [`run`] takes any
//! [`RecordStore`] so tests can drive it directly.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;

use std::{fmt, time::Duration};

use clap::Subcommand;
use latchkey_client::{ContactResolver, KeyLifecycleManager, KeyPolicy, KeySummary, PruneReport, SweepReport};
use latchkey_core::{Environment, RecordStore};
use tracing::info;

pub use crate::error::CliError;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Maintenance command.
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Merge duplicate contacts
    CheckConflicts,

    /// Remove superseded signed prekeys
    CleanKeys {
        /// Age in days after which superseded keys are removed
        #[arg(long, default_value_t = 7)]
        archive_days: u64,
    },

    /// Show account, contact and key state
    Status,
}

/// Account and key overview produced by [`Command::Status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    /// Whether a registration completed
    pub registered: bool,
    /// Registered number
    pub number: Option<String>,
    /// Device id within the account
    pub device_id: Option<u32>,
    /// Stored contacts
    pub contacts: usize,
    /// Key counts and counters
    pub keys: KeySummary,
}

/// Result of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Conflict sweep counters
    Sweep(SweepReport),
    /// Signed prekeys kept and removed
    Prune(PruneReport),
    /// Account overview
    Status(StatusReport),
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sweep(report) => write!(
                f,
                "examined {} contacts: {} merged, {} numbers stripped, {} failures",
                report.examined, report.merged, report.numbers_stripped, report.failures
            ),
            Self::Prune(report) => {
                write!(f, "kept signed prekeys {:?}, removed {:?}", report.kept, report.removed)
            },
            Self::Status(status) => {
                write!(
                    f,
                    "registered: {}, number: {}, device: {}, contacts: {}, prekeys: {}, signed prekeys: {} ({} confirmed), rotation rejections: {}",
                    status.registered,
                    status.number.as_deref().unwrap_or("-"),
                    status.device_id.map_or_else(|| "-".to_string(), |id| id.to_string()),
                    status.contacts,
                    status.keys.pre_keys,
                    status.keys.signed_pre_keys,
                    status.keys.confirmed_signed_pre_keys,
                    status.keys.rotation_rejections,
                )
            },
        }
    }
}

/// Execute `command` against `store`.
pub async fn run<S: RecordStore, E: Environment>(
    command: Command,
    store: S,
    env: E,
) -> Result<Outcome, CliError> {
    match command {
        Command::CheckConflicts => {
            let resolver = ContactResolver::new(store, env);
            let loaded = resolver.load().await?;
            info!(loaded, "checking contacts for conflicts");
            Ok(Outcome::Sweep(resolver.check_for_conflicts().await?))
        },
        Command::CleanKeys { archive_days } => {
            let policy = KeyPolicy {
                archive_age: Duration::from_secs(archive_days.saturating_mul(SECS_PER_DAY)),
                ..KeyPolicy::default()
            };
            let keys = KeyLifecycleManager::new(store, env, policy);
            Ok(Outcome::Prune(keys.clean_signed_pre_keys().await?))
        },
        Command::Status => {
            let account = store.load_account().await?;
            let contacts = store.load_contacts().await?.len();
            let keys = KeyLifecycleManager::new(store, env, KeyPolicy::default()).key_summary().await?;
            Ok(Outcome::Status(StatusReport {
                registered: account.registration_done,
                number: account.number.map(|n| n.as_str().to_string()),
                device_id: account.device_id,
                contacts,
                keys,
            }))
        },
    }
}
