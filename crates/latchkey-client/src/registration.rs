//! Account registration.
//!
//! Two entry points create an account on this installation:
//!
//! - [`RegistrationCoordinator::register_single_device`]: a fresh identity is
//!   generated and confirmed with a verification code
//! - [`RegistrationCoordinator::register_second_device`]: the identity comes
//!   from the primary device over a provisioning channel
//!
//! Both then run the same tail: confirm with the server, wipe protocol data if
//! the account identity changed, write the account state, replace all keys,
//! and resolve the self contact. Each step is a [`RegistrationState`]
//! transition, published as [`AccountEvent::Progress`].
//!
//! Every operation that reads and rewrites account or key state runs on one
//! [`TaskSerializer`], so a prekey refresh can never interleave with a
//! registration.

use std::time::Duration;

use base64::{Engine, engine::general_purpose::STANDARD};
use latchkey_core::{
    Environment, RecordStore, TaskSerializer,
    model::{AccountState, ContactId, IdentityRecord, PhoneNumber, StableId, VerifiedStatus},
};
use latchkey_crypto::{
    EncryptedDeviceName, IdentityKeyPair, ProfileKey, ProvisionEnvelope, ProvisioningCipher,
    decrypt_device_name, derive_access_key, encrypt_device_name,
};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::{
    api::{AccountApi, ConfirmCodeRequest, VerificationTransport},
    contacts::{ContactResolver, Trust},
    error::{KeyError, RegistrationError},
    keys::{KeyLifecycleManager, KeyPolicy, PruneReport, RotationOutcome},
    provisioning::{
        ADDRESS_PATH, DeviceLinkPrompt, MESSAGE_PATH, ProvisionMessage, ProvisioningAddress,
        ProvisioningChannel, ProvisioningUrl, decode,
    },
};

const EVENT_CAPACITY: usize = 64;

/// Random bytes behind the server password.
const PASSWORD_BYTES: usize = 16;

/// Registration ids are 14 bits, never zero.
const REGISTRATION_ID_MASK: u32 = 0x3fff;

/// Steps of a registration, in order.
///
/// `DataWiped` is only visited when the number or stable id changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegistrationState {
    /// Nothing done yet
    Start,
    /// Identity key pair generated or received
    KeyPairGenerated,
    /// Server accepted the code
    AccountConfirmed,
    /// Compared against the previous number and stable id
    PreviousIdentityChecked,
    /// Protocol data from the previous identity deleted
    DataWiped,
    /// New account state persisted
    StorageWritten,
    /// Fresh prekeys generated
    KeysGenerated,
    /// Keys uploaded
    KeysRegistered,
    /// Signed prekey confirmed
    KeysConfirmed,
    /// Self contact resolved; registration complete
    Done,
}

impl RegistrationState {
    /// Whether `next` directly follows this state.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Start, Self::KeyPairGenerated)
                | (Self::KeyPairGenerated, Self::AccountConfirmed)
                | (Self::AccountConfirmed, Self::PreviousIdentityChecked)
                | (Self::PreviousIdentityChecked, Self::DataWiped | Self::StorageWritten)
                | (Self::DataWiped, Self::StorageWritten)
                | (Self::StorageWritten, Self::KeysGenerated)
                | (Self::KeysGenerated, Self::KeysRegistered)
                | (Self::KeysRegistered, Self::KeysConfirmed)
                | (Self::KeysConfirmed, Self::Done)
        )
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// - `RegistrationError::InvalidTransition` if `next` does not directly
    ///   follow this state
    pub fn transition(self, next: Self) -> Result<Self, RegistrationError> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(RegistrationError::InvalidTransition { from: self, to: next })
        }
    }
}

/// Events published by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountEvent {
    /// A registration reached this state
    Progress(RegistrationState),
    /// Registration finished
    Registered {
        /// Self contact
        contact_id: ContactId,
    },
}

/// Coordinator settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountConfig {
    /// Key generation and retention policy
    pub key_policy: KeyPolicy,
    /// Limit per queued account task; `None` waits forever
    pub task_timeout: Option<Duration>,
}

impl Default for AccountConfig {
    fn default() -> Self {
        Self { key_policy: KeyPolicy::default(), task_timeout: Some(Duration::from_secs(120)) }
    }
}

/// Result of a prekey refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Server still had enough prekeys
    Sufficient {
        /// Server-side prekey count
        count: usize,
    },
    /// A new batch was generated and uploaded
    Replenished {
        /// Prekeys generated
        generated: usize,
    },
}

/// Everything `create_account` needs about the new account.
struct NewAccount {
    number: PhoneNumber,
    stable_id: Option<StableId>,
    code: String,
    identity: IdentityKeyPair,
    profile_key: Option<ProfileKey>,
    device_name: Option<String>,
    user_agent: Option<String>,
    read_receipts: bool,
}

/// Tracks and publishes the state of one registration.
struct Progress<'a> {
    state: RegistrationState,
    events: &'a broadcast::Sender<AccountEvent>,
}

impl Progress<'_> {
    fn advance(&mut self, next: RegistrationState) -> Result<(), RegistrationError> {
        self.state = self.state.transition(next)?;
        debug!(state = ?next, "registration progress");
        let _ = self.events.send(AccountEvent::Progress(next));
        Ok(())
    }
}

/// Drives registration and periodic key maintenance.
pub struct RegistrationCoordinator<S: RecordStore, E: Environment, A: AccountApi> {
    store: S,
    env: E,
    api: A,
    keys: KeyLifecycleManager<S, E>,
    contacts: ContactResolver<S, E>,
    queue: TaskSerializer,
    config: AccountConfig,
    events: broadcast::Sender<AccountEvent>,
}

impl<S: RecordStore, E: Environment, A: AccountApi> RegistrationCoordinator<S, E, A> {
    /// Create a coordinator.
    ///
    /// `contacts` must be loaded before a registration reaches its last step.
    pub fn new(
        store: S,
        env: E,
        api: A,
        contacts: ContactResolver<S, E>,
        config: AccountConfig,
    ) -> Self {
        let queue = match config.task_timeout {
            Some(limit) => TaskSerializer::with_timeout("account", limit),
            None => TaskSerializer::new("account"),
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let keys = KeyLifecycleManager::new(store.clone(), env.clone(), config.key_policy);

        Self { store, env, api, keys, contacts, queue, config, events }
    }

    /// Subscribe to progress and completion events.
    pub fn subscribe(&self) -> broadcast::Receiver<AccountEvent> {
        self.events.subscribe()
    }

    /// Contact resolver used for the self contact.
    pub fn contacts(&self) -> &ContactResolver<S, E> {
        &self.contacts
    }

    /// Key manager, for read-only inspection.
    pub fn keys(&self) -> &KeyLifecycleManager<S, E> {
        &self.keys
    }

    fn progress(&self) -> Progress<'_> {
        Progress { state: RegistrationState::Start, events: &self.events }
    }

    /// Register this installation as the primary device.
    pub async fn register_single_device(
        &self,
        number: &str,
        verification_code: &str,
    ) -> Result<ContactId, RegistrationError> {
        let number = PhoneNumber::new(number)?;
        self.queue.run(self.register_primary(number, verification_code)).await?
    }

    async fn register_primary(
        &self,
        number: PhoneNumber,
        code: &str,
    ) -> Result<ContactId, RegistrationError> {
        let mut progress = self.progress();
        let identity = IdentityKeyPair::from_seed(self.env.random_key());
        let profile_key = ProfileKey::from_bytes(self.env.random_key());
        progress.advance(RegistrationState::KeyPairGenerated)?;

        let account = NewAccount {
            number,
            stable_id: None,
            code: code.to_string(),
            identity,
            profile_key: Some(profile_key),
            device_name: None,
            user_agent: None,
            read_receipts: false,
        };
        self.create_account(account, &mut progress).await?;
        self.replace_keys_and_finish(&mut progress).await
    }

    /// Link this installation to an existing account.
    ///
    /// Serves the provisioning channel until the provision message arrives,
    /// closes it, opens the message and registers with the received identity
    /// after `prompt` supplies a device name.
    pub async fn register_second_device<C, P>(
        &self,
        mut channel: C,
        prompt: &P,
    ) -> Result<ContactId, RegistrationError>
    where
        C: ProvisioningChannel,
        P: DeviceLinkPrompt,
    {
        let cipher = ProvisioningCipher::new(self.env.random_key());

        let envelope = loop {
            let Some(request) = channel.next_request().await else {
                warn!("provisioning channel closed before a provision message arrived");
                return Err(RegistrationError::ProvisioningClosed);
            };

            match (request.verb.as_str(), request.path.as_str()) {
                ("PUT", ADDRESS_PATH) => match decode::<ProvisioningAddress>(&request.body) {
                    Ok(address) => {
                        let url = ProvisioningUrl { uuid: address.uuid, public_key: cipher.public_key() };
                        prompt.show_provisioning_url(&url.to_url());
                        channel.respond(200, "OK").await;
                    },
                    Err(e) => {
                        warn!(error = %e, "malformed provisioning address");
                        channel.respond(400, "Bad Request").await;
                    },
                },
                ("PUT", MESSAGE_PATH) => match decode::<ProvisionEnvelope>(&request.body) {
                    Ok(envelope) => {
                        channel.respond(200, "OK").await;
                        channel.close().await;
                        break envelope;
                    },
                    Err(e) => {
                        warn!(error = %e, "malformed provision envelope");
                        channel.respond(400, "Bad Request").await;
                        channel.close().await;
                        return Err(e);
                    },
                },
                (verb, path) => warn!(verb, path, "unknown provisioning request"),
            }
        };

        let message = ProvisionMessage::from_bytes(&cipher.decrypt(&envelope)?)?;
        self.queue.run(self.link_device(message, prompt)).await?
    }

    async fn link_device<P: DeviceLinkPrompt>(
        &self,
        message: ProvisionMessage,
        prompt: &P,
    ) -> Result<ContactId, RegistrationError> {
        let missing = |field| RegistrationError::IncompleteProvisionMessage { missing: field };
        let number = present(message.number.as_deref()).ok_or_else(|| missing("number"))?;
        let code = present(message.provisioning_code.as_deref())
            .ok_or_else(|| missing("provisioning code"))?
            .to_string();
        let identity = message.identity_key.clone().ok_or_else(|| missing("identity key"))?;
        let number = PhoneNumber::new(number)?;
        let stable_id = present(message.stable_id.as_deref()).map(StableId::new).transpose()?;

        let device_name = prompt.confirm_number(&number).await.ok_or(RegistrationError::Cancelled)?;
        if device_name.trim().is_empty() {
            return Err(RegistrationError::InvalidDeviceName);
        }

        let mut progress = self.progress();
        progress.advance(RegistrationState::KeyPairGenerated)?;

        let account = NewAccount {
            number,
            stable_id,
            code,
            identity,
            profile_key: message.profile_key,
            device_name: Some(device_name),
            user_agent: message.user_agent,
            read_receipts: message.read_receipts,
        };
        self.create_account(account, &mut progress).await?;
        self.replace_keys_and_finish(&mut progress).await
    }

    /// Confirm with the server and write the new account state.
    ///
    /// If the number or the stable id differs from the previous registration,
    /// every session, identity and prekey is deleted first. A failed wipe is
    /// logged and registration continues.
    async fn create_account(
        &self,
        new: NewAccount,
        progress: &mut Progress<'_>,
    ) -> Result<(), RegistrationError> {
        let previous = self.store.load_account().await?;
        let password = self.new_password();
        let registration_id = (self.env.random_u32() & REGISTRATION_ID_MASK) + 1;

        let encrypted_device_name = match &new.device_name {
            Some(name) => Some(self.encrypt_for(name, &new.identity)?),
            None => None,
        };

        info!(number = %new.number, password_len = password.len(), "confirming account");
        let request = ConfirmCodeRequest {
            number: new.number.clone(),
            code: new.code,
            password: password.clone(),
            registration_id,
            encrypted_device_name: encrypted_device_name.as_ref().map(EncryptedDeviceName::to_bytes),
            access_key: new.profile_key.as_ref().map(derive_access_key),
        };
        let response = self.api.confirm_code(&request).await?;
        progress.advance(RegistrationState::AccountConfirmed)?;

        // The server's answer wins over the one the primary device provisioned
        let reported = response.stable_id.or(new.stable_id);
        let number_changed = previous.number.as_ref().is_some_and(|n| *n != new.number);
        let stable_id_changed = matches!(
            (&previous.stable_id, &reported),
            (Some(before), Some(after)) if before != after
        );
        progress.advance(RegistrationState::PreviousIdentityChecked)?;

        if number_changed || stable_id_changed {
            warn!(number_changed, stable_id_changed, "account identity changed, deleting previous data");
            match self.store.remove_all_protocol_data().await {
                Ok(()) => info!("deleted previous protocol data"),
                Err(e) => error!(error = %e, "failed to delete previous protocol data"),
            }
            progress.advance(RegistrationState::DataWiped)?;
        }

        let stable_id = match reported {
            Some(stable_id) => Some(stable_id),
            None if number_changed => None,
            None => previous.stable_id,
        };
        let account = AccountState {
            number: Some(new.number),
            stable_id,
            device_id: Some(response.device_id.unwrap_or(1)),
            password: Some(password),
            registration_id: Some(registration_id),
            identity_key: Some(new.identity),
            profile_key: new.profile_key,
            device_name: new.device_name,
            device_name_encrypted: encrypted_device_name.is_some(),
            user_agent: new.user_agent,
            read_receipts: new.read_receipts,
            signaling_key: previous.signaling_key,
            next_pre_key_id: previous.next_pre_key_id,
            next_signed_pre_key_id: previous.next_signed_pre_key_id,
            signed_key_rotation_rejected: previous.signed_key_rotation_rejected,
            registration_done: false,
        };
        self.store.store_account(&account).await?;
        progress.advance(RegistrationState::StorageWritten)
    }

    /// Base64 of random bytes with the trailing padding dropped.
    fn new_password(&self) -> String {
        let mut bytes = [0u8; PASSWORD_BYTES];
        self.env.random_bytes(&mut bytes);
        let mut password = STANDARD.encode(bytes);
        password.truncate(password.len() - 2);
        password
    }

    async fn replace_keys_and_finish(
        &self,
        progress: &mut Progress<'_>,
    ) -> Result<ContactId, RegistrationError> {
        self.keys.clear_sessions_and_pre_keys().await?;

        let keys = self
            .keys
            .generate_keys(self.config.key_policy.pre_key_batch, |done| {
                if done % 25 == 0 {
                    debug!(done, "generating prekeys");
                }
            })
            .await?;
        progress.advance(RegistrationState::KeysGenerated)?;

        self.api.register_keys(&keys.to_upload()).await?;
        progress.advance(RegistrationState::KeysRegistered)?;

        self.keys.confirm_keys(&keys).await?;
        progress.advance(RegistrationState::KeysConfirmed)?;

        self.registration_done(progress).await
    }

    /// Resolve the self contact with high trust and mark registration done.
    async fn registration_done(
        &self,
        progress: &mut Progress<'_>,
    ) -> Result<ContactId, RegistrationError> {
        let mut account = self.store.load_account().await?;
        let contact_id = self
            .contacts
            .ensure_contact_ids(
                account.number.as_ref().map(PhoneNumber::as_str),
                account.stable_id.as_ref().map(StableId::as_str),
                Trust::High,
            )
            .await?
            .ok_or(RegistrationError::NoSelfContact)?;

        if let Some(identity) = &account.identity_key {
            let own = IdentityRecord {
                contact_id,
                public_key: identity.public_key().to_bytes().to_vec(),
                first_use: true,
                timestamp_ms: self.env.now_millis(),
                verified: VerifiedStatus::Verified,
                nonblocking_approval: true,
            };
            self.store.save_identity(&own).await?;
        }

        account.registration_done = true;
        self.store.store_account(&account).await?;
        progress.advance(RegistrationState::Done)?;

        info!(%contact_id, "registration done");
        let _ = self.events.send(AccountEvent::Registered { contact_id });
        Ok(contact_id)
    }

    /// Top up server prekeys when they run low.
    pub async fn refresh_pre_keys(&self) -> Result<RefreshOutcome, RegistrationError> {
        self.queue.run(self.refresh_now()).await?
    }

    async fn refresh_now(&self) -> Result<RefreshOutcome, RegistrationError> {
        let count = self.api.get_my_keys().await?;
        info!(count, "server prekey count");
        if count >= self.config.key_policy.pre_key_refresh_threshold {
            return Ok(RefreshOutcome::Sufficient { count });
        }

        let keys = self.keys.generate_keys(self.config.key_policy.pre_key_batch, |_| {}).await?;
        self.api.register_keys(&keys.to_upload()).await?;
        self.keys.confirm_keys(&keys).await?;
        Ok(RefreshOutcome::Replenished { generated: keys.pre_keys.len() })
    }

    /// Rotate the signed prekey on the account queue.
    pub async fn rotate_signed_pre_key(&self) -> Result<RotationOutcome, RegistrationError> {
        Ok(self.queue.run(self.keys.rotate_signed_pre_key(&self.api)).await??)
    }

    /// Prune signed prekeys on the account queue.
    pub async fn clean_signed_pre_keys(&self) -> Result<PruneReport, RegistrationError> {
        Ok(self.queue.run(self.keys.clean_signed_pre_keys()).await??)
    }

    /// Ask the server to send a verification code to `number`.
    pub async fn request_verification(
        &self,
        number: &str,
        transport: VerificationTransport,
    ) -> Result<(), RegistrationError> {
        let number = PhoneNumber::new(number)?;
        info!(%number, ?transport, "requesting verification code");
        Ok(self.api.request_verification(&number, transport).await?)
    }

    fn encrypt_for(
        &self,
        name: &str,
        identity: &IdentityKeyPair,
    ) -> Result<EncryptedDeviceName, RegistrationError> {
        Ok(encrypt_device_name(name, &identity.public_key(), self.env.random_key())?)
    }

    /// Encrypt `name` to the account identity key.
    pub async fn encrypt_device_name(&self, name: &str) -> Result<Vec<u8>, RegistrationError> {
        let account = self.store.load_account().await?;
        let identity = account.identity_key.ok_or(KeyError::MissingIdentityKey)?;
        Ok(self.encrypt_for(name, &identity)?.to_bytes())
    }

    /// Decrypt a device name encrypted to the account identity key.
    pub async fn decrypt_device_name(&self, encrypted: &[u8]) -> Result<String, RegistrationError> {
        let account = self.store.load_account().await?;
        let identity = account.identity_key.ok_or(KeyError::MissingIdentityKey)?;
        Ok(decrypt_device_name(&EncryptedDeviceName::from_bytes(encrypted)?, &identity)?)
    }

    /// Upload the encrypted device name if the server only has plaintext.
    ///
    /// Returns whether an upload happened.
    pub async fn maybe_update_device_name(&self) -> Result<bool, RegistrationError> {
        let mut account = self.store.load_account().await?;
        if account.device_name_encrypted {
            return Ok(false);
        }
        let (Some(name), Some(identity)) = (&account.device_name, &account.identity_key) else {
            return Ok(false);
        };

        let encrypted = self.encrypt_for(name, identity)?;
        self.api.update_device_name(&encrypted.to_bytes()).await?;

        account.device_name_encrypted = true;
        self.store.store_account(&account).await?;
        info!("device name encrypted on server");
        Ok(true)
    }

    /// Drop the legacy signaling key from the server and locally.
    ///
    /// Returns whether a key was removed.
    pub async fn maybe_delete_signaling_key(&self) -> Result<bool, RegistrationError> {
        let mut account = self.store.load_account().await?;
        if account.signaling_key.is_none() {
            return Ok(false);
        }

        self.api.remove_signaling_key().await?;
        account.signaling_key = None;
        self.store.store_account(&account).await?;
        info!("signaling key removed");
        Ok(true)
    }
}

fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_path_is_accepted() {
        let path = [
            RegistrationState::KeyPairGenerated,
            RegistrationState::AccountConfirmed,
            RegistrationState::PreviousIdentityChecked,
            RegistrationState::DataWiped,
            RegistrationState::StorageWritten,
            RegistrationState::KeysGenerated,
            RegistrationState::KeysRegistered,
            RegistrationState::KeysConfirmed,
            RegistrationState::Done,
        ];

        let mut state = RegistrationState::Start;
        for next in path {
            state = state.transition(next).unwrap();
        }
        assert_eq!(state, RegistrationState::Done);
    }

    #[test]
    fn wipe_is_optional() {
        assert!(
            RegistrationState::PreviousIdentityChecked
                .can_transition_to(RegistrationState::StorageWritten)
        );
    }

    #[test]
    fn skipping_steps_is_rejected() {
        assert_eq!(
            RegistrationState::Start.transition(RegistrationState::StorageWritten),
            Err(RegistrationError::InvalidTransition {
                from: RegistrationState::Start,
                to: RegistrationState::StorageWritten,
            })
        );
        assert!(!RegistrationState::Done.can_transition_to(RegistrationState::Start));
        assert!(!RegistrationState::KeysRegistered.can_transition_to(RegistrationState::KeysGenerated));
    }

    #[test]
    fn default_config_times_out_tasks() {
        let config = AccountConfig::default();
        assert_eq!(config.task_timeout, Some(Duration::from_secs(120)));
        assert_eq!(config.key_policy.pre_key_batch, 100);
    }
}
