//! Shared fixtures: deterministic environment, scripted account API and an
//! in-memory provisioning channel.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use latchkey_client::{
    AccountApi, ApiError, DeviceLinkPrompt, ProvisioningChannel, ProvisioningRequest,
    ResolverEvent, VerificationTransport,
    api::{ConfirmCodeRequest, ConfirmCodeResponse, KeyUpload, SignedPreKeyUpload},
};
use latchkey_core::{
    Environment,
    model::{PhoneNumber, StableId},
};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;
use tokio::sync::broadcast;

pub const DAY_MS: u64 = 24 * 60 * 60 * 1000;
pub const START_MS: u64 = 1_700_000_000_000;

/// Settable clock and seeded RNG shared by clones.
#[derive(Clone)]
pub struct TestEnv {
    now: Arc<AtomicU64>,
    rng: Arc<Mutex<ChaCha20Rng>>,
}

impl TestEnv {
    pub fn new(seed: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(START_MS)),
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn advance_days(&self, days: u64) {
        self.advance(days * DAY_MS);
    }
}

impl Environment for TestEnv {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap().fill_bytes(buffer);
    }
}

/// Everything the scripted server was asked to do.
#[derive(Default)]
pub struct ApiLog {
    pub confirmations: Vec<ConfirmCodeRequest>,
    pub key_uploads: Vec<KeyUpload>,
    pub signed_pre_keys: Vec<SignedPreKeyUpload>,
    pub device_names: Vec<Vec<u8>>,
    pub signaling_key_removals: usize,
    pub verifications: Vec<(PhoneNumber, VerificationTransport)>,
}

#[derive(Default)]
struct ApiScript {
    stable_id: Option<StableId>,
    device_id: Option<u32>,
    server_pre_keys: usize,
    signed_pre_key_error: Option<ApiError>,
    confirm_error: Option<ApiError>,
}

/// Account API answering from a script and recording every call.
#[derive(Clone, Default)]
pub struct MockApi {
    script: Arc<Mutex<ApiScript>>,
    log: Arc<Mutex<ApiLog>>,
}

impl MockApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign_stable_id(&self, stable_id: &str) {
        self.script.lock().unwrap().stable_id = Some(StableId::new(stable_id).unwrap());
    }

    pub fn assign_device_id(&self, device_id: u32) {
        self.script.lock().unwrap().device_id = Some(device_id);
    }

    pub fn set_server_pre_keys(&self, count: usize) {
        self.script.lock().unwrap().server_pre_keys = count;
    }

    pub fn fail_signed_pre_key(&self, error: Option<ApiError>) {
        self.script.lock().unwrap().signed_pre_key_error = error;
    }

    pub fn fail_confirm(&self, error: Option<ApiError>) {
        self.script.lock().unwrap().confirm_error = error;
    }

    pub fn log<T>(&self, read: impl FnOnce(&ApiLog) -> T) -> T {
        read(&self.log.lock().unwrap())
    }
}

impl AccountApi for MockApi {
    async fn confirm_code(&self, request: &ConfirmCodeRequest) -> Result<ConfirmCodeResponse, ApiError> {
        self.log.lock().unwrap().confirmations.push(request.clone());
        let script = self.script.lock().unwrap();
        if let Some(error) = script.confirm_error.clone() {
            return Err(error);
        }
        Ok(ConfirmCodeResponse { stable_id: script.stable_id.clone(), device_id: script.device_id })
    }

    async fn register_keys(&self, keys: &KeyUpload) -> Result<(), ApiError> {
        self.script.lock().unwrap().server_pre_keys = keys.pre_keys.len();
        self.log.lock().unwrap().key_uploads.push(keys.clone());
        Ok(())
    }

    async fn get_my_keys(&self) -> Result<usize, ApiError> {
        Ok(self.script.lock().unwrap().server_pre_keys)
    }

    async fn set_signed_pre_key(&self, key: &SignedPreKeyUpload) -> Result<(), ApiError> {
        if let Some(error) = self.script.lock().unwrap().signed_pre_key_error.clone() {
            return Err(error);
        }
        self.log.lock().unwrap().signed_pre_keys.push(key.clone());
        Ok(())
    }

    async fn remove_signaling_key(&self) -> Result<(), ApiError> {
        self.log.lock().unwrap().signaling_key_removals += 1;
        Ok(())
    }

    async fn update_device_name(&self, encrypted_name: &[u8]) -> Result<(), ApiError> {
        self.log.lock().unwrap().device_names.push(encrypted_name.to_vec());
        Ok(())
    }

    async fn request_verification(
        &self,
        number: &PhoneNumber,
        transport: VerificationTransport,
    ) -> Result<(), ApiError> {
        self.log.lock().unwrap().verifications.push((number.clone(), transport));
        Ok(())
    }
}

/// What the provisioning channel saw from the client.
#[derive(Default)]
pub struct ChannelLog {
    pub responses: Vec<(u16, String)>,
    pub closes: usize,
}

/// Provisioning channel fed from a queue of requests.
///
/// The queue can be extended while the client is waiting, through
/// [`ChannelFeed`].
pub struct MockChannel {
    requests: tokio::sync::mpsc::UnboundedReceiver<ProvisioningRequest>,
    log: Arc<Mutex<ChannelLog>>,
}

/// Sending half of a [`MockChannel`]. Dropping it closes the channel.
pub struct ChannelFeed {
    requests: tokio::sync::mpsc::UnboundedSender<ProvisioningRequest>,
    pub log: Arc<Mutex<ChannelLog>>,
}

impl ChannelFeed {
    pub fn push(&self, request: ProvisioningRequest) {
        self.requests.send(request).unwrap();
    }
}

pub fn channel() -> (MockChannel, ChannelFeed) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let log = Arc::new(Mutex::new(ChannelLog::default()));
    (MockChannel { requests: rx, log: Arc::clone(&log) }, ChannelFeed { requests: tx, log })
}

impl ProvisioningChannel for MockChannel {
    async fn next_request(&mut self) -> Option<ProvisioningRequest> {
        self.requests.recv().await
    }

    async fn respond(&mut self, status: u16, message: &str) {
        self.log.lock().unwrap().responses.push((status, message.to_string()));
    }

    async fn close(&mut self) {
        self.log.lock().unwrap().closes += 1;
        self.requests.close();
    }
}

/// Prompt answering with a fixed device name and capturing the URL.
#[derive(Default)]
pub struct ScriptedPrompt {
    pub device_name: Option<String>,
    pub urls: Mutex<VecDeque<String>>,
    pub confirmed_numbers: Mutex<Vec<PhoneNumber>>,
    url_shown: Option<tokio::sync::mpsc::UnboundedSender<String>>,
}

impl ScriptedPrompt {
    pub fn answering(device_name: Option<&str>) -> Self {
        Self { device_name: device_name.map(str::to_string), ..Self::default() }
    }

    /// Also forward each shown URL to the returned receiver.
    pub fn with_url_listener(
        mut self,
    ) -> (Self, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        self.url_shown = Some(tx);
        (self, rx)
    }
}

impl DeviceLinkPrompt for ScriptedPrompt {
    fn show_provisioning_url(&self, url: &str) {
        self.urls.lock().unwrap().push_back(url.to_string());
        if let Some(tx) = &self.url_shown {
            let _ = tx.send(url.to_string());
        }
    }

    async fn confirm_number(&self, number: &PhoneNumber) -> Option<String> {
        self.confirmed_numbers.lock().unwrap().push(number.clone());
        self.device_name.clone()
    }
}

/// Wait for the next merge outcome, failing the test after a while.
pub async fn next_merge(events: &mut broadcast::Receiver<ResolverEvent>) -> ResolverEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("merge event within timeout")
        .expect("event channel open")
}
