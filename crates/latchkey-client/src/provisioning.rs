//! Device linking transport.
//!
//! A new device opens a provisioning channel to the server and waits. The
//! server first sends `PUT /v1/address` carrying the channel address, which
//! the new device turns into a `tsdevice:` URL for the primary device to
//! scan. The primary then seals a [`ProvisionMessage`] to the ephemeral key in
//! that URL and the server relays it as `PUT /v1/message`.
//!
//! Request bodies and the sealed message are CBOR.

use std::future::Future;

use base64::{Engine, engine::general_purpose::STANDARD};
use latchkey_core::model::PhoneNumber;
use latchkey_crypto::{IdentityKeyPair, KEY_SIZE, ProfileKey, PublicKey};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use url::Url;

use crate::error::RegistrationError;

/// Path of the request carrying the channel address.
pub const ADDRESS_PATH: &str = "/v1/address";
/// Path of the request carrying the sealed provision message.
pub const MESSAGE_PATH: &str = "/v1/message";

const URL_SCHEME_BASE: &str = "tsdevice:/";

/// Request pushed by the server over the provisioning channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningRequest {
    /// HTTP-style verb
    pub verb: String,
    /// Request path
    pub path: String,
    /// CBOR body
    pub body: Vec<u8>,
}

impl ProvisioningRequest {
    /// `PUT` request with a CBOR body.
    pub fn put(path: &str, body: &impl Serialize) -> Self {
        Self { verb: "PUT".to_string(), path: path.to_string(), body: encode(body) }
    }
}

/// Body of the address request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningAddress {
    /// Channel address the primary device sends to
    pub uuid: String,
}

/// Bidirectional provisioning channel to the server.
pub trait ProvisioningChannel: Send {
    /// Next server request, or `None` once the channel has closed.
    fn next_request(&mut self) -> impl Future<Output = Option<ProvisioningRequest>> + Send;

    /// Answer the current request.
    fn respond(&mut self, status: u16, message: &str) -> impl Future<Output = ()> + Send;

    /// Close the channel.
    fn close(&mut self) -> impl Future<Output = ()> + Send;
}

/// User-facing side of device linking.
pub trait DeviceLinkPrompt: Send + Sync {
    /// Display the URL the primary device must scan.
    fn show_provisioning_url(&self, url: &str);

    /// Confirm the number being linked and ask for a device name.
    ///
    /// `None` means the user gave up.
    fn confirm_number(&self, number: &PhoneNumber) -> impl Future<Output = Option<String>> + Send;
}

/// Decoded form of a `tsdevice:` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisioningUrl {
    /// Channel address
    pub uuid: String,
    /// Ephemeral key the provision message must be sealed to
    pub public_key: PublicKey,
}

impl ProvisioningUrl {
    /// Render as `tsdevice:/?uuid=<uuid>&pub_key=<base64>`, query-encoded.
    pub fn to_url(&self) -> String {
        let Ok(mut url) = Url::parse(URL_SCHEME_BASE) else {
            unreachable!("constant provisioning URL base is valid");
        };
        url.query_pairs_mut()
            .append_pair("uuid", &self.uuid)
            .append_pair("pub_key", &STANDARD.encode(self.public_key.as_bytes()));
        url.to_string()
    }

    /// Parse a URL produced by [`Self::to_url`]. `None` if anything is off.
    pub fn parse(input: &str) -> Option<Self> {
        let url = Url::parse(input).ok()?;
        if url.scheme() != "tsdevice" {
            return None;
        }

        let mut uuid = None;
        let mut public_key = None;
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "uuid" => uuid = Some(value.into_owned()),
                "pub_key" => {
                    let bytes: [u8; KEY_SIZE] = STANDARD.decode(value.as_bytes()).ok()?.try_into().ok()?;
                    public_key = Some(PublicKey::from_bytes(bytes));
                },
                _ => {},
            }
        }
        Some(Self { uuid: uuid?, public_key: public_key? })
    }
}

/// Account material handed from the primary device to the new one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionMessage {
    /// Account phone number
    pub number: Option<String>,
    /// Account stable id, if the primary knows it
    #[serde(default)]
    pub stable_id: Option<String>,
    /// One-time code proving the primary approved the link
    pub provisioning_code: Option<String>,
    /// Account identity key
    pub identity_key: Option<IdentityKeyPair>,
    /// Account profile key
    pub profile_key: Option<ProfileKey>,
    /// User agent of the primary device
    pub user_agent: Option<String>,
    /// Read receipt setting
    #[serde(default)]
    pub read_receipts: bool,
}

impl ProvisionMessage {
    /// CBOR encoding, the plaintext that gets sealed.
    pub fn to_bytes(&self) -> Vec<u8> {
        encode(self)
    }

    /// Decode an opened provision message.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RegistrationError> {
        decode(bytes)
    }
}

pub(crate) fn encode(value: &impl Serialize) -> Vec<u8> {
    let mut bytes = Vec::new();
    let Ok(()) = ciborium::into_writer(value, &mut bytes) else {
        unreachable!("CBOR encoding into a Vec cannot fail");
    };
    bytes
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RegistrationError> {
    ciborium::from_reader(bytes).map_err(|e| RegistrationError::MalformedProvisioning(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_escapes_base64_and_parses_back() {
        // Chosen so the base64 form contains '+', '/' and '='
        let public_key = PublicKey::from_bytes([0xFB; KEY_SIZE]);
        let link = ProvisioningUrl { uuid: "b5a0c3f2-addr".to_string(), public_key };

        let url = link.to_url();

        assert!(url.starts_with("tsdevice:/?uuid=b5a0c3f2-addr&pub_key="));
        assert!(!url.contains('+'));
        assert!(url.contains("%2B") && url.contains("%2F") && url.ends_with("%3D"));
        assert_eq!(ProvisioningUrl::parse(&url), Some(link));
    }

    #[test]
    fn rejects_foreign_urls() {
        assert_eq!(ProvisioningUrl::parse("https://example.org/?uuid=a&pub_key=b"), None);
        assert_eq!(ProvisioningUrl::parse("tsdevice:/?uuid=a"), None);
        assert_eq!(ProvisioningUrl::parse("tsdevice:/?uuid=a&pub_key=c2hvcnQ%3D"), None);
    }

    #[test]
    fn provision_message_decoding_is_checked() {
        let message = ProvisionMessage {
            number: Some("+15550001".to_string()),
            identity_key: Some(IdentityKeyPair::from_seed([4; 32])),
            read_receipts: true,
            ..ProvisionMessage::default()
        };

        assert_eq!(ProvisionMessage::from_bytes(&message.to_bytes()).unwrap(), message);
        assert!(matches!(
            ProvisionMessage::from_bytes(&[0xFF, 0x00]),
            Err(RegistrationError::MalformedProvisioning(_))
        ));
    }
}
