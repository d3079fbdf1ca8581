//! Protobuf schema for object state carried inside frames.
//!
//! A [`StateMessage`] is the unit of replication: it names the remote object
//! (`global_id`), where its counterpart lives (`location`), how to construct
//! it (`client_class` / `xml_group` / `xml_name`), and a typed body. The same
//! struct doubles as the in-memory message model on both sides of the wire.

use prost::Message;
use serde::{Deserialize, Serialize};

use crate::CodecError;

/// Newest registration-state layout this crate writes.
pub const REGISTRATION_STATE_VERSION: u32 = 1;

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct StateMessage {
    #[prost(uint32, tag = "1")]
    pub global_id: u32,
    #[prost(uint32, tag = "2")]
    pub location: u32,
    #[prost(string, tag = "3")]
    pub client_class: String,
    #[prost(string, tag = "4")]
    pub server_class: String,
    #[prost(string, tag = "5")]
    pub xml_group: String,
    #[prost(string, tag = "6")]
    pub xml_name: String,
    #[prost(string, tag = "7")]
    pub xml_sub_proxy_name: String,
    #[prost(oneof = "StateBody", tags = "10, 11, 12, 13, 14, 15")]
    pub body: Option<StateBody>,
}

#[derive(Clone, PartialEq, prost::Oneof, Serialize, Deserialize)]
pub enum StateBody {
    #[prost(message, tag = "10")]
    Proxy(ProxyState),
    #[prost(message, tag = "11")]
    Registration(RegistrationState),
    #[prost(message, tag = "12")]
    Link(LinkState),
    #[prost(message, tag = "13")]
    Selection(SelectionState),
    #[prost(message, tag = "14")]
    Collaboration(CollaborationState),
    #[prost(message, tag = "15")]
    Definitions(DefinitionState),
}

impl StateMessage {
    /// Empty message addressed to `global_id`, typically used as a pull request.
    #[must_use]
    pub fn addressed(global_id: u32, location: u32) -> Self {
        Self { global_id, location, ..Self::default() }
    }

    #[must_use]
    pub fn with_body(mut self, body: StateBody) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn proxy_state(&self) -> Option<&ProxyState> {
        match &self.body {
            Some(StateBody::Proxy(state)) => Some(state),
            _ => None,
        }
    }

    #[must_use]
    pub fn registration(&self) -> Option<&RegistrationState> {
        match &self.body {
            Some(StateBody::Registration(state)) => Some(state),
            _ => None,
        }
    }

    #[must_use]
    pub fn link(&self) -> Option<&LinkState> {
        match &self.body {
            Some(StateBody::Link(state)) => Some(state),
            _ => None,
        }
    }

    #[must_use]
    pub fn selection(&self) -> Option<&SelectionState> {
        match &self.body {
            Some(StateBody::Selection(state)) => Some(state),
            _ => None,
        }
    }

    #[must_use]
    pub fn collaboration(&self) -> Option<&CollaborationState> {
        match &self.body {
            Some(StateBody::Collaboration(state)) => Some(state),
            _ => None,
        }
    }

    #[must_use]
    pub fn definitions(&self) -> Option<&DefinitionState> {
        match &self.body {
            Some(StateBody::Definitions(state)) => Some(state),
            _ => None,
        }
    }
}

// =============================================================================
// PROXY STATE
// =============================================================================

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyState {
    #[prost(message, repeated, tag = "1")]
    pub properties: Vec<PropertyState>,
    #[prost(message, repeated, tag = "2")]
    pub sub_proxies: Vec<SubProxyEntry>,
}

impl ProxyState {
    #[must_use]
    pub fn property(&self, name: &str) -> Option<&PropertyState> {
        self.properties.iter().find(|p| p.name == name)
    }
}

/// Values of one property. Only the vector matching the property kind is used.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyState {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(int64, repeated, tag = "2")]
    pub integers: Vec<i64>,
    #[prost(double, repeated, tag = "3")]
    pub doubles: Vec<f64>,
    #[prost(string, repeated, tag = "4")]
    pub texts: Vec<String>,
    #[prost(uint32, repeated, tag = "5")]
    pub proxies: Vec<u32>,
    #[prost(uint32, repeated, tag = "6")]
    pub ports: Vec<u32>,
}

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct SubProxyEntry {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint32, tag = "2")]
    pub global_id: u32,
}

// =============================================================================
// REGISTRATION STATE
// =============================================================================

/// Every non-prototype registration held by a session proxy manager.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationState {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(message, repeated, tag = "2")]
    pub proxies: Vec<ProxyEntry>,
    #[prost(message, repeated, tag = "3")]
    pub links: Vec<NamedEntry>,
    #[prost(message, repeated, tag = "4")]
    pub selection_models: Vec<NamedEntry>,
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyEntry {
    #[prost(string, tag = "1")]
    pub group: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(uint32, tag = "3")]
    pub global_id: u32,
}

impl ProxyEntry {
    pub fn new(group: impl Into<String>, name: impl Into<String>, global_id: u32) -> Self {
        Self { group: group.into(), name: name.into(), global_id }
    }
}

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct NamedEntry {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(uint32, tag = "2")]
    pub global_id: u32,
}

impl NamedEntry {
    pub fn new(name: impl Into<String>, global_id: u32) -> Self {
        Self { name: name.into(), global_id }
    }
}

/// Encode a registration-state document, stamping the current version.
#[must_use]
pub fn encode_registration_state(state: &RegistrationState) -> Vec<u8> {
    let mut stamped = state.clone();
    stamped.version = REGISTRATION_STATE_VERSION;
    stamped.encode_to_vec()
}

/// Decode a registration-state document.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes and
/// [`CodecError::UnsupportedVersion`] for documents newer than this crate.
pub fn decode_registration_state(bytes: &[u8]) -> Result<RegistrationState, CodecError> {
    let state = RegistrationState::decode(bytes)?;
    if state.version > REGISTRATION_STATE_VERSION {
        return Err(CodecError::UnsupportedVersion(state.version));
    }
    Ok(state)
}

/// Encode any state message into standalone protobuf bytes.
#[must_use]
pub fn encode_state(state: &StateMessage) -> Vec<u8> {
    state.encode_to_vec()
}

/// Decode standalone protobuf bytes into a state message.
///
/// # Errors
///
/// Returns [`CodecError::Decode`] for malformed bytes.
pub fn decode_state(bytes: &[u8]) -> Result<StateMessage, CodecError> {
    Ok(StateMessage::decode(bytes)?)
}

// =============================================================================
// LINKS AND SELECTION
// =============================================================================

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkState {
    #[prost(message, repeated, tag = "1")]
    pub members: Vec<LinkMember>,
    #[prost(string, repeated, tag = "2")]
    pub exceptions: Vec<String>,
    #[prost(bool, tag = "3")]
    pub propagate_update: bool,
}

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkMember {
    #[prost(uint32, tag = "1")]
    pub proxy: u32,
    /// Empty for whole-proxy links.
    #[prost(string, tag = "2")]
    pub property: String,
    #[prost(enumeration = "LinkDirection", tag = "3")]
    pub direction: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum LinkDirection {
    None = 0,
    Input = 1,
    Output = 2,
}

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionState {
    #[prost(uint32, tag = "1")]
    pub current: u32,
    #[prost(uint32, repeated, tag = "2")]
    pub selection: Vec<u32>,
}

// =============================================================================
// COLLABORATION
// =============================================================================

/// Either a full roster snapshot (bootstrap) or a single live notice.
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaborationState {
    #[prost(oneof = "CollaborationKind", tags = "1, 2")]
    pub kind: Option<CollaborationKind>,
}

#[derive(Clone, PartialEq, prost::Oneof, Serialize, Deserialize)]
pub enum CollaborationKind {
    #[prost(message, tag = "1")]
    Roster(RosterSnapshot),
    #[prost(message, tag = "2")]
    Notice(CollaborationNotice),
}

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct RosterSnapshot {
    #[prost(message, repeated, tag = "1")]
    pub users: Vec<UserEntry>,
    #[prost(uint32, tag = "2")]
    pub master: u32,
}

#[derive(Clone, PartialEq, Eq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct UserEntry {
    #[prost(uint32, tag = "1")]
    pub id: u32,
    #[prost(string, tag = "2")]
    pub name: String,
}

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct CollaborationNotice {
    #[prost(enumeration = "NoticeKind", tag = "1")]
    pub kind: i32,
    /// Client the notice is about (renamed user, new master, followed user).
    #[prost(uint32, tag = "2")]
    pub client: u32,
    #[prost(string, tag = "3")]
    pub text: String,
    #[prost(double, repeated, tag = "4")]
    pub camera: Vec<f64>,
    /// Application payload for free-form collaboration notifications.
    #[prost(message, optional, boxed, tag = "5")]
    pub message: Option<Box<StateMessage>>,
}

/// Collaboration notice kinds. Discriminants double as event ids.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, prost::Enumeration)]
#[repr(i32)]
pub enum NoticeKind {
    Unspecified = 0,
    CollaborationNotification = 12345,
    UpdateUserName = 12346,
    UpdateUserList = 12347,
    UpdateMasterUser = 12348,
    FollowUserCamera = 12349,
    CameraChanged = 12350,
}

// =============================================================================
// DEFINITIONS
// =============================================================================

/// Proxy definitions shipped between processes (server-side plugins).
#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct DefinitionState {
    #[prost(message, repeated, tag = "1")]
    pub definitions: Vec<DefinitionEntry>,
}

#[derive(Clone, PartialEq, Message, Serialize, Deserialize)]
#[serde(default)]
pub struct DefinitionEntry {
    #[prost(string, tag = "1")]
    pub group: String,
    #[prost(string, tag = "2")]
    pub name: String,
    /// Serialized XML element of the definition.
    #[prost(string, tag = "3")]
    pub xml: String,
    #[prost(bool, tag = "4")]
    pub custom: bool,
}
