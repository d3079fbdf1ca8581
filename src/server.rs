//! Server-side state store and the in-process transport.
//!
//! DESIGN
//! ======
//! `ServerCore` plays the server processes: it keeps the latest state of
//! every pushed object keyed by global id, hands out id blocks, owns the
//! collaboration roster, and fans every push out to the other connected
//! clients as a `state:changed` notification. Transports only move frames;
//! all semantics live in [`ServerCore::handle`].
//!
//! The core sits behind `Arc<Mutex<_>>` so the TCP front end can serve one
//! thread per connection. Notifications are delivered through per-client
//! unbounded channels and never block the handler.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use frames::{
    CollaborationKind, CollaborationState, DefinitionEntry, DefinitionState, Frame, NoticeKind,
    PropertyState, ProxyState, RosterSnapshot, StateBody, StateMessage, UserEntry,
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};

use crate::error::SmResult;
use crate::location::GlobalId;
use crate::plugins::{PluginInfo, PluginLoader, XmlPluginLoader, definitions_in_configuration};
use crate::session::{
    SYSCALL_CHANGED, SYSCALL_CLAIM_ID, SYSCALL_HELLO, SYSCALL_LIST_PLUGINS, SYSCALL_NOTIFY_CLIENTS, SYSCALL_PULL,
    SYSCALL_PUSH, SYSCALL_RESERVE_IDS, Transport,
};

/// Server class of the object that loads plugins on the server side.
pub const PLUGIN_LOADER_CLASS: &str = "vtkPVPluginLoader";

const MAX_ID_BLOCK: u32 = 1_000_000;

pub type SharedServer = Arc<Mutex<ServerCore>>;

/// Lock the shared server, recovering the data if a holder panicked.
pub fn lock(server: &SharedServer) -> MutexGuard<'_, ServerCore> {
    server.lock().unwrap_or_else(PoisonError::into_inner)
}

struct ClientEntry {
    name: String,
    outbox: UnboundedSender<Frame>,
}

pub struct ServerCore {
    processes: u32,
    next_id: u32,
    next_client: u32,
    master: u32,
    objects: HashMap<u32, StateMessage>,
    clients: BTreeMap<u32, ClientEntry>,
    loader: Box<dyn PluginLoader + Send>,
    plugins: Vec<PluginInfo>,
    definitions: Vec<DefinitionEntry>,
}

impl ServerCore {
    #[must_use]
    pub fn new(processes: u32) -> Self {
        Self::with_plugin_loader(processes, Box::new(XmlPluginLoader))
    }

    #[must_use]
    pub fn with_plugin_loader(processes: u32, loader: Box<dyn PluginLoader + Send>) -> Self {
        Self {
            processes: processes.max(1),
            next_id: GlobalId::RESERVED_MAX + 1,
            next_client: 1,
            master: 0,
            objects: HashMap::new(),
            clients: BTreeMap::new(),
            loader,
            plugins: Vec::new(),
            definitions: Vec::new(),
        }
    }

    #[must_use]
    pub fn shared(self) -> SharedServer {
        Arc::new(Mutex::new(self))
    }

    #[must_use]
    pub fn number_of_processes(&self) -> u32 {
        self.processes
    }

    #[must_use]
    pub fn number_of_clients(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn master(&self) -> u32 {
        self.master
    }

    #[must_use]
    pub fn object_state(&self, id: u32) -> Option<&StateMessage> {
        self.objects.get(&id)
    }

    #[must_use]
    pub fn plugins(&self) -> &[PluginInfo] {
        &self.plugins
    }

    /// Register a client whose notifications go to `outbox`. Returns its id.
    pub fn attach_client(&mut self, outbox: UnboundedSender<Frame>) -> u32 {
        let id = self.next_client;
        self.next_client += 1;
        self.clients.insert(id, ClientEntry { name: format!("User {id}"), outbox });
        if self.master == 0 {
            self.master = id;
        }
        tracing::info!(client = id, "server: client attached");
        id
    }

    /// Drop a client. A departing master hands over to the lowest remaining id.
    pub fn detach_client(&mut self, id: u32) {
        if self.clients.remove(&id).is_none() {
            return;
        }
        if self.master == id {
            self.master = self.clients.keys().next().copied().unwrap_or(0);
        }
        tracing::info!(client = id, master = self.master, "server: client detached");
        self.broadcast_roster(None);
    }

    /// Execute one request on behalf of `client` and build its reply.
    pub fn handle(&mut self, client: u32, frame: Frame) -> Frame {
        match frame.syscall.as_str() {
            SYSCALL_HELLO => self.handle_hello(client, &frame),
            SYSCALL_RESERVE_IDS => {
                let count = frame.data_u32("count").unwrap_or(1).clamp(1, MAX_ID_BLOCK);
                let first = self.next_id;
                let Some(next) = first.checked_add(count) else {
                    tracing::error!(first, count, "server: id space exhausted");
                    return frame.error_with_code("E_IDS_EXHAUSTED", "no global ids left");
                };
                self.next_id = next;
                frame.done().with_data("first", first).with_data("count", count)
            }
            SYSCALL_CLAIM_ID => {
                let Some(id) = frame.data_u32("id") else {
                    return frame.error_with_code("E_BAD_REQUEST", "missing id");
                };
                if id <= GlobalId::RESERVED_MAX {
                    return frame.error_with_code("E_BAD_REQUEST", format!("id {id} is reserved"));
                }
                let Some(after) = id.checked_add(1) else {
                    return frame.error_with_code("E_IDS_EXHAUSTED", format!("id {id} cannot be claimed"));
                };
                if id >= self.next_id {
                    self.next_id = after;
                }
                frame.done()
            }
            SYSCALL_PUSH => self.handle_push(client, &frame),
            SYSCALL_PULL => self.handle_pull(&frame),
            SYSCALL_NOTIFY_CLIENTS => {
                let Some(state) = frame.state.clone() else {
                    return frame.error_with_code("E_BAD_REQUEST", "missing state");
                };
                self.broadcast(Some(client), &state);
                frame.done()
            }
            SYSCALL_LIST_PLUGINS => match serde_json::to_value(&self.plugins) {
                Ok(listing) => frame.done().with_data("plugins", listing),
                Err(e) => frame.error(e.to_string()),
            },
            other => {
                tracing::warn!(syscall = other, client, "server: unknown syscall");
                frame.error_with_code("E_UNKNOWN_SYSCALL", format!("unknown syscall: {other}"))
            }
        }
    }

    fn handle_hello(&mut self, client: u32, frame: &Frame) -> Frame {
        if let Some(user) = frame.data_str("user").filter(|u| !u.is_empty()) {
            if let Some(entry) = self.clients.get_mut(&client) {
                entry.name = user.to_owned();
            }
        }
        self.broadcast_roster(Some(client));
        frame.done().with_data("client", client).with_data("processes", self.processes)
    }

    fn handle_push(&mut self, client: u32, frame: &Frame) -> Frame {
        let Some(state) = frame.state.clone() else {
            return frame.error_with_code("E_BAD_REQUEST", "missing state");
        };
        if state.global_id == 0 {
            return frame.error_with_code("E_BAD_REQUEST", "push without global id");
        }

        if state.global_id == GlobalId::COLLABORATION_MANAGER.get() {
            self.apply_collaboration_notice(&state);
            self.broadcast(Some(client), &state);
            return frame.done();
        }

        match self.objects.get_mut(&state.global_id) {
            Some(existing) => merge_state(existing, &state),
            None => {
                self.objects.insert(state.global_id, state.clone());
            }
        }
        self.run_plugin_loader(&state);
        self.broadcast(Some(client), &state);
        frame.done()
    }

    fn handle_pull(&self, frame: &Frame) -> Frame {
        let Some(request) = frame.state.as_ref() else {
            return frame.error_with_code("E_BAD_REQUEST", "missing state");
        };
        let id = request.global_id;
        if id == GlobalId::DEFINITION_MANAGER.get() {
            let body = StateBody::Definitions(DefinitionState { definitions: self.definitions.clone() });
            return frame.done().with_state(StateMessage::addressed(id, request.location).with_body(body));
        }
        if id == GlobalId::COLLABORATION_MANAGER.get() {
            return frame.done().with_state(self.roster_state());
        }
        match self.objects.get(&id) {
            Some(state) => frame.done().with_state(state.clone()),
            None => frame.error_with_code("E_NOT_FOUND", format!("no state for object {id}")),
        }
    }

    fn apply_collaboration_notice(&mut self, state: &StateMessage) {
        let Some(CollaborationKind::Notice(notice)) = state.collaboration().and_then(|c| c.kind.as_ref()) else {
            return;
        };
        match notice.kind() {
            NoticeKind::UpdateMasterUser if self.clients.contains_key(&notice.client) => {
                self.master = notice.client;
                tracing::info!(master = self.master, "server: master changed");
            }
            NoticeKind::UpdateUserName => {
                if let Some(entry) = self.clients.get_mut(&notice.client) {
                    entry.name.clone_from(&notice.text);
                }
            }
            _ => {}
        }
    }

    fn roster_state(&self) -> StateMessage {
        let users = self.clients.iter().map(|(id, entry)| UserEntry { id: *id, name: entry.name.clone() }).collect();
        let roster = RosterSnapshot { users, master: self.master };
        let body = StateBody::Collaboration(CollaborationState { kind: Some(CollaborationKind::Roster(roster)) });
        StateMessage::addressed(GlobalId::COLLABORATION_MANAGER.get(), 0).with_body(body)
    }

    fn broadcast_roster(&self, except: Option<u32>) {
        let roster = self.roster_state();
        self.broadcast(except, &roster);
    }

    fn broadcast(&self, except: Option<u32>, state: &StateMessage) {
        for (id, entry) in &self.clients {
            if Some(*id) == except {
                continue;
            }
            let mut frame = Frame::notify(SYSCALL_CHANGED).with_state(state.clone());
            if let Some(from) = except {
                frame = frame.with_from(from.to_string());
            }
            if entry.outbox.send(frame).is_err() {
                tracing::debug!(client = id, "server: dropped notification for closed client");
            }
        }
    }

    fn run_plugin_loader(&mut self, pushed: &StateMessage) {
        let Some(stored) = self.objects.get(&pushed.global_id) else {
            return;
        };
        if stored.server_class != PLUGIN_LOADER_CLASS {
            return;
        }
        let Some(props) = pushed.proxy_state() else {
            return;
        };
        let file_name = first_text(props, "FileName");
        let inline_xml = first_text(props, "ConfigurationXML");

        let outcome = match (file_name, inline_xml) {
            (Some(path), _) => self.load_plugin_file(&path),
            (None, Some(xml)) => self.load_configuration(&xml).map(|()| (String::new(), String::new())),
            (None, None) => return,
        };

        let info = match &outcome {
            Ok((name, version)) => vec![
                int_property("Loaded", 1),
                text_property("ErrorString", ""),
                text_property("PluginName", name),
                text_property("PluginVersion", version),
            ],
            Err(e) => vec![int_property("Loaded", 0), text_property("ErrorString", &e.to_string())],
        };
        if let Some(stored) = self.objects.get_mut(&pushed.global_id) {
            let body = StateBody::Proxy(ProxyState { properties: info, sub_proxies: Vec::new() });
            let update = StateMessage::addressed(pushed.global_id, pushed.location).with_body(body);
            merge_state(stored, &update);
        }
    }

    fn load_plugin_file(&mut self, path: &str) -> SmResult<(String, String)> {
        let loaded = match self.loader.load(Path::new(path)) {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!(path, error = %e, "server: plugin load failed");
                return Err(e);
            }
        };
        for xml in &loaded.configurations {
            self.load_configuration(xml)?;
        }
        let info = PluginInfo::loaded_from(path, &loaded.name, &loaded.version);
        self.plugins.retain(|p| p.name != info.name);
        self.plugins.push(info);
        tracing::info!(path, name = %loaded.name, "server: plugin loaded");
        Ok((loaded.name, loaded.version))
    }

    fn load_configuration(&mut self, xml: &str) -> SmResult<()> {
        for entry in definitions_in_configuration(xml)? {
            self.definitions.retain(|d| d.group != entry.group || d.name != entry.name);
            self.definitions.push(entry);
        }
        Ok(())
    }
}

/// Merge `incoming` into `existing`: proxy properties by name, everything else replaced.
fn merge_state(existing: &mut StateMessage, incoming: &StateMessage) {
    for (dst, src) in [
        (&mut existing.client_class, &incoming.client_class),
        (&mut existing.server_class, &incoming.server_class),
        (&mut existing.xml_group, &incoming.xml_group),
        (&mut existing.xml_name, &incoming.xml_name),
        (&mut existing.xml_sub_proxy_name, &incoming.xml_sub_proxy_name),
    ] {
        if !src.is_empty() {
            dst.clone_from(src);
        }
    }
    if incoming.location != 0 {
        existing.location = incoming.location;
    }

    match (&mut existing.body, &incoming.body) {
        (Some(StateBody::Proxy(current)), Some(StateBody::Proxy(update))) => {
            for property in &update.properties {
                match current.properties.iter_mut().find(|p| p.name == property.name) {
                    Some(slot) => *slot = property.clone(),
                    None => current.properties.push(property.clone()),
                }
            }
            for sub in &update.sub_proxies {
                match current.sub_proxies.iter_mut().find(|s| s.name == sub.name) {
                    Some(slot) => *slot = sub.clone(),
                    None => current.sub_proxies.push(sub.clone()),
                }
            }
        }
        (_, Some(body)) => existing.body = Some(body.clone()),
        (_, None) => {}
    }
}

fn first_text(state: &ProxyState, name: &str) -> Option<String> {
    state.property(name).and_then(|p| p.texts.first()).filter(|t| !t.is_empty()).cloned()
}

fn int_property(name: &str, value: i64) -> PropertyState {
    PropertyState { name: name.to_owned(), integers: vec![value], ..PropertyState::default() }
}

fn text_property(name: &str, value: &str) -> PropertyState {
    PropertyState { name: name.to_owned(), texts: vec![value.to_owned()], ..PropertyState::default() }
}

// =============================================================================
// BUILTIN TRANSPORT
// =============================================================================

/// In-process transport: requests call straight into the shared core.
pub struct BuiltinTransport {
    server: SharedServer,
    client: u32,
    inbox: RefCell<UnboundedReceiver<Frame>>,
    closed: Cell<bool>,
}

impl BuiltinTransport {
    pub fn attach(server: &SharedServer) -> Self {
        let (tx, rx) = unbounded_channel();
        let client = lock(server).attach_client(tx);
        Self { server: Arc::clone(server), client, inbox: RefCell::new(rx), closed: Cell::new(false) }
    }

    #[must_use]
    pub fn client(&self) -> u32 {
        self.client
    }
}

impl Transport for BuiltinTransport {
    fn uri(&self) -> String {
        "builtin:".to_owned()
    }

    fn request(&self, frame: Frame) -> SmResult<Frame> {
        if self.closed.get() {
            return Err(crate::error::SmError::TransportClosed);
        }
        Ok(lock(&self.server).handle(self.client, frame))
    }

    fn drain_notifications(&self) -> Vec<Frame> {
        let mut inbox = self.inbox.borrow_mut();
        let mut frames = Vec::new();
        while let Ok(frame) = inbox.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn close(&self) {
        if !self.closed.replace(true) {
            lock(&self.server).detach_client(self.client);
        }
    }
}

impl Drop for BuiltinTransport {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
#[path = "server_test.rs"]
mod tests;
