//! Client-side connection to a set of server processes.
//!
//! DESIGN
//! ======
//! A [`Session`] is a cheap handle (`Rc<SessionInner>`); objects keep a
//! [`WeakSession`] back-reference so dropping the last session handle tears
//! the connection down. All remote traffic goes through a [`Transport`]:
//! request/reply frames for push, pull and id reservation, plus server
//! notifications that are queued by the transport and applied by
//! [`Session::process_notifications`].
//!
//! The session owns its proxy manager and collaboration manager and keeps a
//! weak object table keyed by [`GlobalId`] for routing incoming state.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::net::TcpListener;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use frames::{Frame, StateMessage, Status};

use crate::collaboration::CollaborationManager;
use crate::config::{ServerUrl, SessionConfig};
use crate::definitions::ProxyDefinitionManager;
use crate::error::{SmError, SmResult};
use crate::events::Signal;
use crate::guard::{Progress, RemoteCallScope, ScopedFlag};
use crate::location::{GlobalId, Location};
use crate::locator::ProxyLocator;
use crate::plugins::PluginInfo;
use crate::pxm::SessionProxyManager;
use crate::remote_object::RemoteObject;
use crate::server::{BuiltinTransport, ServerCore, SharedServer};
use crate::tcp::{TcpTransport, reverse_connect_with_listener};
use crate::undo::UndoStackBuilder;

pub const SYSCALL_HELLO: &str = "session:hello";
pub const SYSCALL_PUSH: &str = "state:push";
pub const SYSCALL_PULL: &str = "state:pull";
pub const SYSCALL_CHANGED: &str = "state:changed";
pub const SYSCALL_RESERVE_IDS: &str = "ids:reserve";
pub const SYSCALL_CLAIM_ID: &str = "ids:claim";
pub const SYSCALL_NOTIFY_CLIENTS: &str = "clients:notify";
pub const SYSCALL_LIST_PLUGINS: &str = "plugins:list";

static NEXT_SESSION_ID: AtomicU32 = AtomicU32::new(1);

/// Process-unique session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u32);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frame exchange with the server processes.
pub trait Transport {
    /// Human-readable endpoint, e.g. `builtin:` or `cs://host:port`.
    fn uri(&self) -> String;

    /// Send a request and block until its terminal reply arrives.
    ///
    /// # Errors
    ///
    /// Returns [`SmError::TransportClosed`] or an I/O/codec error.
    fn request(&self, frame: Frame) -> SmResult<Frame>;

    /// Take every notification received so far.
    fn drain_notifications(&self) -> Vec<Frame>;

    fn close(&self);
}

pub struct SessionInner {
    id: SessionId,
    transport: Box<dyn Transport>,
    config: SessionConfig,
    client_id: Cell<u32>,
    number_of_processes: Cell<u32>,
    id_block: Cell<(u32, u32)>,
    objects: RefCell<HashMap<GlobalId, Weak<dyn RemoteObject>>>,
    proxy_manager: Rc<SessionProxyManager>,
    collaboration: Rc<CollaborationManager>,
    in_remote_call: Cell<bool>,
    processing_remote_notification: Cell<bool>,
    alive: Cell<bool>,
    progress: Signal<Progress>,
    undo_builder: RefCell<Option<Rc<UndoStackBuilder>>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if self.alive.get() {
            self.transport.close();
        }
    }
}

#[derive(Clone)]
pub struct Session {
    inner: Rc<SessionInner>,
}

/// Non-owning session back-reference held by remote objects.
#[derive(Clone, Default)]
pub struct WeakSession(Weak<SessionInner>);

impl WeakSession {
    #[must_use]
    pub fn upgrade(&self) -> Option<Session> {
        self.0.upgrade().map(|inner| Session { inner })
    }
}

impl fmt::Debug for WeakSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(session) => write!(f, "WeakSession({})", session.id()),
            None => write!(f, "WeakSession(dead)"),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("uri", &self.inner.transport.uri())
            .field("client_id", &self.inner.client_id.get())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Start an in-process server and connect to it.
    ///
    /// # Errors
    ///
    /// Fails if the handshake with the built-in server fails.
    pub fn builtin() -> SmResult<Self> {
        let server = ServerCore::new(1).shared();
        Self::builtin_with(&server, "client")
    }

    /// Connect to an existing in-process server, typically shared with other sessions.
    ///
    /// # Errors
    ///
    /// Fails if the handshake fails.
    pub fn builtin_with(server: &SharedServer, user: &str) -> SmResult<Self> {
        Self::with_transport(Box::new(BuiltinTransport::attach(server)), user, SessionConfig::default())
    }

    /// Connect according to `config.server_url`.
    ///
    /// # Errors
    ///
    /// Returns [`SmError::Config`] for reverse-connection urls (use
    /// [`Session::reverse_connect_to_remote`]) and transport errors otherwise.
    pub fn connect(config: SessionConfig, user: &str) -> SmResult<Self> {
        match config.server_url.clone() {
            ServerUrl::Builtin => {
                let server = ServerCore::new(config.num_processes).shared();
                Self::with_transport(Box::new(BuiltinTransport::attach(&server)), user, config)
            }
            ServerUrl::Tcp { host, port } => {
                let transport = TcpTransport::connect(&host, port)?;
                Self::with_transport(Box::new(transport), user, config)
            }
            ServerUrl::ReverseTcp { .. } => {
                Err(SmError::Config("reverse connections must use reverse_connect_to_remote".into()))
            }
        }
    }

    /// Listen on `port` until a server connects back.
    ///
    /// `keep_waiting` is polled between accept attempts; returning false aborts.
    ///
    /// # Errors
    ///
    /// Returns [`SmError::ConnectionAborted`] when the callback gives up and
    /// I/O errors from binding or accepting.
    pub fn reverse_connect_to_remote(
        port: u16,
        user: &str,
        config: SessionConfig,
        keep_waiting: impl FnMut() -> bool,
    ) -> SmResult<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))?;
        tracing::info!(port, "session: waiting for server to connect back");
        let poll = Duration::from_millis(config.reverse_connect_poll_ms);
        match reverse_connect_with_listener(&listener, poll, keep_waiting)? {
            Some(transport) => Self::with_transport(Box::new(transport), user, config),
            None => Err(SmError::ConnectionAborted),
        }
    }

    /// Build a session over an established transport and run the handshake.
    ///
    /// # Errors
    ///
    /// Fails if the handshake or the initial state pulls fail.
    pub fn with_transport(transport: Box<dyn Transport>, user: &str, config: SessionConfig) -> SmResult<Self> {
        let inner = Rc::new_cyclic(|weak: &Weak<SessionInner>| {
            let session = WeakSession(weak.clone());
            SessionInner {
                id: SessionId::next(),
                transport,
                config,
                client_id: Cell::new(0),
                number_of_processes: Cell::new(1),
                id_block: Cell::new((0, 0)),
                objects: RefCell::new(HashMap::new()),
                proxy_manager: SessionProxyManager::new(session.clone()),
                collaboration: CollaborationManager::new(session),
                in_remote_call: Cell::new(false),
                processing_remote_notification: Cell::new(false),
                alive: Cell::new(true),
                progress: Signal::new(),
                undo_builder: RefCell::new(None),
            }
        });
        let session = Self { inner };
        session.handshake(user)?;

        let pxm = session.proxy_manager();
        pxm.remote().set_session(&session);
        pxm.remote().set_global_id(GlobalId::PROXY_MANAGER);
        let collaboration = session.collaboration_manager();
        collaboration.remote().set_session(&session);
        collaboration.remote().set_global_id(GlobalId::COLLABORATION_MANAGER);

        collaboration.update_user_information();
        if let Err(e) = pxm.definitions().synchronize_definitions(&session) {
            tracing::warn!(error = %e, "session: definition synchronization failed");
        }
        pxm.update_from_remote();

        tracing::info!(
            session = %session.id(),
            client = session.client_id(),
            uri = %session.uri(),
            "session: connected"
        );
        Ok(session)
    }

    fn handshake(&self, user: &str) -> SmResult<()> {
        let reply = self.call(Frame::request(SYSCALL_HELLO).with_data("user", user))?;
        let client = reply.data_u32("client").ok_or_else(|| SmError::UnexpectedReply(SYSCALL_HELLO.into()))?;
        self.inner.client_id.set(client);
        self.inner.number_of_processes.set(reply.data_u32("processes").unwrap_or(1).max(1));
        Ok(())
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    #[must_use]
    pub fn uri(&self) -> String {
        self.inner.transport.uri()
    }

    /// Id the server assigned to this client.
    #[must_use]
    pub fn client_id(&self) -> u32 {
        self.inner.client_id.get()
    }

    #[must_use]
    pub fn number_of_processes(&self) -> u32 {
        self.inner.number_of_processes.get()
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn proxy_manager(&self) -> Rc<SessionProxyManager> {
        Rc::clone(&self.inner.proxy_manager)
    }

    #[must_use]
    pub fn definition_manager(&self) -> Rc<ProxyDefinitionManager> {
        self.inner.proxy_manager.definitions()
    }

    #[must_use]
    pub fn collaboration_manager(&self) -> Rc<CollaborationManager> {
        Rc::clone(&self.inner.collaboration)
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakSession {
        WeakSession(Rc::downgrade(&self.inner))
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Session) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.inner.alive.get()
    }

    /// Disconnect from the server. Further remote calls fail with
    /// [`SmError::TransportClosed`].
    pub fn close(&self) {
        if self.inner.alive.replace(false) {
            tracing::info!(session = %self.id(), "session: closing");
            self.inner.transport.close();
        }
    }

    #[must_use]
    pub fn progress(&self) -> &Signal<Progress> {
        &self.inner.progress
    }

    #[must_use]
    pub fn is_in_remote_call(&self) -> bool {
        self.inner.in_remote_call.get()
    }

    #[must_use]
    pub fn is_processing_remote_notification(&self) -> bool {
        self.inner.processing_remote_notification.get()
    }

    // =========================================================================
    // OBJECT TABLE
    // =========================================================================

    /// Next unused id, reserving a new block from the server when exhausted.
    ///
    /// # Errors
    ///
    /// Fails if the reservation round trip fails.
    pub fn reserve_global_id(&self) -> SmResult<GlobalId> {
        let (mut next, mut end) = self.inner.id_block.get();
        if next >= end {
            let count = self.inner.config.id_block_size.max(1);
            let reply = self.call(Frame::request(SYSCALL_RESERVE_IDS).with_data("count", count))?;
            let first = reply
                .data_u32("first")
                .ok_or_else(|| SmError::UnexpectedReply(SYSCALL_RESERVE_IDS.into()))?;
            let granted = reply.data_u32("count").unwrap_or(count);
            next = first;
            end = first.saturating_add(granted);
            tracing::debug!(first, count = granted, "session: reserved id block");
        }
        self.inner.id_block.set((next + 1, end));
        Ok(GlobalId::new(next))
    }

    /// Tell the server that `id` is taken so it is never handed out again.
    ///
    /// # Errors
    ///
    /// Fails if the round trip fails.
    pub fn claim_global_id(&self, id: GlobalId) -> SmResult<()> {
        self.call(Frame::request(SYSCALL_CLAIM_ID).with_data("id", id.get()))?;
        let (next, end) = self.inner.id_block.get();
        if (next..end).contains(&id.get()) {
            // The rest of the block may overlap ids claimed by the document.
            self.inner.id_block.set((0, 0));
        }
        Ok(())
    }

    pub fn register_remote_object(&self, id: GlobalId, object: Weak<dyn RemoteObject>) {
        self.inner.objects.borrow_mut().insert(id, object);
    }

    /// Remove the table entry for `id` if it still points at `object`.
    pub fn unregister_remote_object(&self, id: GlobalId, object: &Weak<dyn RemoteObject>) {
        let mut objects = self.inner.objects.borrow_mut();
        if objects.get(&id).is_some_and(|existing| Weak::ptr_eq(existing, object)) {
            objects.remove(&id);
        }
    }

    pub(crate) fn forget_dead_object(&self, id: GlobalId) {
        let Ok(mut objects) = self.inner.objects.try_borrow_mut() else {
            return;
        };
        if objects.get(&id).is_some_and(|existing| existing.strong_count() == 0) {
            objects.remove(&id);
        }
    }

    #[must_use]
    pub fn remote_object(&self, id: GlobalId) -> Option<Rc<dyn RemoteObject>> {
        self.inner.objects.borrow().get(&id).and_then(Weak::upgrade)
    }

    #[must_use]
    pub fn number_of_remote_objects(&self) -> usize {
        self.inner.objects.borrow().values().filter(|o| o.strong_count() > 0).count()
    }

    // =========================================================================
    // REMOTE CALLS
    // =========================================================================

    fn call(&self, frame: Frame) -> SmResult<Frame> {
        if !self.inner.alive.get() {
            return Err(SmError::TransportClosed);
        }
        let syscall = frame.syscall.clone();
        let _scope = RemoteCallScope::enter(&self.inner.in_remote_call, &self.inner.progress, &syscall)?;
        let reply = self.inner.transport.request(frame.with_from(self.client_id().to_string()))?;
        match reply.status {
            Status::Done => Ok(reply),
            Status::Error => {
                let message = reply.data_str(frames::FRAME_MESSAGE).unwrap_or("unknown server error");
                Err(SmError::Remote(message.to_owned()))
            }
            _ => Err(SmError::UnexpectedReply(syscall)),
        }
    }

    /// Send object state to the server processes.
    ///
    /// # Errors
    ///
    /// Propagates transport and server failures.
    pub fn push_state(&self, message: &StateMessage) -> SmResult<()> {
        tracing::trace!(global_id = message.global_id, "session: push");
        self.call(Frame::request(SYSCALL_PUSH).with_state(message.clone()))?;
        Ok(())
    }

    /// Fetch the server's copy of an object's state.
    ///
    /// # Errors
    ///
    /// Returns [`SmError::Remote`] when the server has no state for `id`.
    pub fn pull_state(&self, id: GlobalId, location: Location) -> SmResult<StateMessage> {
        let request = Frame::request(SYSCALL_PULL).with_state(StateMessage::addressed(id.get(), location.bits()));
        let reply = self.call(request)?;
        reply.state.ok_or_else(|| SmError::UnexpectedReply(SYSCALL_PULL.into()))
    }

    /// Relay `message` to every other client without storing it on the server.
    ///
    /// # Errors
    ///
    /// Propagates transport failures.
    pub fn notify_other_clients(&self, message: &StateMessage) -> SmResult<()> {
        self.call(Frame::request(SYSCALL_NOTIFY_CLIENTS).with_state(message.clone()))?;
        Ok(())
    }

    /// Plugins loaded on the server side.
    ///
    /// # Errors
    ///
    /// Propagates transport failures; malformed listings are an unexpected reply.
    pub fn remote_plugins(&self) -> SmResult<Vec<PluginInfo>> {
        let reply = self.call(Frame::request(SYSCALL_LIST_PLUGINS))?;
        let listing = reply.data.get("plugins").cloned().unwrap_or_default();
        if listing.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(listing).map_err(|_| SmError::UnexpectedReply(SYSCALL_LIST_PLUGINS.into()))
    }

    /// Apply every queued server notification. Returns how many were applied.
    ///
    /// Objects updated here never push back to the server.
    pub fn process_notifications(&self) -> usize {
        let notifications = self.inner.transport.drain_notifications();
        let mut applied = 0;
        for frame in notifications {
            if frame.syscall != SYSCALL_CHANGED {
                tracing::debug!(syscall = %frame.syscall, "session: ignoring notification");
                continue;
            }
            let Some(state) = frame.state else {
                continue;
            };
            if self.apply_remote_state(&state) {
                applied += 1;
            }
        }
        applied
    }

    fn apply_remote_state(&self, state: &StateMessage) -> bool {
        let id = GlobalId::new(state.global_id);
        let Some(object) = self.remote_object(id) else {
            tracing::debug!(%id, "session: notification for unknown object ignored");
            return false;
        };
        let _processing = ScopedFlag::set(&self.inner.processing_remote_notification, true);
        let _local = object.remote().local_push_only();
        let locator = ProxyLocator::for_session(self);
        match object.load_state(state, &locator) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(%id, error = %e, "session: failed to apply remote state");
                false
            }
        }
    }

    // =========================================================================
    // UNDO HISTORY
    // =========================================================================

    pub fn set_undo_stack_builder(&self, builder: Option<Rc<UndoStackBuilder>>) {
        *self.inner.undo_builder.borrow_mut() = builder;
    }

    #[must_use]
    pub fn undo_stack_builder(&self) -> Option<Rc<UndoStackBuilder>> {
        self.inner.undo_builder.borrow().clone()
    }

    /// Record an object's state transition with the undo builder, if any.
    pub fn update_state_history(&self, id: GlobalId, before: &StateMessage, after: &StateMessage) {
        if self.is_processing_remote_notification() {
            return;
        }
        let builder = self.inner.undo_builder.borrow().clone();
        if let Some(builder) = builder {
            builder.on_state_change(id, before, after);
        }
    }
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;
