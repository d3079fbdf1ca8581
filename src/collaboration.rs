//! Multi-client roster, master arbitration and client-to-client notices.
//!
//! DESIGN
//! ======
//! The server owns the authoritative roster and master id. This manager
//! mirrors them: it pulls a roster snapshot on connect, receives snapshots
//! whenever clients join or leave, and receives single notices (renames,
//! master changes, camera following) relayed from other clients. Notices
//! this client sends are pushed under [`GlobalId::COLLABORATION_MANAGER`];
//! the server applies the ones it cares about and relays them to everyone
//! else, never back to the sender.
//!
//! Being master is advisory. Consumers ask [`CollaborationManager::is_master`]
//! before doing things only one client should do.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use frames::{
    CollaborationKind, CollaborationNotice, CollaborationState, NoticeKind, RosterSnapshot, StateBody, StateMessage,
    UserEntry,
};

use crate::error::{SmError, SmResult};
use crate::events::Signal;
use crate::location::{GlobalId, Location};
use crate::locator::ProxyLocator;
use crate::remote_object::{RemoteCore, RemoteObject};
use crate::session::WeakSession;

pub const CLIENT_CLASS: &str = "SMCollaborationManager";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRenamed {
    pub client: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CameraUpdate {
    pub client: u32,
    pub camera: Vec<f64>,
}

pub struct CollaborationManager {
    remote: RemoteCore,
    session: WeakSession,
    users: RefCell<Vec<UserEntry>>,
    master: Cell<u32>,
    followed: Cell<u32>,
    pub user_list_changed: Signal<()>,
    pub master_changed: Signal<u32>,
    pub user_renamed: Signal<UserRenamed>,
    /// The master asked every client to follow this user's camera.
    pub follow_user_camera: Signal<u32>,
    pub camera_changed: Signal<CameraUpdate>,
    /// Free-form payloads sent with [`CollaborationManager::send_notification`].
    pub notification: Signal<StateMessage>,
}

impl fmt::Debug for CollaborationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollaborationManager")
            .field("users", &self.users.borrow().len())
            .field("master", &self.master.get())
            .field("followed", &self.followed.get())
            .finish_non_exhaustive()
    }
}

impl CollaborationManager {
    pub fn new(session: WeakSession) -> Rc<Self> {
        Rc::new_cyclic(|weak: &Weak<CollaborationManager>| {
            let owner: Weak<dyn RemoteObject> = weak.clone();
            CollaborationManager {
                remote: RemoteCore::new(owner, Location::DATA_SERVER),
                session,
                users: RefCell::new(Vec::new()),
                master: Cell::new(0),
                followed: Cell::new(0),
                user_list_changed: Signal::new(),
                master_changed: Signal::new(),
                user_renamed: Signal::new(),
                follow_user_camera: Signal::new(),
                camera_changed: Signal::new(),
                notification: Signal::new(),
            }
        })
    }

    /// Id the server assigned to this client.
    #[must_use]
    pub fn user_id(&self) -> u32 {
        self.session.upgrade().map_or(0, |s| s.client_id())
    }

    #[must_use]
    pub fn master_id(&self) -> u32 {
        self.master.get()
    }

    #[must_use]
    pub fn is_master(&self) -> bool {
        let me = self.user_id();
        me != 0 && me == self.master.get()
    }

    #[must_use]
    pub fn number_of_connected_clients(&self) -> usize {
        self.users.borrow().len()
    }

    #[must_use]
    pub fn user_id_at(&self, index: usize) -> Option<u32> {
        self.users.borrow().get(index).map(|u| u.id)
    }

    #[must_use]
    pub fn user_label(&self, id: u32) -> Option<String> {
        self.users.borrow().iter().find(|u| u.id == id).map(|u| u.name.clone())
    }

    /// Rename this client.
    pub fn set_user_label(&self, name: &str) {
        self.set_user_label_for(self.user_id(), name);
    }

    /// Rename any client and tell the others.
    pub fn set_user_label_for(&self, id: u32, name: &str) {
        let changed = {
            let mut users = self.users.borrow_mut();
            match users.iter_mut().find(|u| u.id == id) {
                Some(user) if user.name == name => false,
                Some(user) => {
                    name.clone_into(&mut user.name);
                    true
                }
                None => {
                    users.push(UserEntry { id, name: name.to_owned() });
                    users.sort_by_key(|u| u.id);
                    true
                }
            }
        };
        if !changed {
            return;
        }
        self.push_notice(CollaborationNotice {
            kind: NoticeKind::UpdateUserName.into(),
            client: id,
            text: name.to_owned(),
            ..CollaborationNotice::default()
        });
        self.user_renamed.emit(&UserRenamed { client: id, name: name.to_owned() });
    }

    /// Make `client` the master and tell the server and the other clients.
    pub fn promote_to_master(&self, client: u32) {
        if !self.users.borrow().iter().any(|u| u.id == client) {
            tracing::warn!(client, "collab: cannot promote unknown client");
            return;
        }
        if self.master.replace(client) == client {
            return;
        }
        self.push_notice(CollaborationNotice {
            kind: NoticeKind::UpdateMasterUser.into(),
            client,
            ..CollaborationNotice::default()
        });
        tracing::info!(master = client, "collab: promoted to master");
        self.master_changed.emit(&client);
    }

    /// Follow `client`'s camera locally. A master also asks every other
    /// client to follow it.
    pub fn follow_user(&self, client: u32) {
        if self.followed.replace(client) == client {
            return;
        }
        if self.is_master() {
            self.push_notice(CollaborationNotice {
                kind: NoticeKind::FollowUserCamera.into(),
                client,
                ..CollaborationNotice::default()
            });
        }
    }

    #[must_use]
    pub fn followed_user(&self) -> u32 {
        self.followed.get()
    }

    /// Share this client's camera with the others.
    pub fn broadcast_camera(&self, camera: &[f64]) {
        self.push_notice(CollaborationNotice {
            kind: NoticeKind::CameraChanged.into(),
            client: self.user_id(),
            camera: camera.to_vec(),
            ..CollaborationNotice::default()
        });
    }

    /// Relay an application message to every other client.
    pub fn send_notification(&self, payload: StateMessage) -> bool {
        let notice = CollaborationNotice {
            kind: NoticeKind::CollaborationNotification.into(),
            client: self.user_id(),
            message: Some(Box::new(payload)),
            ..CollaborationNotice::default()
        };
        self.send_to_other_clients(&self.notice_message(notice))
    }

    /// Relay `message` to the other clients without storing it on the
    /// server. It is never delivered back to this client.
    pub fn send_to_other_clients(&self, message: &StateMessage) -> bool {
        let Some(session) = self.session.upgrade() else {
            return false;
        };
        if session.is_processing_remote_notification() {
            return false;
        }
        match session.notify_other_clients(message) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(error = %e, "collab: could not reach other clients");
                false
            }
        }
    }

    /// Refresh the roster and master from the server.
    pub fn update_user_information(&self) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        match session.pull_state(GlobalId::COLLABORATION_MANAGER, Location::DATA_SERVER) {
            Ok(state) => {
                if let Err(e) = self.apply(&state) {
                    tracing::warn!(error = %e, "collab: bad roster");
                }
            }
            Err(e) => tracing::warn!(error = %e, "collab: could not fetch roster"),
        }
    }

    fn notice_message(&self, notice: CollaborationNotice) -> StateMessage {
        StateMessage {
            global_id: GlobalId::COLLABORATION_MANAGER.get(),
            location: Location::DATA_SERVER.bits(),
            client_class: CLIENT_CLASS.to_owned(),
            ..StateMessage::default()
        }
        .with_body(StateBody::Collaboration(CollaborationState { kind: Some(CollaborationKind::Notice(notice)) }))
    }

    fn push_notice(&self, notice: CollaborationNotice) {
        if let Err(e) = self.remote.push_state(self.notice_message(notice)) {
            tracing::error!(error = %e, "collab: could not send notice");
        }
    }

    fn roster(&self) -> RosterSnapshot {
        RosterSnapshot { users: self.users.borrow().clone(), master: self.master.get() }
    }

    fn apply(&self, message: &StateMessage) -> SmResult<()> {
        let kind = message.collaboration().and_then(|c| c.kind.as_ref());
        match kind {
            Some(CollaborationKind::Roster(roster)) => {
                self.apply_roster(roster);
                Ok(())
            }
            Some(CollaborationKind::Notice(notice)) => {
                self.apply_notice(notice);
                Ok(())
            }
            None => Err(SmError::UnexpectedReply(format!("state {} is not a collaboration state", message.global_id))),
        }
    }

    fn apply_roster(&self, roster: &RosterSnapshot) {
        let mut users = roster.users.clone();
        users.sort_by_key(|u| u.id);
        let changed = *self.users.borrow() != users;
        *self.users.borrow_mut() = users;
        if self.followed.get() != 0 && self.user_label(self.followed.get()).is_none() {
            self.followed.set(0);
        }
        if changed {
            tracing::debug!(clients = self.number_of_connected_clients(), "collab: roster updated");
            self.user_list_changed.emit(&());
        }
        if self.master.replace(roster.master) != roster.master {
            self.master_changed.emit(&roster.master);
        }
    }

    fn apply_notice(&self, notice: &CollaborationNotice) {
        match notice.kind() {
            NoticeKind::UpdateUserName => {
                if let Some(user) = self.users.borrow_mut().iter_mut().find(|u| u.id == notice.client) {
                    user.name.clone_from(&notice.text);
                }
                self.user_renamed.emit(&UserRenamed { client: notice.client, name: notice.text.clone() });
            }
            NoticeKind::UpdateMasterUser => {
                if self.master.replace(notice.client) != notice.client {
                    self.master_changed.emit(&notice.client);
                }
            }
            NoticeKind::UpdateUserList => self.update_user_information(),
            NoticeKind::FollowUserCamera => {
                self.followed.set(notice.client);
                self.follow_user_camera.emit(&notice.client);
            }
            NoticeKind::CameraChanged => {
                if notice.client == self.followed.get() {
                    self.camera_changed.emit(&CameraUpdate { client: notice.client, camera: notice.camera.clone() });
                }
            }
            NoticeKind::CollaborationNotification => {
                if let Some(payload) = &notice.message {
                    self.notification.emit(payload);
                }
            }
            NoticeKind::Unspecified => tracing::debug!("collab: ignoring notice without kind"),
        }
    }
}

impl RemoteObject for CollaborationManager {
    fn remote(&self) -> &RemoteCore {
        &self.remote
    }

    /// Roster snapshot as currently known.
    fn full_state(&self) -> Option<StateMessage> {
        let body = StateBody::Collaboration(CollaborationState { kind: Some(CollaborationKind::Roster(self.roster())) });
        Some(StateMessage::addressed(GlobalId::COLLABORATION_MANAGER.get(), Location::DATA_SERVER.bits()).with_body(body))
    }

    fn load_state(&self, message: &StateMessage, _locator: &ProxyLocator) -> SmResult<()> {
        self.apply(message)
    }
}

#[cfg(test)]
#[path = "collaboration_test.rs"]
mod tests;
