//! Client-side server manager: proxies for remote objects, per-session
//! registries, and state synchronization between collaborating clients.
//!
//! A [`Session`] connects to a server (in-process or over TCP). Each session
//! owns a [`SessionProxyManager`] where proxies built from XML definitions
//! are registered under `(group, name)` tuples. Registrations and property
//! values are pushed to the server, which relays them to every other client
//! connected to it; those clients apply the changes without echoing them
//! back. The process-wide [`ProxyManager`] tracks the sessions and owns the
//! services they share.

pub mod collaboration;
pub mod config;
pub mod definitions;
pub mod domain;
pub mod error;
pub mod events;
pub mod factory;
pub mod global_properties;
pub mod guard;
pub mod link;
pub mod location;
pub mod locator;
pub mod plugins;
pub mod property;
pub mod proxy;
pub mod proxy_manager;
pub mod pxm;
pub mod readers;
pub mod remote_object;
pub mod selection;
pub mod server;
pub mod session;
pub mod state_loader;
pub mod tcp;
pub mod undo;
pub mod version;
pub mod writers;
pub mod xml;

pub use collaboration::CollaborationManager;
pub use config::{ServerUrl, SessionConfig};
pub use definitions::ProxyDefinitionManager;
pub use error::{ErrorCode, SmError, SmResult};
pub use events::{ObserverId, Signal};
pub use global_properties::{GlobalPropertiesManager, GlobalPropertiesRegistry};
pub use link::{Link, LinkKind};
pub use location::{GlobalId, Location};
pub use locator::ProxyLocator;
pub use plugins::{PluginInfo, PluginManager};
pub use property::{Elements, Property};
pub use proxy::{Proxy, ProxyRef};
pub use proxy_manager::ProxyManager;
pub use pxm::{RegistrationEvent, RegistrationFilter, SessionProxyManager};
pub use readers::ReaderFactory;
pub use remote_object::RemoteObject;
pub use selection::{ProxySelectionModel, SelectionCommand};
pub use server::{ServerCore, SharedServer};
pub use session::{Session, SessionId};
pub use undo::{UndoStack, UndoStackBuilder};
pub use version::{CURRENT_STATE_VERSION, StateVersion};
pub use writers::WriterFactory;
pub use xml::XmlElement;

#[cfg(test)]
pub mod test_helpers {
    use super::*;

    /// Session on a private in-process server.
    #[must_use]
    pub fn builtin_session() -> Session {
        Session::builtin().expect("builtin session should connect")
    }

    /// Two sessions sharing one in-process server, with their startup
    /// notifications already drained.
    #[must_use]
    pub fn collaborating_sessions() -> (SharedServer, Session, Session) {
        let server = ServerCore::new(1).shared();
        let a = Session::builtin_with(&server, "alice").expect("first session should connect");
        let b = Session::builtin_with(&server, "bob").expect("second session should connect");
        a.process_notifications();
        b.process_notifications();
        (server, a, b)
    }

    /// Unregistered sphere source built by `session`'s proxy manager.
    #[must_use]
    pub fn sphere(session: &Session) -> ProxyRef {
        session.proxy_manager().new_proxy("sources", "SphereSource", None).expect("sphere definition is built in")
    }

    /// Unregistered shrink filter fed by `input`.
    #[must_use]
    pub fn shrink(session: &Session, input: &ProxyRef) -> ProxyRef {
        let filter =
            session.proxy_manager().new_proxy("filters", "Shrink", None).expect("shrink definition is built in");
        filter.set_proxy_input("Input", input, 0);
        filter
    }
}
