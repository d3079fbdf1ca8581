//! Plugin loading and bookkeeping.
//!
//! DESIGN
//! ======
//! Loading a plugin means obtaining its server-manager configuration XML and
//! merging it into a definition manager. The mechanics of obtaining that XML
//! sit behind [`PluginLoader`]; the shipped [`XmlPluginLoader`] reads plugin
//! descriptor files. Local plugins are merged into every registered
//! session's definitions directly. Remote plugins are loaded by the server
//! through a `misc/PluginLoader` proxy, after which the session pulls the new
//! definitions back.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use frames::DefinitionEntry;
use serde::{Deserialize, Serialize};

use crate::error::{SmError, SmResult};
use crate::events::Signal;
use crate::guard::ScopedFlag;
use crate::session::{Session, SessionId, WeakSession};
use crate::xml::XmlElement;

/// Descriptor file extension searched for by [`PluginManager::locate_plugin`].
pub const PLUGIN_FILE_EXTENSION: &str = "xml";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub file_name: String,
    pub loaded: bool,
    pub auto_load: bool,
    pub required_on_server: bool,
    pub required_on_client: bool,
    pub error: Option<String>,
}

impl PluginInfo {
    #[must_use]
    pub fn loaded_from(file_name: &str, name: &str, version: &str) -> Self {
        Self {
            name: name.to_owned(),
            version: version.to_owned(),
            file_name: file_name.to_owned(),
            loaded: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failed(file_name: &str, error: &str) -> Self {
        let name = Path::new(file_name).file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        Self { name, file_name: file_name.to_owned(), error: Some(error.to_owned()), ..Self::default() }
    }
}

/// Ordered set of plugin records, one per plugin name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PluginsInformation {
    plugins: Vec<PluginInfo>,
}

impl PluginsInformation {
    #[must_use]
    pub fn from_plugins(plugins: Vec<PluginInfo>) -> Self {
        let mut info = Self::default();
        for plugin in plugins {
            info.update(plugin);
        }
        info
    }

    /// Insert or replace the record for `plugin.name`. A failed attempt never
    /// overwrites a successful load.
    pub fn update(&mut self, plugin: PluginInfo) {
        match self.plugins.iter_mut().find(|p| p.name == plugin.name) {
            Some(existing) if existing.loaded && !plugin.loaded => {}
            Some(existing) => *existing = plugin,
            None => self.plugins.push(plugin),
        }
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&PluginInfo> {
        self.plugins.iter().find(|p| p.name == name)
    }

    #[must_use]
    pub fn is_loaded(&self, name: &str) -> bool {
        self.find(name).is_some_and(|p| p.loaded)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PluginInfo> {
        self.plugins.iter()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// What a loader extracted from a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoadedPlugin {
    pub name: String,
    pub version: String,
    pub required_on_server: bool,
    pub required_on_client: bool,
    /// `<ServerManagerConfiguration>` documents provided by the plugin.
    pub configurations: Vec<String>,
}

pub trait PluginLoader {
    /// Load the plugin at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`SmError::PluginLoad`] when the file is missing or malformed.
    fn load(&self, path: &Path) -> SmResult<LoadedPlugin>;
}

/// Loads `<Plugin name version>` descriptor files embedding
/// `<ServerManagerConfiguration>` elements.
#[derive(Debug, Clone, Copy, Default)]
pub struct XmlPluginLoader;

impl PluginLoader for XmlPluginLoader {
    fn load(&self, path: &Path) -> SmResult<LoadedPlugin> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SmError::PluginLoad(format!("{}: {e}", path.display())))?;
        let root = XmlElement::parse(&text).map_err(|e| SmError::PluginLoad(format!("{}: {e}", path.display())))?;
        if root.name != "Plugin" {
            return Err(SmError::PluginLoad(format!("{}: root element is <{}>", path.display(), root.name)));
        }
        let name = match root.attribute("name") {
            Some(name) => name.to_owned(),
            None => path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default(),
        };
        let configurations = root
            .children_named("ServerManagerConfiguration")
            .map(XmlElement::to_fragment)
            .collect::<SmResult<Vec<_>>>()?;
        Ok(LoadedPlugin {
            name,
            version: root.attribute("version").unwrap_or_default().to_owned(),
            required_on_server: root.attribute_flag("required_on_server"),
            required_on_client: root.attribute_flag("required_on_client"),
            configurations,
        })
    }
}

/// Flatten a `<ServerManagerConfiguration>` document into definition records.
///
/// # Errors
///
/// Fails for unparsable XML or a different root element.
pub fn definitions_in_configuration(xml: &str) -> SmResult<Vec<DefinitionEntry>> {
    let root = XmlElement::parse(xml)?;
    if root.name != "ServerManagerConfiguration" {
        return Err(SmError::MalformedXml(format!("expected <ServerManagerConfiguration>, found <{}>", root.name)));
    }
    let mut entries = Vec::new();
    for group in root.children_named("ProxyGroup") {
        let Some(group_name) = group.attribute("name") else {
            continue;
        };
        for definition in &group.children {
            let Some(name) = definition.attribute("name") else {
                continue;
            };
            entries.push(DefinitionEntry {
                group: group_name.to_owned(),
                name: name.to_owned(),
                xml: definition.to_fragment()?,
                custom: false,
            });
        }
    }
    Ok(entries)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginLoaded {
    pub info: PluginInfo,
    /// Session the plugin was loaded into remotely; `None` for local loads.
    pub session: Option<SessionId>,
}

pub struct PluginManager {
    loader: Box<dyn PluginLoader>,
    sessions: RefCell<Vec<WeakSession>>,
    local: RefCell<PluginsInformation>,
    local_configurations: RefCell<Vec<String>>,
    remote: RefCell<HashMap<SessionId, PluginsInformation>>,
    search_paths: RefCell<Vec<PathBuf>>,
    in_load_plugin: Cell<bool>,
    pub plugin_loaded: Signal<PluginLoaded>,
    pub local_plugin_loaded: Signal<PluginLoaded>,
    pub remote_plugin_loaded: Signal<PluginLoaded>,
}

impl Default for PluginManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginManager {
    #[must_use]
    pub fn new() -> Self {
        Self::with_loader(Box::new(XmlPluginLoader))
    }

    #[must_use]
    pub fn with_loader(loader: Box<dyn PluginLoader>) -> Self {
        Self {
            loader,
            sessions: RefCell::new(Vec::new()),
            local: RefCell::new(PluginsInformation::default()),
            local_configurations: RefCell::new(Vec::new()),
            remote: RefCell::new(HashMap::new()),
            search_paths: RefCell::new(Vec::new()),
            in_load_plugin: Cell::new(false),
            plugin_loaded: Signal::new(),
            local_plugin_loaded: Signal::new(),
            remote_plugin_loaded: Signal::new(),
        }
    }

    /// Track `session`: local plugins already loaded are merged into its
    /// definitions and its remote plugin list is fetched.
    pub fn register_session(&self, session: &Session) {
        self.sessions.borrow_mut().retain(|s| s.upgrade().is_some_and(|s| !s.ptr_eq(session)));
        self.sessions.borrow_mut().push(session.downgrade());

        let configurations = self.local_configurations.borrow().clone();
        let definitions = session.definition_manager();
        for xml in &configurations {
            if let Err(e) = definitions.load_configuration_xml(xml) {
                tracing::warn!(session = %session.id(), error = %e, "plugins: could not replay local plugin");
            }
        }
        self.update_plugins_information(session);
    }

    pub fn unregister_session(&self, id: SessionId) {
        self.sessions.borrow_mut().retain(|s| s.upgrade().is_some_and(|s| s.id() != id));
        self.remote.borrow_mut().remove(&id);
    }

    fn live_sessions(&self) -> Vec<Session> {
        self.sessions.borrow().iter().filter_map(WeakSession::upgrade).collect()
    }

    /// True while a plugin load is in progress.
    #[must_use]
    pub fn is_loading_plugin(&self) -> bool {
        self.in_load_plugin.get()
    }

    pub fn add_search_path(&self, path: impl Into<PathBuf>) {
        let path = path.into();
        let mut paths = self.search_paths.borrow_mut();
        if !paths.contains(&path) {
            paths.push(path);
        }
    }

    #[must_use]
    pub fn plugin_search_paths(&self) -> Vec<PathBuf> {
        self.search_paths.borrow().clone()
    }

    /// First `<dir>/<name>.xml` found along the search paths.
    #[must_use]
    pub fn locate_plugin(&self, name: &str) -> Option<PathBuf> {
        self.search_paths
            .borrow()
            .iter()
            .map(|dir| dir.join(name).with_extension(PLUGIN_FILE_EXTENSION))
            .find(|candidate| candidate.is_file())
    }

    /// Load a plugin into this process. Returns false on failure.
    pub fn load_local_plugin(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        let file_name = path.display().to_string();
        let _loading = ScopedFlag::set(&self.in_load_plugin, true);

        let loaded = match self.loader.load(path) {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::error!(path = %file_name, error = %e, "plugins: local load failed");
                self.local.borrow_mut().update(PluginInfo::failed(&file_name, &e.to_string()));
                return false;
            }
        };

        for xml in &loaded.configurations {
            for session in self.live_sessions() {
                if let Err(e) = session.definition_manager().load_configuration_xml(xml) {
                    tracing::error!(path = %file_name, error = %e, "plugins: invalid configuration");
                    self.local.borrow_mut().update(PluginInfo::failed(&file_name, &e.to_string()));
                    return false;
                }
            }
            self.local_configurations.borrow_mut().push(xml.clone());
        }

        let mut info = PluginInfo::loaded_from(&file_name, &loaded.name, &loaded.version);
        info.required_on_server = loaded.required_on_server;
        info.required_on_client = loaded.required_on_client;
        self.local.borrow_mut().update(info.clone());
        tracing::info!(name = %info.name, path = %file_name, "plugins: loaded locally");

        let event = PluginLoaded { info, session: None };
        self.local_plugin_loaded.emit(&event);
        self.plugin_loaded.emit(&event);
        true
    }

    /// Ask `session`'s server to load a plugin. Returns false on failure; the
    /// server's error string is logged once.
    pub fn load_remote_plugin(&self, path: impl AsRef<Path>, session: &Session) -> bool {
        let file_name = path.as_ref().display().to_string();
        let _loading = ScopedFlag::set(&self.in_load_plugin, true);

        let info = match self.run_remote_loader(session, "FileName", &file_name) {
            Ok(info) => info,
            Err(error) => {
                tracing::error!("Plugin load failed: {error}");
                self.remote.borrow_mut().entry(session.id()).or_default().update(PluginInfo::failed(&file_name, &error));
                return false;
            }
        };

        self.remote.borrow_mut().entry(session.id()).or_default().update(info.clone());
        if let Err(e) = session.definition_manager().synchronize_definitions(session) {
            tracing::warn!(error = %e, "plugins: definition synchronization failed");
        }
        tracing::info!(name = %info.name, path = %file_name, session = %session.id(), "plugins: loaded remotely");

        let event = PluginLoaded { info, session: Some(session.id()) };
        self.remote_plugin_loaded.emit(&event);
        self.plugin_loaded.emit(&event);
        true
    }

    /// Register definitions from an XML string, either locally into
    /// `session`'s definition manager or on its server.
    pub fn load_plugin_configuration_xml_from_string(&self, xml: &str, session: &Session, remote: bool) -> bool {
        let _loading = ScopedFlag::set(&self.in_load_plugin, true);
        if !remote {
            return match session.definition_manager().load_configuration_xml(xml) {
                Ok(_) => true,
                Err(e) => {
                    tracing::error!(error = %e, "plugins: invalid configuration xml");
                    false
                }
            };
        }
        match self.run_remote_loader(session, "ConfigurationXML", xml) {
            Ok(_) => session.definition_manager().synchronize_definitions(session).is_ok(),
            Err(error) => {
                tracing::error!("Plugin load failed: {error}");
                false
            }
        }
    }

    /// Drive a server-side `misc/PluginLoader` proxy. Errors are the server's message.
    fn run_remote_loader(&self, session: &Session, property: &str, value: &str) -> Result<PluginInfo, String> {
        let loader = session.proxy_manager().new_proxy("misc", "PluginLoader", None).map_err(|e| e.to_string())?;
        loader.set_text(property, 0, value);
        loader.update_vtk_objects().map_err(|e| e.to_string())?;
        loader.update_information();

        if loader.int_element("Loaded", 0) != Some(1) {
            let error = loader.text_element("ErrorString", 0).unwrap_or_default();
            return Err(if error.is_empty() { format!("could not load {value}") } else { error });
        }
        let name = loader.text_element("PluginName", 0).unwrap_or_default();
        let version = loader.text_element("PluginVersion", 0).unwrap_or_default();
        let file_name = if property == "FileName" { value } else { "" };
        Ok(PluginInfo::loaded_from(file_name, &name, &version))
    }

    #[must_use]
    pub fn local_plugins_information(&self) -> PluginsInformation {
        self.local.borrow().clone()
    }

    /// Last known plugin list of `session`'s server.
    #[must_use]
    pub fn remote_plugins_information(&self, session: &Session) -> PluginsInformation {
        self.remote.borrow().get(&session.id()).cloned().unwrap_or_default()
    }

    /// Refresh the cached plugin list of `session`'s server.
    pub fn update_plugins_information(&self, session: &Session) {
        match session.remote_plugins() {
            Ok(plugins) => {
                let mut remote = self.remote.borrow_mut();
                let entry = remote.entry(session.id()).or_default();
                for plugin in plugins {
                    entry.update(plugin);
                }
            }
            Err(e) => tracing::warn!(session = %session.id(), error = %e, "plugins: could not list remote plugins"),
        }
    }
}

#[cfg(test)]
#[path = "plugins_test.rs"]
mod tests;
