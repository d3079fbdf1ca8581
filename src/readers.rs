//! Picks reader proxies for files by extension.
//!
//! Readers are ordinary definitions that advertise themselves with
//! `<Hints><ReaderFactory extensions="a b" file_description="…"/></Hints>`.
//! The factory scans its groups (`sources` unless told otherwise) whenever
//! the definitions change.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::definitions::ProxyDefinitionManager;
use crate::events::ObserverId;
use crate::proxy::ProxyRef;
use crate::session::Session;
use crate::xml::XmlElement;

const DEFAULT_GROUP: &str = "sources";
const HINT: &str = "ReaderFactory";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaderEntry {
    pub group: String,
    pub name: String,
    /// Lowercase, without the leading dot.
    pub extensions: Vec<String>,
    pub description: String,
}

impl ReaderEntry {
    fn from_definition(group: &str, name: &str, definition: &XmlElement) -> Option<Self> {
        let hint = definition.child("Hints")?.child(HINT)?;
        let extensions = hint
            .attribute("extensions")
            .unwrap_or_default()
            .split_whitespace()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        Some(Self {
            group: group.to_owned(),
            name: name.to_owned(),
            extensions,
            description: hint.attribute("file_description").unwrap_or(name).to_owned(),
        })
    }

    /// Whether `filename` ends in one of this reader's extensions.
    #[must_use]
    pub fn accepts(&self, filename: &str) -> bool {
        let lower = filename.to_ascii_lowercase();
        self.extensions.iter().any(|ext| {
            lower.len() > ext.len() + 1
                && lower.ends_with(ext.as_str())
                && lower.as_bytes()[lower.len() - ext.len() - 1] == b'.'
        })
    }

    fn file_type(&self) -> String {
        let patterns: Vec<String> = self.extensions.iter().map(|e| format!("*.{e}")).collect();
        format!("{}({})", self.description, patterns.join(" "))
    }
}

#[derive(Debug)]
pub struct ReaderFactory {
    readers: RefCell<IndexMap<(String, String), ReaderEntry>>,
    groups: RefCell<BTreeSet<String>>,
}

impl Default for ReaderFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ReaderFactory {
    #[must_use]
    pub fn new() -> Self {
        Self { readers: RefCell::new(IndexMap::new()), groups: RefCell::new(BTreeSet::from([DEFAULT_GROUP.to_owned()])) }
    }

    /// Rescan `definitions` every time they change.
    pub fn watch(self: &Rc<Self>, definitions: &Rc<ProxyDefinitionManager>) -> ObserverId {
        let factory = Rc::downgrade(self);
        let source = Rc::downgrade(definitions);
        definitions.updated.connect(move |_| {
            if let (Some(factory), Some(definitions)) = (factory.upgrade(), source.upgrade()) {
                factory.update_available_readers(&definitions);
            }
        })
    }

    pub fn add_group(&self, group: &str) {
        self.groups.borrow_mut().insert(group.to_owned());
    }

    pub fn remove_group(&self, group: &str) {
        self.groups.borrow_mut().remove(group);
    }

    #[must_use]
    pub fn groups(&self) -> Vec<String> {
        self.groups.borrow().iter().cloned().collect()
    }

    /// Add `(group, name)` if its definition carries a reader hint.
    pub fn register_prototype(&self, definitions: &ProxyDefinitionManager, group: &str, name: &str) -> bool {
        let Some(definition) = definitions.collapsed_proxy_definition(group, name, None, false) else {
            return false;
        };
        let Some(entry) = ReaderEntry::from_definition(group, name, &definition) else {
            return false;
        };
        self.readers.borrow_mut().insert((group.to_owned(), name.to_owned()), entry);
        true
    }

    pub fn unregister_prototype(&self, group: &str, name: &str) -> bool {
        self.readers.borrow_mut().shift_remove(&(group.to_owned(), name.to_owned())).is_some()
    }

    /// Rebuild the reader list from `definitions`.
    pub fn update_available_readers(&self, definitions: &ProxyDefinitionManager) {
        self.readers.borrow_mut().clear();
        let groups = self.groups();
        for group in &groups {
            for name in definitions.single_group_iter(group) {
                self.register_prototype(definitions, group, &name);
            }
        }
        tracing::debug!(readers = self.number_of_registered_prototypes(), "readers: updated available readers");
    }

    #[must_use]
    pub fn number_of_registered_prototypes(&self) -> usize {
        self.readers.borrow().len()
    }

    /// Readers whose extensions match `filename`, in registration order.
    #[must_use]
    pub fn readers_for_file(&self, filename: &str) -> Vec<ReaderEntry> {
        self.readers.borrow().values().filter(|r| r.accepts(filename)).cloned().collect()
    }

    /// Whether some reader available in `session` accepts `filename`.
    #[must_use]
    pub fn can_read_file(&self, filename: &str, session: &Session) -> bool {
        let pxm = session.proxy_manager();
        self.readers_for_file(filename).iter().any(|r| pxm.prototype_proxy(&r.group, &r.name).is_some())
    }

    /// New, unregistered reader for `filename` with its `FileName` set.
    pub fn create_reader(&self, filename: &str, session: &Session) -> Option<ProxyRef> {
        let pxm = session.proxy_manager();
        for entry in self.readers_for_file(filename) {
            if pxm.prototype_proxy(&entry.group, &entry.name).is_none() {
                continue;
            }
            let Ok(reader) = pxm.new_proxy(&entry.group, &entry.name, None) else {
                continue;
            };
            reader.set_text("FileName", 0, filename);
            return Some(reader);
        }
        tracing::warn!(filename, "readers: no reader for file");
        None
    }

    /// File dialog filter, e.g. `Delimited Text Files(*.csv *.txt);;Legacy VTK Files(*.vtk)`.
    #[must_use]
    pub fn supported_file_types(&self) -> String {
        let types: BTreeSet<String> =
            self.readers.borrow().values().filter(|r| !r.extensions.is_empty()).map(ReaderEntry::file_type).collect();
        types.into_iter().collect::<Vec<_>>().join(";;")
    }
}

#[cfg(test)]
#[path = "readers_test.rs"]
mod tests;
