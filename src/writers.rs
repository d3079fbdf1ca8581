//! Picks writer proxies for a pipeline output.
//!
//! DESIGN
//! ======
//! Writers advertise `<Hints><WriterFactory extensions="…"
//! file_description="…"/></Hints>`. A registered writer is a candidate for
//! `(filename, source, port)` when its prototype can be created in the
//! source's session, one of its extensions equals the filename's last
//! extension, the session's process count suits it, and its `Input`
//! property's domains accept the source output. Candidates are tried in
//! registration order and the first one wins.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::path::Path;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::definitions::ProxyDefinitionManager;
use crate::events::ObserverId;
use crate::factory::ProxyKind;
use crate::property::{Elements, ProxyInput};
use crate::proxy::{Proxy, ProxyRef};

const DEFAULT_GROUP: &str = "writers";
const HINT: &str = "WriterFactory";

#[derive(Debug, Clone, PartialEq, Eq)]
struct WriterEntry {
    group: String,
    name: String,
}

#[derive(Debug, Clone)]
struct WriterHints {
    extensions: BTreeSet<String>,
    description: String,
}

impl WriterHints {
    fn of(prototype: &Proxy) -> Option<Self> {
        let hint = prototype.hints()?.child(HINT)?;
        Some(Self {
            extensions: hint
                .attribute("extensions")
                .unwrap_or_default()
                .split_whitespace()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            description: hint.attribute("file_description").unwrap_or(prototype.xml_name()).to_owned(),
        })
    }
}

impl WriterEntry {
    fn prototype(&self, source: &Proxy) -> Option<ProxyRef> {
        source.session()?.proxy_manager().prototype_proxy(&self.group, &self.name)
    }

    /// Process-count rules and `Input` domain acceptance.
    fn can_write(&self, prototype: &Proxy, source: &ProxyRef, port: u32) -> bool {
        let processes = source.session().map_or(1, |s| s.number_of_processes());
        if let ProxyKind::Writer { supports_parallel, parallel_only } = prototype.kind() {
            if processes > 1 && !*supports_parallel {
                return false;
            }
            if processes <= 1 && *parallel_only {
                return false;
            }
        }
        let Some(input) = prototype.property("Input") else {
            tracing::warn!(group = %self.group, name = %self.name, "writers: writer has no Input property");
            return false;
        };
        input.set_unchecked_elements(Elements::Proxy(vec![ProxyInput::new(Rc::clone(source), port)]));
        let accepted = input.is_in_domain();
        input.clear_unchecked_elements();
        accepted
    }
}

/// Last extension of `filename`, lowercase and without the dot.
fn extension_of(filename: &str) -> Option<String> {
    Path::new(filename).extension().and_then(|e| e.to_str()).filter(|e| !e.is_empty()).map(str::to_ascii_lowercase)
}

#[derive(Debug)]
pub struct WriterFactory {
    writers: RefCell<IndexMap<(String, String), WriterEntry>>,
    groups: RefCell<BTreeSet<String>>,
}

impl Default for WriterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl WriterFactory {
    #[must_use]
    pub fn new() -> Self {
        Self { writers: RefCell::new(IndexMap::new()), groups: RefCell::new(BTreeSet::from([DEFAULT_GROUP.to_owned()])) }
    }

    /// Forget every writer and reset the searched groups.
    pub fn initialize(&self) {
        self.writers.borrow_mut().clear();
        *self.groups.borrow_mut() = BTreeSet::from([DEFAULT_GROUP.to_owned()]);
    }

    /// Register newly defined writers every time `definitions` change.
    pub fn watch(self: &Rc<Self>, definitions: &Rc<ProxyDefinitionManager>) -> ObserverId {
        let factory = Rc::downgrade(self);
        let source = Rc::downgrade(definitions);
        definitions.updated.connect(move |_| {
            if let (Some(factory), Some(definitions)) = (factory.upgrade(), source.upgrade()) {
                factory.update_available_writers(&definitions);
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

    /// Add `(group, name)` to the candidates. Re-registering keeps the
    /// original position.
    pub fn register_prototype(&self, group: &str, name: &str) {
        self.writers
            .borrow_mut()
            .entry((group.to_owned(), name.to_owned()))
            .or_insert_with(|| WriterEntry { group: group.to_owned(), name: name.to_owned() });
    }

    pub fn unregister_prototype(&self, group: &str, name: &str) -> bool {
        self.writers.borrow_mut().shift_remove(&(group.to_owned(), name.to_owned())).is_some()
    }

    #[must_use]
    pub fn number_of_registered_prototypes(&self) -> usize {
        self.writers.borrow().len()
    }

    /// Register every definition in the searched groups that carries a
    /// writer hint.
    pub fn update_available_writers(&self, definitions: &ProxyDefinitionManager) {
        for group in self.groups() {
            for name in definitions.single_group_iter(&group) {
                let hinted = definitions
                    .collapsed_proxy_definition(&group, &name, None, false)
                    .is_some_and(|d| d.child("Hints").and_then(|h| h.child(HINT)).is_some());
                if hinted {
                    self.register_prototype(&group, &name);
                }
            }
        }
        tracing::debug!(writers = self.number_of_registered_prototypes(), "writers: updated available writers");
    }

    fn candidates(&self) -> Vec<WriterEntry> {
        self.writers.borrow().values().cloned().collect()
    }

    /// New, unregistered writer for output `port` of `source`, with its
    /// `FileName` and `Input` set.
    pub fn create_writer(&self, filename: &str, source: &ProxyRef, port: u32) -> Option<ProxyRef> {
        if filename.is_empty() {
            tracing::error!("writers: no filename, cannot create any writer");
            return None;
        }
        let Some(extension) = extension_of(filename) else {
            tracing::error!(filename, "writers: no extension, cannot determine writer to create");
            return None;
        };
        let session = source.session()?;
        let pxm = session.proxy_manager();

        for entry in self.candidates() {
            let Some(prototype) = entry.prototype(source) else {
                continue;
            };
            let matches_extension = WriterHints::of(&prototype).is_some_and(|h| h.extensions.contains(&extension));
            if !matches_extension || !entry.can_write(&prototype, source, port) {
                continue;
            }
            let writer = pxm.new_proxy(&entry.group, &entry.name, None).ok()?;
            writer.set_text("FileName", 0, filename);
            writer.set_proxy_input("Input", source, port);
            tracing::debug!(group = %entry.group, name = %entry.name, filename, "writers: created writer");
            return Some(writer);
        }
        tracing::error!(extension, "writers: no matching writer found for extension");
        None
    }

    /// Whether any registered writer accepts output `port` of `source`.
    #[must_use]
    pub fn can_write(&self, source: &ProxyRef, port: u32) -> bool {
        self.candidates()
            .iter()
            .any(|entry| entry.prototype(source).is_some_and(|prototype| entry.can_write(&prototype, source, port)))
    }

    /// File dialog filter of the writers accepting output `port` of
    /// `source`, sorted, e.g. `VTK PolyData Files(*.vtp);;…`.
    #[must_use]
    pub fn supported_file_types(&self, source: &ProxyRef, port: u32) -> String {
        let mut types = BTreeSet::new();
        for entry in self.candidates() {
            let Some(prototype) = entry.prototype(source) else {
                continue;
            };
            if !entry.can_write(&prototype, source, port) {
                continue;
            }
            let Some(hints) = WriterHints::of(&prototype).filter(|h| !h.extensions.is_empty()) else {
                continue;
            };
            let patterns: Vec<String> = hints.extensions.iter().map(|e| format!("*.{e}")).collect();
            types.insert(format!("{}({})", hints.description, patterns.join(" ")));
        }
        types.into_iter().collect::<Vec<_>>().join(";;")
    }
}

#[cfg(test)]
#[path = "writers_test.rs"]
mod tests;
