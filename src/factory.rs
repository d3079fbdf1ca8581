//! Client-class registry used when instantiating proxies.
//!
//! A definition's element tag selects its client class (`SourceProxy` →
//! `SMSourceProxy`); the registry maps that class to a constructor that
//! derives the proxy's kind-specific data from the definition. Plugins may
//! register additional classes.

use std::collections::HashMap;

use crate::error::{SmError, SmResult};
use crate::xml::XmlElement;

/// Client-class prefix prepended to definition tags.
pub const CLIENT_CLASS_PREFIX: &str = "SM";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyKind {
    Generic,
    /// Pipeline source or filter; output data class per port.
    Source { output_types: Vec<String> },
    Writer { supports_parallel: bool, parallel_only: bool },
    Representation,
    View,
}

pub type ProxyConstructor = fn(&XmlElement) -> ProxyKind;

#[derive(Debug, Clone, Default)]
pub struct ProxyFactory {
    constructors: HashMap<String, ProxyConstructor>,
}

impl ProxyFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Factory knowing every proxy class the built-in definitions use.
    #[must_use]
    pub fn with_builtin_types() -> Self {
        let mut factory = Self::new();
        factory.register("SMProxy", |_| ProxyKind::Generic);
        factory.register("SMSourceProxy", source_kind);
        factory.register("SMWriterProxy", writer_kind);
        factory.register("SMPWriterProxy", |definition| match writer_kind(definition) {
            ProxyKind::Writer { parallel_only, .. } => ProxyKind::Writer { supports_parallel: true, parallel_only },
            other => other,
        });
        factory.register("SMRepresentationProxy", |_| ProxyKind::Representation);
        factory.register("SMViewProxy", |_| ProxyKind::View);
        factory
    }

    pub fn register(&mut self, client_class: &str, constructor: ProxyConstructor) {
        self.constructors.insert(client_class.to_owned(), constructor);
    }

    #[must_use]
    pub fn has_class(&self, client_class: &str) -> bool {
        self.constructors.contains_key(client_class)
    }

    /// Client class for a definition element.
    #[must_use]
    pub fn client_class_for(definition: &XmlElement) -> String {
        format!("{CLIENT_CLASS_PREFIX}{}", definition.name)
    }

    /// Kind of the proxy `definition` describes.
    ///
    /// # Errors
    ///
    /// Returns [`SmError::UnknownProxyType`] if the client class is not registered.
    pub fn kind_for(&self, definition: &XmlElement) -> SmResult<ProxyKind> {
        let class = Self::client_class_for(definition);
        let constructor = self.constructors.get(&class).ok_or(SmError::UnknownProxyType(class))?;
        Ok(constructor(definition))
    }
}

fn source_kind(definition: &XmlElement) -> ProxyKind {
    let mut ports: Vec<(usize, String)> = definition
        .children_named("OutputPort")
        .enumerate()
        .map(|(position, port)| {
            let index = port.attribute_as("index").unwrap_or(position);
            (index, port.attribute("type").unwrap_or("vtkDataObject").to_owned())
        })
        .collect();
    ports.sort_by_key(|(index, _)| *index);
    ProxyKind::Source { output_types: ports.into_iter().map(|(_, kind)| kind).collect() }
}

fn writer_kind(definition: &XmlElement) -> ProxyKind {
    ProxyKind::Writer {
        supports_parallel: definition.attribute_flag("supports_parallel"),
        parallel_only: definition.attribute_flag("parallel_only"),
    }
}

#[cfg(test)]
#[path = "factory_test.rs"]
mod tests;
