//! Value-space constraints attached to properties.
//!
//! Domains are parsed from the children of a property definition. Most are
//! static; array-list and range domains may name `<RequiredProperties>` whose
//! values feed [`Domain::update`].

use std::cell::RefCell;

use crate::property::{Elements, Property};
use crate::remote_object::RemoteObject;
use crate::xml::XmlElement;

/// Data object classes with their direct parent.
const DATA_TYPE_PARENTS: &[(&str, &str)] = &[
    ("vtkPolyData", "vtkPointSet"),
    ("vtkUnstructuredGrid", "vtkPointSet"),
    ("vtkStructuredGrid", "vtkPointSet"),
    ("vtkImageData", "vtkDataSet"),
    ("vtkRectilinearGrid", "vtkDataSet"),
    ("vtkPointSet", "vtkDataSet"),
    ("vtkDataSet", "vtkDataObject"),
    ("vtkTable", "vtkDataObject"),
    ("vtkMultiBlockDataSet", "vtkCompositeDataSet"),
    ("vtkCompositeDataSet", "vtkDataObject"),
];

/// Whether data class `child` is `parent` or derives from it.
#[must_use]
pub fn data_type_is_a(child: &str, parent: &str) -> bool {
    let mut current = child;
    loop {
        if current == parent {
            return true;
        }
        match DATA_TYPE_PARENTS.iter().find(|(class, _)| *class == current) {
            Some((_, next)) => current = next,
            None => return false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DomainKind {
    IntRange { min: Option<i64>, max: Option<i64> },
    DoubleRange { min: Option<f64>, max: Option<f64> },
    Boolean,
    /// `(text, value)` entries.
    Enumeration(Vec<(String, i64)>),
    StringList(Vec<String>),
    /// Referenced proxies must be registered in one of these groups.
    ProxyGroup(Vec<String>),
    /// Referenced outputs must be one of these data classes.
    DataType(Vec<String>),
    /// Array names taken from a required information property.
    ArrayList(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredProperty {
    /// Role of the property for the domain, e.g. `ArrayList` or `Range`.
    pub function: String,
    pub name: String,
}

#[derive(Debug)]
pub struct Domain {
    name: String,
    kind: RefCell<DomainKind>,
    required: Vec<RequiredProperty>,
}

impl Domain {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: DomainKind) -> Self {
        Self { name: name.into(), kind: RefCell::new(kind), required: Vec::new() }
    }

    /// Parse a domain element. Returns `None` for non-domain children.
    #[must_use]
    pub fn from_xml(element: &XmlElement) -> Option<Self> {
        let kind = match element.name.as_str() {
            "IntRangeDomain" => DomainKind::IntRange { min: element.attribute_as("min"), max: element.attribute_as("max") },
            "DoubleRangeDomain" => {
                DomainKind::DoubleRange { min: element.attribute_as("min"), max: element.attribute_as("max") }
            }
            "BooleanDomain" => DomainKind::Boolean,
            "EnumerationDomain" => DomainKind::Enumeration(
                element
                    .children_named("Entry")
                    .filter_map(|e| Some((e.attribute("text")?.to_owned(), e.attribute_as("value")?)))
                    .collect(),
            ),
            "StringListDomain" => DomainKind::StringList(
                element.children_named("String").filter_map(|s| s.attribute("value")).map(str::to_owned).collect(),
            ),
            "ProxyGroupDomain" => DomainKind::ProxyGroup(
                element.children_named("Group").filter_map(|g| g.attribute("name")).map(str::to_owned).collect(),
            ),
            "DataTypeDomain" => DomainKind::DataType(
                element.children_named("DataType").filter_map(|d| d.attribute("value")).map(str::to_owned).collect(),
            ),
            "ArrayListDomain" => DomainKind::ArrayList(Vec::new()),
            _ => return None,
        };
        let required = element
            .child("RequiredProperties")
            .map(|r| {
                r.children_named("Property")
                    .filter_map(|p| {
                        Some(RequiredProperty {
                            function: p.attribute("function")?.to_owned(),
                            name: p.attribute("name")?.to_owned(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            name: element.attribute("name").unwrap_or(&element.name).to_owned(),
            kind: RefCell::new(kind),
            required,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> DomainKind {
        self.kind.borrow().clone()
    }

    #[must_use]
    pub fn required_properties(&self) -> &[RequiredProperty] {
        &self.required
    }

    /// Check the unchecked value of `property` against this domain.
    /// Values of a kind the domain does not constrain are accepted.
    #[must_use]
    pub fn is_in_domain(&self, property: &Property) -> bool {
        let values = property.unchecked_elements();
        match (&*self.kind.borrow(), &values) {
            (DomainKind::IntRange { min, max }, Elements::Int(v)) => {
                v.iter().all(|x| min.is_none_or(|m| *x >= m) && max.is_none_or(|m| *x <= m))
            }
            (DomainKind::DoubleRange { min, max }, Elements::Double(v)) => {
                v.iter().all(|x| min.is_none_or(|m| *x >= m) && max.is_none_or(|m| *x <= m))
            }
            (DomainKind::Boolean, Elements::Int(v)) => v.iter().all(|x| *x == 0 || *x == 1),
            (DomainKind::Enumeration(entries), Elements::Int(v)) => {
                v.iter().all(|x| entries.iter().any(|(_, value)| value == x))
            }
            (DomainKind::StringList(list), Elements::Text(v)) => {
                list.is_empty() || v.iter().all(|x| list.contains(x))
            }
            (DomainKind::ArrayList(arrays), Elements::Text(v)) => {
                v.iter().all(|x| x.is_empty() || arrays.contains(x))
            }
            (DomainKind::ProxyGroup(groups), Elements::Proxy(inputs)) => inputs.iter().all(|input| {
                let Some(session) = input.proxy.remote().session() else {
                    return false;
                };
                let pxm = session.proxy_manager();
                groups.iter().any(|group| pxm.is_proxy_in_group(&input.proxy, group))
            }),
            (DomainKind::DataType(types), Elements::Proxy(inputs)) => inputs.iter().all(|input| {
                input
                    .proxy
                    .output_data_type(input.port)
                    .is_some_and(|produced| types.iter().any(|accepted| data_type_is_a(&produced, accepted)))
            }),
            _ => true,
        }
    }

    /// Refresh a dependent domain from its required properties. `lookup`
    /// resolves a property name to its current values. Returns true if the
    /// allowed value space changed.
    pub fn update(&self, lookup: &dyn Fn(&str) -> Option<Elements>) -> bool {
        let mut next = self.kind.borrow().clone();
        for required in &self.required {
            let Some(values) = lookup(&required.name) else {
                continue;
            };
            match (&mut next, required.function.as_str(), values) {
                (DomainKind::ArrayList(arrays), "ArrayList", Elements::Text(available)) => *arrays = available,
                (DomainKind::IntRange { min, max }, "Range", Elements::Int(bounds)) if bounds.len() >= 2 => {
                    (*min, *max) = (Some(bounds[0]), Some(bounds[1]));
                }
                (DomainKind::IntRange { min, .. }, "Min", Elements::Int(bounds)) if !bounds.is_empty() => {
                    *min = Some(bounds[0]);
                }
                (DomainKind::IntRange { max, .. }, "Max", Elements::Int(bounds)) if !bounds.is_empty() => {
                    *max = Some(bounds[0]);
                }
                (DomainKind::DoubleRange { min, max }, "Range", Elements::Double(bounds)) if bounds.len() >= 2 => {
                    (*min, *max) = (Some(bounds[0]), Some(bounds[1]));
                }
                (DomainKind::DoubleRange { min, .. }, "Min", Elements::Double(bounds)) if !bounds.is_empty() => {
                    *min = Some(bounds[0]);
                }
                (DomainKind::DoubleRange { max, .. }, "Max", Elements::Double(bounds)) if !bounds.is_empty() => {
                    *max = Some(bounds[0]);
                }
                _ => {}
            }
        }
        let mut kind = self.kind.borrow_mut();
        if *kind == next {
            return false;
        }
        *kind = next;
        true
    }

    /// Preferred value for a property constrained by this domain, if the domain has one.
    #[must_use]
    pub fn default_elements(&self) -> Option<Elements> {
        match &*self.kind.borrow() {
            DomainKind::ArrayList(arrays) => arrays.first().map(|a| Elements::Text(vec![a.clone()])),
            DomainKind::Enumeration(entries) => entries.first().map(|(_, v)| Elements::Int(vec![*v])),
            DomainKind::StringList(list) => list.first().map(|s| Elements::Text(vec![s.clone()])),
            _ => None,
        }
    }
}

#[cfg(test)]
#[path = "domain_test.rs"]
mod tests;
