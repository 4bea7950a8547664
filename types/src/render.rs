//! Render results and head-element lists.
//!
//! `RenderResult` is the response builder handed to the sandbox bridge:
//! each host callback records into it, and the renderer turns the final
//! value into an HTTP response. `DomElementList` provides the
//! insertion-ordered id-to-attributes semantics the splicer relies on.

use std::collections::HashMap;

/// Status recorded when a script supplies no explicit render status.
pub const DEFAULT_RENDER_STATUS: u16 = 200;

/// Status recorded when a script supplies no explicit redirect status.
pub const DEFAULT_REDIRECT_STATUS: u16 = 302;

/// Status recorded when a script supplies an out-of-range status.
pub const INVALID_STATUS: u16 = 500;

/// A redirect recorded by the sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub url: String,
    pub status: u16,
}

/// One head element: attributes in insertion order.
///
/// Re-setting an attribute name overwrites its value in place; the
/// original position is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomElement {
    attrs: Vec<(String, String)>,
}

impl DomElement {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        if let Some(slot) = self.attrs.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = value;
        } else {
            self.attrs.push((name, value));
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Remove an attribute, returning its value if present.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        let idx = self.attrs.iter().position(|(n, _)| n == name)?;
        Some(self.attrs.remove(idx).1)
    }

    /// Attributes in insertion order.
    #[must_use]
    pub fn attrs(&self) -> &[(String, String)] {
        &self.attrs
    }
}

impl FromIterator<(String, String)> for DomElement {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut element = Self::new();
        for (name, value) in iter {
            element.set(name, value);
        }
        element
    }
}

/// An insertion-ordered mapping from element id to attributes.
///
/// Invariant: `ids` and the key set of `elements` are equal and ordered
/// identically. The pair is private; every mutation goes through `set`,
/// which keeps them in lockstep. Re-setting an existing id replaces its
/// attributes but keeps its original position.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DomElementList {
    ids: Vec<String>,
    elements: HashMap<String, DomElement>,
}

impl DomElementList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: impl Into<String>, element: DomElement) {
        let id = id.into();
        if self.elements.insert(id.clone(), element).is_none() {
            self.ids.push(id);
        }
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&DomElement> {
        self.elements.get(id)
    }

    #[must_use]
    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Elements in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &DomElement)> {
        self.ids.iter().map(|id| {
            let element = self
                .elements
                .get(id)
                .expect("ids and elements are kept in lockstep");
            (id.as_str(), element)
        })
    }
}

/// Everything one sandbox invocation produced.
#[derive(Debug, Clone, Default)]
pub struct RenderResult {
    pub body: Option<String>,
    pub status: Option<u16>,
    pub redirect: Option<Redirect>,
    pub headers: HashMap<String, Vec<String>>,
    pub title: Option<String>,
    pub metas: DomElementList,
    pub links: DomElementList,
    pub scripts: DomElementList,
}

impl RenderResult {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a rendered body.
    ///
    /// A status outside 100..=599 is recorded as 500; a missing status as
    /// 200.
    pub fn render(&mut self, body: String, status: Option<i64>) {
        self.body = Some(body);
        self.status = Some(match status {
            None => DEFAULT_RENDER_STATUS,
            Some(s) if (100..=599).contains(&s) => s as u16,
            Some(_) => INVALID_STATUS,
        });
    }

    /// Record a redirect.
    ///
    /// A status outside 100..=599 is recorded as 500; a missing status as
    /// 302.
    pub fn redirect(&mut self, url: String, status: Option<i64>) {
        let status = match status {
            None => DEFAULT_REDIRECT_STATUS,
            Some(s) if (100..=599).contains(&s) => s as u16,
            Some(_) => INVALID_STATUS,
        };
        self.redirect = Some(Redirect { url, status });
    }

    /// Append a response header value.
    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.entry(name.into()).or_default().push(value.into());
    }

    pub fn set_title(&mut self, title: impl Into<String>) {
        self.title = Some(title.into());
    }

    pub fn set_meta(&mut self, id: impl Into<String>, element: DomElement) {
        self.metas.set(id, element);
    }

    pub fn set_link(&mut self, id: impl Into<String>, element: DomElement) {
        self.links.set(id, element);
    }

    pub fn set_script(&mut self, id: impl Into<String>, element: DomElement) {
        self.scripts.set(id, element);
    }

    /// Whether splicing this result requires a `<head>` element.
    #[must_use]
    pub fn needs_head(&self) -> bool {
        self.title.is_some()
            || !self.metas.is_empty()
            || !self.links.is_empty()
            || !self.scripts.is_empty()
    }
}
