//! HTML splicing.
//!
//! Parses the cached index bytes into a DOM tree and re-emits it with
//! the render result folded in: the SSR body into the container `div`,
//! the client state as a JSON `<script>` at the end of `<body>`, and
//! title/meta/link/script elements appended to `<head>` in insertion
//! order. Parsing and serialization are deterministic, so splicing the
//! same inputs twice yields byte-identical output.

use std::cell::RefCell;
use std::rc::Rc;

use html5ever::serialize::{SerializeOpts, serialize};
use html5ever::tendril::TendrilSink;
use html5ever::{
    Attribute, LocalName, ParseOpts, QualName, local_name, namespace_url, ns, parse_document,
    parse_fragment,
};
use markup5ever_rcdom::{Handle, Node, NodeData, RcDom, SerializableHandle};
use thiserror::Error;

use kiln_types::{DomElement, DomElementList, RenderResult};

#[derive(Debug, Error)]
pub enum SpliceError {
    #[error("failed to parse index document: {0}")]
    Parse(String),

    #[error("container div #{0} not found in index document")]
    ContainerNotFound(String),

    #[error("index document has no <body>")]
    MissingBody,

    #[error("index document has no <head>")]
    MissingHead,

    #[error("failed to serialize document: {0}")]
    Serialize(String),
}

/// Splice a render result into the index document.
///
/// `client_state` is the JSON the client rehydrates from; when present
/// it is emitted verbatim into a `<script type="application/json">`
/// with id `state_id` at the end of `<body>`.
pub fn splice(
    index: &[u8],
    render: &RenderResult,
    client_state: Option<&str>,
    container: &str,
    state_id: &str,
) -> Result<Vec<u8>, SpliceError> {
    let dom = parse_document(RcDom::default(), ParseOpts::default())
        .from_utf8()
        .read_from(&mut &index[..])
        .map_err(|e| SpliceError::Parse(e.to_string()))?;
    let document = dom.document;

    if let Some(body_html) = &render.body {
        let target = find_div_with_id(&document, container)
            .ok_or_else(|| SpliceError::ContainerNotFound(container.to_string()))?;
        for child in parse_fragment_nodes(body_html) {
            append(&target, child);
        }
    }

    if let Some(json) = client_state {
        let body = find_element(&document, &local_name!("body")).ok_or(SpliceError::MissingBody)?;
        let script = new_element(
            "script",
            &[("type", "application/json"), ("id", state_id)],
        );
        append(&script, new_text(json));
        append(&body, script);
    }

    if render.needs_head() {
        let head = find_element(&document, &local_name!("head")).ok_or(SpliceError::MissingHead)?;

        if let Some(title) = &render.title {
            let element = new_element("title", &[]);
            append(&element, new_text(title));
            append(&head, element);
        }
        append_head_elements(&head, "meta", &render.metas);
        append_head_elements(&head, "link", &render.links);
        append_head_elements(&head, "script", &render.scripts);
    }

    let mut out = Vec::new();
    let serializable: SerializableHandle = document.into();
    serialize(&mut out, &serializable, SerializeOpts::default())
        .map_err(|e| SpliceError::Serialize(e.to_string()))?;
    Ok(out)
}

/// Append one element per list entry, attributes in insertion order.
///
/// A `children` attribute on a script becomes the tag's text content
/// instead of an attribute.
fn append_head_elements(head: &Handle, tag: &str, elements: &DomElementList) {
    for (id, element) in elements.iter() {
        let mut element = element.clone();
        let children = if tag == "script" {
            element.remove("children")
        } else {
            None
        };

        let node = element_node(tag, id, &element);
        if let Some(text) = children {
            append(&node, new_text(&text));
        }
        append(head, node);
    }
}

fn element_node(tag: &str, id: &str, element: &DomElement) -> Handle {
    let mut attrs = vec![attribute("id", id)];
    for (name, value) in element.attrs() {
        if name != "id" {
            attrs.push(attribute(name, value));
        }
    }
    new_element_with_attrs(tag, attrs)
}

fn attribute(name: &str, value: &str) -> Attribute {
    Attribute {
        name: QualName::new(None, ns!(), LocalName::from(name)),
        value: value.into(),
    }
}

fn new_element(tag: &str, attrs: &[(&str, &str)]) -> Handle {
    new_element_with_attrs(
        tag,
        attrs
            .iter()
            .map(|(name, value)| attribute(name, value))
            .collect(),
    )
}

fn new_element_with_attrs(tag: &str, attrs: Vec<Attribute>) -> Handle {
    Node::new(NodeData::Element {
        name: QualName::new(None, ns!(html), LocalName::from(tag)),
        attrs: RefCell::new(attrs),
        template_contents: RefCell::new(None),
        mathml_annotation_xml_integration_point: false,
    })
}

fn new_text(contents: &str) -> Handle {
    Node::new(NodeData::Text {
        contents: RefCell::new(contents.into()),
    })
}

fn append(parent: &Handle, child: Handle) {
    child.parent.set(Some(Rc::downgrade(parent)));
    parent.children.borrow_mut().push(child);
}

/// Parse an HTML fragment and take its top-level nodes.
fn parse_fragment_nodes(html: &str) -> Vec<Handle> {
    let dom = parse_fragment(
        RcDom::default(),
        ParseOpts::default(),
        QualName::new(None, ns!(html), local_name!("div")),
        Vec::new(),
    )
    .from_utf8()
    .one(html.as_bytes());

    // The fragment parser wraps its output in a synthetic <html> root.
    let root = dom
        .document
        .children
        .borrow()
        .iter()
        .find(|node| matches!(node.data, NodeData::Element { .. }))
        .cloned();
    match root {
        Some(root) => root.children.borrow_mut().drain(..).collect(),
        None => Vec::new(),
    }
}

fn find_element(handle: &Handle, target: &LocalName) -> Option<Handle> {
    if let NodeData::Element { name, .. } = &handle.data
        && name.local == *target
    {
        return Some(Rc::clone(handle));
    }
    for child in handle.children.borrow().iter() {
        if let Some(found) = find_element(child, target) {
            return Some(found);
        }
    }
    None
}

/// Depth-first search for the first `<div>` whose id attribute matches.
fn find_div_with_id(handle: &Handle, id: &str) -> Option<Handle> {
    if let NodeData::Element { name, attrs, .. } = &handle.data
        && name.local == local_name!("div")
        && attrs
            .borrow()
            .iter()
            .any(|attr| attr.name.local == local_name!("id") && &*attr.value == id)
    {
        return Some(Rc::clone(handle));
    }
    for child in handle.children.borrow().iter() {
        if let Some(found) = find_div_with_id(child, id) {
            return Some(found);
        }
    }
    None
}
