//! The host-function bridge.
//!
//! Installs `process.env.ENV` and the `server` object into a fresh
//! context. Callbacks read the invocation data and write into the
//! response builder through isolate slots, so the bridge itself holds no
//! state and is safe to install into any number of isolates.
//!
//! Illegal argument shapes are ignored: a script calling
//! `server.response.render(42)` observes no throw and records nothing.
//! Host failures never surface into the script either.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use kiln_types::{DomElement, RenderResult, RequestView};

/// The response builder for the current invocation, held in an isolate
/// slot.
pub(crate) struct StateSlot(pub(crate) Rc<RefCell<RenderResult>>);

/// The immutable invocation data, held in an isolate slot.
pub(crate) struct InvocationSlot(pub(crate) Rc<InvocationData>);

pub(crate) struct InvocationData {
    pub(crate) env: String,
    pub(crate) request: RequestView,
    pub(crate) server_state: Option<String>,
}

fn state_slot(scope: &mut v8::HandleScope) -> Option<Rc<RefCell<RenderResult>>> {
    scope.get_slot::<StateSlot>().map(|slot| Rc::clone(&slot.0))
}

fn invocation_slot(scope: &mut v8::HandleScope) -> Option<Rc<InvocationData>> {
    scope.get_slot::<InvocationSlot>().map(|slot| Rc::clone(&slot.0))
}

/// Install the bridge globals into `context`.
pub(crate) fn install(scope: &mut v8::HandleScope<'_>, context: v8::Local<'_, v8::Context>) {
    let global = context.global(scope);

    let process = v8::Object::new(scope);
    let env_object = v8::Object::new(scope);
    if let Some(invocation) = invocation_slot(scope) {
        set_string(scope, env_object, "ENV", &invocation.env);
    }
    set_object(scope, process, "env", env_object);
    set_object(scope, global, "process", process);

    let handler = v8::Object::new(scope);
    set_function(scope, handler, "state", handler_state);

    let request = v8::Object::new(scope);
    set_function(scope, request, "method", request_method);
    set_function(scope, request, "proto", request_proto);
    set_function(scope, request, "protoMajor", request_proto_major);
    set_function(scope, request, "protoMinor", request_proto_minor);
    set_function(scope, request, "remoteAddr", request_remote_addr);
    set_function(scope, request, "host", request_host);
    set_function(scope, request, "path", request_path);
    set_function(scope, request, "query", request_query);
    set_function(scope, request, "headers", request_headers);

    let response = v8::Object::new(scope);
    set_function(scope, response, "render", response_render);
    set_function(scope, response, "redirect", response_redirect);
    set_function(scope, response, "setHeader", response_set_header);
    set_function(scope, response, "setTitle", response_set_title);
    set_function(scope, response, "setMeta", response_set_meta);
    set_function(scope, response, "setLink", response_set_link);
    set_function(scope, response, "setScript", response_set_script);

    let server = v8::Object::new(scope);
    set_object(scope, server, "handler", handler);
    set_object(scope, server, "request", request);
    set_object(scope, server, "response", response);
    set_object(scope, global, "server", server);
}

fn set_string(
    scope: &mut v8::HandleScope<'_>,
    object: v8::Local<'_, v8::Object>,
    name: &str,
    value: &str,
) {
    if let (Some(key), Some(value)) = (v8::String::new(scope, name), v8::String::new(scope, value))
    {
        object.set(scope, key.into(), value.into());
    }
}

fn set_object(
    scope: &mut v8::HandleScope<'_>,
    parent: v8::Local<'_, v8::Object>,
    name: &str,
    child: v8::Local<'_, v8::Object>,
) {
    if let Some(key) = v8::String::new(scope, name) {
        parent.set(scope, key.into(), child.into());
    }
}

fn set_function(
    scope: &mut v8::HandleScope<'_>,
    object: v8::Local<'_, v8::Object>,
    name: &str,
    callback: impl v8::MapFnTo<v8::FunctionCallback>,
) {
    if let (Some(key), Some(function)) =
        (v8::String::new(scope, name), v8::Function::new(scope, callback))
    {
        object.set(scope, key.into(), function.into());
    }
}

// server.handler

fn handler_state(
    scope: &mut v8::HandleScope,
    _args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    let json = invocation_slot(scope)
        .and_then(|invocation| invocation.server_state.clone())
        .unwrap_or_else(|| "{}".to_string());

    let tc = &mut v8::TryCatch::new(scope);
    if let Some(source) = v8::String::new(tc, &json)
        && let Some(value) = v8::json::parse(tc, source)
    {
        rv.set(value);
        return;
    }
    // Unparseable state degrades to an empty object, never a throw.
    let empty = v8::Object::new(tc);
    rv.set(empty.into());
}

// server.request

fn return_request_string(
    scope: &mut v8::HandleScope,
    mut rv: v8::ReturnValue,
    read: fn(&RequestView) -> &str,
) {
    let Some(invocation) = invocation_slot(scope) else {
        return;
    };
    if let Some(value) = v8::String::new(scope, read(&invocation.request)) {
        rv.set(value.into());
    }
}

fn request_method(
    scope: &mut v8::HandleScope,
    _args: v8::FunctionCallbackArguments,
    rv: v8::ReturnValue,
) {
    return_request_string(scope, rv, |request| &request.method);
}

fn request_proto(
    scope: &mut v8::HandleScope,
    _args: v8::FunctionCallbackArguments,
    rv: v8::ReturnValue,
) {
    return_request_string(scope, rv, |request| &request.proto);
}

fn request_proto_major(
    scope: &mut v8::HandleScope,
    _args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    if let Some(invocation) = invocation_slot(scope) {
        rv.set(v8::Integer::new(scope, i32::from(invocation.request.proto_major)).into());
    }
}

fn request_proto_minor(
    scope: &mut v8::HandleScope,
    _args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    if let Some(invocation) = invocation_slot(scope) {
        rv.set(v8::Integer::new(scope, i32::from(invocation.request.proto_minor)).into());
    }
}

fn request_remote_addr(
    scope: &mut v8::HandleScope,
    _args: v8::FunctionCallbackArguments,
    rv: v8::ReturnValue,
) {
    return_request_string(scope, rv, |request| &request.remote_addr);
}

fn request_host(
    scope: &mut v8::HandleScope,
    _args: v8::FunctionCallbackArguments,
    rv: v8::ReturnValue,
) {
    return_request_string(scope, rv, |request| &request.host);
}

fn request_path(
    scope: &mut v8::HandleScope,
    _args: v8::FunctionCallbackArguments,
    rv: v8::ReturnValue,
) {
    return_request_string(scope, rv, |request| &request.path);
}

fn request_query(
    scope: &mut v8::HandleScope,
    _args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    if let Some(invocation) = invocation_slot(scope) {
        let object = multimap_to_object(scope, &invocation.request.query);
        rv.set(object.into());
    }
}

fn request_headers(
    scope: &mut v8::HandleScope,
    _args: v8::FunctionCallbackArguments,
    mut rv: v8::ReturnValue,
) {
    if let Some(invocation) = invocation_slot(scope) {
        let object = multimap_to_object(scope, &invocation.request.headers);
        rv.set(object.into());
    }
}

fn multimap_to_object<'s>(
    scope: &mut v8::HandleScope<'s>,
    map: &HashMap<String, Vec<String>>,
) -> v8::Local<'s, v8::Object> {
    let object = v8::Object::new(scope);
    for (name, values) in map {
        let array = v8::Array::new(scope, values.len() as i32);
        for (index, value) in values.iter().enumerate() {
            if let Some(value) = v8::String::new(scope, value) {
                array.set_index(scope, index as u32, value.into());
            }
        }
        if let Some(key) = v8::String::new(scope, name) {
            object.set(scope, key.into(), array.into());
        }
    }
    object
}

// server.response

/// Read an optional status argument.
///
/// Absent statuses stay `None`; a present non-numeric status maps to an
/// out-of-range value so the builder records it as invalid.
fn status_arg(
    scope: &mut v8::HandleScope,
    args: &v8::FunctionCallbackArguments,
    index: i32,
) -> Option<i64> {
    let value = args.get(index);
    if value.is_undefined() || value.is_null() {
        None
    } else if value.is_number() {
        value.number_value(scope).map(|n| n as i64)
    } else {
        Some(-1)
    }
}

fn response_render(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    let Some(state) = state_slot(scope) else { return };
    let body = args.get(0);
    if !body.is_string() {
        return;
    }
    let body = body.to_rust_string_lossy(scope);
    let status = status_arg(scope, &args, 1);
    state.borrow_mut().render(body, status);
}

fn response_redirect(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    let Some(state) = state_slot(scope) else { return };
    let url = args.get(0);
    if !url.is_string() {
        return;
    }
    let url = url.to_rust_string_lossy(scope);
    let status = status_arg(scope, &args, 1);
    state.borrow_mut().redirect(url, status);
}

fn response_set_header(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    let Some(state) = state_slot(scope) else { return };
    let (name, value) = (args.get(0), args.get(1));
    if !name.is_string() || !value.is_string() {
        return;
    }
    let name = name.to_rust_string_lossy(scope);
    let value = value.to_rust_string_lossy(scope);
    state.borrow_mut().set_header(name, value);
}

fn response_set_title(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    let Some(state) = state_slot(scope) else { return };
    let title = args.get(0);
    if !title.is_string() {
        return;
    }
    let title = title.to_rust_string_lossy(scope);
    state.borrow_mut().set_title(title);
}

#[derive(Clone, Copy)]
enum HeadElement {
    Meta,
    Link,
    Script,
}

fn set_head_element(
    scope: &mut v8::HandleScope,
    args: &v8::FunctionCallbackArguments,
    kind: HeadElement,
) {
    let Some(state) = state_slot(scope) else { return };
    let id = args.get(0);
    if !id.is_string() {
        return;
    }
    let Some(element) = element_from_value(scope, args.get(1)) else {
        return;
    };
    let id = id.to_rust_string_lossy(scope);
    let mut state = state.borrow_mut();
    match kind {
        HeadElement::Meta => state.set_meta(id, element),
        HeadElement::Link => state.set_link(id, element),
        HeadElement::Script => state.set_script(id, element),
    }
}

fn response_set_meta(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    set_head_element(scope, &args, HeadElement::Meta);
}

fn response_set_link(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    set_head_element(scope, &args, HeadElement::Link);
}

fn response_set_script(
    scope: &mut v8::HandleScope,
    args: v8::FunctionCallbackArguments,
    _rv: v8::ReturnValue,
) {
    set_head_element(scope, &args, HeadElement::Script);
}

/// Walk a JS `Map` (or plain object) into a [`DomElement`], preserving
/// insertion order. Non-string keys and values are skipped.
fn element_from_value(
    scope: &mut v8::HandleScope,
    value: v8::Local<'_, v8::Value>,
) -> Option<DomElement> {
    if let Ok(map) = v8::Local::<v8::Map>::try_from(value) {
        // as_array flattens entries to [k0, v0, k1, v1, ..] in insertion
        // order.
        let entries = map.as_array(scope);
        let mut element = DomElement::new();
        let mut index = 0;
        while index + 1 < entries.length() {
            let key = entries.get_index(scope, index)?;
            let value = entries.get_index(scope, index + 1)?;
            if key.is_string() && value.is_string() {
                let key = key.to_rust_string_lossy(scope);
                let value = value.to_rust_string_lossy(scope);
                element.set(key, value);
            }
            index += 2;
        }
        return Some(element);
    }

    let object = v8::Local::<v8::Object>::try_from(value).ok()?;
    let names = object.get_own_property_names(scope, v8::GetPropertyNamesArgs::default())?;
    let mut element = DomElement::new();
    for index in 0..names.length() {
        let key = names.get_index(scope, index)?;
        let value = object.get(scope, key)?;
        if key.is_string() && value.is_string() {
            let key = key.to_rust_string_lossy(scope);
            let value = value.to_rust_string_lossy(scope);
            element.set(key, value);
        }
    }
    Some(element)
}
