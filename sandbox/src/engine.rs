//! Isolate lifecycle: thread pinning, resource limits, watchdog.
//!
//! V8's C bindings require thread affinity, so every invocation runs on
//! a dedicated OS thread: spawn, build the isolate with the configured
//! limits, install the bridge, compile and run the bundle, harvest the
//! response builder, tear the isolate down with the thread. The async
//! side holds the isolate's thread-safe handle and terminates execution
//! when the timeout fires; termination lands at loop back-edges and
//! function entries and is never observable to a later invocation.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::oneshot;

use kiln_types::{RenderResult, RequestView};

use crate::SandboxError;
use crate::bridge::{self, InvocationData, InvocationSlot, StateSlot};

/// How long a terminated script gets to unwind before we stop waiting
/// for its worker.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

static V8_INIT: Once = Once::new();

fn ensure_platform() {
    V8_INIT.call_once(|| {
        let platform = v8::new_default_platform(0, false).make_shared();
        v8::V8::initialize_platform(platform);
        v8::V8::initialize();
    });
}

/// Engine resource limits. Zero keeps the engine or platform default.
#[derive(Debug, Clone, Copy, Default)]
pub struct SandboxLimits {
    /// Maximum JS heap in bytes.
    pub heap_max_bytes: usize,
    /// Native stack of the worker thread in bytes. V8 runs on the host
    /// thread's stack, so this is the effective engine stack bound.
    pub stack_max_bytes: usize,
}

/// Everything one invocation sees. Immutable once built.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub env: String,
    pub request: RequestView,
    pub server_state: Option<String>,
}

/// Executes bundles under the configured limits.
pub struct Sandbox {
    limits: SandboxLimits,
    timeout: Duration,
    source_name: String,
}

enum WorkerFailure {
    Script { message: String, line: usize },
    Terminated { heap_exceeded: bool },
    Init(String),
}

type WorkerOutcome = Result<RenderResult, WorkerFailure>;

impl Sandbox {
    /// `source_name` tags script errors, typically the bundle file name.
    #[must_use]
    pub fn new(limits: SandboxLimits, timeout: Duration, source_name: impl Into<String>) -> Self {
        Self {
            limits,
            timeout,
            source_name: source_name.into(),
        }
    }

    /// Run `bundle` as an anonymous top-level script.
    pub async fn execute(
        &self,
        invocation: Invocation,
        bundle: Bytes,
    ) -> Result<RenderResult, SandboxError> {
        ensure_platform();

        let (handle_tx, handle_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();

        let limits = self.limits;
        let mut builder = std::thread::Builder::new().name("kiln-sandbox".to_string());
        if limits.stack_max_bytes > 0 {
            builder = builder.stack_size(limits.stack_max_bytes);
        }
        builder
            .spawn(move || run_worker(limits, invocation, &bundle, handle_tx, result_tx))
            .map_err(|e| SandboxError::Worker(format!("failed to spawn worker: {e}")))?;

        let Ok(handle) = handle_rx.await else {
            return Err(SandboxError::Worker(
                "worker exited before execution started".to_string(),
            ));
        };

        let mut result_rx = result_rx;
        match tokio::time::timeout(self.timeout, &mut result_rx).await {
            Ok(Ok(outcome)) => self.map_outcome(outcome),
            Ok(Err(_)) => Err(SandboxError::Worker(
                "worker dropped without a result".to_string(),
            )),
            Err(_) => {
                handle.terminate_execution();
                tracing::debug!(
                    timeout_ms = self.timeout.as_millis(),
                    "sandbox timeout; execution terminated"
                );
                // Drain the worker's channel so the isolate is torn down
                // within a bounded grace period before we report.
                let _ = tokio::time::timeout(TERMINATE_GRACE, &mut result_rx).await;
                Err(SandboxError::Timeout)
            }
        }
    }

    fn map_outcome(&self, outcome: WorkerOutcome) -> Result<RenderResult, SandboxError> {
        match outcome {
            Ok(result) => Ok(result),
            Err(WorkerFailure::Script { message, line }) => Err(SandboxError::Script {
                message,
                line,
                source_name: self.source_name.clone(),
            }),
            Err(WorkerFailure::Terminated {
                heap_exceeded: true,
            }) => Err(SandboxError::Script {
                message: "javascript heap limit exceeded".to_string(),
                line: 0,
                source_name: self.source_name.clone(),
            }),
            // Terminated without a recorded cause: the watchdog got
            // there first; the async side reports the timeout.
            Err(WorkerFailure::Terminated {
                heap_exceeded: false,
            }) => Err(SandboxError::Timeout),
            Err(WorkerFailure::Init(message)) => Err(SandboxError::Worker(message)),
        }
    }
}

struct HeapGuard {
    handle: v8::IsolateHandle,
    flag: Arc<AtomicBool>,
}

extern "C" fn on_near_heap_limit(
    data: *mut std::ffi::c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // Safety: `data` is the HeapGuard boxed in run_worker; it outlives
    // the isolate that owns this callback.
    let guard = unsafe { &*data.cast::<HeapGuard>() };
    guard.flag.store(true, Ordering::SeqCst);
    guard.handle.terminate_execution();
    // Raise the limit so the terminating script can unwind instead of
    // aborting the process.
    current_heap_limit * 2
}

fn run_worker(
    limits: SandboxLimits,
    invocation: Invocation,
    bundle: &[u8],
    handle_tx: oneshot::Sender<v8::IsolateHandle>,
    result_tx: oneshot::Sender<WorkerOutcome>,
) {
    let mut params = v8::CreateParams::default();
    if limits.heap_max_bytes > 0 {
        params = params.heap_limits(0, limits.heap_max_bytes);
    }
    let mut isolate = v8::Isolate::new(params);
    let handle = isolate.thread_safe_handle();

    let heap_exceeded = Arc::new(AtomicBool::new(false));
    let guard_ptr = if limits.heap_max_bytes > 0 {
        let ptr = Box::into_raw(Box::new(HeapGuard {
            handle: handle.clone(),
            flag: Arc::clone(&heap_exceeded),
        }));
        isolate.add_near_heap_limit_callback(on_near_heap_limit, ptr.cast());
        Some(ptr)
    } else {
        None
    };

    let free_guard = |ptr: Option<*mut HeapGuard>| {
        if let Some(ptr) = ptr {
            // Safety: the isolate holding the callback is gone.
            unsafe { drop(Box::from_raw(ptr)) };
        }
    };

    if handle_tx.send(handle).is_err() {
        // The invoker is gone; running the bundle with nobody able to
        // terminate it would leak this thread on an infinite loop.
        drop(isolate);
        free_guard(guard_ptr);
        return;
    }

    let state = Rc::new(RefCell::new(RenderResult::new()));
    isolate.set_slot(StateSlot(Rc::clone(&state)));
    isolate.set_slot(InvocationSlot(Rc::new(InvocationData {
        env: invocation.env,
        request: invocation.request,
        server_state: invocation.server_state,
    })));

    let outcome = execute_bundle(&mut isolate, bundle, &heap_exceeded, &state);

    drop(isolate);
    free_guard(guard_ptr);
    let _ = result_tx.send(outcome);
}

fn execute_bundle(
    isolate: &mut v8::OwnedIsolate,
    bundle: &[u8],
    heap_exceeded: &AtomicBool,
    state: &Rc<RefCell<RenderResult>>,
) -> WorkerOutcome {
    let code = String::from_utf8_lossy(bundle);

    let scope = &mut v8::HandleScope::new(isolate);
    let context = v8::Context::new(scope, v8::ContextOptions::default());
    let scope = &mut v8::ContextScope::new(scope, context);
    bridge::install(scope, context);

    let tc = &mut v8::TryCatch::new(scope);
    let Some(source) = v8::String::new(tc, &code) else {
        return Err(WorkerFailure::Init(
            "bundle is too large for the engine".to_string(),
        ));
    };
    let Some(script) = v8::Script::compile(tc, source, None) else {
        return Err(script_failure(tc));
    };

    match script.run(tc) {
        Some(_) => Ok(state.borrow().clone()),
        None if tc.has_terminated() => Err(WorkerFailure::Terminated {
            heap_exceeded: heap_exceeded.load(Ordering::SeqCst),
        }),
        None => Err(script_failure(tc)),
    }
}

fn script_failure(tc: &mut v8::TryCatch<v8::HandleScope>) -> WorkerFailure {
    if tc.has_terminated() {
        return WorkerFailure::Terminated {
            heap_exceeded: false,
        };
    }
    let Some(message) = tc.message() else {
        return WorkerFailure::Script {
            message: "unknown script error".to_string(),
            line: 0,
        };
    };
    let text = message.get(tc).to_rust_string_lossy(tc);
    let line = message.get_line_number(tc).unwrap_or(0);
    WorkerFailure::Script {
        message: text,
        line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Instant;

    fn sandbox(timeout: Duration) -> Sandbox {
        Sandbox::new(SandboxLimits::default(), timeout, "bundle.js")
    }

    fn invocation(path: &str, server_state: Option<&str>) -> Invocation {
        Invocation {
            env: "test".to_string(),
            request: RequestView::get(path),
            server_state: server_state.map(ToString::to_string),
        }
    }

    async fn run(bundle: &str) -> Result<RenderResult, SandboxError> {
        sandbox(Duration::from_secs(5))
            .execute(invocation("/t", None), Bytes::from(bundle.to_string()))
            .await
    }

    #[tokio::test]
    async fn renders_body_and_status() {
        let result = run(r#"server.response.render("<p>hi</p>", 201);"#)
            .await
            .unwrap();
        assert_eq!(result.body.as_deref(), Some("<p>hi</p>"));
        assert_eq!(result.status, Some(201));
    }

    #[tokio::test]
    async fn missing_status_defaults_and_out_of_range_clamps() {
        let result = run(r#"server.response.render("x");"#).await.unwrap();
        assert_eq!(result.status, Some(200));

        let result = run(r#"server.response.render("x", 9000);"#).await.unwrap();
        assert_eq!(result.status, Some(500));
    }

    #[tokio::test]
    async fn exposes_env_and_request_view() {
        let result = run(
            r#"
            const parts = [
                process.env.ENV,
                server.request.method(),
                server.request.path(),
                String(server.request.protoMajor()),
            ];
            server.response.render(parts.join("|"));
            "#,
        )
        .await
        .unwrap();
        assert_eq!(result.body.as_deref(), Some("test|GET|/t|1"));
    }

    #[tokio::test]
    async fn exposes_query_and_headers_as_multimaps() {
        let mut request = RequestView::get("/t");
        request.query = HashMap::from([("q".to_string(), vec!["a".to_string(), "b".to_string()])]);
        request.headers =
            HashMap::from([("accept".to_string(), vec!["text/html".to_string()])]);

        let result = sandbox(Duration::from_secs(5))
            .execute(
                Invocation {
                    env: "test".to_string(),
                    request,
                    server_state: None,
                },
                Bytes::from_static(
                    br#"
                    const q = server.request.query();
                    const h = server.request.headers();
                    server.response.render(q.q.join(",") + ";" + h.accept[0]);
                    "#,
                ),
            )
            .await
            .unwrap();
        assert_eq!(result.body.as_deref(), Some("a,b;text/html"));
    }

    #[tokio::test]
    async fn parses_server_state() {
        let result = sandbox(Duration::from_secs(5))
            .execute(
                invocation("/t", Some(r#"{"k":{"data":["{}"],"error":""}}"#)),
                Bytes::from_static(
                    br#"
                    const state = server.handler.state();
                    server.response.render(String(state.k.data.length));
                    "#,
                ),
            )
            .await
            .unwrap();
        assert_eq!(result.body.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn missing_state_is_an_empty_object() {
        let result = run(
            r"server.response.render(String(Object.keys(server.handler.state()).length));",
        )
        .await
        .unwrap();
        assert_eq!(result.body.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn head_elements_preserve_map_insertion_order() {
        let result = run(
            r#"
            server.response.setTitle("T");
            server.response.setMeta("m2", new Map([["name", "b"]]));
            server.response.setMeta("m1", new Map([["name", "k"], ["content", "v"]]));
            server.response.setMeta("m2", new Map([["name", "z"]]));
            "#,
        )
        .await
        .unwrap();
        assert_eq!(result.title.as_deref(), Some("T"));
        assert_eq!(result.metas.ids(), ["m2", "m1"]);
        let m1 = result.metas.get("m1").unwrap();
        let names: Vec<_> = m1.attrs().iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["name", "content"]);
        assert_eq!(result.metas.get("m2").unwrap().get("name"), Some("z"));
    }

    #[tokio::test]
    async fn plain_objects_work_as_attribute_maps() {
        let result = run(r#"server.response.setLink("l1", { rel: "canonical", href: "/x" });"#)
            .await
            .unwrap();
        assert_eq!(result.links.get("l1").unwrap().get("href"), Some("/x"));
    }

    #[tokio::test]
    async fn redirect_defaults_to_302() {
        let result = run(r#"server.response.redirect("/next");"#).await.unwrap();
        let redirect = result.redirect.unwrap();
        assert_eq!(redirect.url, "/next");
        assert_eq!(redirect.status, 302);
    }

    #[tokio::test]
    async fn illegal_argument_shapes_are_ignored() {
        let result = run(
            r#"
            server.response.render(42);
            server.response.setHeader(1, 2);
            server.response.setTitle({});
            server.response.setMeta("m1", "not-a-map");
            server.response.render("ok");
            "#,
        )
        .await
        .unwrap();
        assert_eq!(result.body.as_deref(), Some("ok"));
        assert!(result.headers.is_empty());
        assert!(result.title.is_none());
        assert!(result.metas.is_empty());
    }

    #[tokio::test]
    async fn script_errors_carry_message_and_line() {
        let err = run("const a = 1;\nundefinedCall();").await.unwrap_err();
        match err {
            SandboxError::Script {
                message,
                line,
                source_name,
            } => {
                assert!(message.contains("undefinedCall"), "{message}");
                assert_eq!(line, 2);
                assert_eq!(source_name, "bundle.js");
            }
            other => panic!("expected Script, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn compile_errors_are_script_errors() {
        let err = run("this is not javascript").await.unwrap_err();
        assert!(matches!(err, SandboxError::Script { .. }));
    }

    #[tokio::test]
    async fn infinite_loop_times_out_and_next_invocation_succeeds() {
        let sandbox = sandbox(Duration::from_millis(10));

        let started = Instant::now();
        let err = sandbox
            .execute(
                invocation("/t", None),
                Bytes::from_static(b"(()=>{while(true){}})();"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout));
        assert!(started.elapsed() < Duration::from_secs(1));

        // The interrupt is not observable to a fresh invocation.
        let result = sandbox
            .execute(
                invocation("/t", None),
                Bytes::from_static(br#"server.response.render("ok");"#),
            )
            .await
            .unwrap();
        assert_eq!(result.body.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn heap_limit_terminates_the_script_not_the_process() {
        let sandbox = Sandbox::new(
            SandboxLimits {
                heap_max_bytes: 8 * 1024 * 1024,
                stack_max_bytes: 0,
            },
            Duration::from_secs(10),
            "bundle.js",
        );
        let err = sandbox
            .execute(
                invocation("/t", None),
                Bytes::from_static(
                    b"const hog = []; for (;;) { hog.push(new Array(65536).fill('x')); }",
                ),
            )
            .await
            .unwrap_err();
        assert!(
            matches!(err, SandboxError::Script { .. } | SandboxError::Timeout),
            "{err:?}"
        );
    }
}
