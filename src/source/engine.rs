//! Script execution contexts
//!
//! The bridge depends only on the [`ScriptEngine`] abstraction: load a
//! script, probe its exports, call one, dispose. The concrete
//! implementation here runs JavaScript sources on Deno Core.
//!
//! Engines are not `Send`: a V8 isolate is single-threaded, so every engine
//! lives on its bridge's dedicated worker thread for its whole life.

use async_trait::async_trait;
use deno_core::{v8, JsRuntime, RuntimeOptions};
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// A failure reported by the script side of the boundary
///
/// `code` is the optional machine-readable classification a script may
/// attach to a thrown value (`not_found`, `network`, `parse`); the bridge
/// maps it into the host error taxonomy. The engine itself reports
/// `timeout` when it had to terminate a call.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptFailure {
    #[serde(default)]
    pub code: Option<String>,
    pub message: String,
}

impl ScriptFailure {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ScriptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => f.write_str(&self.message),
        }
    }
}

/// Outcome of a script call before host-side normalization
pub type ScriptResult<T> = std::result::Result<T, ScriptFailure>;

/// One script execution context
///
/// Exactly one engine exists per loaded source; no two sources share one.
#[async_trait(?Send)]
pub trait ScriptEngine {
    /// Load the source's entry script into the context
    fn load(&mut self, code: &str) -> ScriptResult<()>;

    /// Whether the loaded script exposes a callable export under `name`
    ///
    /// Takes `&mut self` because probing V8 globals needs the isolate.
    fn has_export(&mut self, name: &str) -> bool;

    /// Call an export with JSON arguments, driving any returned promise to
    /// completion, and return its JSON result
    async fn call(&mut self, export: &str, args: Value) -> ScriptResult<Value>;

    /// Tear the context down; the engine must not be called afterwards
    fn dispose(&mut self);
}

/// Host harness installed before the source script runs
///
/// `_folio_invoke` dispatches to an export by name and parks the outcome in
/// well-known globals, so per-call argument passing never compiles a new
/// script. Thrown values are folded into a `{code, message}` JSON envelope.
///
/// Every invocation bumps a generation counter and the completion callbacks
/// write only while their generation is still current, so a straggling
/// completion from an abandoned call can never masquerade as the result of
/// the call after it.
const HARNESS: &str = r#"
globalThis._folio_gen = 0;
globalThis._folio_invoke = function (name, args) {
    const gen = ++globalThis._folio_gen;
    globalThis._folio_status = "pending";
    const fail = (e) => {
        if (gen !== globalThis._folio_gen) {
            return;
        }
        let code;
        let message;
        if (e && typeof e === "object") {
            code = typeof e.code === "string" ? e.code : undefined;
            message = typeof e.message === "string" ? e.message : JSON.stringify(e);
        } else {
            message = String(e);
        }
        globalThis._folio_error = JSON.stringify({ code: code, message: message });
        globalThis._folio_status = "error";
    };
    try {
        const fn = globalThis[name];
        if (typeof fn !== "function") {
            fail({ message: "export is not a function: " + name });
            return;
        }
        Promise.resolve(fn(args)).then((result) => {
            if (gen !== globalThis._folio_gen) {
                return;
            }
            globalThis._folio_result = JSON.stringify(result === undefined ? null : result);
            globalThis._folio_status = "success";
        }, fail);
    } catch (e) {
        fail(e);
    }
};
"#;

/// JavaScript execution context backed by Deno Core
pub struct DenoEngine {
    runtime: JsRuntime,
    source_id: String,
    call_timeout: Duration,
    isolate_handle: v8::IsolateHandle,
}

impl DenoEngine {
    /// Create a fresh context with the host harness installed
    ///
    /// `call_timeout` bounds every call including synchronous script code:
    /// a script that never yields gets its execution terminated from a
    /// watchdog thread.
    pub fn new(source_id: impl Into<String>, call_timeout: Duration) -> ScriptResult<Self> {
        let source_id = source_id.into();
        debug!(source_id = %source_id, "Creating script context");

        let mut runtime = JsRuntime::new(RuntimeOptions::default());
        runtime
            .execute_script("<folio_harness>", HARNESS.to_string().into())
            .map_err(|e| ScriptFailure::message(format!("failed to install harness: {}", e)))?;
        let isolate_handle = runtime.v8_isolate().thread_safe_handle();

        Ok(Self {
            runtime,
            source_id,
            call_timeout,
            isolate_handle,
        })
    }

    /// Synchronous V8 invocation plus one full event-loop drive
    async fn dispatch(&mut self, export: &str, args_json: &str) -> ScriptResult<()> {
        // Invoke through the V8 API so arguments never get compiled into a
        // new script.
        {
            let scope = &mut self.runtime.handle_scope();
            let context = scope.get_current_context();
            let global = context.global(scope);

            let invoke_name = v8::String::new(scope, "_folio_invoke")
                .ok_or_else(|| ScriptFailure::message("v8 string allocation failed"))?;
            let invoke_val = global
                .get(scope, invoke_name.into())
                .ok_or_else(|| ScriptFailure::message("_folio_invoke not found"))?;
            let invoke_func = v8::Local::<v8::Function>::try_from(invoke_val)
                .map_err(|_| ScriptFailure::message("_folio_invoke is not a function"))?;

            let export_v8 = v8::String::new(scope, export)
                .ok_or_else(|| ScriptFailure::message("v8 string allocation failed"))?;
            let args_json_v8 = v8::String::new(scope, args_json)
                .ok_or_else(|| ScriptFailure::message("v8 string allocation failed"))?;
            let args_val = v8::json::parse(scope, args_json_v8)
                .ok_or_else(|| ScriptFailure::message("failed to parse arguments in v8"))?;

            let recv = v8::undefined(scope).into();
            let call_args = [export_v8.into(), args_val];
            if invoke_func.call(scope, recv, &call_args).is_none() {
                return Err(ScriptFailure::message("_folio_invoke call failed"));
            }
        }

        // Drive pending promises and timers to completion.
        self.runtime
            .run_event_loop(Default::default())
            .await
            .map_err(|e| ScriptFailure::message(format!("event loop failed: {}", e)))?;
        Ok(())
    }

    /// Read a well-known string global, treating undefined/null as absent
    fn get_global_string(&mut self, key: &str) -> Option<String> {
        let scope = &mut self.runtime.handle_scope();
        let context = scope.get_current_context();
        let global = context.global(scope);

        let key_str = v8::String::new(scope, key)?;
        let val = global.get(scope, key_str.into())?;
        if val.is_undefined() || val.is_null() {
            return None;
        }
        Some(val.to_string(scope)?.to_rust_string_lossy(scope))
    }

    fn clear_call_globals(&mut self) {
        // _folio_result can hold large JSON strings; clear eagerly.
        let _ = self.runtime.execute_script(
            "<folio_cleanup>",
            r#"
            globalThis._folio_result = undefined;
            globalThis._folio_error = undefined;
            globalThis._folio_status = undefined;
            "#
            .to_string()
            .into(),
        );
    }

    fn parse_failure(raw: Option<String>) -> ScriptFailure {
        match raw {
            Some(json) => serde_json::from_str::<ScriptFailure>(&json)
                .unwrap_or_else(|_| ScriptFailure::message(json)),
            None => ScriptFailure::message("unknown script error"),
        }
    }
}

#[async_trait(?Send)]
impl ScriptEngine for DenoEngine {
    fn load(&mut self, code: &str) -> ScriptResult<()> {
        debug!(source_id = %self.source_id, "Loading source script");
        self.runtime
            .execute_script("<source_module>", code.to_string().into())
            .map_err(|e| ScriptFailure::message(format!("failed to evaluate script: {}", e)))?;
        Ok(())
    }

    fn has_export(&mut self, name: &str) -> bool {
        let scope = &mut self.runtime.handle_scope();
        let context = scope.get_current_context();
        let global = context.global(scope);

        let Some(key) = v8::String::new(scope, name) else {
            return false;
        };
        match global.get(scope, key.into()) {
            Some(val) => val.is_function(),
            None => false,
        }
    }

    async fn call(&mut self, export: &str, args: Value) -> ScriptResult<Value> {
        debug!(source_id = %self.source_id, export, "Calling script export");

        let args_json = serde_json::to_string(&args)
            .map_err(|e| ScriptFailure::message(format!("failed to serialize arguments: {}", e)))?;

        // The watchdog is the only way out of a script that never yields:
        // this thread is about to enter V8, so termination has to come from
        // another one.
        let fired = Arc::new(AtomicBool::new(false));
        let (disarm_tx, disarm_rx) = mpsc::channel::<()>();
        let watchdog = {
            let fired = Arc::clone(&fired);
            let handle = self.isolate_handle.clone();
            let deadline = self.call_timeout;
            thread::spawn(move || {
                if disarm_rx.recv_timeout(deadline).is_err() {
                    fired.store(true, Ordering::SeqCst);
                    handle.terminate_execution();
                }
            })
        };

        let dispatched = self.dispatch(export, &args_json).await;
        let _ = disarm_tx.send(());
        let _ = watchdog.join();

        if fired.load(Ordering::SeqCst) {
            warn!(source_id = %self.source_id, export, "Terminated runaway script call");
            self.runtime.v8_isolate().cancel_terminate_execution();
            self.clear_call_globals();
            return Err(ScriptFailure {
                code: Some("timeout".to_string()),
                message: format!("'{}' terminated after {:?}", export, self.call_timeout),
            });
        }
        dispatched?;

        let status = self.get_global_string("_folio_status");
        let outcome = match status.as_deref() {
            Some("success") => {
                let raw = self.get_global_string("_folio_result").ok_or_else(|| {
                    ScriptFailure::message("export completed but produced no result")
                })?;
                serde_json::from_str(&raw)
                    .map_err(|e| ScriptFailure::message(format!("unparseable result: {}", e)))
            }
            Some("error") => Err(Self::parse_failure(self.get_global_string("_folio_error"))),
            Some("pending") => Err(ScriptFailure::message(
                "event loop finished but export is still pending",
            )),
            other => Err(ScriptFailure::message(format!(
                "invalid execution status: {:?}",
                other
            ))),
        };

        self.clear_call_globals();
        outcome
    }

    fn dispose(&mut self) {
        debug!(source_id = %self.source_id, "Disposing script context");
        self.runtime.v8_isolate().low_memory_notification();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with(code: &str) -> DenoEngine {
        let mut engine = DenoEngine::new("test-source", Duration::from_secs(5)).unwrap();
        engine.load(code).unwrap();
        engine
    }

    #[tokio::test]
    async fn test_call_sync_export() {
        let mut engine = engine_with(
            r#"function greet(args) { return { message: "hello " + args.name }; }"#,
        );

        assert!(engine.has_export("greet"));
        let result = engine
            .call("greet", serde_json::json!({ "name": "folio" }))
            .await
            .unwrap();
        assert_eq!(result["message"], "hello folio");
    }

    #[tokio::test]
    async fn test_call_async_export() {
        let mut engine = engine_with(
            r#"async function later(args) { return args.n + 1; }"#,
        );

        let result = engine.call("later", serde_json::json!({ "n": 41 })).await.unwrap();
        assert_eq!(result, serde_json::json!(42));
    }

    #[tokio::test]
    async fn test_thrown_error_carries_code() {
        let mut engine = engine_with(
            r#"function find(args) { throw { code: "not_found", message: "no such book" }; }"#,
        );

        let err = engine.call("find", serde_json::json!({})).await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some("not_found"));
        assert!(err.message.contains("no such book"));
    }

    #[tokio::test]
    async fn test_thrown_string_has_no_code() {
        let mut engine = engine_with(r#"function boom() { throw "plain failure"; }"#);

        let err = engine.call("boom", serde_json::json!({})).await.unwrap_err();
        assert!(err.code.is_none());
        assert!(err.message.contains("plain failure"));
    }

    #[tokio::test]
    async fn test_missing_export() {
        let mut engine = engine_with(r#"const x = 1;"#);

        assert!(!engine.has_export("search"));
        let err = engine.call("search", serde_json::json!({})).await.unwrap_err();
        assert!(err.message.contains("not a function"));
    }

    #[test]
    fn test_load_syntax_error() {
        let mut engine = DenoEngine::new("broken", Duration::from_secs(5)).unwrap();
        assert!(engine.load("const x = ;").is_err());
    }

    #[tokio::test]
    async fn test_busy_loop_is_terminated() {
        let mut engine = DenoEngine::new("spin", Duration::from_millis(250)).unwrap();
        engine
            .load(
                r#"
                function spin() { while (true) {} }
                function ok() { return 1; }
                "#,
            )
            .unwrap();

        let err = engine.call("spin", serde_json::json!({})).await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some("timeout"));

        // The isolate stays usable after the termination.
        let result = engine.call("ok", serde_json::json!({})).await.unwrap();
        assert_eq!(result, serde_json::json!(1));
    }

    #[tokio::test]
    async fn test_stale_completion_does_not_overwrite_next_call() {
        // "one" parks its resolver and stays pending; "two" releases it
        // mid-call so the stale completion lands after the fresh one. The
        // generation guard must keep "two"'s result intact.
        let mut engine = engine_with(
            r#"
            function one() {
                return new Promise((resolve) => { globalThis._late = resolve; })
                    .then((v) => v)
                    .then((v) => v);
            }
            function two() {
                globalThis._late("stale");
                return "fresh";
            }
            "#,
        );

        let err = engine.call("one", serde_json::json!({})).await.unwrap_err();
        assert!(err.message.contains("pending"));

        let result = engine.call("two", serde_json::json!({})).await.unwrap();
        assert_eq!(result, serde_json::json!("fresh"));
    }

    #[tokio::test]
    async fn test_undefined_return_becomes_null() {
        let mut engine = engine_with(r#"function noop() {}"#);
        let result = engine.call("noop", serde_json::json!({})).await.unwrap();
        assert_eq!(result, serde_json::Value::Null);
    }
}
