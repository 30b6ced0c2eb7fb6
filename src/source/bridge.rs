//! Execution bridge
//!
//! One bridge per loaded source. Script engines are single-threaded, so each
//! bridge spawns a dedicated worker thread running a current-thread Tokio
//! runtime; the engine lives on that thread for its whole life and commands
//! cross over an mpsc channel with oneshot replies. One command channel per
//! source also gives the serialization guarantee: calls against a source run
//! strictly in submission order, while different sources proceed in parallel.
//!
//! The worker normalizes script failures into the host error taxonomy and
//! enforces the per-call timeout; the host side of the bridge normalizes
//! result shapes into the catalog model.

use serde_json::{json, Value};
use std::thread;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, info, warn};

use crate::core::config::SourcesConfig;
use crate::core::error::{Result, SourceError};
use crate::source::contract::{Operation, Source};
use crate::source::engine::{DenoEngine, ScriptEngine, ScriptFailure, ScriptResult};
use crate::source::manifest::{InstalledSource, SourceManifest};
use crate::source::model::{
    BookDetails, DownloadInfo, Page, PageCursor, PartialBook, SearchFilter, SearchRequest,
};

/// Creates the engine on the worker thread
///
/// The factory crosses the thread boundary so the engine itself never has to
/// be `Send`.
pub type EngineFactory = Box<dyn FnOnce() -> ScriptResult<Box<dyn ScriptEngine>> + Send>;

enum BridgeCommand {
    Invoke {
        op: Operation,
        args: Value,
        resp: oneshot::Sender<Result<Value>>,
    },
    Shutdown {
        resp: oneshot::Sender<()>,
    },
}

/// Thread-safe handle to one source's script execution context
#[derive(Debug)]
pub struct SourceBridge {
    manifest: SourceManifest,
    tx: mpsc::Sender<BridgeCommand>,
}

impl SourceBridge {
    /// Spawn a bridge running the source's entry script on a Deno engine
    pub async fn spawn(installed: &InstalledSource, config: &SourcesConfig) -> Result<Self> {
        let script = std::fs::read_to_string(installed.entry_path())?;
        let source_id = installed.manifest.source_id.clone();
        let call_timeout = config.call_timeout();
        let factory: EngineFactory = Box::new(move || {
            DenoEngine::new(source_id, call_timeout).map(|e| Box::new(e) as Box<dyn ScriptEngine>)
        });
        Self::spawn_with_engine(installed.manifest.clone(), script, config, factory).await
    }

    /// Spawn a bridge over an arbitrary engine implementation
    ///
    /// Resolves once the worker has loaded the script and verified its
    /// exports; an `Err` here means no worker is left running.
    pub async fn spawn_with_engine(
        manifest: SourceManifest,
        script: String,
        config: &SourcesConfig,
        factory: EngineFactory,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<BridgeCommand>(config.channel_capacity);
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

        let source_id = manifest.source_id.clone();
        let worker_manifest = manifest.clone();
        let call_timeout = config.call_timeout();

        thread::Builder::new()
            .name(format!("source-{}", source_id))
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(SourceError::InitializationFailed(format!(
                            "failed to build worker runtime: {}",
                            e
                        ))));
                        return;
                    }
                };

                let local = tokio::task::LocalSet::new();
                local.block_on(&rt, worker_loop(
                    worker_manifest,
                    script,
                    factory,
                    call_timeout,
                    rx,
                    ready_tx,
                ));
            })
            .map_err(|e| {
                SourceError::InitializationFailed(format!("failed to spawn worker thread: {}", e))
            })?;

        ready_rx.await.map_err(|_| {
            SourceError::InitializationFailed(format!("worker for '{}' died during load", source_id))
        })??;

        Ok(Self { manifest, tx })
    }

    pub fn manifest(&self) -> &SourceManifest {
        &self.manifest
    }

    /// Stop the worker, disposing the engine
    ///
    /// Dropping the last handle has the same effect; this just lets callers
    /// wait for the teardown.
    pub async fn shutdown(&self) {
        let (resp_tx, resp_rx) = oneshot::channel();
        if self
            .tx
            .send(BridgeCommand::Shutdown { resp: resp_tx })
            .await
            .is_ok()
        {
            let _ = resp_rx.await;
        }
    }

    /// Queue one operation and wait for its reply
    ///
    /// A caller that stops waiting simply drops the reply receiver; the
    /// worker's send then fails silently and the queue moves on.
    async fn invoke(&self, op: Operation, args: Value) -> Result<Value> {
        let (resp_tx, resp_rx) = oneshot::channel();

        self.tx
            .send(BridgeCommand::Invoke {
                op,
                args,
                resp: resp_tx,
            })
            .await
            .map_err(|_| SourceError::NotLoaded(self.manifest.source_id.clone()))?;

        match resp_rx.await {
            Ok(result) => result,
            Err(_) => Err(SourceError::NotLoaded(self.manifest.source_id.clone())),
        }
    }

    fn violation(&self, message: impl std::fmt::Display) -> SourceError {
        SourceError::ContractViolation(format!("{}: {}", self.manifest.source_id, message))
    }

    /// Decode a page of partial books, rejecting entries without identity
    fn normalize_page(&self, value: Value) -> Result<Page<PartialBook>> {
        let page: Page<PartialBook> = serde_json::from_value(value)
            .map_err(|e| self.violation(format_args!("malformed page: {}", e)))?;
        for book in &page.items {
            self.check_identity(book)?;
        }
        Ok(page)
    }

    fn check_identity(&self, book: &PartialBook) -> Result<()> {
        if book.id.trim().is_empty() {
            return Err(self.violation("book entry with empty id"));
        }
        if book.title.trim().is_empty() {
            return Err(self.violation(format_args!("book '{}' has empty title", book.id)));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Source for SourceBridge {
    async fn initialize(&self) -> Result<()> {
        self.invoke(Operation::Initialize, json!({})).await?;
        Ok(())
    }

    async fn search(&self, request: SearchRequest) -> Result<Page<PartialBook>> {
        let args = serde_json::to_value(&request)?;
        let value = self.invoke(Operation::Search, args).await?;
        self.normalize_page(value)
    }

    async fn get_book_details(&self, book_id: &str) -> Result<BookDetails> {
        let value = self
            .invoke(Operation::GetDetails, json!({ "bookId": book_id }))
            .await?;
        let details: BookDetails = serde_json::from_value(value)
            .map_err(|e| self.violation(format_args!("malformed book details: {}", e)))?;
        self.check_identity(&details.info)?;
        Ok(details)
    }

    async fn get_view_more(
        &self,
        view_more_id: &str,
        cursor: Option<PageCursor>,
    ) -> Result<Page<PartialBook>> {
        let value = self
            .invoke(
                Operation::GetViewMore,
                json!({ "viewMoreId": view_more_id, "page": cursor }),
            )
            .await?;
        self.normalize_page(value)
    }

    async fn get_download_info(&self, book_id: &str) -> Result<DownloadInfo> {
        let value = self
            .invoke(Operation::GetDownloadInfo, json!({ "bookId": book_id }))
            .await?;
        let info: DownloadInfo = serde_json::from_value(value)
            .map_err(|e| self.violation(format_args!("malformed download info: {}", e)))?;
        url::Url::parse(&info.url)
            .map_err(|e| self.violation(format_args!("invalid download url '{}': {}", info.url, e)))?;
        Ok(info)
    }

    async fn get_search_filters(&self) -> Result<Vec<SearchFilter>> {
        let value = self.invoke(Operation::GetSearchFilters, json!({})).await?;
        serde_json::from_value(value)
            .map_err(|e| self.violation(format_args!("malformed search filters: {}", e)))
    }
}

/// Everything that runs on the worker thread
async fn worker_loop(
    manifest: SourceManifest,
    script: String,
    factory: EngineFactory,
    call_timeout: Duration,
    mut rx: mpsc::Receiver<BridgeCommand>,
    ready_tx: oneshot::Sender<Result<()>>,
) {
    let source_id = manifest.source_id.clone();
    info!(source_id = %source_id, "Starting source worker");

    let mut engine = match factory() {
        Ok(engine) => engine,
        Err(e) => {
            let _ = ready_tx.send(Err(SourceError::InitializationFailed(format!(
                "failed to create engine for '{}': {}",
                source_id, e
            ))));
            return;
        }
    };

    if let Err(e) = engine.load(&script) {
        let _ = ready_tx.send(Err(SourceError::ContractViolation(format!(
            "{}: entry script failed to load: {}",
            source_id, e
        ))));
        return;
    }

    if let Err(e) = verify_exports(&manifest, engine.as_mut()) {
        let _ = ready_tx.send(Err(e));
        return;
    }

    let _ = ready_tx.send(Ok(()));

    let mut initialized = false;
    while let Some(cmd) = rx.recv().await {
        match cmd {
            BridgeCommand::Invoke { op, args, resp } => {
                let result = run_operation(
                    &source_id,
                    engine.as_mut(),
                    op,
                    args,
                    call_timeout,
                    &mut initialized,
                )
                .await;
                // Caller may have given up waiting; that is not our problem.
                let _ = resp.send(result);
            }
            BridgeCommand::Shutdown { resp } => {
                let _ = resp.send(());
                break;
            }
        }
    }

    engine.dispose();
    info!(source_id = %source_id, "Source worker exiting");
}

/// Mandatory exports plus one export per declared capability
fn verify_exports(manifest: &SourceManifest, engine: &mut dyn ScriptEngine) -> Result<()> {
    let mut required = vec![Operation::Initialize, Operation::GetDetails];
    required.extend(
        [
            Operation::Search,
            Operation::GetViewMore,
            Operation::GetDownloadInfo,
            Operation::GetSearchFilters,
        ]
        .into_iter()
        .filter(|op| {
            op.required_capability()
                .is_some_and(|cap| manifest.has_capability(cap))
        }),
    );

    for op in required {
        if !engine.has_export(op.export_name()) {
            return Err(SourceError::ContractViolation(format!(
                "{}: missing export '{}'",
                manifest.source_id,
                op.export_name()
            )));
        }
    }
    Ok(())
}

async fn run_operation(
    source_id: &str,
    engine: &mut dyn ScriptEngine,
    op: Operation,
    args: Value,
    call_timeout: Duration,
    initialized: &mut bool,
) -> Result<Value> {
    if op == Operation::Initialize {
        // Idempotent: repeat calls are absorbed here without touching the
        // script again.
        if *initialized {
            return Ok(Value::Null);
        }
    } else if !*initialized {
        return Err(SourceError::NotLoaded(source_id.to_string()));
    }

    let outcome = match tokio::time::timeout(call_timeout, engine.call(op.export_name(), args))
        .await
    {
        Ok(result) => result.map_err(|failure| map_failure(source_id, op, failure, call_timeout)),
        Err(_) => {
            warn!(source_id, operation = %op, "Script call timed out");
            Err(SourceError::Timeout(call_timeout))
        }
    };

    match &outcome {
        Ok(_) if op == Operation::Initialize => *initialized = true,
        Err(e) => {
            error!(source_id, operation = %op, error = %e, "Script call failed");
        }
        _ => {}
    }
    outcome
}

/// Fold a script-side failure into the host taxonomy
///
/// Scripts classify recoverable failures through the `code` field of a
/// thrown value; anything unclassified is treated as the script breaking
/// its contract. The engine's own `timeout` code (a terminated runaway
/// call) surfaces as `Timeout` for any operation.
fn map_failure(
    source_id: &str,
    op: Operation,
    failure: ScriptFailure,
    call_timeout: Duration,
) -> SourceError {
    if failure.code.as_deref() == Some("timeout") {
        return SourceError::Timeout(call_timeout);
    }
    if op == Operation::Initialize {
        return SourceError::InitializationFailed(format!("{}: {}", source_id, failure));
    }
    match failure.code.as_deref() {
        Some("not_found") => SourceError::NotFound(failure.message),
        Some("network") => SourceError::NetworkError(failure.message),
        Some("parse") => SourceError::ParseError(failure.message),
        _ => SourceError::ContractViolation(format!("{}: {}", source_id, failure)),
    }
}
