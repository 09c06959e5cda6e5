//! Isolated evaluation of the extracted unit.
//!
//! Each [`Sandbox`] owns one worker thread and one fresh boa `Context`. The
//! context lives and dies on that thread; the host only ever talks to it over
//! channels, and every wait is bounded. This isolates the snippet from host
//! state; it is not a defence against hostile code.
//!
//! The extractor plants a call to [`CHECKPOINT`] at the top of every loop body
//! and function body. Once the host gives up on the worker it trips a shared
//! flag, and the next checkpoint throws an error scripts cannot catch, which
//! unwinds the worker back to Rust so the thread can be joined.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use boa_engine::vm::RuntimeLimits;
use boa_engine::{
    Context, JsNativeError, JsObject, JsResult, JsString, JsValue, NativeFunction, Source,
};
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::extractor::{ExtractedUnit, CHECKPOINT};

/// Host-side view of the decoders, one per slot.
pub trait Decode {
    fn is_available(&self, slot: usize) -> bool;
    fn decode(&self, slot: usize, index: f64, key: &str) -> Result<String, SandboxError>;
}

/// Stand-in when nothing could be evaluated.
pub struct NoDecoders;

impl Decode for NoDecoders {
    fn is_available(&self, _slot: usize) -> bool {
        false
    }

    fn decode(&self, _slot: usize, _index: f64, _key: &str) -> Result<String, SandboxError> {
        Err(SandboxError::Closed)
    }
}

enum Request {
    Decode {
        slot: usize,
        index: f64,
        key: String,
        reply: Sender<Result<String, SandboxError>>,
    },
}

type Ready = Result<Vec<Result<(), SandboxError>>, SandboxError>;

/// Handle on the worker thread. Dropping it stops the thread.
struct Worker {
    requests: Option<Sender<Request>>,
    handle: Option<JoinHandle<()>>,
    cancel: Arc<AtomicBool>,
    /// Disconnects when the worker returns.
    exited: Receiver<()>,
    grace: Duration,
}

impl Worker {
    fn spawn(
        unit: &ExtractedUnit,
        config: &SandboxConfig,
    ) -> Result<(Self, Receiver<Ready>), SandboxError> {
        let (ready_tx, ready_rx) = mpsc::channel::<Ready>();
        let (req_tx, req_rx) = mpsc::channel::<Request>();
        let (exit_tx, exit_rx) = mpsc::channel::<()>();
        let cancel = Arc::new(AtomicBool::new(false));

        let source = unit.source.clone();
        let exports = unit.exports.clone();
        let worker_config = config.clone();
        let worker_cancel = cancel.clone();
        let handle = std::thread::Builder::new()
            .name("deob-sandbox".to_string())
            .spawn(move || {
                let _exit = exit_tx;
                run_worker(source, exports, worker_config, worker_cancel, ready_tx, req_rx)
            })
            .map_err(|e| SandboxError::ExtractionFailure(e.to_string()))?;

        let worker = Self {
            requests: Some(req_tx),
            handle: Some(handle),
            cancel,
            exited: exit_rx,
            grace: Duration::from_millis(config.timeout_ms),
        };
        Ok((worker, ready_rx))
    }

    /// Closes the request channel, trips the checkpoint flag and joins the
    /// thread. Returns `false` if the thread was still running after the
    /// grace period, which only happens while it is stuck inside a single
    /// builtin call.
    fn stop(&mut self) -> bool {
        self.requests.take();
        self.cancel.store(true, Ordering::Relaxed);
        let Some(handle) = self.handle.take() else {
            return true;
        };
        match self.exited.recv_timeout(self.grace) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(grace_ms = self.grace.as_millis() as u64, "sandbox worker did not stop");
                false
            }
            _ => {
                let _ = handle.join();
                debug!("sandbox worker joined");
                true
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct Sandbox {
    worker: Worker,
    exports: Vec<Result<(), SandboxError>>,
    call_timeout_ms: u64,
    poisoned: Cell<bool>,
}

impl Sandbox {
    /// Evaluates `unit` in a fresh context and captures its exported decoders.
    ///
    /// Whole-unit failures are returned as errors. A single export that is
    /// not callable only disables its own slot, see [`Sandbox::unavailable`].
    pub fn evaluate(unit: &ExtractedUnit, config: &SandboxConfig) -> Result<Self, SandboxError> {
        let (mut worker, ready) = Worker::spawn(unit, config)?;

        let exports = match ready.recv_timeout(Duration::from_millis(config.timeout_ms)) {
            Ok(Ok(exports)) => exports,
            Ok(Err(err)) => return Err(err),
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout_ms = config.timeout_ms, "sandbox evaluation timed out");
                worker.stop();
                return Err(SandboxError::ExtractionTimeout {
                    timeout_ms: config.timeout_ms,
                });
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(SandboxError::ExtractionFailure(
                    "sandbox worker exited before reporting".to_string(),
                ));
            }
        };

        debug!(decoders = exports.len(), "sandbox ready");
        Ok(Self {
            worker,
            exports,
            call_timeout_ms: config.call_timeout_ms,
            poisoned: Cell::new(false),
        })
    }

    /// Slots whose export could not be captured, with the reason.
    pub fn unavailable(&self) -> impl Iterator<Item = (usize, &SandboxError)> {
        self.exports
            .iter()
            .enumerate()
            .filter_map(|(slot, status)| status.as_ref().err().map(|e| (slot, e)))
    }
}

impl Decode for Sandbox {
    fn is_available(&self, slot: usize) -> bool {
        matches!(self.exports.get(slot), Some(Ok(())))
    }

    fn decode(&self, slot: usize, index: f64, key: &str) -> Result<String, SandboxError> {
        if self.poisoned.get() {
            return Err(SandboxError::Closed);
        }
        let requests = self.worker.requests.as_ref().ok_or(SandboxError::Closed)?;
        let (reply_tx, reply_rx) = mpsc::channel();
        requests
            .send(Request::Decode {
                slot,
                index,
                key: key.to_string(),
                reply: reply_tx,
            })
            .map_err(|_| SandboxError::Closed)?;
        match reply_rx.recv_timeout(Duration::from_millis(self.call_timeout_ms)) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                // The worker is stuck on this call; later calls would queue behind it.
                self.poisoned.set(true);
                self.worker.cancel.store(true, Ordering::Relaxed);
                Err(SandboxError::CallTimeout {
                    timeout_ms: self.call_timeout_ms,
                })
            }
            Err(RecvTimeoutError::Disconnected) => Err(SandboxError::Closed),
        }
    }
}

// -----------------------------------------------------------------------------
// Worker
// -----------------------------------------------------------------------------

thread_local! {
    /// Cancellation flag of the sandbox owning this worker thread.
    static CANCELLED: RefCell<Option<Arc<AtomicBool>>> = const { RefCell::new(None) };
}

fn checkpoint(_this: &JsValue, _args: &[JsValue], _context: &mut Context) -> JsResult<JsValue> {
    let cancelled = CANCELLED.with(|flag| {
        flag.borrow()
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    });
    if cancelled {
        // Runtime-limit errors skip every `catch` on the way out.
        return Err(JsNativeError::runtime_limit()
            .with_message("sandbox cancelled by host")
            .into());
    }
    Ok(JsValue::undefined())
}

fn run_worker(
    source: String,
    exports: Vec<String>,
    config: SandboxConfig,
    cancel: Arc<AtomicBool>,
    ready: Sender<Ready>,
    requests: Receiver<Request>,
) {
    CANCELLED.with(|flag| *flag.borrow_mut() = Some(cancel));

    let mut context = Context::default();
    let mut limits = RuntimeLimits::default();
    limits.set_loop_iteration_limit(config.loop_iteration_limit);
    limits.set_recursion_limit(config.recursion_limit);
    context.set_runtime_limits(limits);

    if let Err(err) = strip_globals(&mut context, &config.allowed_globals) {
        let _ = ready.send(Err(err));
        return;
    }
    if let Err(err) = context.register_global_callable(
        JsString::from(CHECKPOINT),
        0,
        NativeFunction::from_fn_ptr(checkpoint),
    ) {
        let _ = ready.send(Err(SandboxError::ExtractionFailure(format!(
            "sandbox setup failed: {err}"
        ))));
        return;
    }
    if let Err(err) = context.eval(Source::from_bytes(&source)) {
        let _ = ready.send(Err(SandboxError::ExtractionFailure(err.to_string())));
        return;
    }

    let global = context.global_object();
    let mut decoders: Vec<Option<JsObject>> = Vec::with_capacity(exports.len());
    let mut status = Vec::with_capacity(exports.len());
    for name in &exports {
        match global.get(JsString::from(name.as_str()), &mut context) {
            Ok(value) => match value.as_callable() {
                Some(function) => {
                    decoders.push(Some(function.clone()));
                    status.push(Ok(()));
                }
                None => {
                    decoders.push(None);
                    status.push(Err(SandboxError::NotCallable(name.clone())));
                }
            },
            Err(err) => {
                decoders.push(None);
                status.push(Err(SandboxError::ExtractionFailure(err.to_string())));
            }
        }
    }
    if ready.send(Ok(status)).is_err() {
        // The host already gave up on us.
        return;
    }

    while let Ok(request) = requests.recv() {
        match request {
            Request::Decode {
                slot,
                index,
                key,
                reply,
            } => {
                let result = match decoders.get(slot).and_then(Option::as_ref) {
                    Some(function) => call_decoder(function, index, &key, &mut context),
                    None => Err(SandboxError::NotCallable(format!("slot {slot}"))),
                };
                let _ = reply.send(result);
            }
        }
    }
}

fn call_decoder(
    function: &JsObject,
    index: f64,
    key: &str,
    context: &mut Context,
) -> Result<String, SandboxError> {
    let args = [JsValue::from(index), JsValue::from(JsString::from(key))];
    let value = function
        .call(&JsValue::undefined(), &args, context)
        .map_err(|e| SandboxError::CallFailed(e.to_string()))?;
    match value.as_string() {
        // Lone surrogates have no faithful UTF-8 form.
        Some(s) => s
            .to_std_string()
            .map_err(|e| SandboxError::CallFailed(format!("decoder returned invalid UTF-16: {e}"))),
        None => Err(SandboxError::CallFailed(format!(
            "decoder returned {} instead of a string",
            value.type_of()
        ))),
    }
}

/// Deletes every global property not named in `allowed`.
fn strip_globals(context: &mut Context, allowed: &[String]) -> Result<(), SandboxError> {
    let allowed_json = serde_json::to_string(allowed)
        .map_err(|e| SandboxError::ExtractionFailure(e.to_string()))?;
    let prelude = format!(
        "(function (g, allowed) {{\
            var names = Object.getOwnPropertyNames(g);\
            for (var i = 0; i < names.length; i++) {{\
                if (allowed.indexOf(names[i]) === -1) {{\
                    try {{ delete g[names[i]]; }} catch (e) {{}}\
                }}\
            }}\
        }})(globalThis, {allowed_json});"
    );
    context
        .eval(Source::from_bytes(&prelude))
        .map(|_| ())
        .map_err(|e| SandboxError::ExtractionFailure(format!("sandbox setup failed: {e}")))
}
