//! Hook invocation
//!
//! Marshals a [`MessageBuffer`] into a `Uint8Array`, calls the bound hook with
//! the dispatcher as `this`, and unmarshals the `[payload, length]` pair it
//! returns. Every per-call failure is contained here: [`Dispatcher::dispatch`]
//! is total and only ever degrades to an empty buffer.

use crate::dispatcher::Dispatcher;
use crate::error::InvocationFault;
use crate::ffi::ScriptHandle;
use crate::message::MessageBuffer;
use crate::runtime::RuntimeHandle;
use relay_metrics::{Counter, HookTimer};
use rquickjs::function::This;
use rquickjs::{ArrayBuffer, CatchResultExt, Ctx, Function, TypedArray, Value};
use std::sync::PoisonError;
use std::time::{Duration, Instant};

const DISPATCHED: &str = "dispatched";
const SKIPPED: &str = "skipped";
const SUCCEEDED: &str = "succeeded";
const FAILED: &str = "failed";
const MALFORMED: &str = "malformed";

/// Result of one hook call before it is collapsed for the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The input was absent; the runtime was not entered.
    Skipped,
    Succeeded(MessageBuffer),
    Failed(InvocationFault),
}

impl DispatchOutcome {
    pub fn into_buffer(self) -> MessageBuffer {
        match self {
            DispatchOutcome::Succeeded(buffer) => buffer,
            DispatchOutcome::Skipped | DispatchOutcome::Failed(_) => MessageBuffer::empty(),
        }
    }
}

/// Snapshot of a dispatcher's counters. All zero without the `metrics` feature.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DispatchStats {
    pub dispatched: usize,
    pub skipped: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub malformed: usize,
    /// Hook calls in the latency window behind the figures below.
    pub timed_calls: usize,
    pub average_hook_ms: f64,
    pub fastest_hook_ms: f64,
    pub slowest_hook_ms: f64,
}

#[derive(Debug, Default)]
pub(crate) struct HookMetrics {
    counter: Counter,
    timer: HookTimer,
}

impl HookMetrics {
    fn record(&mut self, outcome: &DispatchOutcome, elapsed: Option<Duration>) {
        if let Some(elapsed) = elapsed {
            self.timer.record(elapsed);
        }
        self.counter.increment(DISPATCHED, 1);
        match outcome {
            DispatchOutcome::Skipped => self.counter.increment(SKIPPED, 1),
            DispatchOutcome::Succeeded(_) => self.counter.increment(SUCCEEDED, 1),
            DispatchOutcome::Failed(fault) => {
                self.counter.increment(FAILED, 1);
                if matches!(fault, InvocationFault::MalformedResult(_)) {
                    self.counter.increment(MALFORMED, 1);
                }
            }
        }
    }

    pub(crate) fn snapshot(&self) -> DispatchStats {
        let (fastest_hook_ms, slowest_hook_ms) = self.timer.range_ms();
        DispatchStats {
            dispatched: self.counter.get(DISPATCHED),
            skipped: self.counter.get(SKIPPED),
            succeeded: self.counter.get(SUCCEEDED),
            failed: self.counter.get(FAILED),
            malformed: self.counter.get(MALFORMED),
            timed_calls: self.timer.samples(),
            average_hook_ms: self.timer.average_ms(),
            fastest_hook_ms,
            slowest_hook_ms,
        }
    }
}

impl Dispatcher {
    /// Run the hook on `input`. Never fails: faults come back as an empty buffer.
    pub fn dispatch(&self, input: MessageBuffer) -> MessageBuffer {
        self.invoke(&input).into_buffer()
    }

    /// Run the hook and report what happened.
    pub fn invoke(&self, input: &MessageBuffer) -> DispatchOutcome {
        let Some(bytes) = input.data() else {
            self.record(&DispatchOutcome::Skipped, None);
            return DispatchOutcome::Skipped;
        };

        let called = self.runtime.with(|ctx| {
            let started = Instant::now();
            let result = call_hook(&ctx, &self.runtime, self.instance, self.hook, bytes);
            (result, started.elapsed())
        });

        let (called, elapsed) = match called {
            Ok((result, elapsed)) => (Ok(result), Some(elapsed)),
            Err(err) => (Err(err), None),
        };

        let outcome = match called {
            Ok(Ok(buffer)) => DispatchOutcome::Succeeded(buffer),
            Ok(Err(fault)) => DispatchOutcome::Failed(fault),
            Err(err) => DispatchOutcome::Failed(InvocationFault::Engine(err.to_string())),
        };

        match &outcome {
            DispatchOutcome::Failed(fault @ InvocationFault::MalformedResult(_)) => {
                tracing::error!(target: "coprocess", hook = %self.hook_name(), error = %fault, "Hook returned a malformed result");
            }
            DispatchOutcome::Failed(fault) => {
                tracing::error!(target: "coprocess", hook = %self.hook_name(), error = %fault, "Hook invocation failed");
            }
            DispatchOutcome::Succeeded(buffer) => {
                tracing::trace!(target: "coprocess", bytes = buffer.length(), "Hook returned");
            }
            DispatchOutcome::Skipped => {}
        }

        self.record(&outcome, elapsed);
        outcome
    }

    /// Takes the metrics lock only after the hook has returned, so `stats()`
    /// never waits on a running script.
    fn record(&self, outcome: &DispatchOutcome, elapsed: Option<Duration>) {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(outcome, elapsed);
    }
}

fn call_hook<'js>(
    ctx: &Ctx<'js>,
    runtime: &RuntimeHandle,
    instance: ScriptHandle,
    hook: ScriptHandle,
    bytes: &[u8],
) -> Result<MessageBuffer, InvocationFault> {
    let engine = |err: rquickjs::Error| InvocationFault::Engine(err.to_string());

    let this = runtime.fetch(ctx, instance).map_err(engine)?;
    let hook: Function = runtime
        .fetch(ctx, hook)
        .and_then(|value| value.get())
        .map_err(engine)?;
    let payload = TypedArray::<u8>::new(ctx.clone(), bytes.to_vec()).map_err(engine)?;

    let result: Value = hook
        .call((This(this), payload))
        .catch(ctx)
        .map_err(|err| InvocationFault::Exception(err.to_string()))?;

    unmarshal(&result)
}

/// Accept exactly `[Uint8Array | ArrayBuffer, length]` with a matching length.
fn unmarshal(result: &Value<'_>) -> Result<MessageBuffer, InvocationFault> {
    let malformed = |why: String| InvocationFault::MalformedResult(why);

    let pair = result
        .as_array()
        .ok_or_else(|| malformed(format!("expected [payload, length], got {:?}", result.type_of())))?;
    if pair.len() != 2 {
        return Err(malformed(format!(
            "expected 2 elements, got {}",
            pair.len()
        )));
    }

    let payload: Value = pair.get(0).map_err(|err| malformed(err.to_string()))?;
    let bytes = payload_bytes(&payload).ok_or_else(|| {
        malformed(format!(
            "element 0 must be a Uint8Array or ArrayBuffer, got {:?}",
            payload.type_of()
        ))
    })?;

    let length: Value = pair.get(1).map_err(|err| malformed(err.to_string()))?;
    let length = length
        .as_int()
        .map(i64::from)
        .or_else(|| {
            length
                .as_float()
                .filter(|value| value.fract() == 0.0)
                .map(|value| value as i64)
        })
        .ok_or_else(|| malformed(format!("element 1 must be an integer, got {:?}", length.type_of())))?;

    MessageBuffer::from_raw_parts(Some(bytes), length).map_err(|err| malformed(err.to_string()))
}

fn payload_bytes(payload: &Value<'_>) -> Option<Vec<u8>> {
    if let Ok(array) = payload.get::<TypedArray<u8>>() {
        return array.as_bytes().map(<[u8]>::to_vec);
    }
    payload
        .get::<ArrayBuffer>()
        .ok()
        .and_then(|buffer| buffer.as_bytes().map(<[u8]>::to_vec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RuntimeConfig, DEFAULT_HOOK_NAME};
    use crate::loader::load_dispatcher_type;
    use rayon::prelude::*;
    use std::fs;
    use std::sync::Arc;

    struct Fixture {
        _dir: tempfile::TempDir,
        dispatcher: Dispatcher,
    }

    fn dispatcher_with_hook(hook_body: &str) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let source = format!(
            r#"
            globalThis.calls = 0;
            exports.Dispatcher = class {{
                constructor(path) {{ this.path = path; }}
                dispatch_hook(msg) {{
                    calls += 1;
                    {hook_body}
                }}
            }};
            "#
        );
        fs::write(dir.path().join("dispatcher.js"), source).unwrap();

        let mut runtime = RuntimeHandle::new(RuntimeConfig::with_search_paths([dir.path()]));
        runtime.initialize().unwrap();
        let runtime = Arc::new(runtime);
        let ty = load_dispatcher_type(&runtime, "dispatcher", "Dispatcher").unwrap();
        let dispatcher = Dispatcher::new(&ty, "/mw", DEFAULT_HOOK_NAME).unwrap();
        Fixture {
            _dir: dir,
            dispatcher,
        }
    }

    fn calls(fixture: &Fixture) -> i64 {
        fixture
            .dispatcher
            .runtime()
            .eval_json("calls")
            .unwrap()
            .as_i64()
            .unwrap()
    }

    fn buffer(bytes: &[u8]) -> MessageBuffer {
        MessageBuffer::new(bytes.to_vec()).unwrap()
    }

    #[test]
    fn test_identity_hook_round_trips_bytes() {
        let fixture = dispatcher_with_hook("return [msg, msg.length];");

        let payloads: [&[u8]; 4] = [b"", b"x", b"hello gateway", &[0, 255, 7, 0, 128]];
        for payload in payloads {
            let out = fixture.dispatcher.dispatch(buffer(payload));
            assert_eq!(out.data(), Some(payload));
            assert_eq!(out.length() as usize, payload.len());
        }

        let large: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        let out = fixture.dispatcher.dispatch(buffer(&large));
        assert_eq!(out.as_bytes(), large.as_slice());
    }

    #[test]
    fn test_hook_sees_receiver_and_exact_bytes() {
        let fixture = dispatcher_with_hook(
            r#"
            const out = new Uint8Array(msg.length + 1);
            out.set(msg, 0);
            out[msg.length] = this.path.length;
            return [out, out.length];
            "#,
        );
        let out = fixture.dispatcher.dispatch(buffer(&[1, 2, 3]));
        assert_eq!(out.as_bytes(), &[1, 2, 3, 3]);
    }

    #[test]
    fn test_array_buffer_payload_is_accepted() {
        let fixture = dispatcher_with_hook("return [msg.buffer.slice(0, 2), 2];");
        let out = fixture.dispatcher.dispatch(buffer(b"abc"));
        assert_eq!(out.as_bytes(), b"ab");
    }

    #[test]
    fn test_absent_input_never_enters_runtime() {
        let fixture = dispatcher_with_hook("return [msg, msg.length];");

        let out = fixture.dispatcher.dispatch(MessageBuffer::empty());
        assert!(out.is_absent());
        assert_eq!(out.length(), 0);
        assert_eq!(
            fixture.dispatcher.invoke(&MessageBuffer::empty()),
            DispatchOutcome::Skipped
        );
        assert_eq!(calls(&fixture), 0);
    }

    #[test]
    fn test_throwing_hook_degrades_to_empty() {
        let fixture = dispatcher_with_hook("throw new Error('middleware exploded');");

        let out = fixture.dispatcher.dispatch(buffer(b"payload"));
        assert!(out.is_absent());
        assert_eq!(out.length(), 0);

        match fixture.dispatcher.invoke(&buffer(b"payload")) {
            DispatchOutcome::Failed(InvocationFault::Exception(message)) => {
                assert!(message.contains("middleware exploded"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        // The runtime stays usable after a fault
        assert_eq!(calls(&fixture), 2);
    }

    #[test]
    fn test_malformed_results_degrade_like_faults() {
        let cases = [
            "return [msg];",
            "return [msg, msg.length, 0];",
            "return msg;",
            "return undefined;",
            "return ['text', 4];",
            "return [msg, 'three'];",
            "return [msg, msg.length + 1];",
            "return [msg, -1];",
            "return [msg, 1.5];",
        ];

        for body in cases {
            let fixture = dispatcher_with_hook(body);
            let input = buffer(b"abc");
            assert!(
                fixture.dispatcher.dispatch(input.clone()).is_absent(),
                "hook body `{body}` should degrade to empty"
            );
            assert!(
                matches!(
                    fixture.dispatcher.invoke(&input),
                    DispatchOutcome::Failed(InvocationFault::MalformedResult(_))
                ),
                "hook body `{body}` should be reported as malformed"
            );
        }
    }

    #[test]
    fn test_concurrent_dispatch_is_serialized() {
        // Read, spin, then write back: any overlap between calls loses updates.
        let fixture = dispatcher_with_hook(
            r#"
            const seen = globalThis.counter || 0;
            const until = Date.now() + 2;
            while (Date.now() < until) {}
            globalThis.counter = seen + 1;
            return [msg, msg.length];
            "#,
        );

        const CALLS: usize = 64;
        (0..CALLS).into_par_iter().for_each(|i| {
            let payload = (i as u32).to_le_bytes();
            let out = fixture.dispatcher.dispatch(buffer(&payload));
            assert_eq!(out.as_bytes(), &payload);
        });

        let counter = fixture.dispatcher.runtime().eval_json("counter").unwrap();
        assert_eq!(counter, serde_json::json!(CALLS));
    }

    #[test]
    fn test_stats_track_outcomes() {
        let fixture = dispatcher_with_hook(
            "if (msg.length === 0) throw new Error('empty'); return [msg, msg.length];",
        );

        fixture.dispatcher.dispatch(buffer(b"ok"));
        fixture.dispatcher.dispatch(buffer(b""));
        fixture.dispatcher.dispatch(MessageBuffer::empty());

        let stats = fixture.dispatcher.stats();
        if relay_metrics::ENABLED {
            assert_eq!(stats.dispatched, 3);
            assert_eq!(stats.succeeded, 1);
            assert_eq!(stats.failed, 1);
            assert_eq!(stats.skipped, 1);
            assert_eq!(stats.malformed, 0);
            // Skipped input never reaches the hook, so only two calls are timed
            assert_eq!(stats.timed_calls, 2);
            assert!(stats.fastest_hook_ms <= stats.average_hook_ms);
            assert!(stats.average_hook_ms <= stats.slowest_hook_ms);
        } else {
            assert_eq!(stats, DispatchStats::default());
        }
    }

    #[test]
    fn test_stats_answer_while_a_hook_runs() {
        let fixture = Arc::new(dispatcher_with_hook(
            r#"
            const until = Date.now() + 300;
            while (Date.now() < until) {}
            return [msg, msg.length];
            "#,
        ));

        let worker = {
            let fixture = Arc::clone(&fixture);
            std::thread::spawn(move || fixture.dispatcher.dispatch(buffer(b"slow")))
        };

        std::thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        let during = fixture.dispatcher.stats();
        assert!(
            started.elapsed() < Duration::from_millis(150),
            "stats() waited {:?} on the running hook",
            started.elapsed()
        );
        assert_eq!(during.succeeded, 0);

        assert_eq!(worker.join().unwrap().as_bytes(), b"slow");
        if relay_metrics::ENABLED {
            let after = fixture.dispatcher.stats();
            assert_eq!(after.succeeded, 1);
            assert!(after.slowest_hook_ms >= 250.0, "{after:?}");
        }
    }
}
