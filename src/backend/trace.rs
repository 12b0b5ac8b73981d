//! Execution traces in Chrome Trace Event JSON.
//!
//! [`TraceLayer`] turns span enter/exit into `B`/`E` events and every
//! `tracing` event into an instant (`i`) event. Nothing is written unless a
//! trace session is active, and the layer must be part of the installed
//! subscriber for anything but the start and stop records to show up.
//!
//! The output loads directly into <https://ui.perfetto.dev>.

use super::Capture;
use crate::error::{Error, Result};
use crate::mode::Mode;
use crate::sink::Sink;
use profsession_runtime::current_tid;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;

const CATEGORY: &str = "profsession";

/// Fast path so the layer costs one load while no trace is recorded
static ACTIVE: AtomicBool = AtomicBool::new(false);
/// Set once any subscriber picks up a [`TraceLayer`]
static LAYER_INSTALLED: AtomicBool = AtomicBool::new(false);
static WRITER: Mutex<Option<TraceWriter>> = Mutex::new(None);

#[derive(Serialize)]
struct TraceEvent<'a> {
    name: &'a str,
    cat: &'a str,
    ph: &'static str,
    ts: u64,
    pid: u32,
    tid: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    s: Option<&'static str>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    args: Map<String, Value>,
}

/// Streams events into the sink as a JSON array
struct TraceWriter {
    sink: Sink,
    started: Instant,
    pid: u32,
    events: u64,
    /// First write failure; later events are dropped
    error: Option<io::Error>,
}

impl TraceWriter {
    fn begin(sink: Sink) -> io::Result<Self> {
        let mut writer = TraceWriter {
            sink,
            started: Instant::now(),
            pid: std::process::id(),
            events: 0,
            error: None,
        };
        writer.sink.write_all(b"[\n")?;

        let mut args = Map::new();
        args.insert("name".into(), Value::String(process_name()));
        writer.write("process_name", "__metadata", "M", None, args)?;

        let mut args = Map::new();
        args.insert(
            "started_at".into(),
            Value::String(chrono::Local::now().to_rfc3339()),
        );
        writer.write("trace started", CATEGORY, "i", Some("g"), args)?;
        Ok(writer)
    }

    fn write(
        &mut self,
        name: &str,
        cat: &str,
        ph: &'static str,
        scope: Option<&'static str>,
        args: Map<String, Value>,
    ) -> io::Result<()> {
        if self.events > 0 {
            self.sink.write_all(b",\n")?;
        }
        let event = TraceEvent {
            name,
            cat,
            ph,
            ts: self.started.elapsed().as_micros() as u64,
            pid: self.pid,
            tid: current_tid(),
            s: scope,
            args,
        };
        serde_json::to_writer(&mut self.sink, &event)?;
        self.events += 1;
        Ok(())
    }

    fn record(
        &mut self,
        name: &str,
        cat: &str,
        ph: &'static str,
        scope: Option<&'static str>,
        args: Map<String, Value>,
    ) {
        if self.error.is_some() {
            return;
        }
        if let Err(err) = self.write(name, cat, ph, scope, args) {
            self.error = Some(err);
        }
    }

    fn finish(mut self) -> io::Result<Sink> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        self.write("trace stopped", CATEGORY, "i", Some("g"), Map::new())?;
        self.sink.write_all(b"\n]\n")?;
        Ok(self.sink)
    }
}

fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn is_active() -> bool {
    ACTIVE.load(Ordering::Acquire)
}

/// Append one event to the active trace. No `tracing` calls may happen
/// while the writer lock is held.
fn record(
    name: &str,
    cat: &str,
    ph: &'static str,
    scope: Option<&'static str>,
    args: Map<String, Value>,
) {
    if !is_active() {
        return;
    }
    let mut writer = WRITER.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(writer) = writer.as_mut() {
        writer.record(name, cat, ph, scope, args);
    }
}

pub(crate) struct TraceCapture;

pub(crate) fn start(sink: Sink) -> Result<Box<dyn Capture>> {
    if !LAYER_INSTALLED.load(Ordering::Acquire) {
        tracing::warn!(
            "TraceLayer is not installed, the trace will only hold start and stop records"
        );
    }

    let mut slot = WRITER.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_some() {
        return Err(Error::backend(
            Mode::Trace,
            "an execution trace is already being recorded",
        ));
    }
    *slot = Some(TraceWriter::begin(sink)?);
    ACTIVE.store(true, Ordering::Release);
    Ok(Box::new(TraceCapture))
}

impl Capture for TraceCapture {
    fn stop(self: Box<Self>) -> Result<Sink> {
        ACTIVE.store(false, Ordering::Release);
        let writer = WRITER
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| Error::backend(Mode::Trace, "trace writer is gone"))?;
        Ok(writer.finish()?)
    }
}

/// Span fields captured at creation, replayed as args on every enter
struct SpanFields(Map<String, Value>);

struct JsonVisitor<'a>(&'a mut Map<String, Value>);

impl Visit for JsonVisitor<'_> {
    fn record_f64(&mut self, field: &Field, value: f64) {
        let value = serde_json::Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or(Value::Null);
        self.0.insert(field.name().to_string(), value);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), Value::Bool(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.0
            .insert(field.name().to_string(), Value::String(value.to_string()));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0
            .insert(field.name().to_string(), Value::String(format!("{value:?}")));
    }
}

/// `tracing` layer feeding the active execution trace
#[derive(Debug, Default, Clone, Copy)]
pub struct TraceLayer;

impl<S> Layer<S> for TraceLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_layer(&mut self, _subscriber: &mut S) {
        LAYER_INSTALLED.store(true, Ordering::Release);
    }

    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut fields = Map::new();
        attrs.record(&mut JsonVisitor(&mut fields));
        span.extensions_mut().insert(SpanFields(fields));
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut extensions = span.extensions_mut();
        if let Some(SpanFields(fields)) = extensions.get_mut::<SpanFields>() {
            values.record(&mut JsonVisitor(fields));
        }
    }

    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        if !is_active() {
            return;
        }
        let Some(span) = ctx.span(id) else { return };
        let args = span
            .extensions()
            .get::<SpanFields>()
            .map(|fields| fields.0.clone())
            .unwrap_or_default();
        record(span.name(), span.metadata().target(), "B", None, args);
    }

    fn on_exit(&self, id: &Id, ctx: Context<'_, S>) {
        if !is_active() {
            return;
        }
        let Some(span) = ctx.span(id) else { return };
        record(span.name(), span.metadata().target(), "E", None, Map::new());
    }

    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if !is_active() {
            return;
        }
        let metadata = event.metadata();
        let mut args = Map::new();
        event.record(&mut JsonVisitor(&mut args));
        let name = match args.remove("message") {
            Some(Value::String(message)) => message,
            _ => metadata.name().to_string(),
        };
        args.insert("level".into(), Value::String(metadata.level().to_string()));
        record(&name, metadata.target(), "i", Some("t"), args);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tracing_subscriber::layer::SubscriberExt;

    fn read_events(path: &std::path::Path) -> Vec<Value> {
        let text = std::fs::read_to_string(path).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[test]
    #[serial]
    fn test_spans_and_events_are_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let subscriber = tracing_subscriber::registry().with(TraceLayer);

        let path = tracing::subscriber::with_default(subscriber, || {
            let capture = start(Sink::create(dir.path(), "trace.out").unwrap()).unwrap();
            tracing::info_span!("work", batch = 7).in_scope(|| {
                tracing::info!(answer = 42, "hello");
            });
            let sink = capture.stop().unwrap();
            let path = sink.path().to_path_buf();
            sink.close().unwrap();
            path
        });

        let events = read_events(&path);
        assert_eq!(events.first().unwrap()["ph"], "M");
        assert_eq!(events.last().unwrap()["name"], "trace stopped");

        let begin = events
            .iter()
            .find(|e| e["ph"] == "B" && e["name"] == "work")
            .unwrap();
        assert_eq!(begin["args"]["batch"], 7);
        assert!(events.iter().any(|e| e["ph"] == "E" && e["name"] == "work"));

        let hello = events.iter().find(|e| e["name"] == "hello").unwrap();
        assert_eq!(hello["ph"], "i");
        assert_eq!(hello["args"]["answer"], 42);
        assert_eq!(hello["args"]["level"], "INFO");
    }

    #[test]
    #[serial]
    fn test_nothing_recorded_when_inactive() {
        let dir = tempfile::tempdir().unwrap();
        let subscriber = tracing_subscriber::registry().with(TraceLayer);

        let path = tracing::subscriber::with_default(subscriber, || {
            tracing::info!("before");
            let capture = start(Sink::create(dir.path(), "trace.out").unwrap()).unwrap();
            let sink = capture.stop().unwrap();
            tracing::info!("after");
            let path = sink.path().to_path_buf();
            sink.close().unwrap();
            path
        });

        let events = read_events(&path);
        assert!(!events.iter().any(|e| e["name"] == "before" || e["name"] == "after"));
        assert!(!is_active());
    }

    #[test]
    #[serial]
    fn test_second_trace_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let first = start(Sink::create(dir.path(), "a.out").unwrap()).unwrap();
        let err = start(Sink::create(dir.path(), "b.out").unwrap()).err().unwrap();
        assert!(matches!(err, Error::Backend { mode: Mode::Trace, .. }));
        first.stop().unwrap().close().unwrap();
    }
}
