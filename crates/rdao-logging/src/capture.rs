//! In-memory log capture for tests.
//!
//! Events are stored together with the fields of every span they were
//! emitted under, so a test can check that a server warning carried its
//! `session_id` or that a call log carried its `request_id`.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::Layer;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

/// One recorded event.
#[derive(Clone, Debug)]
pub struct CapturedEvent {
    /// Level the event was emitted at.
    pub level: Level,
    /// Module path of the emitter.
    pub target: String,
    /// The event message.
    pub message: String,
    /// Event fields first, then span fields from the innermost span outwards.
    pub fields: Vec<(String, String)>,
}

impl CapturedEvent {
    /// First value recorded under `name`, searching the event and then its spans.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.iter().find(|(key, _)| key == name).map(|(_, value)| value.as_str())
    }
}

/// Shared handle onto the captured events.
#[derive(Clone, Default)]
pub struct CapturedLogs {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CapturedLogs {
    /// Snapshot of everything captured so far.
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().clone()
    }

    /// First event at `level` whose message contains `needle`.
    pub fn find(&self, level: Level, needle: &str) -> Option<CapturedEvent> {
        self.events
            .lock()
            .iter()
            .find(|event| event.level == level && event.message.contains(needle))
            .cloned()
    }

    /// Whether an event at `level` mentions `needle`.
    pub fn has_event(&self, level: Level, needle: &str) -> bool {
        self.find(level, needle).is_some()
    }

    /// Number of events at or above `level` (`ERROR` is the most severe).
    pub fn count_at_least(&self, level: Level) -> usize {
        self.events.lock().iter().filter(|event| event.level <= level).count()
    }
}

#[derive(Default)]
struct Fields {
    message: String,
    pairs: Vec<(String, String)>,
}

impl Visit for Fields {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            value.clone_into(&mut self.message);
        } else {
            self.pairs.push((field.name().to_owned(), value.to_owned()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = rendered;
        } else {
            self.pairs.push((field.name().to_owned(), rendered));
        }
    }
}

/// Span fields, stored in the span's extensions.
struct SpanFields(Vec<(String, String)>);

struct CaptureLayer {
    logs: CapturedLogs,
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut fields = Fields::default();
        attrs.record(&mut fields);
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(SpanFields(fields.pairs));
        }
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let mut fields = Fields::default();
        values.record(&mut fields);
        if let Some(span) = ctx.span(id) {
            let mut extensions = span.extensions_mut();
            match extensions.get_mut::<SpanFields>() {
                Some(existing) => existing.0.extend(fields.pairs),
                None => extensions.insert(SpanFields(fields.pairs)),
            }
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let mut fields = Fields::default();
        event.record(&mut fields);
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(SpanFields(pairs)) = span.extensions().get::<SpanFields>() {
                    fields.pairs.extend(pairs.iter().cloned());
                }
            }
        }

        let metadata = event.metadata();
        self.logs.events.lock().push(CapturedEvent {
            level: *metadata.level(),
            target: metadata.target().to_owned(),
            message: fields.message,
            fields: fields.pairs,
        });
    }
}

/// Capture every event on the current thread while the guard lives.
///
/// Only the current thread is covered, so use it from a current-thread
/// runtime (plain `#[tokio::test]`) when the code under test spawns tasks.
pub fn capture_logs() -> (CapturedLogs, DefaultGuard) {
    let logs = CapturedLogs::default();
    let guard = tracing_subscriber::registry()
        .with(CaptureLayer { logs: logs.clone() })
        .set_default();
    (logs, guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{info, info_span, warn};

    #[test]
    fn events_carry_span_fields() {
        let (logs, _guard) = capture_logs();
        let session = info_span!("session", session_id = "s-1");
        let _entered = session.enter();
        let call = info_span!("call", request_id = 7_u64);
        call.in_scope(|| warn!(reason = "bad", "call failed"));

        let event = logs.find(Level::WARN, "call failed").unwrap();
        assert_eq!(event.field("reason"), Some("bad"));
        assert_eq!(event.field("request_id"), Some("7"));
        assert_eq!(event.field("session_id"), Some("s-1"));
    }

    #[test]
    fn recorded_span_fields_are_kept() {
        let (logs, _guard) = capture_logs();
        let span = info_span!("link", peer = tracing::field::Empty);
        let _ = span.record("peer", "loopback");
        span.in_scope(|| info!("opened"));
        assert_eq!(logs.events()[0].field("peer"), Some("loopback"));
    }

    #[test]
    fn severity_filtering() {
        let (logs, _guard) = capture_logs();
        info!("fine");
        warn!("odd");
        tracing::error!("broken");
        assert_eq!(logs.count_at_least(Level::WARN), 2);
        assert!(logs.has_event(Level::ERROR, "broken"));
        assert!(!logs.has_event(Level::INFO, "broken"));
    }
}
