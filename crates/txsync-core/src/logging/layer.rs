//! `tracing` layer that mirrors events into a node's JSONL file

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Record};
use tracing::{Event, Id, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use super::entry::JsonLogEntry;
use super::writer::NodeLogWriter;
use crate::error::{SyncError, SyncResult};

/// Span field that names the context a worker serves
const CONTEXT_FIELD: &str = "context";

/// Writes every event it sees to a [`NodeLogWriter`].
///
/// The `context` field of the nearest enclosing span is lifted into the
/// entry's `context` column.
pub struct JsonlLayer {
    writer: Arc<NodeLogWriter>,
}

/// Span extension holding the recorded `context` field
struct SpanContext(String);

impl JsonlLayer {
    pub fn new(logs_dir: impl AsRef<Path>, node: impl Into<String>) -> std::io::Result<Self> {
        Ok(Self {
            writer: Arc::new(NodeLogWriter::new(logs_dir, node)?),
        })
    }

    pub fn log_path(&self) -> &Path {
        self.writer.path()
    }

    pub fn node(&self) -> &str {
        self.writer.node()
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        let mut visitor = JsonVisitor::default();
        attrs.record(&mut visitor);
        if let (Some(context), Some(span)) = (visitor.take_context(), ctx.span(id)) {
            span.extensions_mut().insert(SpanContext(context));
        }
    }

    fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
        let mut visitor = JsonVisitor::default();
        values.record(&mut visitor);
        if let (Some(context), Some(span)) = (visitor.take_context(), ctx.span(id)) {
            let mut extensions = span.extensions_mut();
            extensions.remove::<SpanContext>();
            extensions.insert(SpanContext(context));
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let metadata = event.metadata();
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);

        let mut entry = JsonLogEntry::new(
            metadata.level().as_str().to_lowercase(),
            self.writer.node(),
            metadata.target(),
            visitor.message.take().unwrap_or_default(),
        );

        let own_context = visitor.take_context();
        if !visitor.fields.is_empty() {
            entry = entry.with_fields(serde_json::Value::Object(visitor.fields));
        }

        if let Some(scope) = ctx.event_scope(event) {
            let mut names = Vec::new();
            let mut context = own_context;
            for span in scope {
                if context.is_none() {
                    context = span
                        .extensions()
                        .get::<SpanContext>()
                        .map(|found| found.0.clone());
                }
                names.push(span.name());
            }
            names.reverse();
            if !names.is_empty() {
                entry = entry.with_span(names.join(" > "));
            }
            if let Some(context) = context {
                entry = entry.with_context(context);
            }
        } else if let Some(context) = own_context {
            entry = entry.with_context(context);
        }

        // Logging must never take the node down
        let _ = self.writer.write(&entry);
    }
}

#[derive(Default)]
struct JsonVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl JsonVisitor {
    fn insert(&mut self, field: &Field, value: serde_json::Value) {
        if field.name() == "message" {
            if let serde_json::Value::String(text) = value {
                self.message = Some(text);
                return;
            }
        }
        self.fields.insert(field.name().to_string(), value);
    }

    fn take_context(&mut self) -> Option<String> {
        match self.fields.remove(CONTEXT_FIELD)? {
            serde_json::Value::String(context) => Some(context),
            other => Some(other.to_string()),
        }
    }
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let mut buf = String::new();
        let _ = write!(buf, "{value:?}");
        self.insert(field, serde_json::Value::String(buf));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, serde_json::Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(number) = serde_json::Number::from_f64(value) {
            self.insert(field, serde_json::Value::Number(number));
        }
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.insert(field, serde_json::Value::String(value.to_string()));
    }
}

/// Assembles the global subscriber: env filter, console output, JSONL file
pub struct LoggingBuilder {
    logs_dir: PathBuf,
    node: String,
    console_output: bool,
    env_filter: Option<String>,
}

impl LoggingBuilder {
    pub fn new(logs_dir: impl Into<PathBuf>, node: impl Into<String>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
            node: node.into(),
            console_output: true,
            env_filter: None,
        }
    }

    /// Only write the JSONL file
    pub fn no_console(mut self) -> Self {
        self.console_output = false;
        self
    }

    /// Filter directives such as `txsync_core=debug`. Without one, `RUST_LOG`
    /// is used, falling back to `info`.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// The JSONL layer alone, for composing a subscriber by hand
    pub fn build_layer(&self) -> std::io::Result<JsonlLayer> {
        JsonlLayer::new(&self.logs_dir, &self.node)
    }

    fn filter(&self) -> SyncResult<EnvFilter> {
        match &self.env_filter {
            Some(directives) => {
                EnvFilter::try_new(directives).map_err(|e| SyncError::Config(e.to_string()))
            }
            None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))),
        }
    }

    /// Install the subscriber globally and return the JSONL file path.
    ///
    /// Fails if a global subscriber is already set.
    pub fn init(self) -> SyncResult<PathBuf> {
        let filter = self.filter()?;
        let jsonl = self.build_layer()?;
        let path = jsonl.log_path().to_path_buf();
        let console = self
            .console_output
            .then(|| tracing_subscriber::fmt::layer().with_target(true));

        tracing_subscriber::registry()
            .with(filter)
            .with(jsonl)
            .with(console)
            .try_init()
            .map_err(|e| SyncError::Config(e.to_string()))?;
        Ok(path)
    }
}
