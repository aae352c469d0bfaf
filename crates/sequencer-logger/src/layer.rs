use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::json;

use crate::record::Record;

/// A `tracing_subscriber::Layer` that flattens spans and events into
/// [`Record`]s and hands each one to `handler`. Grounded on the
/// span-extension-as-accumulator pattern used by comparable structured
/// logging layers: a span's fields are recorded once `on_new_span`, updated
/// by `on_record`, and an event walks its ancestor spans at `on_event` time
/// to attach them (`ctx.event_scope`).
pub struct JsonLayer<H>
where
    H: Fn(Record) + Send + Sync + 'static,
{
    handler: H,
}

impl<H> JsonLayer<H>
where
    H: Fn(Record) + Send + Sync + 'static,
{
    pub fn new(handler: H) -> Self {
        Self { handler }
    }

    fn now_unix_ms(&self) -> u128 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
    }

    fn record_from_metadata(&self, metadata: &tracing::Metadata) -> Record {
        let mut record = Record::empty(metadata.level(), self.now_unix_ms());
        record
            .fields
            .insert("target".to_string(), json!(metadata.target()).to_string());
        record
    }
}

impl<S, H> tracing_subscriber::Layer<S> for JsonLayer<H>
where
    S: tracing::Subscriber,
    S: for<'lookup> tracing_subscriber::registry::LookupSpan<'lookup>,
    H: Fn(Record) + Send + Sync + 'static,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut record = self.record_from_metadata(attrs.metadata());
        record.message = attrs.metadata().name().to_string();
        attrs.record(&mut FieldVisitor(&mut record));

        let span = ctx.span(id).expect("span must exist for its own new_span callback");
        span.extensions_mut().insert(record);
    }

    fn on_record(
        &self,
        id: &tracing::span::Id,
        values: &tracing::span::Record<'_>,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let span = ctx.span(id).expect("span must exist while recording values");
        let mut extensions = span.extensions_mut();
        if let Some(record) = extensions.get_mut::<Record>() {
            values.record(&mut FieldVisitor(record));
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut record = self.record_from_metadata(event.metadata());
        event.record(&mut FieldVisitor(&mut record));

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope.from_root() {
                let extensions = span.extensions();
                if let Some(span_record) = extensions.get::<Record>() {
                    record.spans.push(span_record.clone());
                }
            }
        }

        (self.handler)(record)
    }
}

struct FieldVisitor<'a>(&'a mut Record);

impl<'a> FieldVisitor<'a> {
    fn record_raw(&mut self, field: &tracing::field::Field, value: String) {
        if field.name() == "message" && self.0.message.is_empty() {
            self.0.message = value;
        } else {
            self.0.fields.insert(field.name().to_string(), value);
        }
    }
}

impl<'a> tracing::field::Visit for FieldVisitor<'a> {
    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        self.record_raw(field, json!(value).to_string())
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.record_raw(field, json!(value).to_string())
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.record_raw(field, json!(value).to_string())
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.record_raw(field, json!(value).to_string())
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" && self.0.message.is_empty() {
            self.0.message = value.to_string();
        } else {
            self.record_raw(field, json!(value).to_string())
        }
    }

    fn record_error(&mut self, field: &tracing::field::Field, value: &(dyn std::error::Error + 'static)) {
        let mut chain = vec![value.to_string()];
        let mut next = value.source();
        while let Some(cur) = next {
            chain.push(cur.to_string());
            next = cur.source();
        }
        self.record_raw(field, json!(chain).to_string());
    }

    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.record_raw(field, format!("{value:?}"))
    }
}
