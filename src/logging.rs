use std::fmt;
use std::io::IsTerminal;

use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::{FormatEvent, FormatFields, Writer};
use tracing_subscriber::fmt::FmtContext;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::types::LogFormat;

/// Custom tracing formatter that prepends colored [DENY]/[OK] prefixes
/// to log events based on message content.
pub struct PrefixedFormatter<E> {
    inner: E,
    ansi: bool,
}

impl<E> PrefixedFormatter<E> {
    pub fn new(inner: E, ansi: bool) -> Self {
        Self { inner, ansi }
    }
}

impl<S, N, E> FormatEvent<S, N> for PrefixedFormatter<E>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    E: FormatEvent<S, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);
        let msg_lower = visitor.message.to_lowercase();

        if is_deny_pattern(&msg_lower) {
            if self.ansi {
                write!(writer, "\x1b[31m[DENY]\x1b[0m ")?;
            } else {
                write!(writer, "[DENY] ")?;
            }
        } else if is_ok_pattern(&msg_lower) {
            if self.ansi {
                write!(writer, "\x1b[34m[OK]\x1b[0m ")?;
            } else {
                write!(writer, "[OK] ")?;
            }
        }

        self.inner.format_event(ctx, writer, event)
    }
}

/// Visitor that extracts the message field from a tracing event.
struct MessageVisitor {
    message: String,
}

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        }
    }
}

fn is_deny_pattern(msg: &str) -> bool {
    msg.contains("rejected")
        || msg.contains("refused")
        || msg.contains("mismatch")
        || msg.contains("does not support authentication")
        || msg.contains("giving up")
        || msg.contains("handshake failed")
}

fn is_ok_pattern(msg: &str) -> bool {
    msg.contains("backend connection established")
        || msg.contains("session opened")
        || msg.contains("program started")
}

/// Initialize the global tracing subscriber.
///
/// In Pretty mode, wraps the default formatter with `PrefixedFormatter`
/// to prepend colored [DENY]/[OK] tags. JSON mode is unchanged.
pub fn setup_logging(level: &str, format: LogFormat) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .init();
        }
        LogFormat::Pretty => {
            let ansi = std::io::stdout().is_terminal();
            let default_format = tracing_subscriber::fmt::format::Format::default();
            tracing_subscriber::fmt()
                .event_format(PrefixedFormatter::new(default_format, ansi))
                .with_env_filter(filter)
                .init();
        }
    }
}
