//! Tracing subscriber setup for the binary.

use tracing_subscriber::fmt::format;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use std::fmt::Write as _;

const MAX_MESSAGE_CHARS: usize = 280;

/// Install a compact fmt subscriber on stderr.
///
/// `RUST_LOG` wins when set; otherwise `debug` picks the level.
pub fn init_tracing(debug: bool) {
    let field_formatter = format::debug_fn(|writer, field, value| {
        if field.name() == "message" {
            let formatted = format!("{value:?}");
            match truncate_for_log(&formatted, MAX_MESSAGE_CHARS) {
                (truncated, true) => write!(writer, "{}={truncated}...", field.name()),
                (_, false) => write!(writer, "{}={formatted}", field.name()),
            }
        } else {
            write!(writer, "{}={value:?}", field.name())
        }
    });

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .fmt_fields(field_formatter)
        .compact();

    tracing_subscriber::registry()
        .with(build_env_filter(debug))
        .with(fmt_layer)
        .init();
}

fn build_env_filter(debug: bool) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            tracing_subscriber::EnvFilter::new("carbonmeter=debug,sqlx=warn,info")
        } else {
            tracing_subscriber::EnvFilter::new("info,sqlx=warn")
        }
    })
}

/// Cut `value` to at most `max_chars` characters on a char boundary.
fn truncate_for_log(value: &str, max_chars: usize) -> (&str, bool) {
    match value.char_indices().nth(max_chars) {
        Some((index, _)) => (&value[..index], true),
        None => (value, false),
    }
}
