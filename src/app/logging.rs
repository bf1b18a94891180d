use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins over the configured level. Text in debug builds, JSON lines in release.
pub fn init_logging(level: &str) {
    let fallback = if level.trim().is_empty() {
        "info"
    } else {
        level.trim()
    };
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    if cfg!(debug_assertions) {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    }
}

pub fn new_trace_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn resolve_trace_id(trace_id: Option<String>) -> String {
    trace_id
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(new_trace_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_given_trace_id() {
        assert_eq!(resolve_trace_id(Some("abc".to_string())), "abc");
        let generated = resolve_trace_id(Some("  ".to_string()));
        assert_eq!(generated.len(), 36);
        assert_ne!(resolve_trace_id(None), resolve_trace_id(None));
    }
}
