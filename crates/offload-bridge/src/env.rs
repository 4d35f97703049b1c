use std::env;
use std::sync::OnceLock;

static OFFBRIDGE_DEBUG_CHECKS: OnceLock<bool> = OnceLock::new();

fn parse_bool(value: &str) -> bool {
    let normalized = value.trim().to_ascii_lowercase();
    matches!(normalized.as_str(), "1" | "true" | "yes" | "on")
}

pub(crate) fn debug_checks_enabled() -> bool {
    *OFFBRIDGE_DEBUG_CHECKS.get_or_init(|| match env::var("OFFBRIDGE_DEBUG_CHECKS") {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value),
        _ => false,
    })
}
