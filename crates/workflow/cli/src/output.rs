//! Output formatting utilities

use procflow_engine::RecordingSink;
use serde::Serialize;

/// Print a value as pretty JSON on stdout
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print recorded engine events, one JSON object per line
pub fn print_events(sink: &RecordingSink) -> anyhow::Result<()> {
    for (_, event) in sink.events() {
        println!("{}", serde_json::to_string(event)?);
    }
    Ok(())
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("✓ {}", message);
}
