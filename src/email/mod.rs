pub mod common;
pub mod relay;

// Re-export commonly used items
pub use common::{ParsedEmail, RelayStats};
pub use relay::{escape_markdown, matches_filter, Relay, RelayOutcome};
