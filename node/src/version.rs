pub const RELAY_VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn git_commit_hash() -> &'static str {
    option_env!("GIT_COMMIT_HASH").unwrap_or("unknown")
}

/// Agent string advertised over identify.
pub fn agent_version() -> String {
    format!("relay-node/{RELAY_VERSION}")
}
