//! The user-agent header attached to every request.

/// Header name used to identify the client.
pub const USER_AGENT_HEADER: &str = "User-Agent";

/// Builds the user-agent value:
/// `hubwire/<major.minor> (<version>; <os>; Rust Client; <runtime>)`.
pub fn user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    let major_minor = version.split('.').take(2).collect::<Vec<_>>().join(".");
    format!(
        "hubwire/{major_minor} ({version}; {}; Rust Client; Unknown Runtime Version)",
        std::env::consts::OS
    )
}
