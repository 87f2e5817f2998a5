//! Common utilities shared by the engine, the CLI and the mock adapter

pub mod config;
pub mod error;
pub mod logging;
pub mod paths;

pub use error::{Error, Result};

/// Parse a "listening at:" address from adapter output.
/// Handles IPv6 format [::]:PORT by converting to 127.0.0.1:PORT
pub fn parse_listen_address(line: &str) -> Option<String> {
    let addr_start = line.find("listening at:")?;
    let addr = line[addr_start + "listening at:".len()..].trim();
    match addr.strip_prefix("[::]:") {
        Some(port) => Some(format!("127.0.0.1:{}", port)),
        None => Some(addr.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_listen_address() {
        assert_eq!(
            parse_listen_address("DAP server listening at: 127.0.0.1:4711").as_deref(),
            Some("127.0.0.1:4711")
        );
        assert_eq!(
            parse_listen_address("listening at: [::]:9000").as_deref(),
            Some("127.0.0.1:9000")
        );
        assert_eq!(parse_listen_address("starting up"), None);
    }
}
