//! frps TOML config generation
//!
//! The generated file registers this server as the daemon's HTTP plugin for
//! Login/NewProxy/CloseProxy/Ping. Every user-supplied string is escaped for
//! the TOML double-quoted-string form before emission; the file is written
//! owner-rw only since it carries the auth token and admin password.

use std::fs;
use std::path::Path;

use crate::config::Config;
use crate::error::{AppError, Result};
use crate::store::restrict_file_mode;

/// Escape a string for a TOML double-quoted ("basic") string.
pub fn escape_toml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

/// Render the full frps configuration document.
pub fn render(config: &Config) -> String {
    let frps = &config.frps;
    format!(
        r#"bindAddr = "{bind_addr}"
bindPort = {bind_port}

[auth]
method = "token"
token  = "{token}"

[webServer]
addr     = "{admin_addr}"
port     = {admin_port}
user     = "{admin_user}"
password = "{admin_password}"

allowPorts = [{{ start = {range_start}, end = {range_end} }}]
maxPortsPerClient = 1

[[httpPlugins]]
name = "firefrp-manager"
addr = "127.0.0.1:{server_port}"
path = "/frps-plugin/handler"
ops  = ["Login", "NewProxy", "CloseProxy", "Ping"]
"#,
        bind_addr = escape_toml(&frps.bind_addr),
        bind_port = frps.bind_port,
        token = escape_toml(&frps.auth_token),
        admin_addr = escape_toml(&frps.admin_addr),
        admin_port = frps.admin_port,
        admin_user = escape_toml(&frps.admin_user),
        admin_password = escape_toml(&frps.admin_password),
        range_start = config.port_range_start,
        range_end = config.port_range_end,
        server_port = config.server_port,
    )
}

/// Write the rendered config to `path` with mode 0600.
pub fn write(config: &Config, path: &Path) -> Result<()> {
    let content = render(config);
    fs::write(path, content)
        .map_err(|e| AppError::Supervisor(format!("write {}: {}", path.display(), e)))?;
    restrict_file_mode(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_plain_passthrough() {
        assert_eq!(escape_toml("simple-token-123"), "simple-token-123");
    }

    #[test]
    fn test_escape_specials() {
        assert_eq!(escape_toml(r#"a"b"#), r#"a\"b"#);
        assert_eq!(escape_toml(r"a\b"), r"a\\b");
        assert_eq!(escape_toml("a\nb"), r"a\nb");
        assert_eq!(escape_toml("a\rb"), r"a\rb");
        assert_eq!(escape_toml("a\tb"), r"a\tb");
    }

    #[test]
    fn test_render_parses_as_toml() {
        let config = Config::default();
        let doc = render(&config);
        let value: toml::Value = toml::from_str(&doc).unwrap();

        assert_eq!(
            value.get("bindPort").and_then(|v| v.as_integer()),
            Some(7000)
        );
        assert_eq!(
            value
                .get("auth")
                .and_then(|a| a.get("method"))
                .and_then(|v| v.as_str()),
            Some("token")
        );
        assert_eq!(
            value
                .get("maxPortsPerClient")
                .and_then(|v| v.as_integer()),
            Some(1)
        );
        let plugins = value.get("httpPlugins").and_then(|v| v.as_array()).unwrap();
        assert_eq!(
            plugins[0].get("path").and_then(|v| v.as_str()),
            Some("/frps-plugin/handler")
        );
        assert_eq!(
            plugins[0].get("addr").and_then(|v| v.as_str()),
            Some("127.0.0.1:9001")
        );
    }

    #[test]
    fn test_hostile_password_round_trips() {
        let mut config = Config::default();
        config.frps.admin_password = "p\"w\\d\n\r\tend".to_string();
        config.frps.auth_token = "tok\"en\\with\nnasties".to_string();

        let doc = render(&config);
        let value: toml::Value = toml::from_str(&doc).unwrap();

        assert_eq!(
            value
                .get("webServer")
                .and_then(|w| w.get("password"))
                .and_then(|v| v.as_str()),
            Some(config.frps.admin_password.as_str())
        );
        assert_eq!(
            value
                .get("auth")
                .and_then(|a| a.get("token"))
                .and_then(|v| v.as_str()),
            Some(config.frps.auth_token.as_str())
        );
    }

    #[test]
    fn test_allow_ports_matches_pool() {
        let mut config = Config::default();
        config.port_range_start = 11000;
        config.port_range_end = 11099;
        let doc = render(&config);
        let value: toml::Value = toml::from_str(&doc).unwrap();
        let entry = &value.get("allowPorts").and_then(|v| v.as_array()).unwrap()[0];
        assert_eq!(entry.get("start").and_then(|v| v.as_integer()), Some(11000));
        assert_eq!(entry.get("end").and_then(|v| v.as_integer()), Some(11099));
    }

    #[cfg(unix)]
    #[test]
    fn test_written_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frps.toml");
        write(&Config::default(), &path).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
