//! Helpers shared by the daemon-facing modules

use crate::error::{GateError, GateResult};
use crate::validation::{sanitize_error_message, validate_interface_name};
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

/// Run a command and return its stdout, failing on a non-zero exit
pub async fn run_command(program: &str, args: &[&str]) -> GateResult<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| GateError::CommandFailed {
            cmd: format!("{} {}", program, args.join(" ")),
            code: None,
            stderr: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(GateError::CommandFailed {
            cmd: format!("{} {}", program, args.join(" ")),
            code: output.status.code(),
            stderr: sanitize_error_message(&String::from_utf8_lossy(&output.stderr)),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Run a command for its exit status only
pub async fn run_status(program: &str, args: &[&str]) -> bool {
    match run_command(program, args).await {
        Ok(_) => true,
        Err(e) => {
            debug!("{}", e);
            false
        }
    }
}

/// Ensure a directory exists, creating it if necessary
pub async fn ensure_directory_exists(path: &Path) -> GateResult<()> {
    if !path.exists() {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| GateError::ConfigError(format!("Failed to create directory {:?}: {}", path, e)))?;
        info!("Created directory: {:?}", path);
    }
    Ok(())
}

/// Write configuration to a file securely (with appropriate permissions)
pub async fn write_secure_config(path: &Path, content: &str, permissions: u32) -> GateResult<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(parent) = path.parent() {
        ensure_directory_exists(parent).await?;
    }

    tokio::fs::write(path, content)
        .await
        .map_err(|e| GateError::ConfigError(format!("Failed to write config to {:?}: {}", path, e)))?;

    let perms = std::fs::Permissions::from_mode(permissions);
    tokio::fs::set_permissions(path, perms)
        .await
        .map_err(|e| GateError::ConfigError(format!("Failed to set permissions on {:?}: {}", path, e)))?;

    debug!("Wrote config to {:?} with permissions {:o}", path, permissions);
    Ok(())
}

/// First IPv4 address of an interface, if it has one
pub async fn interface_ipv4(interface: &str) -> GateResult<Option<String>> {
    validate_interface_name(interface)?;
    let output = run_command("ip", &["-o", "-4", "addr", "show", "dev", interface]).await?;
    Ok(parse_ipv4_addr_output(&output))
}

/// Pull the address out of `ip -o -4 addr show` output
///
/// Lines look like `2: eth0    inet 192.0.2.10/24 brd ... scope global eth0`.
pub fn parse_ipv4_addr_output(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        tokens.find(|t| *t == "inet")?;
        let cidr = tokens.next()?;
        let addr = cidr.split('/').next()?;
        addr.parse::<std::net::Ipv4Addr>().ok().map(|a| a.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_ipv4_addr_output() {
        let output = "2: eth0    inet 192.0.2.10/24 brd 192.0.2.255 scope global eth0\\       valid_lft forever preferred_lft forever\n";
        assert_eq!(parse_ipv4_addr_output(output).as_deref(), Some("192.0.2.10"));
        assert_eq!(parse_ipv4_addr_output(""), None);
        assert_eq!(parse_ipv4_addr_output("2: eth0 inet6 fe80::1/64 scope link"), None);
    }

    #[tokio::test]
    async fn test_write_secure_config() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("conf").join("server.conf");
        write_secure_config(&path, "port 1194\n", 0o600).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "port 1194\n");
    }

    #[tokio::test]
    async fn test_run_command_failure() {
        let err = run_command("false", &[]).await.unwrap_err();
        assert!(matches!(err, GateError::CommandFailed { code: Some(1), .. }));
        assert!(!run_status("/nonexistent/binary", &[]).await);
        assert!(run_status("true", &[]).await);
    }
}
