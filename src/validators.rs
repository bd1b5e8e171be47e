//! Input validation and sanitization for rewall
//!
//! This module centralizes validation of every user-supplied rule field
//! that ends up on an iptables command line. Nothing here shells out; the
//! goal is to reject or neutralize bad input before the adapter is ever
//! involved.

/// Maximum length accepted by `-m comment --comment`.
const MAX_COMMENT_LEN: usize = 255;

/// Kernel limit for `--log-prefix` (29 characters plus NUL).
const MAX_LOG_PREFIX_LEN: usize = 29;

/// iptables chain names are capped at 28 characters.
const MAX_CHAIN_NAME_LEN: usize = 28;

/// Connection states accepted by `-m state --state`.
const CONN_STATES: &[&str] = &["NEW", "ESTABLISHED", "RELATED", "INVALID", "UNTRACKED"];

/// Rate units accepted by `-m limit --limit`.
const RATE_UNITS: &[&str] = &["second", "minute", "hour", "day"];

/// Sanitizes free text for safe use as an iptables comment.
///
/// Keeps ASCII alphanumerics, space, dash, underscore and dot; caps the
/// result at 255 bytes. ASCII-only filtering avoids multi-byte surprises
/// at the length cap.
pub fn sanitize_comment(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.'))
        .take(MAX_COMMENT_LEN)
        .collect()
}

/// Sanitizes a LOG prefix.
///
/// Same charset as comments plus square brackets (conventional in syslog
/// prefixes), capped at the kernel's 29-character limit.
pub fn sanitize_log_prefix(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | '[' | ']'))
        .take(MAX_LOG_PREFIX_LEN)
        .collect()
}

fn validate_single_port(part: &str) -> Result<u16, String> {
    let port: u16 = part
        .parse()
        .map_err(|_| format!("invalid port '{part}' (expected 1-65535)"))?;
    if port == 0 {
        return Err("port 0 is reserved".to_string());
    }
    Ok(port)
}

fn validate_port_or_range(part: &str) -> Result<(), String> {
    if let Some((start, end)) = part.split_once(':') {
        let start = validate_single_port(start)?;
        let end = validate_single_port(end)?;
        if start > end {
            return Err(format!("port range {start}:{end} is inverted"));
        }
        Ok(())
    } else {
        validate_single_port(part).map(|_| ())
    }
}

/// Validates a destination-port specification.
///
/// Accepted forms: a single port (`"80"`), a range (`"80:443"`), or a
/// comma-separated list of either (`"80,443,8000:8100"`, applied with
/// multiport). iptables multiport takes at most 15 ports.
///
/// # Errors
///
/// Returns `Err` with a human-readable message on any malformed element.
pub fn validate_port_spec(spec: &str) -> Result<(), String> {
    if spec.is_empty() {
        return Err("port specification is empty".to_string());
    }

    let parts: Vec<&str> = spec.split(',').collect();
    if parts.len() > 15 {
        return Err("too many ports (multiport accepts at most 15)".to_string());
    }

    // No trimming: the spec reaches the command line verbatim
    for part in parts {
        validate_port_or_range(part)?;
    }
    Ok(())
}

/// Validates a rate-limit specification (`"10/second"`, `"100/minute"`).
///
/// # Errors
///
/// Returns `Err` if the count is not a positive integer or the unit is
/// not one of second/minute/hour/day.
pub fn validate_rate_spec(spec: &str) -> Result<(), String> {
    let (count, unit) = spec
        .split_once('/')
        .ok_or_else(|| format!("invalid rate '{spec}' (expected e.g. '10/second')"))?;

    let count: u32 = count
        .parse()
        .map_err(|_| format!("invalid rate count '{count}'"))?;
    if count == 0 {
        return Err("rate count must be at least 1".to_string());
    }

    if !RATE_UNITS.contains(&unit) {
        return Err(format!(
            "invalid rate unit '{unit}' (expected one of: {})",
            RATE_UNITS.join(", ")
        ));
    }
    Ok(())
}

/// Validates a network interface name against kernel constraints:
/// max 15 characters (IFNAMSIZ - 1), ASCII alphanumeric plus dot, dash,
/// underscore, and not "." or "..".
///
/// # Errors
///
/// Returns `Err` if the name violates any constraint.
pub fn validate_interface(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("interface name is empty".to_string());
    }

    if name.len() > 15 {
        return Err("interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("invalid interface name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("interface name contains invalid characters".to_string());
    }

    Ok(())
}

/// Validates a connection-state set (`"NEW,ESTABLISHED"`).
///
/// The string is passed to the tool verbatim, so elements must be exact
/// tokens with no surrounding whitespace.
///
/// # Errors
///
/// Returns `Err` if any element is not a known conntrack state.
pub fn validate_state_set(spec: &str) -> Result<(), String> {
    if spec.is_empty() {
        return Err("state set is empty".to_string());
    }

    for state in spec.split(',') {
        if !CONN_STATES.contains(&state) {
            return Err(format!(
                "unknown connection state '{state}' (expected one of: {})",
                CONN_STATES.join(", ")
            ));
        }
    }
    Ok(())
}

/// Validates an extension chain name.
///
/// Constraints: 1-28 characters (the iptables chain name limit), ASCII
/// alphanumeric plus dash and underscore, not a built-in chain name, and
/// not inside the engine's `REWALL_` namespace.
///
/// # Errors
///
/// Returns `Err` if the name violates any constraint.
pub fn validate_chain_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("chain name is empty".to_string());
    }

    if name.len() > MAX_CHAIN_NAME_LEN {
        return Err(format!(
            "chain name too long (max {MAX_CHAIN_NAME_LEN} characters)"
        ));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return Err("chain name contains invalid characters (use a-z, 0-9, -, _)".to_string());
    }

    const BUILTINS: &[&str] = &["INPUT", "OUTPUT", "FORWARD", "PREROUTING", "POSTROUTING"];
    if BUILTINS.contains(&name) {
        return Err(format!("'{name}' is a built-in chain"));
    }

    if name.starts_with("REWALL_") {
        return Err("the REWALL_ prefix is reserved for engine-owned chains".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_comment_passthrough() {
        assert_eq!(sanitize_comment("Allow SSH from office"), "Allow SSH from office");
    }

    #[test]
    fn test_sanitize_comment_strips_shell_metachars() {
        let out = sanitize_comment("x; rm -rf /\"quoted\"\nnewline");
        assert!(!out.contains(';'));
        assert!(!out.contains('"'));
        assert!(!out.contains('\n'));
        assert!(!out.contains('/'));
    }

    #[test]
    fn test_sanitize_comment_caps_length() {
        let long = "a".repeat(400);
        assert_eq!(sanitize_comment(&long).len(), 255);
    }

    #[test]
    fn test_sanitize_log_prefix_keeps_brackets_caps_at_29() {
        let out = sanitize_log_prefix("[FW-DROP] something very long indeed here");
        assert!(out.starts_with("[FW-DROP]"));
        assert!(out.len() <= 29);
    }

    #[test]
    fn test_port_spec_single() {
        assert!(validate_port_spec("22").is_ok());
        assert!(validate_port_spec("65535").is_ok());
        assert!(validate_port_spec("0").is_err());
        assert!(validate_port_spec("65536").is_err());
        assert!(validate_port_spec("ssh").is_err());
    }

    #[test]
    fn test_port_spec_range() {
        assert!(validate_port_spec("80:443").is_ok());
        assert!(validate_port_spec("443:80").is_err());
        assert!(validate_port_spec("80:").is_err());
    }

    #[test]
    fn test_port_spec_list() {
        assert!(validate_port_spec("80,443,8000:8100").is_ok());
        assert!(validate_port_spec("80,,443").is_err());
        let many: Vec<String> = (1..=16).map(|p| p.to_string()).collect();
        assert!(validate_port_spec(&many.join(",")).is_err());
    }

    #[test]
    fn test_rate_spec() {
        assert!(validate_rate_spec("10/second").is_ok());
        assert!(validate_rate_spec("100/minute").is_ok());
        assert!(validate_rate_spec("1/day").is_ok());
        assert!(validate_rate_spec("0/second").is_err());
        assert!(validate_rate_spec("10/fortnight").is_err());
        assert!(validate_rate_spec("10").is_err());
    }

    #[test]
    fn test_interface_rules() {
        assert!(validate_interface("eth0").is_ok());
        assert!(validate_interface("br-lan.10").is_ok());
        assert!(validate_interface("").is_err());
        assert!(validate_interface("waytoolonginterface").is_err());
        assert!(validate_interface("eth0;ls").is_err());
        assert!(validate_interface("..").is_err());
    }

    #[test]
    fn test_state_set() {
        assert!(validate_state_set("NEW").is_ok());
        assert!(validate_state_set("NEW,ESTABLISHED").is_ok());
        // Whitespace would end up verbatim on the command line
        assert!(validate_state_set("NEW, ESTABLISHED").is_err());
        assert!(validate_state_set("OPEN").is_err());
        assert!(validate_state_set("").is_err());
    }

    #[test]
    fn test_chain_name_rules() {
        assert!(validate_chain_name("EXT_WG_FWD").is_ok());
        assert!(validate_chain_name("INPUT").is_err());
        assert!(validate_chain_name("REWALL_INPUT").is_err());
        assert!(validate_chain_name("has space").is_err());
        assert!(validate_chain_name(&"X".repeat(29)).is_err());
        assert!(validate_chain_name("").is_err());
    }
}
