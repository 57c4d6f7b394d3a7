//! Pure validation for everything that crosses the SSH boundary: commands,
//! paths, hostnames, ports, usernames, template parameters, and environment
//! maps.
//!
//! The command validator is deliberately conservative: a command passes only
//! if it matches the allow-list *and* trips none of the forbidden patterns.
//! Some patterns over-match on purpose (`ssh ` and `scp ` forbid the literal
//! substrings even inside otherwise-safe text); that behaviour is kept.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use autohealer_core::{HealerError, HealerResult};

/// Maximum accepted command / path length.
const MAX_LEN: usize = 4096;

/// Executables a remote command may start with. A versioned binary such as
/// `php.8` is accepted as a dotted form of its base name.
pub const ALLOWED_COMMANDS: &[&str] = &[
    "ls", "cat", "head", "tail", "grep", "find", "locate", "which", "whereis", "file", "stat",
    "du", "df", "awk", "sed", "sort", "uniq", "wc", "cut", "ps", "top", "htop", "free", "uptime",
    "uname", "whoami", "id", "groups", "wp", "php", "mysql", "mysqldump", "apache2ctl", "nginx",
    "systemctl", "service", "journalctl", "logrotate", "tar", "gzip", "gunzip", "zip", "unzip",
];

static FORBIDDEN_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // Shell metacharacters and substitution.
        r"[;&|`$(){}\[\]]",
        r"\$\(",
        r">\s*\$\{",
        // Pipe to a shell.
        r"\|\s*(sh|bash|zsh|fish)\b",
        // Network tools.
        r"\b(wget|curl|nc|netcat|telnet|rsync)\b",
        r"ssh\s+",
        r"scp\s+",
        // Destructive filesystem operations.
        r"\brm\s+-rf\s+/",
        // Permission / ownership / identity changes.
        r"\bchmod\s+777\b",
        r"\b(chown|usermod|passwd|sudo)\b",
        r"\bsu\s",
        // Process killers.
        r"\bkill\s+-9\b",
        r"\b(killall|pkill)\b",
        // Filesystem plumbing.
        r"\b(mount|umount|fdisk|mkfs)\b",
        // Package installs.
        r"\b(apt|apt-get|yum|dnf|pip|npm|gem)\s+install\b",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("forbidden pattern"))
    .collect()
});

static HOSTNAME_LABEL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9-]{0,61}[a-z0-9])?$").expect("hostname pattern"));

static USERNAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("username pattern"));

static PARAM_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("param-name pattern"));

static PLACEHOLDER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([A-Za-z_][A-Za-z0-9_]*)\}\}").expect("placeholder pattern"));

/// Characters stripped from template parameter and environment values.
const SHELL_META: &[char] = &[
    ';', '&', '|', '`', '$', '(', ')', '{', '}', '[', ']', '<', '>', '\\', '\'', '"', '\n', '\r',
];

/// Validate a remote command. Returns the trimmed command on success.
pub fn validate_command(command: &str) -> HealerResult<String> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Err(HealerError::validation("command", "<empty>"));
    }
    if trimmed.len() > MAX_LEN {
        return Err(HealerError::validation("command", "<too long>"));
    }
    for pattern in FORBIDDEN_PATTERNS.iter() {
        if pattern.is_match(trimmed) {
            return Err(HealerError::validation("command", trimmed));
        }
    }
    let first = trimmed
        .split_whitespace()
        .next()
        .ok_or_else(|| HealerError::validation("command", trimmed))?;
    let allowed = ALLOWED_COMMANDS
        .iter()
        .any(|c| first == *c || first.starts_with(&format!("{c}.")));
    if !allowed {
        return Err(HealerError::validation("command", trimmed));
    }
    Ok(trimmed.to_string())
}

/// Validate a remote filesystem path. Collapses duplicate slashes; rejects
/// traversal and sensitive system locations.
pub fn validate_path(path: &str) -> HealerResult<String> {
    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(HealerError::validation("path", "<empty>"));
    }
    if trimmed.len() > MAX_LEN {
        return Err(HealerError::validation("path", "<too long>"));
    }
    let mut collapsed = String::with_capacity(trimmed.len());
    let mut prev_slash = false;
    for c in trimmed.chars() {
        if c == '/' {
            if !prev_slash {
                collapsed.push(c);
            }
            prev_slash = true;
        } else {
            collapsed.push(c);
            prev_slash = false;
        }
    }
    if collapsed.contains("..") {
        return Err(HealerError::validation("path", &collapsed));
    }
    let forbidden_prefixes = ["/dev", "/proc", "/sys"];
    for prefix in forbidden_prefixes {
        if collapsed == prefix || collapsed.starts_with(&format!("{prefix}/")) {
            return Err(HealerError::validation("path", &collapsed));
        }
    }
    let forbidden_files = ["/etc/passwd", "/etc/shadow", "/etc/sudoers"];
    if forbidden_files.iter().any(|f| collapsed.starts_with(f)) {
        return Err(HealerError::validation("path", &collapsed));
    }
    if collapsed.contains("/.ssh/") || collapsed.ends_with("/.ssh") {
        return Err(HealerError::validation("path", &collapsed));
    }
    Ok(collapsed)
}

/// Validate an RFC-1123 hostname; returns it lowercased.
pub fn validate_hostname(hostname: &str) -> HealerResult<String> {
    let lower = hostname.trim().to_ascii_lowercase();
    if lower.is_empty() || lower.len() > 253 {
        return Err(HealerError::validation("hostname", hostname));
    }
    if !lower.split('.').all(|label| HOSTNAME_LABEL.is_match(label)) {
        return Err(HealerError::validation("hostname", hostname));
    }
    Ok(lower)
}

/// Validate a TCP port: 1..=65535.
pub fn validate_port(port: i64) -> HealerResult<u16> {
    if !(1..=65_535).contains(&port) {
        return Err(HealerError::validation("port", port.to_string()));
    }
    Ok(port as u16)
}

/// Validate a POSIX username: 1..=32 chars, `[a-z_][a-z0-9_-]*`.
pub fn validate_username(username: &str) -> HealerResult<String> {
    let trimmed = username.trim();
    if !USERNAME.is_match(trimmed) {
        return Err(HealerError::validation("username", username));
    }
    Ok(trimmed.to_string())
}

/// Sanitise template parameters: identifier-shaped names, values stripped of
/// shell metacharacters and truncated to 256 chars.
pub fn sanitize_template_parameters(
    params: &HashMap<String, String>,
) -> HealerResult<HashMap<String, String>> {
    sanitize_map(params, 256, "template parameter")
}

/// Like parameters, but for environment maps; values truncated to 1024.
pub fn validate_environment_variables(
    env: &HashMap<String, String>,
) -> HealerResult<HashMap<String, String>> {
    sanitize_map(env, 1024, "environment variable")
}

fn sanitize_map(
    map: &HashMap<String, String>,
    max_value_len: usize,
    field: &str,
) -> HealerResult<HashMap<String, String>> {
    let mut out = HashMap::with_capacity(map.len());
    for (key, value) in map {
        if !PARAM_NAME.is_match(key) {
            return Err(HealerError::validation(field, key));
        }
        let cleaned: String = value.chars().filter(|c| !SHELL_META.contains(c)).collect();
        let truncated: String = cleaned.chars().take(max_value_len).collect();
        out.insert(key.clone(), truncated);
    }
    Ok(out)
}

/// Substitute `{{name}}` placeholders with sanitised parameter values, then
/// validate the whole command. The returned string is safe to execute.
pub fn create_safe_template(
    template: &str,
    params: &HashMap<String, String>,
) -> HealerResult<String> {
    let sanitized = sanitize_template_parameters(params)?;
    let substituted = PLACEHOLDER.replace_all(template, |caps: &regex::Captures<'_>| {
        sanitized
            .get(&caps[1])
            .cloned()
            .unwrap_or_else(|| caps[0].to_string())
    });
    // An unmatched placeholder survives substitution and fails command
    // validation on its braces.
    validate_command(&substituted)
}
