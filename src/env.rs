/// Interpret a string value such as "1" or "no" as a boolean.
///
/// Empty strings are false. Unrecognized values are logged and treated as
/// false.
pub fn str_as_bool(s: &str) -> bool {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "t" | "yes" | "y" | "on" => true,
        "" | "0" | "false" | "f" | "no" | "n" | "off" => false,
        other => {
            log::warn!("Unrecognized boolean value \"{}\"", other);
            false
        }
    }
}

/// Return whether a feature flag controlled by an environment variable is
/// enabled.
pub fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .as_ref()
        .map(|s| str_as_bool(s))
        .unwrap_or(default)
}
