//! Local identity source: the OS user the agent runs as.

/// Resolve the identity used against the catalog and in outcome events.
/// A configured override wins over the environment.
pub fn resolve(configured: Option<&str>) -> Option<String> {
    if let Some(id) = configured.map(normalize).filter(|s| !s.is_empty()) {
        return Some(id);
    }
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .map(|raw| normalize(&raw))
        .find(|s| !s.is_empty())
}

/// `DOMAIN\user` becomes `user`; surrounding whitespace is dropped.
pub fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    trimmed
        .rsplit_once('\\')
        .map(|(_, user)| user)
        .unwrap_or(trimmed)
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_windows_domain() {
        assert_eq!(normalize("CORP\\luis.salazar"), "luis.salazar");
        assert_eq!(normalize("  ana@example.com "), "ana@example.com");
    }

    #[test]
    fn configured_identity_wins() {
        assert_eq!(resolve(Some("CORP\\ops")), Some("ops".to_string()));
    }
}
