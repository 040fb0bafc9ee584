//! Environment lookups shared by logging and configuration

/// Value of `key`, or `None` if unset or not valid unicode
#[inline]
pub fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Boolean switch. `None` if unset; otherwise "1", "true", "yes" and "on"
/// (any case) are true and every other value is false.
#[inline]
pub fn env_flag(key: &str) -> Option<bool> {
    env_var(key).map(|val| matches!(val.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_unset() {
        assert_eq!(env_var("__SOCKSERVE_UNSET_VAR__"), None);
        assert!(env_var("PATH").is_some());
    }

    #[test]
    fn test_env_flag_variants() {
        std::env::set_var("__SOCKSERVE_FLAG__", "Yes");
        assert_eq!(env_flag("__SOCKSERVE_FLAG__"), Some(true));

        std::env::set_var("__SOCKSERVE_FLAG__", " on ");
        assert_eq!(env_flag("__SOCKSERVE_FLAG__"), Some(true));

        std::env::set_var("__SOCKSERVE_FLAG__", "off");
        assert_eq!(env_flag("__SOCKSERVE_FLAG__"), Some(false));

        std::env::remove_var("__SOCKSERVE_FLAG__");
        assert_eq!(env_flag("__SOCKSERVE_FLAG__"), None);
    }
}
