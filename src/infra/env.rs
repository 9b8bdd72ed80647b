// ============================================================
// Layer 6 - Environment
// ============================================================
// The only ambient input the pipeline reads: the hub credential
// used for gated or private dataset repos.

/// Variables checked for a hub token, in priority order.
pub const TOKEN_VARS: [&str; 2] = ["HF_TOKEN", "HUGGING_FACE_HUB_TOKEN"];

/// Hub token from the environment. Empty values count as absent.
pub fn hub_token() -> Option<String> {
    token_from(|name| std::env::var(name).ok())
}

fn token_from(lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
    TOKEN_VARS
        .iter()
        .filter_map(|name| lookup(name))
        .map(|v| v.trim().to_string())
        .find(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> =
            vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_primary_variable_wins() {
        let env = lookup(&[("HF_TOKEN", "hf_a"), ("HUGGING_FACE_HUB_TOKEN", "hf_b")]);
        assert_eq!(token_from(env), Some("hf_a".into()));
    }

    #[test]
    fn test_falls_back_to_legacy_variable() {
        let env = lookup(&[("HUGGING_FACE_HUB_TOKEN", "hf_b")]);
        assert_eq!(token_from(env), Some("hf_b".into()));
    }

    #[test]
    fn test_empty_value_is_absent() {
        let env = lookup(&[("HF_TOKEN", "  "), ("HUGGING_FACE_HUB_TOKEN", "hf_b")]);
        assert_eq!(token_from(env), Some("hf_b".into()));
        assert_eq!(token_from(lookup(&[("HF_TOKEN", "")])), None);
    }
}
