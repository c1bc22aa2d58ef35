//! Client identity profiles and the pool they are drawn from.
//!
//! A profile is a user agent plus the headers a real browser with that user
//! agent would send alongside it. Selection is stateless: every call draws
//! uniformly from a fixed, operator-supplied list.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConfigError;

/// Accept-Language used when a profile does not specify one.
pub const DEFAULT_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.9";

/// Real browser fingerprints: (user agent, accept-language, client-hint brand, platform).
/// Chromium-based browsers send `sec-ch-ua*` client hints; Firefox and Safari do not.
const BROWSER_PROFILES: &[(&str, &str, Option<&str>, &str)] = &[
    (
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
        "en-US,en;q=0.9",
        Some(r#""Google Chrome";v="131", "Chromium";v="131", "Not_A Brand";v="24""#),
        r#""Windows""#,
    ),
    (
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
        "en-GB,en;q=0.9",
        Some(r#""Google Chrome";v="130", "Chromium";v="130", "Not?A_Brand";v="99""#),
        r#""Windows""#,
    ),
    (
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
        "en-US,en;q=0.9",
        Some(r#""Google Chrome";v="131", "Chromium";v="131", "Not_A Brand";v="24""#),
        r#""macOS""#,
    ),
    (
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
        "en-US,en;q=0.5",
        None,
        "",
    ),
    (
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:132.0) Gecko/20100101 Firefox/132.0",
        "en-US,en;q=0.5",
        None,
        "",
    ),
    (
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Safari/605.1.15",
        "en-US,en;q=0.9",
        None,
        "",
    ),
    (
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0",
        "en-US,en;q=0.9",
        Some(r#""Microsoft Edge";v="131", "Chromium";v="131", "Not_A Brand";v="24""#),
        r#""Windows""#,
    ),
];

/// One client identity: user agent plus correlated headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityProfile {
    pub user_agent: String,
    #[serde(default = "default_accept_language")]
    pub accept_language: String,
    /// Extra headers (client hints) that belong with this user agent.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub client_hint_headers: BTreeMap<String, String>,
}

fn default_accept_language() -> String {
    DEFAULT_ACCEPT_LANGUAGE.to_string()
}

impl IdentityProfile {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
            accept_language: default_accept_language(),
            client_hint_headers: BTreeMap::new(),
        }
    }

    /// All headers this identity attaches to a request.
    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers = Vec::with_capacity(2 + self.client_hint_headers.len());
        headers.push(("user-agent".to_string(), self.user_agent.clone()));
        headers.push(("accept-language".to_string(), self.accept_language.clone()));
        headers.extend(
            self.client_hint_headers
                .iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v.clone())),
        );
        headers
    }
}

/// Fixed set of identities with uniform random selection.
#[derive(Debug)]
pub struct IdentityPool {
    profiles: Vec<Arc<IdentityProfile>>,
}

impl IdentityPool {
    /// Build a pool from operator-supplied profiles.
    ///
    /// # Errors
    /// Returns `ConfigError::EmptyIdentityPool` if `profiles` is empty.
    pub fn new(profiles: Vec<IdentityProfile>) -> Result<Self, ConfigError> {
        if profiles.is_empty() {
            return Err(ConfigError::EmptyIdentityPool);
        }
        debug!("Identity pool initialized with {} profile(s)", profiles.len());
        Ok(Self {
            profiles: profiles.into_iter().map(Arc::new).collect(),
        })
    }

    /// Pool of built-in desktop browser profiles.
    pub fn builtin() -> Self {
        Self {
            profiles: builtin_profiles().into_iter().map(Arc::new).collect(),
        }
    }

    /// Load profiles from a JSON array file.
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        Self::new(load_profiles(path)?)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    pub fn profiles(&self) -> impl Iterator<Item = &IdentityProfile> {
        self.profiles.iter().map(|p| p.as_ref())
    }

    /// Uniform random choice from the pool.
    pub fn pick(&self) -> Arc<IdentityProfile> {
        let idx = rand::rng().random_range(0..self.profiles.len());
        self.profiles[idx].clone()
    }

    /// Uniform random choice among profiles other than `previous`.
    ///
    /// With a single-profile pool the only profile is returned.
    pub fn pick_other(&self, previous: &Arc<IdentityProfile>) -> Arc<IdentityProfile> {
        let Some(prev_idx) = self.profiles.iter().position(|p| Arc::ptr_eq(p, previous)) else {
            return self.pick();
        };
        if self.profiles.len() == 1 {
            return self.profiles[0].clone();
        }

        let mut idx = rand::rng().random_range(0..self.profiles.len() - 1);
        if idx >= prev_idx {
            idx += 1;
        }
        self.profiles[idx].clone()
    }
}

/// The built-in profile list, for display and as the default pool.
pub fn builtin_profiles() -> Vec<IdentityProfile> {
    BROWSER_PROFILES
        .iter()
        .map(|(ua, lang, brand, platform)| {
            let mut hints = BTreeMap::new();
            if let Some(brand) = brand {
                hints.insert("sec-ch-ua".to_string(), brand.to_string());
                hints.insert("sec-ch-ua-mobile".to_string(), "?0".to_string());
                hints.insert("sec-ch-ua-platform".to_string(), platform.to_string());
            }
            IdentityProfile {
                user_agent: ua.to_string(),
                accept_language: lang.to_string(),
                client_hint_headers: hints,
            }
        })
        .collect()
}

/// Read a JSON array of identity profiles.
pub fn load_profiles(path: &Path) -> Result<Vec<IdentityProfile>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn pool_of(n: usize) -> IdentityPool {
        IdentityPool::new(
            (0..n)
                .map(|i| IdentityProfile::new(format!("Agent/{}", i)))
                .collect(),
        )
        .unwrap()
    }

    #[test]
    fn empty_pool_is_rejected() {
        let err = IdentityPool::new(Vec::new()).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyIdentityPool));
    }

    #[test]
    fn pick_returns_pool_member() {
        let pool = pool_of(3);
        for _ in 0..50 {
            let picked = pool.pick();
            assert!(pool.profiles().any(|p| p == picked.as_ref()));
        }
    }

    #[test]
    fn pick_other_never_repeats_with_multiple_profiles() {
        let pool = pool_of(2);
        let mut current = pool.pick();
        for _ in 0..100 {
            let next = pool.pick_other(&current);
            assert_ne!(next.user_agent, current.user_agent);
            current = next;
        }
    }

    #[test]
    fn pick_other_with_single_profile_returns_it() {
        let pool = pool_of(1);
        let first = pool.pick();
        let next = pool.pick_other(&first);
        assert!(Arc::ptr_eq(&first, &next));
    }

    #[test]
    fn pick_distributes_across_pool() {
        let pool = pool_of(4);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            seen.insert(pool.pick().user_agent.clone());
        }
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn builtin_chromium_profiles_carry_client_hints() {
        let pool = IdentityPool::builtin();
        assert!(pool.len() > 1);
        for profile in pool.profiles() {
            let chromium = profile.user_agent.contains("Chrome/");
            assert_eq!(
                profile.client_hint_headers.contains_key("sec-ch-ua"),
                chromium,
                "client hints mismatch for {}",
                profile.user_agent
            );
        }
    }

    #[test]
    fn headers_include_user_agent_and_language() {
        let mut profile = IdentityProfile::new("Agent/1");
        profile
            .client_hint_headers
            .insert("Sec-CH-UA-Mobile".into(), "?0".into());
        let headers = profile.headers();
        assert_eq!(headers[0], ("user-agent".into(), "Agent/1".into()));
        assert_eq!(
            headers[1],
            ("accept-language".into(), DEFAULT_ACCEPT_LANGUAGE.into())
        );
        assert!(headers.contains(&("sec-ch-ua-mobile".into(), "?0".into())));
    }

    #[test]
    fn load_profiles_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[{{"user_agent": "A/1"}}, {{"user_agent": "B/2", "accept_language": "de-DE"}}]"#
        )
        .unwrap();

        let pool = IdentityPool::from_json_file(file.path()).unwrap();
        assert_eq!(pool.len(), 2);
        let langs: Vec<_> = pool.profiles().map(|p| p.accept_language.clone()).collect();
        assert!(langs.contains(&DEFAULT_ACCEPT_LANGUAGE.to_string()));
        assert!(langs.contains(&"de-DE".to_string()));
    }

    #[test]
    fn empty_json_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[]").unwrap();
        let err = IdentityPool::from_json_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyIdentityPool));
    }
}
