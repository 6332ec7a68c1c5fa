//! Static credential resolution in fixed priority order.

use crate::cloud::config::AuthSettings;
use std::fmt;

/// Where a static credential came from, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    StaticToken,
    PersonalAccessToken,
    Jwt,
}

impl CredentialSource {
    pub const PRIORITY: [CredentialSource; 3] = [
        CredentialSource::StaticToken,
        CredentialSource::PersonalAccessToken,
        CredentialSource::Jwt,
    ];

    fn lookup(self, settings: &AuthSettings) -> Option<&str> {
        match self {
            CredentialSource::StaticToken => settings.token.as_deref(),
            CredentialSource::PersonalAccessToken => settings.pat.as_deref(),
            CredentialSource::Jwt => settings.jwt.as_deref(),
        }
    }
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::StaticToken => write!(f, "api token"),
            CredentialSource::PersonalAccessToken => write!(f, "personal access token"),
            CredentialSource::Jwt => write!(f, "jwt"),
        }
    }
}

/// Outcome of static resolution. `NotConfigured` is the signal to fall back
/// to the stored session, it is not an error.
#[derive(Clone, PartialEq, Eq)]
pub enum StaticCredential {
    NotConfigured,
    Found {
        source: CredentialSource,
        token: String,
    },
}

impl fmt::Debug for StaticCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaticCredential::NotConfigured => write!(f, "NotConfigured"),
            StaticCredential::Found { source, .. } => f
                .debug_struct("Found")
                .field("source", source)
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

/// First non-empty credential among token, PAT and JWT.
pub fn resolve_static_token(settings: &AuthSettings) -> StaticCredential {
    CredentialSource::PRIORITY
        .into_iter()
        .find_map(|source| {
            source
                .lookup(settings)
                .map(str::trim)
                .filter(|token| !token.is_empty())
                .map(|token| StaticCredential::Found {
                    source,
                    token: token.to_string(),
                })
        })
        .unwrap_or(StaticCredential::NotConfigured)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(token: Option<&str>, pat: Option<&str>, jwt: Option<&str>) -> AuthSettings {
        AuthSettings {
            token: token.map(String::from),
            pat: pat.map(String::from),
            jwt: jwt.map(String::from),
        }
    }

    #[test]
    fn test_priority_over_all_combinations() {
        let values = [None, Some(""), Some("  "), Some("value")];
        for token in values {
            for pat in values {
                for jwt in values {
                    let present = |v: Option<&str>| v.is_some_and(|s| !s.trim().is_empty());
                    let expected = if present(token) {
                        Some(CredentialSource::StaticToken)
                    } else if present(pat) {
                        Some(CredentialSource::PersonalAccessToken)
                    } else if present(jwt) {
                        Some(CredentialSource::Jwt)
                    } else {
                        None
                    };

                    let resolved = resolve_static_token(&settings(token, pat, jwt));
                    match (expected, resolved) {
                        (None, StaticCredential::NotConfigured) => {}
                        (Some(want), StaticCredential::Found { source, token }) => {
                            assert_eq!(source, want);
                            assert_eq!(token, "value");
                        }
                        (want, got) => panic!("expected {:?}, got {:?}", want, got),
                    }
                }
            }
        }
    }

    #[test]
    fn test_distinct_values_pick_highest() {
        let resolved = resolve_static_token(&settings(None, Some("pat_1"), Some("jwt_1")));
        assert_eq!(
            resolved,
            StaticCredential::Found {
                source: CredentialSource::PersonalAccessToken,
                token: "pat_1".into()
            }
        );
    }

    #[test]
    fn test_debug_redacts_token() {
        let resolved = resolve_static_token(&settings(Some("tok_secret"), None, None));
        assert!(!format!("{:?}", resolved).contains("tok_secret"));
    }
}
