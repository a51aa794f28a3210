use std::collections::HashMap;

use serde::{Deserialize, Deserializer};

/// Claims carried by a verified Lagoon access token.
///
/// Keycloak emits `group_lagoon_project_ids` double-encoded: an array of
/// JSON-encoded one-entry objects. Deserialization flattens it into a single
/// map so callers never see the inner encoding.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LagoonClaims {
    #[serde(default)]
    pub realm_roles: Vec<String>,

    /// Fully-qualified group paths, e.g. `/acme/acme-maintainer`.
    #[serde(default, rename = "group_membership")]
    pub user_groups: Vec<String>,

    #[serde(
        default,
        rename = "group_lagoon_project_ids",
        deserialize_with = "group_project_ids"
    )]
    pub group_project_ids: HashMap<String, Vec<i32>>,

    /// Authorized party: the client ID the token was issued to.
    #[serde(default)]
    pub azp: String,

    #[serde(default)]
    pub sub: String,

    #[serde(default)]
    pub exp: u64,

    #[serde(default)]
    pub iat: u64,
}

fn group_project_ids<'de, D>(deserializer: D) -> Result<HashMap<String, Vec<i32>>, D::Error>
where
    D: Deserializer<'de>,
{
    let encoded: Vec<String> = Vec::deserialize(deserializer)?;
    let mut merged: HashMap<String, Vec<i32>> = HashMap::new();
    for entry in encoded {
        let ids: HashMap<String, Vec<i32>> =
            serde_json::from_str(&entry).map_err(serde::de::Error::custom)?;
        for (group, mut projects) in ids {
            merged.entry(group).or_default().append(&mut projects);
        }
    }
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn double_encoded_project_ids_flatten() {
        let claims: LagoonClaims = serde_json::from_str(
            r#"{"group_lagoon_project_ids": ["{\"g1\":[1]}", "{\"g2\":[2,3]}"]}"#,
        )
        .unwrap();
        assert_eq!(claims.group_project_ids["g1"], vec![1]);
        assert_eq!(claims.group_project_ids["g2"], vec![2, 3]);
    }

    #[test]
    fn duplicate_groups_accumulate() {
        let claims: LagoonClaims = serde_json::from_str(
            r#"{"group_lagoon_project_ids": ["{\"g1\":[1]}", "{\"g1\":[2]}"]}"#,
        )
        .unwrap();
        let mut ids = claims.group_project_ids["g1"].clone();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn full_token_payload_parses() {
        let claims: LagoonClaims = serde_json::from_str(
            r#"{
                "exp": 1700000000,
                "iat": 1699990000,
                "sub": "91435afe-ba81-406b-9308-f80b79fae350",
                "azp": "service-api",
                "realm_roles": ["offline_access", "platform-owner"],
                "group_membership": ["/project-bar/project-bar-maintainer"],
                "group_lagoon_project_ids": ["{\"project-bar\":[4]}"]
            }"#,
        )
        .unwrap();
        assert_eq!(claims.azp, "service-api");
        assert_eq!(claims.realm_roles.len(), 2);
        assert_eq!(claims.user_groups, vec!["/project-bar/project-bar-maintainer"]);
        assert_eq!(claims.group_project_ids["project-bar"], vec![4]);
    }

    #[test]
    fn missing_custom_claims_default_empty() {
        let claims: LagoonClaims = serde_json::from_str(r#"{"sub": "x", "exp": 1}"#).unwrap();
        assert!(claims.realm_roles.is_empty());
        assert!(claims.user_groups.is_empty());
        assert!(claims.group_project_ids.is_empty());
    }

    #[test]
    fn malformed_inner_encoding_is_an_error() {
        let parsed: Result<LagoonClaims, _> =
            serde_json::from_str(r#"{"group_lagoon_project_ids": ["not json"]}"#);
        assert!(parsed.is_err());
    }
}
