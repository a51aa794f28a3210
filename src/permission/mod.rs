use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use async_trait::async_trait;
use uuid::Uuid;

use crate::keycloak::Group;
use crate::lagoondb::EnvironmentType;

/// Ordinal user role inside a group. Ordering matters: when a user appears
/// in the same group under several roles, the highest wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UserRole {
    Invalid,
    Guest,
    Reporter,
    Developer,
    Maintainer,
    Owner,
}

impl FromStr for UserRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "guest" => Ok(Self::Guest),
            "reporter" => Ok(Self::Reporter),
            "developer" => Ok(Self::Developer),
            "maintainer" => Ok(Self::Maintainer),
            "owner" => Ok(Self::Owner),
            other => anyhow::bail!("unknown user role: {other}"),
        }
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Invalid => "invalid",
            Self::Guest => "guest",
            Self::Reporter => "reporter",
            Self::Developer => "developer",
            Self::Maintainer => "maintainer",
            Self::Owner => "owner",
        })
    }
}

/// Roles permitted to open SSH sessions against an environment type.
pub fn ssh_roles(typ: EnvironmentType, block_developer_ssh: bool) -> &'static [UserRole] {
    match (typ, block_developer_ssh) {
        (EnvironmentType::Development, false) => {
            &[UserRole::Developer, UserRole::Maintainer, UserRole::Owner]
        }
        (EnvironmentType::Development, true) | (EnvironmentType::Production, _) => {
            &[UserRole::Maintainer, UserRole::Owner]
        }
    }
}

/// The identity-provider capabilities the policy engine consumes. The
/// production implementation is `keycloak::Client`; tests substitute
/// in-memory fakes.
#[async_trait]
pub trait KeycloakService: Send + Sync {
    /// Verified realm roles and group paths of a user.
    async fn user_roles_and_groups(
        &self,
        user_uuid: &Uuid,
    ) -> anyhow::Result<(Vec<String>, Vec<String>)>;

    /// All top-level groups, by name.
    async fn top_level_group_name_id_map(&self) -> anyhow::Result<HashMap<String, Uuid>>;

    /// A direct child of `parent_id` by name, if any.
    async fn child_group_id(&self, parent_id: Uuid, name: &str) -> anyhow::Result<Option<Uuid>>;

    /// Full representation of a single group.
    async fn group_by_id(&self, id: Uuid) -> anyhow::Result<Group>;

    /// Expand a set of group IDs with every ancestor. The result is sorted,
    /// deduplicated, and contains the input set. The visited set doubles as
    /// loop protection against malformed parent chains.
    async fn ancestor_groups(&self, group_ids: Vec<Uuid>) -> anyhow::Result<Vec<Uuid>> {
        let mut seen: BTreeSet<Uuid> = group_ids.iter().copied().collect();
        let mut pending = group_ids;
        while let Some(id) = pending.pop() {
            let group = self.group_by_id(id).await?;
            if let Some(parent) = group.parent_id {
                if seen.insert(parent) {
                    pending.push(parent);
                }
            }
        }
        Ok(seen.into_iter().collect())
    }
}

#[async_trait]
impl KeycloakService for crate::keycloak::Client {
    async fn user_roles_and_groups(
        &self,
        user_uuid: &Uuid,
    ) -> anyhow::Result<(Vec<String>, Vec<String>)> {
        Ok(crate::keycloak::Client::user_roles_and_groups(self, user_uuid).await?)
    }

    async fn top_level_group_name_id_map(&self) -> anyhow::Result<HashMap<String, Uuid>> {
        Ok(crate::keycloak::Client::top_level_group_name_id_map(self).await?)
    }

    async fn child_group_id(&self, parent_id: Uuid, name: &str) -> anyhow::Result<Option<Uuid>> {
        Ok(crate::keycloak::Client::child_group_id(self, parent_id, name).await?)
    }

    async fn group_by_id(&self, id: Uuid) -> anyhow::Result<Group> {
        Ok(crate::keycloak::Client::group_by_id(self, id).await?)
    }
}

/// The project→group bindings the policy engine consumes from the Lagoon
/// API database.
#[async_trait]
pub trait ProjectGroups: Send + Sync {
    async fn project_group_ids(&self, project_id: i32) -> anyhow::Result<Vec<Uuid>>;
}

#[async_trait]
impl ProjectGroups for crate::lagoondb::Client {
    async fn project_group_ids(&self, project_id: i32) -> anyhow::Result<Vec<Uuid>> {
        Ok(crate::lagoondb::Client::project_group_ids(self, project_id).await?)
    }
}

/// The SSH authorization policy engine.
pub struct Permission<K, D> {
    keycloak: K,
    db: D,
    block_developer_ssh: bool,
}

impl<K: KeycloakService, D: ProjectGroups> Permission<K, D> {
    pub fn new(keycloak: K, db: D, block_developer_ssh: bool) -> Self {
        Self {
            keycloak,
            db,
            block_developer_ssh,
        }
    }

    /// Decide whether a user may open an SSH session to any environment of
    /// `typ` within the given project.
    #[tracing::instrument(skip(self), fields(%user_uuid, project_id, %typ))]
    pub async fn can_ssh_to_environment(
        &self,
        user_uuid: &Uuid,
        project_id: i32,
        typ: EnvironmentType,
    ) -> anyhow::Result<bool> {
        let (realm_roles, group_paths) = self.keycloak.user_roles_and_groups(user_uuid).await?;

        if realm_roles.iter().any(|r| r == "platform-owner") {
            tracing::info!("granting via platform-owner realm role");
            return Ok(true);
        }

        let user_group_roles = self.user_group_roles(&group_paths).await?;
        if user_group_roles.is_empty() {
            return Ok(false);
        }

        let project_groups = self.db.project_group_ids(project_id).await?;
        let candidate_groups = self.keycloak.ancestor_groups(project_groups).await?;

        let permitted = ssh_roles(typ, self.block_developer_ssh);
        let granted = candidate_groups.iter().any(|gid| {
            user_group_roles
                .get(gid)
                .is_some_and(|role| permitted.contains(role))
        });
        tracing::info!(granted, "SSH permission decision");
        Ok(granted)
    }

    /// Resolve each user-group path to `(group ID, role)`, keeping the
    /// highest role when a group appears more than once. Malformed paths
    /// are logged and skipped; identity-provider errors propagate.
    async fn user_group_roles(
        &self,
        group_paths: &[String],
    ) -> anyhow::Result<HashMap<Uuid, UserRole>> {
        let mut roles: HashMap<Uuid, UserRole> = HashMap::new();
        for path in group_paths {
            if let Some((group_id, role)) = self.user_group_id_role(path).await? {
                roles
                    .entry(group_id)
                    .and_modify(|existing| *existing = (*existing).max(role))
                    .or_insert(role);
            }
        }
        Ok(roles)
    }

    /// Resolve a single group path such as `/acme/websites/acme-maintainer`
    /// to the ID of the user's group (the second-to-last segment) and the
    /// role encoded by the leaf role-subgroup.
    async fn user_group_id_role(&self, path: &str) -> anyhow::Result<Option<(Uuid, UserRole)>> {
        let segments: Vec<&str> = path.split('/').collect();
        if segments.len() < 3 || !segments[0].is_empty() {
            tracing::warn!(path, "malformed group path");
            return Ok(None);
        }

        let parent = segments[segments.len() - 2];
        let leaf = segments[segments.len() - 1];
        let Some(role_suffix) = leaf.strip_prefix(parent).and_then(|s| s.strip_prefix('-')) else {
            tracing::warn!(path, "group path leaf does not extend its parent");
            return Ok(None);
        };

        // Walk from the top-level group down to the parent group by name.
        let top_level = self.keycloak.top_level_group_name_id_map().await?;
        let Some(mut group_id) = top_level.get(segments[1]).copied() else {
            tracing::warn!(path, name = segments[1], "unknown top-level group");
            return Ok(None);
        };
        for name in &segments[2..segments.len() - 1] {
            match self.keycloak.child_group_id(group_id, name).await? {
                Some(id) => group_id = id,
                None => {
                    tracing::warn!(path, name, "group path segment does not resolve");
                    return Ok(None);
                }
            }
        }

        // The leaf must be a role-subgroup of the parent carrying the role.
        let Some(leaf_id) = self.keycloak.child_group_id(group_id, leaf).await? else {
            tracing::warn!(path, leaf, "role subgroup does not resolve");
            return Ok(None);
        };
        let leaf_group = self.keycloak.group_by_id(leaf_id).await?;
        if leaf_group.attributes.get("type").map(Vec::as_slice)
            != Some(&["role-subgroup".to_string()][..])
        {
            tracing::warn!(path, leaf, "leaf group is not a role-subgroup");
            return Ok(None);
        }
        if !leaf_group.realm_roles.iter().any(|r| r == role_suffix) {
            tracing::warn!(path, leaf, role_suffix, "role subgroup lacks the role");
            return Ok(None);
        }

        match role_suffix.parse::<UserRole>() {
            Ok(role) => Ok(Some((group_id, role))),
            Err(err) => {
                tracing::warn!(path, error = %err, "unparseable role suffix");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A single-group identity provider: one top-level group with one
    /// role-subgroup child.
    struct OneGroup {
        group_id: Uuid,
        leaf_id: Uuid,
        leaf_name: String,
        leaf_type: Vec<String>,
        leaf_roles: Vec<String>,
    }

    #[async_trait]
    impl KeycloakService for OneGroup {
        async fn user_roles_and_groups(
            &self,
            _user_uuid: &Uuid,
        ) -> anyhow::Result<(Vec<String>, Vec<String>)> {
            Ok((vec![], vec![]))
        }

        async fn top_level_group_name_id_map(&self) -> anyhow::Result<HashMap<String, Uuid>> {
            Ok(HashMap::from([("acme".to_string(), self.group_id)]))
        }

        async fn child_group_id(
            &self,
            parent_id: Uuid,
            name: &str,
        ) -> anyhow::Result<Option<Uuid>> {
            Ok((parent_id == self.group_id && name == self.leaf_name).then_some(self.leaf_id))
        }

        async fn group_by_id(&self, id: Uuid) -> anyhow::Result<Group> {
            anyhow::ensure!(id == self.leaf_id, "unexpected group lookup: {id}");
            Ok(Group {
                id,
                name: self.leaf_name.clone(),
                parent_id: Some(self.group_id),
                attributes: HashMap::from([("type".to_string(), self.leaf_type.clone())]),
                realm_roles: self.leaf_roles.clone(),
            })
        }
    }

    struct NoGroups;

    #[async_trait]
    impl ProjectGroups for NoGroups {
        async fn project_group_ids(&self, _project_id: i32) -> anyhow::Result<Vec<Uuid>> {
            Ok(vec![])
        }
    }

    fn engine(keycloak: OneGroup) -> Permission<OneGroup, NoGroups> {
        Permission::new(keycloak, NoGroups, false)
    }

    fn acme_maintainer() -> OneGroup {
        OneGroup {
            group_id: Uuid::from_u128(1),
            leaf_id: Uuid::from_u128(2),
            leaf_name: "acme-maintainer".into(),
            leaf_type: vec!["role-subgroup".into()],
            leaf_roles: vec!["maintainer".into()],
        }
    }

    #[tokio::test]
    async fn group_path_resolves_to_parent_group_and_role() {
        let permission = engine(acme_maintainer());
        let resolved = permission
            .user_group_id_role("/acme/acme-maintainer")
            .await
            .unwrap();
        assert_eq!(resolved, Some((Uuid::from_u128(1), UserRole::Maintainer)));
    }

    #[tokio::test]
    async fn group_path_without_leading_slash_is_skipped() {
        let permission = engine(acme_maintainer());
        let resolved = permission
            .user_group_id_role("acme/acme-maintainer")
            .await
            .unwrap();
        assert_eq!(resolved, None);
    }

    #[tokio::test]
    async fn group_path_leaf_must_extend_parent() {
        let permission = engine(acme_maintainer());
        let resolved = permission
            .user_group_id_role("/acme/other-maintainer")
            .await
            .unwrap();
        assert_eq!(resolved, None);
    }

    #[tokio::test]
    async fn leaf_must_be_a_role_subgroup() {
        let mut keycloak = acme_maintainer();
        keycloak.leaf_type = vec!["project-default-group".into()];
        let resolved = engine(keycloak)
            .user_group_id_role("/acme/acme-maintainer")
            .await
            .unwrap();
        assert_eq!(resolved, None);
    }

    #[tokio::test]
    async fn leaf_must_carry_the_role_as_realm_role() {
        let mut keycloak = acme_maintainer();
        keycloak.leaf_roles = vec!["developer".into()];
        let resolved = engine(keycloak)
            .user_group_id_role("/acme/acme-maintainer")
            .await
            .unwrap();
        assert_eq!(resolved, None);
    }

    #[tokio::test]
    async fn unknown_role_suffix_is_skipped() {
        let mut keycloak = acme_maintainer();
        keycloak.leaf_name = "acme-admin".into();
        keycloak.leaf_roles = vec!["admin".into()];
        let resolved = engine(keycloak)
            .user_group_id_role("/acme/acme-admin")
            .await
            .unwrap();
        assert_eq!(resolved, None);
    }

    #[tokio::test]
    async fn unknown_top_level_group_is_skipped() {
        let permission = engine(acme_maintainer());
        let resolved = permission
            .user_group_id_role("/globex/globex-maintainer")
            .await
            .unwrap();
        assert_eq!(resolved, None);
    }

    #[test]
    fn role_ordering_is_ordinal() {
        assert!(UserRole::Invalid < UserRole::Guest);
        assert!(UserRole::Guest < UserRole::Reporter);
        assert!(UserRole::Reporter < UserRole::Developer);
        assert!(UserRole::Developer < UserRole::Maintainer);
        assert!(UserRole::Maintainer < UserRole::Owner);
    }

    #[test]
    fn role_parses_known_names_only() {
        assert_eq!("maintainer".parse::<UserRole>().unwrap(), UserRole::Maintainer);
        assert!("invalid".parse::<UserRole>().is_err());
        assert!("platform-owner".parse::<UserRole>().is_err());
        assert!("".parse::<UserRole>().is_err());
    }

    #[test]
    fn ssh_roles_development_default_includes_developer() {
        let roles = ssh_roles(EnvironmentType::Development, false);
        assert!(roles.contains(&UserRole::Developer));
        assert!(roles.contains(&UserRole::Maintainer));
        assert!(roles.contains(&UserRole::Owner));
    }

    #[test]
    fn ssh_roles_development_blocked_excludes_developer() {
        let roles = ssh_roles(EnvironmentType::Development, true);
        assert!(!roles.contains(&UserRole::Developer));
        assert!(roles.contains(&UserRole::Maintainer));
    }

    #[test]
    fn ssh_roles_production_never_includes_developer() {
        for block in [false, true] {
            let roles = ssh_roles(EnvironmentType::Production, block);
            assert_eq!(roles, &[UserRole::Maintainer, UserRole::Owner]);
        }
    }
}
