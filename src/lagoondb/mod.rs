use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::mysql::{MySqlPool, MySqlPoolOptions};
use uuid::Uuid;

use crate::config::DbConfig;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// The environment, user, or endpoint queried is definitively absent.
    #[error("not found")]
    NotFound,

    #[error("database error: {0}")]
    Transport(#[from] sqlx::Error),

    #[error("invalid row: {0}")]
    InvalidRow(String),
}

/// Deploy target class of an environment. Production environments carry a
/// stricter SSH role whitelist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentType {
    Development,
    Production,
}

impl FromStr for EnvironmentType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            other => anyhow::bail!("unknown environment type: {other}"),
        }
    }
}

impl std::fmt::Display for EnvironmentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Development => "development",
            Self::Production => "production",
        })
    }
}

/// A deployable instance of a project, keyed by its Kubernetes namespace.
#[derive(Debug, Clone)]
pub struct Environment {
    pub id: i32,
    pub project_id: i32,
    pub project_name: String,
    pub name: String,
    pub namespace_name: String,
    pub typ: EnvironmentType,
}

/// A platform identity, as referenced by the identity provider.
#[derive(Debug, Clone, Copy)]
pub struct User {
    pub uuid: Uuid,
}

/// Read-only accessor over the Lagoon API database, plus the idempotent
/// SSH-key `last_used` writer.
#[derive(Clone)]
pub struct Client {
    pool: MySqlPool,
}

impl Client {
    pub async fn connect(cfg: &DbConfig) -> Result<Self, DbError> {
        let pool = MySqlPoolOptions::new()
            .max_connections(10)
            .connect(&cfg.url())
            .await?;
        Ok(Self { pool })
    }

    pub async fn environment_by_namespace_name(
        &self,
        namespace_name: &str,
    ) -> Result<Environment, DbError> {
        let row: Option<(i32, i32, String, String, String, String)> = sqlx::query_as(
            "SELECT e.id, p.id, p.name, e.name, e.openshift_project_name, e.environment_type \
             FROM environment e \
             JOIN project p ON e.project = p.id \
             WHERE e.openshift_project_name = ?",
        )
        .bind(namespace_name)
        .fetch_optional(&self.pool)
        .await?;

        let (id, project_id, project_name, name, namespace_name, typ) =
            row.ok_or(DbError::NotFound)?;
        let typ = typ
            .parse()
            .map_err(|e| DbError::InvalidRow(format!("environment {id}: {e}")))?;
        Ok(Environment {
            id,
            project_id,
            project_name,
            name,
            namespace_name,
            typ,
        })
    }

    pub async fn user_by_ssh_fingerprint(&self, fingerprint: &str) -> Result<User, DbError> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT user_ssh_key.usid \
             FROM ssh_key \
             JOIN user_ssh_key ON ssh_key.id = user_ssh_key.skid \
             WHERE ssh_key.key_fingerprint = ?",
        )
        .bind(fingerprint)
        .fetch_optional(&self.pool)
        .await?;

        let (uuid,) = row.ok_or(DbError::NotFound)?;
        let uuid = Uuid::parse_str(&uuid)
            .map_err(|e| DbError::InvalidRow(format!("user uuid {uuid:?}: {e}")))?;
        Ok(User { uuid })
    }

    /// IDs of the identity-provider groups the project belongs to.
    pub async fn project_group_ids(&self, project_id: i32) -> Result<Vec<Uuid>, DbError> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT group_id FROM kc_group_projects WHERE project_id = ?")
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?;

        if rows.is_empty() {
            return Err(DbError::NotFound);
        }
        rows.into_iter()
            .map(|(id,)| {
                Uuid::parse_str(&id)
                    .map_err(|e| DbError::InvalidRow(format!("group id {id:?}: {e}")))
            })
            .collect()
    }

    /// The SSH endpoint of the cluster an environment is deployed to.
    pub async fn ssh_endpoint_by_environment_id(
        &self,
        environment_id: i32,
    ) -> Result<(String, String), DbError> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT o.ssh_host, o.ssh_port \
             FROM environment e \
             JOIN project p ON e.project = p.id \
             JOIN openshift o ON p.openshift = o.id \
             WHERE e.id = ?",
        )
        .bind(environment_id)
        .fetch_optional(&self.pool)
        .await?;

        row.ok_or(DbError::NotFound)
    }

    /// Record when an SSH key was last used. Idempotent for identical
    /// `(fingerprint, used)` pairs.
    pub async fn ssh_key_used(
        &self,
        fingerprint: &str,
        used: DateTime<Utc>,
    ) -> Result<(), DbError> {
        sqlx::query("UPDATE ssh_key SET last_used = ? WHERE key_fingerprint = ?")
            .bind(format_timestamp(used))
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// MySQL DATETIME literal, always UTC.
fn format_timestamp(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S").to_string()
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn timestamp_format_is_mysql_datetime() {
        let t = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 4).unwrap();
        assert_eq!(format_timestamp(t), "2024-03-09 07:05:04");
    }

    #[test]
    fn environment_type_parses() {
        assert_eq!(
            "development".parse::<EnvironmentType>().unwrap(),
            EnvironmentType::Development
        );
        assert_eq!(
            "production".parse::<EnvironmentType>().unwrap(),
            EnvironmentType::Production
        );
        assert!("staging".parse::<EnvironmentType>().is_err());
    }

    #[test]
    fn environment_type_display_roundtrip() {
        for typ in [EnvironmentType::Development, EnvironmentType::Production] {
            assert_eq!(typ.to_string().parse::<EnvironmentType>().unwrap(), typ);
        }
    }
}
