use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError};

const CONTACT_COLUMNS: &str = "id, account_id, email, display_name, domain, first_seen_at, last_seen_at, outbound_count, inbound_count, trust_tier, status, engagement_score, enrichment_json, enrichment_status, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustTier {
    Tier1,
    Tier2,
    Tier3,
}

impl TrustTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustTier::Tier1 => "tier1",
            TrustTier::Tier2 => "tier2",
            TrustTier::Tier3 => "tier3",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "tier1" => Some(TrustTier::Tier1),
            "tier2" => Some(TrustTier::Tier2),
            "tier3" => Some(TrustTier::Tier3),
            _ => None,
        }
    }
}

/// What the reply timeline says the relationship actually is, as opposed to
/// what raw send frequency would suggest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipStatus {
    Established,
    Ongoing,
    Attempted,
    Cold,
    Dormant,
}

impl RelationshipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipStatus::Established => "established",
            RelationshipStatus::Ongoing => "ongoing",
            RelationshipStatus::Attempted => "attempted",
            RelationshipStatus::Cold => "cold",
            RelationshipStatus::Dormant => "dormant",
        }
    }

    fn from_str(value: &str) -> Option<Self> {
        match value {
            "established" => Some(RelationshipStatus::Established),
            "ongoing" => Some(RelationshipStatus::Ongoing),
            "attempted" => Some(RelationshipStatus::Attempted),
            "cold" => Some(RelationshipStatus::Cold),
            "dormant" => Some(RelationshipStatus::Dormant),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    pub id: String,
    pub account_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub domain: String,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub outbound_count: i64,
    pub inbound_count: i64,
    pub trust_tier: TrustTier,
    pub status: RelationshipStatus,
    pub engagement_score: f64,
    pub enrichment: Option<Value>,
    pub enrichment_status: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Discovery-time contact data written by the trusted-contact extractor.
#[derive(Debug, Clone)]
pub struct DiscoveredContact {
    pub account_id: String,
    pub email: String,
    pub display_name: Option<String>,
    pub outbound_count: i64,
    pub first_seen_at: Option<DateTime<Utc>>,
    pub last_seen_at: Option<DateTime<Utc>>,
    pub trust_tier: TrustTier,
}

#[derive(Debug, Error)]
pub enum ContactError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("invalid enum value {0}")]
    InvalidValue(String),
    #[error("contact not found: {0}")]
    NotFound(String),
}

#[derive(Clone)]
pub struct ContactRepository {
    db: Database,
}

impl ContactRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Idempotent discovery upsert. Outbound count and tier reflect the
    /// latest scan; inbound count and any prior classification survive so the
    /// analyzer can see the previous status.
    pub async fn upsert_discovered(
        &self,
        discovered: DiscoveredContact,
    ) -> Result<Contact, ContactError> {
        let DiscoveredContact {
            account_id,
            email,
            display_name,
            outbound_count,
            first_seen_at,
            last_seen_at,
            trust_tier,
        } = discovered;

        let id = Uuid::new_v4().to_string();
        let email = email.to_lowercase();
        let domain = domain_of(&email);
        let now = now_rfc3339();
        let email_for_error = email.clone();

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO contacts (
                        id, account_id, email, display_name, domain, first_seen_at, last_seen_at,
                        outbound_count, inbound_count, trust_tier, status, engagement_score,
                        enrichment_json, enrichment_status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, 'cold', 0, NULL, NULL, ?10, ?10)
                     ON CONFLICT(account_id, email) DO UPDATE SET
                        display_name = COALESCE(excluded.display_name, contacts.display_name),
                        first_seen_at = COALESCE(contacts.first_seen_at, excluded.first_seen_at),
                        last_seen_at = MAX(COALESCE(contacts.last_seen_at, excluded.last_seen_at), excluded.last_seen_at),
                        outbound_count = excluded.outbound_count,
                        trust_tier = excluded.trust_tier,
                        updated_at = excluded.updated_at
                     RETURNING {CONTACT_COLUMNS}"
                ),
                params![
                    id,
                    account_id,
                    email,
                    display_name,
                    domain,
                    first_seen_at.map(to_rfc3339),
                    last_seen_at.map(to_rfc3339),
                    outbound_count,
                    trust_tier.as_str(),
                    now
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_contact(row),
            None => Err(ContactError::NotFound(email_for_error)),
        }
    }

    pub async fn get(&self, account_id: &str, email: &str) -> Result<Contact, ContactError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CONTACT_COLUMNS} FROM contacts WHERE account_id = ?1 AND email = ?2"
                ),
                params![account_id, email.to_lowercase()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_contact(row),
            None => Err(ContactError::NotFound(email.to_string())),
        }
    }

    /// Contacts for the account ordered by engagement, optionally restricted
    /// to a tier set.
    pub async fn list(
        &self,
        account_id: &str,
        tiers: Option<&[TrustTier]>,
    ) -> Result<Vec<Contact>, ContactError> {
        let tier_filter = match tiers {
            Some(tiers) if !tiers.is_empty() => {
                let quoted: Vec<String> = tiers
                    .iter()
                    .map(|tier| format!("'{}'", tier.as_str()))
                    .collect();
                format!("AND trust_tier IN ({})", quoted.join(", "))
            }
            _ => String::new(),
        };

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {CONTACT_COLUMNS} FROM contacts
                     WHERE account_id = ?1 {tier_filter}
                     ORDER BY engagement_score DESC, email ASC"
                ),
                params![account_id],
            )
            .await?;

        let mut contacts = Vec::new();
        while let Some(row) = rows.next().await? {
            contacts.push(row_to_contact(row)?);
        }
        Ok(contacts)
    }

    /// Analyzer write-back: status, score, and the observed counts.
    pub async fn update_classification(
        &self,
        account_id: &str,
        email: &str,
        status: RelationshipStatus,
        engagement_score: f64,
        outbound_count: i64,
        inbound_count: i64,
        last_seen_at: Option<DateTime<Utc>>,
    ) -> Result<Contact, ContactError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE contacts
                     SET status = ?3,
                         engagement_score = ?4,
                         outbound_count = ?5,
                         inbound_count = ?6,
                         last_seen_at = COALESCE(?7, last_seen_at),
                         updated_at = ?8
                     WHERE account_id = ?1 AND email = ?2
                     RETURNING {CONTACT_COLUMNS}"
                ),
                params![
                    account_id,
                    email.to_lowercase(),
                    status.as_str(),
                    engagement_score,
                    outbound_count,
                    inbound_count,
                    last_seen_at.map(to_rfc3339),
                    now_rfc3339()
                ],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_contact(row),
            None => Err(ContactError::NotFound(email.to_string())),
        }
    }

    pub async fn set_enrichment(
        &self,
        account_id: &str,
        email: &str,
        enrichment: Option<&Value>,
        enrichment_status: &str,
    ) -> Result<(), ContactError> {
        let enrichment_json = enrichment.map(serde_json::to_string).transpose()?;

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "UPDATE contacts
                 SET enrichment_json = ?3, enrichment_status = ?4, updated_at = ?5
                 WHERE account_id = ?1 AND email = ?2
                 RETURNING id",
                params![
                    account_id,
                    email.to_lowercase(),
                    enrichment_json,
                    enrichment_status,
                    now_rfc3339()
                ],
            )
            .await?;

        if rows.next().await?.is_none() {
            return Err(ContactError::NotFound(email.to_string()));
        }
        Ok(())
    }
}

pub fn domain_of(email: &str) -> String {
    email
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_lowercase())
        .unwrap_or_default()
}

fn row_to_contact(row: Row) -> Result<Contact, ContactError> {
    let first_seen: Option<String> = row.get(5)?;
    let last_seen: Option<String> = row.get(6)?;
    let tier_str: String = row.get(9)?;
    let status_str: String = row.get(10)?;
    let enrichment_json: Option<String> = row.get(12)?;
    let created_at: String = row.get(14)?;
    let updated_at: String = row.get(15)?;

    let trust_tier =
        TrustTier::from_str(&tier_str).ok_or(ContactError::InvalidValue(tier_str))?;
    let status = RelationshipStatus::from_str(&status_str)
        .ok_or(ContactError::InvalidValue(status_str))?;

    Ok(Contact {
        id: row.get(0)?,
        account_id: row.get(1)?,
        email: row.get(2)?,
        display_name: row.get(3)?,
        domain: row.get(4)?,
        first_seen_at: parse_optional(first_seen)?,
        last_seen_at: parse_optional(last_seen)?,
        outbound_count: row.get(7)?,
        inbound_count: row.get(8)?,
        trust_tier,
        status,
        engagement_score: row.get(11)?,
        enrichment: enrichment_json
            .map(|raw| serde_json::from_str(&raw))
            .transpose()?,
        enrichment_status: row.get(13)?,
        created_at: DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)?.with_timezone(&Utc),
    })
}

fn parse_optional(raw: Option<String>) -> Result<Option<DateTime<Utc>>, chrono::ParseError> {
    raw.map(|value| DateTime::parse_from_rfc3339(&value).map(|dt| dt.with_timezone(&Utc)))
        .transpose()
}

fn to_rfc3339(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn now_rfc3339() -> String {
    to_rfc3339(Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountRepository;
    use crate::migrations::run_migrations;
    use tempfile::TempDir;

    async fn setup() -> (ContactRepository, String, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db_path = dir.path().join(format!("db_{}.sqlite", Uuid::new_v4()));
        let db = Database::new(&db_path).await.expect("create db");
        run_migrations(&db).await.expect("migrations");
        let account = AccountRepository::new(db.clone())
            .upsert("owner@example.com", None)
            .await
            .expect("account");
        (ContactRepository::new(db), account.id, dir)
    }

    fn discovered(account_id: &str, email: &str, outbound: i64, tier: TrustTier) -> DiscoveredContact {
        DiscoveredContact {
            account_id: account_id.to_string(),
            email: email.to_string(),
            display_name: None,
            outbound_count: outbound,
            first_seen_at: Some(Utc::now()),
            last_seen_at: Some(Utc::now()),
            trust_tier: tier,
        }
    }

    #[tokio::test]
    async fn upsert_discovered_preserves_classification() {
        let (repo, account_id, _dir) = setup().await;

        repo.upsert_discovered(discovered(&account_id, "Alice@Example.com", 2, TrustTier::Tier3))
            .await
            .expect("discover");
        repo.update_classification(
            &account_id,
            "alice@example.com",
            RelationshipStatus::Established,
            0.8,
            2,
            3,
            None,
        )
        .await
        .expect("classify");

        let rediscovered = repo
            .upsert_discovered(discovered(&account_id, "alice@example.com", 4, TrustTier::Tier1))
            .await
            .expect("rediscover");

        assert_eq!(rediscovered.outbound_count, 4);
        assert_eq!(rediscovered.inbound_count, 3, "inbound survives rediscovery");
        assert_eq!(rediscovered.status, RelationshipStatus::Established);
        assert_eq!(rediscovered.trust_tier, TrustTier::Tier1);
        assert_eq!(rediscovered.domain, "example.com");
    }

    #[tokio::test]
    async fn list_filters_by_tier() {
        let (repo, account_id, _dir) = setup().await;
        repo.upsert_discovered(discovered(&account_id, "a@x.com", 5, TrustTier::Tier1))
            .await
            .expect("a");
        repo.upsert_discovered(discovered(&account_id, "b@x.com", 4, TrustTier::Tier2))
            .await
            .expect("b");
        repo.upsert_discovered(discovered(&account_id, "c@x.com", 1, TrustTier::Tier3))
            .await
            .expect("c");

        let trusted = repo
            .list(&account_id, Some(&[TrustTier::Tier1, TrustTier::Tier2]))
            .await
            .expect("list");
        let emails: Vec<&str> = trusted.iter().map(|c| c.email.as_str()).collect();
        assert_eq!(emails, vec!["a@x.com", "b@x.com"]);

        let all = repo.list(&account_id, None).await.expect("list all");
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn enrichment_failure_is_recorded_without_payload() {
        let (repo, account_id, _dir) = setup().await;
        repo.upsert_discovered(discovered(&account_id, "a@x.com", 5, TrustTier::Tier1))
            .await
            .expect("a");

        repo.set_enrichment(&account_id, "a@x.com", None, "failed")
            .await
            .expect("set enrichment");

        let contact = repo.get(&account_id, "a@x.com").await.expect("get");
        assert_eq!(contact.enrichment_status.as_deref(), Some("failed"));
        assert!(contact.enrichment.is_none());
    }

    #[tokio::test]
    async fn missing_contact_is_not_found() {
        let (repo, account_id, _dir) = setup().await;
        let err = repo
            .get(&account_id, "ghost@x.com")
            .await
            .expect_err("should fail");
        assert!(matches!(err, ContactError::NotFound(_)));
    }
}
