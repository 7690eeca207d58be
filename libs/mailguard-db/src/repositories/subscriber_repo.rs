use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::models::{NewSubscriber, Subscriber, SubscriberFilter, SubscriberStatus};
use crate::store::{DuplicateEmail, SubscriberStore, page_offset};

const SUBSCRIBER_COLUMNS: &str = "id, email, status, first_name, last_name, company, phone, location, \
     groups, segments, custom_fields, validation_result, opt_out_reason, created_at, updated_at";

#[derive(Debug, Clone)]
pub struct SubscriberRepository {
    pool: PgPool,
}

impl SubscriberRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_subscriber(row: &PgRow) -> Result<Subscriber> {
        Ok(Subscriber {
            id: row.try_get("id")?,
            email: row.try_get("email")?,
            status: SubscriberStatus::parse(&row.try_get::<String, _>("status")?),
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            company: row.try_get("company")?,
            phone: row.try_get("phone")?,
            location: row.try_get("location")?,
            groups: row.try_get("groups")?,
            segments: row.try_get("segments")?,
            custom_fields: row.try_get("custom_fields")?,
            validation_result: row.try_get("validation_result")?,
            opt_out_reason: row.try_get("opt_out_reason")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        })
    }
}

#[async_trait]
impl SubscriberStore for SubscriberRepository {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn create_subscriber(&self, new: NewSubscriber) -> Result<Subscriber> {
        let sub = new.into_subscriber();
        let sql = format!(
            "INSERT INTO subscribers ({SUBSCRIBER_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
             RETURNING {SUBSCRIBER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(sub.id)
            .bind(&sub.email)
            .bind(sub.status.as_str())
            .bind(&sub.first_name)
            .bind(&sub.last_name)
            .bind(&sub.company)
            .bind(&sub.phone)
            .bind(&sub.location)
            .bind(&sub.groups)
            .bind(&sub.segments)
            .bind(&sub.custom_fields)
            .bind(&sub.validation_result)
            .bind(&sub.opt_out_reason)
            .bind(sub.created_at)
            .bind(sub.updated_at)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    anyhow::Error::new(DuplicateEmail(sub.email.clone()))
                }
                _ => anyhow::Error::new(e).context("Failed to create subscriber"),
            })?;
        Self::row_to_subscriber(&row)
    }

    async fn get_subscriber(&self, id: Uuid) -> Result<Option<Subscriber>> {
        let sql = format!("SELECT {SUBSCRIBER_COLUMNS} FROM subscribers WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch subscriber")?;
        row.as_ref().map(Self::row_to_subscriber).transpose()
    }

    async fn find_subscriber_by_email(&self, email: &str) -> Result<Option<Subscriber>> {
        let sql = format!("SELECT {SUBSCRIBER_COLUMNS} FROM subscribers WHERE email = $1");
        let row = sqlx::query(&sql)
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch subscriber by email")?;
        row.as_ref().map(Self::row_to_subscriber).transpose()
    }

    async fn find_subscribers_by_emails(&self, emails: &[String]) -> Result<Vec<Subscriber>> {
        if emails.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!("SELECT {SUBSCRIBER_COLUMNS} FROM subscribers WHERE email = ANY($1)");
        let rows = sqlx::query(&sql)
            .bind(emails)
            .fetch_all(&self.pool)
            .await
            .context("Failed to fetch subscribers by email")?;
        rows.iter().map(Self::row_to_subscriber).collect()
    }

    async fn save_subscriber(&self, sub: &Subscriber) -> Result<Subscriber> {
        let sql = format!(
            "UPDATE subscribers SET status = $2, first_name = $3, last_name = $4, company = $5, \
             phone = $6, location = $7, groups = $8, segments = $9, custom_fields = $10, \
             validation_result = $11, opt_out_reason = $12, updated_at = NOW() \
             WHERE id = $1 RETURNING {SUBSCRIBER_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(sub.id)
            .bind(sub.status.as_str())
            .bind(&sub.first_name)
            .bind(&sub.last_name)
            .bind(&sub.company)
            .bind(&sub.phone)
            .bind(&sub.location)
            .bind(&sub.groups)
            .bind(&sub.segments)
            .bind(&sub.custom_fields)
            .bind(&sub.validation_result)
            .bind(&sub.opt_out_reason)
            .fetch_one(&self.pool)
            .await
            .context("Failed to update subscriber")?;
        Self::row_to_subscriber(&row)
    }

    async fn list_subscribers(&self, filter: &SubscriberFilter) -> Result<(Vec<Subscriber>, i64)> {
        let (offset, limit) = page_offset(filter.page, filter.limit);
        let status = filter.status.map(|s| s.as_str());

        let total: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM subscribers WHERE ($1::TEXT IS NULL OR status = $1)",
        )
        .bind(status)
        .fetch_one(&self.pool)
        .await
        .context("Failed to count subscribers")?;

        let sql = format!(
            "SELECT {SUBSCRIBER_COLUMNS} FROM subscribers \
             WHERE ($1::TEXT IS NULL OR status = $1) \
             ORDER BY created_at DESC LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(status)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .context("Failed to list subscribers")?;
        let items = rows
            .iter()
            .map(Self::row_to_subscriber)
            .collect::<Result<Vec<_>>>()?;
        Ok((items, total))
    }
}
