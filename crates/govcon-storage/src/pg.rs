use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use govcon_core::{AiMeta, DescriptionRecord, Opportunity, OpportunityVersion};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::info;

use crate::store::{effective_ai_input_version, BackfillFilter, DescriptionStore, OpportunityStore};

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        info!("migrations applied");
        Ok(())
    }
}

async fn write_opportunity_row(
    tx: &mut Transaction<'_, Postgres>,
    opportunity: &Opportunity,
    content_hash: &str,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO opportunity (
            notice_id, title, organization_type, posted_date, notice_type, base_type,
            archive_type, archive_date, type_of_set_aside, type_of_set_aside_desc,
            response_deadline, naics, classification_code, active, point_of_contact,
            place_of_performance, description, department, sub_tier, office, links,
            content_hash, last_updated
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15,
                $16, $17, $18, $19, $20, $21, $22, now())
        ON CONFLICT (notice_id) DO UPDATE SET
            title = EXCLUDED.title,
            organization_type = EXCLUDED.organization_type,
            posted_date = EXCLUDED.posted_date,
            notice_type = EXCLUDED.notice_type,
            base_type = EXCLUDED.base_type,
            archive_type = EXCLUDED.archive_type,
            archive_date = EXCLUDED.archive_date,
            type_of_set_aside = EXCLUDED.type_of_set_aside,
            type_of_set_aside_desc = EXCLUDED.type_of_set_aside_desc,
            response_deadline = EXCLUDED.response_deadline,
            naics = EXCLUDED.naics,
            classification_code = EXCLUDED.classification_code,
            active = EXCLUDED.active,
            point_of_contact = EXCLUDED.point_of_contact,
            place_of_performance = EXCLUDED.place_of_performance,
            description = EXCLUDED.description,
            department = EXCLUDED.department,
            sub_tier = EXCLUDED.sub_tier,
            office = EXCLUDED.office,
            links = EXCLUDED.links,
            content_hash = EXCLUDED.content_hash,
            last_updated = now()
        "#,
    )
    .bind(&opportunity.notice_id)
    .bind(&opportunity.title)
    .bind(&opportunity.organization_type)
    .bind(&opportunity.posted_date)
    .bind(&opportunity.notice_type)
    .bind(&opportunity.base_type)
    .bind(&opportunity.archive_type)
    .bind(&opportunity.archive_date)
    .bind(&opportunity.type_of_set_aside)
    .bind(&opportunity.type_of_set_aside_desc)
    .bind(&opportunity.response_deadline)
    .bind(Json(&opportunity.naics))
    .bind(&opportunity.classification_code)
    .bind(opportunity.active)
    .bind(Json(&opportunity.point_of_contact))
    .bind(Json(&opportunity.place_of_performance))
    .bind(&opportunity.description)
    .bind(&opportunity.department)
    .bind(&opportunity.sub_tier)
    .bind(&opportunity.office)
    .bind(Json(&opportunity.links))
    .bind(content_hash)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("writing opportunity {}", opportunity.notice_id))?;
    Ok(())
}

async fn write_raw_row(
    tx: &mut Transaction<'_, Postgres>,
    notice_id: &str,
    raw: &Value,
    fetched_at: DateTime<Utc>,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO opportunity_raw (notice_id, raw_data, fetched_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (notice_id) DO UPDATE SET
            raw_data = EXCLUDED.raw_data,
            fetched_at = EXCLUDED.fetched_at
        "#,
    )
    .bind(notice_id)
    .bind(raw)
    .bind(fetched_at)
    .execute(&mut **tx)
    .await
    .with_context(|| format!("writing raw snapshot {notice_id}"))?;
    Ok(())
}

#[async_trait]
impl OpportunityStore for PgStore {
    async fn opportunity_hash(&self, notice_id: &str) -> anyhow::Result<Option<String>> {
        let hash = sqlx::query_scalar("SELECT content_hash FROM opportunity WHERE notice_id = $1")
            .bind(notice_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading content hash {notice_id}"))?;
        Ok(hash)
    }

    async fn insert_opportunity(
        &self,
        opportunity: &Opportunity,
        content_hash: &str,
        raw: &Value,
        fetched_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("starting insert transaction")?;
        write_opportunity_row(&mut tx, opportunity, content_hash).await?;
        write_raw_row(&mut tx, &opportunity.notice_id, raw, fetched_at).await?;
        tx.commit().await.context("committing insert")?;
        Ok(())
    }

    async fn update_opportunity(
        &self,
        opportunity: &Opportunity,
        content_hash: &str,
        raw: &Value,
        fetched_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await.context("starting update transaction")?;
        write_raw_row(&mut tx, &opportunity.notice_id, raw, fetched_at).await?;
        sqlx::query(
            r#"
            INSERT INTO opportunity_version (notice_id, content_hash, raw_snapshot, fetched_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&opportunity.notice_id)
        .bind(content_hash)
        .bind(raw)
        .bind(fetched_at)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("appending version {}", opportunity.notice_id))?;
        write_opportunity_row(&mut tx, opportunity, content_hash).await?;
        tx.commit().await.context("committing update")?;
        Ok(())
    }

    async fn get_opportunity(&self, notice_id: &str) -> anyhow::Result<Option<Opportunity>> {
        let raw: Option<Value> = sqlx::query_scalar("SELECT raw_data FROM opportunity_raw WHERE notice_id = $1")
            .bind(notice_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading opportunity {notice_id}"))?;
        raw.map(|value| serde_json::from_value(value).with_context(|| format!("decoding opportunity {notice_id}")))
            .transpose()
    }

    async fn versions(&self, notice_id: &str) -> anyhow::Result<Vec<OpportunityVersion>> {
        let rows = sqlx::query(
            r#"
            SELECT notice_id, content_hash, raw_snapshot, fetched_at
              FROM opportunity_version
             WHERE notice_id = $1
             ORDER BY id
            "#,
        )
        .bind(notice_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("loading versions {notice_id}"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(OpportunityVersion {
                notice_id: row.try_get("notice_id")?,
                content_hash: row.try_get("content_hash")?,
                raw_snapshot: row.try_get("raw_snapshot")?,
                fetched_at: row.try_get("fetched_at")?,
            });
        }
        Ok(out)
    }
}

const DESCRIPTION_COLUMNS: &str = r#"
    notice_id, source_type, source_url, source_inline, fetch_status, http_status,
    fetched_at, content_type, last_error, raw_json_response, raw_text,
    raw_text_normalized, text_normalized, content_hash, normalization_version,
    ai_input_text, ai_input_hash, ai_input_version, ai_generated_at, ai_meta,
    excerpt_text, poc_email_primary, created_at, updated_at
"#;

fn description_from_row(row: &PgRow) -> anyhow::Result<DescriptionRecord> {
    let source_type: String = row.try_get("source_type")?;
    let fetch_status: String = row.try_get("fetch_status")?;
    let ai_meta: Option<Value> = row.try_get("ai_meta")?;
    let ai_meta = ai_meta
        .map(serde_json::from_value::<AiMeta>)
        .transpose()
        .context("decoding ai_meta")?;

    Ok(DescriptionRecord {
        notice_id: row.try_get("notice_id")?,
        source_type: source_type.parse()?,
        source_url: row.try_get("source_url")?,
        source_inline: row.try_get("source_inline")?,
        fetch_status: fetch_status.parse()?,
        http_status: row.try_get("http_status")?,
        fetched_at: row.try_get("fetched_at")?,
        content_type: row.try_get("content_type")?,
        last_error: row.try_get("last_error")?,
        raw_json_response: row.try_get("raw_json_response")?,
        raw_text: row.try_get("raw_text")?,
        raw_text_normalized: row.try_get("raw_text_normalized")?,
        text_normalized: row.try_get("text_normalized")?,
        content_hash: row.try_get("content_hash")?,
        normalization_version: row.try_get("normalization_version")?,
        ai_input_text: row.try_get("ai_input_text")?,
        ai_input_hash: row.try_get("ai_input_hash")?,
        ai_input_version: row.try_get("ai_input_version")?,
        ai_generated_at: row.try_get("ai_generated_at")?,
        ai_meta,
        excerpt_text: row.try_get("excerpt_text")?,
        poc_email_primary: row.try_get("poc_email_primary")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn bind_description<'q>(
    query: sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>,
    record: &'q DescriptionRecord,
) -> sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(&record.notice_id)
        .bind(record.source_type.as_str())
        .bind(&record.source_url)
        .bind(&record.source_inline)
        .bind(record.fetch_status.as_str())
        .bind(record.http_status)
        .bind(record.fetched_at)
        .bind(&record.content_type)
        .bind(&record.last_error)
        .bind(&record.raw_json_response)
        .bind(&record.raw_text)
        .bind(&record.raw_text_normalized)
        .bind(&record.text_normalized)
        .bind(&record.content_hash)
        .bind(record.normalization_version)
        .bind(&record.ai_input_text)
        .bind(&record.ai_input_hash)
        .bind(effective_ai_input_version(record))
        .bind(record.ai_generated_at)
        .bind(record.ai_meta.as_ref().map(Json))
        .bind(&record.excerpt_text)
        .bind(&record.poc_email_primary)
        .bind(record.created_at)
        .bind(record.updated_at)
}

#[async_trait]
impl DescriptionStore for PgStore {
    async fn get_description(&self, notice_id: &str) -> anyhow::Result<Option<DescriptionRecord>> {
        let sql = format!("SELECT {DESCRIPTION_COLUMNS} FROM opportunity_description WHERE notice_id = $1");
        let row = sqlx::query(&sql)
            .bind(notice_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("loading description {notice_id}"))?;
        row.as_ref().map(description_from_row).transpose()
    }

    async fn insert_description_if_absent(&self, record: &DescriptionRecord) -> anyhow::Result<bool> {
        let sql = format!(
            r#"
            INSERT INTO opportunity_description ({DESCRIPTION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, $24)
            ON CONFLICT (notice_id) DO NOTHING
            "#
        );
        let result = bind_description(sqlx::query(&sql), record)
            .execute(&self.pool)
            .await
            .with_context(|| format!("inserting description {}", record.notice_id))?;
        Ok(result.rows_affected() == 1)
    }

    async fn upsert_description(&self, record: &DescriptionRecord) -> anyhow::Result<()> {
        let sql = format!(
            r#"
            INSERT INTO opportunity_description ({DESCRIPTION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16,
                    $17, $18, $19, $20, $21, $22, $23, $24)
            ON CONFLICT (notice_id) DO UPDATE SET
                source_type = EXCLUDED.source_type,
                source_url = EXCLUDED.source_url,
                source_inline = EXCLUDED.source_inline,
                fetch_status = EXCLUDED.fetch_status,
                http_status = EXCLUDED.http_status,
                fetched_at = EXCLUDED.fetched_at,
                content_type = EXCLUDED.content_type,
                last_error = EXCLUDED.last_error,
                raw_json_response = EXCLUDED.raw_json_response,
                raw_text = EXCLUDED.raw_text,
                raw_text_normalized = EXCLUDED.raw_text_normalized,
                text_normalized = EXCLUDED.text_normalized,
                content_hash = EXCLUDED.content_hash,
                normalization_version = EXCLUDED.normalization_version,
                ai_input_text = EXCLUDED.ai_input_text,
                ai_input_hash = EXCLUDED.ai_input_hash,
                ai_input_version = EXCLUDED.ai_input_version,
                ai_generated_at = EXCLUDED.ai_generated_at,
                ai_meta = EXCLUDED.ai_meta,
                excerpt_text = EXCLUDED.excerpt_text,
                poc_email_primary = EXCLUDED.poc_email_primary,
                updated_at = EXCLUDED.updated_at
            "#
        );
        bind_description(sqlx::query(&sql), record)
            .execute(&self.pool)
            .await
            .with_context(|| format!("upserting description {}", record.notice_id))?;
        Ok(())
    }

    async fn backfill_candidates(&self, filter: BackfillFilter, limit: Option<usize>) -> anyhow::Result<Vec<String>> {
        let predicate = match filter {
            BackfillFilter::MissingAiInput => {
                "COALESCE(raw_text_normalized, '') <> '' AND COALESCE(ai_input_text, '') = ''"
            }
            BackfillFilter::StaleNormalization => {
                "fetch_status = 'fetched' AND normalization_version IS DISTINCT FROM $2"
            }
            BackfillFilter::Unfetched => "source_type = 'url' AND fetch_status IN ('not_requested', 'error')",
            BackfillFilter::All => "COALESCE(raw_text_normalized, '') <> '' AND fetch_status = 'fetched'",
        };
        let sql = format!(
            r#"
            SELECT notice_id
              FROM opportunity_description
             WHERE {predicate}
             ORDER BY notice_id
             LIMIT $1
            "#
        );
        let limit = limit.map(|n| n.min(i64::MAX as usize) as i64);
        let mut query = sqlx::query_scalar::<_, String>(&sql).bind(limit);
        if filter == BackfillFilter::StaleNormalization {
            query = query.bind(govcon_core::NORMALIZATION_VERSION);
        }
        let ids = query
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("selecting backfill candidates ({filter})"))?;
        Ok(ids)
    }
}
