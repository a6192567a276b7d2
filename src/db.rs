use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::GatewayError;

/// Token row joined with its owning user, as consulted during auth.
/// The query itself filters out revoked/expired tokens and inactive users,
/// so a returned record is authorized modulo the subject match.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TokenRecord {
    pub jti: String,
    pub user_id: String,
    pub email: String,
    pub team: String,
    pub person: String,
    pub is_revoked: bool,
    pub expires_at: DateTime<Utc>,
    pub inference_profile: String,
}

/// Consolidated quota view: limits from users, monthly usage from
/// quota_usage, daily counters and block state from user_blocking_status.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct QuotaView {
    pub monthly_quota_usd: f64,
    pub daily_limit_usd: f64,
    pub daily_request_limit: i32,
    pub monthly_used_usd: f64,
    pub monthly_requests: i32,
    pub daily_used_usd: f64,
    pub daily_requests: i32,
    pub is_blocked: bool,
    pub blocked_reason: String,
}

/// One completed request's resource consumption. Append-only.
#[derive(Debug, Clone, Default)]
pub struct UsageRow {
    pub user_id: String,
    pub team: String,
    pub person: String,
    pub request_timestamp: DateTime<Utc>,
    pub model_id: String,
    pub request_id: String,
    pub source_ip: String,
    pub user_agent: String,
    pub aws_region: String,
    pub tokens_input: i64,
    pub tokens_output: i64,
    pub tokens_cache_read: i64,
    pub tokens_cache_creation: i64,
    pub cost_usd: f64,
    pub processing_time_ms: i64,
    pub response_status: String,
    pub error_message: String,
}

/// Counts reported by the daily reset
#[derive(Debug, Clone, Copy, Default)]
pub struct ResetOutcome {
    pub users_reset: i64,
    pub users_unblocked: i64,
    pub counters_reset: u64,
}

/// Persistent state behind a PostgreSQL pool. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, GatewayError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_conns)
            .min_connections(config.min_conns)
            .max_lifetime(Duration::from_secs(3600))
            .idle_timeout(Duration::from_secs(1800))
            .acquire_timeout(Duration::from_secs(10))
            .connect(&config.connection_url())
            .await?;

        // Fail startup-time connection problems fast
        sqlx::query("SELECT 1").execute(&pool).await?;

        let store = Self { pool };
        store.ensure_schema().await?;

        info!(
            host = %config.host,
            database = %config.database,
            max_conns = config.max_conns,
            min_conns = config.min_conns,
            "database pool established"
        );

        Ok(store)
    }

    /// Create any missing tables. Caller and token rows are provisioned by
    /// an external token service; the gateway only needs the shapes.
    async fn ensure_schema(&self) -> Result<(), GatewayError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS users (
                iam_username TEXT PRIMARY KEY,
                email TEXT NOT NULL DEFAULT '',
                team TEXT NOT NULL DEFAULT '',
                person TEXT NOT NULL DEFAULT '',
                monthly_quota_usd DOUBLE PRECISION NOT NULL DEFAULT 200.0,
                daily_limit_usd DOUBLE PRECISION NOT NULL DEFAULT 25.0,
                daily_request_limit INTEGER NOT NULL DEFAULT 1000,
                default_inference_profile TEXT NOT NULL DEFAULT '',
                is_active BOOLEAN NOT NULL DEFAULT true,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS tokens (
                token_hash TEXT PRIMARY KEY,
                jti TEXT NOT NULL,
                user_id TEXT NOT NULL REFERENCES users(iam_username),
                is_revoked BOOLEAN NOT NULL DEFAULT false,
                expires_at TIMESTAMPTZ NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS quota_usage (
                user_id TEXT NOT NULL,
                month DATE NOT NULL,
                total_cost_usd DOUBLE PRECISION NOT NULL DEFAULT 0,
                total_requests INTEGER NOT NULL DEFAULT 0,
                last_updated TIMESTAMPTZ,
                PRIMARY KEY (user_id, month)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS user_blocking_status (
                user_id TEXT PRIMARY KEY,
                daily_cost_usd DOUBLE PRECISION NOT NULL DEFAULT 0,
                daily_requests INTEGER NOT NULL DEFAULT 0,
                last_request_at TIMESTAMPTZ,
                is_blocked BOOLEAN NOT NULL DEFAULT false,
                blocked_reason TEXT,
                blocked_at TIMESTAMPTZ,
                blocked_until TIMESTAMPTZ,
                blocked_by_admin_id TEXT,
                requests_at_blocking INTEGER,
                last_reset_at TIMESTAMPTZ,
                updated_at TIMESTAMPTZ
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS request_metrics (
                id BIGSERIAL PRIMARY KEY,
                user_id TEXT NOT NULL,
                team TEXT NOT NULL DEFAULT '',
                person TEXT NOT NULL DEFAULT '',
                request_timestamp TIMESTAMPTZ NOT NULL,
                model_id TEXT NOT NULL,
                request_id TEXT NOT NULL,
                source_ip TEXT NOT NULL DEFAULT '',
                user_agent TEXT NOT NULL DEFAULT '',
                aws_region TEXT NOT NULL DEFAULT '',
                tokens_input BIGINT NOT NULL DEFAULT 0,
                tokens_output BIGINT NOT NULL DEFAULT 0,
                tokens_cache_read BIGINT NOT NULL DEFAULT 0,
                tokens_cache_creation BIGINT NOT NULL DEFAULT 0,
                cost_usd DOUBLE PRECISION NOT NULL DEFAULT 0,
                processing_time_ms BIGINT NOT NULL DEFAULT 0,
                response_status TEXT NOT NULL DEFAULT '',
                error_message TEXT NOT NULL DEFAULT ''
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_request_metrics_user_time
                ON request_metrics (user_id, request_timestamp)
            "#,
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Pool handle that never dials out; for queue-behavior tests only
    #[cfg(test)]
    pub(crate) fn connect_lazy(config: &DatabaseConfig) -> Self {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_conns)
            .acquire_timeout(Duration::from_millis(100))
            .connect_lazy(&config.connection_url())
            .expect("lazy pool construction cannot fail");
        Self { pool }
    }

    /// Look up a token by credential hash. Returns an error for unknown,
    /// revoked, or expired tokens and for inactive users.
    pub async fn validate_token(&self, token_hash: &str) -> Result<TokenRecord, GatewayError> {
        let record = sqlx::query_as::<_, TokenRecord>(
            r#"
            SELECT
                t.jti,
                t.user_id,
                u.email,
                u.team,
                u.person,
                t.is_revoked,
                t.expires_at,
                u.default_inference_profile AS inference_profile
            FROM tokens t
            JOIN users u ON t.user_id = u.iam_username
            WHERE t.token_hash = $1
              AND t.is_revoked = false
              AND t.expires_at > NOW()
              AND u.is_active = true
            "#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        record.ok_or_else(|| GatewayError::AuthFailure("token not found or invalid".into()))
    }

    /// One consolidated read of limits, monthly usage, daily counters, and
    /// block state. Missing usage rows coalesce to zero.
    pub async fn check_quota(&self, user_id: &str) -> Result<QuotaView, GatewayError> {
        let view = sqlx::query_as::<_, QuotaView>(
            r#"
            SELECT
                u.monthly_quota_usd,
                u.daily_limit_usd,
                u.daily_request_limit,
                COALESCE(qu.total_cost_usd, 0) AS monthly_used_usd,
                COALESCE(qu.total_requests, 0) AS monthly_requests,
                COALESCE(ubs.daily_cost_usd, 0) AS daily_used_usd,
                COALESCE(ubs.daily_requests, 0) AS daily_requests,
                COALESCE(ubs.is_blocked, false) AS is_blocked,
                COALESCE(ubs.blocked_reason, '') AS blocked_reason
            FROM users u
            LEFT JOIN quota_usage qu ON u.iam_username = qu.user_id
                AND qu.month = DATE_TRUNC('month', CURRENT_DATE)
            LEFT JOIN user_blocking_status ubs ON u.iam_username = ubs.user_id
            WHERE u.iam_username = $1 AND u.is_active = true
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        view.ok_or_else(|| GatewayError::AuthFailure("user not found".into()))
    }

    /// Append one usage row to request_metrics
    pub async fn insert_metric(&self, row: &UsageRow) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            INSERT INTO request_metrics (
                user_id, team, person, request_timestamp, model_id, request_id,
                source_ip, user_agent, aws_region, tokens_input, tokens_output,
                tokens_cache_read, tokens_cache_creation, cost_usd,
                processing_time_ms, response_status, error_message
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17
            )
            "#,
        )
        .bind(&row.user_id)
        .bind(&row.team)
        .bind(&row.person)
        .bind(row.request_timestamp)
        .bind(&row.model_id)
        .bind(&row.request_id)
        .bind(&row.source_ip)
        .bind(&row.user_agent)
        .bind(&row.aws_region)
        .bind(row.tokens_input)
        .bind(row.tokens_output)
        .bind(row.tokens_cache_read)
        .bind(row.tokens_cache_creation)
        .bind(row.cost_usd)
        .bind(row.processing_time_ms)
        .bind(&row.response_status)
        .bind(&row.error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Debit the monthly aggregate and the daily counters in one
    /// transaction. Serialized per caller by the upsert row locks; a
    /// concurrent check that already passed may briefly push a caller over
    /// the limit, which the subsequent block check closes.
    pub async fn update_quota_and_counters(
        &self,
        user_id: &str,
        cost_usd: f64,
    ) -> Result<(), GatewayError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO quota_usage (user_id, month, total_cost_usd, total_requests, last_updated)
            VALUES ($1, DATE_TRUNC('month', CURRENT_DATE), $2, 1, NOW())
            ON CONFLICT (user_id, month)
            DO UPDATE SET
                total_cost_usd = quota_usage.total_cost_usd + $2,
                total_requests = quota_usage.total_requests + 1,
                last_updated = NOW()
            "#,
        )
        .bind(user_id)
        .bind(cost_usd)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO user_blocking_status
                (user_id, daily_cost_usd, daily_requests, last_request_at, updated_at)
            VALUES ($1, $2, 1, NOW(), NOW())
            ON CONFLICT (user_id)
            DO UPDATE SET
                daily_cost_usd = user_blocking_status.daily_cost_usd + $2,
                daily_requests = user_blocking_status.daily_requests + 1,
                last_request_at = NOW(),
                updated_at = NOW()
            "#,
        )
        .bind(user_id)
        .bind(cost_usd)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Set the block flag when a daily counter has reached its limit.
    /// No-op for already-blocked callers.
    pub async fn check_and_block_user(&self, user_id: &str) -> Result<(), GatewayError> {
        sqlx::query(
            r#"
            UPDATE user_blocking_status ubs
            SET
                is_blocked = true,
                blocked_at = NOW(),
                blocked_reason = CASE
                    WHEN ubs.daily_cost_usd >= u.daily_limit_usd THEN 'Daily cost limit exceeded'
                    WHEN ubs.daily_requests >= u.daily_request_limit THEN 'Daily request limit exceeded'
                    ELSE 'Limit exceeded'
                END,
                requests_at_blocking = ubs.daily_requests,
                updated_at = NOW()
            FROM users u
            WHERE ubs.user_id = u.iam_username
              AND ubs.user_id = $1
              AND ubs.is_blocked = false
              AND (
                  ubs.daily_cost_usd >= u.daily_limit_usd
                  OR ubs.daily_requests >= u.daily_request_limit
              )
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Zero daily counters and lift automatic blocks for rows whose last
    /// request predates today. Admin-placed blocks are left untouched.
    pub async fn reset_daily_counters(&self) -> Result<ResetOutcome, GatewayError> {
        let mut tx = self.pool.begin().await?;
        let mut outcome = ResetOutcome::default();

        let (unblocked,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM user_blocking_status
            WHERE is_blocked = true
              AND last_request_at < CURRENT_DATE
              AND blocked_by_admin_id IS NULL
            "#,
        )
        .fetch_one(&mut *tx)
        .await?;
        outcome.users_unblocked = unblocked;

        let result = sqlx::query(
            r#"
            UPDATE user_blocking_status
            SET daily_requests = 0,
                daily_cost_usd = 0.0,
                is_blocked = false,
                blocked_reason = NULL,
                blocked_at = NULL,
                blocked_until = NULL,
                last_reset_at = NOW(),
                updated_at = NOW()
            WHERE last_request_at < CURRENT_DATE
              AND blocked_by_admin_id IS NULL
            "#,
        )
        .execute(&mut *tx)
        .await?;
        outcome.counters_reset = result.rows_affected();

        let (reset,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(DISTINCT user_id)
            FROM user_blocking_status
            WHERE last_reset_at::date = CURRENT_DATE
            "#,
        )
        .fetch_one(&mut *tx)
        .await?;
        outcome.users_reset = reset;

        tx.commit().await?;
        Ok(outcome)
    }
}
