//! Postgres-backed implementation of the [`Store`] trait (C1, §4.1).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{QueryBuilder, Row};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::domain::{
    Clearable, HealthSample, Instance, InstancePatch, InstanceStatus, Plan, Relay, RelayStatus,
    RefreshToken, StatusHistoryEntry, TunnelToken, User,
};
use crate::error::{CoreError, Result};

use super::Store;

#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        info!("store: connected to postgres");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("store: migrations applied");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs `op`, retrying transient failures per §7 (see
    /// [`crate::error::retry_transient`]). Safe to wrap a whole
    /// multi-statement transaction: a transient failure before `COMMIT`
    /// leaves no partial effect, so retrying the entire closure is atomic.
    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        crate::error::retry_transient(op).await
    }
}

fn row_to_user(row: &PgRow) -> Result<User> {
    let plan_str: String = row.try_get("plan")?;
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        name: row.try_get("name")?,
        plan: Plan::try_from(plan_str.as_str())?,
        plan_expires: row.try_get("plan_expires")?,
        is_admin: row.try_get("is_admin")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_instance(row: &PgRow) -> Result<Instance> {
    let status_str: String = row.try_get("status")?;
    let local_port: i32 = row.try_get("local_port")?;
    let remote_port: Option<i32> = row.try_get("remote_port")?;
    Ok(Instance {
        id: row.try_get("id")?,
        owner: row.try_get("owner")?,
        name: row.try_get("name")?,
        local_port: local_port as u16,
        region: row.try_get("region")?,
        preferred_host: row.try_get("preferred_host")?,
        assigned_relay: row.try_get("assigned_relay")?,
        status: InstanceStatus::try_from(status_str.as_str())?,
        status_reason: row.try_get("status_reason")?,
        tunnel_connected: row.try_get("tunnel_connected")?,
        public_url: row.try_get("public_url")?,
        remote_port: remote_port.map(|p| p as u16),
        current_token: row.try_get("current_token")?,
        token_expires_at: row.try_get("token_expires_at")?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_relay(row: &PgRow) -> Result<Relay> {
    let status_str: String = row.try_get("status")?;
    let port: i32 = row.try_get("port")?;
    let max_tunnels: i32 = row.try_get("max_tunnels")?;
    let current_load: i32 = row.try_get("current_load")?;
    Ok(Relay {
        id: row.try_get("id")?,
        host: row.try_get("host")?,
        port: port as u16,
        location: row.try_get("location")?,
        max_tunnels: max_tunnels as u32,
        max_bw_mbps: row.try_get("max_bw_mbps")?,
        current_load: current_load as u32,
        current_bw_mbps: row.try_get("current_bw_mbps")?,
        status: RelayStatus::try_from(status_str.as_str())?,
        last_health_check: row.try_get("last_health_check")?,
    })
}

fn row_to_tunnel_token(row: &PgRow) -> Result<TunnelToken> {
    Ok(TunnelToken {
        token: row.try_get("token")?,
        instance_id: row.try_get("instance_id")?,
        user_id: row.try_get("user_id")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_refresh_token(row: &PgRow) -> Result<RefreshToken> {
    Ok(RefreshToken {
        token: row.try_get("token")?,
        user_id: row.try_get("user_id")?,
        expires_at: row.try_get("expires_at")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_health_sample(row: &PgRow) -> Result<HealthSample> {
    Ok(HealthSample {
        instance_id: row.try_get("instance_id")?,
        ts: row.try_get("ts")?,
        vscode_responsive: row.try_get("vscode_responsive")?,
        last_activity_epoch: row.try_get("last_activity_epoch")?,
        cpu_pct: row.try_get("cpu_pct")?,
        mem_bytes: row.try_get("mem_bytes")?,
        has_code_server: row.try_get("has_code_server")?,
    })
}

fn row_to_status_history(row: &PgRow) -> Result<StatusHistoryEntry> {
    let status_str: String = row.try_get("status")?;
    Ok(StatusHistoryEntry {
        instance_id: row.try_get("instance_id")?,
        status: InstanceStatus::try_from(status_str.as_str())?,
        reason: row.try_get("reason")?,
        ts: row.try_get("ts")?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    #[instrument(skip(self, password_hash))]
    async fn create_user_and_assign_trial(&self, email: &str, password_hash: &str, name: &str) -> Result<User> {
        self.with_retry(|| async {
            let row = sqlx::query(
                r#"
                INSERT INTO users (id, email, password_hash, name, plan, is_admin, created_at, updated_at)
                VALUES ($1, $2, $3, $4, 'trial', false, now(), now())
                RETURNING *
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(email)
            .bind(password_hash)
            .bind(name)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| match &err {
                sqlx::Error::Database(db) if db.is_unique_violation() => {
                    CoreError::Conflict(format!("email already registered: {email}"))
                }
                _ => CoreError::from(err),
            })?;
            row_to_user(&row)
        })
        .await
    }

    async fn get_user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        self.with_retry(|| async {
            let row = sqlx::query("SELECT * FROM users WHERE id = $1").bind(id).fetch_optional(&self.pool).await?;
            row.as_ref().map(row_to_user).transpose()
        })
        .await
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
        self.with_retry(|| async {
            let row = sqlx::query("SELECT * FROM users WHERE email = $1").bind(email).fetch_optional(&self.pool).await?;
            row.as_ref().map(row_to_user).transpose()
        })
        .await
    }

    async fn update_plan(&self, user_id: Uuid, plan: Plan, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        self.with_retry(|| async {
            sqlx::query("UPDATE users SET plan = $2, plan_expires = $3, updated_at = now() WHERE id = $1")
                .bind(user_id)
                .bind(plan.as_str())
                .bind(expires_at)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn create_instance(
        &self,
        owner: Uuid,
        name: &str,
        local_port: u16,
        region: &str,
        preferred_host: Option<&str>,
    ) -> Result<Instance> {
        self.with_retry(|| async {
            let row = sqlx::query(
                r#"
                INSERT INTO instances
                    (id, owner, name, local_port, region, preferred_host, status, status_reason,
                     tunnel_connected, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, 'inactive', 'created', false, now(), now())
                RETURNING *
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(owner)
            .bind(name)
            .bind(local_port as i32)
            .bind(region)
            .bind(preferred_host)
            .fetch_one(&self.pool)
            .await?;
            row_to_instance(&row)
        })
        .await
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<Instance>> {
        self.with_retry(|| async {
            let row = sqlx::query("SELECT * FROM instances WHERE id = $1").bind(id).fetch_optional(&self.pool).await?;
            row.as_ref().map(row_to_instance).transpose()
        })
        .await
    }

    async fn list_instances_by_user(&self, owner: Uuid) -> Result<Vec<Instance>> {
        self.with_retry(|| async {
            let rows = sqlx::query("SELECT * FROM instances WHERE owner = $1 ORDER BY created_at DESC")
                .bind(owner)
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(row_to_instance).collect()
        })
        .await
    }

    #[instrument(skip(self, patch))]
    async fn update_instance(&self, id: Uuid, patch: &InstancePatch) -> Result<Instance> {
        self.with_retry(|| async {
            let mut tx = self.pool.begin().await?;

            let current_row = sqlx::query("SELECT * FROM instances WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| CoreError::NotFound(format!("instance {id}")))?;
            let current = row_to_instance(&current_row)?;

            let mut builder = QueryBuilder::new("UPDATE instances SET updated_at = now()");

            if let Some(name) = &patch.name {
                builder.push(", name = ").push_bind(name.clone());
            }
            if let Some(status) = patch.status {
                builder.push(", status = ").push_bind(status.as_str());
            }
            if let Some(reason) = &patch.status_reason {
                builder.push(", status_reason = ").push_bind(reason.clone());
            }
            if let Some(connected) = patch.tunnel_connected {
                builder.push(", tunnel_connected = ").push_bind(connected);
            }
            match &patch.assigned_relay {
                Some(Clearable::Set(v)) => {
                    builder.push(", assigned_relay = ").push_bind(v.clone());
                }
                Some(Clearable::Clear) => {
                    builder.push(", assigned_relay = NULL");
                }
                None => {}
            }
            match &patch.public_url {
                Some(Clearable::Set(v)) => {
                    builder.push(", public_url = ").push_bind(v.clone());
                }
                Some(Clearable::Clear) => {
                    builder.push(", public_url = NULL");
                }
                None => {}
            }
            match patch.remote_port {
                Some(Clearable::Set(v)) => {
                    builder.push(", remote_port = ").push_bind(v as i32);
                }
                Some(Clearable::Clear) => {
                    builder.push(", remote_port = NULL");
                }
                None => {}
            }
            match &patch.current_token {
                Some(Clearable::Set(v)) => {
                    builder.push(", current_token = ").push_bind(v.clone());
                }
                Some(Clearable::Clear) => {
                    builder.push(", current_token = NULL");
                }
                None => {}
            }
            match patch.token_expires_at {
                Some(Clearable::Set(v)) => {
                    builder.push(", token_expires_at = ").push_bind(v);
                }
                Some(Clearable::Clear) => {
                    builder.push(", token_expires_at = NULL");
                }
                None => {}
            }
            if let Some(ts) = patch.last_heartbeat_at {
                builder.push(", last_heartbeat_at = ").push_bind(ts);
            }

            builder.push(" WHERE id = ").push_bind(id).push(" RETURNING *");
            let updated_row = builder.build().fetch_one(&mut *tx).await?;
            let updated = row_to_instance(&updated_row)?;

            updated.check_invariants().map_err(CoreError::Internal)?;

            // I6: append iff the status actually changed.
            if let Some(new_status) = patch.status {
                if new_status != current.status {
                    sqlx::query(
                        "INSERT INTO status_history (instance_id, status, reason, ts) VALUES ($1, $2, $3, now())",
                    )
                    .bind(id)
                    .bind(new_status.as_str())
                    .bind(patch.status_reason.as_deref().unwrap_or(""))
                    .execute(&mut *tx)
                    .await?;
                }
            }

            tx.commit().await?;
            Ok(updated)
        })
        .await
    }

    async fn delete_instance(&self, id: Uuid) -> Result<()> {
        self.with_retry(|| async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM tunnel_tokens WHERE instance_id = $1").bind(id).execute(&mut *tx).await?;
            let result = sqlx::query("DELETE FROM instances WHERE id = $1").bind(id).execute(&mut *tx).await?;
            if result.rows_affected() == 0 {
                return Err(CoreError::NotFound(format!("instance {id}")));
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self, token))]
    async fn save_tunnel_token(&self, token: &TunnelToken) -> Result<()> {
        // I1: at most one active tunnel token per instance — delete any
        // prior row before inserting, in the same transaction the caller
        // (token broker) wraps together with `update_instance`.
        self.with_retry(|| async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("DELETE FROM tunnel_tokens WHERE instance_id = $1").bind(token.instance_id).execute(&mut *tx).await?;
            sqlx::query(
                "INSERT INTO tunnel_tokens (token, instance_id, user_id, expires_at, created_at) VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(&token.token)
            .bind(token.instance_id)
            .bind(token.user_id)
            .bind(token.expires_at)
            .bind(token.created_at)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn get_tunnel_token(&self, token: &str) -> Result<Option<TunnelToken>> {
        self.with_retry(|| async {
            let row = sqlx::query("SELECT * FROM tunnel_tokens WHERE token = $1").bind(token).fetch_optional(&self.pool).await?;
            row.as_ref().map(row_to_tunnel_token).transpose()
        })
        .await
    }

    async fn delete_tunnel_token(&self, token: &str) -> Result<()> {
        self.with_retry(|| async {
            sqlx::query("DELETE FROM tunnel_tokens WHERE token = $1").bind(token).execute(&self.pool).await?;
            Ok(())
        })
        .await
    }

    async fn delete_tunnel_token_for_instance(&self, instance_id: Uuid) -> Result<()> {
        self.with_retry(|| async {
            sqlx::query("DELETE FROM tunnel_tokens WHERE instance_id = $1").bind(instance_id).execute(&self.pool).await?;
            Ok(())
        })
        .await
    }

    async fn delete_user_tunnel_tokens(&self, user_id: Uuid) -> Result<()> {
        self.with_retry(|| async {
            sqlx::query("DELETE FROM tunnel_tokens WHERE user_id = $1").bind(user_id).execute(&self.pool).await?;
            Ok(())
        })
        .await
    }

    async fn count_active_tunnel_tokens_for_instance(&self, instance_id: Uuid) -> Result<i64> {
        self.with_retry(|| async {
            let row = sqlx::query("SELECT count(*) AS n FROM tunnel_tokens WHERE instance_id = $1 AND expires_at > now()")
                .bind(instance_id)
                .fetch_one(&self.pool)
                .await?;
            Ok(row.try_get::<i64, _>("n")?)
        })
        .await
    }

    async fn reap_expired_tunnel_tokens(&self) -> Result<u64> {
        self.with_retry(|| async {
            let result = sqlx::query("DELETE FROM tunnel_tokens WHERE expires_at < now()").execute(&self.pool).await?;
            Ok(result.rows_affected())
        })
        .await
    }

    async fn save_refresh_token(&self, token: &RefreshToken) -> Result<()> {
        self.with_retry(|| async {
            sqlx::query(
                "INSERT INTO refresh_tokens (token, user_id, expires_at, created_at) VALUES ($1, $2, $3, $4)
                 ON CONFLICT (token) DO NOTHING",
            )
            .bind(&token.token)
            .bind(token.user_id)
            .bind(token.expires_at)
            .bind(token.created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_refresh_token(&self, token: &str) -> Result<Option<RefreshToken>> {
        self.with_retry(|| async {
            let row = sqlx::query("SELECT * FROM refresh_tokens WHERE token = $1").bind(token).fetch_optional(&self.pool).await?;
            row.as_ref().map(row_to_refresh_token).transpose()
        })
        .await
    }

    async fn delete_refresh_token(&self, token: &str) -> Result<()> {
        self.with_retry(|| async {
            sqlx::query("DELETE FROM refresh_tokens WHERE token = $1").bind(token).execute(&self.pool).await?;
            Ok(())
        })
        .await
    }

    async fn delete_user_refresh_tokens(&self, user_id: Uuid) -> Result<()> {
        self.with_retry(|| async {
            sqlx::query("DELETE FROM refresh_tokens WHERE user_id = $1").bind(user_id).execute(&self.pool).await?;
            Ok(())
        })
        .await
    }

    async fn save_health_sample(&self, sample: &HealthSample) -> Result<()> {
        self.with_retry(|| async {
            sqlx::query(
                r#"
                INSERT INTO health_metrics
                    (instance_id, ts, vscode_responsive, last_activity_epoch, cpu_pct, mem_bytes, has_code_server)
                VALUES ($1, now(), $2, $3, $4, $5, $6)
                "#,
            )
            .bind(sample.instance_id)
            .bind(sample.vscode_responsive)
            .bind(sample.last_activity_epoch)
            .bind(sample.cpu_pct)
            .bind(sample.mem_bytes)
            .bind(sample.has_code_server)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn get_latest_health_sample(&self, instance_id: Uuid) -> Result<Option<HealthSample>> {
        self.with_retry(|| async {
            let row = sqlx::query("SELECT * FROM health_metrics WHERE instance_id = $1 ORDER BY ts DESC LIMIT 1")
                .bind(instance_id)
                .fetch_optional(&self.pool)
                .await?;
            row.as_ref().map(row_to_health_sample).transpose()
        })
        .await
    }

    async fn list_status_history(&self, instance_id: Uuid, limit: i64) -> Result<Vec<StatusHistoryEntry>> {
        self.with_retry(|| async {
            let rows = sqlx::query("SELECT * FROM status_history WHERE instance_id = $1 ORDER BY ts DESC LIMIT $2")
                .bind(instance_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?;
            rows.iter().map(row_to_status_history).collect()
        })
        .await
    }

    async fn relay_upsert(&self, relay: &Relay) -> Result<()> {
        self.with_retry(|| async {
            sqlx::query(
                r#"
                INSERT INTO bore_servers
                    (id, host, port, location, max_tunnels, max_bw_mbps, current_load, current_bw_mbps, status, last_health_check)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now())
                ON CONFLICT (id) DO UPDATE SET
                    host = EXCLUDED.host,
                    port = EXCLUDED.port,
                    location = EXCLUDED.location,
                    max_tunnels = EXCLUDED.max_tunnels,
                    max_bw_mbps = EXCLUDED.max_bw_mbps,
                    status = EXCLUDED.status
                "#,
            )
            .bind(&relay.id)
            .bind(&relay.host)
            .bind(relay.port as i32)
            .bind(&relay.location)
            .bind(relay.max_tunnels as i32)
            .bind(relay.max_bw_mbps)
            .bind(relay.current_load as i32)
            .bind(relay.current_bw_mbps)
            .bind(relay.status.as_str())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn relay_set_status(&self, relay_id: &str, status: RelayStatus) -> Result<()> {
        self.with_retry(|| async {
            sqlx::query("UPDATE bore_servers SET status = $2, last_health_check = now() WHERE id = $1")
                .bind(relay_id)
                .bind(status.as_str())
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }

    async fn relay_update_load(&self, relay_id: &str, current_load: u32, instantaneous_bw_mbps: f64) -> Result<()> {
        // EMA smoothing (alpha=0.3, §4.6) applied in SQL to avoid a read-modify-write race.
        self.with_retry(|| async {
            sqlx::query(
                r#"
                UPDATE bore_servers
                SET current_load = $2,
                    current_bw_mbps = 0.3 * $3 + 0.7 * current_bw_mbps,
                    last_health_check = now()
                WHERE id = $1
                "#,
            )
            .bind(relay_id)
            .bind(current_load as i32)
            .bind(instantaneous_bw_mbps)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await
    }

    async fn list_relays(&self) -> Result<Vec<Relay>> {
        self.with_retry(|| async {
            let rows = sqlx::query("SELECT * FROM bore_servers ORDER BY id").fetch_all(&self.pool).await?;
            rows.iter().map(row_to_relay).collect()
        })
        .await
    }

    async fn get_relay(&self, relay_id: &str) -> Result<Option<Relay>> {
        self.with_retry(|| async {
            let row = sqlx::query("SELECT * FROM bore_servers WHERE id = $1").bind(relay_id).fetch_optional(&self.pool).await?;
            row.as_ref().map(row_to_relay).transpose()
        })
        .await
    }

    async fn count_active_tunnels(&self) -> Result<i64> {
        self.with_retry(|| async {
            let row = sqlx::query("SELECT count(*) AS n FROM instances WHERE tunnel_connected = true").fetch_one(&self.pool).await?;
            Ok(row.try_get::<i64, _>("n")?)
        })
        .await
    }

    async fn count_user_active_tunnels(&self, user_id: Uuid) -> Result<i64> {
        self.with_retry(|| async {
            let row = sqlx::query("SELECT count(*) AS n FROM instances WHERE owner = $1 AND tunnel_connected = true")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await?;
            Ok(row.try_get::<i64, _>("n")?)
        })
        .await
    }

    async fn list_stale_connected_instances(&self, cutoff: DateTime<Utc>) -> Result<Vec<Instance>> {
        // `last_heartbeat_at` is stamped on every heartbeat RPC
        // (`touch_heartbeat`) and on the `tunnel-connected` callback, unlike
        // `updated_at`, which only moves on a status change and would
        // otherwise make a steadily-heartbeating instance look stale the
        // moment it settles (§4.3, §4.9). `last_heartbeat_at IS NULL` can
        // only mean a connected-tier instance that predates this column or
        // never received its initial stamp; treat it as stale too rather
        // than silently excluding it from the sweep.
        self.with_retry(|| async {
            let rows = sqlx::query(
                "SELECT * FROM instances
                 WHERE status IN ('active', 'online', 'idle', 'degraded')
                   AND (last_heartbeat_at IS NULL OR last_heartbeat_at < $1)",
            )
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await?;
            rows.iter().map(row_to_instance).collect()
        })
        .await
    }

    /// Stamps `last_heartbeat_at` on every heartbeat RPC (§4.3) without
    /// touching `status`/`updated_at` — a bare liveness stamp, not a state
    /// transition, so it never appends to status history.
    async fn touch_heartbeat(&self, instance_id: Uuid, ts: DateTime<Utc>) -> Result<()> {
        self.with_retry(|| async {
            sqlx::query("UPDATE instances SET last_heartbeat_at = $2 WHERE id = $1")
                .bind(instance_id)
                .bind(ts)
                .execute(&self.pool)
                .await?;
            Ok(())
        })
        .await
    }
}
