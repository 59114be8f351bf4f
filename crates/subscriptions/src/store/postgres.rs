//! Postgres store
//!
//! Owner-level atomicity for inserts comes from a transaction-scoped advisory lock
//! keyed on the owner reference. Usage increments are a single guarded `UPDATE`.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, Postgres};
use sqlx::{Executor, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use super::{ConflictCheck, PlanStore, SubscriptionStore, UsageStore};
use crate::error::{SubscriptionError, SubscriptionResult};
use crate::feature::{Feature, FeatureKind, RestrictedRelation};
use crate::owner::OwnerRef;
use crate::plan::{Plan, PlanListing, PlanState, PlanType};
use crate::subscription::{NewSubscription, Subscription};
use crate::time_window::TimeWindow;
use crate::usage::{IncrementOutcome, Usage, UsageKey, UsageScope};

macro_rules! subscription_columns {
    () => {
        "id, plan_id, owner_type, owner_id, price, currency, is_recurring, starts_at, expires_at, \
         test_ends_at, paid_at, payment_tolerance_ends_at, cancelled_at, refunded_at, renewed_at, \
         created_at, updated_at"
    };
}

macro_rules! usage_columns {
    () => {
        "id, subscription_id, code, consumer_type, consumer_id, used"
    };
}

macro_rules! plan_columns {
    () => {
        "id, position, state, name, description, price, currency, plan_type, duration_days"
    };
}

macro_rules! feature_columns {
    () => {
        "id, plan_id, code, kind, limit_value, position, name, description, restricted_model, \
         restricted_relation"
    };
}

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: Uuid,
    position: i32,
    state: String,
    name: String,
    description: Option<String>,
    price: i64,
    currency: String,
    plan_type: String,
    duration_days: Option<i32>,
}

#[derive(Debug, sqlx::FromRow)]
struct FeatureRow {
    id: Uuid,
    plan_id: Uuid,
    code: String,
    kind: String,
    limit_value: i64,
    position: i32,
    name: String,
    description: Option<String>,
    restricted_model: Option<String>,
    restricted_relation: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    plan_id: Uuid,
    owner_type: String,
    owner_id: String,
    price: i64,
    currency: String,
    is_recurring: bool,
    starts_at: OffsetDateTime,
    expires_at: OffsetDateTime,
    test_ends_at: Option<OffsetDateTime>,
    paid_at: Option<OffsetDateTime>,
    payment_tolerance_ends_at: Option<OffsetDateTime>,
    cancelled_at: Option<OffsetDateTime>,
    refunded_at: Option<OffsetDateTime>,
    renewed_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

#[derive(Debug, sqlx::FromRow)]
struct UsageRow {
    id: Uuid,
    subscription_id: Uuid,
    code: String,
    consumer_type: String,
    consumer_id: String,
    used: i64,
}

fn out_of_range(field: &str) -> SubscriptionError {
    SubscriptionError::Storage(format!("{} out of range", field))
}

fn unknown_value(field: &str, value: &str) -> SubscriptionError {
    SubscriptionError::Storage(format!("unknown {} '{}'", field, value))
}

impl TryFrom<FeatureRow> for Feature {
    type Error = SubscriptionError;

    fn try_from(row: FeatureRow) -> SubscriptionResult<Self> {
        let kind = FeatureKind::parse(&row.kind).ok_or_else(|| unknown_value("feature kind", &row.kind))?;
        let restricted = match (row.restricted_model, row.restricted_relation) {
            (Some(model), Some(relation)) => Some(RestrictedRelation { model, relation }),
            _ => None,
        };
        Ok(Feature {
            id: row.id,
            plan_id: row.plan_id,
            code: row.code,
            kind,
            limit: u64::try_from(row.limit_value).map_err(|_| out_of_range("limit_value"))?,
            position: u32::try_from(row.position).map_err(|_| out_of_range("position"))?,
            name: row.name,
            description: row.description,
            restricted,
        })
    }
}

impl PlanRow {
    fn into_plan(self, features: Vec<Feature>) -> SubscriptionResult<Plan> {
        Ok(Plan {
            id: self.id,
            position: u32::try_from(self.position).map_err(|_| out_of_range("position"))?,
            state: PlanState::parse(&self.state).ok_or_else(|| unknown_value("plan state", &self.state))?,
            name: self.name,
            description: self.description,
            price: self.price,
            currency: self.currency,
            plan_type: PlanType::parse(&self.plan_type)
                .ok_or_else(|| unknown_value("plan type", &self.plan_type))?,
            duration_days: self
                .duration_days
                .map(|d| u32::try_from(d).map_err(|_| out_of_range("duration_days")))
                .transpose()?,
            features,
        })
    }
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        Subscription {
            id: row.id,
            plan_id: row.plan_id,
            owner: OwnerRef::new(row.owner_type, row.owner_id),
            price: row.price,
            currency: row.currency,
            is_recurring: row.is_recurring,
            starts_at: row.starts_at,
            expires_at: row.expires_at,
            test_ends_at: row.test_ends_at,
            paid_at: row.paid_at,
            payment_tolerance_ends_at: row.payment_tolerance_ends_at,
            cancelled_at: row.cancelled_at,
            refunded_at: row.refunded_at,
            renewed_at: row.renewed_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

impl From<UsageRow> for Usage {
    fn from(row: UsageRow) -> Self {
        let scope = if row.consumer_type.is_empty() && row.consumer_id.is_empty() {
            None
        } else {
            Some(UsageScope::new(row.consumer_type, row.consumer_id))
        };
        Usage {
            id: row.id,
            subscription_id: row.subscription_id,
            code: row.code,
            scope,
            used: row.used,
        }
    }
}

/// Scope columns of a key; unscoped rows use empty strings
fn scope_columns(key: &UsageKey) -> (&str, &str) {
    key.scope
        .as_ref()
        .map(|s| (s.consumer_type.as_str(), s.consumer_id.as_str()))
        .unwrap_or(("", ""))
}

fn listing_states(listing: PlanListing) -> Vec<String> {
    [PlanState::Active, PlanState::ActiveInvisible, PlanState::Inactive]
        .into_iter()
        .filter(|s| listing.includes(*s))
        .map(|s| s.as_str().to_string())
        .collect()
}

/// Lock the owner for the rest of the transaction and read their subscriptions
async fn locked_subscriptions_of(
    tx: &mut Transaction<'_, Postgres>,
    owner: &OwnerRef,
) -> SubscriptionResult<Vec<Subscription>> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(owner.to_string())
        .execute(&mut **tx)
        .await?;

    let rows: Vec<SubscriptionRow> = sqlx::query_as(concat!(
        "SELECT ",
        subscription_columns!(),
        " FROM plan_subscriptions WHERE owner_type = $1 AND owner_id = $2 ORDER BY starts_at, created_at"
    ))
    .bind(&owner.owner_type)
    .bind(&owner.owner_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows.into_iter().map(Subscription::from).collect())
}

async fn insert_row(tx: &mut Transaction<'_, Postgres>, subscription: &Subscription) -> SubscriptionResult<()> {
    sqlx::query(concat!(
        "INSERT INTO plan_subscriptions (",
        subscription_columns!(),
        ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)"
    ))
    .bind(subscription.id)
    .bind(subscription.plan_id)
    .bind(&subscription.owner.owner_type)
    .bind(&subscription.owner.owner_id)
    .bind(subscription.price)
    .bind(&subscription.currency)
    .bind(subscription.is_recurring)
    .bind(subscription.starts_at)
    .bind(subscription.expires_at)
    .bind(subscription.test_ends_at)
    .bind(subscription.paid_at)
    .bind(subscription.payment_tolerance_ends_at)
    .bind(subscription.cancelled_at)
    .bind(subscription.refunded_at)
    .bind(subscription.renewed_at)
    .bind(subscription.created_at)
    .bind(subscription.updated_at)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn update_row<'e, E>(executor: E, subscription: &Subscription) -> SubscriptionResult<()>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE plan_subscriptions SET
            is_recurring = $2,
            starts_at = $3,
            expires_at = $4,
            test_ends_at = $5,
            paid_at = $6,
            payment_tolerance_ends_at = $7,
            cancelled_at = $8,
            refunded_at = $9,
            renewed_at = $10,
            updated_at = $11
        WHERE id = $1
        "#,
    )
    .bind(subscription.id)
    .bind(subscription.is_recurring)
    .bind(subscription.starts_at)
    .bind(subscription.expires_at)
    .bind(subscription.test_ends_at)
    .bind(subscription.paid_at)
    .bind(subscription.payment_tolerance_ends_at)
    .bind(subscription.cancelled_at)
    .bind(subscription.refunded_at)
    .bind(subscription.renewed_at)
    .bind(subscription.updated_at)
    .execute(executor)
    .await?;

    if result.rows_affected() == 0 {
        return Err(SubscriptionError::SubscriptionNotFound(subscription.id));
    }
    Ok(())
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> SubscriptionResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| SubscriptionError::Storage(format!("migration failed: {}", e)))
    }

    async fn features_by_plan(&self, plan_ids: &[Uuid]) -> SubscriptionResult<HashMap<Uuid, Vec<Feature>>> {
        let rows: Vec<FeatureRow> = sqlx::query_as(concat!(
            "SELECT ",
            feature_columns!(),
            " FROM plan_features WHERE plan_id = ANY($1) ORDER BY position, code"
        ))
        .bind(plan_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<Uuid, Vec<Feature>> = HashMap::new();
        for row in rows {
            let feature = Feature::try_from(row)?;
            grouped.entry(feature.plan_id).or_default().push(feature);
        }
        Ok(grouped)
    }

    async fn fetch_usage(&self, key: &UsageKey) -> SubscriptionResult<Option<Usage>> {
        let (consumer_type, consumer_id) = scope_columns(key);
        let row: Option<UsageRow> = sqlx::query_as(concat!(
            "SELECT ",
            usage_columns!(),
            " FROM plan_feature_usages \
             WHERE subscription_id = $1 AND code = $2 AND consumer_type = $3 AND consumer_id = $4"
        ))
        .bind(key.subscription_id)
        .bind(&key.code)
        .bind(consumer_type)
        .bind(consumer_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Usage::from))
    }
}

#[async_trait]
impl PlanStore for PgStore {
    async fn find_plan(&self, id: Uuid) -> SubscriptionResult<Option<Plan>> {
        let row: Option<PlanRow> = sqlx::query_as(concat!("SELECT ", plan_columns!(), " FROM plans WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut features = self.features_by_plan(&[id]).await?;
        row.into_plan(features.remove(&id).unwrap_or_default()).map(Some)
    }

    async fn list_plans(&self, listing: PlanListing) -> SubscriptionResult<Vec<Plan>> {
        let rows: Vec<PlanRow> = sqlx::query_as(concat!(
            "SELECT ",
            plan_columns!(),
            " FROM plans WHERE state = ANY($1) ORDER BY position, name"
        ))
        .bind(listing_states(listing))
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let mut features = self.features_by_plan(&ids).await?;
        rows.into_iter()
            .map(|row| {
                let plan_features = features.remove(&row.id).unwrap_or_default();
                row.into_plan(plan_features)
            })
            .collect()
    }

    async fn save_plan(&self, plan: &Plan) -> SubscriptionResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO plans (id, position, state, name, description, price, currency, plan_type, duration_days)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                position = EXCLUDED.position,
                state = EXCLUDED.state,
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                price = EXCLUDED.price,
                currency = EXCLUDED.currency,
                plan_type = EXCLUDED.plan_type,
                duration_days = EXCLUDED.duration_days,
                updated_at = NOW()
            "#,
        )
        .bind(plan.id)
        .bind(i32::try_from(plan.position).map_err(|_| out_of_range("position"))?)
        .bind(plan.state.as_str())
        .bind(&plan.name)
        .bind(&plan.description)
        .bind(plan.price)
        .bind(&plan.currency)
        .bind(plan.plan_type.as_str())
        .bind(
            plan.duration_days
                .map(|d| i32::try_from(d).map_err(|_| out_of_range("duration_days")))
                .transpose()?,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM plan_features WHERE plan_id = $1")
            .bind(plan.id)
            .execute(&mut *tx)
            .await?;

        for feature in &plan.features {
            let (model, relation) = match &feature.restricted {
                Some(r) => (Some(r.model.as_str()), Some(r.relation.as_str())),
                None => (None, None),
            };
            sqlx::query(concat!(
                "INSERT INTO plan_features (",
                feature_columns!(),
                ") VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
            ))
            .bind(feature.id)
            .bind(plan.id)
            .bind(&feature.code)
            .bind(feature.kind.as_str())
            .bind(i64::try_from(feature.limit).map_err(|_| out_of_range("limit"))?)
            .bind(i32::try_from(feature.position).map_err(|_| out_of_range("position"))?)
            .bind(&feature.name)
            .bind(&feature.description)
            .bind(model)
            .bind(relation)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for PgStore {
    async fn insert_subscription(
        &self,
        new: NewSubscription,
        now: OffsetDateTime,
        check: ConflictCheck<'_>,
    ) -> SubscriptionResult<Subscription> {
        let mut tx = self.pool.begin().await?;
        let existing = locked_subscriptions_of(&mut tx, &new.owner).await?;

        // Dropping the transaction on error rolls back and releases the lock
        check(&existing)?;

        let subscription = new.into_subscription(now);
        insert_row(&mut tx, &subscription).await?;

        tx.commit().await?;
        Ok(subscription)
    }

    async fn replace_subscription(
        &self,
        previous: &Subscription,
        new: NewSubscription,
        now: OffsetDateTime,
        check: ConflictCheck<'_>,
    ) -> SubscriptionResult<Subscription> {
        if previous.owner != new.owner {
            return Err(SubscriptionError::InvalidArgument(format!(
                "cannot replace a subscription of {} with one for {}",
                previous.owner, new.owner
            )));
        }

        let mut tx = self.pool.begin().await?;
        let mut existing = locked_subscriptions_of(&mut tx, &new.owner).await?;
        match existing.iter_mut().find(|s| s.id == previous.id) {
            Some(stored) => *stored = previous.clone(),
            None => return Err(SubscriptionError::SubscriptionNotFound(previous.id)),
        }
        check(&existing)?;

        update_row(&mut *tx, previous).await?;
        let subscription = new.into_subscription(now);
        insert_row(&mut tx, &subscription).await?;

        tx.commit().await?;
        Ok(subscription)
    }

    async fn find_subscription(&self, id: Uuid) -> SubscriptionResult<Option<Subscription>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(concat!(
            "SELECT ",
            subscription_columns!(),
            " FROM plan_subscriptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Subscription::from))
    }

    async fn subscriptions_of(&self, owner: &OwnerRef) -> SubscriptionResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(concat!(
            "SELECT ",
            subscription_columns!(),
            " FROM plan_subscriptions WHERE owner_type = $1 AND owner_id = $2 ORDER BY starts_at, created_at"
        ))
        .bind(&owner.owner_type)
        .bind(&owner.owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Subscription::from).collect())
    }

    async fn update_subscription(&self, subscription: &Subscription) -> SubscriptionResult<()> {
        update_row(&self.pool, subscription).await
    }

    async fn expiring_recurring(&self, window: TimeWindow) -> SubscriptionResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(concat!(
            "SELECT ",
            subscription_columns!(),
            " FROM plan_subscriptions WHERE is_recurring AND expires_at BETWEEN $1 AND $2 ORDER BY starts_at"
        ))
        .bind(window.starts_at)
        .bind(window.ends_at)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Subscription::from).collect())
    }

    async fn list_subscriptions(&self) -> SubscriptionResult<Vec<Subscription>> {
        let rows: Vec<SubscriptionRow> = sqlx::query_as(concat!(
            "SELECT ",
            subscription_columns!(),
            " FROM plan_subscriptions ORDER BY starts_at"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Subscription::from).collect())
    }
}

#[async_trait]
impl UsageStore for PgStore {
    async fn find_usage(&self, key: &UsageKey) -> SubscriptionResult<Option<Usage>> {
        self.fetch_usage(key).await
    }

    async fn usages_of(&self, subscription_id: Uuid) -> SubscriptionResult<Vec<Usage>> {
        let rows: Vec<UsageRow> = sqlx::query_as(concat!(
            "SELECT ",
            usage_columns!(),
            " FROM plan_feature_usages WHERE subscription_id = $1 ORDER BY code, consumer_type, consumer_id"
        ))
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Usage::from).collect())
    }

    async fn ensure_usage(&self, key: &UsageKey) -> SubscriptionResult<Usage> {
        let (consumer_type, consumer_id) = scope_columns(key);
        sqlx::query(
            r#"
            INSERT INTO plan_feature_usages (id, subscription_id, code, consumer_type, consumer_id, used)
            VALUES ($1, $2, $3, $4, $5, 0)
            ON CONFLICT (subscription_id, code, consumer_type, consumer_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(key.subscription_id)
        .bind(&key.code)
        .bind(consumer_type)
        .bind(consumer_id)
        .execute(&self.pool)
        .await?;

        self.fetch_usage(key)
            .await?
            .ok_or_else(|| SubscriptionError::Storage(format!("usage row for {} vanished", key.code)))
    }

    async fn try_increment(
        &self,
        key: &UsageKey,
        amount: i64,
        ceiling: Option<i64>,
    ) -> SubscriptionResult<IncrementOutcome> {
        let current = self.ensure_usage(key).await?;
        let (consumer_type, consumer_id) = scope_columns(key);

        let applied: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE plan_feature_usages
            SET used = used + $5, updated_at = NOW()
            WHERE subscription_id = $1 AND code = $2 AND consumer_type = $3 AND consumer_id = $4
              AND ($6::BIGINT IS NULL OR used + $5 <= $6)
            RETURNING used
            "#,
        )
        .bind(key.subscription_id)
        .bind(&key.code)
        .bind(consumer_type)
        .bind(consumer_id)
        .bind(amount)
        .bind(ceiling)
        .fetch_optional(&self.pool)
        .await?;

        match applied {
            Some(used) => Ok(IncrementOutcome::Applied { used }),
            None => {
                let used = self.fetch_usage(key).await?.map_or(current.used, |u| u.used);
                Ok(IncrementOutcome::Rejected { used })
            }
        }
    }

    async fn decrement_clamped(&self, key: &UsageKey, amount: i64) -> SubscriptionResult<Usage> {
        self.ensure_usage(key).await?;
        let (consumer_type, consumer_id) = scope_columns(key);

        let row: UsageRow = sqlx::query_as(concat!(
            "UPDATE plan_feature_usages SET used = GREATEST(used - $5, 0), updated_at = NOW() \
             WHERE subscription_id = $1 AND code = $2 AND consumer_type = $3 AND consumer_id = $4 \
             RETURNING ",
            usage_columns!()
        ))
        .bind(key.subscription_id)
        .bind(&key.code)
        .bind(consumer_type)
        .bind(consumer_id)
        .bind(amount)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn reset_usage(&self, key: &UsageKey) -> SubscriptionResult<Usage> {
        self.ensure_usage(key).await?;
        let (consumer_type, consumer_id) = scope_columns(key);

        let row: UsageRow = sqlx::query_as(concat!(
            "UPDATE plan_feature_usages SET used = 0, updated_at = NOW() \
             WHERE subscription_id = $1 AND code = $2 AND consumer_type = $3 AND consumer_id = $4 \
             RETURNING ",
            usage_columns!()
        ))
        .bind(key.subscription_id)
        .bind(&key.code)
        .bind(consumer_type)
        .bind(consumer_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    async fn list_usages(&self) -> SubscriptionResult<Vec<Usage>> {
        let rows: Vec<UsageRow> = sqlx::query_as(concat!(
            "SELECT ",
            usage_columns!(),
            " FROM plan_feature_usages ORDER BY subscription_id, code"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Usage::from).collect())
    }
}
