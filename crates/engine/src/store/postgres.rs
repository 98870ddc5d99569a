use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use factory_common::ids::{ClaimId, NodeId};
use factory_common::types::{Claim, Node};

use super::{Store, StoreError};

/// PostgreSQL store for node and claim records.
///
/// Conditional mutations are `UPDATE`/`DELETE` statements whose condition
/// lives in the `WHERE` clause; a zero `rows_affected` count is the
/// condition miss. This serializes the multi-writer placement protocol on
/// the row without any wider lock.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect to PostgreSQL and return a store with a connection pool.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        tracing::info!("connecting to PostgreSQL");

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.health_check().await?;
        tracing::info!("PostgreSQL connection established");

        Ok(store)
    }

    /// Verify the connection is alive.
    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;
        Ok(())
    }

    /// Run database migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        tracing::info!("running PostgreSQL migrations");

        sqlx::migrate!("src/store/migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        tracing::info!("PostgreSQL migrations complete");
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn put_node(&self, node: &Node) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO factory_nodes (id, pool, cap, max_cap, ttl, part)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(node.id.0)
        .bind(&node.pool_id)
        .bind(node.cap)
        .bind(node.max)
        .bind(node.ttl)
        .bind(node.partition)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(())
    }

    async fn deregister_node(&self, id: NodeId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM factory_nodes WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NodeNotExists);
        }
        Ok(())
    }

    async fn increment_node_ttl(&self, id: NodeId, ttl: i64) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE factory_nodes SET ttl = $2 WHERE id = $1")
            .bind(id.0)
            .bind(ttl)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NodeNotExists);
        }
        Ok(())
    }

    async fn claim_node_capacity(&self, id: NodeId, size: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE factory_nodes SET cap = cap - $2 WHERE id = $1 AND cap >= $2",
        )
        .bind(id.0)
        .bind(size)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::CapacityUnfit);
        }
        Ok(())
    }

    async fn return_node_capacity(&self, id: NodeId, size: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE factory_nodes SET cap = cap + $2 WHERE id = $1 AND cap < max_cap",
        )
        .bind(id.0)
        .bind(size)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            let exists: Option<(i32,)> =
                sqlx::query_as("SELECT 1 FROM factory_nodes WHERE id = $1")
                    .bind(id.0)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(|e| StoreError::Query(e.to_string()))?;

            return Err(match exists {
                Some(_) => StoreError::CapacityOverflow,
                None => StoreError::NodeNotExists,
            });
        }
        Ok(())
    }

    async fn nodes_with_capacity(
        &self,
        pool_id: &str,
        size: i64,
        limit: i64,
    ) -> Result<Vec<Node>, StoreError> {
        let rows = sqlx::query_as::<_, NodeRow>(
            r#"
            SELECT id, pool, cap, max_cap, ttl, part
            FROM factory_nodes
            WHERE pool = $1 AND cap >= $2
            ORDER BY cap DESC, id
            LIMIT $3
            "#,
        )
        .bind(pool_id)
        .bind(size)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn expired_nodes(
        &self,
        partition: i32,
        now: i64,
        limit: i64,
    ) -> Result<Vec<Node>, StoreError> {
        let rows = sqlx::query_as::<_, NodeRow>(
            r#"
            SELECT id, pool, cap, max_cap, ttl, part
            FROM factory_nodes
            WHERE part = $1 AND ttl BETWEEN 1 AND $2
            LIMIT $3
            "#,
        )
        .bind(partition)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn put_claim(&self, claim: &Claim) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO factory_claims (id, pool, node, size, ttl, part)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(claim.id.0)
        .bind(&claim.pool_id)
        .bind(claim.node_id.0)
        .bind(claim.size)
        .bind(claim.ttl)
        .bind(claim.partition)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.as_database_error()
                    .is_some_and(|d| d.is_unique_violation())
                {
                    Err(StoreError::ClaimExists)
                } else {
                    Err(StoreError::Query(e.to_string()))
                }
            }
        }
    }

    async fn delete_claim(&self, id: ClaimId) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM factory_claims WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ClaimNotExists);
        }
        Ok(())
    }

    async fn increment_claim_ttl(
        &self,
        id: ClaimId,
        node_id: NodeId,
        ttl: i64,
    ) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE factory_claims SET ttl = $3 WHERE id = $1 AND node = $2")
                .bind(id.0)
                .bind(node_id.0)
                .bind(ttl)
                .execute(&self.pool)
                .await
                .map_err(|e| StoreError::Query(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ClaimNotExists);
        }
        Ok(())
    }

    async fn node_claims(&self, node_id: NodeId) -> Result<Vec<Claim>, StoreError> {
        let rows = sqlx::query_as::<_, ClaimRow>(
            r#"
            SELECT id, pool, node, size, ttl, part
            FROM factory_claims
            WHERE node = $1
            "#,
        )
        .bind(node_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn expired_claims(
        &self,
        partition: i32,
        now: i64,
        limit: i64,
    ) -> Result<Vec<Claim>, StoreError> {
        let rows = sqlx::query_as::<_, ClaimRow>(
            r#"
            SELECT id, pool, node, size, ttl, part
            FROM factory_claims
            WHERE part = $1 AND ttl BETWEEN 1 AND $2
            LIMIT $3
            "#,
        )
        .bind(partition)
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

/// Internal row type for sqlx deserialization.
#[derive(sqlx::FromRow)]
struct NodeRow {
    id: Uuid,
    pool: String,
    cap: i64,
    max_cap: i64,
    ttl: i64,
    part: i32,
}

impl From<NodeRow> for Node {
    fn from(row: NodeRow) -> Self {
        Self {
            id: NodeId::from_uuid(row.id),
            pool_id: row.pool,
            cap: row.cap,
            max: row.max_cap,
            ttl: row.ttl,
            partition: row.part,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ClaimRow {
    id: Uuid,
    pool: String,
    node: Uuid,
    size: i64,
    ttl: i64,
    part: i32,
}

impl From<ClaimRow> for Claim {
    fn from(row: ClaimRow) -> Self {
        Self {
            id: ClaimId::from_uuid(row.id),
            pool_id: row.pool,
            node_id: NodeId::from_uuid(row.node),
            size: row.size,
            ttl: row.ttl,
            partition: row.part,
        }
    }
}
