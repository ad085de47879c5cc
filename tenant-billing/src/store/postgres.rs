use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use std::time::Duration;
use tracing::info;

use super::{
    validate_field, CmpOp, Document, EntityKind, Filter, FindOptions, Patch, SortAs, Store,
    StoreError, Value,
};
use crate::config::DatabaseConfig;

/// Postgres-backed document store, one JSONB table per entity kind
#[derive(Debug, Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool from configuration
    pub async fn new(config: &DatabaseConfig) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.url)
            .await?;

        info!("Database connection pool established");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }
}

fn push_field(qb: &mut QueryBuilder<'_, Postgres>, field: &str, value: &Value) {
    match value {
        Value::Str(_) | Value::Null => qb.push(format_args!("(data->>'{field}')")),
        Value::Int(_) | Value::Float(_) => qb.push(format_args!("(data->>'{field}')::double precision")),
        Value::Bool(_) => qb.push(format_args!("(data->>'{field}')::boolean")),
        Value::Time(_) => qb.push(format_args!("(data->>'{field}')::timestamptz")),
    };
}

fn push_value(qb: &mut QueryBuilder<'_, Postgres>, value: &Value) {
    match value {
        Value::Str(s) => qb.push_bind(s.clone()),
        Value::Int(i) => qb.push_bind(*i as f64),
        Value::Float(f) => qb.push_bind(*f),
        Value::Bool(b) => qb.push_bind(*b),
        Value::Time(t) => qb.push_bind(*t),
        Value::Null => qb.push("NULL"),
    };
}

/// Compiles the filter AST into a parameterised WHERE expression
pub(crate) fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &Filter) -> Result<(), StoreError> {
    match filter {
        Filter::All => {
            qb.push("TRUE");
        }
        Filter::Compare { field, op, value } => {
            validate_field(field)?;
            if let Value::Null = value {
                let test = match op {
                    CmpOp::Eq => "IS NULL",
                    CmpOp::Ne => "IS NOT NULL",
                    _ => {
                        qb.push("FALSE");
                        return Ok(());
                    }
                };
                qb.push(format_args!("(data->>'{field}') {test}"));
                return Ok(());
            }
            push_field(qb, field, value);
            qb.push(format_args!(" {} ", op.sql()));
            push_value(qb, value);
        }
        Filter::In { field, values } => {
            let alternatives = values
                .iter()
                .map(|v| Filter::Compare {
                    field: field.clone(),
                    op: CmpOp::Eq,
                    value: v.clone(),
                })
                .collect();
            push_filter(qb, &Filter::Or(alternatives))?;
        }
        Filter::IsNull(field) => {
            validate_field(field)?;
            qb.push(format_args!("(data->>'{field}') IS NULL"));
        }
        Filter::And(parts) | Filter::Or(parts) => {
            let (joiner, empty) = if matches!(filter, Filter::And(_)) {
                (" AND ", "TRUE")
            } else {
                (" OR ", "FALSE")
            };
            if parts.is_empty() {
                qb.push(empty);
                return Ok(());
            }
            qb.push("(");
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    qb.push(joiner);
                }
                push_filter(qb, part)?;
            }
            qb.push(")");
        }
        Filter::Not(inner) => {
            qb.push("NOT (");
            push_filter(qb, inner)?;
            qb.push(")");
        }
    }
    Ok(())
}

fn map_write_error(kind: EntityKind, err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::UniqueViolation(
            db.constraint()
                .map(str::to_string)
                .unwrap_or_else(|| kind.table().to_string()),
        ),
        _ => StoreError::Database(err),
    }
}

#[async_trait]
impl Store for Database {
    async fn find_many(
        &self,
        kind: EntityKind,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError> {
        let mut qb = QueryBuilder::new(format!("SELECT data FROM {} WHERE ", kind.table()));
        push_filter(&mut qb, filter)?;

        if let Some(order) = &options.order_by {
            validate_field(&order.field)?;
            let cast = match order.sort_as {
                SortAs::Text => "",
                SortAs::Number => "::double precision",
                SortAs::Time => "::timestamptz",
            };
            let direction = if order.descending { "DESC" } else { "ASC" };
            qb.push(format_args!(" ORDER BY (data->>'{}'){cast} {direction}", order.field));
        }
        if let Some(limit) = options.limit {
            qb.push(" LIMIT ");
            qb.push_bind(limit as i64);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| {
                let data: serde_json::Value = row.try_get("data")?;
                match data {
                    serde_json::Value::Object(doc) => Ok(doc),
                    _ => Err(StoreError::NotAnObject),
                }
            })
            .collect()
    }

    async fn count(&self, kind: EntityKind, filter: &Filter) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::new(format!("SELECT COUNT(*) AS total FROM {} WHERE ", kind.table()));
        push_filter(&mut qb, filter)?;
        let row = qb.build().fetch_one(&self.pool).await?;
        let total: i64 = row.try_get("total")?;
        Ok(total as u64)
    }

    async fn sum(&self, kind: EntityKind, field: &str, filter: &Filter) -> Result<f64, StoreError> {
        validate_field(field)?;
        let mut qb = QueryBuilder::new(format!(
            "SELECT COALESCE(SUM((data->>'{field}')::double precision), 0) AS total FROM {} WHERE ",
            kind.table()
        ));
        push_filter(&mut qb, filter)?;
        let row = qb.build().fetch_one(&self.pool).await?;
        let total: f64 = row.try_get("total")?;
        Ok(total)
    }

    async fn insert(&self, kind: EntityKind, doc: Document) -> Result<(), StoreError> {
        self.insert_many(kind, vec![doc]).await.map(|_| ())
    }

    async fn insert_many(&self, kind: EntityKind, docs: Vec<Document>) -> Result<u64, StoreError> {
        if docs.is_empty() {
            return Ok(0);
        }
        let mut rows = Vec::with_capacity(docs.len());
        for doc in docs {
            let id = doc
                .get("id")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| StoreError::InvalidField("id".to_string()))?;
            rows.push((id, serde_json::Value::Object(doc)));
        }

        let mut qb = QueryBuilder::new(format!("INSERT INTO {} (id, data) ", kind.table()));
        qb.push_values(rows, |mut b, (id, data)| {
            b.push_bind(id).push_bind(data);
        });
        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| map_write_error(kind, e))?;
        Ok(result.rows_affected())
    }

    async fn update_many(&self, kind: EntityKind, filter: &Filter, patch: &Patch) -> Result<u64, StoreError> {
        if patch.is_empty() {
            return self.count(kind, filter).await;
        }
        let mut qb = QueryBuilder::new(format!("UPDATE {} SET data = data || ", kind.table()));
        qb.push_bind(serde_json::Value::Object(patch.as_document().clone()));
        qb.push(" WHERE ");
        push_filter(&mut qb, filter)?;
        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| map_write_error(kind, e))?;
        Ok(result.rows_affected())
    }

    async fn delete_many(&self, kind: EntityKind, filter: &Filter) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::new(format!("DELETE FROM {} WHERE ", kind.table()));
        push_filter(&mut qb, filter)?;
        let result = qb.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(filter: &Filter) -> String {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("");
        push_filter(&mut qb, filter).unwrap();
        qb.sql().to_string()
    }

    #[test]
    fn compiles_nested_filters_with_placeholders() {
        let filter = Filter::eq("status", "ACTIVE").and(Filter::Or(vec![
            Filter::eq("organization_id", "o1"),
            Filter::is_null("domain"),
        ]));
        assert_eq!(
            compile(&filter),
            "((data->>'status') = $1 AND ((data->>'organization_id') = $2 OR (data->>'domain') IS NULL))"
        );
    }

    #[test]
    fn casts_typed_comparisons() {
        let filter = Filter::gte("quantity", 3i64).and(Filter::eq("is_active", true));
        assert_eq!(
            compile(&filter),
            "((data->>'quantity')::double precision >= $1 AND (data->>'is_active')::boolean = $2)"
        );
    }

    #[test]
    fn rejects_unsafe_field_names() {
        let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new("");
        let filter = Filter::eq("x') OR TRUE --", "y");
        assert!(matches!(push_filter(&mut qb, &filter), Err(StoreError::InvalidField(_))));
    }

    #[test]
    fn empty_in_matches_nothing() {
        let filter = Filter::one_of::<&str>("status", []);
        assert_eq!(compile(&filter), "FALSE");
    }
}
