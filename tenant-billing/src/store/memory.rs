use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{
    validate_field, CmpOp, Document, EntityKind, Filter, FindOptions, Patch, SortAs, Store,
    StoreError, Value,
};

type Table = BTreeMap<String, Document>;

/// In-process store with the same filter semantics as the Postgres store.
///
/// Comparisons against a missing or null field evaluate to false, matching SQL.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<HashMap<EntityKind, Table>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_fields(filter: &Filter) -> Result<(), StoreError> {
        filter.fields().into_iter().try_for_each(validate_field)
    }
}

fn json_f64(v: &serde_json::Value) -> Option<f64> {
    match v {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn json_time(v: &serde_json::Value) -> Option<DateTime<Utc>> {
    v.as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn compare_value(stored: &serde_json::Value, value: &Value) -> Option<Ordering> {
    match value {
        Value::Str(s) => stored.as_str().map(|v| v.cmp(s.as_str())),
        Value::Int(i) => json_f64(stored).and_then(|v| v.partial_cmp(&(*i as f64))),
        Value::Float(f) => json_f64(stored).and_then(|v| v.partial_cmp(f)),
        Value::Bool(b) => stored.as_bool().map(|v| v.cmp(b)),
        Value::Time(t) => json_time(stored).map(|v| v.cmp(t)),
        Value::Null => None,
    }
}

fn field_value<'a>(doc: &'a Document, field: &str) -> Option<&'a serde_json::Value> {
    doc.get(field).filter(|v| !v.is_null())
}

pub(crate) fn matches(doc: &Document, filter: &Filter) -> bool {
    match filter {
        Filter::All => true,
        Filter::Compare { field, op, value } => {
            let stored = field_value(doc, field);
            if let Value::Null = value {
                return match op {
                    CmpOp::Eq => stored.is_none(),
                    CmpOp::Ne => stored.is_some(),
                    _ => false,
                };
            }
            let Some(ordering) = stored.and_then(|s| compare_value(s, value)) else {
                return false;
            };
            match op {
                CmpOp::Eq => ordering == Ordering::Equal,
                CmpOp::Ne => ordering != Ordering::Equal,
                CmpOp::Lt => ordering == Ordering::Less,
                CmpOp::Lte => ordering != Ordering::Greater,
                CmpOp::Gt => ordering == Ordering::Greater,
                CmpOp::Gte => ordering != Ordering::Less,
            }
        }
        Filter::In { field, values } => values.iter().any(|value| {
            matches(
                doc,
                &Filter::Compare {
                    field: field.clone(),
                    op: CmpOp::Eq,
                    value: value.clone(),
                },
            )
        }),
        Filter::IsNull(field) => field_value(doc, field).is_none(),
        Filter::And(parts) => parts.iter().all(|p| matches(doc, p)),
        Filter::Or(parts) => parts.iter().any(|p| matches(doc, p)),
        Filter::Not(inner) => !matches(doc, inner),
    }
}

fn sort_key_cmp(a: &Document, b: &Document, field: &str, sort_as: SortAs) -> Ordering {
    let (va, vb) = (field_value(a, field), field_value(b, field));
    match sort_as {
        SortAs::Time => va.and_then(json_time).cmp(&vb.and_then(json_time)),
        SortAs::Number => va
            .and_then(json_f64)
            .partial_cmp(&vb.and_then(json_f64))
            .unwrap_or(Ordering::Equal),
        SortAs::Text => va.and_then(|v| v.as_str()).cmp(&vb.and_then(|v| v.as_str())),
    }
}

fn unique_tuple(doc: &Document, fields: &[&str]) -> Option<Vec<serde_json::Value>> {
    fields
        .iter()
        .map(|f| field_value(doc, f).cloned())
        .collect::<Option<Vec<_>>>()
}

/// Verifies `candidates` against each other and against the rest of `table`
fn check_unique(
    kind: EntityKind,
    table: &Table,
    candidates: &[(String, Document)],
) -> Result<(), StoreError> {
    for key in kind.unique_keys() {
        let applies = |doc: &Document| key.when.map_or(true, |pred| pred(doc));
        let mut seen: Vec<(String, Vec<serde_json::Value>)> = table
            .iter()
            .filter(|(id, _)| !candidates.iter().any(|(cid, _)| cid == *id))
            .filter(|(_, doc)| applies(*doc))
            .filter_map(|(id, doc)| unique_tuple(doc, key.fields).map(|t| (id.clone(), t)))
            .collect();

        for (id, doc) in candidates.iter().filter(|(_, doc)| applies(doc)) {
            if let Some(tuple) = unique_tuple(doc, key.fields) {
                if seen.iter().any(|(other, t)| other != id && *t == tuple) {
                    return Err(StoreError::UniqueViolation(key.name.to_string()));
                }
                seen.push((id.clone(), tuple));
            }
        }
    }
    Ok(())
}

fn document_id(doc: &Document) -> Result<String, StoreError> {
    doc.get("id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .ok_or_else(|| StoreError::InvalidField("id".to_string()))
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_many(
        &self,
        kind: EntityKind,
        filter: &Filter,
        options: &FindOptions,
    ) -> Result<Vec<Document>, StoreError> {
        Self::check_fields(filter)?;
        let tables = self.tables.read().await;
        let mut docs: Vec<Document> = tables
            .get(&kind)
            .map(|t| t.values().filter(|d| matches(d, filter)).cloned().collect())
            .unwrap_or_default();

        if let Some(order) = &options.order_by {
            validate_field(&order.field)?;
            docs.sort_by(|a, b| {
                let ord = sort_key_cmp(a, b, &order.field, order.sort_as);
                if order.descending {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
        if let Some(limit) = options.limit {
            docs.truncate(limit as usize);
        }
        Ok(docs)
    }

    async fn count(&self, kind: EntityKind, filter: &Filter) -> Result<u64, StoreError> {
        Self::check_fields(filter)?;
        let tables = self.tables.read().await;
        Ok(tables
            .get(&kind)
            .map(|t| t.values().filter(|d| matches(d, filter)).count() as u64)
            .unwrap_or(0))
    }

    async fn sum(&self, kind: EntityKind, field: &str, filter: &Filter) -> Result<f64, StoreError> {
        validate_field(field)?;
        Self::check_fields(filter)?;
        let tables = self.tables.read().await;
        Ok(tables
            .get(&kind)
            .map(|t| {
                t.values()
                    .filter(|d| matches(d, filter))
                    .filter_map(|d| field_value(d, field).and_then(json_f64))
                    .sum()
            })
            .unwrap_or(0.0))
    }

    async fn insert(&self, kind: EntityKind, doc: Document) -> Result<(), StoreError> {
        self.insert_many(kind, vec![doc]).await.map(|_| ())
    }

    async fn insert_many(&self, kind: EntityKind, docs: Vec<Document>) -> Result<u64, StoreError> {
        let mut tables = self.tables.write().await;
        let table = tables.entry(kind).or_default();

        let mut candidates = Vec::with_capacity(docs.len());
        for doc in docs {
            let id = document_id(&doc)?;
            if table.contains_key(&id) || candidates.iter().any(|(c, _)| *c == id) {
                return Err(StoreError::UniqueViolation(format!("{}.id", kind.table())));
            }
            candidates.push((id, doc));
        }
        check_unique(kind, table, &candidates)?;

        let inserted = candidates.len() as u64;
        table.extend(candidates);
        Ok(inserted)
    }

    async fn update_many(&self, kind: EntityKind, filter: &Filter, patch: &Patch) -> Result<u64, StoreError> {
        Self::check_fields(filter)?;
        let mut tables = self.tables.write().await;
        let table = tables.entry(kind).or_default();

        let updated: Vec<(String, Document)> = table
            .iter()
            .filter(|(_, doc)| matches(doc, filter))
            .map(|(id, doc)| {
                let mut next = doc.clone();
                for (k, v) in patch.as_document() {
                    next.insert(k.clone(), v.clone());
                }
                (id.clone(), next)
            })
            .collect();
        check_unique(kind, table, &updated)?;

        let affected = updated.len() as u64;
        table.extend(updated);
        Ok(affected)
    }

    async fn delete_many(&self, kind: EntityKind, filter: &Filter) -> Result<u64, StoreError> {
        Self::check_fields(filter)?;
        let mut tables = self.tables.write().await;
        let Some(table) = tables.get_mut(&kind) else {
            return Ok(0);
        };
        let before = table.len();
        table.retain(|_, doc| !matches(doc, filter));
        Ok((before - table.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn filters_compare_like_sql() {
        let store = MemoryStore::new();
        store
            .insert_many(
                EntityKind::Student,
                vec![
                    doc(json!({"id": "a", "tenant_id": "t1", "is_active": true, "created_at": "2026-01-01T00:00:00Z"})),
                    doc(json!({"id": "b", "tenant_id": "t1", "is_active": false, "created_at": "2026-02-01T00:00:00.5Z"})),
                    doc(json!({"id": "c", "tenant_id": "t2", "is_active": true})),
                ],
            )
            .await
            .unwrap();

        let active = Filter::eq("is_active", true);
        assert_eq!(store.count(EntityKind::Student, &active).await.unwrap(), 2);

        let cutoff: DateTime<Utc> = "2026-01-15T00:00:00Z".parse().unwrap();
        let recent = Filter::gt("created_at", cutoff);
        let found = store
            .find_many(EntityKind::Student, &recent, &FindOptions::default())
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["id"], "b");

        // missing field never satisfies a comparison
        let ne = Filter::ne("created_at", cutoff);
        assert_eq!(store.count(EntityKind::Student, &ne).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn partial_unique_key_only_applies_to_live_subscriptions() {
        let store = MemoryStore::new();
        store
            .insert(EntityKind::Subscription, doc(json!({"id": "s1", "organization_id": "o1", "status": "CANCELLED"})))
            .await
            .unwrap();
        store
            .insert(EntityKind::Subscription, doc(json!({"id": "s2", "organization_id": "o1", "status": "ACTIVE"})))
            .await
            .unwrap();
        let err = store
            .insert(EntityKind::Subscription, doc(json!({"id": "s3", "organization_id": "o1", "status": "TRIAL"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));

        // reviving the cancelled one would also collide
        let patch = Patch::new().set("status", "ACTIVE").unwrap();
        let err = store
            .update_many(EntityKind::Subscription, &Filter::eq("id", "s1"), &patch)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));
    }

    #[tokio::test]
    async fn update_and_delete_report_affected_rows() {
        let store = MemoryStore::new();
        store
            .insert(EntityKind::Invoice, doc(json!({"id": "i1", "organization_id": "o1", "status": "PENDING", "version": 1})))
            .await
            .unwrap();

        let patch = Patch::new().set("status", "SUCCESS").unwrap();
        let stale = Filter::eq("id", "i1").and(Filter::eq("version", 2i64));
        assert_eq!(store.update_many(EntityKind::Invoice, &stale, &patch).await.unwrap(), 0);

        let current = Filter::eq("id", "i1").and(Filter::eq("version", 1i64));
        assert_eq!(store.update_many(EntityKind::Invoice, &current, &patch).await.unwrap(), 1);
        assert_eq!(store.delete_many(EntityKind::Invoice, &Filter::All).await.unwrap(), 1);
        assert_eq!(store.count(EntityKind::Invoice, &Filter::All).await.unwrap(), 0);
    }
}
