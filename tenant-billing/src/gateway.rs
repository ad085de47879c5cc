//! Tenant-scoped data access.
//!
//! [`TenantGateway`] is bound to one tenant id and rewrites every operation so
//! that only that tenant's rows are visible or writable. [`CrossTenantGateway`]
//! is the explicit back-office handle that sees everything; it is never handed
//! out implicitly.

use serde_json::Value as Json;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};
use crate::store::{
    from_document, to_document, Document, Entity, EntityKind, Filter, FindOptions, Patch, Store,
    Value,
};

fn decode_all<T: Entity>(docs: Vec<Document>) -> Result<Vec<T>> {
    docs.into_iter()
        .map(|doc| from_document(doc).map_err(CoreError::from))
        .collect()
}

fn decode_one<T: Entity>(doc: Option<Document>) -> Result<Option<T>> {
    doc.map(|d| from_document(d).map_err(CoreError::from)).transpose()
}

/// Field a tenant-bound gateway filters on. Platform-level kinds are matched
/// by their own id, so a tenant only ever sees its own tenant record.
fn scope_field(kind: EntityKind) -> &'static str {
    kind.tenant_field().unwrap_or("id")
}

/// Data gateway bound to a single tenant
#[derive(Clone)]
pub struct TenantGateway {
    store: Arc<dyn Store>,
    tenant_id: String,
}

impl std::fmt::Debug for TenantGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantGateway")
            .field("tenant_id", &self.tenant_id)
            .finish()
    }
}

impl TenantGateway {
    pub fn new(store: Arc<dyn Store>, tenant_id: impl Into<String>) -> Self {
        Self {
            store,
            tenant_id: tenant_id.into(),
        }
    }

    /// Builds a gateway from an optional request context. A missing tenant is a
    /// typed error, never an unfiltered fallback.
    pub fn from_context(store: Arc<dyn Store>, tenant_id: Option<&str>) -> Result<Self> {
        match tenant_id {
            Some(id) if !id.is_empty() => Ok(Self::new(store, id)),
            _ => {
                warn!("Tenant-scoped access requested without a tenant in scope");
                Err(CoreError::MissingTenantContext)
            }
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// ANDs the tenant condition into `filter`. Caller-supplied tenant
    /// conditions are kept but can only narrow the result further.
    fn scoped(&self, kind: EntityKind, filter: &Filter) -> Filter {
        let field = scope_field(kind);
        if filter.references(field) {
            let foreign = filter
                .equality_values(field)
                .into_iter()
                .any(|v| *v != Value::Str(self.tenant_id.clone()));
            if foreign {
                warn!(
                    tenant_id = %self.tenant_id,
                    table = kind.table(),
                    "Query names a different tenant; result is restricted to the bound tenant"
                );
            }
        }
        Filter::eq(field, self.tenant_id.as_str()).and(filter.clone())
    }

    fn stamp(&self, kind: EntityKind, mut doc: Document) -> Result<Document> {
        let field = scope_field(kind);
        match doc.get(field) {
            None | Some(Json::Null) => {
                doc.insert(field.to_string(), Json::String(self.tenant_id.clone()));
            }
            Some(Json::String(existing)) if *existing == self.tenant_id => {}
            Some(other) => {
                return Err(CoreError::validation(format!(
                    "{} {field} {other} does not match bound tenant {}",
                    kind.table(),
                    self.tenant_id
                )));
            }
        }
        Ok(doc)
    }

    /// Ownership and identity are never rewritten through a patch
    fn scrub(&self, kind: EntityKind, patch: &Patch) -> Patch {
        let mut patch = patch.clone();
        if patch.remove(scope_field(kind)).is_some() {
            debug!(table = kind.table(), "Dropped tenant field from update payload");
        }
        patch.remove("id");
        patch
    }

    pub async fn find_many<T: Entity>(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<T>> {
        let scoped = self.scoped(T::KIND, filter);
        decode_all(self.store.find_many(T::KIND, &scoped, options).await?)
    }

    pub async fn find_first<T: Entity>(&self, filter: &Filter) -> Result<Option<T>> {
        let scoped = self.scoped(T::KIND, filter);
        decode_one(self.store.find_first(T::KIND, &scoped).await?)
    }

    /// First match on `id` under the tenant filter, so a known foreign id yields `None`
    pub async fn find_by_id<T: Entity>(&self, id: &str) -> Result<Option<T>> {
        self.find_first(&Filter::eq("id", id)).await
    }

    /// Like `find_by_id` but absent records are `NotFound`
    pub async fn get<T: Entity>(&self, id: &str) -> Result<T> {
        self.find_by_id(id)
            .await?
            .ok_or_else(|| CoreError::not_found(T::KIND.table(), id))
    }

    pub async fn count<T: Entity>(&self, filter: &Filter) -> Result<u64> {
        let scoped = self.scoped(T::KIND, filter);
        Ok(self.store.count(T::KIND, &scoped).await?)
    }

    pub async fn sum<T: Entity>(&self, field: &str, filter: &Filter) -> Result<f64> {
        let scoped = self.scoped(T::KIND, filter);
        Ok(self.store.sum(T::KIND, field, &scoped).await?)
    }

    pub async fn create<T: Entity>(&self, entity: &T) -> Result<()> {
        let doc = self.stamp(T::KIND, to_document(entity)?)?;
        Ok(self.store.insert(T::KIND, doc).await?)
    }

    pub async fn create_many<T: Entity>(&self, entities: &[T]) -> Result<u64> {
        let docs = entities
            .iter()
            .map(|e| self.stamp(T::KIND, to_document(e)?))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.store.insert_many(T::KIND, docs).await?)
    }

    /// Rows outside the bound tenant are simply not matched (0 affected)
    pub async fn update_many<T: Entity>(&self, filter: &Filter, patch: &Patch) -> Result<u64> {
        let scoped = self.scoped(T::KIND, filter);
        let patch = self.scrub(T::KIND, patch);
        Ok(self.store.update_many(T::KIND, &scoped, &patch).await?)
    }

    pub async fn update_by_id<T: Entity>(&self, id: &str, patch: &Patch) -> Result<u64> {
        self.update_many::<T>(&Filter::eq("id", id), patch).await
    }

    pub async fn delete_many<T: Entity>(&self, filter: &Filter) -> Result<u64> {
        let scoped = self.scoped(T::KIND, filter);
        Ok(self.store.delete_many(T::KIND, &scoped).await?)
    }
}

/// Unscoped access for platform operators and batch jobs
#[derive(Clone)]
pub struct CrossTenantGateway {
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for CrossTenantGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrossTenantGateway").finish()
    }
}

impl CrossTenantGateway {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Independent gateway bound to an explicit tenant
    pub fn for_tenant(&self, tenant_id: impl Into<String>) -> TenantGateway {
        TenantGateway::new(self.store.clone(), tenant_id)
    }

    pub async fn find_many<T: Entity>(&self, filter: &Filter, options: &FindOptions) -> Result<Vec<T>> {
        decode_all(self.store.find_many(T::KIND, filter, options).await?)
    }

    pub async fn find_first<T: Entity>(&self, filter: &Filter) -> Result<Option<T>> {
        decode_one(self.store.find_first(T::KIND, filter).await?)
    }

    pub async fn find_by_id<T: Entity>(&self, id: &str) -> Result<Option<T>> {
        self.find_first(&Filter::eq("id", id)).await
    }

    pub async fn count<T: Entity>(&self, filter: &Filter) -> Result<u64> {
        Ok(self.store.count(T::KIND, filter).await?)
    }

    pub async fn create<T: Entity>(&self, entity: &T) -> Result<()> {
        Ok(self.store.insert(T::KIND, to_document(entity)?).await?)
    }

    pub async fn update_many<T: Entity>(&self, filter: &Filter, patch: &Patch) -> Result<u64> {
        Ok(self.store.update_many(T::KIND, filter, patch).await?)
    }

    pub async fn delete_many<T: Entity>(&self, filter: &Filter) -> Result<u64> {
        Ok(self.store.delete_many(T::KIND, filter).await?)
    }

    /// Ids of every tenant-owned row's owner seen in `kind`, used by batch fan-out
    pub async fn distinct_owners(&self, kind: EntityKind, filter: &Filter) -> Result<Vec<String>> {
        let Some(field) = kind.tenant_field() else {
            return Ok(Vec::new());
        };
        let docs = self.store.find_many(kind, filter, &FindOptions::default()).await?;
        let mut owners: Vec<String> = docs
            .iter()
            .filter_map(|d| d.get(field).and_then(|v| v.as_str()).map(str::to_string))
            .collect();
        owners.sort();
        owners.dedup();
        Ok(owners)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Student, Tenant};
    use crate::store::MemoryStore;

    fn store() -> Arc<dyn Store> {
        Arc::new(MemoryStore::new())
    }

    #[tokio::test]
    async fn reads_never_cross_tenants() {
        let store = store();
        let t1 = TenantGateway::new(store.clone(), "t1");
        let t2 = TenantGateway::new(store.clone(), "t2");
        let theirs = Student::new("t2".into(), "Siti".into());
        t2.create(&theirs).await.unwrap();
        t1.create(&Student::new("t1".into(), "Budi".into())).await.unwrap();

        assert!(t1.find_by_id::<Student>(&theirs.id).await.unwrap().is_none());
        assert_eq!(t1.count::<Student>(&Filter::All).await.unwrap(), 1);

        // naming the other tenant explicitly still cannot widen the scope
        let sneaky = Filter::eq("tenant_id", "t2");
        assert_eq!(t1.count::<Student>(&sneaky).await.unwrap(), 0);
        let either = Filter::eq("tenant_id", "t2").or(Filter::eq("tenant_id", "t1"));
        assert_eq!(t1.count::<Student>(&either).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn writes_to_foreign_rows_affect_nothing() {
        let store = store();
        let t1 = TenantGateway::new(store.clone(), "t1");
        let t2 = TenantGateway::new(store.clone(), "t2");
        let theirs = Student::new("t2".into(), "Siti".into());
        t2.create(&theirs).await.unwrap();

        let patch = Patch::new().set("name", "hijacked").unwrap().set("tenant_id", "t1").unwrap();
        assert_eq!(t1.update_by_id::<Student>(&theirs.id, &patch).await.unwrap(), 0);
        assert_eq!(t1.delete_many::<Student>(&Filter::eq("id", theirs.id.as_str())).await.unwrap(), 0);

        // the owner's update cannot move the row either
        assert_eq!(t2.update_by_id::<Student>(&theirs.id, &patch).await.unwrap(), 1);
        let stored: Student = t2.get(&theirs.id).await.unwrap();
        assert_eq!(stored.tenant_id, "t2");
        assert_eq!(stored.name, "hijacked");
    }

    #[tokio::test]
    async fn create_stamps_or_rejects_foreign_owner() {
        let store = store();
        let t1 = TenantGateway::new(store.clone(), "t1");
        let err = t1
            .create(&Student::new("t2".into(), "Siti".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ValidationError(_)));

        let mut doc = to_document(&Student::new(String::new(), "Budi".into())).unwrap();
        doc.remove("tenant_id");
        let stamped = t1.stamp(EntityKind::Student, doc).unwrap();
        assert_eq!(stamped["tenant_id"], "t1");
    }

    #[tokio::test]
    async fn tenant_records_are_visible_only_to_themselves() {
        let store = store();
        let admin = CrossTenantGateway::new(store.clone());
        let a = Tenant::new("Alpha".into(), "alpha".into(), "ALPH".into());
        let b = Tenant::new("Beta".into(), "beta".into(), "BETA".into());
        admin.create(&a).await.unwrap();
        admin.create(&b).await.unwrap();

        let scoped = admin.for_tenant(a.id.clone());
        assert!(scoped.find_by_id::<Tenant>(&b.id).await.unwrap().is_none());
        assert_eq!(scoped.count::<Tenant>(&Filter::All).await.unwrap(), 1);
        assert_eq!(admin.count::<Tenant>(&Filter::All).await.unwrap(), 2);
    }

    #[test]
    fn missing_context_is_an_error() {
        let err = TenantGateway::from_context(store(), None).unwrap_err();
        assert!(matches!(err, CoreError::MissingTenantContext));
        assert!(TenantGateway::from_context(store(), Some("")).is_err());
        assert_eq!(TenantGateway::from_context(store(), Some("t1")).unwrap().tenant_id(), "t1");
    }
}
