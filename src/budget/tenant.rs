//! Tenants and the registry that owns them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use super::GLOBAL_TENANT;
use super::policy::BudgetPolicy;

/// Anything that can name the tenant it belongs to, e.g. an organization model.
pub trait TenantIdentity: Send + Sync {
    fn tenant_id(&self) -> &str;

    /// Identifier of the owning entity, if any.
    fn owner(&self) -> Option<&str> {
        None
    }
}

/// Tenant reference as handed in by callers, resolved once at the boundary.
#[derive(Clone, Copy, Default)]
pub enum TenantRef<'a> {
    /// Tenant-less call, billed against the global budget.
    #[default]
    None,
    ById(&'a str),
    WithObject(&'a dyn TenantIdentity),
}

impl<'a> TenantRef<'a> {
    pub fn resolve(&self) -> String {
        let id = match self {
            TenantRef::None => GLOBAL_TENANT,
            TenantRef::ById(id) => *id,
            TenantRef::WithObject(object) => object.tenant_id(),
        };
        let id = id.trim();
        if id.is_empty() {
            GLOBAL_TENANT.to_string()
        } else {
            id.to_string()
        }
    }

    pub fn owner(&self) -> Option<&str> {
        match self {
            TenantRef::WithObject(object) => object.owner(),
            _ => None,
        }
    }
}

impl std::fmt::Debug for TenantRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TenantRef::None => f.write_str("TenantRef::None"),
            TenantRef::ById(id) => f.debug_tuple("TenantRef::ById").field(id).finish(),
            TenantRef::WithObject(object) => f
                .debug_tuple("TenantRef::WithObject")
                .field(&object.tenant_id())
                .finish(),
        }
    }
}

impl<'a> From<&'a str> for TenantRef<'a> {
    fn from(id: &'a str) -> Self {
        TenantRef::ById(id)
    }
}

impl<'a> From<&'a String> for TenantRef<'a> {
    fn from(id: &'a String) -> Self {
        TenantRef::ById(id)
    }
}

impl<'a> From<Option<&'a str>> for TenantRef<'a> {
    fn from(id: Option<&'a str>) -> Self {
        id.map(TenantRef::ById).unwrap_or_default()
    }
}

#[derive(Debug)]
pub struct Tenant {
    pub tenant_id: String,
    owner: Option<String>,
    active: AtomicBool,
    policy: RwLock<Option<BudgetPolicy>>,
    created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            owner: None,
            active: AtomicBool::new(true),
            policy: RwLock::new(None),
            created_at: Utc::now(),
        }
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    pub fn with_policy(mut self, policy: BudgetPolicy) -> Self {
        self.policy = RwLock::new(Some(policy));
        self
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Tenant-level policy layer, if one was configured.
    pub fn policy(&self) -> Option<BudgetPolicy> {
        self.policy.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_policy(&self, policy: Option<BudgetPolicy>) {
        *self.policy.write().unwrap_or_else(|e| e.into_inner()) = policy;
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_global(&self) -> bool {
        self.tenant_id == GLOBAL_TENANT
    }
}

/// Concurrent map of known tenants.
#[derive(Debug, Clone, Default)]
pub struct TenantRegistry {
    tenants: Arc<DashMap<String, Arc<Tenant>>>,
}

impl TenantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing tenant, or a new active tenant with no policy of its own.
    pub fn find_or_create(&self, tenant_id: &str) -> Arc<Tenant> {
        if let Some(tenant) = self.tenants.get(tenant_id) {
            return Arc::clone(&tenant);
        }
        let entry = self
            .tenants
            .entry(tenant_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(tenant_id, "Creating tenant on first reference");
                Arc::new(Tenant::new(tenant_id))
            });
        Arc::clone(&entry)
    }

    /// Find-or-create from a caller reference, carrying over the owner link.
    pub fn resolve(&self, tenant: TenantRef<'_>) -> Arc<Tenant> {
        let tenant_id = tenant.resolve();
        if let Some(owner) = tenant.owner()
            && !self.tenants.contains_key(&tenant_id)
        {
            let entry = self
                .tenants
                .entry(tenant_id.clone())
                .or_insert_with(|| Arc::new(Tenant::new(tenant_id.as_str()).with_owner(owner)));
            return Arc::clone(&entry);
        }
        self.find_or_create(&tenant_id)
    }

    /// Insert `tenant`, replacing any previous entry with the same id.
    pub fn register(&self, tenant: Tenant) -> Arc<Tenant> {
        let tenant = Arc::new(tenant);
        self.tenants
            .insert(tenant.tenant_id.clone(), Arc::clone(&tenant));
        tenant
    }

    pub fn get(&self, tenant_id: &str) -> Option<Arc<Tenant>> {
        self.tenants.get(tenant_id).map(|v| Arc::clone(&v))
    }

    pub fn set_policy(&self, tenant_id: &str, policy: BudgetPolicy) -> Arc<Tenant> {
        let tenant = self.find_or_create(tenant_id);
        tenant.set_policy(Some(policy));
        tenant
    }

    /// Returns false when the tenant is unknown.
    pub fn deactivate(&self, tenant_id: &str) -> bool {
        self.set_active(tenant_id, false)
    }

    pub fn activate(&self, tenant_id: &str) -> bool {
        self.set_active(tenant_id, true)
    }

    fn set_active(&self, tenant_id: &str, active: bool) -> bool {
        match self.tenants.get(tenant_id) {
            Some(tenant) => {
                tenant.set_active(active);
                tracing::info!(tenant_id, active, "Tenant activity changed");
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, tenant_id: &str) -> Option<Arc<Tenant>> {
        self.tenants.remove(tenant_id).map(|(_, v)| v)
    }

    pub fn tenant_ids(&self) -> Vec<String> {
        self.tenants.iter().map(|e| e.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tenants.is_empty()
    }
}
