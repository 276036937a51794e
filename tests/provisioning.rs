//! End-to-end provisioning against an in-memory platform
//!
//! The fake keeps buckets, service accounts and the project policy in
//! memory and enforces the same rules the real platform does: bucket names
//! are global, account ids can be reserved, and policy writes are guarded
//! by an etag.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use groundwork::platform::{
    service_account_email, BucketApi, BucketSpec, IdentityApi, PolicyApi, ServiceAccount,
    ServiceAccountSpec,
};
use groundwork::policy::{service_account_member, PolicyDocument};
use groundwork::{Error, ProvisionConfig, Provisioner, ResourceKind, Result};

const PROJECT: &str = "acme";
const AGENT: &str = "research";

#[derive(Clone, Copy, PartialEq, Eq)]
enum Owner {
    Us,
    Foreign,
}

#[derive(Default)]
struct FakeCloud {
    buckets: Mutex<HashMap<String, Owner>>,
    /// Every bucket name belongs to another project
    all_buckets_foreign: bool,
    accounts: Mutex<HashMap<String, ServiceAccount>>,
    /// Account ids that exist elsewhere or were recently deleted
    reserved_ids: Mutex<HashSet<String>>,
    policy: Mutex<PolicyDocument>,
    etag: AtomicUsize,
    /// Policy writes to reject with a stale etag before accepting
    stale_writes: AtomicUsize,
    policy_writes: AtomicUsize,
    bucket_creates: AtomicUsize,
    keys_issued: AtomicUsize,
}

impl FakeCloud {
    fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn with_foreign_bucket(self: Arc<Self>, name: &str) -> Arc<Self> {
        self.buckets.lock().unwrap().insert(name.to_string(), Owner::Foreign);
        self
    }

    fn with_reserved_id(self: Arc<Self>, id: &str) -> Arc<Self> {
        self.reserved_ids.lock().unwrap().insert(id.to_string());
        self
    }

    fn current_etag(&self) -> String {
        format!("etag-{}", self.etag.load(Ordering::SeqCst))
    }
}

#[async_trait]
impl BucketApi for FakeCloud {
    async fn get_bucket(&self, name: &str) -> Result<()> {
        if self.all_buckets_foreign {
            return Err(Error::conflict(name, "owned by another project"));
        }
        match self.buckets.lock().unwrap().get(name) {
            Some(Owner::Us) => Ok(()),
            Some(Owner::Foreign) => Err(Error::conflict(name, "owned by another project")),
            None => Err(Error::not_found(ResourceKind::Bucket, name)),
        }
    }

    async fn create_bucket(&self, name: &str, _spec: &BucketSpec) -> Result<()> {
        let mut buckets = self.buckets.lock().unwrap();
        if buckets.contains_key(name) {
            return Err(Error::conflict(name, "bucket name not available"));
        }
        buckets.insert(name.to_string(), Owner::Us);
        self.bucket_creates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl IdentityApi for FakeCloud {
    async fn get_service_account(&self, _project: &str, email: &str) -> Result<ServiceAccount> {
        self.accounts
            .lock()
            .unwrap()
            .get(email)
            .cloned()
            .ok_or_else(|| Error::not_found(ResourceKind::ServiceIdentity, email))
    }

    async fn create_service_account(&self, spec: &ServiceAccountSpec) -> Result<ServiceAccount> {
        if self.reserved_ids.lock().unwrap().contains(&spec.account_id) {
            return Err(Error::conflict(&spec.account_id, "already exists"));
        }
        let account = ServiceAccount {
            email: service_account_email(&spec.account_id, &spec.project),
            unique_id: Some("100".to_string()),
            display_name: Some(spec.display_name.clone()),
        };
        self.accounts
            .lock()
            .unwrap()
            .insert(account.email.clone(), account.clone());
        Ok(account)
    }

    async fn create_key(&self, _project: &str, email: &str) -> Result<Vec<u8>> {
        self.keys_issued.fetch_add(1, Ordering::SeqCst);
        Ok(format!(r#"{{"client_email":"{}"}}"#, email).into_bytes())
    }
}

#[async_trait]
impl PolicyApi for FakeCloud {
    async fn get_policy(&self, _project: &str) -> Result<PolicyDocument> {
        let mut policy = self.policy.lock().unwrap().clone();
        policy.etag = Some(self.current_etag());
        Ok(policy)
    }

    async fn set_policy(&self, project: &str, policy: &PolicyDocument) -> Result<PolicyDocument> {
        if self
            .stale_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            // Someone else wrote in between
            self.etag.fetch_add(1, Ordering::SeqCst);
        }
        if policy.etag.as_deref() != Some(self.current_etag().as_str()) {
            return Err(Error::conflict(project, "ABORTED: concurrent policy changes"));
        }
        self.etag.fetch_add(1, Ordering::SeqCst);
        self.policy_writes.fetch_add(1, Ordering::SeqCst);
        *self.policy.lock().unwrap() = policy.clone();
        Ok(policy.clone())
    }
}

fn fast_config() -> ProvisionConfig {
    ProvisionConfig {
        settle_after_create: Duration::ZERO,
        settle_before_key: Duration::ZERO,
        backoff_unit: Duration::from_millis(1),
        ..Default::default()
    }
}

fn provisioner(cloud: &Arc<FakeCloud>) -> Provisioner {
    Provisioner::new(cloud.clone(), cloud.clone(), cloud.clone(), fast_config())
}

#[tokio::test]
async fn fresh_project_gets_bucket_identity_roles_and_key() {
    let cloud = FakeCloud::new();
    let p = provisioner(&cloud);

    let bucket = p.ensure_bucket(PROJECT, AGENT).await.unwrap();
    assert_eq!(bucket.resolved_name, "acme-staging");
    assert!(bucket.created);

    let identity = p.ensure_service_identity(PROJECT, AGENT, "dev").await.unwrap();
    assert_eq!(identity.resolved_name, "research-sa@acme.iam.gserviceaccount.com");
    assert!(identity.created);
    assert!(identity.roles_added);
    assert!(identity.identity_credential().is_some());

    let member = service_account_member(&identity.resolved_name);
    let policy = cloud.policy.lock().unwrap().clone();
    for role in fast_config().required_roles.iter() {
        assert!(policy.has_role(&member, role), "missing {}", role);
    }
}

#[tokio::test]
async fn rerun_reuses_everything_and_writes_nothing() {
    let cloud = FakeCloud::new();
    let p = provisioner(&cloud);

    let first_bucket = p.ensure_bucket(PROJECT, AGENT).await.unwrap();
    let first_identity = p.ensure_service_identity(PROJECT, AGENT, "dev").await.unwrap();

    let bucket = p.ensure_bucket(PROJECT, AGENT).await.unwrap();
    let identity = p.ensure_service_identity(PROJECT, AGENT, "dev").await.unwrap();

    assert_eq!(bucket.resolved_name, first_bucket.resolved_name);
    assert!(!bucket.created);
    assert_eq!(identity.resolved_name, first_identity.resolved_name);
    assert!(!identity.created);
    assert!(!identity.roles_added);

    assert_eq!(cloud.bucket_creates.load(Ordering::SeqCst), 1);
    assert_eq!(cloud.policy_writes.load(Ordering::SeqCst), 1);
    // A reused identity still gets a fresh key
    assert_eq!(cloud.keys_issued.load(Ordering::SeqCst), 2);
    assert!(identity.identity_credential().is_some());
}

#[tokio::test]
async fn foreign_bucket_name_is_skipped() {
    let cloud = FakeCloud::new().with_foreign_bucket("acme-staging");
    let p = provisioner(&cloud);

    let bucket = p.ensure_bucket(PROJECT, AGENT).await.unwrap();
    assert_eq!(bucket.resolved_name, "acme-research-staging");
    assert!(bucket.created);
}

#[tokio::test]
async fn reserved_account_id_moves_to_numbered_candidate() {
    let cloud = FakeCloud::new().with_reserved_id("research-sa");
    let p = provisioner(&cloud);

    let identity = p.ensure_service_identity(PROJECT, AGENT, "dev").await.unwrap();
    assert_eq!(identity.resolved_name, "research-sa-2@acme.iam.gserviceaccount.com");
}

#[tokio::test]
async fn every_bucket_name_taken_exhausts_namespace() {
    let cloud = Arc::new(FakeCloud {
        all_buckets_foreign: true,
        ..Default::default()
    });
    let p = provisioner(&cloud);

    match p.ensure_bucket(PROJECT, AGENT).await {
        Err(Error::ExhaustedNamespace {
            kind, attempted, ..
        }) => {
            assert_eq!(kind, ResourceKind::Bucket);
            assert_eq!(attempted, 50);
        }
        other => panic!("expected ExhaustedNamespace, got {:?}", other),
    }
    assert_eq!(cloud.bucket_creates.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn concurrent_calls_converge_on_one_bucket() {
    let cloud = FakeCloud::new();
    let p = provisioner(&cloud);

    let (a, b) = tokio::join!(p.ensure_bucket(PROJECT, AGENT), p.ensure_bucket(PROJECT, AGENT));
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.resolved_name, b.resolved_name);
    assert!(a.created ^ b.created);
    assert_eq!(cloud.bucket_creates.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn stale_policy_write_is_retried_from_fresh_read() {
    let cloud = FakeCloud::new();
    cloud.stale_writes.store(1, Ordering::SeqCst);
    let p = provisioner(&cloud);

    let identity = p.ensure_service_identity(PROJECT, AGENT, "dev").await.unwrap();
    assert!(identity.roles_added);
    assert_eq!(cloud.policy_writes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn invalid_agent_is_rejected_before_any_call() {
    let cloud = FakeCloud::new();
    let p = provisioner(&cloud);

    let err = p.ensure_service_identity(PROJECT, "!!!", "dev").await.unwrap_err();
    assert!(matches!(err, Error::Validation { .. }));
    assert!(cloud.accounts.lock().unwrap().is_empty());
}
