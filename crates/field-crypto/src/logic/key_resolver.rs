use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use shared::primitives::WrappedChronoDateTime;
use tokio::time::Instant;
use tracing::debug;

use crate::error::FieldCryptoError;

pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(30);

/// Request attributes a resolver may key on (tenant, provider, message id, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyResolutionContext {
    values: BTreeMap<String, String>,
    /// Stored ciphertext being opened, for decrypt-side resolution.
    pub ciphertext: Option<String>,
}

impl KeyResolutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn with_ciphertext(mut self, ciphertext: impl Into<String>) -> Self {
        self.ciphertext = Some(ciphertext.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn values(&self) -> &BTreeMap<String, String> {
        &self.values
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedKey {
    pub kid: String,
}

#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn resolve_encrypt_key(
        &self,
        ctx: &KeyResolutionContext,
    ) -> Result<ResolvedKey, FieldCryptoError>;

    /// Kids that may open data for `ctx`, most likely first. Defaults to the
    /// encrypt key alone.
    async fn resolve_decrypt_keys(
        &self,
        ctx: &KeyResolutionContext,
    ) -> Result<Vec<String>, FieldCryptoError> {
        Ok(vec![self.resolve_encrypt_key(ctx).await?.kid])
    }
}

/// Trims, drops blanks and de-duplicates while keeping first-seen order.
pub fn merge_kids<'a>(kids: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for kid in kids {
        let kid = kid.trim();
        if kid.is_empty() || out.iter().any(|k| k == kid) {
            continue;
        }
        out.push(kid.to_string());
    }
    out
}

/// Candidate order for decryption: the envelope's own kid, then resolver kids.
pub fn decrypt_candidate_kids(envelope_kid: &str, resolver_kids: &[String]) -> Vec<String> {
    merge_kids(std::iter::once(envelope_kid).chain(resolver_kids.iter().map(String::as_str)))
}

fn require_active_kid(active_kid: &str) -> Result<String, FieldCryptoError> {
    let active_kid = active_kid.trim();
    if active_kid.is_empty() {
        return Err(FieldCryptoError::config("active kid must not be blank"));
    }
    Ok(active_kid.to_string())
}

#[derive(Debug, Clone)]
pub struct StaticKeyResolver {
    active_kid: String,
    decrypt_kids: Vec<String>,
}

impl StaticKeyResolver {
    pub fn new(active_kid: &str, decrypt_kids: &[String]) -> Result<Self, FieldCryptoError> {
        let active_kid = require_active_kid(active_kid)?;
        let decrypt_kids = merge_kids(
            std::iter::once(active_kid.as_str()).chain(decrypt_kids.iter().map(String::as_str)),
        );
        Ok(Self {
            active_kid,
            decrypt_kids,
        })
    }

    pub fn active_kid(&self) -> &str {
        &self.active_kid
    }
}

#[async_trait]
impl KeyResolver for StaticKeyResolver {
    async fn resolve_encrypt_key(
        &self,
        _ctx: &KeyResolutionContext,
    ) -> Result<ResolvedKey, FieldCryptoError> {
        Ok(ResolvedKey {
            kid: self.active_kid.clone(),
        })
    }

    async fn resolve_decrypt_keys(
        &self,
        _ctx: &KeyResolutionContext,
    ) -> Result<Vec<String>, FieldCryptoError> {
        Ok(self.decrypt_kids.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySetState {
    pub active_kid: String,
    pub decrypt_kids: Vec<String>,
    pub refreshed_at: WrappedChronoDateTime,
}

/// Source of the current key set, typically a KMS or Vault adapter.
#[async_trait]
pub trait KeySetProvider: Send + Sync {
    async fn load_key_set(&self, ctx: &KeyResolutionContext)
    -> Result<KeySetState, FieldCryptoError>;
}

struct CachedKeySet {
    state: KeySetState,
    expires_at: Instant,
}

/// Resolver that caches the provider's key set for a TTL. The cache is local to
/// this process. Provider failures are returned to the caller as-is.
pub struct RefreshableKeyResolver {
    provider: Arc<dyn KeySetProvider>,
    ttl: Duration,
    fallback_decrypt_kids: Vec<String>,
    cache: ArcSwapOption<CachedKeySet>,
}

impl RefreshableKeyResolver {
    pub fn new(provider: Arc<dyn KeySetProvider>) -> Self {
        Self {
            provider,
            ttl: DEFAULT_REFRESH_TTL,
            fallback_decrypt_kids: Vec::new(),
            cache: ArcSwapOption::empty(),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Kids merged into every loaded decrypt set.
    pub fn with_fallback_decrypt_kids(mut self, kids: Vec<String>) -> Self {
        self.fallback_decrypt_kids = kids;
        self
    }

    pub fn invalidate(&self) {
        self.cache.store(None);
    }

    pub async fn current(
        &self,
        ctx: &KeyResolutionContext,
    ) -> Result<KeySetState, FieldCryptoError> {
        if let Some(cached) = self.cache.load_full() {
            if Instant::now() < cached.expires_at {
                return Ok(cached.state.clone());
            }
        }

        let loaded = self.provider.load_key_set(ctx).await?;
        let active_kid = require_active_kid(&loaded.active_kid)?;
        let decrypt_kids = merge_kids(
            std::iter::once(active_kid.as_str())
                .chain(loaded.decrypt_kids.iter().map(String::as_str))
                .chain(self.fallback_decrypt_kids.iter().map(String::as_str)),
        );
        let state = KeySetState {
            active_kid,
            decrypt_kids,
            refreshed_at: loaded.refreshed_at,
        };
        debug!(
            active_kid = %state.active_kid,
            decrypt_kids = state.decrypt_kids.len(),
            "refreshed key set"
        );
        self.cache.store(Some(Arc::new(CachedKeySet {
            state: state.clone(),
            expires_at: Instant::now() + self.ttl,
        })));
        Ok(state)
    }
}

#[async_trait]
impl KeyResolver for RefreshableKeyResolver {
    async fn resolve_encrypt_key(
        &self,
        ctx: &KeyResolutionContext,
    ) -> Result<ResolvedKey, FieldCryptoError> {
        Ok(ResolvedKey {
            kid: self.current(ctx).await?.active_kid,
        })
    }

    async fn resolve_decrypt_keys(
        &self,
        ctx: &KeyResolutionContext,
    ) -> Result<Vec<String>, FieldCryptoError> {
        Ok(self.current(ctx).await?.decrypt_kids)
    }
}

#[cfg(all(test, feature = "unit_test"))]
mod unit_test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct CountingProvider {
        loads: AtomicUsize,
        active: Mutex<String>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl CountingProvider {
        fn new(active: &str) -> Arc<Self> {
            Arc::new(Self {
                loads: AtomicUsize::new(0),
                active: Mutex::new(active.to_string()),
                fail: std::sync::atomic::AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl KeySetProvider for CountingProvider {
        async fn load_key_set(
            &self,
            _ctx: &KeyResolutionContext,
        ) -> Result<KeySetState, FieldCryptoError> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(FieldCryptoError::config("key service unavailable"));
            }
            Ok(KeySetState {
                active_kid: self.active.lock().await.clone(),
                decrypt_kids: vec!["k0".to_string(), " ".to_string()],
                refreshed_at: WrappedChronoDateTime::now(),
            })
        }
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let resolver =
            StaticKeyResolver::new("k2", &["k1".to_string(), "k2".to_string(), "k1".to_string()])
                .unwrap();
        let ctx = KeyResolutionContext::new().with("tenant_id", "tenant-a");
        assert_eq!(resolver.resolve_encrypt_key(&ctx).await.unwrap().kid, "k2");
        assert_eq!(
            resolver.resolve_decrypt_keys(&ctx).await.unwrap(),
            vec!["k2".to_string(), "k1".to_string()]
        );

        assert!(StaticKeyResolver::new("  ", &[]).is_err());
    }

    #[test]
    fn test_decrypt_candidate_kids() {
        let kids = decrypt_candidate_kids("k1", &["k2".to_string(), "k1".to_string()]);
        assert_eq!(kids, vec!["k1".to_string(), "k2".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshable_resolver_caches_for_ttl() {
        shared::setup_test!();

        let provider = CountingProvider::new("k1");
        let resolver = RefreshableKeyResolver::new(provider.clone())
            .with_ttl(Duration::from_secs(30))
            .with_fallback_decrypt_kids(vec!["legacy".to_string()]);
        let ctx = KeyResolutionContext::new();

        assert_eq!(resolver.resolve_encrypt_key(&ctx).await.unwrap().kid, "k1");
        assert_eq!(
            resolver.resolve_decrypt_keys(&ctx).await.unwrap(),
            vec!["k1".to_string(), "k0".to_string(), "legacy".to_string()]
        );
        assert_eq!(provider.loads.load(Ordering::SeqCst), 1);

        *provider.active.lock().await = "k2".to_string();
        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(resolver.resolve_encrypt_key(&ctx).await.unwrap().kid, "k1");
        assert_eq!(provider.loads.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(resolver.resolve_encrypt_key(&ctx).await.unwrap().kid, "k2");
        assert_eq!(provider.loads.load(Ordering::SeqCst), 2);

        *provider.active.lock().await = "k3".to_string();
        resolver.invalidate();
        assert_eq!(resolver.resolve_encrypt_key(&ctx).await.unwrap().kid, "k3");
        assert_eq!(provider.loads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refreshable_resolver_propagates_provider_failure() {
        let provider = CountingProvider::new("k1");
        let resolver = RefreshableKeyResolver::new(provider.clone());
        let ctx = KeyResolutionContext::new();
        resolver.resolve_encrypt_key(&ctx).await.unwrap();

        provider.fail.store(true, Ordering::SeqCst);
        tokio::time::advance(DEFAULT_REFRESH_TTL + Duration::from_secs(1)).await;
        assert!(resolver.resolve_encrypt_key(&ctx).await.is_err());
    }
}
