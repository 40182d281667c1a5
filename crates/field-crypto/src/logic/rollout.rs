// Percentage rollout of a new active kid.
// Assignment is sticky: the same identity always lands in the same bucket for a
// given policy, so the hash below must stay bit-for-bit stable.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::FieldCryptoError;
use crate::logic::key_resolver::{KeyResolutionContext, KeyResolver, ResolvedKey, merge_kids};

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;

fn default_sticky_fields() -> Vec<String> {
    vec![
        "tenant_id".to_string(),
        "provider_id".to_string(),
        "message_id".to_string(),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RolloutBucket {
    pub kid: String,
    /// Width of this bucket's range, 0-100.
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveKidRolloutPolicy {
    pub buckets: Vec<RolloutBucket>,
    #[serde(default)]
    pub seed: String,
    #[serde(default = "default_sticky_fields")]
    pub sticky_fields: Vec<String>,
    #[serde(default)]
    pub default_kid: Option<String>,
}

impl ActiveKidRolloutPolicy {
    pub fn new(buckets: Vec<RolloutBucket>) -> Self {
        Self {
            buckets,
            seed: String::new(),
            sticky_fields: default_sticky_fields(),
            default_kid: None,
        }
    }

    pub fn with_seed(mut self, seed: impl Into<String>) -> Self {
        self.seed = seed.into();
        self
    }

    pub fn with_default_kid(mut self, kid: impl Into<String>) -> Self {
        self.default_kid = Some(kid.into());
        self
    }

    pub fn with_sticky_fields(mut self, fields: Vec<String>) -> Self {
        self.sticky_fields = fields;
        self
    }
}

/// 32-bit FNV-1a over the UTF-8 bytes of `input`.
pub fn fnv1a32(input: &str) -> u32 {
    input.bytes().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u32::from(byte)).wrapping_mul(FNV_PRIME)
    })
}

/// Sticky 0-99 percentile for `ctx`: `fnv1a32("{seed}:{v1|v2|...}") % 100`,
/// with missing sticky fields contributing an empty string.
pub fn rollout_percentile(policy: &ActiveKidRolloutPolicy, ctx: &KeyResolutionContext) -> u32 {
    let values = policy
        .sticky_fields
        .iter()
        .map(|field| ctx.get(field).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("|");
    fnv1a32(&format!("{}:{values}", policy.seed)) % 100
}

/// Walks the buckets, summing their widths, and returns the first bucket whose
/// cumulative range contains `percentile`. Falls through to the policy's
/// default kid.
pub fn select_rollout_kid(policy: &ActiveKidRolloutPolicy, percentile: u32) -> Option<String> {
    let mut cumulative = 0.0_f64;
    for bucket in &policy.buckets {
        let kid = bucket.kid.trim();
        if kid.is_empty() || !bucket.percentage.is_finite() {
            continue;
        }
        cumulative += bucket.percentage.clamp(0.0, 100.0);
        if f64::from(percentile) < cumulative {
            return Some(kid.to_string());
        }
    }
    policy
        .default_kid
        .as_deref()
        .map(str::trim)
        .filter(|kid| !kid.is_empty())
        .map(str::to_string)
}

/// Every kid the policy can hand out.
pub fn get_rollout_known_kids(policy: &ActiveKidRolloutPolicy) -> Vec<String> {
    merge_kids(
        policy
            .buckets
            .iter()
            .map(|b| b.kid.as_str())
            .chain(policy.default_kid.as_deref()),
    )
}

/// Wraps a base resolver and picks the encrypt kid by sticky rollout bucket.
pub struct RollingKeyResolver {
    base: Arc<dyn KeyResolver>,
    policy: ActiveKidRolloutPolicy,
}

impl RollingKeyResolver {
    pub fn new(base: Arc<dyn KeyResolver>, policy: ActiveKidRolloutPolicy) -> Self {
        Self { base, policy }
    }

    pub fn policy(&self) -> &ActiveKidRolloutPolicy {
        &self.policy
    }
}

#[async_trait]
impl KeyResolver for RollingKeyResolver {
    async fn resolve_encrypt_key(
        &self,
        ctx: &KeyResolutionContext,
    ) -> Result<ResolvedKey, FieldCryptoError> {
        let percentile = rollout_percentile(&self.policy, ctx);
        match select_rollout_kid(&self.policy, percentile) {
            Some(kid) => {
                trace!(percentile, kid = %kid, "rollout selected kid");
                Ok(ResolvedKey { kid })
            }
            None => self.base.resolve_encrypt_key(ctx).await,
        }
    }

    /// Union of the selected kid, the base resolver's keys and every kid the
    /// policy names, so data written at any rollout stage stays readable.
    async fn resolve_decrypt_keys(
        &self,
        ctx: &KeyResolutionContext,
    ) -> Result<Vec<String>, FieldCryptoError> {
        let selected = self.resolve_encrypt_key(ctx).await?.kid;
        let base_active = self.base.resolve_encrypt_key(ctx).await?.kid;
        let base_kids = self.base.resolve_decrypt_keys(ctx).await?;
        let known = get_rollout_known_kids(&self.policy);
        Ok(merge_kids(
            std::iter::once(selected.as_str())
                .chain(std::iter::once(base_active.as_str()))
                .chain(base_kids.iter().map(String::as_str))
                .chain(known.iter().map(String::as_str)),
        ))
    }
}
