// Field-level protection for stored message data: the envelope format and
// provider contract, key resolution and rollout, the policy that decides what
// each field stores, and the backfill that migrates existing rows.

pub mod crypto_services;
pub mod envelope;
pub mod field_crypto;
pub mod key_resolver;
pub mod mask;
pub mod migration;
pub mod policy;
pub mod provider;
pub mod rollout;
