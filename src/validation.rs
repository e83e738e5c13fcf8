//! # Record Validation and Selection
//!
//! Value records are namespaced by the first segment of their key
//! (`/<namespace>/<rest>`). Each namespace has one validator, which accepts
//! or rejects a `(key, value)` pair, and one selector, which picks the best
//! among several candidate values for the same key.
//!
//! | Namespace | Validator | Selector |
//! |-----------|-----------|----------|
//! | `pk` | [`validate_public_key_record`] | [`select_first`] |
//!
//! A key without a namespace, or with a namespace that has no validator, is
//! rejected with `InvalidParameters`. Validation failures are terminal.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::DhtError;
use crate::identity::{sha256_multihash, PublicKey};
use crate::messages::Record;

pub const PUBLIC_KEY_NAMESPACE: &str = "pk";

/// Literal key prefix of public-key records.
pub const PUBLIC_KEY_PREFIX: &[u8] = b"/pk/";

pub type ValidatorFn = Arc<dyn Fn(&[u8], &[u8]) -> Result<(), DhtError> + Send + Sync>;

/// Returns the index of the preferred value.
pub type SelectorFn = Arc<dyn Fn(&[u8], &[Vec<u8>]) -> usize + Send + Sync>;

#[derive(Clone, Default)]
pub struct Validators(HashMap<String, ValidatorFn>);

#[derive(Clone, Default)]
pub struct Selectors(HashMap<String, SelectorFn>);

impl Validators {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, namespace: impl Into<String>, validator: ValidatorFn) {
        self.0.insert(namespace.into(), validator);
    }

    pub fn get(&self, namespace: &str) -> Option<&ValidatorFn> {
        self.0.get(namespace)
    }
}

impl Selectors {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, namespace: impl Into<String>, selector: SelectorFn) {
        self.0.insert(namespace.into(), selector);
    }

    pub fn get(&self, namespace: &str) -> Option<&SelectorFn> {
        self.0.get(namespace)
    }
}

/// Validators with the built-in `pk` namespace registered.
pub fn default_validators() -> Validators {
    let mut validators = Validators::empty();
    validators.insert(PUBLIC_KEY_NAMESPACE, Arc::new(validate_public_key_record));
    validators
}

pub fn default_selectors() -> Selectors {
    let mut selectors = Selectors::empty();
    selectors.insert(PUBLIC_KEY_NAMESPACE, Arc::new(select_first));
    selectors
}

/// `/ns/rest...` -> `ns`. Requires at least three `/`-separated parts.
fn namespace(key: &[u8]) -> Option<String> {
    let mut parts = key.split(|b| *b == b'/');
    let leading = parts.next()?;
    let ns = parts.next()?;
    parts.next()?;
    if !leading.is_empty() || ns.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(ns).into_owned())
}

pub fn verify_record(validators: &Validators, record: &Record) -> Result<(), DhtError> {
    let ns = namespace(&record.key)
        .ok_or_else(|| DhtError::invalid_parameters("record key has no namespace"))?;
    let validator = validators
        .get(&ns)
        .ok_or_else(|| DhtError::invalid_parameters(format!("no validator for namespace \"{ns}\"")))?;
    validator(&record.key, &record.value)
}

/// Index of the best of `records` (values for `key`).
pub fn best_record(selectors: &Selectors, key: &[u8], records: &[Vec<u8>]) -> Result<usize, DhtError> {
    if records.is_empty() {
        return Err(DhtError::invalid_parameters("no records given"));
    }
    let ns = namespace(key).ok_or_else(|| DhtError::invalid_parameters("record key has no namespace"))?;
    let selector = selectors
        .get(&ns)
        .ok_or_else(|| DhtError::invalid_parameters(format!("no selector for namespace \"{ns}\"")))?;
    if records.len() == 1 {
        return Ok(0);
    }
    let idx = selector(key, records);
    if idx >= records.len() {
        return Err(DhtError::invalid_parameters("selector returned out-of-range index"));
    }
    Ok(idx)
}

/// Accepts iff `key == "/pk/" ++ sha256-multihash(value)` and `value`
/// decodes as a public key.
pub fn validate_public_key_record(key: &[u8], value: &[u8]) -> Result<(), DhtError> {
    if key.len() <= PUBLIC_KEY_PREFIX.len() {
        return Err(DhtError::invalid_parameters("invalid public key record"));
    }
    if !key.starts_with(PUBLIC_KEY_PREFIX) {
        return Err(DhtError::invalid_parameters("key was not prefixed with /pk/"));
    }
    PublicKey::decode(value).map_err(DhtError::invalid_parameters)?;
    if key[PUBLIC_KEY_PREFIX.len()..] != sha256_multihash(value)[..] {
        return Err(DhtError::invalid_parameters("public key does not match passed in key"));
    }
    Ok(())
}

/// Public keys are immutable; every valid candidate is equally good.
pub fn select_first(_key: &[u8], _records: &[Vec<u8>]) -> usize {
    0
}

/// `/pk/<peer id>` key for a peer's public key record.
pub fn public_key_record_key(peer_id_bytes: &[u8]) -> Vec<u8> {
    let mut key = PUBLIC_KEY_PREFIX.to_vec();
    key.extend_from_slice(peer_id_bytes);
    key
}
