//! Cache key derivation.
//!
//! A [`CacheKey`] is `"<operation>:<digest>"`. The operation name stays a
//! literal prefix so that every entry of a logical query can be invalidated
//! without a reverse index; the digest is a fixed-length BLAKE3 hash of the
//! operation and its canonically serialized parameters.

use std::fmt;
use std::marker::PhantomData;

use serde::{ser, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::FreshnessPolicy;
use crate::error::KeyError;

/// Separator between the operation prefix and the digest.
pub const KEY_SEPARATOR: char = ':';

/// Number of digest bytes kept in a key (hex encoded to twice this length).
const DIGEST_BYTES: usize = 16;

/// Opaque identifier of one cached result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap a pre-built key string.
    ///
    /// The operation of a raw key is everything before the first `:`, or the
    /// whole string when it has no separator.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The invalidation tag of this key.
    pub fn operation(&self) -> &str {
        match self.0.find(KEY_SEPARATOR) {
            Some(idx) => &self.0[..idx],
            None => &self.0,
        }
    }

    /// Check whether this key belongs to the given operation.
    pub fn belongs_to(&self, operation: &str) -> bool {
        self.operation() == operation
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for CacheKey {
    fn from(raw: &str) -> Self {
        Self::from_raw(raw)
    }
}

impl From<String> for CacheKey {
    fn from(raw: String) -> Self {
        Self::from_raw(raw)
    }
}

/// Derive a stable cache key from an operation name and its parameters.
///
/// `params` must serialize to a JSON object (or to null / unit, meaning no
/// parameters). Object keys are sorted at every nesting level before hashing,
/// so parameter maps that are equal up to insertion order collapse to the
/// same key.
pub fn derive_key<P>(operation: &str, params: &P) -> Result<CacheKey, KeyError>
where
    P: Serialize + ?Sized,
{
    validate_operation(operation)?;
    let canonical = canonical_params(operation, params)?;
    Ok(key_from_canonical(operation, &canonical))
}

/// Canonical JSON form of a parameter object.
pub fn canonical_params<P>(operation: &str, params: &P) -> Result<String, KeyError>
where
    P: Serialize + ?Sized,
{
    // serde_json writes NaN and infinities as null, which would collide
    // with a real null parameter.
    params
        .serialize(FloatCheck)
        .map_err(|e| KeyError::UnserializableParameter {
            operation: operation.to_string(),
            reason: e.to_string(),
        })?;

    let value = serde_json::to_value(params).map_err(|e| KeyError::UnserializableParameter {
        operation: operation.to_string(),
        reason: e.to_string(),
    })?;

    let value = match value {
        Value::Null => Value::Object(Map::new()),
        Value::Object(_) => canonicalize(value),
        other => {
            return Err(KeyError::UnserializableParameter {
                operation: operation.to_string(),
                reason: format!("parameters must be a map, got {}", json_kind(&other)),
            })
        }
    };

    serde_json::to_string(&value).map_err(|e| KeyError::UnserializableParameter {
        operation: operation.to_string(),
        reason: e.to_string(),
    })
}

fn validate_operation(operation: &str) -> Result<(), KeyError> {
    if operation.is_empty() {
        return Err(KeyError::EmptyOperation);
    }
    if operation.contains(KEY_SEPARATOR) {
        return Err(KeyError::InvalidOperation {
            operation: operation.to_string(),
            reason: format!("must not contain '{}'", KEY_SEPARATOR),
        });
    }
    Ok(())
}

fn key_from_canonical(operation: &str, canonical: &str) -> CacheKey {
    let mut hasher = blake3::Hasher::new();
    hasher.update(operation.as_bytes());
    hasher.update(&[KEY_SEPARATOR as u8]);
    hasher.update(canonical.as_bytes());
    let digest = hasher.finalize();

    CacheKey(format!(
        "{}{}{}",
        operation,
        KEY_SEPARATOR,
        hex::encode(&digest.as_bytes()[..DIGEST_BYTES])
    ))
}

/// Rebuild every object with lexicographically sorted keys.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ============================================================================
// FLOAT CHECK
// ============================================================================

#[derive(Debug)]
struct FloatCheckError(String);

impl fmt::Display for FloatCheckError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for FloatCheckError {}

impl ser::Error for FloatCheckError {
    fn custom<M: fmt::Display>(msg: M) -> Self {
        Self(msg.to_string())
    }
}

/// Serializer that only walks a value and fails on NaN or infinity.
struct FloatCheck;

impl FloatCheck {
    fn finite(v: f64) -> Result<(), FloatCheckError> {
        if v.is_finite() {
            Ok(())
        } else {
            Err(FloatCheckError(format!(
                "non-finite float {} cannot be part of a key",
                v
            )))
        }
    }
}

impl ser::Serializer for FloatCheck {
    type Ok = ();
    type Error = FloatCheckError;
    type SerializeSeq = Self;
    type SerializeTuple = Self;
    type SerializeTupleStruct = Self;
    type SerializeTupleVariant = Self;
    type SerializeMap = Self;
    type SerializeStruct = Self;
    type SerializeStructVariant = Self;

    fn serialize_bool(self, _v: bool) -> Result<(), FloatCheckError> {
        Ok(())
    }
    fn serialize_i8(self, _v: i8) -> Result<(), FloatCheckError> {
        Ok(())
    }
    fn serialize_i16(self, _v: i16) -> Result<(), FloatCheckError> {
        Ok(())
    }
    fn serialize_i32(self, _v: i32) -> Result<(), FloatCheckError> {
        Ok(())
    }
    fn serialize_i64(self, _v: i64) -> Result<(), FloatCheckError> {
        Ok(())
    }
    fn serialize_i128(self, _v: i128) -> Result<(), FloatCheckError> {
        Ok(())
    }
    fn serialize_u8(self, _v: u8) -> Result<(), FloatCheckError> {
        Ok(())
    }
    fn serialize_u16(self, _v: u16) -> Result<(), FloatCheckError> {
        Ok(())
    }
    fn serialize_u32(self, _v: u32) -> Result<(), FloatCheckError> {
        Ok(())
    }
    fn serialize_u64(self, _v: u64) -> Result<(), FloatCheckError> {
        Ok(())
    }
    fn serialize_u128(self, _v: u128) -> Result<(), FloatCheckError> {
        Ok(())
    }
    fn serialize_f32(self, v: f32) -> Result<(), FloatCheckError> {
        Self::finite(f64::from(v))
    }
    fn serialize_f64(self, v: f64) -> Result<(), FloatCheckError> {
        Self::finite(v)
    }
    fn serialize_char(self, _v: char) -> Result<(), FloatCheckError> {
        Ok(())
    }
    fn serialize_str(self, _v: &str) -> Result<(), FloatCheckError> {
        Ok(())
    }
    fn serialize_bytes(self, _v: &[u8]) -> Result<(), FloatCheckError> {
        Ok(())
    }
    fn serialize_none(self) -> Result<(), FloatCheckError> {
        Ok(())
    }
    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<(), FloatCheckError> {
        value.serialize(self)
    }
    fn serialize_unit(self) -> Result<(), FloatCheckError> {
        Ok(())
    }
    fn serialize_unit_struct(self, _name: &'static str) -> Result<(), FloatCheckError> {
        Ok(())
    }
    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
    ) -> Result<(), FloatCheckError> {
        Ok(())
    }
    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<(), FloatCheckError> {
        value.serialize(self)
    }
    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        value: &T,
    ) -> Result<(), FloatCheckError> {
        value.serialize(self)
    }
    fn serialize_seq(self, _len: Option<usize>) -> Result<Self, FloatCheckError> {
        Ok(self)
    }
    fn serialize_tuple(self, _len: usize) -> Result<Self, FloatCheckError> {
        Ok(self)
    }
    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self, FloatCheckError> {
        Ok(self)
    }
    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self, FloatCheckError> {
        Ok(self)
    }
    fn serialize_map(self, _len: Option<usize>) -> Result<Self, FloatCheckError> {
        Ok(self)
    }
    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self, FloatCheckError> {
        Ok(self)
    }
    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self, FloatCheckError> {
        Ok(self)
    }
}

impl ser::SerializeSeq for FloatCheck {
    type Ok = ();
    type Error = FloatCheckError;
    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), FloatCheckError> {
        value.serialize(FloatCheck)
    }
    fn end(self) -> Result<(), FloatCheckError> {
        Ok(())
    }
}

impl ser::SerializeTuple for FloatCheck {
    type Ok = ();
    type Error = FloatCheckError;
    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), FloatCheckError> {
        value.serialize(FloatCheck)
    }
    fn end(self) -> Result<(), FloatCheckError> {
        Ok(())
    }
}

impl ser::SerializeTupleStruct for FloatCheck {
    type Ok = ();
    type Error = FloatCheckError;
    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), FloatCheckError> {
        value.serialize(FloatCheck)
    }
    fn end(self) -> Result<(), FloatCheckError> {
        Ok(())
    }
}

impl ser::SerializeTupleVariant for FloatCheck {
    type Ok = ();
    type Error = FloatCheckError;
    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), FloatCheckError> {
        value.serialize(FloatCheck)
    }
    fn end(self) -> Result<(), FloatCheckError> {
        Ok(())
    }
}

impl ser::SerializeMap for FloatCheck {
    type Ok = ();
    type Error = FloatCheckError;
    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), FloatCheckError> {
        key.serialize(FloatCheck)
    }
    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), FloatCheckError> {
        value.serialize(FloatCheck)
    }
    fn end(self) -> Result<(), FloatCheckError> {
        Ok(())
    }
}

impl ser::SerializeStruct for FloatCheck {
    type Ok = ();
    type Error = FloatCheckError;
    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> Result<(), FloatCheckError> {
        value.serialize(FloatCheck)
    }
    fn end(self) -> Result<(), FloatCheckError> {
        Ok(())
    }
}

impl ser::SerializeStructVariant for FloatCheck {
    type Ok = ();
    type Error = FloatCheckError;
    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        _key: &'static str,
        value: &T,
    ) -> Result<(), FloatCheckError> {
        value.serialize(FloatCheck)
    }
    fn end(self) -> Result<(), FloatCheckError> {
        Ok(())
    }
}

// ============================================================================
// KEY SPACES
// ============================================================================

/// A statically typed logical query.
///
/// Binds an operation name to the payload type it caches and to the
/// freshness policy its call sites use, so a service declares
/// `KeySpace::<Vec<Wallet>>::new("fetchWallets", policy)` once and every
/// resolve through it is typed.
pub struct KeySpace<T> {
    operation: String,
    policy: FreshnessPolicy,
    _payload: PhantomData<fn() -> T>,
}

impl<T> KeySpace<T> {
    pub fn new(operation: impl Into<String>, policy: FreshnessPolicy) -> Result<Self, KeyError> {
        let operation = operation.into();
        validate_operation(&operation)?;
        Ok(Self {
            operation,
            policy,
            _payload: PhantomData,
        })
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn policy(&self) -> FreshnessPolicy {
        self.policy
    }

    /// Replace the freshness policy.
    pub fn with_policy(mut self, policy: FreshnessPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Derive the key for one parameter combination.
    pub fn key<P>(&self, params: &P) -> Result<CacheKey, KeyError>
    where
        P: Serialize + ?Sized,
    {
        let canonical = canonical_params(&self.operation, params)?;
        Ok(key_from_canonical(&self.operation, &canonical))
    }

    /// Key for a query that takes no parameters.
    pub fn unit_key(&self) -> CacheKey {
        key_from_canonical(&self.operation, "{}")
    }
}

impl<T> Clone for KeySpace<T> {
    fn clone(&self) -> Self {
        Self {
            operation: self.operation.clone(),
            policy: self.policy,
            _payload: PhantomData,
        }
    }
}

impl<T> fmt::Debug for KeySpace<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySpace")
            .field("operation", &self.operation)
            .field("policy", &self.policy)
            .field("payload", &std::any::type_name::<T>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::{BTreeMap, HashMap};
    use std::time::Duration;

    #[derive(Serialize)]
    struct WalletParams {
        include_inactive: bool,
        currency: Option<String>,
    }

    #[test]
    fn test_operation_is_literal_prefix() {
        let key = derive_key("fetchWallets", &json!({"includeInactive": false})).unwrap();
        assert!(key.as_str().starts_with("fetchWallets:"));
        assert_eq!(key.operation(), "fetchWallets");
        assert_eq!(key.as_str().len(), "fetchWallets:".len() + DIGEST_BYTES * 2);
    }

    #[test]
    fn test_nested_key_order_does_not_matter() {
        let a = json!({"a": 1, "b": {"x": [1, 2], "y": {"p": true, "q": null}}});
        let b = json!({"b": {"y": {"q": null, "p": true}, "x": [1, 2]}, "a": 1});
        assert_eq!(
            derive_key("op", &a).unwrap(),
            derive_key("op", &b).unwrap()
        );
    }

    #[test]
    fn test_hashmap_and_struct_params_agree() {
        let mut map = HashMap::new();
        map.insert("include_inactive", json!(true));
        map.insert("currency", json!("EUR"));

        let params = WalletParams {
            include_inactive: true,
            currency: Some("EUR".to_string()),
        };

        assert_eq!(
            derive_key("fetchWallets", &map).unwrap(),
            derive_key("fetchWallets", &params).unwrap()
        );
    }

    #[test]
    fn test_array_order_matters() {
        let a = derive_key("op", &json!({"ids": [1, 2]})).unwrap();
        let b = derive_key("op", &json!({"ids": [2, 1]})).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_different_operations_different_keys() {
        let params = json!({"id": 7});
        let a = derive_key("fetchWallets", &params).unwrap();
        let b = derive_key("fetchCategories", &params).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_unit_and_empty_map_agree() {
        let unit = derive_key("fetchDefaultWallet", &()).unwrap();
        let empty = derive_key("fetchDefaultWallet", &json!({})).unwrap();
        assert_eq!(unit, empty);
    }

    #[test]
    fn test_empty_operation_rejected() {
        assert_eq!(derive_key("", &()), Err(KeyError::EmptyOperation));
    }

    #[test]
    fn test_operation_with_separator_rejected() {
        let err = derive_key("wallets:list", &()).unwrap_err();
        assert!(matches!(err, KeyError::InvalidOperation { .. }));
    }

    #[test]
    fn test_non_map_params_rejected() {
        let err = derive_key("op", &vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, KeyError::UnserializableParameter { .. }));

        let err = derive_key("op", &42).unwrap_err();
        assert!(matches!(err, KeyError::UnserializableParameter { .. }));
    }

    #[test]
    fn test_non_string_map_keys_rejected() {
        let mut params: BTreeMap<Vec<u8>, i32> = BTreeMap::new();
        params.insert(vec![1, 2], 3);
        let err = derive_key("op", &params).unwrap_err();
        match err {
            KeyError::UnserializableParameter { operation, .. } => assert_eq!(operation, "op"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_nan_param_rejected() {
        let err = derive_key("fetchBalance", &HashMap::from([("min", f64::NAN)])).unwrap_err();
        assert!(matches!(err, KeyError::UnserializableParameter { .. }));
    }

    #[test]
    fn test_infinite_params_rejected() {
        for v in [f64::INFINITY, f64::NEG_INFINITY] {
            let err = derive_key("fetchBalance", &HashMap::from([("min", v)])).unwrap_err();
            assert!(matches!(err, KeyError::UnserializableParameter { .. }));
        }
        let err = derive_key("fetchBalance", &HashMap::from([("min", f32::INFINITY)])).unwrap_err();
        assert!(matches!(err, KeyError::UnserializableParameter { .. }));
    }

    #[test]
    fn test_nested_nan_rejected() {
        #[derive(Serialize)]
        struct Range {
            bounds: Vec<f64>,
        }
        let mut params = BTreeMap::new();
        params.insert("range", Range { bounds: vec![1.0, f64::NAN] });
        assert!(derive_key("fetchTransactions", &params).is_err());
    }

    #[test]
    fn test_nan_does_not_collide_with_null() {
        let null = derive_key("fetchBalance", &json!({"min": null})).unwrap();
        let none: HashMap<&str, Option<f64>> = HashMap::from([("min", None)]);
        assert_eq!(derive_key("fetchBalance", &none).unwrap(), null);
        assert!(derive_key("fetchBalance", &HashMap::from([("min", f64::NAN)])).is_err());
        assert!(derive_key("fetchBalance", &HashMap::from([("min", 1.5f64)])).is_ok());
    }

    #[test]
    fn test_canonical_params_sorted() {
        let canonical = canonical_params("op", &json!({"b": 2, "a": {"d": 1, "c": 0}})).unwrap();
        assert_eq!(canonical, r#"{"a":{"c":0,"d":1},"b":2}"#);
    }

    #[test]
    fn test_raw_key_operation() {
        assert_eq!(CacheKey::from_raw("op:a").operation(), "op");
        assert_eq!(CacheKey::from("wallets:{}").operation(), "wallets");
        assert_eq!(CacheKey::from_raw("bare").operation(), "bare");
        assert!(CacheKey::from_raw("op:a").belongs_to("op"));
        assert!(!CacheKey::from_raw("ops:a").belongs_to("op"));
    }

    #[test]
    fn test_key_space_matches_derive_key() {
        let policy =
            FreshnessPolicy::new(Duration::from_secs(3600), Duration::from_secs(1800)).unwrap();
        let space: KeySpace<Vec<String>> = KeySpace::new("fetchCategories", policy).unwrap();
        let params = json!({"type": "expense"});

        assert_eq!(
            space.key(&params).unwrap(),
            derive_key("fetchCategories", &params).unwrap()
        );
        assert_eq!(space.unit_key(), derive_key("fetchCategories", &()).unwrap());
        assert_eq!(space.policy(), policy);
    }

    #[test]
    fn test_key_space_rejects_bad_operation() {
        let policy = FreshnessPolicy::default();
        assert!(KeySpace::<()>::new("", policy).is_err());
        assert!(KeySpace::<()>::new("a:b", policy).is_err());
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn operation_strategy() -> impl Strategy<Value = String> {
        "[a-zA-Z][a-zA-Z0-9_]{0,24}"
    }

    fn params_strategy() -> impl Strategy<Value = BTreeMap<String, i64>> {
        prop::collection::btree_map("[a-z]{1,8}", any::<i64>(), 0..8)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        /// Insertion order of a parameter map never changes the key.
        #[test]
        fn prop_key_is_order_independent(
            operation in operation_strategy(),
            params in params_strategy(),
        ) {
            let mut forward = Map::new();
            for (k, v) in params.iter() {
                forward.insert(k.clone(), Value::from(*v));
            }
            let mut backward = Map::new();
            for (k, v) in params.iter().rev() {
                backward.insert(k.clone(), Value::from(*v));
            }

            prop_assert_eq!(
                derive_key(&operation, &Value::Object(forward)).unwrap(),
                derive_key(&operation, &Value::Object(backward)).unwrap()
            );
        }

        /// Different parameter maps produce different keys.
        #[test]
        fn prop_key_discriminates_params(
            operation in operation_strategy(),
            p1 in params_strategy(),
            p2 in params_strategy(),
        ) {
            let k1 = derive_key(&operation, &p1).unwrap();
            let k2 = derive_key(&operation, &p2).unwrap();
            if p1 == p2 {
                prop_assert_eq!(k1, k2);
            } else {
                prop_assert_ne!(k1, k2);
            }
        }

        /// The operation survives as the key's invalidation tag.
        #[test]
        fn prop_operation_is_recoverable(
            operation in operation_strategy(),
            params in params_strategy(),
        ) {
            let key = derive_key(&operation, &params).unwrap();
            prop_assert_eq!(key.operation(), operation.as_str());
        }
    }
}
