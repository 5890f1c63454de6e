//! State document exchanged with the observer and kept on storage.
//!
//! The document is an ordered tree of string keys. Its fields belong to the host
//! application; the only field this crate writes itself is [`ADDRESS_FIELD`],
//! which carries the current device address on every outbound broadcast.

use anyhow::{Context, Result, bail, ensure};
use serde_json::{Map, Value};
use std::net::IpAddr;

/// Reserved field holding the device address in broadcast documents.
pub const ADDRESS_FIELD: &str = "ip";

#[derive(Clone, Debug, Default, PartialEq)]
pub struct StateDocument(Map<String, Value>);

impl StateDocument {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a serialized document, rejecting input larger than `budget` bytes
    ///
    /// # Arguments
    /// * `bytes` - Serialized JSON object
    /// * `budget` - Upper bound of the serialized size in bytes
    ///
    /// # Returns
    /// The parsed document, or an error if the input is oversized, malformed
    /// or not a JSON object
    pub fn parse(bytes: &[u8], budget: usize) -> Result<Self> {
        ensure!(
            bytes.len() <= budget,
            "document of {} bytes exceeds budget of {budget} bytes",
            bytes.len()
        );

        let value: Value =
            serde_json::from_slice(bytes).context("failed to parse state document")?;

        let Value::Object(fields) = value else {
            bail!("state document is not an object");
        };

        Ok(Self(fields))
    }

    /// Compact serialization used for persistence
    pub fn to_json(&self, budget: usize) -> Result<String> {
        let json = serde_json::to_string(&self.0).context("failed to serialize state document")?;
        Self::check_budget(json, budget)
    }

    /// Pretty serialization used for broadcasts
    ///
    /// Indentation is not part of the budget; callers bound the compact form.
    pub fn to_pretty_json(&self) -> Result<String> {
        serde_json::to_string_pretty(&self.0).context("failed to serialize state document")
    }

    fn check_budget(json: String, budget: usize) -> Result<String> {
        ensure!(
            json.len() <= budget,
            "serialized document of {} bytes exceeds budget of {budget} bytes",
            json.len()
        );
        Ok(json)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    /// Remove a field while keeping the order of the remaining ones
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        let value = self.0.get(key).cloned();
        self.0.retain(|k, _| k != key);
        value
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn address(&self) -> Option<&str> {
        self.0.get(ADDRESS_FIELD).and_then(Value::as_str)
    }

    pub fn set_address(&mut self, address: IpAddr) {
        self.0
            .insert(ADDRESS_FIELD.to_string(), Value::String(address.to_string()));
    }

    pub fn strip_address(&mut self) {
        self.remove(ADDRESS_FIELD);
    }
}

impl From<Map<String, Value>> for StateDocument {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}
