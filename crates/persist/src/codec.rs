//! Composite request keys.
//!
//! Watch notifications only carry a namespace and a name, so the owning id
//! travels inside the name as `<id>.<name>`.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::{Error, Result};

pub const SEPARATOR: char = '.';

pub fn encode(id: &str, name: &str) -> String {
    format!("{}{}{}", id, SEPARATOR, name)
}

/// Splits a composite key on the first separator. Object names may contain
/// the separator, ids may not.
pub fn decode(composite: &str) -> Result<(String, String)> {
    match composite.split_once(SEPARATOR) {
        Some((id, name)) => Ok((id.to_string(), name.to_string())),
        None => Err(Error::MalformedKey(format!(
            "{} does not contain separator '{}'",
            composite, SEPARATOR
        ))),
    }
}

pub fn encode_object(meta: &ObjectMeta) -> String {
    encode(
        meta.uid.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default(),
    )
}
