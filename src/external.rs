//! Seams to the module systems on both ends of the wire.
//!
//! The encoder asks a [`ReferenceConfig`] how to describe a client reference
//! in an import row; the decoder asks a [`ModuleResolver`] to turn that
//! description back into a [`ClientReference`]. The defaults agree on the
//! metadata `[id, name]`, or `[id, name, 1]` for asynchronous modules.

use crate::error::{FlightError, Result};
use crate::graph::ClientReference;
use serde_json::{Value as Json, json};

/// Describes client references for the import rows of a request.
pub trait ReferenceConfig {
    /// The JSON metadata written in the reference's `I` row.
    fn client_metadata(&self, reference: &ClientReference) -> Result<Json>;
}

/// Writes `[id, name]` or `[id, name, 1]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultReferenceConfig;

impl ReferenceConfig for DefaultReferenceConfig {
    fn client_metadata(&self, reference: &ClientReference) -> Result<Json> {
        Ok(if reference.is_async {
            json!([reference.id, reference.name, 1])
        } else {
            json!([reference.id, reference.name])
        })
    }
}

impl<F> ReferenceConfig for F
where
    F: Fn(&ClientReference) -> Result<Json>,
{
    fn client_metadata(&self, reference: &ClientReference) -> Result<Json> {
        self(reference)
    }
}

/// Resolves import metadata on the decoding side.
pub trait ModuleResolver {
    /// Turns the payload of an `I` row into a reference.
    fn resolve(&self, metadata: &Json) -> Result<ClientReference>;
}

/// Reads `[id, name]` or `[id, name, 1]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultModuleResolver;

impl ModuleResolver for DefaultModuleResolver {
    fn resolve(&self, metadata: &Json) -> Result<ClientReference> {
        let parts = metadata
            .as_array()
            .ok_or_else(|| FlightError::Format(format!("import metadata {metadata} is not an array")))?;
        let text = |index: usize| {
            parts
                .get(index)
                .and_then(Json::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    FlightError::Format(format!("import metadata {metadata} lacks field {index}"))
                })
        };
        let mut reference = ClientReference::new(text(0)?, text(1)?);
        reference.is_async = parts.get(2).and_then(Json::as_u64) == Some(1);
        Ok(reference)
    }
}

impl<F> ModuleResolver for F
where
    F: Fn(&Json) -> Result<ClientReference>,
{
    fn resolve(&self, metadata: &Json) -> Result<ClientReference> {
        self(metadata)
    }
}
