//! JSON-schema validation seam.
//!
//! The validation engine itself is a black box (`jsonschema`); this module
//! pins down the two contracts the core relies on: schemas compile once at
//! assembly time, and validation failures surface as the `InvalidInput`
//! domain error so the route error boundary can turn them into structured
//! 400 responses.

use crate::error::{BizError, Result};
use jsonschema::Validator;
use serde_json::Value;

/// Compile a schema for repeated use. A malformed schema is an assembly-time
/// failure.
pub fn compile_schema(schema: &Value) -> anyhow::Result<Validator> {
    jsonschema::validator_for(schema)
        .map_err(|e| anyhow::anyhow!("invalid schema: {e}"))
}

/// Validate against a precompiled schema.
pub fn validate_compiled(validator: &Validator, value: &Value) -> std::result::Result<(), BizError> {
    validator
        .validate(value)
        .map_err(|e| BizError::invalid_input(e.to_string()))
}

/// One-shot validation; returns the value unchanged when it conforms.
pub fn validate(value: &Value, schema: &Value) -> Result<Value> {
    let validator = compile_schema(schema)?;
    validate_compiled(&validator, value)?;
    Ok(value.clone())
}
