use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use extras_kernel_core::{
    build_requirements, project_context, project_environment, verify_and_sort, ExtrasSpec,
    OutputMode, Requirement, CONTEXT_KEY_ENVIRONMENT,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const FUNCTION_CONTRACT_VERSION: &str = "function.v1";

/// One invocation's snapshot. `extra_resources` is absent on the first phase
/// of the protocol and carries the resolver's raw matches on the second; the
/// caller correlates the two phases by re-submitting the same `input`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RunRequest {
    pub input: ExtrasSpec,
    /// The target composite document label values are resolved against.
    pub composite: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_resources: Option<BTreeMap<String, Vec<Value>>>,
}

/// Requirements are present on every response; the updated context only once
/// raw matches were supplied and projected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunResponse {
    pub requirements: BTreeMap<String, Requirement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Map<String, Value>>,
}

/// The extras function. Stateless; every run recomputes from the request
/// snapshot alone, so concurrent runs need no coordination.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtrasFunction;

impl ExtrasFunction {
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Run one invocation of the two-phase protocol.
    ///
    /// Requirements are always built first, wholly, regardless of phase.
    /// Without raw matches the response stops there; with them the matches
    /// are verified, sorted, and projected into the configured context slot.
    ///
    /// # Errors
    /// Returns an error when requirement building, verification, or
    /// projection fails, or when the existing environment slot holds a
    /// non-object value. Every error is terminal for the invocation.
    pub fn run(&self, request: &RunRequest) -> Result<RunResponse> {
        tracing::info!(
            sources = request.input.extra_resources.len(),
            "resolving extra resource requirements"
        );

        let requirements = build_requirements(&request.input, &request.composite)
            .context("cannot build extra resource requirements")?;

        // The caller does not tell us whether we already asked; the presence
        // of raw matches is the phase marker.
        let Some(raw) = &request.extra_resources else {
            tracing::debug!("no extra resources supplied yet; answering with requirements only");
            return Ok(RunResponse { requirements, context: None });
        };

        let verified = verify_and_sort(&request.input, raw)
            .context("cannot verify and sort extra resources")?;

        let mut context = request.context.clone().unwrap_or_default();
        match request.input.output.mode {
            OutputMode::Context => {
                let document = project_context(&verified)
                    .context("cannot project extra resources into the context document")?;
                context.insert(request.input.output.context_slot().to_string(), document);
            }
            OutputMode::Environment => {
                let existing = match context.get(CONTEXT_KEY_ENVIRONMENT) {
                    None => None,
                    Some(Value::Object(map)) => Some(map),
                    Some(other) => bail!(
                        "existing environment at context key {CONTEXT_KEY_ENVIRONMENT:?} \
                         is not an object: {other}"
                    ),
                };
                let document = project_environment(&verified, existing)
                    .context("cannot merge extra resources into the environment")?;
                context.insert(CONTEXT_KEY_ENVIRONMENT.to_string(), document);
            }
        }

        Ok(RunResponse { requirements, context: Some(context) })
    }
}
