//! Action Registry & Invocation Protocol (C4).
//!
//! Where the source derives JSON-Schema from Python function signatures at
//! call time, this registry derives it once, at registration time, from a
//! plain Rust parameter struct that implements [`schemars::JsonSchema`].
//! Handlers are [`ActionHandler`] implementations rather than free
//! functions wired together by introspection, and the reserved runtime
//! context (`task_id`) is a first-class [`ReservedContext`] argument rather
//! than a merged key in the parameter map.

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::cloudllm::errors::{AgentexError, Result};
use crate::cloudllm::state::Artifact;

/// Runtime-provided keys passed to every handler invocation out-of-band
/// from user-supplied arguments. Currently carries only `task_id`, matching
/// the single reserved key named in the source.
#[derive(Debug, Clone)]
pub struct ReservedContext {
    pub task_id: String,
}

/// The result of invoking an action handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub message: serde_json::Value,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    pub success: bool,
}

impl ActionResponse {
    pub fn ok(message: impl Serialize) -> Self {
        ActionResponse {
            message: serde_json::to_value(message).unwrap_or(serde_json::Value::Null),
            artifacts: Vec::new(),
            success: true,
        }
    }

    pub fn ok_with_artifacts(message: impl Serialize, artifacts: Vec<Artifact>) -> Self {
        ActionResponse {
            message: serde_json::to_value(message).unwrap_or(serde_json::Value::Null),
            artifacts,
            success: true,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ActionResponse {
            message: serde_json::Value::String(message.into()),
            artifacts: Vec::new(),
            success: false,
        }
    }
}

/// A typed action handler. Implementors declare their argument shape as
/// `P`, which must derive both [`schemars::JsonSchema`] (for the
/// function-call schema advertised to the model) and
/// [`serde::de::DeserializeOwned`] (to validate and parse the model's raw
/// JSON arguments).
#[async_trait]
pub trait ActionHandler<P>: Send + Sync
where
    P: DeserializeOwned + JsonSchema + Send + Sync + 'static,
{
    /// Human-readable description surfaced in the function-call schema.
    fn description(&self) -> &str;

    /// Execute the action. `ctx` carries runtime-provided keys; `params` is
    /// already validated and deserialized.
    async fn handle(&self, ctx: ReservedContext, params: P) -> Result<ActionResponse>;
}

type BoxedCall = Arc<
    dyn Fn(ReservedContext, serde_json::Value) -> Pin<Box<dyn Future<Output = Result<ActionResponse>> + Send>>
        + Send
        + Sync,
>;

/// A single registered action: its name, the function-call schema
/// advertised to the model, and the type-erased invocation closure.
#[derive(Clone)]
struct ActionEntry {
    name: String,
    description: String,
    parameters_schema: serde_json::Value,
    call: BoxedCall,
}

/// A typed registry of named action handlers, with schema generation and
/// validated invocation. Agents may hold multiple named registries (e.g.
/// `writer`, `critic`); the activity library selects one by key.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    entries: HashMap<String, ActionEntry>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a typed handler under `name`. Rejects registration (rather
    /// than panicking) when the derived schema has a parameter lacking a
    /// `description`, matching the registration-time rejection rule.
    pub fn register<P, H>(&mut self, name: impl Into<String>, handler: H) -> Result<()>
    where
        P: DeserializeOwned + JsonSchema + Send + Sync + 'static,
        H: ActionHandler<P> + 'static,
    {
        let name = name.into();
        let schema = schemars::schema_for!(P);
        let mut parameters_schema = serde_json::to_value(&schema)
            .map_err(|e| AgentexError::service(format!("failed to serialize schema: {}", e)))?;
        flatten_schema_refs(&mut parameters_schema);
        reject_undocumented_parameters(&name, &parameters_schema)?;

        let description = handler.description().to_string();
        let handler = Arc::new(handler);
        let call: BoxedCall = Arc::new(move |ctx, raw_args| {
            let handler = handler.clone();
            Box::pin(async move {
                let params: P = serde_json::from_value(raw_args).map_err(|e| {
                    AgentexError::client(format!("invalid arguments: {}", e))
                })?;
                handler.handle(ctx, params).await
            })
        });

        self.entries.insert(
            name.clone(),
            ActionEntry {
                name,
                description,
                parameters_schema,
                call,
            },
        );
        Ok(())
    }

    /// Validate and invoke the handler registered under `name`.
    pub async fn call(
        &self,
        name: &str,
        ctx: ReservedContext,
        args: serde_json::Value,
    ) -> Result<ActionResponse> {
        let entry = self
            .entries
            .get(name)
            .ok_or_else(|| AgentexError::client(format!("unknown action '{}'", name)))?;
        (entry.call)(ctx, args).await
    }

    /// Function-call schemas for every registered handler, in the shape
    /// the LLM gateway expects: `{type:"function", function:{name,
    /// description, parameters}}`.
    pub fn function_call_schemas(&self) -> Vec<serde_json::Value> {
        self.entries
            .values()
            .map(|e| {
                serde_json::json!({
                    "type": "function",
                    "function": {
                        "name": e.name,
                        "description": e.description,
                        "parameters": e.parameters_schema,
                    }
                })
            })
            .collect()
    }

    /// Names of every registered handler. Used to assert that the set of
    /// advertised schemas equals the set of registered handlers (no
    /// orphans in either direction).
    pub fn action_names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

/// Inlines every `$ref`/`$defs` (or the older `definitions` keyword) pair
/// `schemars` emits for a nested struct/enum parameter, so the schema
/// advertised to the model (§4.5 step 3) is flat — no references for a
/// caller on the other side of the wire to resolve. Definitions are
/// resolved once up front so a cycle between two referenced types can't
/// recurse forever; a definition that still contains an unresolved `$ref`
/// after that (a genuine cycle) is left as-is rather than looping.
fn flatten_schema_refs(schema: &mut serde_json::Value) {
    let defs = schema
        .get("$defs")
        .or_else(|| schema.get("definitions"))
        .cloned()
        .unwrap_or(serde_json::Value::Null);
    let Some(defs) = defs.as_object().cloned() else {
        return;
    };

    let mut resolved = HashMap::new();
    for name in defs.keys() {
        let mut def = defs[name].clone();
        inline_refs(&mut def, &defs, 0);
        resolved.insert(name.clone(), def);
    }
    inline_refs_with_resolved(schema, &resolved, 0);

    if let Some(obj) = schema.as_object_mut() {
        obj.remove("$defs");
        obj.remove("definitions");
    }
}

const MAX_REF_DEPTH: u32 = 16;

fn inline_refs(value: &mut serde_json::Value, defs: &serde_json::Map<String, serde_json::Value>, depth: u32) {
    if depth >= MAX_REF_DEPTH {
        return;
    }
    match value {
        serde_json::Value::Object(map) => {
            if let Some(target) = ref_target(map) {
                if let Some(def) = defs.get(&target) {
                    let mut inlined = def.clone();
                    inline_refs(&mut inlined, defs, depth + 1);
                    *value = inlined;
                    return;
                }
            }
            for v in map.values_mut() {
                inline_refs(v, defs, depth + 1);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items.iter_mut() {
                inline_refs(item, defs, depth + 1);
            }
        }
        _ => {}
    }
}

/// Same walk as [`inline_refs`] but substitutes from an already-flattened
/// `resolved` map (definitions that have had their own internal refs
/// inlined already), used for the outer parameter schema itself.
fn inline_refs_with_resolved(
    value: &mut serde_json::Value,
    resolved: &HashMap<String, serde_json::Value>,
    depth: u32,
) {
    if depth >= MAX_REF_DEPTH {
        return;
    }
    match value {
        serde_json::Value::Object(map) => {
            if let Some(target) = ref_target(map) {
                if let Some(def) = resolved.get(&target) {
                    *value = def.clone();
                    return;
                }
            }
            for v in map.values_mut() {
                inline_refs_with_resolved(v, resolved, depth + 1);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items.iter_mut() {
                inline_refs_with_resolved(item, resolved, depth + 1);
            }
        }
        _ => {}
    }
}

/// Extracts the definition name out of a `{"$ref": "#/$defs/Name"}` (or the
/// `#/definitions/Name` draft-07 form) node, if `map` is exactly that shape.
fn ref_target(map: &serde_json::Map<String, serde_json::Value>) -> Option<String> {
    let r#ref = map.get("$ref")?.as_str()?;
    r#ref
        .rsplit('/')
        .next()
        .filter(|_| r#ref.contains("$defs/") || r#ref.contains("definitions/"))
        .map(|s| s.to_string())
}

fn reject_undocumented_parameters(action_name: &str, schema: &serde_json::Value) -> Result<()> {
    let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
        return Ok(());
    };
    for (param_name, param_schema) in properties {
        let has_description = param_schema.get("description").is_some();
        if !has_description {
            return Err(AgentexError::client(format!(
                "action '{}' parameter '{}' is missing a description",
                action_name, param_name
            )));
        }
    }
    Ok(())
}

/// Named registries per agent (e.g. `writer` vs `critic`), selected at
/// activity invocation time by an `action_registry_key` string.
#[derive(Clone, Default)]
pub struct ActionRegistrySet {
    registries: HashMap<String, Arc<ActionRegistry>>,
}

impl ActionRegistrySet {
    pub fn new() -> Self {
        Self {
            registries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, key: impl Into<String>, registry: ActionRegistry) {
        self.registries.insert(key.into(), Arc::new(registry));
    }

    pub fn get(&self, key: &str) -> Result<Arc<ActionRegistry>> {
        self.registries
            .get(key)
            .cloned()
            .ok_or_else(|| AgentexError::client(format!("unknown action registry '{}'", key)))
    }
}
