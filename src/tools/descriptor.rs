// # Tool Descriptors & Schemas
//
// A tool is a named callable with a parameter schema (types, required set,
// enums, ranges), a return schema, a risk tag, required capabilities and an
// optional compensating tool for rollback. The schema model covers what the
// planner needs without dragging a full JSON-Schema engine into the core.

use crate::error::{DbError, Result};
use crate::guard::RiskLevel;
use crate::pool::PoolManager;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

/// Tool grouping for discovery and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCategory {
    Database,
    Filesystem,
    Network,
    Analysis,
    Backup,
    Migration,
    Optimization,
    Safety,
}

/// Parameter value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Number,
    Boolean,
    Array,
    Object,
}

impl ParamType {
    fn matches(self, value: &serde_json::Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Integer => value.is_i64() || value.is_u64(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Array => value.is_array(),
            ParamType::Object => value.is_object(),
        }
    }
}

/// One parameter's specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub param_type: ParamType,

    pub description: String,

    #[serde(default)]
    pub required: bool,

    /// Allowed values, when the parameter is an enumeration
    #[serde(default)]
    pub one_of: Option<Vec<serde_json::Value>>,

    /// Inclusive numeric range
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
}

impl ParamSpec {
    pub fn string(description: &str) -> Self {
        Self {
            param_type: ParamType::String,
            description: description.to_string(),
            required: false,
            one_of: None,
            minimum: None,
            maximum: None,
        }
    }

    pub fn integer(description: &str) -> Self {
        Self {
            param_type: ParamType::Integer,
            ..Self::string(description)
        }
    }

    pub fn boolean(description: &str) -> Self {
        Self {
            param_type: ParamType::Boolean,
            ..Self::string(description)
        }
    }

    pub fn object(description: &str) -> Self {
        Self {
            param_type: ParamType::Object,
            ..Self::string(description)
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn one_of(mut self, values: Vec<serde_json::Value>) -> Self {
        self.one_of = Some(values);
        self
    }

    pub fn range(mut self, minimum: f64, maximum: f64) -> Self {
        self.minimum = Some(minimum);
        self.maximum = Some(maximum);
        self
    }

    fn check(&self, name: &str, value: &serde_json::Value, errors: &mut Vec<String>) {
        if !self.param_type.matches(value) {
            errors.push(format!(
                "'{}': expected {:?}, got {}",
                name,
                self.param_type,
                json_type_name(value)
            ));
            return;
        }
        if let Some(allowed) = &self.one_of {
            if !allowed.contains(value) {
                errors.push(format!("'{}': value not in allowed set", name));
            }
        }
        if let Some(n) = value.as_f64() {
            if let Some(min) = self.minimum {
                if n < min {
                    errors.push(format!("'{}': {} below minimum {}", name, n, min));
                }
            }
            if let Some(max) = self.maximum {
                if n > max {
                    errors.push(format!("'{}': {} above maximum {}", name, n, max));
                }
            }
        }
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "boolean",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// A parameter or return schema: named specs plus a strictness flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParameterSchema {
    pub properties: BTreeMap<String, ParamSpec>,

    /// Whether keys outside `properties` are tolerated
    #[serde(default)]
    pub allow_additional: bool,
}

impl ParameterSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &str, spec: ParamSpec) -> Self {
        self.properties.insert(name.to_string(), spec);
        self
    }

    pub fn tolerant(mut self) -> Self {
        self.allow_additional = true;
        self
    }

    /// Structural well-formedness, checked at registration.
    pub fn validate_shape(&self) -> Result<()> {
        for (name, spec) in &self.properties {
            if name.is_empty() {
                return Err(DbError::Configuration(
                    "schema property with empty name".to_string(),
                ));
            }
            if let (Some(min), Some(max)) = (spec.minimum, spec.maximum) {
                if min > max {
                    return Err(DbError::Configuration(format!(
                        "schema property '{}' has minimum {} > maximum {}",
                        name, min, max
                    )));
                }
            }
            if let Some(allowed) = &spec.one_of {
                if allowed.is_empty() {
                    return Err(DbError::Configuration(format!(
                        "schema property '{}' has an empty enum",
                        name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Validate a value object, reporting every field error at once.
    pub fn validate(&self, value: &serde_json::Value) -> Result<()> {
        let object = value.as_object().ok_or_else(|| {
            DbError::InvalidParams("parameters must be an object".to_string())
        })?;

        let mut errors = Vec::new();
        for (name, spec) in &self.properties {
            match object.get(name) {
                Some(v) if v.is_null() && !spec.required => {}
                Some(v) => spec.check(name, v, &mut errors),
                None if spec.required => errors.push(format!("'{}': missing", name)),
                None => {}
            }
        }
        if !self.allow_additional {
            for key in object.keys() {
                if !self.properties.contains_key(key) {
                    errors.push(format!("'{}': unexpected", key));
                }
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DbError::InvalidParams(errors.join("; ")))
        }
    }
}

/// Immutable description of a registered tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub version: String,
    pub description: String,
    pub category: ToolCategory,
    pub risk: RiskLevel,
    pub parameters: ParameterSchema,
    pub returns: ParameterSchema,
    /// Capability strings the calling context must hold
    pub capabilities: BTreeSet<String>,
    /// Calls per minute; `None` defers to the registry default
    pub rate_limit_per_minute: Option<u32>,
    /// Tool to invoke with this tool's recorded output during rollback
    pub compensating_tool: Option<String>,
    /// Non-reversible but safe to leave in place during rollback (e.g. a
    /// backup). Without this or a compensating tool, rollback fails fast.
    #[serde(default)]
    pub retain_on_rollback: bool,
}

impl ToolDescriptor {
    pub fn new(name: &str, description: &str, category: ToolCategory, risk: RiskLevel) -> Self {
        Self {
            name: name.to_string(),
            version: "1".to_string(),
            description: description.to_string(),
            category,
            risk,
            parameters: ParameterSchema::new(),
            returns: ParameterSchema::new().tolerant(),
            capabilities: BTreeSet::new(),
            rate_limit_per_minute: None,
            compensating_tool: None,
            retain_on_rollback: false,
        }
    }

    pub fn with_parameters(mut self, schema: ParameterSchema) -> Self {
        self.parameters = schema;
        self
    }

    pub fn with_returns(mut self, schema: ParameterSchema) -> Self {
        self.returns = schema;
        self
    }

    pub fn requires_capability(mut self, capability: &str) -> Self {
        self.capabilities.insert(capability.to_string());
        self
    }

    pub fn with_rate_limit(mut self, per_minute: u32) -> Self {
        self.rate_limit_per_minute = Some(per_minute);
        self
    }

    pub fn with_compensation(mut self, tool: &str) -> Self {
        self.compensating_tool = Some(tool.to_string());
        self
    }

    pub fn retain_on_rollback(mut self) -> Self {
        self.retain_on_rollback = true;
        self
    }

    /// LLM-facing summary used by the agent planner.
    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "version": self.version,
            "description": self.description,
            "category": self.category,
            "risk": self.risk.to_string(),
            "parameters": self.parameters,
            "capabilities": self.capabilities,
            "reversible": self.compensating_tool.is_some(),
        })
    }
}

/// Execution context handed to implementations.
#[derive(Clone)]
pub struct ToolContext {
    pub principal: String,
    pub capabilities: BTreeSet<String>,
    /// Pool access for database tools
    pub pools: Option<Arc<PoolManager>>,
    /// Per-invocation deadline; the registry enforces it
    pub deadline: Option<Duration>,
}

impl ToolContext {
    pub fn new(principal: &str) -> Self {
        Self {
            principal: principal.to_string(),
            capabilities: BTreeSet::new(),
            pools: None,
            deadline: None,
        }
    }

    pub fn grant(mut self, capability: &str) -> Self {
        self.capabilities.insert(capability.to_string());
        self
    }

    pub fn with_pools(mut self, pools: Arc<PoolManager>) -> Self {
        self.pools = Some(pools);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// The callable side of a tool.
#[async_trait]
pub trait ToolImplementation: Send + Sync {
    async fn invoke(
        &self,
        params: serde_json::Value,
        context: &ToolContext,
    ) -> Result<serde_json::Value>;
}
