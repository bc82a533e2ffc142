//! Declared strategy parameters and their validation

use crate::error::EngineError;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Int,
    Float,
    Bool,
    String,
}

/// One entry of a strategy's parameter schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    #[serde(default)]
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn new(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: false,
            min: None,
            max: None,
            default: None,
        }
    }

    pub fn int(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Int)
    }

    pub fn float(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Float)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, ParamKind::Bool)
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn range(mut self, min: f64, max: f64) -> Self {
        self.min = Some(min);
        self.max = Some(max);
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    fn check(&self, value: &Value) -> Result<()> {
        let type_ok = match self.kind {
            ParamKind::Int => value.as_i64().is_some() || value.as_u64().is_some(),
            ParamKind::Float => value.is_number(),
            ParamKind::Bool => value.is_boolean(),
            ParamKind::String => value.is_string(),
        };
        if !type_ok {
            return Err(EngineError::validation(format!(
                "parameter {} expects {:?}, got {value}",
                self.name, self.kind
            )));
        }

        if let Some(number) = value.as_f64() {
            if self.min.is_some_and(|min| number < min) || self.max.is_some_and(|max| number > max) {
                return Err(EngineError::validation(format!(
                    "parameter {} = {number} outside [{}, {}]",
                    self.name,
                    self.min.map_or("-inf".to_string(), |v| v.to_string()),
                    self.max.map_or("inf".to_string(), |v| v.to_string()),
                )));
            }
        }
        Ok(())
    }
}

/// Check `params` against `schema` and return them with defaults filled in.
///
/// `null` is treated as an empty object. Keys the schema does not declare are
/// rejected.
pub fn validate_params(schema: &[ParamSpec], params: &Value) -> Result<Value> {
    let empty = Map::new();
    let given = match params {
        Value::Null => &empty,
        Value::Object(map) => map,
        other => {
            return Err(EngineError::validation(format!(
                "parameters must be an object, got {other}"
            )))
        }
    };

    if let Some(unknown) = given.keys().find(|k| !schema.iter().any(|s| &s.name == *k)) {
        return Err(EngineError::validation(format!("unknown parameter: {unknown}")));
    }

    let mut resolved = Map::new();
    for spec in schema {
        match given.get(&spec.name) {
            Some(value) => {
                spec.check(value)?;
                resolved.insert(spec.name.clone(), value.clone());
            }
            None if spec.required => {
                return Err(EngineError::validation(format!(
                    "missing required parameter: {}",
                    spec.name
                )));
            }
            None => {
                if let Some(default) = &spec.default {
                    resolved.insert(spec.name.clone(), default.clone());
                }
            }
        }
    }
    Ok(Value::Object(resolved))
}
