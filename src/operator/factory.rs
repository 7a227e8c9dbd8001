//! Building operators from serialized configuration
//!
//! The same JSON shape is used in pipeline description files, in the state
//! document handed to external runners, and by [`super::Operator::serialize`].

use super::{Fork, Invert, Linear, Operator, ScriptTransform, Threshold};
use crate::error::{PipelineError, Result, ResultExt};
use crate::scripting::ScriptEngine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

fn default_above() -> f64 {
    255.0
}

fn default_scale() -> f64 {
    1.0
}

/// Configuration of a built-in or script operator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OperatorConfig {
    Invert,
    Threshold {
        value: f64,
        #[serde(default)]
        below: f64,
        #[serde(default = "default_above")]
        above: f64,
    },
    Linear {
        #[serde(default = "default_scale")]
        scale: f64,
        #[serde(default)]
        offset: f64,
    },
    Fork {
        label: String,
    },
    Script {
        label: String,
        script: String,
        #[serde(default)]
        params: BTreeMap<String, f64>,
        #[serde(default, rename = "keepCOrdering")]
        c_ordering: bool,
    },
}

/// Creates operators from [`OperatorConfig`]s
#[derive(Clone)]
pub struct OperatorFactory {
    engine: Arc<ScriptEngine>,
}

impl OperatorFactory {
    pub fn new(engine: Arc<ScriptEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<ScriptEngine> {
        &self.engine
    }

    pub fn create(&self, config: OperatorConfig) -> Result<Arc<Operator>> {
        let op = match config {
            OperatorConfig::Invert => Operator::new(Invert),
            OperatorConfig::Threshold {
                value,
                below,
                above,
            } => Operator::new(Threshold {
                value,
                below,
                above,
            }),
            OperatorConfig::Linear { scale, offset } => Operator::new(Linear { scale, offset }),
            OperatorConfig::Fork { label } => Operator::new(Fork { label }),
            OperatorConfig::Script {
                label,
                script,
                params,
                c_ordering,
            } => Operator::new(
                ScriptTransform::new(self.engine.clone(), label, &script, params)?
                    .with_c_ordering(c_ordering),
            ),
        };
        Ok(op)
    }

    /// Create an operator from its JSON form
    pub fn from_json(&self, value: &serde_json::Value) -> Result<Arc<Operator>> {
        let config: OperatorConfig = serde_json::from_value(value.clone())?;
        self.create(config)
    }

    /// Create every operator of a JSON array, in order
    pub fn from_json_list(&self, values: &[serde_json::Value]) -> Result<Vec<Arc<Operator>>> {
        values
            .iter()
            .enumerate()
            .map(|(i, value)| {
                self.from_json(value)
                    .with_context(|| format!("operator {}", i))
            })
            .collect()
    }
}

impl Default for OperatorFactory {
    fn default() -> Self {
        Self::new(Arc::new(ScriptEngine::new()))
    }
}

impl std::fmt::Debug for OperatorFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorFactory").finish_non_exhaustive()
    }
}

/// Parse a JSON array of operator configurations from a file's contents
pub fn parse_operator_list(content: &str) -> Result<Vec<serde_json::Value>> {
    let value: serde_json::Value = serde_json::from_str(content)?;
    match value {
        serde_json::Value::Array(items) => Ok(items),
        serde_json::Value::Object(mut map) => match map.remove("operators") {
            Some(serde_json::Value::Array(items)) => Ok(items),
            _ => Err(PipelineError::Serialization(
                "expected an `operators` array".to_string(),
            )),
        },
        _ => Err(PipelineError::Serialization(
            "expected an array of operators".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{ScalarType, VolumeBuffer};
    use serde_json::json;

    #[test]
    fn test_create_from_json() {
        let factory = OperatorFactory::default();
        let ops = factory
            .from_json_list(&[
                json!({ "type": "invert" }),
                json!({ "type": "threshold", "value": 50.0 }),
                json!({ "type": "linear", "offset": 2.0 }),
                json!({ "type": "fork", "label": "Copy" }),
                json!({ "type": "script", "label": "Square", "script": "value * value" }),
            ])
            .unwrap();

        assert_eq!(ops.len(), 5);
        assert_eq!(ops[0].label(), "Invert Data");
        assert!(ops[3].has_child_data_source());
        assert_eq!(ops[4].label(), "Square");
    }

    #[test]
    fn test_serialize_round_trips_through_factory() {
        let factory = OperatorFactory::default();
        let original = factory
            .create(OperatorConfig::Script {
                label: "Scaled".to_string(),
                script: "value * k".to_string(),
                params: BTreeMap::from([("k".to_string(), 3.0)]),
                c_ordering: true,
            })
            .unwrap();

        let rebuilt = factory.from_json(&original.serialize()).unwrap();
        assert_eq!(rebuilt.serialize(), original.serialize());
        assert!(rebuilt.prefers_c_ordering());

        let mut buffer = VolumeBuffer::filled([1, 1, 1], ScalarType::F64, 2.0);
        rebuilt.transform(&mut buffer, None);
        assert_eq!(buffer.voxels(), &[6.0]);
    }

    #[test]
    fn test_unknown_type_and_bad_script() {
        let factory = OperatorFactory::default();
        let err = factory
            .from_json_list(&[json!({ "type": "invert" }), json!({ "type": "warp" })])
            .unwrap_err();
        assert!(err.to_string().contains("operator 1"));

        assert!(factory
            .from_json(&json!({ "type": "script", "label": "x", "script": "(" }))
            .is_err());
    }

    #[test]
    fn test_parse_operator_list() {
        assert_eq!(parse_operator_list(r#"[{"type":"invert"}]"#).unwrap().len(), 1);
        assert_eq!(
            parse_operator_list(r#"{"operators":[{"type":"invert"},{"type":"invert"}]}"#)
                .unwrap()
                .len(),
            2
        );
        assert!(parse_operator_list(r#"{"ops":[]}"#).is_err());
    }
}
