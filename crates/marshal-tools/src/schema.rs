use schemars::JsonSchema;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::error::ToolError;
use crate::ids::ToolCallId;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCall {
    pub name: String,
    pub parameters: Value,
    pub id: ToolCallId,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            parameters,
            id: ToolCallId::new(),
        }
    }

    /// Decodes the call's parameters into the tool's typed params.
    pub fn params<T: DeserializeOwned>(&self) -> Result<T, ToolError> {
        serde_json::from_value(self.parameters.clone())
            .map_err(|e| ToolError::invalid_params(&self.name, e.to_string()))
    }
}

/// Advertised shape of a tool, handed to the turn engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

pub trait ToolSpec {
    type Params: DeserializeOwned + JsonSchema + Send;
    type Output: Serialize + Send;

    const NAME: &'static str;
    const DESCRIPTION: &'static str;

    fn schema() -> ToolSchema {
        let schema = schemars::schema_for!(Self::Params);
        ToolSchema {
            name: Self::NAME.to_string(),
            description: Self::DESCRIPTION.to_string(),
            input_schema: serde_json::to_value(&schema).unwrap_or(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Deserialize, JsonSchema)]
    struct EchoParams {
        #[expect(dead_code)]
        text: String,
    }

    struct EchoSpec;

    impl ToolSpec for EchoSpec {
        type Params = EchoParams;
        type Output = String;

        const NAME: &'static str = "echo";
        const DESCRIPTION: &'static str = "Echo text back.";
    }

    #[test]
    fn schema_lists_required_params() {
        let schema = EchoSpec::schema();
        assert_eq!(schema.name, "echo");
        let required = schema.input_schema["required"]
            .as_array()
            .expect("required array");
        assert!(required.contains(&json!("text")));
    }

    #[test]
    fn params_reports_invalid_input() {
        let call = ToolCall::new("echo", json!({"wrong": 1}));
        let err = call.params::<EchoParams>().expect_err("missing field");
        assert!(matches!(err, ToolError::InvalidParams { .. }));
    }
}
