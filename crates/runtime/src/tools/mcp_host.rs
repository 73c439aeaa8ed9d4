//! MCP-backed tool host.

use super::{ToolError, ToolHost};
use crate::model::{ToolCall, ToolOutcome, ToolSpec};
use mcp::{Client, ClientInfo, ServerConfig, Tool};
use serde_json::{Map, Value};
use tracing::debug;

impl From<Tool> for ToolSpec {
    fn from(tool: Tool) -> Self {
        let schema = match tool.input_schema {
            Value::Object(mut map) => {
                map.entry("type")
                    .or_insert_with(|| Value::String("object".into()));
                Value::Object(map)
            }
            _ => serde_json::json!({"type": "object"}),
        };

        Self {
            name: tool.name,
            description: tool.description.unwrap_or_default(),
            schema,
        }
    }
}

/// Tool host backed by an MCP server.
pub struct McpToolHost {
    client: Client,
    specs: Vec<ToolSpec>,
}

impl McpToolHost {
    /// Spawn the server, initialize, and cache its tool specs.
    pub async fn connect(config: ServerConfig, client_info: ClientInfo) -> mcp::Result<Self> {
        let client = Client::connect(config, client_info).await?;
        let specs = client.tools().await.into_iter().map(ToolSpec::from).collect();
        Ok(Self { client, specs })
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.specs.iter().map(|spec| spec.name.as_str()).collect()
    }

    /// Close the session and stop the server.
    pub async fn shutdown(self) -> mcp::Result<()> {
        self.client.shutdown().await
    }
}

/// Model-produced input as MCP tool arguments.
fn arguments(input: &Value) -> Result<Option<Map<String, Value>>, ToolError> {
    match input {
        Value::Object(map) => Ok(Some(map.clone())),
        Value::Null => Ok(None),
        other => Err(ToolError::InvalidInput(format!(
            "expected a JSON object, got {other}"
        ))),
    }
}

impl ToolHost for McpToolHost {
    fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    async fn execute(&self, call: &ToolCall) -> Result<ToolOutcome, ToolError> {
        let arguments = arguments(&call.input)?;
        debug!(tool = %call.name, id = %call.id, "calling tool");

        let result = self
            .client
            .session()
            .call_tool(&call.name, arguments)
            .await?;

        let text = result.text();
        Ok(if result.is_error {
            ToolOutcome::error(text)
        } else {
            ToolOutcome::success(text)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn spec_gets_object_type_and_description() {
        let tool = Tool {
            name: "get_alerts".into(),
            description: None,
            input_schema: json!({"properties": {"state": {"type": "string"}}}),
        };
        let spec = ToolSpec::from(tool);
        assert_eq!(spec.description, "");
        assert_eq!(spec.schema["type"], "object");
        assert_eq!(spec.schema["properties"]["state"]["type"], "string");
    }

    #[test]
    fn spec_keeps_existing_type() {
        let tool = Tool {
            name: "t".into(),
            description: Some("d".into()),
            input_schema: json!({"type": "object", "required": ["x"]}),
        };
        let spec = ToolSpec::from(tool);
        assert_eq!(spec.description, "d");
        assert_eq!(spec.schema, json!({"type": "object", "required": ["x"]}));
    }

    #[test]
    fn non_object_schema_is_replaced() {
        let tool = Tool {
            name: "t".into(),
            description: None,
            input_schema: Value::Null,
        };
        assert_eq!(ToolSpec::from(tool).schema, json!({"type": "object"}));
    }

    #[test]
    fn arguments_must_be_an_object() {
        assert!(arguments(&json!({"state": "CA"})).unwrap().is_some());
        assert!(arguments(&Value::Null).unwrap().is_none());
        assert!(matches!(
            arguments(&json!(["CA"])),
            Err(ToolError::InvalidInput(_))
        ));
    }
}
