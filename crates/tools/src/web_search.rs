//! Web search tool.
//!
//! No search backend is wired up yet, so the tool answers with an empty
//! result list and a note the model can relay to the user.

use async_trait::async_trait;
use relayclaw_core::error::ToolError;
use relayclaw_core::tool::Tool;

pub struct WebSearchTool;

#[async_trait]
impl Tool for WebSearchTool {
    fn name(&self) -> &str {
        "web_search"
    }

    fn description(&self) -> &str {
        "Search the web for current information. Returns search results with titles, snippets, and URLs."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "The search query"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<String, ToolError> {
        let query = arguments["query"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'query' argument".into()))?;

        Ok(serde_json::json!({
            "note": "Web search is not yet configured. Please set up a search API provider.",
            "query": query,
            "results": [],
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn returns_placeholder() {
        let out = WebSearchTool.execute(serde_json::json!({"query": "rust"})).await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["query"], "rust");
        assert!(v["results"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_query() {
        assert!(WebSearchTool.execute(serde_json::json!({})).await.is_err());
    }
}
