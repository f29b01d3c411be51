use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::SharedState;
use crate::auth::Caller;
use crate::error::{McpError, McpResult};
use crate::storage::PredictionFilter;

/// Route tool calls to appropriate handlers
pub async fn handle_tool_call(
    state: &SharedState,
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<Value> {
    info!(tool = %tool_name, "Routing tool call");

    match tool_name {
        "predictions_scan" => handle_scan(state, arguments).await,
        "predictions_list" => handle_list(state, arguments).await,
        "predictions_accept" => handle_accept(state, arguments).await,
        "predictions_dismiss" => handle_dismiss(state, arguments).await,
        "predictions_accept_all" => handle_accept_all(state, arguments).await,
        _ => Err(McpError::UnknownTool {
            tool_name: tool_name.to_string(),
        }),
    }
}

/// Arguments of `predictions_scan`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanParams {
    /// Tree to scan.
    pub tree_id: String,
    /// Calling user.
    pub user_id: String,
}

/// Arguments of `predictions_list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListParams {
    pub tree_id: String,
    pub user_id: String,
    #[serde(flatten)]
    pub filter: PredictionFilter,
}

/// Arguments of `predictions_accept`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptParams {
    pub prediction_id: String,
    pub user_id: String,
}

/// Arguments of `predictions_dismiss`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DismissParams {
    pub prediction_id: String,
    pub user_id: String,
    /// Reviewer's reason, stored with the dismissal.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Arguments of `predictions_accept_all`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptAllParams {
    pub tree_id: String,
    pub user_id: String,
    /// Threshold; the configured default when absent.
    #[serde(default)]
    pub min_confidence: Option<f64>,
}

/// Handle predictions_scan tool call
async fn handle_scan(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler("predictions_scan", arguments, |params: ScanParams| async move {
        state
            .service
            .scan_tree(&params.tree_id, &Caller::new(params.user_id))
            .await
    })
    .await
}

/// Handle predictions_list tool call
async fn handle_list(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler("predictions_list", arguments, |params: ListParams| async move {
        state
            .service
            .get_predictions(&params.tree_id, &params.filter, &Caller::new(params.user_id))
            .await
    })
    .await
}

/// Handle predictions_accept tool call.
///
/// The structured result carries success or failure; it is never a protocol error.
async fn handle_accept(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    let params: AcceptParams = parse_arguments("predictions_accept", arguments)?;

    let result = state
        .service
        .accept_prediction(&params.prediction_id, &Caller::new(params.user_id))
        .await;

    serde_json::to_value(result).map_err(McpError::Json)
}

/// Handle predictions_dismiss tool call
async fn handle_dismiss(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    let params: DismissParams = parse_arguments("predictions_dismiss", arguments)?;

    let result = state
        .service
        .dismiss_prediction(
            &params.prediction_id,
            params.reason,
            &Caller::new(params.user_id),
        )
        .await;

    serde_json::to_value(result).map_err(McpError::Json)
}

/// Handle predictions_accept_all tool call
async fn handle_accept_all(state: &SharedState, arguments: Option<Value>) -> McpResult<Value> {
    execute_handler(
        "predictions_accept_all",
        arguments,
        |params: AcceptAllParams| async move {
            if let Some(min) = params.min_confidence {
                if !(0.0..=100.0).contains(&min) {
                    return Err(format!("min_confidence must be within 0-100, got {}", min));
                }
            }
            state
                .service
                .accept_all_high_confidence(
                    &params.tree_id,
                    params.min_confidence,
                    &Caller::new(params.user_id),
                )
                .await
                .map_err(|e| e.to_string())
        },
    )
    .await
}

fn parse_arguments<T: serde::de::DeserializeOwned>(
    tool_name: &str,
    arguments: Option<Value>,
) -> McpResult<T> {
    match arguments {
        Some(args) => serde_json::from_value(args).map_err(|e| McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: e.to_string(),
        }),
        None => Err(McpError::InvalidParameters {
            tool_name: tool_name.to_string(),
            message: "Missing arguments".to_string(),
        }),
    }
}

/// Generic handler that executes a service operation with consistent error handling.
///
/// Parses typed arguments, converts failures to [`McpError::ExecutionFailed`] and
/// serializes the result.
async fn execute_handler<P, R, E, F, Fut>(
    tool_name: &str,
    arguments: Option<Value>,
    operation: F,
) -> McpResult<Value>
where
    P: serde::de::DeserializeOwned,
    R: Serialize,
    E: std::fmt::Display,
    F: FnOnce(P) -> Fut,
    Fut: std::future::Future<Output = Result<R, E>>,
{
    let params: P = parse_arguments(tool_name, arguments)?;

    let result = operation(params)
        .await
        .map_err(|e| McpError::ExecutionFailed {
            message: e.to_string(),
        })?;

    serde_json::to_value(result).map_err(McpError::Json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_arguments_missing() {
        let result: McpResult<ScanParams> = parse_arguments("predictions_scan", None);
        assert!(matches!(result, Err(McpError::InvalidParameters { .. })));
    }

    #[test]
    fn test_list_params_flatten_filter() {
        let params: ListParams = parse_arguments(
            "predictions_list",
            Some(json!({
                "tree_id": "t",
                "user_id": "u",
                "status": "Dismissed",
                "predicted_type": "parent_child",
                "page_size": 10
            })),
        )
        .unwrap();

        assert_eq!(params.tree_id, "t");
        assert_eq!(
            params.filter.status,
            Some(crate::storage::PredictionStatus::Dismissed)
        );
        assert_eq!(params.filter.page_size, Some(10));
        assert!(params.filter.page.is_none());
    }

    #[test]
    fn test_dismiss_params_reason_optional() {
        let params: DismissParams = parse_arguments(
            "predictions_dismiss",
            Some(json!({"prediction_id": "p", "user_id": "u"})),
        )
        .unwrap();
        assert!(params.reason.is_none());
    }

    #[test]
    fn test_accept_params_require_user() {
        let result: McpResult<AcceptParams> =
            parse_arguments("predictions_accept", Some(json!({"prediction_id": "p"})));
        let err = result.unwrap_err();
        assert!(err.to_string().contains("user_id"));
    }
}
