//! Watch expressions re-evaluated on every stop

use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;

use crate::common::{Error, Result};
use crate::dap::engine::ProtocolEngine;
use crate::dap::types::{EvaluateArguments, EvaluateResponseBody};

/// Last known value of a watch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WatchValue {
    /// Not evaluated yet, or the target is not stopped
    Unavailable,
    Value {
        result: String,
        type_name: Option<String>,
        variables_reference: i64,
    },
    Error { message: String },
}

impl std::fmt::Display for WatchValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchValue::Unavailable => write!(f, "<unavailable>"),
            WatchValue::Value {
                result,
                type_name: Some(ty),
                ..
            } => write!(f, "{} ({})", result, ty),
            WatchValue::Value { result, .. } => write!(f, "{}", result),
            WatchValue::Error { message } => write!(f, "<error: {}>", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Watch {
    pub id: u32,
    pub expression: String,
    pub value: WatchValue,
}

/// User-declared expressions, kept across sessions
#[derive(Debug, Default)]
pub struct WatchRegistry {
    watches: Vec<Watch>,
    next_id: u32,
}

impl WatchRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, expression: &str) -> Result<u32> {
        let expression = expression.trim();
        if expression.is_empty() {
            return Err(Error::InvalidExpression("empty watch expression".to_string()));
        }
        self.next_id += 1;
        let id = self.next_id;
        self.watches.push(Watch {
            id,
            expression: expression.to_string(),
            value: WatchValue::Unavailable,
        });
        Ok(id)
    }

    pub fn remove(&mut self, id: u32) -> Result<Watch> {
        let index = self
            .watches
            .iter()
            .position(|w| w.id == id)
            .ok_or(Error::WatchNotFound(id))?;
        Ok(self.watches.remove(index))
    }

    pub fn list(&self) -> Vec<Watch> {
        self.watches.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Used whenever the target leaves the stopped state
    pub fn mark_unavailable(&mut self) {
        for watch in &mut self.watches {
            watch.value = WatchValue::Unavailable;
        }
    }

    /// Evaluate every watch against `frame_id`
    ///
    /// All requests are submitted before any is awaited; each result is
    /// independent, so one failure only affects its own watch.
    pub async fn reevaluate_all(
        &mut self,
        engine: &ProtocolEngine,
        frame_id: Option<i64>,
        timeout: Duration,
    ) -> Vec<Watch> {
        let evaluations = self.watches.iter().map(|watch| {
            let submitted = EvaluateArguments {
                expression: watch.expression.clone(),
                frame_id,
                context: Some("watch".to_string()),
            };
            let submitted = serde_json::to_value(&submitted)
                .map_err(Error::from)
                .and_then(|args| engine.submit("evaluate", Some(args)));
            async move {
                let pending = submitted?;
                match tokio::time::timeout(timeout, pending.body::<EvaluateResponseBody>()).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout("evaluate".to_string(), timeout.as_millis() as u64)),
                }
            }
        });
        let results = join_all(evaluations).await;

        for (watch, result) in self.watches.iter_mut().zip(results) {
            watch.value = match result {
                Ok(body) => WatchValue::Value {
                    result: body.result,
                    type_name: body.type_name,
                    variables_reference: body.variables_reference,
                },
                Err(e) if e.is_disconnect() => WatchValue::Unavailable,
                Err(Error::AdapterReportedFailure { message, .. }) => WatchValue::Error { message },
                Err(e) => WatchValue::Error {
                    message: e.to_string(),
                },
            };
        }
        self.watches.clone()
    }

    /// References returned by the last evaluation, expandable while stopped
    pub fn references(&self) -> impl Iterator<Item = i64> + '_ {
        self.watches.iter().filter_map(|w| match w.value {
            WatchValue::Value {
                variables_reference,
                ..
            } if variables_reference > 0 => Some(variables_reference),
            _ => None,
        })
    }
}
