/// Fan-out of messages and requests over many peers.
use std::future::Future;
use std::time::Duration;

use futures::future::{join_all, try_join_all};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::error::BusError;
use crate::types::{is_truthy, Handle, RequestResponse};

/// How a broadcast request treats peers that fail to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BroadcastPolicy {
    /// Any failure fails the whole broadcast.
    #[default]
    Strict,
    /// Failures become timed-out entries in the result.
    Partial,
}

/// Options for broadcast requests.
#[derive(Debug, Clone, Default)]
pub struct BroadcastOptions {
    /// Only address peers that registered as our direct children.
    pub direct_descendants_only: bool,
    pub policy: BroadcastPolicy,
    /// Per-request timeout. `None` uses the bus default.
    pub timeout: Option<Duration>,
}

impl BroadcastOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn direct_descendants_only(mut self, only: bool) -> Self {
        self.direct_descendants_only = only;
        self
    }

    pub fn allow_partial(mut self, allow: bool) -> Self {
        self.policy = if allow {
            BroadcastPolicy::Partial
        } else {
            BroadcastPolicy::Strict
        };
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// One peer's part in a broadcast request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RequestResult {
    pub handle: Handle,
    pub response: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub timeout: bool,
}

impl RequestResult {
    pub fn answered(response: RequestResponse) -> Self {
        Self {
            handle: response.handle,
            response: Some(response.response),
            error: None,
            timeout: false,
        }
    }

    pub fn timed_out(handle: Handle) -> Self {
        Self {
            handle,
            response: None,
            error: Some("timed out".to_string()),
            timeout: true,
        }
    }

    /// Whether the peer gave a truthy answer.
    pub fn is_answered(&self) -> bool {
        self.response.as_ref().is_some_and(is_truthy)
    }
}

/// Keep the handles matching `pattern`, or all of them without one.
pub fn filter_targets(handles: Vec<Handle>, pattern: Option<&Regex>) -> Vec<Handle> {
    match pattern {
        Some(re) => handles
            .into_iter()
            .filter(|h| re.is_match(h.as_str()))
            .collect(),
        None => handles,
    }
}

/// A broadcast needs at least one real answer to count as a success.
pub fn ensure_answered(results: Vec<RequestResult>) -> Result<Vec<RequestResult>, BusError> {
    if results.iter().any(RequestResult::is_answered) {
        Ok(results)
    } else {
        Err(BusError::NoResponses)
    }
}

/// Send one request per target concurrently and gather the outcomes in
/// target order.
pub async fn fan_out_requests<F, Fut>(
    targets: Vec<Handle>,
    policy: BroadcastPolicy,
    send: F,
) -> Result<Vec<RequestResult>, BusError>
where
    F: Fn(Handle) -> Fut,
    Fut: Future<Output = Result<RequestResponse, BusError>>,
{
    let results = match policy {
        BroadcastPolicy::Strict => {
            let futures = targets.into_iter().map(|handle| {
                let fut = send(handle);
                async move { fut.await.map(RequestResult::answered) }
            });
            try_join_all(futures).await?
        }
        BroadcastPolicy::Partial => {
            let futures = targets.into_iter().map(|handle| {
                let fut = send(handle.clone());
                async move {
                    match fut.await {
                        Ok(response) => RequestResult::answered(response),
                        Err(e) => {
                            tracing::debug!(%handle, error = %e, "broadcast target did not answer");
                            RequestResult::timed_out(handle)
                        }
                    }
                }
            });
            join_all(futures).await
        }
    };
    ensure_answered(results)
}

/// Send one message per target concurrently. Fails on the first failure.
pub async fn fan_out_messages<F, Fut>(targets: Vec<Handle>, send: F) -> Result<(), BusError>
where
    F: Fn(Handle) -> Fut,
    Fut: Future<Output = Result<(), BusError>>,
{
    try_join_all(targets.into_iter().map(send)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn h(name: &str) -> Handle {
        Handle::from(name)
    }

    fn answer(handle: &Handle, value: Value) -> Result<RequestResponse, BusError> {
        Ok(RequestResponse {
            response: value,
            handle: handle.clone(),
        })
    }

    #[tokio::test]
    async fn partial_keeps_failures_as_timeouts() {
        let results = fan_out_requests(vec![h("B"), h("C")], BroadcastPolicy::Partial, |handle| async move {
            if handle == "B" {
                answer(&handle, json!({"ok": 1}))
            } else {
                Err(BusError::Timeout {
                    handle,
                    action: "ping".into(),
                })
            }
        })
        .await
        .unwrap();

        assert_eq!(
            results,
            vec![
                RequestResult::answered(RequestResponse {
                    response: json!({"ok": 1}),
                    handle: h("B"),
                }),
                RequestResult::timed_out(h("C")),
            ]
        );
    }

    #[tokio::test]
    async fn strict_fails_on_any_failure() {
        let err = fan_out_requests(vec![h("B"), h("C")], BroadcastPolicy::Strict, |handle| async move {
            if handle == "B" {
                answer(&handle, json!(true))
            } else {
                Err(BusError::Timeout {
                    handle,
                    action: "ping".into(),
                })
            }
        })
        .await
        .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn falsy_answers_do_not_count() {
        let err = fan_out_requests(vec![h("B"), h("C")], BroadcastPolicy::Strict, |handle| async move {
            answer(&handle, json!(0))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, BusError::NoResponses));
    }

    #[tokio::test]
    async fn empty_target_list_has_no_responses() {
        for policy in [BroadcastPolicy::Strict, BroadcastPolicy::Partial] {
            let err = fan_out_requests(Vec::new(), policy, |handle| async move {
                answer(&handle, json!(true))
            })
            .await
            .unwrap_err();
            assert!(matches!(err, BusError::NoResponses));
        }
    }

    #[tokio::test]
    async fn messages_fail_fast() {
        let ok = fan_out_messages(vec![h("B"), h("C")], |_| async { Ok(()) }).await;
        assert!(ok.is_ok());

        let err = fan_out_messages(vec![h("B"), h("ghost")], |handle| async move {
            if handle == "ghost" {
                Err(BusError::UnknownHandle { handle })
            } else {
                Ok(())
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, BusError::UnknownHandle { .. }));
    }

    #[test]
    fn regex_filter() {
        let re = Regex::new("^child-").unwrap();
        let kept = filter_targets(vec![h("child-1"), h("main"), h("child-2")], Some(&re));
        assert_eq!(kept, vec![h("child-1"), h("child-2")]);
        assert_eq!(filter_targets(vec![h("main")], None), vec![h("main")]);
    }

    #[test]
    fn result_serializes_like_the_wire() {
        let ok = RequestResult::answered(RequestResponse {
            response: json!({"ok": 1}),
            handle: h("B"),
        });
        assert_eq!(
            serde_json::to_value(&ok).unwrap(),
            json!({"handle": "B", "response": {"ok": 1}})
        );
        assert_eq!(
            serde_json::to_value(RequestResult::timed_out(h("C"))).unwrap(),
            json!({"handle": "C", "response": null, "error": "timed out", "timeout": true})
        );
    }

    #[test]
    fn options_builder() {
        let opts = BroadcastOptions::new()
            .direct_descendants_only(true)
            .allow_partial(true)
            .timeout(Duration::from_millis(250));
        assert!(opts.direct_descendants_only);
        assert_eq!(opts.policy, BroadcastPolicy::Partial);
        assert_eq!(opts.timeout, Some(Duration::from_millis(250)));
    }
}
