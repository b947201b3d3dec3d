//! Handler services.
//!
//! A handler is any `tower::Service<HandlerRequest, Response = String>`; the
//! registry stores it boxed as a [`HandlerSvc`]. Helpers here cover the common
//! shapes: async closures, fixed replies and external processes.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tower::util::BoxCloneSyncService;
use tower::{BoxError, Service};
use tracing::debug;

use crate::handoff::HandlerRequest;

/// Boxed handler service type alias.
pub type HandlerSvc = BoxCloneSyncService<HandlerRequest, String, BoxError>;

/// Create a handler from an async function of the request.
pub fn handler_fn<F, Fut>(f: F) -> HandlerSvc
where
    F: Fn(HandlerRequest) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Result<String, BoxError>> + Send + 'static,
{
    BoxCloneSyncService::new(tower::service_fn(f))
}

/// A handler that always answers with the same raw output.
pub fn static_reply(raw: impl Into<String>) -> HandlerSvc {
    let raw: String = raw.into();
    handler_fn(move |_req: HandlerRequest| {
        let raw = raw.clone();
        async move { Ok::<_, BoxError>(raw) }
    })
}

/// A handler backed by an external program.
pub fn process_handler(program: impl Into<String>, args: Vec<String>) -> HandlerSvc {
    BoxCloneSyncService::new(ProcessHandler {
        program: program.into(),
        args,
    })
}

/// Runs a program per invocation: the request JSON goes to stdin, stdout is
/// the raw output. A non-zero exit status is an invocation error. The child
/// is killed when the request's cancellation token fires, and when the call
/// future is dropped (a step timeout).
#[derive(Debug, Clone)]
pub struct ProcessHandler {
    program: String,
    args: Vec<String>,
}

impl Service<HandlerRequest> for ProcessHandler {
    type Response = String;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: HandlerRequest) -> Self::Future {
        let program = self.program.clone();
        let args = self.args.clone();
        Box::pin(async move {
            let input = serde_json::to_vec(&req.to_json())?;
            debug!(program = %program, handler = %req.handler, "spawning handler process");
            let mut child = Command::new(&program)
                .args(&args)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| format!("cannot spawn {}: {}", program, e))?;

            let mut stdout = child.stdout.take().ok_or("stdout not captured")?;
            let mut stderr = child.stderr.take().ok_or("stderr not captured")?;
            let out_task = tokio::spawn(async move {
                let mut buf = String::new();
                stdout.read_to_string(&mut buf).await.map(|_| buf)
            });
            let err_task = tokio::spawn(async move {
                let mut buf = String::new();
                stderr.read_to_string(&mut buf).await.map(|_| buf)
            });

            if let Some(mut stdin) = child.stdin.take() {
                // A program that ignores its input may exit before reading it.
                if let Err(e) = stdin.write_all(&input).await {
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        return Err(e.into());
                    }
                }
            }

            let waited = tokio::select! {
                res = child.wait() => Some(res),
                _ = req.cancel.cancelled() => None,
            };
            let status = match waited {
                Some(res) => res?,
                None => {
                    let _ = child.start_kill();
                    return Err("handler process cancelled".into());
                }
            };
            let out = out_task.await??;
            let err = err_task.await??;
            if !status.success() {
                return Err(format!("{} exited with {}: {}", program, status, err.trim()).into());
            }
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context as HandoffContext;
    use crate::registry::HandlerId;
    use crate::task::Task;
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn request() -> HandlerRequest {
        let task = Task::with_id("t-1", "hello");
        let context = HandoffContext::for_task(&task, 1024).unwrap();
        HandlerRequest {
            task,
            handler: HandlerId::from("echo"),
            context,
            attempt: 0,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn static_reply_returns_fixed_output() {
        let svc = static_reply(r#"{"result": 1}"#);
        let out = svc.oneshot(request()).await.unwrap();
        assert_eq!(out, r#"{"result": 1}"#);
    }

    #[tokio::test]
    async fn handler_fn_sees_request() {
        let svc = handler_fn(|req: HandlerRequest| async move {
            Ok::<_, BoxError>(format!("{}:{}", req.handler, req.attempt))
        });
        let out = svc.oneshot(request()).await.unwrap();
        assert_eq!(out, "echo:0");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_handler_pipes_request_through_stdin() {
        let svc = process_handler("cat", vec![]);
        let out = svc.oneshot(request()).await.unwrap();
        let v: serde_json::Value = serde_json::from_str(&out).unwrap();
        assert_eq!(v["task_id"], "t-1");
        assert_eq!(v["payload"], "hello");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_handler_reports_failure_status() {
        let svc = process_handler("sh", vec!["-c".into(), "echo nope >&2; exit 3".into()]);
        let err = svc.oneshot(request()).await.unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timed_out_process_is_killed() {
        use crate::resilience::TimeoutLayer;
        use std::time::Duration;
        use tower::Layer;

        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let script = format!("sleep 0.4; touch {}", marker.display());
        let svc = TimeoutLayer::new(Duration::from_millis(50))
            .layer(process_handler("sh", vec!["-c".into(), script]));

        let err = svc.oneshot(request()).await.unwrap_err();
        assert!(err.to_string().contains("timed out"));

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(!marker.exists());
    }
}
