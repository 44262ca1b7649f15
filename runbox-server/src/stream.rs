//! Stream hub: live frame delivery for streaming runs
//!
//! The hub is purely an id-to-subscriber registry. All frames for a run
//! originate in that run's task, which guarantees ordering: stream frames
//! precede the single terminal frame, and a subscriber's first frame is
//! always `connected`. There is no replay buffer — frames emitted before the
//! subscriber attaches are lost.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use runbox_core::{Error, Result, RunRecord};
use runbox_sandbox::{EventSink, SandboxEvent};

/// One frame on a run subscription.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Frame {
    Connected {
        #[serde(rename = "runId")]
        run_id: String,
        timestamp: DateTime<Utc>,
    },
    Status {
        stage: String,
    },
    Stdout {
        text: String,
    },
    Stderr {
        text: String,
    },
    Complete {
        record: RunRecord,
    },
    Error {
        error: String,
    },
}

#[derive(Default)]
struct Registry {
    /// In-flight runs; the subscriber slot is filled on attach. At most one
    /// subscriber per run — a new attach replaces the previous one.
    runs: HashMap<String, Option<mpsc::UnboundedSender<Frame>>>,
}

#[derive(Default)]
pub struct StreamHub {
    inner: Mutex<Registry>,
}

impl StreamHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce a run at admission so subscriptions can attach to it.
    pub async fn register(&self, run_id: &str) {
        self.inner
            .lock()
            .await
            .runs
            .insert(run_id.to_string(), None);
    }

    /// Attach the single subscriber for a run. Unknown or already finished
    /// runs are a not-found signal.
    pub async fn subscribe(&self, run_id: &str) -> Result<mpsc::UnboundedReceiver<Frame>> {
        let mut inner = self.inner.lock().await;
        let slot = inner
            .runs
            .get_mut(run_id)
            .ok_or_else(|| Error::NotFound(format!("unknown run {run_id}")))?;
        let (tx, rx) = mpsc::unbounded_channel();
        *slot = Some(tx);
        Ok(rx)
    }

    /// Deliver a frame to the run's subscriber, if any. Frames without a
    /// subscriber are dropped.
    pub async fn publish(&self, run_id: &str, frame: Frame) {
        let inner = self.inner.lock().await;
        if let Some(Some(tx)) = inner.runs.get(run_id) {
            let _ = tx.send(frame);
        }
    }

    /// Deliver the terminal frame and retire the run. Later publishes for
    /// this id are dropped, so at most one terminal frame is ever sent.
    pub async fn finish(&self, run_id: &str, frame: Frame) {
        let mut inner = self.inner.lock().await;
        if let Some(Some(tx)) = inner.runs.remove(run_id) {
            let _ = tx.send(frame);
        }
    }
}

/// Handle a running pipeline holds to report progress for one run.
#[derive(Clone)]
pub struct Progress {
    hub: Arc<StreamHub>,
    run_id: String,
}

impl Progress {
    pub fn new(hub: Arc<StreamHub>, run_id: impl Into<String>) -> Self {
        Self {
            hub,
            run_id: run_id.into(),
        }
    }

    /// Emit a coarse stage transition.
    pub async fn stage(&self, stage: &str) {
        self.hub
            .publish(
                &self.run_id,
                Frame::Status {
                    stage: stage.to_string(),
                },
            )
            .await;
    }

    /// Build the sandbox event sink plus the forwarder task that turns
    /// sandbox output segments into stream frames.
    pub fn sandbox_sink(&self) -> (EventSink, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let hub = Arc::clone(&self.hub);
        let run_id = self.run_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let frame = match event {
                    SandboxEvent::Stdout(bytes) => Frame::Stdout {
                        text: String::from_utf8_lossy(&bytes).into_owned(),
                    },
                    SandboxEvent::Stderr(bytes) => Frame::Stderr {
                        text: String::from_utf8_lossy(&bytes).into_owned(),
                    },
                };
                hub.publish(&run_id, frame).await;
            }
        });
        (tx, forwarder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribe_unknown_run_is_not_found() {
        let hub = StreamHub::new();
        assert!(matches!(
            hub.subscribe("run_missing00000").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_frames_flow_to_subscriber_in_order() {
        let hub = StreamHub::new();
        hub.register("run_a").await;
        let mut rx = hub.subscribe("run_a").await.unwrap();

        hub.publish(
            "run_a",
            Frame::Status {
                stage: "running".to_string(),
            },
        )
        .await;
        hub.publish(
            "run_a",
            Frame::Stdout {
                text: "2\n".to_string(),
            },
        )
        .await;
        hub.finish(
            "run_a",
            Frame::Error {
                error: "boom".to_string(),
            },
        )
        .await;

        assert!(matches!(rx.recv().await, Some(Frame::Status { .. })));
        assert!(matches!(rx.recv().await, Some(Frame::Stdout { .. })));
        assert!(matches!(rx.recv().await, Some(Frame::Error { .. })));
        // channel closed after the terminal frame
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_frames_before_attach_are_lost() {
        let hub = StreamHub::new();
        hub.register("run_b").await;
        hub.publish(
            "run_b",
            Frame::Stdout {
                text: "lost".to_string(),
            },
        )
        .await;

        let mut rx = hub.subscribe("run_b").await.unwrap();
        hub.publish(
            "run_b",
            Frame::Stdout {
                text: "kept".to_string(),
            },
        )
        .await;
        match rx.recv().await {
            Some(Frame::Stdout { text }) => assert_eq!(text, "kept"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_frames_after_terminal() {
        let hub = StreamHub::new();
        hub.register("run_c").await;
        let mut rx = hub.subscribe("run_c").await.unwrap();
        hub.finish(
            "run_c",
            Frame::Error {
                error: "done".to_string(),
            },
        )
        .await;
        hub.publish(
            "run_c",
            Frame::Stdout {
                text: "late".to_string(),
            },
        )
        .await;

        assert!(matches!(rx.recv().await, Some(Frame::Error { .. })));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_new_subscriber_replaces_previous() {
        let hub = StreamHub::new();
        hub.register("run_d").await;
        let mut first = hub.subscribe("run_d").await.unwrap();
        let mut second = hub.subscribe("run_d").await.unwrap();

        hub.publish(
            "run_d",
            Frame::Status {
                stage: "running".to_string(),
            },
        )
        .await;
        // replaced subscriber's channel is closed
        assert!(first.recv().await.is_none());
        assert!(matches!(second.recv().await, Some(Frame::Status { .. })));
    }

    #[tokio::test]
    async fn test_sandbox_sink_converts_events() {
        let hub = Arc::new(StreamHub::new());
        hub.register("run_e").await;
        let mut rx = hub.subscribe("run_e").await.unwrap();

        let progress = Progress::new(Arc::clone(&hub), "run_e");
        let (sink, forwarder) = progress.sandbox_sink();
        sink.send(SandboxEvent::Stdout(b"hello".to_vec())).unwrap();
        sink.send(SandboxEvent::Stderr(b"warn".to_vec())).unwrap();
        drop(sink);
        forwarder.await.unwrap();

        match rx.recv().await {
            Some(Frame::Stdout { text }) => assert_eq!(text, "hello"),
            other => panic!("unexpected frame {other:?}"),
        }
        match rx.recv().await {
            Some(Frame::Stderr { text }) => assert_eq!(text, "warn"),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn test_frame_wire_tags() {
        let frame = Frame::Stdout {
            text: "x".to_string(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert_eq!(value["type"], "stdout");
        assert_eq!(value["text"], "x");

        let frame = Frame::Connected {
            run_id: "run_x".to_string(),
            timestamp: Utc::now(),
        };
        let value: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&frame).unwrap()).unwrap();
        assert_eq!(value["type"], "connected");
        assert_eq!(value["runId"], "run_x");
    }
}
