//! A single spawned task owning one device's mutable transport state,
//! serializing all requests to it through an mpsc channel. This is what
//! gives a `Device` its per-device mutual exclusion without putting a
//! `Mutex` on the hot I/O path.
//!
//! Grounded verbatim in structure on `raffber-comsrv/comsrv/src/iotask.rs`.

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task;

/// Implemented by the per-device state machine that actually owns a
/// transport and knows how to turn a request into a response.
#[async_trait]
pub trait IoHandler: Send + Sized + 'static {
    type Request: Send + 'static;
    type Response: Send + 'static;

    async fn handle(&mut self, req: Self::Request) -> crate::error::Result<Self::Response>;

    /// Called once when the task is torn down, so the handler can close
    /// its transport cleanly.
    async fn disconnect(&mut self) {}
}

enum RequestMsg<T: IoHandler> {
    Task {
        req: T::Request,
        answer: oneshot::Sender<crate::error::Result<T::Response>>,
    },
    Drop,
}

/// A cloneable handle to a running `IoHandler` task. Cloning shares the
/// same underlying task and channel, so every clone serializes through the
/// same single-threaded handler.
pub struct IoTask<T: IoHandler> {
    tx: mpsc::UnboundedSender<RequestMsg<T>>,
}

impl<T: IoHandler> Clone for IoTask<T> {
    fn clone(&self) -> Self {
        IoTask { tx: self.tx.clone() }
    }
}

impl<T: IoHandler> IoTask<T> {
    pub fn new(mut handler: T) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<RequestMsg<T>>();
        task::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    RequestMsg::Task { req, answer } => {
                        let result = handler.handle(req).await;
                        let _ = answer.send(result);
                    }
                    RequestMsg::Drop => {
                        handler.disconnect().await;
                        break;
                    }
                }
            }
        });
        IoTask { tx }
    }

    /// Sends `req` and awaits its response. Serialized with every other
    /// in-flight call against the same handler: requests are processed one
    /// at a time, in arrival order.
    pub async fn request(&self, req: T::Request) -> crate::error::Result<T::Response> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(RequestMsg::Task { req, answer: tx })
            .map_err(|_| crate::error::Error::internal(anyhow::anyhow!("device task is no longer running")))?;
        rx.await
            .map_err(|_| crate::error::Error::internal(anyhow::anyhow!("device task dropped the response channel")))?
    }

    /// Tears the task down, letting the handler close its transport.
    pub fn shutdown(&self) {
        let _ = self.tx.send(RequestMsg::Drop);
    }

    /// Resolves once the task has drained its queue and stopped.
    pub async fn wait_for_closed(&self) {
        self.tx.closed().await;
    }
}
