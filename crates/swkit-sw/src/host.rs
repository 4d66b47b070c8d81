//! Event loop hosting a [`Worker`].
//!
//! Lifecycle, fetch and message events each become their own tokio task, so
//! a slow network fetch never holds up another event. Cookie changes go
//! through a single task and are handled one at a time, in the order the
//! store reported them.

use serde_json::Value as JsonValue;
use swkit_net::{Request, Response};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::clients::ClientId;
use crate::cookies::CookieChangeEvent;
use crate::message::{ClientMessage, MessageEvent};
use crate::worker::{Worker, WorkerEvent};
use crate::ServiceWorkerError;

enum HostCommand {
    Lifecycle(WorkerEvent, oneshot::Sender<Result<(), ServiceWorkerError>>),
    Fetch(Request, oneshot::Sender<Response>),
    Message(MessageEvent),
    Shutdown,
}

/// Runs a worker's event loop.
pub struct WorkerHost;

impl WorkerHost {
    /// Start the loop on the current tokio runtime.
    ///
    /// `cookie_changes` is the worker-side change feed of the cookie store;
    /// each event on it is dispatched as a `cookiechange` event.
    pub fn spawn(
        worker: Worker,
        cookie_changes: Option<mpsc::UnboundedReceiver<CookieChangeEvent>>,
    ) -> (HostHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(worker.clone(), commands_rx, cookie_changes));

        (
            HostHandle {
                commands: commands_tx,
                worker,
            },
            task,
        )
    }
}

async fn run(
    worker: Worker,
    mut commands: mpsc::UnboundedReceiver<HostCommand>,
    mut cookie_changes: Option<mpsc::UnboundedReceiver<CookieChangeEvent>>,
) {
    info!(?worker, "Worker host started");

    let (ordered_tx, ordered_rx) = mpsc::unbounded_channel();
    let ordered = tokio::spawn(run_in_order(worker.clone(), ordered_rx));

    loop {
        let mut changes_closed = false;

        tokio::select! {
            command = commands.recv() => match command {
                Some(HostCommand::Shutdown) | None => break,
                Some(command) => handle_command(&worker, command),
            },
            change = next_change(&mut cookie_changes) => match change {
                Some(change) => {
                    // The ordered task only stops once this sender is dropped.
                    let _ = ordered_tx.send(WorkerEvent::CookieChange(change));
                }
                None => changes_closed = true,
            },
        }

        if changes_closed {
            debug!("Cookie change feed closed");
            cookie_changes = None;
        }
    }

    drop(ordered_tx);
    if let Err(e) = ordered.await {
        error!(error = %e, "Ordered event task failed");
    }

    info!("Worker host stopped");
}

/// Handle events strictly one after another.
async fn run_in_order(worker: Worker, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    while let Some(event) = events.recv().await {
        let kind = event.kind();
        if let Err(e) = worker.dispatch(event).settle().await {
            error!(event = kind, error = %e, "Event handler failed");
        }
    }
}

async fn next_change(
    feed: &mut Option<mpsc::UnboundedReceiver<CookieChangeEvent>>,
) -> Option<CookieChangeEvent> {
    match feed {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn handle_command(worker: &Worker, command: HostCommand) {
    let worker = worker.clone();

    match command {
        HostCommand::Lifecycle(event, reply) => {
            tokio::spawn(async move {
                let result = worker.dispatch(event).settle().await.map(drop);
                let _ = reply.send(result);
            });
        }
        HostCommand::Fetch(request, reply) => {
            tokio::spawn(async move {
                let response = intercept(&worker, request).await;
                let _ = reply.send(response);
            });
        }
        HostCommand::Message(event) => spawn_event(&worker, WorkerEvent::Message(event)),
        HostCommand::Shutdown => {}
    }
}

fn spawn_event(worker: &Worker, event: WorkerEvent) {
    let kind = event.kind();
    let dispatch = worker.dispatch(event);

    tokio::spawn(async move {
        if let Err(e) = dispatch.settle().await {
            error!(event = kind, error = %e, "Event handler failed");
        }
    });
}

/// Route through the worker once it is active; before that, go straight to
/// the network. Failures reach the page as a network error.
async fn intercept(worker: &Worker, request: Request) -> Response {
    let url = request.url.clone();

    let result = if worker.state().await.can_intercept_fetch() {
        worker.fetch(request).await
    } else {
        debug!(url = %url, "Worker not active, fetching directly");
        worker
            .fetcher()
            .fetch(&request)
            .await
            .map_err(ServiceWorkerError::from)
    };

    result.unwrap_or_else(|e| {
        warn!(url = %url, error = %e, "Fetch failed");
        Response::network_error()
    })
}

/// Handle for talking to a running [`WorkerHost`].
#[derive(Clone)]
pub struct HostHandle {
    commands: mpsc::UnboundedSender<HostCommand>,
    worker: Worker,
}

impl HostHandle {
    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    fn send(&self, command: HostCommand) -> Result<(), ServiceWorkerError> {
        self.commands
            .send(command)
            .map_err(|_| ServiceWorkerError::HostStopped)
    }

    async fn lifecycle(&self, event: WorkerEvent) -> Result<(), ServiceWorkerError> {
        let (tx, rx) = oneshot::channel();
        self.send(HostCommand::Lifecycle(event, tx))?;
        rx.await.map_err(|_| ServiceWorkerError::HostStopped)?
    }

    pub async fn install(&self) -> Result<(), ServiceWorkerError> {
        self.lifecycle(WorkerEvent::Install).await
    }

    pub async fn activate(&self) -> Result<(), ServiceWorkerError> {
        self.lifecycle(WorkerEvent::Activate).await
    }

    /// Issue a page fetch. Only fails if the host is gone.
    pub async fn fetch(&self, request: Request) -> Result<Response, ServiceWorkerError> {
        let (tx, rx) = oneshot::channel();
        self.send(HostCommand::Fetch(request, tx))?;
        rx.await.map_err(|_| ServiceWorkerError::HostStopped)
    }

    /// Post a message with a reply port and wait for the reply.
    ///
    /// `None` means the worker finished without replying.
    pub async fn post_message(
        &self,
        data: JsonValue,
    ) -> Result<Option<JsonValue>, ServiceWorkerError> {
        let (event, reply) = MessageEvent::with_reply(data);
        self.send(HostCommand::Message(event))?;
        Ok(reply.await.ok())
    }

    /// Open a page. It starts out controlled only if the worker is active.
    pub async fn connect_client(
        &self,
        url: Url,
    ) -> (ClientId, mpsc::UnboundedReceiver<ClientMessage>) {
        let controlled = self.worker.state().await.can_intercept_fetch();
        self.worker.clients().connect(url, controlled).await
    }

    /// Stop the loop. Tasks already spawned run to completion.
    pub fn shutdown(&self) -> Result<(), ServiceWorkerError> {
        self.send(HostCommand::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WorkerConfig;
    use crate::ServiceWorkerState;
    use std::sync::Arc;
    use swkit_net::{HttpFetcher, LoaderConfig};

    fn worker() -> Worker {
        let fetcher = Arc::new(HttpFetcher::new(LoaderConfig::default()).unwrap());
        Worker::builder(WorkerConfig::default(), fetcher).build()
    }

    #[tokio::test]
    async fn test_lifecycle_through_host() {
        let (host, task) = WorkerHost::spawn(worker(), None);

        host.install().await.unwrap();
        host.activate().await.unwrap();
        assert_eq!(host.worker().state().await, ServiceWorkerState::Activated);

        host.shutdown().unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_calls_after_shutdown_fail() {
        let (host, task) = WorkerHost::spawn(worker(), None);
        host.shutdown().unwrap();
        task.await.unwrap();

        assert!(matches!(
            host.install().await,
            Err(ServiceWorkerError::HostStopped)
        ));
        assert!(matches!(
            host.fetch(Request::parse_get("http://localhost:8080/").unwrap()).await,
            Err(ServiceWorkerError::HostStopped)
        ));
    }

    #[tokio::test]
    async fn test_client_control_depends_on_activation() {
        let (host, _task) = WorkerHost::spawn(worker(), None);
        let page = Url::parse("http://localhost:8080/").unwrap();

        let (early, _rx1) = host.connect_client(page.clone()).await;
        host.install().await.unwrap();
        host.activate().await.unwrap();
        let (late, _rx2) = host.connect_client(page).await;

        let clients = host.worker().clients();
        // The default configuration claims open pages on activation.
        assert!(clients.get(early).await.unwrap().controlled);
        assert!(clients.get(late).await.unwrap().controlled);
    }
}
