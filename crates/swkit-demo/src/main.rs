//! Runs the cookie/cache service worker in-process against a live origin.
//!
//! ## Usage
//!
//! ```bash
//! # Install + activate the worker, then hit a few routes
//! swkit-demo fetch:/sw/generated fetch:/sw/set/cookie fetch:/app.js
//!
//! # Root-variant worker, talking over the message protocol
//! swkit-demo --variant root action:set-cookie action:get-cookie
//!
//! # Write the cookie from the page side and watch the worker mirror it
//! swkit-demo cookie:hello fetch:/sw/delete/cookie
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use swkit_common::{init_logging, load_json_config, LogConfig, LogFormat};
use swkit_net::{HttpFetcher, LoaderConfig, Request};
use swkit_sw::{
    ClientMessage, CookieAction, CookieChangeEvent, CookieStore, MemoryCookieStore, Route,
    RouteTable, Worker, WorkerConfig, WorkerHost, WorkerVariant,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

mod page;

use page::{render_log, CookieStatus};

/// Longest wait for one piece of output a step is known to produce.
const OUTPUT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "swkit-demo")]
#[command(about = "Host the cookie/cache service worker against a live origin")]
struct Cli {
    /// Worker configuration file (JSON); overrides --variant
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Built-in worker configuration (root|static)
    #[arg(long, default_value = "static")]
    variant: WorkerVariant,

    /// Origin the page and worker live on
    #[arg(long)]
    origin: Option<Url>,

    /// Log output format (pretty|compact|json)
    #[arg(long, default_value = "pretty")]
    log_format: LogFormat,

    /// Debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Network timeout in seconds (default: none)
    #[arg(long)]
    timeout: Option<u64>,

    /// Steps, run in order: fetch:<path>, action:<name>, cookie:<value>
    #[arg(required = true)]
    steps: Vec<Step>,
}

/// One thing the page does.
#[derive(Debug, Clone, PartialEq)]
enum Step {
    /// Issue a fetch for a path on the origin.
    Fetch(String),
    /// Post `{type: "action", data}` to the worker.
    Action(String),
    /// Write the worker's cookie from the page.
    Cookie(String),
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, arg) = s
            .split_once(':')
            .ok_or_else(|| format!("step '{s}' must look like kind:argument"))?;

        match kind {
            "fetch" => Ok(Step::Fetch(arg.to_string())),
            "action" => Ok(Step::Action(arg.to_string())),
            "cookie" => Ok(Step::Cookie(arg.to_string())),
            other => Err(format!("unknown step kind '{other}' (expected fetch|action|cookie)")),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(&log_config.with_format(cli.log_format))?;

    let mut config: WorkerConfig = match cli.config {
        Some(ref path) => load_json_config(path)?,
        None => WorkerConfig::for_variant(cli.variant),
    };
    if let Some(origin) = cli.origin {
        config.origin = origin;
    }

    let fetcher = HttpFetcher::new(LoaderConfig {
        timeout: cli.timeout.map(Duration::from_secs),
        ..Default::default()
    })?;

    let (store, changes) = MemoryCookieStore::new();
    let store = Arc::new(store);
    let mut cookie_feed = store.listen();

    let worker = Worker::builder(config.clone(), Arc::new(fetcher))
        .cookie_store(store.clone())
        .build();
    let (host, task) = WorkerHost::spawn(worker, Some(changes));

    host.install().await.context("install failed")?;
    host.activate().await.context("activate failed")?;
    info!(origin = %config.origin, cache = %config.cache_name, "Worker active");

    let (client, mut inbox) = host.connect_client(config.origin.clone()).await;
    debug!(%client, "Page connected");

    let routes = RouteTable::standard();
    let cookie_write = Expected::cookie_write(&config);

    for step in cli.steps {
        let expected = match step {
            Step::Fetch(path) => {
                let url = config.origin.join(&path)?;
                let route = routes.route(url.path());
                let response = host.fetch(Request::get(url)).await?;

                if response.is_network_error() {
                    println!("GET {path} -> network error");
                } else {
                    println!("GET {path} -> {} {}", response.status, response.text());
                }

                let changed_cookie = match route {
                    Route::SetCookie => true,
                    Route::DeleteCookie => response.text().ends_with("true"),
                    _ => false,
                };
                Expected {
                    logs: 1,
                    statuses: 0,
                }
                .and(changed_cookie, cookie_write)
            }
            Step::Action(name) => {
                let reply = host
                    .post_message(json!({ "type": "action", "data": name }))
                    .await?;
                match reply {
                    Some(ref value) => println!("action {name} -> {value}"),
                    None => println!("action {name} -> (no reply)"),
                }

                let changed_cookie = match CookieAction::from_name(&name) {
                    Some(CookieAction::Set) => true,
                    Some(CookieAction::Delete) => reply == Some(json!(true)),
                    _ => false,
                };
                Expected::default().and(changed_cookie, cookie_write)
            }
            Step::Cookie(value) => {
                store.set(&config.cookie_name, &value).await?;
                println!("page set {}={value}", config.cookie_name);
                cookie_write
            }
        };

        drain(expected, &mut inbox, &mut cookie_feed).await?;
    }

    host.shutdown()?;
    task.await?;
    Ok(())
}

/// Page output a step is known to produce.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
struct Expected {
    /// Worker log broadcasts.
    logs: usize,
    /// Page-side cookie change events.
    statuses: usize,
}

impl Expected {
    /// Output of one write to the configured cookie: a page status, plus a
    /// worker log when the worker's subscriptions cover the cookie.
    fn cookie_write(config: &WorkerConfig) -> Self {
        let mirrored = config
            .cookie_subscriptions
            .iter()
            .any(|s| s.matches(&config.cookie_name));

        Self {
            logs: usize::from(mirrored),
            statuses: 1,
        }
    }

    fn and(self, when: bool, other: Expected) -> Self {
        if !when {
            return self;
        }
        Self {
            logs: self.logs + other.logs,
            statuses: self.statuses + other.statuses,
        }
    }
}

/// Print the output a step produced: wait for what is expected, then take
/// anything else already delivered.
async fn drain(
    expected: Expected,
    inbox: &mut mpsc::UnboundedReceiver<ClientMessage>,
    cookie_feed: &mut broadcast::Receiver<CookieChangeEvent>,
) -> anyhow::Result<()> {
    for _ in 0..expected.logs {
        match timeout(OUTPUT_TIMEOUT, inbox.recv()).await {
            Ok(Some(message)) => println!("  {}", render_log(&message)),
            Ok(None) => break,
            Err(_) => {
                warn!("Timed out waiting for a worker broadcast");
                break;
            }
        }
    }
    while let Ok(message) = inbox.try_recv() {
        println!("  {}", render_log(&message));
    }

    let mut statuses = 0;
    while statuses < expected.statuses {
        match timeout(OUTPUT_TIMEOUT, cookie_feed.recv()).await {
            Ok(Ok(event)) => {
                print_status(&event)?;
                statuses += 1;
            }
            Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                debug!(skipped, "Cookie status feed lagged");
            }
            Ok(Err(broadcast::error::RecvError::Closed)) => break,
            Err(_) => {
                warn!("Timed out waiting for a cookie change");
                break;
            }
        }
    }
    loop {
        match cookie_feed.try_recv() {
            Ok(event) => print_status(&event)?,
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                debug!(skipped, "Cookie status feed lagged");
            }
            Err(_) => break,
        }
    }
    Ok(())
}

fn print_status(event: &CookieChangeEvent) -> anyhow::Result<()> {
    println!("  cookie status: {}", CookieStatus::from(event).to_pretty_json()?);
    Ok(())
}
