use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant, MissedTickBehavior, sleep};
use tracing::{error, info, warn};

use courier_core::breaker::{CallGate, TracingListener};
use courier_core::delivery::DeadLetter;
use courier_core::domain::{Response, Task};
use courier_core::impls::FileLedger;
use courier_core::ports::Worker;
use courier_core::{AppBuilder, CourierConfig, CourierError, LogFormat, SubmitError, WorkerError};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Mode {
    /// Circuit breaker + durable redelivery.
    Guarded,
    /// Circuit breaker only; failed calls are dropped.
    Direct,
}

/// Drive a demo worker with a steady stream of tasks.
#[derive(Debug, Parser)]
#[command(name = "courier", version)]
struct Args {
    /// JSON config file (defaults to the built-in example values)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Delivery ledger file
    #[arg(long, default_value = "courier-ledger.jsonl")]
    ledger: PathBuf,

    /// How long to generate tasks
    #[arg(long, default_value_t = 10)]
    run_secs: u64,

    /// Interval between generated tasks
    #[arg(long, default_value_t = 200)]
    tick_ms: u64,

    /// The demo worker flips between fast and slow this often
    #[arg(long, default_value_t = 5)]
    swap_secs: u64,

    #[arg(long, value_enum, default_value_t = Mode::Guarded)]
    mode: Mode,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

/// Answers at once while fast, sleeps past any sensible timeout while slow.
struct ToggleWorker {
    slow: Arc<AtomicBool>,
}

impl ToggleWorker {
    fn start(swap_every: Duration) -> Self {
        let slow = Arc::new(AtomicBool::new(false));
        let flag = slow.clone();
        tokio::spawn(async move {
            loop {
                sleep(swap_every).await;
                let now_slow = !flag.fetch_xor(true, Ordering::SeqCst);
                info!(slow = now_slow, "demo worker switched speed");
            }
        });
        Self { slow }
    }
}

#[async_trait]
impl Worker for ToggleWorker {
    async fn call(&self, task: Task) -> Result<Response, WorkerError> {
        if self.slow.load(Ordering::SeqCst) {
            sleep(Duration::from_secs(1)).await;
        }
        info!(%task, "processed task");
        Ok(Response)
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    courier_core::init_tracing(if args.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    });

    if let Err(e) = run(args).await {
        error!(error = %e, "courier failed");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), CourierError> {
    let config = match &args.config {
        Some(path) => CourierConfig::from_json_file(path)?,
        None => CourierConfig::default_v1(),
    };
    let swap_every = Duration::from_secs(args.swap_secs);
    let worker: Arc<dyn Worker> = Arc::new(ToggleWorker::start(swap_every));

    match args.mode {
        Mode::Guarded => run_guarded(&args, config, worker).await,
        Mode::Direct => run_direct(&args, config, worker).await,
    }
}

async fn run_guarded(
    args: &Args,
    config: CourierConfig,
    worker: Arc<dyn Worker>,
) -> Result<(), CourierError> {
    let ledger = FileLedger::open(&args.ledger).await?;
    let (dead_tx, mut dead_rx) = mpsc::unbounded_channel::<DeadLetter>();

    let app = AppBuilder::new(config)
        .component("demo-worker")
        .worker(worker)
        .ledger(Arc::new(ledger))
        .dead_letters(dead_tx)
        .start()
        .await?;
    let handle = app.handle();

    tokio::spawn(async move {
        while let Some(dead) = dead_rx.recv().await {
            warn!(
                delivery_id = %dead.delivery_id,
                task = %dead.envelope.task(),
                attempts = dead.attempts,
                created_at = %dead.created_at,
                last_error = dead.last_error.as_deref().unwrap_or(""),
                "dead letter"
            );
        }
    });

    let deadline = Instant::now() + Duration::from_secs(args.run_secs);
    let mut ticker = tokio::time::interval(Duration::from_millis(args.tick_ms.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut next_id = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::time::sleep_until(deadline) => break,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }

        next_id += 1;
        let task = Task::new(next_id);
        match handle.submit(task).await {
            Ok(submission) => {
                let delivery_id = submission.delivery_id;
                tokio::spawn(async move {
                    if submission.response.await.is_ok() {
                        info!(%delivery_id, %task, "response received");
                    }
                });
            }
            Err(SubmitError::BackpressureRejected { pending, limit }) => {
                warn!(%task, pending, limit, "task rejected by backpressure");
            }
            Err(e) => return Err(e.into()),
        }
    }

    if let Some(counts) = handle.counts().await {
        info!(
            pending = counts.pending,
            submitted = counts.submitted,
            confirmed = counts.confirmed,
            redelivered = counts.redelivered,
            rejected = counts.rejected,
            "run finished"
        );
    }
    app.shutdown_and_join().await
}

/// Breaker only: every tick is one call, failures are logged and dropped.
async fn run_direct(
    args: &Args,
    config: CourierConfig,
    worker: Arc<dyn Worker>,
) -> Result<(), CourierError> {
    config.validate()?;
    let (gate, gate_join) = CallGate::spawn(
        "demo-worker",
        config.breaker.clone(),
        worker,
        Arc::new(TracingListener),
        config.mailbox_capacity,
    );

    let deadline = Instant::now() + Duration::from_secs(args.run_secs);
    let mut ticker = tokio::time::interval(Duration::from_millis(args.tick_ms.max(1)));
    let mut next_id = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::time::sleep_until(deadline) => break,
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }

        next_id += 1;
        let task = Task::new(next_id);
        let gate = gate.clone();
        tokio::spawn(async move {
            match gate.call(task).await {
                Ok(_) => info!(%task, "response received"),
                Err(e) => warn!(%task, error = %e, "call failed"),
            }
        });
    }

    if let Ok(snapshot) = gate.snapshot().await {
        info!(
            state = ?snapshot.state,
            admitted = snapshot.admitted,
            rejected = snapshot.rejected,
            opened = snapshot.opened,
            "run finished"
        );
    }
    gate.shutdown().await;
    gate_join
        .await
        .map_err(|e| CourierError::Other(format!("call gate task failed: {e}")))
}
