use anyhow::{Context as _, Result};
use doorman_core::{Config, IdentityStore, OnnxAnalyzer, RecognitionEngine};
use doorman_hw::{Camera, GpioActuator, Relay};
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::EnvFilter;

mod approval;
mod capture_loop;
mod context;
mod notifier;
mod pending;
mod telegram;
#[cfg(test)]
mod testing;

use approval::ApprovalWorkflow;
use capture_loop::{open_with_retry, warm_up, CaptureLoop, CAMERA_OPEN_ATTEMPTS, CAMERA_RETRY_DELAY};
use context::{Context, Tasks};
use pending::PendingCache;
use telegram::{Listener, TelegramNotifier};

const EVENT_QUEUE_DEPTH: usize = 32;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "doormand starting");

    let config = Arc::new(Config::load().context("failed to load configuration")?);
    tracing::debug!(?config, "configuration loaded");
    let (token, chat_id) = config.telegram()?;

    for dir in [config.known_faces_dir(), config.unknown_faces_dir()] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let store = Arc::new(IdentityStore::load(config.store_path())?);
    if store.is_empty() {
        tracing::warn!("no identities enrolled; every face will require approval");
    }

    let analyzer = OnnxAnalyzer::load(&config.model_dir).context("failed to load face models")?;
    let engine = Arc::new(RecognitionEngine::new(
        Box::new(analyzer),
        store.clone(),
        config.confidence_threshold,
    ));

    let telegram = Arc::new(TelegramNotifier::new(
        &config.telegram_api_url,
        token,
        chat_id,
    )?);

    let actuator = GpioActuator::open(config.relay_gpio_pin, config.relay_active_low)
        .context("failed to configure relay GPIO")?;
    let relay = Arc::new(Relay::new(Arc::new(actuator))?);

    let ctx = Context {
        config: config.clone(),
        store,
        engine,
        relay: relay.clone(),
        pending: Arc::new(PendingCache::new()),
        tasks: Tasks::current(),
    };

    match telegram.get_me().await {
        Ok(bot) => tracing::info!(bot_id = bot.id, username = ?bot.username, "operator channel connected"),
        Err(e) => tracing::warn!(error = %e, "operator channel unreachable; alerts will retry"),
    }

    let workflow = Arc::new(ApprovalWorkflow::new(ctx.clone(), telegram.clone()));
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
    let listener = Listener::new(
        telegram,
        event_tx,
        workflow.shutdown_signal(),
        config.poll_timeout(),
    );
    ctx.tasks.spawn("operator-listener", listener.run());
    ctx.tasks.spawn("approval-dispatch", {
        let workflow = workflow.clone();
        async move {
            workflow.run(event_rx).await;
            Ok::<_, Infallible>(())
        }
    });

    let shutdown = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = oneshot::channel::<()>();
    let capture = std::thread::Builder::new()
        .name("doorman-capture".into())
        .spawn({
            let ctx = ctx.clone();
            let workflow = workflow.clone();
            let shutdown = shutdown.clone();
            move || {
                // Dropped on return or panic, which wakes the main task.
                let _done = done_tx;
                run_capture(ctx, workflow, &shutdown)
            }
        })
        .context("failed to spawn capture thread")?;

    tracing::info!("doormand ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("interrupt received"),
        _ = terminate() => tracing::info!("termination requested"),
        _ = done_rx => tracing::error!("capture loop exited"),
    }

    tracing::info!("doormand shutting down");
    shutdown.store(true, Ordering::SeqCst);
    let joined = tokio::task::spawn_blocking(move || capture.join()).await;

    relay.cleanup();
    workflow.shutdown();
    tracing::info!("shutdown complete");

    match joined {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(anyhow::anyhow!("capture thread panicked")),
        Err(e) => Err(anyhow::anyhow!("failed to join capture thread: {e}")),
    }
}

/// Open the camera and run the capture loop until `shutdown` is set.
///
/// The camera is released when this returns.
fn run_capture(ctx: Context, workflow: Arc<ApprovalWorkflow>, shutdown: &AtomicBool) -> Result<()> {
    let config = ctx.config.clone();
    let mut camera = open_with_retry(
        || Camera::open(&config.camera_device, config.camera_width, config.camera_height),
        CAMERA_OPEN_ATTEMPTS,
        CAMERA_RETRY_DELAY,
    )
    .context("could not open camera after multiple attempts")?;
    warm_up(&mut camera, config.warmup_frames);

    CaptureLoop::new(camera, ctx, workflow).run(shutdown);
    Ok(())
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}
