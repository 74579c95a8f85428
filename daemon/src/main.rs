use std::sync::Arc;

use log::{error, info};
use tokio::select;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use ivygate::dlt645::codec::PlainCipher;
use ivygate_daemon::commands::{run_command_worker, MeterCommand};
use ivygate_daemon::config::{parse_args, parse_config, Config};
use ivygate_daemon::error::GatewayError;
use ivygate_daemon::events::{run_event_log_worker, EventService};
use ivygate_daemon::manager::{run_sweep_task, ConnectionManager};
use ivygate_daemon::poller::run_polling_worker;
use ivygate_daemon::server::{run_tcp_server, ServerContext};

// Tracks ctrl+c and turns it into a cancellation every worker observes.
fn run_shutdown_thread(
    task_tracker: &TaskTracker,
    manager: Arc<ConnectionManager>,
    shutdown_token: CancellationToken,
) {
    task_tracker.spawn(async move {
        select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    error!("unable to listen for shutdown signal: {err}");
                }
            }
            _ = shutdown_token.cancelled() => {}
        }
        info!("shutting down, closing meter connections...");
        shutdown_token.cancel();
        manager.shutdown().await;
    });
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), GatewayError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = parse_args();
    let config: Config = parse_config(&args.config_path).await?;
    config.validate()?;

    let task_tracker = TaskTracker::new();
    let shutdown_token = CancellationToken::new();

    let event_service = EventService::new();
    let events = event_service.new_handler();
    let manager = ConnectionManager::new(config.tcp.clone(), events.clone());
    let ctx = ServerContext::new(manager.clone(), config.clone(), events)?;

    run_event_log_worker(&task_tracker, event_service, shutdown_token.clone());
    run_sweep_task(&task_tracker, manager.clone(), shutdown_token.clone());
    run_polling_worker(
        &task_tracker,
        ctx.clone(),
        config.polling.clone(),
        config.dlms.clone(),
        shutdown_token.clone(),
    );

    // the broker bridge (out of process) drives this channel; holding the
    // sender here keeps the worker alive for the daemon's lifetime
    let (command_tx, command_rx) = tokio::sync::mpsc::channel::<MeterCommand>(16);
    run_command_worker(
        &task_tracker,
        ctx.clone(),
        Arc::new(PlainCipher),
        command_rx,
        shutdown_token.clone(),
    );

    run_tcp_server(&task_tracker, ctx, shutdown_token.clone()).await?;
    run_shutdown_thread(&task_tracker, manager, shutdown_token);

    task_tracker.close();
    task_tracker.wait().await;
    drop(command_tx);

    info!("gateway stopped");
    Ok(())
}
