//! The lifecycle run loop.
//!
//! One worker consumes the cloud queue in order of receipt. Unparseable
//! messages are logged and deleted so a poison pill cannot wedge the loop;
//! parseable messages are acknowledged only after their action is emitted,
//! so a crash in between yields a safe redelivery. A second channel feeds
//! synthesized events from the investigator through the same state machine.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use chemist_metrics::ControlMetrics;
use chemist_sharding::Distributor;
use chemist_state::{Distribution, EventKind, LifecycleEvent, Repository};

use crate::interpreter::{Action, Interpreter, Outcome};
use crate::message::{parse_message, CloudMessage};
use crate::queue::{EventQueue, QueueMessage};

/// Everything the run loop needs besides the queue itself.
pub struct RunnerContext {
    pub interpreter: Arc<Interpreter>,
    pub repo: Arc<Repository>,
    pub distributor: Arc<Distributor>,
    pub distribute_tx: mpsc::Sender<Distribution>,
    pub metrics: Arc<ControlMetrics>,
}

/// Consume the cloud queue and the synthesized-event channel until shutdown.
pub async fn run_lifecycle_loop(
    queue: Arc<dyn EventQueue>,
    ctx: RunnerContext,
    mut synthetic_rx: mpsc::Receiver<LifecycleEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!("lifecycle loop started");
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                info!("lifecycle loop shutting down");
                break;
            }
            Some(event) = synthetic_rx.recv() => {
                handle_synthetic(&ctx, event).await;
            }
            batch = queue.receive() => {
                match batch {
                    Ok(messages) => {
                        for message in messages {
                            process_message(queue.as_ref(), &ctx, message).await;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "queue receive failed");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }
}

async fn process_message(queue: &dyn EventQueue, ctx: &RunnerContext, message: QueueMessage) {
    match parse_message(&message.body) {
        Err(e) => {
            // Poison-pill avoidance: drop the message, keep the loop alive.
            warn!(error = %e, receipt = %message.receipt, "dropping unparseable message");
            ctx.metrics.record_parse_failure();
            if let Err(e) = queue.delete(&message.receipt).await {
                warn!(error = %e, "failed to delete unparseable message");
            }
        }
        Ok(cloud) => match handle_event(ctx, &cloud).await {
            Ok(()) => {
                // Ack only after the action is out the door.
                if let Err(e) = queue.delete(&message.receipt).await {
                    warn!(error = %e, "failed to acknowledge message");
                }
            }
            Err(e) => {
                warn!(
                    error = %e,
                    instance = %cloud.instance_id,
                    "processing failed, leaving message for redelivery"
                );
            }
        },
    }
}

async fn handle_synthetic(ctx: &RunnerContext, event: LifecycleEvent) {
    debug!(instance = %event.instance_id, kind = event.kind.as_str(), "synthesized event");
    let cloud = CloudMessage {
        kind: event.kind.as_str().to_string(),
        asg: event.asg,
        instance_id: event.instance_id,
        time: event.time,
    };
    if let Err(e) = handle_event(ctx, &cloud).await {
        warn!(error = %e, instance = %cloud.instance_id, "synthesized event failed");
    }
}

async fn handle_event(ctx: &RunnerContext, cloud: &CloudMessage) -> crate::LifecycleResult<()> {
    let outcome = ctx.interpreter.interpret(cloud).await?;

    let kind = match cloud.kind.as_str() {
        "Launch" => Some(EventKind::Launch),
        "Terminate" => Some(EventKind::Terminate),
        _ => None,
    };
    if let Some(kind) = kind {
        ctx.repo
            .add_event(LifecycleEvent {
                kind,
                asg: cloud.asg.clone(),
                instance_id: cloud.instance_id.clone(),
                time: cloud.time.clone(),
            })
            .await;
    }
    ctx.metrics.record_lifecycle_event();

    dispatch(ctx, outcome).await;
    Ok(())
}

async fn dispatch(ctx: &RunnerContext, outcome: Outcome) {
    if let Some((flask, target)) = outcome.released {
        let distributor = ctx.distributor.clone();
        tokio::spawn(async move {
            if let Err(e) = distributor.release(&flask, &target).await {
                // The flask may already be gone; releasing is best-effort.
                debug!(flask = %flask.id, error = %e, "release instruction failed");
            }
        });
    }

    match outcome.action {
        Action::NoOp => {}
        Action::Redistributed(delta) => {
            if ctx.distribute_tx.send(delta).await.is_err() {
                warn!("distribute channel closed, delta dropped");
            }
        }
    }
}
