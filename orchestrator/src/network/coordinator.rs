//! Network reconfiguration coordinator
//!
//! Applies a resolved [`NetworkPlan`] in three phases: bring-up, management
//! migration, bring-down. Each phase walks supporters before the coordinator.
//! An interface carrying the clustering service is changed inside a wrapper
//! that detaches clustered storage and disables clustering on that host for
//! the duration of the change. A failure ends the whole change; interfaces
//! already changed stay changed.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::{NetworkChangeRequest, NetworkPlan, PlannedChange};
use crate::constants::methods;
use crate::errors::OperationError;
use crate::operation::{Operation, OperationBody, OperationContext};
use crate::session::Connection;
use crate::snapshot::{ClusterHostRecord, IpMode, PbdRecord, PifRecord, PoolSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Up,
    Down,
}

/// Equal progress increments per host-level step
struct StepProgress {
    done: usize,
    total: usize,
}

impl StepProgress {
    fn new(total: usize) -> Self {
        Self { done: 0, total }
    }

    fn percent_at(&self, step: usize) -> u8 {
        if self.total == 0 {
            return 100;
        }
        ((step.min(self.total) * 100) / self.total) as u8
    }

    /// Window the next step's remote progress maps into
    fn window(&self) -> (u8, u8) {
        (self.percent_at(self.done), self.percent_at(self.done + 1))
    }

    fn advance(&mut self, ctx: &OperationContext<'_>, steps: usize) {
        self.done += steps;
        ctx.set_percent(self.percent_at(self.done));
    }
}

pub struct NetworkReconfiguration {
    request: NetworkChangeRequest,
    snapshot: Arc<dyn PoolSnapshot>,
}

impl NetworkReconfiguration {
    pub fn new(request: NetworkChangeRequest, snapshot: Arc<dyn PoolSnapshot>) -> Self {
        Self { request, snapshot }
    }

    /// Wrap into an operation that applies to every host the change touches
    pub fn into_operation(self, connection: Connection, title: impl Into<String>) -> Operation {
        let applies_to = NetworkPlan::resolve(&self.request, self.snapshot.as_ref())
            .map(|plan| plan.hosts.into_iter().map(|h| h.reference).collect())
            .unwrap_or_default();
        Operation::new(
            Some(connection),
            title,
            "Reconfiguring network",
            self,
        )
        .applies_to(applies_to)
        .cancel_allowed(false)
    }

    fn cluster_host_for(&self, change: &PlannedChange) -> Option<ClusterHostRecord> {
        self.snapshot
            .cluster_host_on(&change.host.reference)
            .filter(|ch| ch.pif == change.pif.reference)
    }

    #[instrument(skip_all, fields(hosts = plan.hosts.len(), steps = plan.total_steps()))]
    async fn apply(
        &self,
        ctx: &OperationContext<'_>,
        plan: &NetworkPlan,
    ) -> Result<(), OperationError> {
        let mut progress = StepProgress::new(plan.total_steps());

        for change in plan.bring_up.iter().flatten() {
            ctx.check_cancelled()?;
            ctx.set_description(format!(
                "Configuring {} on {}",
                change.pif.device, change.host.name
            ));
            self.change_interface(ctx, change, Direction::Up, progress.window())
                .await?;
            progress.advance(ctx, 1);
        }

        if plan.management.is_some() {
            self.migrate_management(ctx, plan, &mut progress).await?;
        }

        for change in plan.bring_down.iter().flatten() {
            ctx.check_cancelled()?;
            ctx.set_description(format!(
                "Disabling {} on {}",
                change.pif.device, change.host.name
            ));
            self.change_interface(ctx, change, Direction::Down, progress.window())
                .await?;
            progress.advance(ctx, 1);
        }

        Ok(())
    }

    async fn migrate_management(
        &self,
        ctx: &OperationContext<'_>,
        plan: &NetworkPlan,
        progress: &mut StepProgress,
    ) -> Result<(), OperationError> {
        let Some(management) = &plan.management else {
            return Ok(());
        };
        let connection = ctx.connection()?;

        let pool_level = plan.pool_wide
            && self
                .snapshot
                .pool()
                .is_some_and(|p| p.supports_pool_management_reconfigure)
            && connection
                .roles()
                .is_permitted(methods::POOL_MANAGEMENT_RECONFIGURE);

        if pool_level {
            ctx.check_cancelled()?;
            ctx.set_description("Moving the management interface on all hosts");
            let (start, _) = progress.window();
            let finish = progress.percent_at(progress.done + management.steps.len());
            match ctx
                .run_task(
                    methods::POOL_MANAGEMENT_RECONFIGURE,
                    json!({ "network": management.new.network }),
                    start,
                    finish,
                )
                .await
            {
                Ok(_) => {
                    info!("Management interface moved pool-wide");
                    progress.advance(ctx, management.steps.len());
                    return Ok(());
                }
                Err(OperationError::Cancelled) => return Err(OperationError::Cancelled),
                Err(e) => warn!("Pool-level management move failed, moving host by host: {}", e),
            }
        }

        for step in &management.steps {
            ctx.check_cancelled()?;
            ctx.set_description(format!(
                "Moving the management interface on {}",
                step.host.name
            ));
            let (start, finish) = progress.window();
            ctx.run_task(
                methods::HOST_MANAGEMENT_RECONFIGURE,
                json!({ "pif": step.new_pif.reference }),
                start,
                finish,
            )
            .await?;
            progress.advance(ctx, 1);
        }

        // Old addresses go only once every host has moved, in the same order
        let reached = progress.percent_at(progress.done);
        for step in &management.steps {
            let (true, Some(old)) = (step.clear_old_address, &step.old_pif) else {
                continue;
            };
            ctx.check_cancelled()?;
            info!("Clearing old management address {} on {}", old.ip, step.host.name);
            ctx.set_description(format!(
                "Clearing the old management address on {}",
                step.host.name
            ));
            ctx.run_task(methods::PIF_RECONFIGURE_IP, deconfigure_args(old), reached, reached)
                .await?;
        }
        Ok(())
    }

    /// Apply one interface change, inside the clustering wrapper when the
    /// clustering service runs over this interface.
    async fn change_interface(
        &self,
        ctx: &OperationContext<'_>,
        change: &PlannedChange,
        direction: Direction,
        (start, finish): (u8, u8),
    ) -> Result<(), OperationError> {
        let Some(cluster_host) = self.cluster_host_for(change) else {
            return reconfigure(ctx, &change.pif, direction, start, finish).await;
        };

        info!(
            "{} carries clustering on {}, detaching clustered storage first",
            change.pif.device, change.host.name
        );
        let attached: Vec<PbdRecord> = self
            .snapshot
            .pbds_on_host(&change.host.reference)
            .into_iter()
            .filter(|pbd| pbd.currently_attached && pbd.is_clustered())
            .collect();

        let mut detached: Vec<PbdRecord> = Vec::with_capacity(attached.len());
        for pbd in attached {
            let unplugged = ctx
                .run_task(methods::PBD_UNPLUG, json!({ "pbd": pbd.reference }), start, start)
                .await;
            if let Err(e) = unplugged {
                restore_clustering(ctx, None, &detached).await;
                return Err(e);
            }
            detached.push(pbd);
        }

        if let Err(e) = ctx
            .run_task(
                methods::CLUSTER_HOST_DISABLE,
                json!({ "cluster_host": cluster_host.reference }),
                start,
                start,
            )
            .await
        {
            restore_clustering(ctx, None, &detached).await;
            return Err(e);
        }

        if let Err(e) = reconfigure(ctx, &change.pif, direction, start, finish).await {
            restore_clustering(ctx, Some(&cluster_host), &detached).await;
            return Err(e);
        }

        if let Err(e) = ctx
            .run_task_to_restore(
                methods::CLUSTER_HOST_ENABLE,
                json!({ "cluster_host": cluster_host.reference }),
            )
            .await
        {
            restore_clustering(ctx, None, &detached).await;
            return Err(e);
        }

        for (index, pbd) in detached.iter().enumerate() {
            if let Err(e) = ctx
                .run_task_to_restore(methods::PBD_PLUG, json!({ "pbd": pbd.reference }))
                .await
            {
                restore_clustering(ctx, None, &detached[index + 1..]).await;
                return Err(e);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl OperationBody for NetworkReconfiguration {
    async fn run(&self, ctx: &OperationContext<'_>) -> Result<(), OperationError> {
        let plan = NetworkPlan::resolve(&self.request, self.snapshot.as_ref())?;
        let disruption = Arc::clone(ctx.connection()?.disruption());

        let signal = !self.request.management_address_changed;
        if signal {
            disruption.expect_disruption();
        }

        let outcome = self.apply(ctx, &plan).await;

        if signal {
            disruption.clear();
        }
        outcome
    }

    fn required_permissions(&self) -> Vec<String> {
        let mut required = vec![methods::PIF_RECONFIGURE_IP.to_string()];
        if self.request.management.is_some() {
            required.push(methods::HOST_MANAGEMENT_RECONFIGURE.to_string());
        }

        let clustering = NetworkPlan::resolve(&self.request, self.snapshot.as_ref())
            .map(|plan| plan.changes().any(|c| self.cluster_host_for(c).is_some()))
            .unwrap_or(false);
        if clustering {
            required.extend(
                [
                    methods::PBD_UNPLUG,
                    methods::PBD_PLUG,
                    methods::CLUSTER_HOST_DISABLE,
                    methods::CLUSTER_HOST_ENABLE,
                ]
                .iter()
                .map(|m| m.to_string()),
            );
        }
        required
    }
}

fn configure_args(pif: &PifRecord) -> Value {
    json!({
        "pif": pif.reference,
        "mode": pif.ip_mode.as_str(),
        "ip": pif.ip,
        "netmask": pif.netmask,
        "gateway": pif.gateway,
        "dns": pif.dns,
    })
}

fn deconfigure_args(pif: &PifRecord) -> Value {
    json!({
        "pif": pif.reference,
        "mode": IpMode::None.as_str(),
        "ip": "",
        "netmask": "",
        "gateway": "",
        "dns": "",
    })
}

async fn reconfigure(
    ctx: &OperationContext<'_>,
    pif: &PifRecord,
    direction: Direction,
    start: u8,
    finish: u8,
) -> Result<(), OperationError> {
    let args = match direction {
        Direction::Up => configure_args(pif),
        Direction::Down => deconfigure_args(pif),
    };
    ctx.run_task(methods::PIF_RECONFIGURE_IP, args, start, finish)
        .await?;
    Ok(())
}

/// Best effort: re-enable clustering if it was disabled, then replug what
/// was unplugged. Runs even after cancellation.
async fn restore_clustering(
    ctx: &OperationContext<'_>,
    cluster_host: Option<&ClusterHostRecord>,
    detached: &[PbdRecord],
) {
    if let Some(cluster_host) = cluster_host {
        if let Err(e) = ctx
            .run_task_to_restore(
                methods::CLUSTER_HOST_ENABLE,
                json!({ "cluster_host": cluster_host.reference }),
            )
            .await
        {
            warn!("Could not re-enable clustering on {}: {}", cluster_host.host, e);
        }
    }

    for pbd in detached {
        if let Err(e) = ctx
            .run_task_to_restore(methods::PBD_PLUG, json!({ "pbd": pbd.reference }))
            .await
        {
            warn!("Could not replug {}: {}", pbd.reference, e);
        }
    }
}
