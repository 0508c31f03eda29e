use anyhow::Context;
use serde_json::{json, Value};

use redeliver_infra::failed_events::{FailedEventStore, RetryOrchestrator};

use crate::cli::AdminCommand;

/// Run one operator command and return its result as JSON.
pub async fn execute<S: FailedEventStore>(
    orchestrator: &RetryOrchestrator<S>,
    command: &AdminCommand,
) -> anyhow::Result<Value> {
    let value = match command {
        AdminCommand::Stats => serde_json::to_value(orchestrator.get_stats().await?)?,
        AdminCommand::List(args) => serde_json::to_value(orchestrator.find(&args.filter()).await?)?,
        AdminCommand::Show { id } => {
            let record = orchestrator
                .find_by_id(*id)
                .await?
                .with_context(|| format!("failed event {id} not found"))?;
            serde_json::to_value(record)?
        }
        AdminCommand::Retry { id } => serde_json::to_value(orchestrator.retry_manually(*id).await?)?,
        AdminCommand::Resolve {
            id,
            resolved_by,
            reason,
        } => serde_json::to_value(orchestrator.resolve_manually(*id, resolved_by, reason).await?)?,
        AdminCommand::Remove { id } => {
            orchestrator.remove(*id).await?;
            json!({ "removed": id })
        }
    };
    Ok(value)
}
