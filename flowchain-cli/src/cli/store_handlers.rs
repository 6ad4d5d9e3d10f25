//! State store command handlers

use crate::cli::store::StoreCommands;
use anyhow::{Context, Result};
use flowchain_core::flow::{FlowStore, JsonFlowStore};
use flowchain_core::models::{ChainRecord, ChainStatus, Configuration, FlowInstance, FlowStatus};
use std::path::PathBuf;

pub fn handle_store_commands(command: StoreCommands, config: &Configuration) -> Result<()> {
    match command {
        StoreCommands::Instances {
            resource,
            status,
            store,
            json,
        } => {
            let status = status.as_deref().map(parse_flow_status).transpose()?;
            let store = open_store(store, config)?;
            handle_store_instances(&store, resource, status, json)
        }
        StoreCommands::Transitions {
            flow_id,
            store,
            json,
        } => {
            let flow_id = uuid::Uuid::parse_str(&flow_id)
                .context("Invalid flow ID format (expected UUID)")?;
            let store = open_store(store, config)?;
            handle_store_transitions(&store, flow_id, json)
        }
        StoreCommands::Chains {
            incomplete,
            store,
            json,
        } => {
            let store = open_store(store, config)?;
            handle_store_chains(&store, incomplete, json)
        }
    }
}

fn open_store(store: Option<String>, config: &Configuration) -> Result<JsonFlowStore> {
    let path = match store {
        Some(path) => PathBuf::from(path),
        None => config.resolved_store_path()?,
    };
    tracing::debug!(path = %path.display(), "Opening state store");
    if !path.exists() {
        anyhow::bail!("State store '{}' does not exist", path.display());
    }
    JsonFlowStore::new(&path)
        .with_context(|| format!("Failed to open state store {}", path.display()))
}

fn parse_flow_status(value: &str) -> Result<FlowStatus> {
    serde_json::from_value(serde_json::Value::String(value.to_ascii_lowercase())).map_err(|_| {
        anyhow::anyhow!(
            "Unknown flow status '{}' (expected running, finished, failed or cancelled)",
            value
        )
    })
}

fn status_name<T: serde::Serialize + std::fmt::Debug>(status: &T) -> String {
    serde_json::to_value(status)
        .ok()
        .and_then(|value| value.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{:?}", status))
}

fn select_instances(
    instances: Vec<FlowInstance>,
    resource: Option<u64>,
    status: Option<FlowStatus>,
) -> Vec<FlowInstance> {
    let mut selected: Vec<FlowInstance> = instances
        .into_iter()
        .filter(|instance| resource.map_or(true, |id| instance.resource_id == id))
        .filter(|instance| status.map_or(true, |status| instance.status == status))
        .collect();
    selected.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    selected
}

fn handle_store_instances(
    store: &JsonFlowStore,
    resource: Option<u64>,
    status: Option<FlowStatus>,
    json: bool,
) -> Result<()> {
    let instances = select_instances(store.list_instances(), resource, status);

    if json {
        println!("{}", serde_json::to_string_pretty(&instances)?);
        return Ok(());
    }

    if instances.is_empty() {
        println!("No flow instances found");
        return Ok(());
    }

    println!("Flow Instances ({})", instances.len());
    println!("==============");
    for instance in &instances {
        println!(
            "{}  {:<20} resource {:<6} {:<10} {}",
            instance.flow_id,
            instance.definition,
            instance.resource_id,
            status_name(&instance.status),
            instance.current_state
        );
        if let Some(reason) = &instance.failure_reason {
            println!("    failure: {}", reason);
        }
    }
    Ok(())
}

fn handle_store_transitions(store: &JsonFlowStore, flow_id: uuid::Uuid, json: bool) -> Result<()> {
    let instance = store
        .load_instance(flow_id)
        .ok_or_else(|| anyhow::anyhow!("Flow '{}' not found", flow_id))?;
    let transitions = store.transitions(flow_id);

    if json {
        let output = serde_json::json!({
            "flow": instance,
            "transitions": transitions,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Flow {} ({})", instance.flow_id, instance.definition);
    println!("Resource:      {}", instance.resource_id);
    println!("Status:        {}", status_name(&instance.status));
    println!("Current State: {}", instance.current_state);
    println!(
        "Started At:    {}",
        instance.started_at.format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(chain_id) = instance.chain_id {
        println!("Chain:         {}", chain_id);
    }
    println!();
    println!("State Transitions:");
    println!("------------------");
    for transition in transitions {
        let duration = transition
            .duration_ms
            .map(|ms| format!(" {}ms", ms))
            .unwrap_or_default();
        println!(
            "  {} -> {} on {} ({}{}) at {}",
            transition.from_state,
            transition.to_state,
            transition.selector,
            status_name(&transition.kind),
            duration,
            transition.timestamp.format("%H:%M:%S")
        );
        if let Some(reason) = transition.failure_reason {
            println!("      {}", reason);
        }
    }
    Ok(())
}

fn select_chains(chains: Vec<ChainRecord>, incomplete: bool) -> Vec<ChainRecord> {
    let mut selected: Vec<ChainRecord> = chains
        .into_iter()
        .filter(|chain| !incomplete || chain.status == ChainStatus::Running)
        .collect();
    selected.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    selected
}

fn handle_store_chains(store: &JsonFlowStore, incomplete: bool, json: bool) -> Result<()> {
    let chains = select_chains(store.list_chains(), incomplete);

    if json {
        let output: Vec<_> = chains
            .iter()
            .map(|chain| {
                serde_json::json!({
                    "chain_id": chain.chain_id.to_string(),
                    "name": chain.name,
                    "trigger": chain.trigger_selector,
                    "resource_id": chain.resource_id,
                    "status": chain.status,
                    "next_index": chain.next_index,
                    "links": chain.links.iter().map(|link| link.event.selector()).collect::<Vec<_>>(),
                    "failure_reason": chain.failure_reason,
                    "updated_at": chain.updated_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if chains.is_empty() {
        println!("No event chains found");
        return Ok(());
    }

    println!("Event Chains ({})", chains.len());
    println!("============");
    for chain in &chains {
        println!(
            "{}  {:<30} resource {:<6} {:<8} {}/{}",
            chain.chain_id,
            chain.name,
            chain.resource_id,
            status_name(&chain.status),
            chain.next_index,
            chain.links.len()
        );
        if let Some(next) = chain.remaining().first() {
            if chain.status == ChainStatus::Running {
                println!("    next: {}", next.event.selector());
            }
        }
        if let Some(reason) = &chain.failure_reason {
            println!("    failure: {}", reason);
        }
    }
    Ok(())
}
