//! Flow definition command handlers

use crate::cli::flows::FlowCommands;
use anyhow::{Context, Result};
use flowchain_core::flow::{FlowGraph, FlowValidator, TransitionView};
use flowchain_core::flows;
use std::sync::Arc;

pub fn handle_flow_commands(command: FlowCommands) -> Result<()> {
    let graphs = flows::graphs().context("Failed to build flow definitions")?;
    match command {
        FlowCommands::List { json } => handle_flow_list(&graphs, json),
        FlowCommands::Validate { json } => handle_flow_validate(&graphs, json),
        FlowCommands::Describe { definition, json } => {
            handle_flow_describe(&graphs, &definition, json)
        }
    }
}

fn handle_flow_list(graphs: &[Arc<dyn FlowGraph>], json: bool) -> Result<()> {
    if json {
        let output: Vec<_> = graphs
            .iter()
            .map(|graph| {
                serde_json::json!({
                    "id": graph.id(),
                    "display_name": graph.display_name(),
                    "init_events": init_events(graph.as_ref()),
                    "states": graph.states().len(),
                    "transitions": graph.transitions().len(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Flow Definitions ({})", graphs.len());
    println!("================");
    for graph in graphs {
        println!("  {:<22} {}", graph.id(), graph.display_name());
        println!("    started by: {}", init_events(graph.as_ref()).join(", "));
    }
    Ok(())
}

fn handle_flow_validate(graphs: &[Arc<dyn FlowGraph>], json: bool) -> Result<()> {
    let mut reports = Vec::new();
    let mut valid = true;
    for graph in graphs {
        let result = FlowValidator::validate_definition(graph.as_ref());
        valid &= result.is_valid();
        reports.push((graph.id(), result.error_messages(), result.warnings));
    }
    let ownership =
        FlowValidator::validate_selector_ownership(graphs.iter().map(|graph| graph.as_ref()));
    valid &= ownership.is_valid();

    if json {
        let definitions: Vec<_> = reports
            .iter()
            .map(|(id, errors, warnings)| {
                serde_json::json!({
                    "id": id,
                    "valid": errors.is_empty(),
                    "errors": errors,
                    "warnings": warnings,
                })
            })
            .collect();
        let output = serde_json::json!({
            "valid": valid,
            "definitions": definitions,
            "selector_errors": ownership.error_messages(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        for (id, errors, warnings) in &reports {
            if errors.is_empty() {
                println!("✅ {}", id);
            } else {
                println!("❌ {}", id);
                for error in errors {
                    println!("   - {}", error);
                }
            }
            for warning in warnings {
                println!("   ⚠️  {}", warning);
            }
        }
        for error in ownership.error_messages() {
            println!("❌ {}", error);
        }
    }

    if !valid {
        anyhow::bail!("Flow definitions are invalid");
    }
    Ok(())
}

fn handle_flow_describe(graphs: &[Arc<dyn FlowGraph>], definition: &str, json: bool) -> Result<()> {
    let graph = graphs
        .iter()
        .find(|graph| graph.id() == definition)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "Flow definition '{}' not found. Use 'flowchain flows list' to see available definitions.",
                definition
            )
        })?;

    if json {
        let output = serde_json::json!({
            "id": graph.id(),
            "display_name": graph.display_name(),
            "init_state": graph.init_state(),
            "final_state": graph.final_state(),
            "failure_handled_event": graph.failure_handled_event(),
            "retryable_event": graph.retryable_event(),
            "transitions": graph.transitions(),
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{} ({})", graph.display_name(), graph.id());
    println!("Initial state:         {}", graph.init_state());
    println!("Final state:           {}", graph.final_state());
    println!("Failure handled event: {}", graph.failure_handled_event());
    println!("Retryable event:       {}", graph.retryable_event());
    println!();
    println!("Transitions:");
    for transition in graph.transitions() {
        println!("  {}", describe_transition(&transition));
    }
    Ok(())
}

fn init_events(graph: &dyn FlowGraph) -> Vec<&'static str> {
    graph
        .transitions()
        .iter()
        .filter(|transition| transition.source == graph.init_state())
        .map(|transition| transition.event)
        .collect()
}

/// `SOURCE --EVENT--> TARGET` with the continuations of the target state
fn describe_transition(transition: &TransitionView) -> String {
    let mut line = format!(
        "{} --{}--> {}",
        transition.source, transition.event, transition.target
    );
    match transition.success_event {
        Some(success) => line.push_str(&format!(" (then {})", success)),
        None if !transition.target.ends_with("FINAL_STATE") => line.push_str(" (waits)"),
        None => {}
    }
    if transition.failure_state != transition.target {
        line.push_str(&format!(
            " [on failure {} -> {}]",
            transition.failure_event, transition.failure_state
        ));
    }
    line
}
