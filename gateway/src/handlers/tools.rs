//! Tools command handlers
//!
//! List the aggregated registry, call a tool once, or report backend status.
//! Each command connects the pool, does its work, and disconnects.

use anyhow::{Context, Result};
use std::collections::BTreeMap;

use super::{log_report, CommandContext};
use crate::pool::BackendPool;

async fn connected_pool(ctx: &CommandContext) -> Result<BackendPool> {
    if ctx.config.backends.is_empty() {
        println!("No backends configured.");
        println!("Create .mcp-gateway.json or .mcp-gateway.toml to add some.");
    }

    let pool = BackendPool::from_config(&ctx.config);
    let report = pool.connect().await?;
    log_report(&report);
    Ok(pool)
}

/// Handle the `tools` command - list the aggregated tool registry
pub async fn run_tools(ctx: &CommandContext, backend_filter: Option<String>) -> Result<()> {
    let pool = connected_pool(ctx).await?;

    let tools: Vec<_> = pool
        .registered_tools()
        .await
        .into_iter()
        .filter(|t| backend_filter.as_ref().map_or(true, |b| &t.owner == b))
        .collect();

    if tools.is_empty() {
        println!("No tools found.");
    }

    // Group by backend
    let mut by_backend: BTreeMap<String, Vec<_>> = BTreeMap::new();
    for tool in tools {
        by_backend.entry(tool.owner.clone()).or_default().push(tool);
    }

    for (backend, tools) in by_backend {
        println!("=== {} ({} tools) ===", backend, tools.len());
        for tool in tools {
            let desc = tool
                .descriptor
                .description
                .as_deref()
                .unwrap_or("No description")
                .lines()
                .next()
                .unwrap_or("");
            if tool.descriptor.name == tool.backend_name {
                println!("  {} - {}", tool.descriptor.name, desc);
            } else {
                println!("  {} ({}) - {}", tool.descriptor.name, tool.backend_name, desc);
            }
        }
        println!();
    }

    pool.disconnect().await;
    Ok(())
}

/// Handle the `call` command - route one call and print the raw result
pub async fn run_call_tool(ctx: &CommandContext, tool: &str, args: Option<String>) -> Result<()> {
    let arguments: serde_json::Value = match args {
        Some(json) => serde_json::from_str(&json).context("--args must be valid JSON")?,
        None => serde_json::json!({}),
    };

    let pool = connected_pool(ctx).await?;
    let outcome = pool.execute_tool(tool, arguments).await;
    pool.disconnect().await;

    let result = outcome.with_context(|| format!("Calling '{}' failed", tool))?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Handle the `status` command - connect every backend and report
pub async fn run_status(ctx: &CommandContext) -> Result<()> {
    if let Some(path) = &ctx.config_path {
        println!("Config: {}", path.display());
    }

    let pool = connected_pool(ctx).await?;
    let report = pool.status().await;
    let tools = pool.registered_tools().await;

    for backend in pool.backend_ids() {
        match report.failed.iter().find(|f| f.backend == backend) {
            Some(failure) => println!("  ✗ {} - {}", backend, failure.error),
            None => {
                let count = tools.iter().filter(|t| t.owner == backend).count();
                println!("  ✓ {} ({} tools)", backend, count);
            }
        }
    }

    for collision in &report.collisions {
        println!(
            "  ! '{}' exposed by both '{}' and '{}'",
            collision.tool, collision.winner, collision.loser
        );
    }

    pool.disconnect().await;
    Ok(())
}
