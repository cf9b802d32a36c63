//! Workflow Validator CLI Tool
//!
//! Compiles workflow definition files without executing them and reports
//! every compile error found. Tasks are resolved against a dry-run executor
//! that accepts any task name, and tools declared in the file are bound to
//! placeholders, so only the definition itself is checked.
//!
//! # Usage
//!
//! ```bash
//! # Validate one or more definitions
//! workflow-validator review.yaml publish.yaml
//!
//! # Print the inferred state shape and a Mermaid diagram
//! workflow-validator --shape --mermaid review.yaml
//!
//! # Interrupts must have a checkpointer configured in the file
//! workflow-validator --strict review.yaml
//!
//! # JSON output for programmatic use
//! workflow-validator --json review.yaml
//! ```
//!
//! # Exit Codes
//!
//! - 0: All definitions compiled
//! - 1: Compile errors found
//! - 2: CLI usage error or unreadable file

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use stategraph::{
    Compiler, ExecutorCache, FnExecutor, FnTool, MemoryCheckpointer, StateShape, TaskRequest,
    ToolRegistry,
};

/// Workflow definition validator
#[derive(Parser, Debug)]
#[command(name = "workflow-validator")]
#[command(about = "Compiles workflow definitions and reports every error found")]
#[command(version)]
struct Args {
    /// Workflow definition files (YAML or JSON)
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Print the inferred state shape
    #[arg(long)]
    shape: bool,

    /// Print a Mermaid flowchart of each valid workflow
    #[arg(long)]
    mermaid: bool,

    /// Do not supply an in-memory checkpointer for interrupt nodes
    #[arg(short, long)]
    strict: bool,

    /// Output results as JSON
    #[arg(long)]
    json: bool,
}

/// Result for a single definition file
#[derive(Debug, Serialize)]
struct FileReport {
    path: String,
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    shape: Option<StateShape>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mermaid: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let mut reports = Vec::with_capacity(args.files.len());
    for path in &args.files {
        match validate_file(path, &args).await {
            Ok(report) => reports.push(report),
            Err(e) => {
                eprintln!("{} {:#}", "error:".red().bold(), e);
                return ExitCode::from(2);
            }
        }
    }

    let invalid = reports.iter().filter(|r| !r.valid).count();

    if args.json {
        match serde_json::to_string_pretty(&reports) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("{} {}", "error:".red().bold(), e);
                return ExitCode::from(2);
            }
        }
    } else {
        for report in &reports {
            print_report(report);
        }
        println!();
        println!(
            "Validated {} file(s): {} valid, {} invalid",
            reports.len(),
            reports.len() - invalid,
            invalid
        );
    }

    if invalid > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::from(0)
    }
}

async fn validate_file(path: &Path, args: &Args) -> anyhow::Result<FileReport> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("cannot read {}", path.display()))?;

    let mut compiler = Compiler::new(dry_run_executors()).with_tools(placeholder_tools(&text));
    if !args.strict {
        compiler = compiler.with_checkpointer(Arc::new(MemoryCheckpointer::new()));
    }

    let report = match compiler.compile_file(path).await {
        Ok(graph) => {
            debug!(path = %path.display(), nodes = graph.definition().nodes.len(), "definition compiled");
            FileReport {
                path: path.display().to_string(),
                valid: true,
                name: Some(graph.name().to_string()),
                errors: Vec::new(),
                shape: args.shape.then(|| graph.shape().clone()),
                mermaid: args.mermaid.then(|| graph.to_mermaid()),
            }
        }
        Err(errors) => FileReport {
            path: path.display().to_string(),
            valid: false,
            name: None,
            errors: errors.iter().map(ToString::to_string).collect(),
            shape: None,
            mermaid: None,
        },
    };
    Ok(report)
}

/// Executor that accepts every task and echoes its name
fn dry_run_executors() -> ExecutorCache {
    ExecutorCache::single(FnExecutor::new(|request: TaskRequest| async move {
        Ok(json!(format!("<{}>", request.task)))
    }))
}

/// Placeholder tools for every binding the definition declares
fn placeholder_tools(text: &str) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    // Unparseable text is reported by the compiler
    let Ok(def) = stategraph::parse(text) else {
        return registry;
    };
    for (name, spec) in &def.tools {
        let binding = spec.binding.as_deref().unwrap_or(name);
        registry.register(Arc::new(FnTool::new(
            binding,
            spec.description.clone().unwrap_or_default(),
            json!({"type": "object"}),
            |_args: Value| async { Ok(Value::Null) },
        )));
    }
    registry
}

fn print_report(report: &FileReport) {
    if report.valid {
        println!(
            "{} {} ({})",
            "✓".green().bold(),
            report.path,
            report.name.as_deref().unwrap_or_default().cyan()
        );
    } else {
        println!("{} {}", "✗".red().bold(), report.path);
        for error in &report.errors {
            println!("    {} {}", "error:".red(), error);
        }
    }

    if let Some(shape) = &report.shape {
        println!("  {}", "state shape:".bold());
        for (field, spec) in shape.fields() {
            println!(
                "    {:<24} {:<8} {:<8} written by [{}]",
                field,
                spec.field_type.to_string(),
                spec.merge.to_string(),
                spec.writers.join(", ")
            );
        }
    }

    if let Some(diagram) = &report.mermaid {
        println!();
        println!("{}", diagram);
    }
}
