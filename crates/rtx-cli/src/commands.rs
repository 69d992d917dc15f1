use std::path::Path;

use anyhow::Context;
use colored::Colorize;
use rtx_service::ServiceConfig;
use rtx_transact::{JournalRecord, Mutation, PendingTransaction, TransactConfig, TransactionJournal};
use serde_json::json;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Journal(args) => match args.action {
            JournalAction::Inspect { path } => cmd_journal_inspect(&path, cli.format),
            JournalAction::Pending { path } => cmd_journal_pending(&path, cli.format),
        },
        Command::Config(args) => match args.action {
            ConfigAction::Check { file, kind } => cmd_config_check(&file, kind),
            ConfigAction::Default { kind } => cmd_config_default(kind),
        },
    }
}

fn describe_mutation(mutation: &Mutation) -> String {
    match mutation {
        Mutation::Path(path) => format!("path {path}"),
        Mutation::Contents(id) => format!("contents {id}"),
        Mutation::ReversePaths(id) => format!("reverse-paths {id}"),
        Mutation::Tasks(id) => format!("tasks {id}"),
    }
}

fn describe_record(record: &JournalRecord) -> String {
    match record {
        JournalRecord::Begin { transaction, node } => {
            format!("{} {} node {}", transaction.to_string().yellow(), "begin".bold(), node)
        }
        JournalRecord::Applied { transaction, mutation } => {
            format!("{} applied {}", transaction.to_string().yellow(), describe_mutation(mutation))
        }
        JournalRecord::Committed { transaction } => {
            format!("{} {}", transaction.to_string().yellow(), "committed".green())
        }
        JournalRecord::Finished { transaction } => {
            format!("{} {}", transaction.to_string().yellow(), "finished".green())
        }
        JournalRecord::RolledBack { transaction } => {
            format!("{} {}", transaction.to_string().yellow(), "rolled back".red())
        }
        JournalRecord::Checkpoint { next_transaction } => {
            format!("{} next {}", "checkpoint".cyan().bold(), next_transaction)
        }
    }
}

fn pending_json(pending: &PendingTransaction) -> serde_json::Value {
    json!({
        "transaction": pending.transaction.to_string(),
        "node": pending.node.map(|n| n.to_string()),
        "committed": pending.committed,
        "mutations": pending.mutations.iter().map(describe_mutation).collect::<Vec<_>>(),
    })
}

fn cmd_journal_inspect(path: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let (records, analysis) = TransactionJournal::inspect(path)
        .with_context(|| format!("reading journal {}", path.display()))?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    for record in &records {
        println!("  {}", describe_record(record));
    }
    println!(
        "{} records, {} pending",
        records.len().to_string().bold(),
        analysis.pending.len().to_string().bold()
    );
    if let Some(latest) = analysis.latest_committed {
        println!("Latest committed: {}", latest.to_string().yellow());
    }
    Ok(())
}

fn cmd_journal_pending(path: &Path, format: OutputFormat) -> anyhow::Result<()> {
    let (_, analysis) = TransactionJournal::inspect(path)
        .with_context(|| format!("reading journal {}", path.display()))?;

    if format == OutputFormat::Json {
        let pending: Vec<_> = analysis.pending.values().map(pending_json).collect();
        println!("{}", serde_json::to_string_pretty(&pending)?);
        return Ok(());
    }

    if analysis.pending.is_empty() {
        println!("{} No pending transactions.", "✓".green().bold());
        return Ok(());
    }
    for pending in analysis.pending.values() {
        let action = if pending.committed {
            "recommit".green()
        } else {
            "roll back".red()
        };
        println!(
            "{} ({}) -- {} mutations",
            pending.transaction.to_string().yellow().bold(),
            action,
            pending.mutations.len()
        );
        for mutation in &pending.mutations {
            println!("    {}", describe_mutation(mutation));
        }
    }
    Ok(())
}

fn cmd_config_check(file: &Path, kind: ConfigKind) -> anyhow::Result<()> {
    match kind {
        ConfigKind::Transact => {
            let config = TransactConfig::load(file)
                .with_context(|| format!("checking {}", file.display()))?;
            println!("{} {} is valid", "✓".green().bold(), file.display());
            println!("  Permits: {}", config.max_concurrent_transactions);
            println!("  Journal: {}", config.journal.path.display());
        }
        ConfigKind::Service => {
            let config = ServiceConfig::load(file)
                .with_context(|| format!("checking {}", file.display()))?;
            println!("{} {} is valid", "✓".green().bold(), file.display());
            println!("  Node: {}", config.node_id.to_string().cyan());
            println!("  Conflict retries: {}", config.conflict_retry.max_attempts);
        }
    }
    Ok(())
}

fn cmd_config_default(kind: ConfigKind) -> anyhow::Result<()> {
    let text = match kind {
        ConfigKind::Transact => TransactConfig::default().to_toml_string()?,
        ConfigKind::Service => ServiceConfig::default().to_toml_string()?,
    };
    print!("{text}");
    Ok(())
}
