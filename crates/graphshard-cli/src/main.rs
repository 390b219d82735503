//! # graphshard CLI
//!
//! Drives the sharding pipeline stage by stage or end to end.
//!
//! ## Usage
//!
//! ```bash
//! # Everything, using ./graphshard.toml
//! graphshard run
//!
//! # Single stages
//! graphshard assign-vids --config cluster.toml
//! graphshard load-rels person_knows_person forum_hasTag_tag
//! ```

use colored::Colorize;
use graphshard_core::RelationType;
use graphshard_storage::config::DEFAULT_CONFIG_FILE;
use graphshard_storage::{
    logging, open_shard_stores, GraphshardConfig, MetisPartitioner, Pipeline, PipelineError,
    ShardLoader, ShardStore,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::process;
use std::time::{Duration, Instant};
use tracing::{debug, info};

type Loader = ShardLoader<Box<dyn ShardStore>>;

// =============================================================================
// Main Entry Point
// =============================================================================

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config_path, positional) = split_config_flag(&args);

    let command = match positional.first() {
        Some(command) => command.as_str(),
        None => {
            print_help();
            return;
        }
    };
    if matches!(command, "--help" | "-h" | "help") {
        print_help();
        return;
    }

    let config = match GraphshardConfig::load(Some(config_path)) {
        Ok(config) => config,
        Err(e) => fail(&format!("Failed to load {config_path}: {e}")),
    };
    logging::init_from_config(&config.logging);
    debug!(config = config_path, "Configuration loaded");

    if command == "config" {
        match config.to_toml() {
            Ok(toml) => print!("{toml}"),
            Err(e) => fail(&e.to_string()),
        }
        return;
    }

    let pipeline = match Pipeline::new(config) {
        Ok(pipeline) => pipeline,
        Err(e) => fail(&e.to_string()),
    };

    let started = Instant::now();
    info!(command, shard_count = pipeline.config().partition.shard_count, "Starting");
    let result = match command {
        "assign-vids" => cmd_assign_vids(&pipeline),
        "build-graph" => cmd_build_graph(&pipeline),
        "partition" => cmd_partition(&pipeline),
        "resolve" => cmd_resolve(&pipeline, positional.get(1).map(String::as_str)),
        "load-nodes" => cmd_load_nodes(&pipeline),
        "load-rels" => cmd_load_rels(&pipeline, &positional[1..]),
        "run" => cmd_run(&pipeline),
        other => {
            eprintln!("{}: unknown command '{}'\n", "Error".red(), other);
            print_help();
            process::exit(2);
        }
    };

    match result {
        Ok(()) => println!(
            "{} {} in {:.2?}",
            "✓".green(),
            command.bold(),
            started.elapsed()
        ),
        Err(e) => fail(&e.to_string()),
    }
}

/// Extracts `--config PATH` and returns the remaining arguments.
fn split_config_flag(args: &[String]) -> (&str, Vec<String>) {
    let mut config = DEFAULT_CONFIG_FILE;
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" || arg == "-c" {
            if let Some(path) = iter.next() {
                config = path.as_str();
            }
        } else {
            rest.push(arg.clone());
        }
    }
    (config, rest)
}

fn print_help() {
    println!("{}", "graphshard".bold().cyan());
    println!("Partition a property graph and load it across shard databases\n");
    println!("USAGE:");
    println!("    graphshard <COMMAND> [--config PATH]\n");
    println!("COMMANDS:");
    println!("    assign-vids         Assign global vids to every node record");
    println!("    build-graph         Write the partition graph and its index map");
    println!("    partition           Run the partitioner over the partition graph");
    println!("    resolve [FILE]      Resolve partitioner output into the vid → shard table");
    println!("    load-nodes          Write nodes to their shards, then proxy nodes");
    println!("    load-rels [REL..]   Write relationships (default: all configured)");
    println!("    run                 Run every stage in order");
    println!("    config              Print the effective configuration");
    println!("    --help, -h          Show this help message\n");
    println!("OPTIONS:");
    println!("    --config, -c PATH   Configuration file (default: {DEFAULT_CONFIG_FILE})\n");
    println!("ENVIRONMENT:");
    println!("    GSHARD_LOG          Log filter, e.g. info or graphshard_storage=debug");
    println!("    GSHARD__*           Configuration overrides, e.g. GSHARD__PARTITION__SHARD_COUNT=4");
}

fn fail(message: &str) -> ! {
    eprintln!("{}: {}", "Error".red(), message);
    process::exit(1);
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn open_loader(pipeline: &Pipeline) -> Result<Loader, PipelineError> {
    let config = pipeline.config();
    let stores = open_shard_stores(config)?;
    Ok(ShardLoader::new(stores, config.loader.clone())?)
}

fn partitioner(pipeline: &Pipeline) -> MetisPartitioner {
    let partition = &pipeline.config().partition;
    MetisPartitioner::new(partition.program.clone()).with_args(partition.args.clone())
}

// =============================================================================
// Commands
// =============================================================================

fn cmd_assign_vids(pipeline: &Pipeline) -> Result<(), PipelineError> {
    let pb = spinner("Assigning vids...");
    let report = pipeline.assign_vids();
    pb.finish_and_clear();
    let report = report?;

    println!("   {} new vids: {}", "•".cyan(), report.assigned);
    println!("   {} already known: {}", "•".cyan(), report.already_known);
    if report.unparseable > 0 {
        println!("   {} unparseable records: {}", "⚠".yellow(), report.unparseable);
    }
    Ok(())
}

fn cmd_build_graph(pipeline: &Pipeline) -> Result<(), PipelineError> {
    let pb = spinner("Building partition graph...");
    let built = pipeline.build_graph();
    pb.finish_and_clear();
    let (outputs, report) = built?;

    println!(
        "   {} {} nodes, {} edges → {}",
        "•".cyan(),
        report.nodes,
        report.edges,
        outputs.graph_path.display()
    );
    for (relation, counts) in &report.relations {
        println!("     {:<40} {:>10} edges", relation.to_string(), counts.edges);
    }
    let totals = report.totals();
    if totals.unparseable + totals.unresolved > 0 {
        println!(
            "   {} skipped: {} unparseable, {} unresolved",
            "⚠".yellow(),
            totals.unparseable,
            totals.unresolved
        );
    }
    Ok(())
}

fn cmd_partition(pipeline: &Pipeline) -> Result<(), PipelineError> {
    let pb = spinner("Partitioning...");
    let output = pipeline.partition(&partitioner(pipeline));
    pb.finish_and_clear();

    println!("   {} partition file: {}", "•".cyan(), output?.display());
    Ok(())
}

fn cmd_resolve(pipeline: &Pipeline, file: Option<&str>) -> Result<(), PipelineError> {
    let report = pipeline.resolve(file.map(Path::new))?;

    println!("   {} resolved: {} of {} lines", "•".cyan(), report.resolved, report.lines);
    if report.is_mismatched() {
        println!(
            "   {} partition file has {} lines but the index map has {} entries",
            "⚠".yellow(),
            report.lines,
            report.indexed
        );
    }
    if report.missing + report.invalid > 0 {
        println!(
            "   {} missing: {}, invalid: {}",
            "⚠".yellow(),
            report.missing,
            report.invalid
        );
    }
    Ok(())
}

fn cmd_load_nodes(pipeline: &Pipeline) -> Result<(), PipelineError> {
    let mut loader = open_loader(pipeline)?;
    let pb = spinner("Loading nodes...");
    let report = pipeline.load_nodes(&mut loader);
    pb.finish_and_clear();
    let report = report?;

    print_writes(&report);
    if !report.proxy_node_failures.is_empty() {
        println!(
            "   {} proxy node missing on shards {:?}",
            "⚠".yellow(),
            report.proxy_node_failures
        );
    }
    Ok(())
}

fn cmd_load_rels(pipeline: &Pipeline, names: &[String]) -> Result<(), PipelineError> {
    let relations = if names.is_empty() {
        pipeline.config().dataset.relations.clone()
    } else {
        let mut relations = Vec::with_capacity(names.len());
        for name in names {
            match name.parse::<RelationType>() {
                Ok(relation) => relations.push(relation),
                Err(e) => fail(&e.to_string()),
            }
        }
        relations
    };

    let mut loader = open_loader(pipeline)?;
    let pb = spinner("Loading relationships...");
    let report = pipeline.load_relationships(&mut loader, &relations);
    pb.finish_and_clear();
    let report = report?;

    print_writes(&report);
    println!(
        "   {} direct edges: {}, proxy edges: {}",
        "•".cyan(),
        report.direct_edges,
        report.proxy_edges
    );
    Ok(())
}

fn cmd_run(pipeline: &Pipeline) -> Result<(), PipelineError> {
    let mut loader = open_loader(pipeline)?;
    let pb = spinner("Running all stages...");
    let report = pipeline.run(&partitioner(pipeline), &mut loader);
    pb.finish_and_clear();
    let report = report?;

    println!("   {} vids assigned: {}", "•".cyan(), report.identity.assigned);
    println!("   {} partition graph: {} nodes, {} edges", "•".cyan(), report.graph.nodes, report.graph.edges);
    println!("   {} vids resolved: {}", "•".cyan(), report.resolve.resolved);
    print_writes(&report.nodes);
    print_writes(&report.relationships);
    Ok(())
}

fn print_writes(report: &graphshard_storage::LoadReport) {
    for (sid, counts) in &report.writes.shards {
        println!(
            "   {} shard {}: {} written, {} skipped",
            "•".cyan(),
            sid,
            counts.written,
            counts.skipped()
        );
    }
    let total = report.writes.total();
    if total.failed_batches > 0 {
        println!(
            "   {} {} batches ({} records) failed after retries",
            "✗".red(),
            total.failed_batches,
            total.failed_records
        );
    }
    if report.invalid_assignments > 0 {
        println!(
            "   {} {} assignment rows rejected, re-run resolve for this shard count",
            "⚠".yellow(),
            report.invalid_assignments
        );
    }
    let skipped = report.unparseable + report.unresolved + report.unroutable;
    if skipped > 0 {
        println!(
            "   {} skipped records: {} unparseable, {} without vid, {} without shard",
            "⚠".yellow(),
            report.unparseable,
            report.unresolved,
            report.unroutable
        );
    }
}
