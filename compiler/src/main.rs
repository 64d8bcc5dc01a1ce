use clap::Parser;
use std::path::PathBuf;

use tlc::advisor::{RuleAdvisor, RuleSet};
use tlc::diag::DiagLevel;
use tlc::dot;
use tlc::factory::ReorderFactory;
use tlc::graph::Graph;
use tlc::pass::StageId;
use tlc::pipeline;

#[derive(Debug, Clone, clap::ValueEnum)]
enum EmitStage {
    /// Final format selection per node (stops before materialization)
    Formats,
    /// Transformed graph manifest with reorders spliced in
    Graph,
    /// Graphviz DOT of the transformed graph
    Dot,
    /// Conversion statistics
    Report,
    /// Input hashes and compiler version
    BuildInfo,
}

#[derive(Parser, Debug)]
#[command(
    name = "tlc",
    version,
    about = "Tensor Layout Compiler — assigns memory formats to computation graphs and inserts reorders"
)]
struct Cli {
    /// Input graph manifest (JSON, schema v1)
    graph: PathBuf,

    /// Layout rule manifest (JSON, schema v1); permissive defaults if omitted
    #[arg(short, long)]
    rules: Option<PathBuf>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::Graph)]
    emit: EmitStage,

    /// Print stages and timing
    #[arg(long)]
    verbose: bool,
}

fn main() {
    let cli = Cli::parse();

    if cli.verbose {
        eprintln!("tlc: graph = {}", cli.graph.display());
        eprintln!("tlc: emit  = {:?}", cli.emit);
    }

    // ── Load inputs ──
    let mut graph = match Graph::load_manifest(&cli.graph) {
        Ok(graph) => graph,
        Err(e) => {
            eprintln!("tlc: error: {}", e);
            std::process::exit(2);
        }
    };

    let rules = match &cli.rules {
        Some(path) => match RuleSet::load_manifest(path) {
            Ok(rules) => rules,
            Err(e) => {
                eprintln!("tlc: error: {}", e);
                std::process::exit(2);
            }
        },
        None => RuleSet::new(),
    };

    if cli.verbose {
        eprintln!(
            "tlc: {} nodes, {} preference rules",
            graph.len(),
            rules.preferences.len()
        );
    }

    let provenance = pipeline::compute_provenance(&graph, &rules);
    if let EmitStage::BuildInfo = cli.emit {
        print!("{}", provenance.to_json());
        return;
    }

    let advisor = RuleAdvisor::new(rules);
    let mut factory = ReorderFactory::new();
    let terminal = match cli.emit {
        EmitStage::Formats => StageId::Minimize,
        _ => StageId::Materialize,
    };

    let result = pipeline::run_pipeline(
        &mut graph,
        &advisor,
        &mut factory,
        terminal,
        cli.verbose,
        |_, diags| {
            for d in diags {
                eprintln!("tlc: {}", d);
            }
        },
    );

    match cli.emit {
        EmitStage::Formats => {
            for (name, format) in result.formats.entries(&graph) {
                println!("{} {}", name, format);
            }
        }
        EmitStage::Graph => {
            print!("{}", graph.generate_manifest());
        }
        EmitStage::Dot => {
            print!("{}", dot::emit_dot(&graph, Some(&result.formats)));
        }
        EmitStage::Report => {
            let stats = result.stats.unwrap_or_default();
            println!("reorders: {}", stats.reorders);
            println!("reordered elements: {}", stats.total_elements);
            println!("nodes with fused inputs: {}", stats.nodes_with_fused_inputs);
            println!("graph hash: {}", provenance.graph_hash_hex());
        }
        EmitStage::BuildInfo => unreachable!(),
    }

    if result
        .diagnostics
        .iter()
        .any(|d| d.level == DiagLevel::Error)
    {
        std::process::exit(1);
    }
}
