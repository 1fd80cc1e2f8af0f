//! Polylora CLI — build, inspect and cluster expert libraries
//!
//! Commands:
//!   polylora demo                     — end-to-end walk through on a toy model
//!   polylora list    <dir> <repo>     — list the experts of a library
//!   polylora cluster <dir> <repo> <k> — group a library's experts by similarity
//!
//! Settings are read from `polylora.json` (or `$POLYLORA_CONFIG`) when present.

use nalgebra::DMatrix;
use polylora_core::{
    replica_group, AdapterConfig, ArrowTransform, BaseModel, EvolutionConfig, Evolver, ExpertAction,
    ExpertLibrary, LibraryOptions, LibraryTransform, LocalBlobStore, MbcWithCosSim, MultiExpertModel,
    Result, RoutingInfo, RuntimeConfig, SelectorConfig, Tensor, TiesMerge,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::env;
use std::sync::Arc;

const CONFIG_FILE: &str = "polylora.json";
const DEMO_REPO: &str = "demo-library";

fn print_usage() {
    println!(
        r#"
Polylora — composable LoRA experts

Usage: polylora <command> [options]

Commands:
  demo                        Run the end-to-end demo
  list    <dir> <repo>        List the experts of a library
  cluster <dir> <repo> <k>    Cluster a library's experts into k groups

Examples:
  polylora demo
  polylora list ./libs {repo}
  polylora cluster ./libs {repo} 2
"#,
        repo = DEMO_REPO
    );
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let config_path = env::var("POLYLORA_CONFIG").unwrap_or_else(|_| CONFIG_FILE.to_string());
    let config = match RuntimeConfig::load_or_default(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("  Invalid config {}: {}", config_path, e);
            std::process::exit(2);
        }
    };

    let outcome = match args[1].as_str() {
        "demo" => cmd_demo(&config).await,
        "list" => cmd_list(&args[2..], &config),
        "cluster" => cmd_cluster(&args[2..], &config),
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            Ok(())
        }
    };
    if let Err(e) = outcome {
        eprintln!("  Error: {}", e);
        std::process::exit(1);
    }
}

fn open_library(dir: &str, repo: &str, config: &RuntimeConfig, create: bool) -> Result<ExpertLibrary> {
    let store = Arc::new(LocalBlobStore::new(dir)?);
    let options = LibraryOptions {
        create,
        ..config.library.clone()
    };
    ExpertLibrary::open(store, repo, options)
}

fn cmd_list(args: &[String], config: &RuntimeConfig) -> Result<()> {
    if args.len() < 2 {
        eprintln!("Usage: polylora list <dir> <repo>");
        return Ok(());
    }
    let library = open_library(&args[0], &args[1], config, false)?;
    if library.is_empty() {
        println!("\n  No experts. Use 'polylora demo' to create a sample library.");
        return Ok(());
    }
    println!("\n  {}", library.summary());
    println!("  {}", "-".repeat(80));
    for name in library.list() {
        let expert = library.get(&name)?;
        println!("  {}", expert.summary());
    }
    let deleted = library.deleted();
    if !deleted.is_empty() {
        println!("  ({} soft-deleted: {})", deleted.len(), deleted.join(", "));
    }
    Ok(())
}

fn cmd_cluster(args: &[String], config: &RuntimeConfig) -> Result<()> {
    if args.len() < 3 {
        eprintln!("Usage: polylora cluster <dir> <repo> <k>");
        return Ok(());
    }
    let k: usize = match args[2].parse() {
        Ok(k) => k,
        Err(_) => {
            eprintln!("  k must be a number, got '{}'", args[2]);
            return Ok(());
        }
    };
    let library = open_library(&args[0], &args[1], config, false)?;
    let clusters = MbcWithCosSim::new(k).with_seed(config.seed).transform(&library, false)?;
    println!("\n  {} experts in {} clusters:", library.len(), clusters.len());
    for (id, members) in &clusters {
        println!("  [{}] {}", id, members.join(", "));
    }
    Ok(())
}

async fn cmd_demo(config: &RuntimeConfig) -> Result<()> {
    println!("\nPolylora demo");
    println!("{}", "=".repeat(60));
    let mut rng = StdRng::seed_from_u64(config.seed);
    let base = BaseModel::toy("toy-transformer", 16, 2, &mut rng);
    println!("  Base model: {} layers", base.len());

    // Step 1: train-free experts with random factors, stored in a library
    println!("\nStep 1: Building an expert library...");
    println!("{}", "-".repeat(60));
    let dir = env::temp_dir().join("polylora-demo");
    let library = Arc::new(open_library(&dir.to_string_lossy(), DEMO_REPO, config, true)?);
    let adapter = AdapterConfig::lora("q_proj|up_proj")
        .with_rank(4)
        .with_random_b(true)
        .with_model("toy-transformer");
    let tasks = ["summarize", "translate", "classify", "qa"];
    let mut scratch = MultiExpertModel::new(base.clone(), config.seed);
    for task in tasks {
        let name = format!("{}_expert", task);
        scratch.add_empty_expert(&name, &adapter, false)?;
        let mut expert = scratch.get_expert_instance(&name)?;
        expert.info.expert_task_name = Some(task.to_string());
        library.add_expert(&expert, None, true)?;
        println!("  {}", expert.summary());
    }
    println!("  {}", library.summary());

    // Step 2: cluster and merge each cluster
    println!("\nStep 2: Clustering and TIES-merging...");
    println!("{}", "-".repeat(60));
    let clusters = MbcWithCosSim::new(2).with_seed(config.seed).transform(&library, true)?;
    for (id, members) in &clusters {
        let merged = TiesMerge::new(format!("cluster_{}", id))
            .with_experts(members.clone())
            .transform(&library, false)?;
        println!("  cluster {} = [{}] -> {}", id, members.join(", "), merged.summary());
    }

    // Step 3: per-token routing over prototypes
    println!("\nStep 3: Arrow routing...");
    println!("{}", "-".repeat(60));
    let arrow = ArrowTransform::new();
    arrow.transform_with_base(&library, Some(&base), true)?;
    let mut model = MultiExpertModel::new(base.clone(), config.seed).with_library(library.clone());
    model.load_from_library(&library, None, ExpertAction::Route)?;
    model.set_selector(SelectorConfig::arrow(arrow.data_id(), Some(2)))?;
    let x: Tensor = DMatrix::from_fn(4, 16, |r, c| ((r * 16 + c) as f32 * 0.13).sin());
    let y = model.forward(&x, &RoutingInfo::new())?;
    println!("  {}", model.summary());
    println!("  Routed output norm: {:.6}", y.norm());

    // Step 4: task routing and expert choice
    println!("\nStep 4: Task routing and expert choice...");
    println!("{}", "-".repeat(60));
    model.set_selector(SelectorConfig::task_name(Some("summarize_expert")))?;
    let info = RoutingInfo::with_task_names(["translate", "qa", "unknown", "classify"]);
    let target = model.forward(&x, &info)?;
    let chosen = model.expert_choice(&x, &RoutingInfo::new(), |out| {
        Ok((0..out.nrows())
            .map(|r| (out.row(r) - target.row(r)).norm() as f64)
            .collect())
    })?;
    println!("  Lowest-loss expert per example: {}", chosen.join(", "));

    // Step 5: evolve one expert toward the routed outputs
    println!("\nStep 5: Evolving an expert...");
    println!("{}", "-".repeat(60));
    let evolution = EvolutionConfig {
        generations: 10,
        ..config.evolution.clone()
    };
    let outcome = Evolver::new(&library, evolution).evolve("qa_expert", None, |candidate| {
        let mut probe = MultiExpertModel::new(base.clone(), config.seed);
        probe.add_expert(candidate, ExpertAction::Merge, false)?;
        let out = probe.forward(&x, &RoutingInfo::new())?;
        Ok((&out - &target).norm() as f64)
    })?;
    match &outcome.committed_as {
        Some(name) => println!(
            "  Committed {} (loss {:.6} -> {:.6})",
            name, outcome.start_loss, outcome.loss
        ),
        None => println!("  No improvement over qa_expert (loss {:.6})", outcome.start_loss),
    }

    // Step 6: epoch-end exchange between two replicas
    println!("\nStep 6: Replica output exchange...");
    println!("{}", "-".repeat(60));
    let handles = replica_group::<String>(2, config.exchange_timeout())?;
    let mut joins = Vec::new();
    for mut handle in handles {
        let outputs = vec![format!("rank {} outputs", handle.rank())];
        joins.push(tokio::spawn(async move {
            handle
                .gather_and_aggregate(outputs, |parts| Ok(parts.concat()))
                .await
        }));
    }
    for joined in futures::future::join_all(joins).await {
        match joined {
            Ok(Ok(Some(all))) => println!("  Rank 0 gathered: {}", all.join(" | ")),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => eprintln!("  Exchange failed: {}", e),
            Err(e) => eprintln!("  Replica task panicked: {}", e),
        }
    }

    println!("\n  Library at {}", dir.display());
    println!("  Try: polylora list {} {}", dir.display(), DEMO_REPO);
    Ok(())
}
