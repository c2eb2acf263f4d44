//! Stack Launch CLI
//!
//! Usage:
//!   stack_launch launch/observability.stack.yaml
//!   stack_launch launch/observability.stack.yaml -e GRAFANA_PORT=3001 -p tracing
//!   stack_launch launch/observability.stack.yaml --dry-run

use stack_launch::{
    DependencyGraph, Interpolator, Orchestrator, OrchestratorConfig, ProcessLauncher, StackArgs,
    StackFile, StackPlan, StackResult, TransportProbe,
};
use std::sync::Arc;
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    let args: StackArgs = argh::from_env();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "error" => "error",
        "warn" => "warn",
        "info" => "info",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    };
    let env = env_logger::Env::default().default_filter_or(log_level);
    env_logger::init_from_env(env);

    // Load stack file
    log::info!("Loading stack file: {}", args.stack_file);
    let stack_file = match StackFile::from_file(&args.stack_file) {
        Ok(sf) => sf,
        Err(e) => {
            log::error!("Failed to load stack file: {}", e);
            std::process::exit(1);
        }
    };

    let interpolator = Interpolator::new().with_overrides(args.env_overrides());
    let profiles = args.profiles();

    let units = match stack_file.resolve(&interpolator, &profiles) {
        Ok(units) => units,
        Err(e) => {
            log::error!("Invalid stack: {}", e);
            std::process::exit(1);
        }
    };

    if args.validate || args.dry_run {
        let graph = match DependencyGraph::build(units) {
            Ok(graph) => graph,
            Err(e) => {
                log::error!("Invalid stack: {}", e);
                std::process::exit(1);
            }
        };

        if args.validate {
            let profiles = stack_file.profiles();
            println!("Stack file '{}' is valid", args.stack_file);
            println!("  Version: {}", stack_file.version);
            println!("  Env: {}", stack_file.env.len());
            println!("  Units: {} ({} enabled)", stack_file.units.len(), graph.len());
            if !profiles.is_empty() {
                println!("  Profiles: {}", profiles.join(", "));
            }
        } else {
            println!("{}", StackPlan::from_graph(&graph));
        }
        return;
    }

    let probe = match TransportProbe::new() {
        Ok(probe) => probe,
        Err(e) => {
            log::error!("Failed to create health probe: {}", e);
            std::process::exit(1);
        }
    };

    let mut orchestrator = match Orchestrator::new(
        units,
        Arc::new(ProcessLauncher::new()),
        Arc::new(probe),
        OrchestratorConfig::default(),
    ) {
        Ok(o) => o,
        Err(e) => {
            log::error!("Invalid stack: {}", e);
            std::process::exit(1);
        }
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(());

    // Set up Ctrl+C handler
    {
        let shutdown_tx = shutdown_tx.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            log::info!("Received Ctrl+C, initiating shutdown...");
            let _ = shutdown_tx.send(());
        }) {
            log::error!("Error setting Ctrl+C handler: {}", e);
            std::process::exit(1);
        }
    }

    let printer = args.events_json.then(|| {
        let mut events = orchestrator.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(transition) => match serde_json::to_string(&transition) {
                        Ok(line) => println!("{}", line),
                        Err(e) => log::warn!("Failed to encode transition: {}", e),
                    },
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Event printer lagged, {} transitions dropped", n);
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    });

    let result = orchestrator.run(shutdown_rx.clone()).await;
    if result.is_up() {
        // Keep supervising until Ctrl+C or every unit has terminated
        orchestrator.wait(shutdown_rx).await;
    }

    let final_state = orchestrator.shutdown().await;
    for (name, status) in final_state.iter() {
        log::debug!(
            "[{}] Final state {} after {} restarts",
            name,
            status.state,
            status.restarts
        );
    }

    // Closing the sink lets the printer flush the final transitions and exit
    drop(orchestrator);
    if let Some(printer) = printer {
        if let Err(e) = printer.await {
            log::warn!("Event printer task failed: {}", e);
        }
    }

    match result {
        StackResult::Failed(units) => {
            log::error!("Stack failed: {}", units.join(", "));
            std::process::exit(1);
        }
        StackResult::Up | StackResult::Cancelled => {
            log::info!("Stack launcher exiting");
        }
    }
}
