use process_dispatcher::bus::memory::InMemoryBus;
use process_dispatcher::clock::system_clock;
use process_dispatcher::config::{ExecutorKind, PdConfig};
use process_dispatcher::container::SimulatedContainer;
use process_dispatcher::dispatcher::client::ProcessDispatcherClient;
use process_dispatcher::dispatcher::service::{Collaborators, ProcessDispatcher};
use process_dispatcher::engine::types::{RelApp, RelDef};
use process_dispatcher::executor::agent::AgentDirectory;
use process_dispatcher::leader::store::InMemoryLockStore;
use process_dispatcher::registry::directory::InMemoryDirectory;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        // .with_max_level(tracing::Level::DEBUG)
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<String> = None;
    let mut executor_kind: Option<ExecutorKind> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                let path = args
                    .get(i + 1)
                    .ok_or_else(|| anyhow::anyhow!("--config needs a path"))?;
                config_path = Some(path.clone());
                i += 2;
            }
            "--executor" => {
                executor_kind = Some(match args.get(i + 1).map(String::as_str) {
                    Some("agent") => ExecutorKind::Agent,
                    Some("local") => ExecutorKind::Local,
                    other => anyhow::bail!("--executor must be 'agent' or 'local', got {:?}", other),
                });
                i += 2;
            }
            "--help" | "-h" => {
                eprintln!("Usage: {} [--config <file.json>] [--executor agent|local]", args[0]);
                eprintln!("Example: {} --config pd.json --executor local", args[0]);
                std::process::exit(0);
            }
            _ => {
                i += 1;
            }
        }
    }

    let mut config = match &config_path {
        Some(path) => PdConfig::from_file(path)?,
        None => PdConfig::default(),
    };
    if let Some(kind) = executor_kind {
        config.executor.kind = kind;
    }
    tracing::info!(
        "Starting process dispatcher (command queue '{}', {:?} executor, pool {})",
        config.command_queue,
        config.executor.kind,
        config.executor.effective_pool_size()
    );

    // 1. In-process collaborators:
    let clock = system_clock();
    let bus = InMemoryBus::new();
    let directory = InMemoryDirectory::new();
    let agents = AgentDirectory::new();

    // 2. One simulated container per configured engine (or the default one):
    let mut engines: Vec<String> = config.engines.keys().cloned().collect();
    if engines.is_empty() {
        engines.push(config.engine.default_engine.clone());
    }
    engines.sort();

    let mut containers = Vec::new();
    for (n, engine) in engines.iter().enumerate() {
        let container = SimulatedContainer::new(
            &format!("cc_{}", n + 1),
            engine,
            bus.clone(),
            clock.clone(),
            &config.heartbeat_topic,
        );
        directory.register(container.resource());
        agents.register(container.cc_agent(), container.clone());
        containers.push(container);
    }
    let local = containers
        .first()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("no container to host local processes"))?;

    let collaborators = Collaborators {
        bus: bus.clone(),
        lock_store: InMemoryLockStore::new(clock.clone()),
        directory,
        agents,
        local: Some(local),
        clock,
    };

    // 3. Dispatcher:
    let pd = ProcessDispatcher::new(config.clone(), collaborators);
    pd.start().await?;

    for container in &containers {
        container.clone().start_heartbeats(Duration::from_secs(5)).await;
    }

    // 4. Sample deployment:
    let client = ProcessDispatcherClient::new(bus.clone(), &config.command_queue);
    let rel_def = RelDef {
        name: Some("sample".to_string()),
        apps: vec![RelApp {
            replicas: Some(2),
            ..RelApp::process("sample_worker", "sample.worker", "SampleWorker")
        }],
    };
    match client
        .start_rel_blocking(rel_def, Some(Duration::from_secs(30)))
        .await
    {
        Ok(reply) => tracing::info!("Sample rel finished ({}): {}", reply.status, reply.result),
        Err(e) => tracing::warn!("Sample rel failed: {}", e),
    }

    // 5. Spawn stats reporter:
    let stats_pd = pd.clone();
    let stats = tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));

        loop {
            interval.tick().await;
            let Some(registry) = stats_pd.registry().await else {
                continue;
            };
            let running = registry.get_running_containers().await;
            tracing::info!(
                "Dispatcher stats: leader={} containers={} processes={}",
                stats_pd.is_leader().await,
                running.len(),
                registry.list_processes().await.len()
            );
        }
    });

    tracing::info!("Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;

    stats.abort();
    for container in &containers {
        container.stop().await;
    }
    pd.stop().await;

    Ok(())
}
