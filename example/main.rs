use deploycuter::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

// Fake deployer: every contract hits a flaky RPC on its first attempt
struct FlakyDeployer {
    attempts: parking_lot::Mutex<HashMap<String, u32>>,
}

#[async_trait]
impl ItemExecutor for FlakyDeployer {
    async fn execute(&self, item: &BatchItem) -> ExecutionOutcome {
        let attempt = {
            let mut attempts = self.attempts.lock();
            let count = attempts.entry(item.id.clone()).or_insert(0);
            *count += 1;
            *count
        };
        println!("deploying {} (attempt {attempt})", item.name);

        // simulated build + upload time
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        if attempt == 1 {
            return Err(DeployFailure::network(format!("rpc timeout deploying {}", item.name)));
        }
        if item.name == "auction" {
            return Err(DeployFailure::execution("auction: unauthorized"));
        }
        Ok(DeployReceipt::new(
            format!("C{}", item.name.to_uppercase()),
            format!("0x{:x}", item.name.len() * 4099),
        ))
    }
}

fn workspace() -> Vec<ArtifactDescriptor> {
    vec![
        ArtifactDescriptor::new("token", "contracts/token"),
        ArtifactDescriptor::new("nft", "contracts/nft")
            .with_dependency(DependencySpec::path("token", "../token")),
        ArtifactDescriptor::new("staking", "contracts/staking")
            .with_dependency(DependencySpec::workspace("token")),
        ArtifactDescriptor::new("auction", "contracts/auction")
            .with_dependency(DependencySpec::path("nft", "../nft"))
            .with_dependency(DependencySpec::path("token", "../token")),
        ArtifactDescriptor::new("escrow", "contracts/escrow")
            .with_dependency(DependencySpec::workspace("auction")),
        ArtifactDescriptor::new("voting", "contracts/voting")
            .with_dependency(DependencySpec::workspace("staking"))
            .with_dev_dependency(DependencySpec::path("escrow", "../escrow")),
    ]
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = OrchestratorConfig::from_json_str(
        r#"{ "mode": "parallel", "concurrency": 2, "retry": { "base_delay_ms": 200, "jitter_ms": 50 } }"#,
    )?;

    let executor = Arc::new(FlakyDeployer {
        attempts: parking_lot::Mutex::new(HashMap::new()),
    });
    let orchestrator = DeploymentOrchestrator::new(executor, config);
    let artifacts = workspace();

    println!("=== dependency graph ===");
    let graph = orchestrator.plan(&artifacts);
    print!("{}", graph.render_tree());
    for (i, wave) in graph.levels.iter().enumerate() {
        println!("wave {i}: {}", wave.join(", "));
    }

    let _progress = orchestrator.coordinator().on_status_change(|session| {
        if let Some(error) = session.last_error() {
            println!(
                "  [{}] {:?} after {} attempt(s): {}",
                session.label,
                session.status,
                session.attempts.len(),
                error
            );
        }
    });

    println!("=== deploying ===");
    let start = std::time::Instant::now();
    let result = orchestrator
        .deploy("demo", &artifacts, Some(CancellationToken::new()))
        .await?;

    println!("=== done in {:?} ===", start.elapsed());
    for item in &result.results {
        println!(
            "{:<40} {:<10} {}",
            item.id,
            format!("{:?}", item.status),
            item.contract_id.as_deref().or(item.error.as_deref()).unwrap_or("")
        );
    }
    println!("retry sessions: {}", orchestrator.coordinator().history().len());

    Ok(())
}
