use stress_test::{stress_test_convergence, stress_test_scaling};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn std::error::Error>> {
    let started = chrono::Local::now();

    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            WAVELET CONVERGENCE STRESS TESTS                ║");
    println!("║  Started: {:<48} ║", started.format("%Y-%m-%d %H:%M:%S"));
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut all_converged = true;

    // Test 1: few clients, one blip, heavy contention
    let stats = stress_test_convergence(4, 50, 1).await?;
    stats.print();
    all_converged &= stats.converged;

    // Test 2: few clients spread over several blips
    let stats = stress_test_convergence(4, 100, 8).await?;
    stats.print();
    all_converged &= stats.converged;

    // Test 3: medium scale
    let stats = stress_test_convergence(10, 200, 4).await?;
    stats.print();
    all_converged &= stats.converged;

    // Test 4: scaling analysis
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║          SCALING ANALYSIS                                  ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    stress_test_scaling(12, 4).await?;

    let elapsed = chrono::Local::now() - started;
    if all_converged {
        println!("\n✓ All stress tests converged in {}s", elapsed.num_seconds());
        Ok(())
    } else {
        Err("clients diverged from the server".into())
    }
}
