use std::process::ExitCode;
use std::sync::Arc;

use pico_args::Arguments;

use syncshot_cli::{parse_coordinator_args, wants_help, CoordinatorArgs, COORDINATOR_HELP};
use syncshot_core::SyncResult;
use syncshot_runtime::{
    init_logging, ArtifactPuller, CommandLauncher, CommandPuller, Coordinator, Launcher, NoopLauncher,
};
use syncshot_time::SystemClock;

#[tokio::main]
async fn main() -> ExitCode {
    let mut pargs = Arguments::from_env();
    if wants_help(&mut pargs) {
        print!("{}", COORDINATOR_HELP);
        return ExitCode::SUCCESS;
    }

    let args = match parse_coordinator_args(pargs) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}.", e);
            eprintln!("Run with --help for usage.");
            return ExitCode::from(2);
        }
    };
    if let Err(e) = init_logging(&args.logging) {
        eprintln!("Error: {}.", e);
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(true) => ExitCode::SUCCESS,
        // Session ran but was cut short, flagged anomalies or lost results
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            tracing::error!("session failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: CoordinatorArgs) -> SyncResult<bool> {
    let CoordinatorArgs {
        config,
        launch_template,
        pull_template,
        pull_dir,
        report_path,
        ..
    } = args;

    let launcher: Arc<dyn Launcher> = match launch_template {
        Some(template) => Arc::new(CommandLauncher::new(template)),
        None => Arc::new(NoopLauncher),
    };
    let puller: Arc<dyn ArtifactPuller> = Arc::new(CommandPuller::new(pull_template, pull_dir));

    let coordinator = Coordinator::bind(config, Arc::new(SystemClock), launcher, puller).await?;
    tracing::info!(addr = %coordinator.local_addr(), "waiting for agents");

    let abort = coordinator.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, stopping the session");
            abort.abort();
        }
    });

    let report = coordinator.run().await?;
    print!("{}", report);

    if let Some(path) = report_path {
        report.write_json(&path)?;
        tracing::info!(path = %path.display(), "session report written");
    }
    Ok(report.is_clean())
}
