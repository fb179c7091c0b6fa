use std::process::ExitCode;
use std::sync::Arc;

use pico_args::Arguments;
use sysinfo::System;

use syncshot_cli::{parse_agent_args, wants_help, AGENT_HELP};
use syncshot_runtime::{init_logging, run_agent, Camera, CommandCamera, SimulatedCamera};
use syncshot_time::SystemClock;

#[tokio::main]
async fn main() -> ExitCode {
    let mut pargs = Arguments::from_env();
    if wants_help(&mut pargs) {
        print!("{}", AGENT_HELP);
        return ExitCode::SUCCESS;
    }

    let args = match parse_agent_args(pargs, System::host_name()) {
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

    let capture_dir = args.config.capture_dir.clone();
    let camera: Box<dyn Camera> = match (args.simulate, args.camera_template) {
        (Some(elapsed), _) => Box::new(SimulatedCamera::new(elapsed).sleeping()),
        (None, Some(template)) => Box::new(CommandCamera::new(template, capture_dir)),
        (None, None) => Box::new(CommandCamera::new(CommandCamera::DEFAULT_TEMPLATE, capture_dir)),
    };

    let agent = args.config.agent_id;
    match run_agent(args.config, camera, Arc::new(SystemClock)).await {
        Ok(summary) => {
            tracing::info!(
                %agent,
                rounds = summary.rounds,
                photos = summary.photos_taken,
                anomalies = ?summary.anomalies.rounds,
                extracted = summary.extracted,
                "session complete"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(%agent, "session failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
