use std::ffi::OsString;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use pico_args::Arguments;
use thiserror::Error;

use syncshot_core::{AgentId, CaptureSettings, SyncError};
use syncshot_runtime::{AgentConfig, CoordinatorConfig, LoggingConfig};

pub const COORDINATOR_HELP: &str = "\
SyncShot coordinator - fires a camera fleet in lockstep

Waits for N agents, then triggers every camera at a shared deadline each
round until the round limit or Ctrl-C, and finally pulls the results.

USAGE:
  syncshot-coordinator [OPTIONS]

OPTIONS:
  -h, --help                  Prints help information
  --agents <n>                Fleet size (default: 12)
  --bind <addr>               Listen address (default: 0.0.0.0:5000)
  --width <px>                Capture width, at most 4056 (default: 1920)
  --height <px>               Capture height, at most 3040 (default: 1080)
  --exposure <us>             Exposure time in microseconds (default: 10000)
  --delay <duration>          Lead time before each capture (default: 1s)
  --rounds <n>                Stop after n rounds (default: until Ctrl-C)
  --single-shot               Same as --rounds 1
  --reply-timeout <duration>  Per-round reply bound (default: 30s)
  --ready-timeout <duration>  Packaging bound after STOP_RECORD (default: 60s)
  --accept-timeout <duration> Bound on the whole fleet connecting (default: 120s)
  --hosts <a,b,...>           Agent hosts in id order, for --launch
  --subnet <prefix>           Agent k lives at <prefix>.k, for --launch
  --launch <template>         Command starting one agent; {address} and {id}
                              are substituted
  --pull <template>           Command fetching one agent's results; {id} and
                              {dest} are substituted (default: scp from
                              admin{id}@192.168.1.{id})
  --pull-dir <dir>            Where pulled results land (default: .)
  --report <file>             Write the session report as JSON
  --log-json                  Log one JSON object per event
  -v, --verbose               Debug logging
";

pub const AGENT_HELP: &str = "\
SyncShot agent - captures on the coordinator's deadline

USAGE:
  syncshot-agent [OPTIONS]

OPTIONS:
  -h, --help                  Prints help information
  --coordinator <addr>        Coordinator address (default: 192.168.1.253:5000)
  --id <n>                    Agent id (default: trailing digits of the hostname)
  --bind-ip <ip>              Source address for the coordinator connection
  --capture-dir <dir>         Where images and results are written (default: .)
  --camera <template>         Capture command; {width} {height} {exposure}
                              {round} {dir} are substituted
  --simulate <duration>       Fake captures of this duration, no camera needed
  --command-timeout <d|none>  Bound on waiting for the next command (default: 10m)
  --memory-threshold <pct>    RAM_LOW above this memory use (default: 90)
  --storage-threshold <pct>   RAM_LOW above this storage use (default: 90)
  --connect-attempts <n>      Connection attempts before giving up (default: 30)
  --log-json                  Log one JSON object per event
  -v, --verbose               Debug logging
";

/// Coordinator address the fleet's agents dial by default
pub const DEFAULT_COORDINATOR_ADDR: &str = "192.168.1.253:5000";

/// Copies agent k's result file from the camera network's fixed layout
pub const DEFAULT_PULL_TEMPLATE: &str =
    "scp -q admin{id}@192.168.1.{id}:capture_results{id}.csv {dest}";

#[derive(Error, Debug)]
pub enum ArgsError {
    #[error(transparent)]
    Parse(#[from] pico_args::Error),

    #[error(transparent)]
    Invalid(#[from] SyncError),

    #[error("unused arguments left: {0:?}")]
    Unused(Vec<OsString>),

    #[error("no --id given and hostname {0:?} does not end in an agent number")]
    NoAgentId(Option<String>),
}

#[derive(Debug)]
pub struct CoordinatorArgs {
    pub config: CoordinatorConfig,
    pub launch_template: Option<String>,
    pub pull_template: String,
    pub pull_dir: PathBuf,
    pub report_path: Option<PathBuf>,
    pub logging: LoggingConfig,
}

#[derive(Debug)]
pub struct AgentArgs {
    pub config: AgentConfig,
    pub camera_template: Option<String>,
    pub simulate: Option<Duration>,
    pub logging: LoggingConfig,
}

/// `true` when help was requested; the caller prints it and exits
pub fn wants_help(pargs: &mut Arguments) -> bool {
    pargs.contains(["-h", "--help"])
}

fn parse_logging(pargs: &mut Arguments) -> LoggingConfig {
    let logging = if pargs.contains("--log-json") {
        LoggingConfig::json()
    } else {
        LoggingConfig::default()
    };
    if pargs.contains(["-v", "--verbose"]) {
        logging.verbose()
    } else {
        logging
    }
}

fn parse_list(s: &str) -> Result<Vec<String>, &'static str> {
    let items: Vec<String> = s
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(String::from)
        .collect();
    if items.is_empty() {
        return Err("empty list");
    }
    Ok(items)
}

fn parse_optional_duration(s: &str) -> Result<Option<Duration>, humantime::DurationError> {
    if s.eq_ignore_ascii_case("none") {
        return Ok(None);
    }
    humantime::parse_duration(s).map(Some)
}

fn finish(pargs: Arguments) -> Result<(), ArgsError> {
    let remaining = pargs.finish();
    if remaining.is_empty() {
        Ok(())
    } else {
        Err(ArgsError::Unused(remaining))
    }
}

pub fn parse_coordinator_args(mut pargs: Arguments) -> Result<CoordinatorArgs, ArgsError> {
    let mut config = CoordinatorConfig::default();
    let logging = parse_logging(&mut pargs);
    let single_shot = pargs.contains("--single-shot");

    if let Some(n) = pargs.opt_value_from_str("--agents")? {
        config.agent_count = n;
    }
    if let Some(addr) = pargs.opt_value_from_str("--bind")? {
        config.bind_addr = addr;
    }

    let defaults = CaptureSettings::default();
    let width = pargs.opt_value_from_str("--width")?.unwrap_or(defaults.width);
    let height = pargs.opt_value_from_str("--height")?.unwrap_or(defaults.height);
    let exposure = pargs
        .opt_value_from_str("--exposure")?
        .unwrap_or(defaults.exposure_micros);
    config.settings = CaptureSettings::new(width, height, exposure)?;

    if let Some(delay) = pargs.opt_value_from_fn("--delay", humantime::parse_duration)? {
        config.schedule_delay = delay;
    }
    config.max_rounds = pargs.opt_value_from_str("--rounds")?;
    if single_shot {
        config.max_rounds = Some(1);
    }
    if let Some(t) = pargs.opt_value_from_fn("--reply-timeout", humantime::parse_duration)? {
        config.reply_timeout = t;
    }
    if let Some(t) = pargs.opt_value_from_fn("--ready-timeout", humantime::parse_duration)? {
        config.ready_timeout = t;
    }
    if let Some(t) = pargs.opt_value_from_fn("--accept-timeout", humantime::parse_duration)? {
        config.accept_timeout = t;
    }

    let hosts = pargs.opt_value_from_fn("--hosts", parse_list)?;
    let subnet: Option<String> = pargs.opt_value_from_str("--subnet")?;
    config.agent_addresses = match (hosts, subnet) {
        (Some(hosts), _) => hosts,
        (None, Some(prefix)) => (1..=config.agent_count)
            .map(|k| format!("{}.{}", prefix.trim_end_matches('.'), k))
            .collect(),
        (None, None) => Vec::new(),
    };

    let args = CoordinatorArgs {
        launch_template: pargs.opt_value_from_str("--launch")?,
        pull_template: pargs
            .opt_value_from_str("--pull")?
            .unwrap_or_else(|| DEFAULT_PULL_TEMPLATE.to_string()),
        pull_dir: pargs
            .opt_value_from_str("--pull-dir")?
            .unwrap_or_else(|| PathBuf::from(".")),
        report_path: pargs.opt_value_from_str("--report")?,
        logging,
        config,
    };
    finish(pargs)?;

    if args.launch_template.is_some() && args.config.agent_addresses.is_empty() {
        return Err(SyncError::InvalidConfig("--launch needs --hosts or --subnet".into()).into());
    }
    args.config.validate()?;
    Ok(args)
}

/// Parse agent arguments; `hostname` supplies the id when `--id` is absent
pub fn parse_agent_args(mut pargs: Arguments, hostname: Option<String>) -> Result<AgentArgs, ArgsError> {
    let logging = parse_logging(&mut pargs);

    let coordinator: SocketAddr = match pargs.opt_value_from_str("--coordinator")? {
        Some(addr) => addr,
        None => DEFAULT_COORDINATOR_ADDR
            .parse()
            .map_err(|_| SyncError::InvalidConfig("default coordinator address".into()))?,
    };

    let explicit_id: Option<u32> = pargs.opt_value_from_str("--id")?;
    let agent_id = match explicit_id {
        Some(n) => AgentId::new(n)
            .ok_or_else(|| SyncError::InvalidConfig("agent id 0 is reserved".into()))?,
        None => hostname
            .as_deref()
            .and_then(AgentId::from_hostname)
            .ok_or_else(|| ArgsError::NoAgentId(hostname.clone()))?,
    };

    let mut config = AgentConfig::new(coordinator, agent_id);
    config.bind_ip = pargs.opt_value_from_str::<_, IpAddr>("--bind-ip")?;
    if let Some(dir) = pargs.opt_value_from_str("--capture-dir")? {
        config.capture_dir = dir;
    }
    if let Some(timeout) = pargs.opt_value_from_fn("--command-timeout", parse_optional_duration)? {
        config.command_timeout = timeout;
    }
    if let Some(pct) = pargs.opt_value_from_str("--memory-threshold")? {
        config.memory_threshold_percent = pct;
    }
    if let Some(pct) = pargs.opt_value_from_str("--storage-threshold")? {
        config.storage_threshold_percent = pct;
    }
    if let Some(n) = pargs.opt_value_from_str("--connect-attempts")? {
        config.connect_attempts = n;
    }

    let args = AgentArgs {
        camera_template: pargs.opt_value_from_str("--camera")?,
        simulate: pargs.opt_value_from_fn("--simulate", humantime::parse_duration)?,
        logging,
        config,
    };
    finish(pargs)?;

    args.config.validate()?;
    Ok(args)
}
