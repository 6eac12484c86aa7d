use std::path::PathBuf;
use std::sync::mpsc::{channel, Receiver, TryRecvError};
use std::time::Duration;

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use perfagent::context::CallContext;
use perfagent::driver::{Driver, GatherStatus, ProcessDescriptor, Subscriber};
use perfagent::metrics::Metric;
use perfagent::region::{CodeLocation, RegionId};
use perfagent::AgentConfig;

#[derive(Debug, Parser)]
struct Command {
    /// Name of the monitored application, for log output only.
    #[arg(short, long, default_value = "application")]
    appname: String,
    /// Monitored process endpoint, host:port[@rank]. Repeat per process.
    #[arg(short, long = "process", required = true)]
    processes: Vec<String>,
    /// Phase region name. Overrides the config file.
    #[arg(long)]
    phase: Option<String>,
    /// Number of search iterations to run.
    #[arg(short, long, default_value = "1")]
    iterations: u32,
    /// Phase executions measured per experiment.
    #[arg(long, default_value = "1")]
    phase_executions: u32,
    /// Per-message timeout in seconds.
    #[arg(long, default_value = "60")]
    timeout: u64,
    /// Metric to request, by wire name. Repeat per metric.
    #[arg(short, long = "metric")]
    metrics: Vec<String>,
    /// Configuration file (JSON).
    #[arg(short, long)]
    config: Option<PathBuf>,
    #[arg(long, default_value = "info")]
    log_level: String,
}

/// Logs every gathered measurement; stands in for the analysis layers
/// that subscribe in a full deployment.
struct LogSubscriber;

impl Subscriber for LogSubscriber {
    fn metric_found(&mut self, metric: Metric, context: &CallContext, value: i64) {
        info!(
            metric = metric.wire_name(),
            region = %context.region_name,
            rank = context.rank,
            thread = context.thread,
            node_id = context.node_id,
            value,
            "measurement gathered"
        );
    }

    fn region_definition_received(&mut self, _region: RegionId, location: &CodeLocation) {
        info!(
            region = %location.name,
            file = %location.file,
            line = location.first_line,
            "region defined"
        );
    }
}

fn parse_endpoints(specs: &[String]) -> Result<Vec<ProcessDescriptor>> {
    specs
        .iter()
        .enumerate()
        .map(|(index, spec)| match spec.split_once('@') {
            Some((addr, rank)) => Ok(ProcessDescriptor {
                addr: addr.to_string(),
                rank: rank
                    .parse()
                    .with_context(|| format!("Invalid rank in process endpoint {}", spec))?,
            }),
            None => Ok(ProcessDescriptor {
                addr: spec.clone(),
                rank: index as u64,
            }),
        })
        .collect()
}

fn parse_metrics(names: &[String]) -> Result<Vec<Metric>> {
    names
        .iter()
        .map(|name| {
            Metric::from_wire_name(name)
                .with_context(|| format!("Unknown metric {}", name))
        })
        .collect()
}

/// One experiment loop: transfer requests, run the application to the
/// end of the phase, collect, repeat until every request has data.
fn run_experiment(
    driver: &mut Driver,
    phase_executions: u32,
    stop_rx: &Receiver<()>,
) -> Result<()> {
    loop {
        match stop_rx.try_recv() {
            Ok(()) => bail!("interrupted"),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => bail!("stop channel closed"),
        }

        driver.run_request_cycle(phase_executions)?;
        if let Some(phase) = driver.regions().phase_region() {
            driver.stop_at_region_end(phase)?;
        }
        driver.wait()?;
        if driver.collect_results()? == GatherStatus::AllGathered {
            return Ok(());
        }
        if driver.needs_restart() {
            warn!("application finished before all requests were served");
            return Ok(());
        }
    }
}

fn main() -> Result<()> {
    let opts = Command::parse();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&opts.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let config = match &opts.config {
        Some(path) => AgentConfig::load(path)?,
        None => AgentConfig::default(),
    };
    let phase = opts
        .phase
        .clone()
        .or_else(|| config.phase.clone())
        .unwrap_or_else(|| "mainRegion".to_string());
    let endpoints = parse_endpoints(&opts.processes)?;
    let metrics = parse_metrics(&opts.metrics)?;

    let (stop_tx, stop_rx) = channel();
    ctrlc::set_handler(move || stop_tx.send(()).expect("Could not send signal on channel."))
        .expect("Error setting Ctrl-C handler");

    let mut driver = Driver::new(config, &phase);
    driver.add_subscriber(Box::new(LogSubscriber));
    driver.attach(&endpoints, Duration::from_secs(opts.timeout))?;
    info!(
        appname = %opts.appname,
        phase = %phase,
        iterations = opts.iterations,
        "starting measurement run"
    );

    for iteration in 0..opts.iterations {
        for metric in &metrics {
            driver.add_request(*metric)?;
        }
        info!(iteration, "running search iteration");
        if let Err(err) = run_experiment(&mut driver, opts.phase_executions, &stop_rx) {
            warn!(%err, "search iteration aborted");
            break;
        }
        if driver.needs_restart() {
            break;
        }
    }

    driver.terminate()?;
    Ok(())
}
