use anyhow::{anyhow, Result};
use clap::{arg, Arg, Command};
use ndarray::Zip;
use online_norm::{
    build, synthetic::StationarySource, ControlNormConfig, FeatureBatch, RunningStatistics,
    Strategy,
};
use serde::Serialize;
use std::fs;
use tracing::{debug, info};

fn cli() -> Command {
    Command::new("online-norm")
        .about("Drives the online normalization engine on synthetic data")
        .arg_required_else_help(true)
        .arg(
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .help("Log level used when RUST_LOG is unset")
                .global(true)
                .default_value("info")
                .value_parser(clap::value_parser!(String)),
        )
        .subcommand(
            Command::new("compare")
                .about("Checks the linearized engine against the sequential loop")
                .arg(
                    arg!(<CONFIG> "Config json string or path to json file")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    arg!(--steps [STEPS] "Number of consecutive batches")
                        .default_value("8")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--height [HEIGHT] "Spatial height of each batch")
                        .default_value("3")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--width [WIDTH] "Spatial width of each batch")
                        .default_value("3")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--seed [SEED] "A string used in seed generation")
                        .default_value("online-norm")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    arg!(--tolerance [TOLERANCE] "Maximum allowed absolute discrepancy")
                        .default_value("1e-8")
                        .value_parser(clap::value_parser!(f64)),
                ),
        )
        .subcommand(
            Command::new("track")
                .about("Feeds stationary batches and reports the running statistics")
                .arg(
                    arg!(<CONFIG> "Config json string or path to json file")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    arg!(--steps [STEPS] "Number of consecutive batches")
                        .default_value("200")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--height [HEIGHT] "Spatial height of each batch")
                        .default_value("4")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--width [WIDTH] "Spatial width of each batch")
                        .default_value("4")
                        .value_parser(clap::value_parser!(usize)),
                )
                .arg(
                    arg!(--mean [MEAN] "Mean of every channel")
                        .default_value("0.0")
                        .value_parser(clap::value_parser!(f64)),
                )
                .arg(
                    arg!(--std [STD] "Standard deviation of every channel")
                        .default_value("1.0")
                        .value_parser(clap::value_parser!(f64)),
                )
                .arg(
                    arg!(--seed [SEED] "A string used in seed generation")
                        .default_value("online-norm")
                        .value_parser(clap::value_parser!(String)),
                ),
        )
}

fn main() {
    let matches = cli().get_matches();
    setup_logging(matches.get_one::<String>("log-level").unwrap());

    if let Err(e) = match matches.subcommand() {
        Some(("compare", sub_m)) => compare(
            sub_m.get_one::<String>("CONFIG").unwrap().clone(),
            *sub_m.get_one::<usize>("steps").unwrap(),
            (
                *sub_m.get_one::<usize>("height").unwrap(),
                *sub_m.get_one::<usize>("width").unwrap(),
            ),
            sub_m.get_one::<String>("seed").unwrap().clone(),
            *sub_m.get_one::<f64>("tolerance").unwrap(),
        ),
        Some(("track", sub_m)) => track(
            sub_m.get_one::<String>("CONFIG").unwrap().clone(),
            *sub_m.get_one::<usize>("steps").unwrap(),
            (
                *sub_m.get_one::<usize>("height").unwrap(),
                *sub_m.get_one::<usize>("width").unwrap(),
            ),
            *sub_m.get_one::<f64>("mean").unwrap(),
            *sub_m.get_one::<f64>("std").unwrap(),
            sub_m.get_one::<String>("seed").unwrap().clone(),
        ),
        _ => Err(anyhow!("Invalid subcommand")),
    } {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn setup_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

#[derive(Serialize, Debug)]
struct ComparisonReport {
    steps: usize,
    max_output_diff: f64,
    max_grad_diff: f64,
    tolerance: f64,
    linearized: RunningStatistics,
    sequential: RunningStatistics,
}

pub fn compare(
    config: String,
    steps: usize,
    spatial: (usize, usize),
    seed: String,
    tolerance: f64,
) -> Result<()> {
    let config = load_config(&config)?;
    let shape = (
        config.batch_size,
        config.num_features,
        spatial.0,
        spatial.1,
    );
    let mut linearized = build(config.clone().with_strategy(Strategy::Linearized))?;
    let mut sequential = build(config.with_strategy(Strategy::Sequential))?;
    let mut inputs = StationarySource::standard(&calc_seed(&seed, "inputs"), shape)?;
    let mut grads = StationarySource::standard(&calc_seed(&seed, "grads"), shape)?;

    let mut max_output_diff = 0.0f64;
    let mut max_grad_diff = 0.0f64;
    for step in 0..steps {
        let input = inputs.sample();
        let grad = grads.sample();

        let (lin_out, lin_ctx) = linearized.forward_train(input.view())?;
        let (seq_out, seq_ctx) = sequential.forward_train(input.view())?;
        let lin_grad = linearized.backward(&lin_ctx, grad.view())?;
        let seq_grad = sequential.backward(&seq_ctx, grad.view())?;

        let output_diff = max_abs_diff(&lin_out, &seq_out);
        let grad_diff = max_abs_diff(&lin_grad, &seq_grad);
        debug!(step, output_diff, grad_diff, "compared batch");
        max_output_diff = max_output_diff.max(output_diff);
        max_grad_diff = max_grad_diff.max(grad_diff);
    }

    let report = ComparisonReport {
        steps,
        max_output_diff,
        max_grad_diff,
        tolerance,
        linearized: linearized.running_statistics(),
        sequential: sequential.running_statistics(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if max_output_diff > tolerance || max_grad_diff > tolerance {
        Err(anyhow!(
            "Linearized engine diverged from the sequential loop (output: {}, grad: {}, tolerance: {})",
            max_output_diff,
            max_grad_diff,
            tolerance
        ))
    } else {
        info!(steps, "linearized engine matches the sequential loop");
        Ok(())
    }
}

pub fn track(
    config: String,
    steps: usize,
    spatial: (usize, usize),
    mean: f64,
    std: f64,
    seed: String,
) -> Result<()> {
    let config = load_config(&config)?;
    let shape = (
        config.batch_size,
        config.num_features,
        spatial.0,
        spatial.1,
    );
    let mut norm = build(config.clone())?;
    let mut inputs = StationarySource::new(
        &calc_seed(&seed, "inputs"),
        shape,
        &vec![mean; config.num_features],
        &vec![std; config.num_features],
    )?;
    let mut grads = StationarySource::standard(&calc_seed(&seed, "grads"), shape)?;

    for _ in 0..steps {
        let (_, ctx) = norm.forward_train(inputs.sample().view())?;
        norm.backward(&ctx, grads.sample().view())?;
    }

    let stats = norm.running_statistics();
    info!(
        steps,
        strategy = ?config.strategy,
        "expected mean {} and variance {}",
        mean,
        std * std
    );
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn max_abs_diff(a: &FeatureBatch, b: &FeatureBatch) -> f64 {
    let mut max = 0.0f64;
    Zip::from(a)
        .and(b)
        .for_each(|&x, &y| max = max.max((x - y).abs()));
    max
}

fn calc_seed(seed: &str, stream: &str) -> [u8; 32] {
    blake3::hash(format!("{}:{}", seed, stream).as_bytes()).into()
}

fn load_config(config: &str) -> Result<ControlNormConfig> {
    let config = if config.ends_with(".json") {
        fs::read_to_string(config)
            .map_err(|e| anyhow!("Failed to read config file {}: {}", config, e))?
    } else {
        config.to_string()
    };

    let config = serde_json::from_str::<ControlNormConfig>(&config)
        .map_err(|e| anyhow!("Failed to parse config: {}", e))?;
    config.validate()?;
    Ok(config)
}
