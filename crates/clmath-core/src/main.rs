use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use clmath_core::{
    BackendConfig, ClError, ComputeBackend, DynamicBackend, Image, ReduceOp, SessionCell,
    SoftBackend, reduce, search,
};

#[cfg(feature = "metrics")]
use clmath_core::summary;

/// Lists the GPUs, runs the four reductions and one sliding-window search.
#[derive(Parser, Debug)]
#[command(name = "clmath", version)]
struct Cli {
    /// Use the in-process software backend instead of the OpenCL driver.
    #[arg(long)]
    soft: bool,

    /// Device index for the reductions and the search.
    #[arg(long, default_value_t = 0)]
    device: usize,

    /// Number of windows requested from the search.
    #[arg(long, default_value_t = 16)]
    times: usize,

    /// Values to reduce.
    #[arg(default_values_t = [100.0, 5.0, 2.0])]
    values: Vec<f64>,
}

const BIG: usize = 64;
const TPL: usize = 8;

fn main() -> Result<(), ClError> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    if cli.soft {
        run(SessionCell::new(|| Ok(SoftBackend::new(["soft-gpu-0", "soft-gpu-1"]))), &cli)
    } else {
        run(SessionCell::new(|| DynamicBackend::load(&BackendConfig::from_env())), &cli)
    }
}

fn run<B: ComputeBackend>(cell: SessionCell<B>, cli: &Cli) -> Result<(), ClError> {
    /* ---------- 1. Geräte ---------------------------------------- */
    let session = cell.ensure_initialized()?;
    for index in 0..session.device_count() {
        println!("[{index}] {}", session.device_name(index)?);
    }

    /* ---------- 2. Reduktionen ----------------------------------- */
    for op in ReduceOp::ALL {
        let value = reduce(&session, op, &cli.values, cli.device)?;
        println!("{op:?}({:?}) = {value}", cli.values);
    }

    /* ---------- 3. Sliding Window -------------------------------- */
    // Diagonal gradient; the template is cut out at (24, 16).
    let big: Vec<i32> = (0..BIG * BIG)
        .map(|i| (((i / BIG) * 3 + (i % BIG) * 5) % 256) as i32)
        .collect();
    let (tx, ty) = (24, 16);
    let tpl: Vec<i32> = (0..TPL)
        .flat_map(|u| big[(ty + u) * BIG + tx..(ty + u) * BIG + tx + TPL].to_vec())
        .collect();

    let hits = search(
        &session,
        Image::new(&big, BIG, BIG)?,
        Image::new(&tpl, TPL, TPL)?,
        cli.times,
    )?;
    info!(valid = hits.len(), requested = cli.times, "search done");
    if let Some(best) = hits.iter().max_by(|a, b| a.score.total_cmp(&b.score)) {
        println!(
            "best window: score={:.4} at ({}, {}) size {}x{}",
            best.score, best.x, best.y, best.width, best.height
        );
    }

    #[cfg(feature = "metrics")]
    summary();

    drop(session);
    cell.dispose();
    Ok(())
}
