use std::process::ExitCode;

use log::error;
use rowblock_matmul::job::{self, random_operands};
use rowblock_matmul::{JobConfig, Matrix, NaiveKernel};

fn usage(program: &str) {
    eprintln!("Usage: {} [local|shmem] [N] [P]", program);
    eprintln!("  local  - one thread per process (default)");
    eprintln!("  shmem  - one OS process per rank, shared-memory messaging");
    eprintln!("Environment: MATMUL_DIMENSION, MATMUL_PROCS, MATMUL_TIMEOUT_MS,");
    eprintln!("             MATMUL_WORKER_TIMEOUT_MS, MATMUL_SLOT_BYTES, MATMUL_SEED,");
    eprintln!("             MATMUL_TRANSPORT, RUST_LOG");
}

/// Top-left 3x3 corner of `m`, or less when `m` is smaller.
fn corner(m: &Matrix) -> Vec<Vec<f64>> {
    (0..m.rows().min(3))
        .map(|i| m.row(i)[..m.cols().min(3)].to_vec())
        .collect()
}

fn print_sample(name: &str, sample: &[Vec<f64>]) {
    println!("\nSample of {} (top-left 3x3):", name);
    for row in sample {
        let row: Vec<String> = row.iter().map(|v| format!("{:.3}", v)).collect();
        println!("  [{}]", row.join(" "));
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();
    let program = args.first().map_or("matmul", String::as_str);

    let config = match JobConfig::from_env().and_then(|c| c.with_args(args.iter().skip(1))) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", e);
            usage(program);
            return ExitCode::FAILURE;
        }
    };

    let mut samples = None;
    let outcome = job::run_with(&config, NaiveKernel, || {
        let (a, b) = random_operands(&config);
        samples = Some((corner(&a), corner(&b)));
        (a, b)
    });

    match outcome {
        Ok(Some(output)) => {
            println!(
                "\nMatrix multiplication of {0}x{0} operands with {1} processes ({2})",
                config.dimension, config.participants, config.transport
            );
            println!("Execution Time: {:.4} seconds", output.elapsed.as_secs_f64());
            if let Some((a, b)) = &samples {
                print_sample("Matrix A", a);
                print_sample("Matrix B", b);
            }
            print_sample("Result Matrix C", &corner(&output.result));
            ExitCode::SUCCESS
        }
        // Spawned worker process: nothing to report.
        Ok(None) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Job failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
