use clap::Parser;

use fleetq::config::DEFAULT_KV_ENDPOINT;
use fleetq::docker::ContainerConfig;
use fleetq::job::{Fileset, Job, JobFileset};
use fleetq::kv::{EtcdClient, KvStore, PATH_JOBS};

#[derive(Parser, Debug)]
#[command(name = "fleetq-submit")]
#[command(about = "Enqueue a job for the worker fleet")]
struct Args {
    /// KV store endpoint
    #[arg(long, default_value = DEFAULT_KV_ENDPOINT)]
    kv: String,

    /// Image for the workload container
    #[arg(long)]
    image: String,

    /// Working directory, relative to the job workspace
    #[arg(long, default_value = "")]
    workdir: String,

    /// Input fileset name (empty means latest)
    #[arg(long, default_value = "")]
    input: String,

    /// Input fileset glob patterns
    #[arg(long = "input-pattern")]
    input_patterns: Vec<String>,

    /// Output fileset name (omit to skip the push stage)
    #[arg(long)]
    output: Option<String>,

    /// Output fileset glob patterns
    #[arg(long = "output-pattern")]
    output_patterns: Vec<String>,

    /// Command to run in the workload container, split on whitespace
    #[arg(short, long)]
    cmd: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config = ContainerConfig {
        image: args.image,
        cmd: args.cmd.split_whitespace().map(str::to_string).collect(),
        working_dir: args.workdir,
        volumes: Default::default(),
    };
    let fileset = JobFileset {
        input: Some(Fileset {
            name: args.input,
            patterns: args.input_patterns,
        }),
        output: args.output.map(|name| Fileset {
            name,
            patterns: args.output_patterns,
        }),
    };
    let job = Job::queued(config, fileset);

    let kv = EtcdClient::connect(&args.kv).await?;
    let key = kv
        .create_in_order(PATH_JOBS, &serde_json::to_string(&job)?)
        .await?;

    println!("Job queued at {}", key);

    Ok(())
}
