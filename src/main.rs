use std::{net::IpAddr, str::FromStr};

use clap::{Args, Parser, Subcommand};
use pose_pvt::models::WhichModel;
use rocket::{
    Config,
    data::{ByteUnit, Limits},
    routes,
};

use crate::api::init;
mod api;

#[derive(Parser, Debug)]
#[command(name = "pose_pvt")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the keypoint service
    Serv(ServArgs),
    /// Run pose estimation on one image
    Run(RunArgs),
    /// Remap an upstream PVT checkpoint and save it as safetensors
    Convert(ConvertArgs),
    /// Summarise a checkpoint, optionally checking it against a preset
    Inspect(InspectArgs),
}

#[derive(Args, Debug)]
struct ServArgs {
    /// Service listen address
    #[arg(short, long, default_value = "127.0.0.1")]
    address: String,

    /// Service listen port
    #[arg(short, long, default_value_t = 10100)]
    port: u16,

    /// Model preset, used when the weight directory has no config.json
    #[arg(short, long, default_value = "pvt-v2")]
    model: WhichModel,

    /// Local model weight path (required)
    #[arg(long, required = true)]
    weight_path: String,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Model preset, used when the weight directory has no config.json
    #[arg(short, long, default_value = "pvt-v2")]
    model: WhichModel,

    /// Input image path or url
    #[arg(short, long)]
    input: String,

    /// Output json path (optional)
    #[arg(short, long)]
    output: Option<String>,

    /// Local model weight path (required)
    #[arg(long, required = true)]
    weight_path: String,
}

#[derive(Args, Debug)]
struct ConvertArgs {
    /// Upstream checkpoint (.pth / .safetensors)
    #[arg(short, long)]
    input: String,

    /// Output .safetensors path
    #[arg(short, long)]
    output: String,

    /// Nested dict holding the weights inside a pickle, e.g. state_dict
    #[arg(long)]
    key: Option<String>,
}

#[derive(Args, Debug)]
struct InspectArgs {
    /// Checkpoint (.pth / .safetensors)
    #[arg(short, long)]
    input: String,

    /// Nested dict holding the weights inside a pickle, e.g. state_dict
    #[arg(long)]
    key: Option<String>,

    /// Dry-run load into this preset and list missing / unexpected keys
    #[arg(short, long)]
    model: Option<WhichModel>,
}

async fn run_serv(args: ServArgs) -> anyhow::Result<()> {
    let ServArgs {
        address,
        port,
        model,
        weight_path,
    } = args;

    init(model, weight_path)?;
    start_http_server(address, port).await?;

    Ok(())
}

fn run_run(args: RunArgs) -> anyhow::Result<()> {
    use pose_pvt::exec::{ExecModel, pose_pvt::PosePvtExec};

    let RunArgs {
        model,
        input,
        output,
        weight_path,
    } = args;
    PosePvtExec::run(model, &input, output.as_deref(), &weight_path)
}

fn run_convert(args: ConvertArgs) -> anyhow::Result<()> {
    let ConvertArgs { input, output, key } = args;
    pose_pvt::exec::convert::run_convert(&input, &output, key.as_deref())?;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pose_pvt=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serv(args) => run_serv(args).await,
        Commands::Run(args) => run_run(args),
        Commands::Convert(args) => run_convert(args),
        Commands::Inspect(args) => {
            pose_pvt::exec::inspect::run_inspect(&args.input, args.key.as_deref(), args.model)
        }
    }
}

pub(crate) async fn start_http_server(address: String, port: u16) -> anyhow::Result<()> {
    let builder = rocket::build().configure(Config {
        address: IpAddr::from_str(&address)?,
        port,
        limits: Limits::default()
            .limit("string", ByteUnit::Mebibyte(5))
            .limit("json", ByteUnit::Mebibyte(20)),
        ..Config::default()
    });

    builder
        .mount("/pose", routes![api::keypoints])
        .mount("/", routes![api::health])
        .launch()
        .await?;
    Ok(())
}
