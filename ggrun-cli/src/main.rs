use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use ggrun_export::export_model;
use ggrun_inference::gguf::GgmlType;
use ggrun_inference::{InferenceConfigBuilder, ModelContainer, run_inference};
use log::{error, info};

/// Define the export subcommand.
fn export_subcommand() -> Command {
    Command::new("export")
        .about("Export a HuggingFace safetensors checkpoint into a GGUF container")
        .arg(Arg::new("MODEL_PATH")
            .help("Path to the HuggingFace model directory (containing config.json, *.safetensors, tokenizer.json)")
            .required(true)
            .index(1))
        .arg(Arg::new("OUTPUT_PATH")
            .help("Output path of the .gguf file")
            .required(true)
            .index(2))
        .arg(Arg::new("type")
            .long("type")
            .short('q')
            .help("Element type of the weight matrices: q4_0, q8_0, f16 or f32")
            .value_name("TYPE")
            .default_value("q8_0"))
}

/// Define the inference subcommand.
fn inference_subcommand() -> Command {
    Command::new("inference")
        .about("Generate tokens from a GGUF model")
        .arg(
            Arg::new("model")
                .help("GGUF model file")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("temperature")
                .short('t')
                .long("temperature")
                .value_name("FLOAT")
                .help("Temperature for sampling in [0, inf], default 0.8")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("topp")
                .short('p')
                .long("topp")
                .value_name("FLOAT")
                .help("Top-p for nucleus sampling in [0,1], default 0.95")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("max-tokens")
                .short('n')
                .long("max-tokens")
                .value_name("INT")
                .help("Number of tokens to generate, default 64")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("repeat-penalty")
                .long("repeat-penalty")
                .value_name("FLOAT")
                .help("Repeat penalty, at least 1.0, default 1.1")
                .value_parser(clap::value_parser!(f32)),
        )
        .arg(
            Arg::new("seed")
                .short('s')
                .long("seed")
                .value_name("INT")
                .help("Random seed, default: current time")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new("context")
                .short('c')
                .long("context")
                .value_name("INT")
                .help("Context window size, (default) = max tokens + prompt, capped by the model")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("eos")
                .long("eos")
                .value_name("INT")
                .help("Stop after emitting this token id")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("token")
                .long("token")
                .value_name("INT")
                .help("Start from this token id [default: BOS, else 0]")
                .conflicts_with("input")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new("input")
                .short('i')
                .long("input")
                .value_name("STRING")
                .help("Start from the byte embedding of this text"),
        )
        .arg(
            Arg::new("strict")
                .long("strict")
                .help("Use the scalar matmul kernel for bit-reproducible output")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("allow-synthetic")
                .long("allow-synthetic")
                .help("Run a zero-filled synthetic model when the file does not exist")
                .action(ArgAction::SetTrue),
        )
}

/// Define the inspect subcommand.
fn inspect_subcommand() -> Command {
    Command::new("inspect")
        .about("Print the header, architecture, metadata and tensor directory of a GGUF model")
        .arg(Arg::new("model").help("GGUF model file").required(true).index(1))
}

/// Run the export command with the provided arguments
fn run_export_command(matches: &ArgMatches) -> Result<()> {
    let model_path = matches.get_one::<String>("MODEL_PATH").context("MODEL_PATH is required")?;
    let output_path = matches.get_one::<String>("OUTPUT_PATH").context("OUTPUT_PATH is required")?;
    let weight_type: GgmlType = matches
        .get_one::<String>("type")
        .context("type is required")?
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let model_dir = Path::new(model_path);
    if !model_dir.is_dir() {
        anyhow::bail!("Model directory does not exist: {model_path}");
    }
    if !model_dir.join("config.json").exists() {
        anyhow::bail!("config.json not found in model directory")
    }

    info!("");
    info!("🚀 GGUF Model Exporter");
    info!("📁 Model path: {model_path}");
    info!("💾 Output path: {output_path}");
    info!("🔢 Weight type: {weight_type}\n");

    let report = export_model(model_path, output_path, weight_type)?;
    info!("📦 {} tensors, {} bytes, max quantization error {:.6}", report.tensors, report.bytes, report.max_error);

    Ok(())
}

/// Run the inference command with the provided arguments
fn run_inference_command(matches: &ArgMatches) -> Result<()> {
    let config = InferenceConfigBuilder::default()
        .model_path(matches.get_one::<String>("model"))
        .temperature(matches.get_one::<f32>("temperature").copied())
        .top_p(matches.get_one::<f32>("topp").copied())
        .max_tokens(matches.get_one::<usize>("max-tokens").copied())
        .repeat_penalty(matches.get_one::<f32>("repeat-penalty").copied())
        .seed(matches.get_one::<u64>("seed").copied())
        .ctx_length(matches.get_one::<usize>("context").copied())
        .eos_token(matches.get_one::<usize>("eos").copied())
        .prompt_token(matches.get_one::<usize>("token").copied())
        .prompt_text(matches.get_one::<String>("input"))
        .strict(Some(matches.get_flag("strict")))
        .allow_synthetic(Some(matches.get_flag("allow-synthetic")))
        .build()
        .map_err(|e| anyhow::anyhow!(e))?;

    run_inference(config).map_err(|e| anyhow::anyhow!("Inference failed: {e:#}"))?;

    Ok(())
}

/// Run the inspect command with the provided arguments
fn run_inspect_command(matches: &ArgMatches) -> Result<()> {
    let model_path = matches.get_one::<String>("model").context("model is required")?;
    let container = ModelContainer::open(model_path).with_context(|| format!("Failed to open {model_path}"))?;
    print!("{}", describe(&container)?);
    Ok(())
}

fn describe(container: &ModelContainer) -> Result<String> {
    let header = container.header();
    let config = container.config();
    let mut out = String::new();

    writeln!(out, "GGUF v{}, {} bytes, header {} bytes", header.version, container.len(), header.header_len)?;
    writeln!(out)?;
    let name = config.name.as_deref().map(|n| format!(" ({n})")).unwrap_or_default();
    writeln!(out, "Architecture: {}{name}", config.architecture)?;
    writeln!(out, "   • Dimensions: {}", config.dim)?;
    writeln!(out, "   • Layers: {}", config.n_layers)?;
    writeln!(
        out,
        "   • Attention heads: {} ({} KV, head_dim {}, {:?})",
        config.n_heads, config.n_kv_heads, config.head_dim, config.layout
    )?;
    writeln!(out, "   • Feed-forward: {}", config.hidden_dim)?;
    writeln!(out, "   • Vocabulary size: {}", config.vocab_size)?;
    if let Some(context_length) = config.context_length {
        writeln!(out, "   • Context length: {context_length}")?;
    }
    writeln!(out)?;

    writeln!(out, "Metadata ({} entries):", header.metadata.len())?;
    let mut entries: Vec<_> = header.metadata.iter().collect();
    entries.sort_by(|a, b| a.0.cmp(b.0));
    for (key, value) in entries {
        writeln!(out, "   {key} = {value}")?;
    }
    writeln!(out)?;

    writeln!(out, "Tensors ({}):", header.tensors.len())?;
    for tensor in header.tensors.iter() {
        writeln!(out, "   {:<32} {:>6} {:?} @ {}", tensor.name, tensor.ty.to_string(), tensor.dims, tensor.offset)?;
    }

    Ok(out)
}

fn execute_commands() -> Result<()> {
    // Initialize logger with clean format (no timestamp/module prefix)
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(buf, "{}", record.args())
        })
        .init();

    let matches = Command::new("ggrun")
        .about("ggrun: export HuggingFace checkpoints to GGUF and run them on the CPU")
        .subcommand(export_subcommand())
        .subcommand(inference_subcommand())
        .subcommand(inspect_subcommand())
        .get_matches();

    match matches.subcommand() {
        Some(("export", matches)) => run_export_command(matches),
        Some(("inference", matches)) => run_inference_command(matches),
        Some(("inspect", matches)) => run_inspect_command(matches),
        _ => anyhow::bail!("No subcommand specified. Use -h to print help information."),
    }
}

fn main() {
    if let Err(e) = execute_commands() {
        error!("Error: {e:#}");
        std::process::exit(1);
    }
}
