use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use attention::Implementation;
use candle_core::{Device, Tensor};
use clap::{Parser, Subcommand};
use layers::RngKey;
use llama::{CheckpointImport, ForwardOptions, LlamaConfig, LlamaForCausalLM};

#[derive(Debug, Parser)]
#[command(name = "llama-cli", about = "Inspect, run and import Llama-style models")]
struct Cli {
    /// Force the CPU backend even when CUDA is available.
    #[arg(long, global = true)]
    cpu: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate a config.json and print the resulting geometry.
    Inspect { config: PathBuf },
    /// Run a randomly initialised model on a token sequence.
    Forward {
        config: PathBuf,
        /// Comma separated token ids.
        #[arg(long, value_delimiter = ',', required = true)]
        ids: Vec<u32>,
        /// Comma separated padding mask (1 = valid, 0 = padding).
        #[arg(long, value_delimiter = ',')]
        mask: Option<Vec<u8>>,
        #[arg(long, default_value_t = 0)]
        seed: u64,
        /// Attention backend (`auto`, `generic`, `cudnn`).
        #[arg(long)]
        backend: Option<String>,
    },
    /// Import a safetensors checkpoint and report what was mapped.
    Import {
        config: PathBuf,
        weights: PathBuf,
        /// Token ids for a smoke forward pass after import.
        #[arg(long, value_delimiter = ',')]
        ids: Option<Vec<u32>>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let device = select_device(cli.cpu)?;
    log::info!("using device {device:?}");

    match cli.command {
        Command::Inspect { config } => inspect(&config),
        Command::Forward {
            config,
            ids,
            mask,
            seed,
            backend,
        } => forward(&config, &ids, mask.as_deref(), seed, backend, &device),
        Command::Import {
            config,
            weights,
            ids,
        } => import(&config, &weights, ids.as_deref(), &device),
    }
}

fn select_device(force_cpu: bool) -> Result<Device> {
    if force_cpu || std::env::var("CANDLE_FORCE_CPU").is_ok() {
        return Ok(Device::Cpu);
    }
    Device::cuda_if_available(0).context("failed to initialise CUDA device")
}

fn load_config(path: &Path) -> Result<LlamaConfig> {
    LlamaConfig::from_path(path).with_context(|| format!("failed to load config {}", path.display()))
}

fn inspect(path: &Path) -> Result<()> {
    let config = load_config(path)?;
    println!("vocab_size         {}", config.vocab_size);
    println!("hidden_size        {}", config.hidden_size);
    println!("intermediate_size  {}", config.intermediate_size);
    println!("layers             {}", config.num_hidden_layers);
    println!(
        "heads (q/kv)       {}/{}",
        config.num_attention_heads,
        config.num_kv_heads()
    );
    println!("head_dim           {}", config.head_dim());
    println!("rope_theta         {}", config.rope_theta);
    println!("tied embeddings    {}", config.tie_word_embeddings);
    println!("attention backend  {}", config.implementation()?);
    println!("dtype              {:?}", config.candle_dtype()?);
    Ok(())
}

fn forward(
    path: &Path,
    ids: &[u32],
    mask: Option<&[u8]>,
    seed: u64,
    backend: Option<String>,
    device: &Device,
) -> Result<()> {
    let mut config = load_config(path)?;
    if let Some(name) = backend {
        name.parse::<Implementation>()
            .with_context(|| format!("unknown attention backend {name:?}"))?;
        config.attention_implementation = Some(name);
    }
    let model = LlamaForCausalLM::new(config, device, RngKey::new(seed))
        .context("failed to build model")?;
    report_logits(&model, ids, mask, device)
}

fn import(path: &Path, weights: &Path, ids: Option<&[u32]>, device: &Device) -> Result<()> {
    let config = load_config(path)?;
    let mut model =
        LlamaForCausalLM::new(config, device, RngKey::new(0)).context("failed to build model")?;
    let tensors = candle_core::safetensors::load(weights, device)
        .with_context(|| format!("failed to read {}", weights.display()))?;

    let report = model
        .convert_weights_from_hf(tensors)
        .context("checkpoint import failed")?;
    println!(
        "assigned {} | skipped {} | tie overrides {}",
        report.assigned.len(),
        report.skipped.len(),
        report.tie_overrides.len()
    );
    for key in &report.skipped {
        println!("  skipped {key}");
    }

    match ids {
        Some(ids) => report_logits(&model, ids, None, device),
        None => Ok(()),
    }
}

fn report_logits(
    model: &LlamaForCausalLM,
    ids: &[u32],
    mask: Option<&[u8]>,
    device: &Device,
) -> Result<()> {
    if ids.is_empty() {
        bail!("--ids must contain at least one token");
    }
    let input = Tensor::new(ids, device)?.unsqueeze(0)?;
    let last = mask
        .and_then(|mask| mask.iter().rposition(|&valid| valid != 0))
        .unwrap_or(ids.len() - 1);
    let mask = match mask {
        Some(mask) if mask.len() != ids.len() => {
            bail!("--mask has {} entries but --ids has {}", mask.len(), ids.len())
        }
        Some(mask) => Some(Tensor::new(mask, device)?.unsqueeze(0)?),
        None => None,
    };

    let logits = model
        .forward(&input, mask.as_ref(), &ForwardOptions::deterministic())
        .context("forward pass failed")?;
    println!("logits shape {:?}", logits.dims());

    let next = logits.get(0)?.get(last)?.argmax(0)?.to_scalar::<u32>()?;
    println!("greedy next token after position {last}: {next}");
    Ok(())
}
