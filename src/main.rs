//! deephallu-rs CLI: attention modification experiments on a mock VLM

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::Result;
use candle_core::{Device, Tensor};
use clap::Parser;
use deephallu_rs::{
    AttentionModifier, AttentionPolicy, BenchmarkDataset, ChairScore, CrossAttentionType,
    GenerationRecorder, LogBase, Metric, MockVlm, MockVlmConfig, PopeEvaluator, RawTokenDecoder,
    RecorderConfig, SparsifyMethod,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "deephallu-rs")]
#[command(about = "Attention-level hallucination analysis for VLMs")]
#[command(version)]
struct Cli {
    /// Batch size for the mock forward pass
    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    /// Vision segment length (number of image tokens)
    #[arg(long, default_value_t = 8)]
    vision_seq_len: usize,

    /// Text segment length (number of text tokens)
    #[arg(long, default_value_t = 12)]
    text_seq_len: usize,

    /// Fraction of vision-vision attention weights to keep
    #[arg(long, default_value_t = 0.1)]
    vision_sparsity: f32,

    /// Cross-modal visibility: bidirectional, vision_to_text, text_to_vision
    #[arg(long, default_value = "bidirectional")]
    cross_attention: String,

    /// Sparsification strategy: topk, threshold, random
    #[arg(long, default_value = "topk")]
    sparsify_method: String,

    /// Top-k predictions recorded per decoding step
    #[arg(long, default_value_t = 5)]
    top_k: usize,

    /// Tokens generated per dataset sample
    #[arg(long, default_value_t = 20)]
    max_new_tokens: usize,

    /// Benchmark dataset JSON; entropy recording runs when given
    #[arg(short, long)]
    dataset: Option<PathBuf>,

    /// Output directory for results
    #[arg(short, long, default_value = "outputs")]
    output: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    println!("=== deephallu-rs: attention modification experiment ===");
    println!("Vision length:   {}", cli.vision_seq_len);
    println!("Text length:     {}", cli.text_seq_len);
    println!("Sparsity ratio:  {}", cli.vision_sparsity);
    println!("Cross attention: {}", cli.cross_attention);
    println!("Output:          {}", cli.output.display());

    let device = Device::Cpu;
    let config = MockVlmConfig {
        vision_len: cli.vision_seq_len,
        ..MockVlmConfig::default()
    };
    let vision_feat_dim = config.vision_feat_dim;
    let mut model = MockVlm::new(config, &device)?;

    let policy = AttentionPolicy {
        vision_sparsity_ratio: cli.vision_sparsity,
        cross_attention_type: cli.cross_attention.parse::<CrossAttentionType>()?,
        sparsify_method: cli.sparsify_method.parse::<SparsifyMethod>()?,
        ..AttentionPolicy::default()
    };
    let mut modifier = AttentionModifier::new(policy)?;

    // Shared mock inputs for the baseline and modified passes
    let vision = Tensor::randn(
        0.0f32,
        1.0,
        (cli.batch_size, cli.vision_seq_len, vision_feat_dim),
        &device,
    )?;
    let ids: Vec<u32> = (0..cli.batch_size * cli.text_seq_len)
        .map(|i| (i % 128) as u32)
        .collect();
    let input_ids = Tensor::from_vec(ids, (cli.batch_size, cli.text_seq_len), &device)?;

    info!("Running baseline forward pass");
    let baseline = model.forward(&vision, &input_ids)?;
    info!(
        "Baseline logits: {:?}",
        baseline.logits.dims()
    );

    info!("Running modified forward pass");
    modifier.run_with_hooks(
        &mut model,
        cli.vision_seq_len,
        cli.text_seq_len,
        None,
        |m| m.forward(&vision, &input_ids),
    )?;

    // Per-layer before/after analysis
    let analysis = modifier.get_attention_analysis()?;
    println!("\n=== Attention analysis ===");
    for (layer, stats) in &analysis {
        println!(
            "{layer}: entropy {:.4} -> {:.4}, sparsity {:.4} -> {:.4}, change {:.4}",
            stats.attention_entropy,
            stats.modified_entropy.unwrap_or(f32::NAN),
            stats.attention_sparsity,
            stats.modified_sparsity.unwrap_or(f32::NAN),
            stats.attention_change.unwrap_or(f32::NAN),
        );
    }

    std::fs::create_dir_all(&cli.output)?;
    let results_path = cli.output.join("experiment_results.json");
    std::fs::write(&results_path, serde_json::to_string_pretty(&analysis)?)?;
    info!("Results saved to {}", results_path.display());

    // Entropy recording over a benchmark dataset, when one is given
    if let Some(dataset_path) = &cli.dataset {
        let dataset = BenchmarkDataset::load(dataset_path)?;
        info!(
            "Recording generation over {} samples ({:?} categories)",
            dataset.len(),
            dataset.categories()
        );

        let recorder = GenerationRecorder::new(RecorderConfig {
            max_new_tokens: cli.max_new_tokens,
            top_k: cli.top_k,
            log_base: LogBase::Nats,
            output_dir: cli.output.clone(),
        })?;
        let report = recorder.run(&mut model, &dataset, &RawTokenDecoder)?;

        println!("\n=== Generation recording ===");
        println!(
            "Recorded {} samples, {} failed",
            report.summaries.len(),
            report.failed_samples
        );

        // Hallucination metrics against the reference answers
        let predictions: Vec<String> = report
            .summaries
            .iter()
            .map(|s| s.generated_text.clone())
            .collect();
        let references: Vec<String> =
            report.summaries.iter().map(|s| s.answer.clone()).collect();

        let mut metric_scores: BTreeMap<String, BTreeMap<String, f64>> = BTreeMap::new();
        let metrics: Vec<Box<dyn Metric>> =
            vec![Box::new(ChairScore::new()), Box::new(PopeEvaluator::new())];
        for metric in &metrics {
            let scores = metric.compute(&predictions, &references)?;
            println!("\n{}:", metric.name());
            for (key, value) in &scores {
                println!("  {key}: {value:.4}");
            }
            metric_scores.insert(metric.name().to_string(), scores);
        }

        let metrics_path = cli.output.join("metrics.json");
        std::fs::write(&metrics_path, serde_json::to_string_pretty(&metric_scores)?)?;
        info!("Metrics saved to {}", metrics_path.display());
    }

    Ok(())
}
