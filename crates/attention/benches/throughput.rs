//! Tokens per second through `MultiHeadAttention` for each implementation.
//! Run with: `cargo bench -p attention --bench throughput`

use std::time::Instant;

use anyhow::Result;
use attention::masks::{make_causal_mask, mask_to_bias};
use attention::{Implementation, MultiHeadAttention, MultiHeadAttentionConfig};
use candle_core::{DType, Device, Tensor};
use layers::linear::LinearInit;
use layers::{ParamStore, RngKey};

struct Shape {
    label: &'static str,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

const SHAPES: [Shape; 3] = [
    Shape {
        label: "mha",
        num_heads: 8,
        num_kv_heads: 8,
        head_dim: 64,
    },
    Shape {
        label: "gqa",
        num_heads: 8,
        num_kv_heads: 2,
        head_dim: 64,
    },
    Shape {
        label: "narrow",
        num_heads: 8,
        num_kv_heads: 8,
        head_dim: 12,
    },
];

fn main() -> Result<()> {
    let device = Device::Cpu;
    let mut rows = Vec::new();

    for shape in &SHAPES {
        for seq_len in [64usize, 256] {
            for dtype in [DType::F32, DType::BF16] {
                for implementation in [
                    Implementation::Unspecified,
                    Implementation::Generic,
                    Implementation::Fused,
                ] {
                    let cell = match bench_case(shape, seq_len, dtype, implementation, &device) {
                        Ok(tokens_sec) => format!("{tokens_sec:.0}"),
                        Err(err) => format!("n/a ({err})"),
                    };
                    rows.push(vec![
                        shape.label.to_string(),
                        format!("{}/{}x{}", shape.num_heads, shape.num_kv_heads, shape.head_dim),
                        seq_len.to_string(),
                        format!("{dtype:?}"),
                        implementation.to_string(),
                        cell,
                    ]);
                }
            }
        }
    }

    println!(
        "{}",
        markdown_table(
            &["shape", "heads", "seq", "dtype", "implementation", "tokens/s"],
            &rows
        )
    );
    Ok(())
}

fn bench_case(
    shape: &Shape,
    seq_len: usize,
    dtype: DType,
    implementation: Implementation,
    device: &Device,
) -> Result<f64> {
    let hidden = shape.num_heads * shape.head_dim;
    let mut config = MultiHeadAttentionConfig::new(shape.num_heads, hidden);
    config.num_kv_heads = Some(shape.num_kv_heads);
    config.implementation = implementation;
    config.rope_theta = Some(10_000.0);

    let key = RngKey::new(seq_len as u64);
    let mut store = ParamStore::new();
    let attention = MultiHeadAttention::new(
        config,
        &mut store,
        "attention",
        &LinearInit::XavierUniform,
        key,
        device,
        dtype,
    )?;
    let input = key
        .fold_in_str("input")
        .normal(0.0, 1.0, (1, seq_len, hidden), device)?
        .to_dtype(dtype)?;
    let bias = mask_to_bias(&make_causal_mask(device, seq_len, seq_len)?)?;

    let iterations = if seq_len <= 64 { 40 } else { 10 };
    let run = |input: &Tensor| attention.forward_with_positions(input, None, Some(&bias), None, None);

    run(&input)?;
    let start = Instant::now();
    for _ in 0..iterations {
        run(&input)?;
    }
    let elapsed = start.elapsed().as_secs_f64();
    Ok((iterations * seq_len) as f64 / elapsed)
}

fn markdown_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let line = |cells: &[String]| format!("| {} |\n", cells.join(" | "));
    let header: Vec<String> = headers.iter().map(|h| h.to_string()).collect();
    let rule: Vec<String> = headers.iter().map(|_| "---".to_string()).collect();
    let mut table = line(&header) + &line(&rule);
    for row in rows {
        table.push_str(&line(row));
    }
    table
}
