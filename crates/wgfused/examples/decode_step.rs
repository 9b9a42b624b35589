use half::f16;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use wgfused::cpu::CpuDevice;
use wgfused::decoder::{
    DecoderConfig, DecoderInputs, DecoderWeights, FusedMultiTransformer, LayerCollections,
};
use wgcore::gpu::GpuInstance;
use wgcore::kernel::CommandEncoderExt;
use wgcore::tensor::{GpuVector, TensorBuilder};
use wgfused::gpu::{GpuLayerNormAct, GpuParam};
use wgfused::norm_act::{LayerNormAct, NormActConfig};
use wgfused::parallel::SingleProcess;
use wgfused::{Activation, ActivationKind, DType, Tensor};
use wgpu::BufferUsages;

const LAYERS: usize = 2;
const EMBED: usize = 32;
const HEADS: usize = 4;
const HEAD_DIM: usize = 8;
const FFN: usize = 64;
const PROMPT: usize = 5;
const STEPS: usize = 4;
const MAX_SEQ: usize = PROMPT + STEPS;

fn random(rng: &mut StdRng, shape: &[usize], center: f32, dtype: DType) -> Tensor {
    let len = shape.iter().product();
    let data = (0..len)
        .map(|_| center + rng.gen_range(-0.5f32..0.5))
        .collect();
    Tensor::from_f32(shape, data).unwrap().to_dtype(dtype)
}

fn rotary_table(positions: usize) -> Tensor {
    let half = HEAD_DIM / 2;
    let angle = |j: usize| {
        let (pos, i) = (j / half, j % half);
        pos as f32 / 10_000f32.powf(2.0 * i as f32 / HEAD_DIM as f32)
    };
    let cos = (0..positions * half).map(|j| angle(j).cos());
    let sin = (0..positions * half).map(|j| angle(j).sin());
    Tensor::from_f32([2, positions, half], cos.chain(sin).collect()).unwrap()
}

fn causal_mask(seq: usize) -> Tensor {
    let data = (0..seq * seq)
        .map(|i| if i % seq <= i / seq { 0.0 } else { f32::NEG_INFINITY })
        .collect();
    Tensor::from_f32([1, 1, seq, seq], data).unwrap()
}

fn last_token(x: &Tensor) -> Tensor {
    let data = x.to_f32_vec();
    Tensor::from_f32([1, 1, EMBED], data[data.len() - EMBED..].to_vec()).unwrap()
}

#[async_std::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    /*
     * A small random model with half-precision weights.
     */
    let mut rng = StdRng::seed_from_u64(42);
    let mut params = |shape: &[usize], center| random(&mut rng, shape, center, DType::F16);
    let norms: Vec<_> = (0..LAYERS * 4)
        .map(|i| params(&[EMBED], if i % 2 == 0 { 1.0 } else { 0.0 }))
        .collect();
    let qkv: Vec<_> = (0..LAYERS)
        .map(|_| params(&[3, HEADS, HEAD_DIM, EMBED], 0.0))
        .collect();
    let out_linear: Vec<_> = (0..LAYERS)
        .map(|_| params(&[HEADS * HEAD_DIM, EMBED], 0.0))
        .collect();
    let ffn1: Vec<_> = (0..LAYERS).map(|_| params(&[EMBED, FFN], 0.0)).collect();
    let ffn2: Vec<_> = (0..LAYERS).map(|_| params(&[FFN, EMBED], 0.0)).collect();

    let collections = LayerCollections {
        ln_scales: (0..LAYERS).map(|l| Some(&norms[l * 4])).collect(),
        ln_biases: (0..LAYERS).map(|l| Some(&norms[l * 4 + 1])).collect(),
        qkv_weights: qkv.iter().collect(),
        qkv_biases: vec![None; LAYERS],
        out_linear_weights: out_linear.iter().collect(),
        out_linear_biases: vec![None; LAYERS],
        ffn_ln_scales: (0..LAYERS).map(|l| Some(&norms[l * 4 + 2])).collect(),
        ffn_ln_biases: (0..LAYERS).map(|l| Some(&norms[l * 4 + 3])).collect(),
        ffn1_weights: ffn1.iter().collect(),
        ffn1_biases: vec![None; LAYERS],
        ffn2_weights: ffn2.iter().collect(),
        ffn2_biases: vec![None; LAYERS],
    };

    let config = DecoderConfig {
        rotary_emb_dims: 1,
        act_method: "gelu".to_string(),
        ..Default::default()
    };
    let device = CpuDevice::new();
    let decoder = FusedMultiTransformer::new(&device, &SingleProcess, config)?;
    let weights = DecoderWeights::new(collections, decoder.config())?;
    let table = rotary_table(MAX_SEQ);
    let mut caches = vec![Tensor::zeros([2, 1, HEADS, MAX_SEQ, HEAD_DIM], DType::F32); LAYERS];

    /*
     * Context phase, then one decode step per generated token.
     */
    let prompt = random(&mut rng, &[1, PROMPT, EMBED], 0.0, DType::F32);
    let mask = causal_mask(PROMPT);
    let mut hidden = Tensor::zeros(prompt.shape(), DType::F32);
    decoder.forward(
        &prompt,
        &weights,
        &DecoderInputs {
            rotary_emb: Some(&table),
            attn_mask: Some(&mask),
            ..Default::default()
        },
        Some(&mut caches[..]),
        &mut hidden,
    )?;
    println!("Context phase: {PROMPT} tokens processed.");

    let mut token = last_token(&hidden);
    for time_step in PROMPT..MAX_SEQ {
        let mut next = Tensor::zeros(token.shape(), DType::F32);
        decoder.forward(
            &token,
            &weights,
            &DecoderInputs {
                rotary_emb: Some(&table),
                time_step: Some(time_step),
                ..Default::default()
            },
            Some(&mut caches[..]),
            &mut next,
        )?;
        let norm: f32 = next.to_f32_vec().iter().map(|x| x * x).sum::<f32>().sqrt();
        println!("Decode step {time_step}: output norm {norm:.4}");
        token = next;
    }

    /*
     * Final normalization on the gpu, checked against the cpu.
     */
    let final_norm = NormActConfig {
        activation: Activation::new(ActivationKind::Tanh),
        ..Default::default()
    };
    let flat = Tensor::from_f32([1, EMBED], token.to_f32_vec())?;
    let mut expected = Tensor::zeros([1, EMBED], DType::F32);
    LayerNormAct::new(&device).run(&flat, Some(&norms[0]), None, &final_norm, &mut expected)?;

    let gpu = GpuInstance::new().await?;
    let kernel = GpuLayerNormAct::from_device(gpu.device())?;
    let gpu_x = TensorBuilder::tensor([1, EMBED as u32], BufferUsages::STORAGE)
        .build_init(gpu.device(), &flat.to_f32_vec());
    // Uploaded in half precision, widened on the device.
    let scale: Vec<_> = norms[0].to_f32_vec().into_iter().map(f16::from_f32).collect();
    let gpu_scale = GpuVector::init(gpu.device(), &scale, BufferUsages::STORAGE);
    let gpu_out = TensorBuilder::tensor(
        [1, EMBED as u32],
        BufferUsages::STORAGE | BufferUsages::COPY_SRC,
    )
    .build::<f32>(gpu.device());
    let staging = TensorBuilder::tensor(
        [1, EMBED as u32],
        BufferUsages::MAP_READ | BufferUsages::COPY_DST,
    )
    .build::<f32>(gpu.device());

    let mut encoder = gpu.device().create_command_encoder(&Default::default());
    {
        let mut pass = encoder.compute_pass("final_norm", None);
        kernel.dispatch(
            gpu.device(),
            &mut pass,
            &gpu_x,
            Some(GpuParam::from(&gpu_scale)),
            None,
            &final_norm,
            &gpu_out,
        )?;
    }
    staging.copy_from(&mut encoder, &gpu_out);
    gpu.queue().submit(Some(encoder.finish()));

    let result = staging.read(gpu.device()).await?;
    let max_err = result
        .iter()
        .zip(expected.to_f32_vec())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f32, f32::max);
    println!("Gpu normalization matches the cpu (max error {max_err:.2e}).");

    Ok(())
}
