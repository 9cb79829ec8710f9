use attention::masks::build_causal_mask;
use attention::AttentionConfig;
use candle_core::{Device, Tensor};
use model::{fuse_attention, Container, FuseError, Module, SelfAttention};
use quant::{QuantError, QuantLinear};
use rotary::{apply_rotary_pos_emb, RotaryEmbedding};

const HIDDEN: usize = 16;
const HEADS: usize = 2;
const HEAD_DIM: usize = HIDDEN / HEADS;

fn projection(device: &Device, out_features: usize, bits: usize) -> QuantLinear {
    let weight = Tensor::randn(0f32, 0.5, (HIDDEN, out_features), device).unwrap();
    QuantLinear::quantize(&weight, bits, HIDDEN, None).unwrap()
}

fn self_attention(device: &Device, key_bits: usize) -> SelfAttention {
    SelfAttention {
        config: AttentionConfig {
            hidden_size: HIDDEN,
            num_heads: HEADS,
            max_position_embeddings: 64,
        },
        q_proj: projection(device, HIDDEN, 8),
        k_proj: projection(device, HIDDEN, key_bits),
        v_proj: projection(device, HIDDEN, 8),
        o_proj: projection(device, HIDDEN, 8),
        rotary: RotaryEmbedding::new(HEAD_DIM, 10_000.0).unwrap(),
    }
}

fn decoder_layer(device: &Device, key_bits: usize) -> Module {
    let mut layer = Container::new();
    layer
        .insert(
            "self_attn",
            Module::Attention(Box::new(self_attention(device, key_bits))),
        )
        .unwrap();
    layer
        .insert("mlp", Module::Linear(projection(device, HIDDEN, 8)))
        .unwrap();
    Module::Container(layer)
}

fn decoder(device: &Device, key_bits_per_layer: &[usize]) -> Module {
    let mut layers = Container::new();
    for (index, &key_bits) in key_bits_per_layer.iter().enumerate() {
        layers
            .insert(index.to_string(), decoder_layer(device, key_bits))
            .unwrap();
    }
    let mut root = Container::new();
    root.insert("embed_tokens", Module::Linear(projection(device, HIDDEN, 8)))
        .unwrap();
    root.insert("layers", Module::Container(layers)).unwrap();
    Module::Container(root)
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    let diff = a.sub(b).unwrap().abs().unwrap();
    diff.flatten_all()
        .unwrap()
        .to_vec1::<f32>()
        .unwrap()
        .into_iter()
        .fold(0f32, f32::max)
}

#[test]
fn fusion_rewrites_every_attention_in_place() {
    let device = Device::Cpu;
    let mut tree = decoder(&device, &[8, 8]);

    let count = fuse_attention(&mut tree).unwrap();
    assert_eq!(count, 2);

    for layer in ["layers.0", "layers.1"] {
        let path = format!("{layer}.self_attn");
        assert!(matches!(
            tree.get(&path),
            Some(Module::FusedAttention(_))
        ));
        // Siblings and the rest of the tree stay untouched.
        assert!(matches!(
            tree.get(&format!("{layer}.mlp")),
            Some(Module::Linear(_))
        ));
    }
    assert!(matches!(tree.get("embed_tokens"), Some(Module::Linear(_))));
}

#[test]
fn fused_module_is_a_drop_in_substitute() {
    let device = Device::Cpu;
    let unfused = self_attention(&device, 8);

    let mut root = Container::new();
    root.insert("self_attn", Module::Attention(Box::new(unfused.clone())))
        .unwrap();
    let mut tree = Module::Container(root);
    fuse_attention(&mut tree).unwrap();
    let fused = match tree.get("self_attn") {
        Some(Module::FusedAttention(fused)) => fused,
        other => panic!("expected fused attention, got {other:?}"),
    };

    let seq_len = 3;
    let hidden = Tensor::randn(0f32, 1.0, (1, seq_len, HIDDEN), &device).unwrap();
    let mask = build_causal_mask(&device, 1, seq_len, seq_len).unwrap();
    let ids: Vec<u32> = (0..seq_len as u32).collect();
    let position_ids = Tensor::from_vec(ids, seq_len, &device).unwrap();

    let observed = fused
        .forward(&hidden, Some(&mask), &position_ids, None, false, false)
        .unwrap();

    // The same contract, recomputed through the three separate projections.
    let split = |proj: &QuantLinear| -> Tensor {
        proj.forward(&hidden)
            .unwrap()
            .reshape((1, seq_len, HEADS, HEAD_DIM))
            .unwrap()
            .transpose(1, 2)
            .unwrap()
            .contiguous()
            .unwrap()
    };
    let q = split(&unfused.q_proj);
    let k = split(&unfused.k_proj);
    let v = split(&unfused.v_proj);
    let (cos, sin) = unfused.rotary.tables(&v, seq_len).unwrap();
    let (q, k) = apply_rotary_pos_emb(&q, &k, &cos, &sin, &position_ids).unwrap();

    let scores = (q.matmul(&k.t().unwrap()).unwrap() / (HEAD_DIM as f64).sqrt()).unwrap();
    let scores = scores.broadcast_add(&mask).unwrap();
    let maxima = scores.max_keepdim(3).unwrap();
    let exps = scores.broadcast_sub(&maxima).unwrap().exp().unwrap();
    let probs = exps
        .broadcast_div(&exps.sum_keepdim(3).unwrap())
        .unwrap();
    let context = probs
        .matmul(&v)
        .unwrap()
        .transpose(1, 2)
        .unwrap()
        .contiguous()
        .unwrap()
        .reshape((1, seq_len, HIDDEN))
        .unwrap();
    let expected = unfused.o_proj.forward(&context).unwrap();

    assert!(max_abs_diff(&observed.output, &expected) < 1e-4);
}

#[test]
fn mismatched_projections_abort_without_mutation() {
    let device = Device::Cpu;
    // Second layer's key projection disagrees on bit width.
    let mut tree = decoder(&device, &[8, 4]);

    let err = fuse_attention(&mut tree).unwrap_err();
    assert!(matches!(
        err,
        FuseError::Quant(QuantError::FusionMismatch { field: "bits", .. })
    ));

    // Nothing was fused, including the layer that would have succeeded.
    for layer in ["layers.0", "layers.1"] {
        assert!(matches!(
            tree.get(&format!("{layer}.self_attn")),
            Some(Module::Attention(_))
        ));
    }
}

#[test]
fn second_pass_finds_nothing_to_fuse() {
    let device = Device::Cpu;
    let mut tree = decoder(&device, &[8, 8]);
    assert_eq!(fuse_attention(&mut tree).unwrap(), 2);
    assert_eq!(fuse_attention(&mut tree).unwrap(), 0);
}
