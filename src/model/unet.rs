//! UNet noise-prediction network.
//!
//! One concrete [`NoisePredictor`]: residual blocks with group norm and a
//! timestep embedding, optional self-attention per resolution, stride-2
//! downsampling and transposed-conv upsampling with skip connections. The
//! diffusion core never depends on these internals; anything satisfying the
//! trait works in its place.

use std::ops::Neg;

use tch::nn::{self, Module};
use tch::{Kind, Tensor};

use super::ddpm::NoisePredictor;

const NORM_GROUPS: i64 = 8;

/// Sinusoidal position embeddings for timestep encoding.
fn sinusoidal_embedding(timesteps: &Tensor, dim: i64) -> Tensor {
    let device = timesteps.device();
    let half_dim = dim / 2;

    let emb = (10000.0_f64.ln() / (half_dim - 1) as f64).neg();
    let emb = (Tensor::arange(half_dim, (Kind::Float, device)) * emb).exp();
    let emb = timesteps.unsqueeze(-1).to_kind(Kind::Float) * emb.unsqueeze(0);

    Tensor::cat(&[emb.sin(), emb.cos()], -1)
}

/// Time embedding MLP on top of the sinusoidal encoding.
#[derive(Debug)]
struct TimeEmbedding {
    linear1: nn::Linear,
    linear2: nn::Linear,
    sin_dim: i64,
}

impl TimeEmbedding {
    fn new(vs: &nn::Path, sin_dim: i64, emb_dim: i64) -> Self {
        let linear1 = nn::linear(vs / "time_linear1", sin_dim, emb_dim, Default::default());
        let linear2 = nn::linear(vs / "time_linear2", emb_dim, emb_dim, Default::default());

        Self {
            linear1,
            linear2,
            sin_dim,
        }
    }

    fn forward(&self, t: &Tensor) -> Tensor {
        let emb = sinusoidal_embedding(t, self.sin_dim);
        let emb = self.linear1.forward(&emb).silu();
        self.linear2.forward(&emb)
    }
}

/// Residual block with a per-channel time projection added between convs.
#[derive(Debug)]
struct ResidualBlock {
    norm1: nn::GroupNorm,
    conv1: nn::Conv2D,
    norm2: nn::GroupNorm,
    conv2: nn::Conv2D,
    time_proj: nn::Linear,
    shortcut: Option<nn::Conv2D>,
}

impl ResidualBlock {
    fn new(vs: &nn::Path, in_channels: i64, out_channels: i64, time_dim: i64) -> Self {
        let conv_cfg = nn::ConvConfig {
            padding: 1,
            ..Default::default()
        };

        let norm1 = nn::group_norm(vs / "norm1", NORM_GROUPS, in_channels, Default::default());
        let conv1 = nn::conv2d(vs / "conv1", in_channels, out_channels, 3, conv_cfg);
        let norm2 = nn::group_norm(vs / "norm2", NORM_GROUPS, out_channels, Default::default());
        let conv2 = nn::conv2d(vs / "conv2", out_channels, out_channels, 3, conv_cfg);
        let time_proj = nn::linear(vs / "time_proj", time_dim, out_channels, Default::default());

        let shortcut = (in_channels != out_channels).then(|| {
            nn::conv2d(
                vs / "shortcut",
                in_channels,
                out_channels,
                1,
                Default::default(),
            )
        });

        Self {
            norm1,
            conv1,
            norm2,
            conv2,
            time_proj,
            shortcut,
        }
    }

    fn forward(&self, x: &Tensor, t_emb: &Tensor) -> Tensor {
        let h = self.conv1.forward(&self.norm1.forward(x).silu());

        let t = self.time_proj.forward(&t_emb.silu());
        let h = h + t.unsqueeze(-1).unsqueeze(-1);

        let h = self.conv2.forward(&self.norm2.forward(&h).silu());

        match &self.shortcut {
            Some(conv) => h + conv.forward(x),
            None => h + x,
        }
    }
}

/// Single-head self-attention over spatial positions.
#[derive(Debug)]
struct AttentionBlock {
    qkv: nn::Linear,
    out: nn::Linear,
    channels: i64,
}

impl AttentionBlock {
    fn new(vs: &nn::Path, channels: i64) -> Self {
        let qkv = nn::linear(vs / "qkv", channels, channels * 3, Default::default());
        let out = nn::linear(vs / "out", channels, channels, Default::default());

        Self { qkv, out, channels }
    }

    fn forward(&self, x: &Tensor) -> Tensor {
        let (b, c, h, w) = x.size4().expect("attention input must be 4-d");

        // (B, C, H, W) -> (B, HW, C)
        let flat = x.view([b, c, h * w]).transpose(1, 2);

        let qkv = self.qkv.forward(&flat);
        let chunks = qkv.chunk(3, -1);
        let (q, k, v) = (&chunks[0], &chunks[1], &chunks[2]);

        let scale = (self.channels as f64).powf(-0.5);
        let scores = (q.matmul(&k.transpose(1, 2)) * scale).softmax(-1, Kind::Float);
        let attended = self.out.forward(&scores.matmul(v));

        attended.transpose(1, 2).view([b, c, h, w]) + x
    }
}

#[derive(Debug)]
struct Downsample {
    conv: nn::Conv2D,
}

impl Downsample {
    fn new(vs: &nn::Path, channels: i64) -> Self {
        let conv = nn::conv2d(
            vs / "conv",
            channels,
            channels,
            3,
            nn::ConvConfig {
                stride: 2,
                padding: 1,
                ..Default::default()
            },
        );

        Self { conv }
    }

    fn forward(&self, x: &Tensor) -> Tensor {
        self.conv.forward(x)
    }
}

#[derive(Debug)]
struct Upsample {
    conv: nn::ConvTranspose2D,
}

impl Upsample {
    fn new(vs: &nn::Path, channels: i64) -> Self {
        let conv = nn::conv_transpose2d(
            vs / "conv",
            channels,
            channels,
            4,
            nn::ConvTransposeConfig {
                stride: 2,
                padding: 1,
                ..Default::default()
            },
        );

        Self { conv }
    }

    fn forward(&self, x: &Tensor) -> Tensor {
        self.conv.forward(x)
    }
}

#[derive(Debug)]
struct Block {
    res: ResidualBlock,
    attn: Option<AttentionBlock>,
}

impl Block {
    fn forward(&self, x: &Tensor, t_emb: &Tensor) -> Tensor {
        let h = self.res.forward(x, t_emb);
        match &self.attn {
            Some(attn) => attn.forward(&h),
            None => h,
        }
    }
}

#[derive(Debug)]
struct DownStage {
    blocks: Vec<Block>,
    downsample: Option<Downsample>,
}

#[derive(Debug)]
struct UpStage {
    blocks: Vec<Block>,
    upsample: Option<Upsample>,
}

/// UNet eps-model.
///
/// `channel_multipliers[i]` scales the base width at resolution i and
/// `is_attention[i]` enables self-attention there; resolutions halve the
/// spatial size going down and mirror back up through skip connections.
#[derive(Debug)]
pub struct UNet {
    time_emb: TimeEmbedding,
    image_proj: nn::Conv2D,
    down: Vec<DownStage>,
    mid_res1: ResidualBlock,
    mid_attn: AttentionBlock,
    mid_res2: ResidualBlock,
    up: Vec<UpStage>,
    norm: nn::GroupNorm,
    out_conv: nn::Conv2D,
}

impl UNet {
    /// Build the network under a VarStore path.
    ///
    /// `channel_multipliers` and `is_attention` must be the same length;
    /// validated upstream by the configuration layer.
    pub fn new(
        vs: &nn::Path,
        image_channels: i64,
        n_channels: i64,
        channel_multipliers: &[i64],
        is_attention: &[bool],
        n_blocks: usize,
    ) -> Self {
        let n_resolutions = channel_multipliers.len();
        let time_dim = n_channels * 4;

        let time_emb = TimeEmbedding::new(&(vs / "time_emb"), n_channels, time_dim);
        let image_proj = nn::conv2d(
            vs / "image_proj",
            image_channels,
            n_channels,
            3,
            nn::ConvConfig {
                padding: 1,
                ..Default::default()
            },
        );

        // Channel count of every stored skip connection, in push order; the
        // up path consumes them back to front.
        let mut skip_channels = vec![n_channels];
        let mut ch = n_channels;

        let mut down = Vec::with_capacity(n_resolutions);
        for (i, &mult) in channel_multipliers.iter().enumerate() {
            let out = n_channels * mult;
            let sp = vs / format!("down_{}", i);

            let mut blocks = Vec::with_capacity(n_blocks);
            for b in 0..n_blocks {
                let bp = &sp / format!("block_{}", b);
                let res = ResidualBlock::new(&bp, ch, out, time_dim);
                let attn = is_attention[i].then(|| AttentionBlock::new(&(&bp / "attn"), out));
                blocks.push(Block { res, attn });
                ch = out;
                skip_channels.push(ch);
            }

            let downsample = (i + 1 < n_resolutions).then(|| {
                skip_channels.push(ch);
                Downsample::new(&(&sp / "downsample"), ch)
            });

            down.push(DownStage { blocks, downsample });
        }

        let mp = vs / "middle";
        let mid_res1 = ResidualBlock::new(&(&mp / "res1"), ch, ch, time_dim);
        let mid_attn = AttentionBlock::new(&(&mp / "attn"), ch);
        let mid_res2 = ResidualBlock::new(&(&mp / "res2"), ch, ch, time_dim);

        let mut up = Vec::with_capacity(n_resolutions);
        for (i, &mult) in channel_multipliers.iter().enumerate().rev() {
            let out = n_channels * mult;
            let sp = vs / format!("up_{}", i);

            // One extra block per resolution consumes the skip left by the
            // downsample (or the image projection at the finest level).
            let mut blocks = Vec::with_capacity(n_blocks + 1);
            for b in 0..=n_blocks {
                let skip = skip_channels.pop().expect("skip channel bookkeeping");
                let bp = &sp / format!("block_{}", b);
                let res = ResidualBlock::new(&bp, ch + skip, out, time_dim);
                let attn = is_attention[i].then(|| AttentionBlock::new(&(&bp / "attn"), out));
                blocks.push(Block { res, attn });
                ch = out;
            }

            let upsample = (i > 0).then(|| Upsample::new(&(&sp / "upsample"), ch));

            up.push(UpStage { blocks, upsample });
        }

        let norm = nn::group_norm(vs / "norm", NORM_GROUPS, ch, Default::default());
        let out_conv = nn::conv2d(
            vs / "out_conv",
            ch,
            image_channels,
            3,
            nn::ConvConfig {
                padding: 1,
                ..Default::default()
            },
        );

        Self {
            time_emb,
            image_proj,
            down,
            mid_res1,
            mid_attn,
            mid_res2,
            up,
            norm,
            out_conv,
        }
    }

    /// Predict noise for a batch `(N, C, H, W)` at timesteps `(N,)`.
    pub fn forward(&self, x: &Tensor, t: &Tensor) -> Tensor {
        let t_emb = self.time_emb.forward(t);

        let mut h = self.image_proj.forward(x);
        let mut skips = vec![h.shallow_clone()];

        for stage in &self.down {
            for block in &stage.blocks {
                h = block.forward(&h, &t_emb);
                skips.push(h.shallow_clone());
            }
            if let Some(downsample) = &stage.downsample {
                h = downsample.forward(&h);
                skips.push(h.shallow_clone());
            }
        }

        h = self.mid_res1.forward(&h, &t_emb);
        h = self.mid_attn.forward(&h);
        h = self.mid_res2.forward(&h, &t_emb);

        for stage in &self.up {
            for block in &stage.blocks {
                let skip = skips.pop().expect("skip stack exhausted");
                h = block.forward(&Tensor::cat(&[h, skip], 1), &t_emb);
            }
            if let Some(upsample) = &stage.upsample {
                h = upsample.forward(&h);
            }
        }

        self.out_conv.forward(&self.norm.forward(&h).silu())
    }
}

impl NoisePredictor for UNet {
    fn predict(&self, x: &Tensor, t: &Tensor, _train: bool) -> Tensor {
        self.forward(x, t)
    }
}
