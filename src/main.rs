use burn::{
    backend::{NdArray, ndarray::NdArrayDevice},
    config::Config,
    tensor::Tensor,
};
use rust_yolo::{
    config::{Commands, DarknetConfig, Hyperparameters, SubCommandInspect, YoloCmd},
    models::{Darknet, Detections, Mode},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_SIZE: usize = 416;

type B = NdArray<f32>;

fn inspect(cmd: SubCommandInspect, device: &NdArrayDevice) -> Result<(), Box<dyn std::error::Error>> {
    let hyp = match &cmd.hyp {
        Some(path) => Hyperparameters::load(path)
            .map_err(|e| format!("can not load hyperparameters from {path}: {e}"))?,
        None => Hyperparameters::new(),
    };

    let mut config = DarknetConfig::new(hyp);
    if let Some(arc) = cmd.arc {
        config = config.with_arc(arc);
    }

    let mut model = Darknet::<B>::from_cfg_file(&cmd.c, &config, device)?;

    if let Some(weights) = cmd.w {
        info!("loading weights from {weights}");
        model = model.load_weights(weights, device)?;
    }
    if cmd.fuse {
        model = model.fuse();
    }

    println!("{}", model.summary());

    let [h, w] = match cmd.s {
        Some(size) => [size, size],
        None => model.input_size().unwrap_or([DEFAULT_SIZE, DEFAULT_SIZE]),
    };

    let x = Tensor::<B, 4>::zeros([1, model.input_channels(), h, w], device);

    match model.forward(x, Mode::Infer)? {
        Detections::Infer { decoded, raw } => {
            for (layer, raw) in model.yolo_layers().iter().zip(raw.iter()) {
                println!("yolo layer {layer:>3}: raw {:?}", raw.dims());
            }
            println!("decoded boxes for a {h}x{w} input: {:?}", decoded.dims());
        }
        Detections::Train(raw) => {
            println!("{} raw head outputs", raw.len());
        }
    }

    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let device = NdArrayDevice::default();
    let cli_cmd: YoloCmd = argh::from_env();

    match cli_cmd.commands {
        Commands::Inspect(sub_command_inspect) => inspect(sub_command_inspect, &device)?,
    };

    Ok(())
}
