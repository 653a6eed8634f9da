//! pbrbatch CLI - inspect render layouts and probe files.

use std::env;
use std::path::Path;
use std::process;

use pbrbatch::bake::{ProbeFileReader, ProbeGrid, PROBE_BYTES};
use pbrbatch::config::RenderConfig;
use pbrbatch::gpu::DeviceProperties;
use pbrbatch::layout::{FramebufferConfig, ParamBufferConfig};
use pbrbatch::render::{PROBE_HEIGHT, PROBE_WIDTH};
use pbrbatch::util::Aabb;
use pbrbatch::{Error, Result};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Env var enabling the Chrome trace layer.
const TRACE_ENV: &str = "PBRBATCH_TRACE";

fn main() {
    let args: Vec<String> = env::args().collect();

    // Parse global flags
    let mut level = "info";
    let mut filtered_args: Vec<&str> = Vec::new();
    for arg in &args[1..] {
        match arg.as_str() {
            "-v" | "--verbose" => level = "debug",
            "-vv" | "--trace" => level = "trace",
            "-q" | "--quiet" => level = "error",
            _ => filtered_args.push(arg),
        }
    }
    let _guard = init_tracing(level);

    if filtered_args.is_empty() {
        print_help();
        return;
    }

    let result = match filtered_args[0] {
        "layout" | "l" => match filtered_args.get(1) {
            Some(path) => cmd_layout(path),
            None => usage("pbrbatch layout <config.json>"),
        },
        "probes" | "p" => match (
            filtered_args.get(1).copied(),
            filtered_args.get(2..).unwrap_or(&[]),
        ) {
            (Some("info"), [file, ..]) => cmd_probes_info(file),
            (Some("export"), [file, index, out, ..]) => cmd_probes_export(file, index, out),
            _ => usage(
                "pbrbatch probes info <probes.bin> | probes export <probes.bin> <index> <out.exr>",
            ),
        },
        "config" | "c" => match filtered_args.get(1) {
            Some(path) => cmd_config(path),
            None => usage("pbrbatch config <out.json>"),
        },
        "help" | "h" | "-h" | "--help" => {
            print_help();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other);
            eprintln!();
            print_help();
            process::exit(1);
        }
    };

    if let Err(e) = result {
        if e.is_fatal() {
            tracing::error!("fatal: {e}");
        }
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn init_tracing(level: &str) -> Option<FlushGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let fmt = tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr);
    let registry = tracing_subscriber::registry().with(filter).with(fmt);

    #[cfg(feature = "chrome-trace")]
    {
        if env::var(TRACE_ENV).ok().as_deref() == Some("1") {
            let (chrome_layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
                .file("trace.json")
                .build();
            if tracing::subscriber::set_global_default(registry.with(chrome_layer)).is_err() {
                return None;
            }
            return Some(guard);
        }
    }

    let _ = tracing::subscriber::set_global_default(registry);
    None
}

#[cfg(feature = "chrome-trace")]
type FlushGuard = tracing_chrome::FlushGuard;
#[cfg(not(feature = "chrome-trace"))]
type FlushGuard = ();

fn usage(text: &str) -> Result<()> {
    eprintln!("Error: missing arguments");
    eprintln!("Usage: {}", text);
    process::exit(1);
}

fn print_help() {
    println!("pbrbatch - batched path tracer toolkit (built {})", pbrbatch::BUILD_DATE);
    println!();
    println!("USAGE:");
    println!("    pbrbatch [OPTIONS] <COMMAND> [ARGS]");
    println!();
    println!("COMMANDS:");
    println!(
        "    l, layout  <config.json>              Show framebuffer tiling and parameter layout"
    );
    println!("    p, probes  info <probes.bin>          Show probe grid and records");
    println!("    p, probes  export <probes.bin> <i> <out.exr>");
    println!("                                          Write probe i as an RGBA32F image");
    println!("    c, config  <out.json>                 Write the default render config");
    println!("    h, help                               Show this help");
    println!();
    println!("OPTIONS:");
    println!("    -v, --verbose   Debug output");
    println!("    -vv, --trace    Trace output");
    println!("    -q, --quiet     Errors only");
    println!();
    println!("ENVIRONMENT:");
    println!("    RUST_LOG            Overrides the log filter");
    println!("    {}=1      Write a Chrome trace to trace.json", TRACE_ENV);
}

fn cmd_layout(path: &str) -> Result<()> {
    let cfg = RenderConfig::load(path)?;
    let props = DeviceProperties::default();
    let fb = FramebufferConfig::from_config(&cfg);
    let params = ParamBufferConfig::from_config(&cfg, props.storage_alignment);

    println!("Config: {}", path);
    println!(
        "  image:       {}x{} @ {} spp, batch {}",
        cfg.img_width, cfg.img_height, cfg.spp, cfg.batch_size
    );
    println!("  mode:        {:?}", cfg.mode);
    println!();
    println!("Framebuffer:");
    println!(
        "  batch grid:  {}x{} images, minibatch {} ({}x{})",
        fb.batch_images_wide,
        fb.batch_images_tall,
        fb.minibatch_size,
        fb.minibatch_images_wide,
        fb.minibatch_images_tall
    );
    println!("  frame:       {}x{} pixels", fb.frame_width, fb.frame_height);
    println!("  tiles:       {}x{} per image", fb.num_tiles_wide, fb.num_tiles_tall);
    println!("  output:      {} bytes", fb.output_bytes);
    println!("  hdr:         {} bytes", fb.hdr_bytes);
    println!("  normal:      {} bytes", fb.normal_bytes);
    println!("  albedo:      {} bytes", fb.albedo_bytes);
    println!("  reservoirs:  {} bytes", fb.reservoir_bytes);
    println!("  illuminance: {} bytes", fb.illuminance_bytes);
    println!("  adaptive:    {} bytes", fb.adaptive_bytes);
    println!();
    println!("Parameters (alignment {}):", props.storage_alignment);
    let names = ["transforms", "materials", "lights", "envs"];
    for (name, (offset, size)) in names.iter().zip(params.regions()) {
        println!("  {:<12} offset {:>10}  size {:>10}", name, offset, size);
    }
    println!("  total:       {} bytes", params.total_param_bytes);
    Ok(())
}

fn cmd_probes_info(path: &str) -> Result<()> {
    let reader = ProbeFileReader::open(path)?;
    println!("Probe file: {}", path);
    let Some(dims) = reader.dims() else {
        println!("  empty (no header)");
        return Ok(());
    };
    let expected = dims.iter().map(|&d| d.max(0) as u64).product::<u64>();
    println!("  grid:     {}x{}x{} ({} probes)", dims[0], dims[1], dims[2], expected);
    println!("  records:  {}", reader.len());
    println!("  valid:    {} bytes", reader.valid_len());
    for (i, record) in reader.records().enumerate() {
        let note = if record.len() as u64 == PROBE_BYTES { "" } else { "  (unexpected size)" };
        println!("  [{:>3}] {} bytes{}", i, record.len(), note);
    }
    Ok(())
}

fn cmd_probes_export(path: &str, index: &str, out: &str) -> Result<()> {
    let index: usize = index
        .parse()
        .map_err(|_| Error::other(format!("invalid probe index '{}'", index)))?;
    let reader = ProbeFileReader::open(path)?;
    let texels = reader
        .record(index)
        .ok_or_else(|| {
            Error::other(format!("probe {} not in file ({} records)", index, reader.len()))
        })?;
    if texels.len() as u64 != PROBE_BYTES {
        return Err(Error::InvalidProbeRecord {
            index,
            size: texels.len() as u64,
            expected: PROBE_BYTES,
        });
    }

    let pixels: Vec<f32> = bytemuck::pod_collect_to_vec(texels);
    let img = image::Rgba32FImage::from_raw(PROBE_WIDTH, PROBE_HEIGHT, pixels)
        .ok_or_else(|| Error::other("probe image size mismatch"))?;
    img.save(Path::new(out))?;

    if let Some(dims) = reader.dims() {
        let grid = ProbeGrid::new(dims.map(|d| d.max(1) as u32), Aabb::EMPTY);
        let [x, y, z] = grid.coords(index as u32);
        tracing::info!("exported probe {} (grid {},{},{}) to {}", index, x, y, z, out);
    }
    Ok(())
}

fn cmd_config(path: &str) -> Result<()> {
    RenderConfig::default().save(path)?;
    tracing::info!("wrote default config to {}", path);
    Ok(())
}
