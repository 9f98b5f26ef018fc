//! nbrender: render a session described by a JSON state file.
//!
//! Spins up an in-process peer group, commits the state file's objects,
//! renders one frame per camera x visualization pair, and writes the
//! images.
//!
//! Usage: nbrender [options] <state.json>
//!   -s W H      override image size for every camera
//!   -n RANKS    peer group size (default 2)
//!   -t THREADS  trace workers per rank (default 4)
//!   -o BASE     output image basename (default "nebula")
//!   -F          write float FITS channels instead of PNG

use anyhow::{Context, bail};
use nebula::engine::Engine;
use nebula::rendering::RenderingMeta;
use nebula::state::StateFile;

struct Options {
    state_path: String,
    size: Option<(usize, usize)>,
    ranks: usize,
    threads: usize,
    basename: String,
    as_float: bool,
}

fn parse_args() -> anyhow::Result<Options> {
    let mut opts = Options {
        state_path: String::new(),
        size: None,
        ranks: 2,
        threads: 4,
        basename: "nebula".to_string(),
        as_float: false,
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-s" => {
                let w = args.next().context("-s needs W H")?.parse()?;
                let h = args.next().context("-s needs W H")?.parse()?;
                opts.size = Some((w, h));
            }
            "-n" => opts.ranks = args.next().context("-n needs a count")?.parse()?,
            "-t" => opts.threads = args.next().context("-t needs a count")?.parse()?,
            "-o" => opts.basename = args.next().context("-o needs a name")?,
            "-F" => opts.as_float = true,
            _ if arg.starts_with('-') => bail!("unknown option {arg}"),
            _ => opts.state_path = arg,
        }
    }

    if opts.state_path.is_empty() {
        bail!("usage: nbrender [options] <state.json>");
    }
    Ok(opts)
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let opts = parse_args()?;

    let mut state = StateFile::load(&opts.state_path)
        .with_context(|| format!("loading {}", opts.state_path))?;
    if let Some((w, h)) = opts.size {
        for cam in &mut state.cameras {
            cam.width = w;
            cam.height = h;
        }
    }

    let engines = Engine::create_group(opts.ranks, opts.threads);
    let driver = &engines[0];

    let committed = state.apply(driver)?;
    log::info!(
        "committed {} cameras, {} visualizations over {} ranks",
        committed.camera_keys.len(),
        committed.visualization_keys.len(),
        opts.ranks
    );

    // One rendering per camera x visualization, owners round-robin
    let mut rendering_keys = Vec::new();
    let mut owner = 0;
    for (ci, camera_key) in committed.camera_keys.iter().enumerate() {
        let camera = &state.cameras[ci];
        for vis_key in &committed.visualization_keys {
            let key = driver.commit_rendering(RenderingMeta {
                owner,
                width: camera.width,
                height: camera.height,
                camera_key: *camera_key,
                visualization_key: *vis_key,
                datasets_key: committed.datasets_key,
            })?;
            rendering_keys.push(key);
            owner = (owner + 1) % opts.ranks;
        }
    }
    let set_key = driver.commit_rendering_set(rendering_keys)?;

    let frame = driver.render(set_key)?;
    driver.wait_for_done(set_key)?;
    log::info!("frame {frame} done");

    driver.save_images(set_key, &opts.basename, opts.as_float)?;
    driver.dump_statistics(&opts.basename)?;

    for engine in engines {
        engine.shutdown();
    }
    Ok(())
}
