use anyhow::{bail, Context, Result};

use kernel_builder::{pipeline, preflight, BuildConfig};

fn usage() -> &'static str {
    "Usage:\n  kernel-builder          run the full build, package, and notify pipeline\n  kernel-builder check    verify the host has the required tools"
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [] => {
            let cwd = std::env::current_dir().context("resolving current directory")?;
            let cfg = BuildConfig::load(cwd)?;
            pipeline::run(&cfg)
        }
        [cmd] if cmd == "check" => {
            preflight::check_required_tools(preflight::REQUIRED_TOOLS)?;
            println!("All required host tools found.");
            Ok(())
        }
        _ => bail!(usage()),
    }
}
