//! The vtmux daemon.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use vtmux::runtime::{Runtime, RuntimeConfig};

/// User-space virtual terminal multiplexer.
#[derive(Debug, Parser)]
#[command(name = "vtmuxd", version, about)]
struct Args {
    /// Never claim the real VT and keep running without seats.
    #[arg(long)]
    listen: bool,

    /// Do not switch to the claimed VT on startup.
    #[arg(long)]
    no_switchvt: bool,

    /// Keyboard layout (empty uses the XKB environment defaults).
    #[arg(long, default_value = "")]
    xkb_layout: String,

    /// Keyboard variant.
    #[arg(long, default_value = "")]
    xkb_variant: String,

    /// Keyboard options.
    #[arg(long, default_value = "")]
    xkb_options: String,

    /// Legacy per-VT character nodes to publish per seat.
    #[arg(long, default_value_t = 0)]
    legacy_vts: u32,

    /// Do not publish character devices.
    #[arg(long)]
    no_cdev: bool,
}

fn main() -> std::process::ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = RuntimeConfig {
        listen: args.listen,
        switch_vt: !args.no_switchvt,
        xkb_layout: args.xkb_layout,
        xkb_variant: args.xkb_variant,
        xkb_options: args.xkb_options,
        legacy_vts: args.legacy_vts,
        cdev: !args.no_cdev,
    };

    let mut runtime = match Runtime::new(config) {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("vtmuxd: cannot start: {err}");
            return std::process::ExitCode::FAILURE;
        }
    };
    if let Err(err) = runtime.run() {
        eprintln!("vtmuxd: {err}");
        return std::process::ExitCode::FAILURE;
    }
    std::process::ExitCode::SUCCESS
}
